use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::error::{PipelineError, Result};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::services::tts::job::{AudioSynthesisJob, JobStatus};
use crate::services::tts::{build_markup, AudioConfig, RemoteStatus, SpeechClient};
use crate::utils::audio::probe_duration_seconds;

#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub duration_seconds: Option<u64>,
    pub job: AudioSynthesisJob,
}

/// Drives one synthesis job: submit, poll on a fixed interval within a wait budget, fetch.
pub struct AudioSynthesizer {
    client: Arc<dyn SpeechClient>,
    config: AudioConfig,
    hosts: (String, String),
    retry: RetryPolicy,
    poll_interval: Duration,
    max_wait: Duration,
}

impl AudioSynthesizer {
    pub fn new(
        client: Arc<dyn SpeechClient>,
        config: AudioConfig,
        hosts: (String, String),
        retry: RetryPolicy,
    ) -> Self {
        let poll_interval = Duration::from_secs(config.poll_interval_secs);
        let max_wait = Duration::from_secs(config.max_wait_secs);
        Self {
            client,
            config,
            hosts,
            retry,
            poll_interval,
            max_wait,
        }
    }

    /// Overrides the configured timing; mostly for tests.
    pub fn with_timing(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    pub async fn synthesize(
        &self,
        script_text: &str,
        output: &Path,
        job_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact> {
        if script_text.trim().chars().count() < self.config.min_script_chars {
            return Err(PipelineError::validation(format!(
                "script is shorter than {} characters",
                self.config.min_script_chars
            )));
        }
        let markup = build_markup(
            script_text,
            (&self.hosts.0, &self.hosts.1),
            (&self.config.voice_a, &self.config.voice_b),
        )?;

        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "episode".to_string());
        let intermediate = format!(
            "{}/{}.{}",
            self.config.intermediate_prefix.trim_end_matches('/'),
            stem,
            self.config.audio_format
        );

        info!(
            "Submitting {} speaker turn(s), {} chars, for synthesis",
            markup.turns.len(),
            markup.text_len()
        );
        let handle = with_retry(&self.retry, "speech submission", || {
            self.client.submit(&markup, &intermediate)
        })
        .await?;
        info!("Synthesis job submitted: {}", handle);

        let job = AudioSynthesisJob::submitted(handle, intermediate);
        job.save(job_path)?;
        self.wait_and_fetch(job, output, job_path, cancel).await
    }

    /// Picks up a job saved by an earlier run. Never resubmits.
    pub async fn resume(
        &self,
        job_path: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact> {
        let saved = AudioSynthesisJob::load(job_path)?;
        info!("Resuming synthesis job {} ({})", saved.job_handle, saved.status);
        match saved.status {
            JobStatus::Failed => Err(PipelineError::TerminalExternal {
                service: "speech synthesis".to_string(),
                message: saved
                    .failure
                    .clone()
                    .unwrap_or_else(|| format!("job {} failed", saved.job_handle)),
            }),
            JobStatus::Succeeded => match saved.result_location.clone() {
                Some(location) => self.fetch_into(saved, &location, output, job_path).await,
                None => self.wait_and_fetch(saved.reopen(), output, job_path, cancel).await,
            },
            JobStatus::TimedOut => self.wait_and_fetch(saved.reopen(), output, job_path, cancel).await,
            JobStatus::Submitted | JobStatus::Polling => {
                self.wait_and_fetch(saved, output, job_path, cancel).await
            }
        }
    }

    async fn wait_and_fetch(
        &self,
        mut job: AudioSynthesisJob,
        output: &Path,
        job_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact> {
        let started = Instant::now();
        let deadline = started + self.max_wait;

        loop {
            job.transition(JobStatus::Polling)?;
            let handle = job.job_handle.clone();
            let poll = with_retry(&self.retry, "speech status poll", || {
                self.client.poll_status(&handle)
            });
            // Retries back off inside `poll`; neither the budget nor a cancel waits for them.
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(stop_waiting(&job, job_path)),
                _ = sleep_until(deadline) => return Err(time_out(&mut job, job_path, started)),
                status = poll => status,
            };
            let status = match status {
                Ok(s) => s,
                Err(e) => {
                    job.save(job_path)?;
                    return Err(e);
                }
            };

            match status {
                RemoteStatus::Pending | RemoteStatus::Running => {}
                RemoteStatus::Succeeded { result_location } => {
                    job.result_location = Some(result_location.clone());
                    job.transition(JobStatus::Succeeded)?;
                    job.save(job_path)?;
                    info!(
                        "Synthesis job {} finished after {} poll(s)",
                        job.job_handle, job.polls
                    );
                    return self.fetch_into(job, &result_location, output, job_path).await;
                }
                RemoteStatus::Failed { message } => {
                    job.failure = Some(message.clone());
                    job.transition(JobStatus::Failed)?;
                    job.save(job_path)?;
                    return Err(PipelineError::TerminalExternal {
                        service: "speech synthesis".to_string(),
                        message,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(time_out(&mut job, job_path, started));
            }

            let pause = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(stop_waiting(&job, job_path)),
                _ = sleep(pause) => {}
            }
        }
    }

    async fn fetch_into(
        &self,
        job: AudioSynthesisJob,
        result_location: &str,
        output: &Path,
        job_path: &Path,
    ) -> Result<AudioArtifact> {
        let audio = with_retry(&self.retry, "audio download", || {
            self.client.fetch(result_location)
        })
        .await?;

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(output, &audio).await?;
        job.save(job_path)?;

        let duration_seconds = probe_duration_seconds(&audio);
        if duration_seconds.is_none() {
            warn!("Could not determine duration of {:?}", output);
        }
        info!("Wrote {} bytes of audio to {:?}", audio.len(), output);
        Ok(AudioArtifact {
            path: output.to_path_buf(),
            file_size_bytes: audio.len() as u64,
            duration_seconds,
            job,
        })
    }
}

/// Leaves the job at `polling` so a later run can pick it up.
fn stop_waiting(job: &AudioSynthesisJob, job_path: &Path) -> PipelineError {
    if let Err(e) = job.save(job_path) {
        return e;
    }
    warn!(
        "Stopped waiting for job {}; it keeps running server-side. Resume from {:?}",
        job.job_handle, job_path
    );
    PipelineError::Cancelled {
        what: format!("waiting for speech synthesis job {}", job.job_handle),
    }
}

fn time_out(job: &mut AudioSynthesisJob, job_path: &Path, started: Instant) -> PipelineError {
    if let Err(e) = job.transition(JobStatus::TimedOut).and_then(|_| job.save(job_path)) {
        return e;
    }
    let waited = started.elapsed();
    warn!(
        "Synthesis job {} still running after {:?}; it may finish server-side",
        job.job_handle, waited
    );
    PipelineError::Timeout {
        what: format!("speech synthesis job {}", job.job_handle),
        waited_secs: waited.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::services::tts::SpeechMarkup;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a fixed sequence of statuses; the last one repeats.
    struct ScriptedSpeech {
        statuses: Mutex<Vec<Result<RemoteStatus>>>,
        submitted: Mutex<Vec<String>>,
        polls: Mutex<u32>,
    }

    impl ScriptedSpeech {
        fn new(statuses: Vec<Result<RemoteStatus>>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                submitted: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            })
        }
    }

    fn clone_status(s: &Result<RemoteStatus>) -> Result<RemoteStatus> {
        match s {
            Ok(status) => Ok(status.clone()),
            Err(e) => Err(PipelineError::Transient {
                service: "tts".to_string(),
                message: e.to_string(),
            }),
        }
    }

    #[async_trait]
    impl SpeechClient for ScriptedSpeech {
        async fn submit(&self, markup: &SpeechMarkup, intermediate: &str) -> Result<String> {
            self.submitted.lock().unwrap().push(intermediate.to_string());
            assert!(!markup.turns.is_empty());
            Ok("op-42".to_string())
        }

        async fn poll_status(&self, _job_handle: &str) -> Result<RemoteStatus> {
            *self.polls.lock().unwrap() += 1;
            let mut queue = self.statuses.lock().unwrap();
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                clone_status(&queue[0])
            }
        }

        async fn fetch(&self, result_location: &str) -> Result<Vec<u8>> {
            assert_eq!(result_location, "results/op-42.mp3");
            let mut mp3 = vec![0xFF, 0xFB, 0x90, 0x00];
            mp3.resize(32_000, 0);
            Ok(mp3)
        }
    }

    const SCRIPT: &str = "## SHOW OPENING\nAlex: Welcome to the show, today we have three stories.\nSam: Let's get right into it, there is a lot to cover this week.";

    fn synthesizer(client: Arc<ScriptedSpeech>) -> AudioSynthesizer {
        AudioSynthesizer::new(
            client,
            AudioConfig {
                endpoint: "http://localhost".to_string(),
                ..Default::default()
            },
            ("Alex".to_string(), "Sam".to_string()),
            RetryPolicy::immediate(2),
        )
        .with_timing(Duration::from_millis(5), Duration::from_millis(60))
    }

    fn done() -> RemoteStatus {
        RemoteStatus::Succeeded {
            result_location: "results/op-42.mp3".to_string(),
        }
    }

    #[tokio::test]
    async fn test_polls_until_success_and_writes_audio() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![
            Ok(RemoteStatus::Pending),
            Ok(RemoteStatus::Running),
            Ok(done()),
        ]);
        let output = dir.path().join("episode_2026-03-02.mp3");
        let job_path = dir.path().join("job.json");

        let artifact = synthesizer(client.clone())
            .synthesize(SCRIPT, &output, &job_path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.job.status, JobStatus::Succeeded);
        assert_eq!(artifact.job.polls, 3);
        assert_eq!(artifact.file_size_bytes, 32_000);
        assert_eq!(artifact.duration_seconds, Some(2));
        assert!(output.exists());
        assert_eq!(
            client.submitted.lock().unwrap()[0],
            "newscast-jobs/episode_2026-03-02.mp3"
        );
        let saved = AudioSynthesisJob::load(&job_path).unwrap();
        assert_eq!(saved.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![Ok(RemoteStatus::Running)]);
        let output = dir.path().join("episode.mp3");
        let job_path = dir.path().join("job.json");

        let err = synthesizer(client.clone())
            .synthesize(SCRIPT, &output, &job_path, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!output.exists());
        assert!(*client.polls.lock().unwrap() >= 2);
        let saved = AudioSynthesisJob::load(&job_path).unwrap();
        assert_eq!(saved.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_remote_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![
            Ok(RemoteStatus::Running),
            Ok(RemoteStatus::Failed {
                message: "voice Kore unavailable".to_string(),
            }),
        ]);
        let job_path = dir.path().join("job.json");
        let err = synthesizer(client)
            .synthesize(
                SCRIPT,
                &dir.path().join("e.mp3"),
                &job_path,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalExternal);
        assert!(err.to_string().contains("voice Kore unavailable"));
        assert_eq!(
            AudioSynthesisJob::load(&job_path).unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_without_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![Ok(RemoteStatus::Running)]);
        let job_path = dir.path().join("job.json");
        let token = CancellationToken::new();
        token.cancel();

        let err = synthesizer(client)
            .with_timing(Duration::from_secs(30), Duration::from_secs(600))
            .synthesize(SCRIPT, &dir.path().join("e.mp3"), &job_path, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(
            AudioSynthesisJob::load(&job_path).unwrap().status,
            JobStatus::Polling
        );
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![
            Err(PipelineError::Transient {
                service: "tts".to_string(),
                message: "503".to_string(),
            }),
            Ok(done()),
        ]);
        let artifact = synthesizer(client)
            .synthesize(
                SCRIPT,
                &dir.path().join("e.mp3"),
                &dir.path().join("job.json"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(artifact.job.polls, 1);
    }

    fn flapping_provider() -> (Arc<ScriptedSpeech>, AudioSynthesizer) {
        let client = ScriptedSpeech::new(vec![Err(PipelineError::Transient {
            service: "tts".to_string(),
            message: "503".to_string(),
        })]);
        let slow_backoff = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 20_000,
            max_delay_ms: 30_000,
        };
        let synthesizer = AudioSynthesizer::new(
            client.clone(),
            AudioConfig {
                endpoint: "http://localhost".to_string(),
                ..Default::default()
            },
            ("Alex".to_string(), "Sam".to_string()),
            slow_backoff,
        );
        (client, synthesizer)
    }

    #[tokio::test]
    async fn test_cancel_interrupts_poll_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = dir.path().join("job.json");
        let (client, synthesizer) = flapping_provider();
        let synthesizer =
            synthesizer.with_timing(Duration::from_secs(30), Duration::from_secs(600));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            synthesizer.synthesize(SCRIPT, &dir.path().join("e.mp3"), &job_path, &token),
        )
        .await
        .expect("cancel should not wait for the retry backoff")
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(*client.polls.lock().unwrap(), 1);
        assert_eq!(
            AudioSynthesisJob::load(&job_path).unwrap().status,
            JobStatus::Polling
        );
    }

    #[tokio::test]
    async fn test_wait_budget_cuts_poll_backoff_short() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = dir.path().join("job.json");
        let (_client, synthesizer) = flapping_provider();
        let synthesizer =
            synthesizer.with_timing(Duration::from_millis(5), Duration::from_millis(100));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            synthesizer.synthesize(
                SCRIPT,
                &dir.path().join("e.mp3"),
                &job_path,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("the wait budget should not be extended by retries")
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            AudioSynthesisJob::load(&job_path).unwrap().status,
            JobStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_resume_after_timeout_repolls_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = dir.path().join("job.json");
        let mut job = AudioSynthesisJob::submitted("op-42", "newscast-jobs/e.mp3");
        job.transition(JobStatus::TimedOut).unwrap();
        job.save(&job_path).unwrap();

        let client = ScriptedSpeech::new(vec![Ok(done())]);
        let output = dir.path().join("e.mp3");
        let artifact = synthesizer(client.clone())
            .resume(&job_path, &output, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.job.job_handle, "op-42");
        assert!(client.submitted.lock().unwrap().is_empty());
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_short_script_is_rejected_before_submit() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedSpeech::new(vec![Ok(done())]);
        let err = synthesizer(client.clone())
            .synthesize(
                "Alex: Hi.",
                &dir.path().join("e.mp3"),
                &dir.path().join("job.json"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(client.submitted.lock().unwrap().is_empty());
    }
}
