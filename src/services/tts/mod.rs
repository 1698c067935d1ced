pub mod job;
pub mod synthesizer;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::error::{PipelineError, Result};

pub use job::{AudioSynthesisJob, JobStatus};
pub use synthesizer::{AudioArtifact, AudioSynthesizer};

/// What the provider currently reports for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Running,
    Succeeded { result_location: String },
    Failed { message: String },
}

/// Long-running speech synthesis: submit returns at once, completion is observed by polling.
#[async_trait]
pub trait SpeechClient: Send + Sync {
    async fn submit(&self, markup: &SpeechMarkup, intermediate_location: &str) -> Result<String>;
    async fn poll_status(&self, job_handle: &str) -> Result<RemoteStatus>;
    async fn fetch(&self, result_location: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    /// Base URL of the synthesis service.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice_a")]
    pub voice_a: String,
    #[serde(default = "default_voice_b")]
    pub voice_b: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_format")]
    pub audio_format: String,
    #[serde(default = "default_intermediate_prefix")]
    pub intermediate_prefix: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_min_script_chars")]
    pub min_script_chars: usize,
}

fn default_model() -> String {
    "multispeaker-podcast".to_string()
}
fn default_voice_a() -> String {
    "Charon".to_string()
}
fn default_voice_b() -> String {
    "Kore".to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_format() -> String {
    "mp3".to_string()
}
fn default_intermediate_prefix() -> String {
    "newscast-jobs".to_string()
}
fn default_poll_interval() -> u64 {
    15
}
fn default_max_wait() -> u64 {
    1800
}
fn default_min_script_chars() -> usize {
    100
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            model: default_model(),
            voice_a: default_voice_a(),
            voice_b: default_voice_b(),
            language: default_language(),
            audio_format: default_format(),
            intermediate_prefix: default_intermediate_prefix(),
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            min_script_chars: default_min_script_chars(),
        }
    }
}

impl AudioConfig {
    pub fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api_key.is_none() {
            self.api_key = lookup("TTS_API_KEY");
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoint).map_err(|e| {
            PipelineError::configuration(format!(
                "audio.endpoint '{}' is not a URL: {}",
                self.endpoint, e
            ))
        })?;
        if self.poll_interval_secs == 0 || self.max_wait_secs == 0 {
            return Err(PipelineError::configuration(
                "audio.poll_interval_secs and audio.max_wait_secs must be positive",
            ));
        }
        if self.voice_a.trim().is_empty() || self.voice_b.trim().is_empty() {
            return Err(PipelineError::configuration("audio voices must be set"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub voice: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechMarkup {
    pub turns: Vec<SpeakerTurn>,
}

impl SpeechMarkup {
    pub fn to_ssml(&self) -> String {
        let mut out = String::from("<speak>");
        for turn in &self.turns {
            out.push_str(&format!(
                "<voice name=\"{}\">{}</voice>",
                quick_xml::escape::escape(turn.voice.as_str()),
                quick_xml::escape::escape(turn.text.as_str())
            ));
        }
        out.push_str("</speak>");
        out
    }

    pub fn text_len(&self) -> usize {
        self.turns.iter().map(|t| t.text.chars().count()).sum()
    }
}

/// Converts speaker-prefixed dialogue into voice turns.
///
/// `Host: text` lines go to that host's voice; other prose goes to the first host.
/// Section headers, separators and blank lines are dropped. Bold markers around
/// names (`**Alex:**`) are tolerated. Consecutive lines by the same speaker merge.
pub fn build_markup(
    script: &str,
    hosts: (&str, &str),
    voices: (&str, &str),
) -> Result<SpeechMarkup> {
    let mut turns: Vec<SpeakerTurn> = Vec::new();
    for raw in script.lines() {
        let line = raw.replace("**", "");
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("---") {
            continue;
        }

        let (speaker, voice, text) = if let Some(rest) = strip_speaker(line, hosts.0) {
            (hosts.0, voices.0, rest)
        } else if let Some(rest) = strip_speaker(line, hosts.1) {
            (hosts.1, voices.1, rest)
        } else {
            (hosts.0, voices.0, line)
        };
        if text.is_empty() {
            continue;
        }

        match turns.last_mut() {
            Some(last) if last.speaker == speaker => {
                last.text.push(' ');
                last.text.push_str(text);
            }
            _ => turns.push(SpeakerTurn {
                speaker: speaker.to_string(),
                voice: voice.to_string(),
                text: text.to_string(),
            }),
        }
    }

    if turns.is_empty() {
        return Err(PipelineError::validation("script contains no dialogue to synthesize"));
    }
    Ok(SpeechMarkup { turns })
}

fn strip_speaker<'a>(line: &'a str, host: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(host)?;
    let rest = rest.trim_start().strip_prefix(':')?;
    Some(rest.trim())
}

pub fn create_speech_client(config: &AudioConfig, client: reqwest::Client) -> Arc<dyn SpeechClient> {
    Arc::new(HttpSpeechClient::new(config, client))
}

/// JSON-over-HTTP synthesis service.
///
/// `POST {endpoint}/v1/synthesis` submits and answers `{"name": "<handle>"}`;
/// `GET {endpoint}/v1/synthesis/<handle>` answers `{"state": ..., "result_location": ..., "error": ...}`.
pub struct HttpSpeechClient {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    language: String,
    audio_format: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    model: &'a str,
    language: &'a str,
    audio_format: &'a str,
    output_location: &'a str,
    ssml: String,
    turns: &'a [SpeakerTurn],
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(alias = "job_id", alias = "id")]
    name: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    state: String,
    #[serde(default)]
    result_location: Option<String>,
    #[serde(default)]
    error: Option<StatusError>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusError {
    Message { message: String },
    Text(String),
}

impl StatusError {
    fn into_message(self) -> String {
        match self {
            StatusError::Message { message } => message,
            StatusError::Text(text) => text,
        }
    }
}

const SERVICE: &str = "speech synthesis";

impl HttpSpeechClient {
    pub fn new(config: &AudioConfig, client: reqwest::Client) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
            audio_format: config.audio_format.clone(),
            client,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest(SERVICE, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(SERVICE, status, &body));
        }
        Ok(resp)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::from_reqwest(SERVICE, e))?;
        serde_json::from_str(&body).map_err(|e| {
            PipelineError::validation(format!("unexpected {} response ({}): {}", SERVICE, e, body))
        })
    }
}

pub fn parse_remote_state(
    state: &str,
    result_location: Option<String>,
    error: Option<String>,
) -> Result<RemoteStatus> {
    match state.to_ascii_uppercase().as_str() {
        "PENDING" | "QUEUED" | "SUBMITTED" => Ok(RemoteStatus::Pending),
        "RUNNING" | "PROCESSING" | "IN_PROGRESS" => Ok(RemoteStatus::Running),
        "SUCCEEDED" | "DONE" | "COMPLETED" => match result_location {
            Some(location) if !location.is_empty() => Ok(RemoteStatus::Succeeded {
                result_location: location,
            }),
            _ => Err(PipelineError::validation(
                "job reported success without a result location",
            )),
        },
        "FAILED" | "ERROR" | "CANCELLED" => Ok(RemoteStatus::Failed {
            message: error.unwrap_or_else(|| format!("job ended in state {}", state)),
        }),
        other => Err(PipelineError::validation(format!(
            "unknown job state '{}'",
            other
        ))),
    }
}

#[async_trait]
impl SpeechClient for HttpSpeechClient {
    async fn submit(&self, markup: &SpeechMarkup, intermediate_location: &str) -> Result<String> {
        let url = format!("{}/v1/synthesis", self.endpoint);
        let body = SubmitRequest {
            model: &self.model,
            language: &self.language,
            audio_format: &self.audio_format,
            output_location: intermediate_location,
            ssml: markup.to_ssml(),
            turns: &markup.turns,
        };
        let resp = self.send(self.client.post(&url).json(&body)).await?;
        let submitted: SubmitResponse = Self::read_json(resp).await?;
        debug!("Submitted synthesis job {}", submitted.name);
        Ok(submitted.name)
    }

    async fn poll_status(&self, job_handle: &str) -> Result<RemoteStatus> {
        let url = format!(
            "{}/v1/synthesis/{}",
            self.endpoint,
            job_handle.trim_start_matches('/')
        );
        let resp = self.send(self.client.get(&url)).await?;
        let status: StatusResponse = Self::read_json(resp).await?;
        parse_remote_state(
            &status.state,
            status.result_location,
            status.error.map(StatusError::into_message),
        )
    }

    async fn fetch(&self, result_location: &str) -> Result<Vec<u8>> {
        let url = if result_location.starts_with("http://") || result_location.starts_with("https://") {
            result_location.to_string()
        } else {
            format!(
                "{}/v1/results/{}",
                self.endpoint,
                result_location.trim_start_matches('/')
            )
        };
        let resp = self.send(self.client.get(&url)).await?;

        let mut stream = resp.bytes_stream();
        let mut audio = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::from_reqwest(SERVICE, e))?;
            audio.extend_from_slice(&chunk);
        }
        if audio.is_empty() {
            return Err(PipelineError::validation("synthesized audio is empty"));
        }
        Ok(audio)
    }
}
