use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::config::Config;
use crate::core::error::{PipelineError, Result};
use crate::core::io::ObjectStore;
use crate::core::models::{
    slugify, Article, EpisodeRecord, EpisodeScript, ErrorDetail, PipelineResult, Stage,
    StageTiming,
};
use crate::core::retry::with_retry;
use crate::services::collector::ArticleCollector;
use crate::services::feed::{ChannelMetadata, FeedMerger};
use crate::services::llm::LlmClient;
use crate::services::records::{filter_new_articles, RecordStore};
use crate::services::script::ScriptSynthesizer;
use crate::services::tts::{AudioArtifact, AudioSynthesizer, SpeechClient};
use crate::utils::audio::mime_for_format;

pub const FEED_FILE: &str = "feed.xml";

/// Collaborators chosen once at startup. Optional integrations are no-op implementations.
#[derive(Clone)]
pub struct Components {
    pub collector: Arc<dyn ArticleCollector>,
    pub records: Arc<dyn RecordStore>,
    pub storage: Arc<dyn ObjectStore>,
    /// Absent when script generation is disabled.
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Absent when audio generation is disabled.
    pub speech: Option<Arc<dyn SpeechClient>>,
}

/// Local file names for one episode's artifacts.
#[derive(Debug, Clone)]
pub struct EpisodePaths {
    pub date: NaiveDate,
    pub script: PathBuf,
    pub audio: PathBuf,
    pub job: PathBuf,
    pub feed: PathBuf,
}

impl EpisodePaths {
    pub fn new(output_dir: &Path, date: NaiveDate, audio_format: &str) -> Self {
        let day = date.format("%Y-%m-%d");
        Self {
            date,
            script: output_dir.join(format!("episode_{}_script.txt", day)),
            audio: output_dir.join(format!("episode_{}.{}", day, audio_format)),
            job: output_dir.join(format!("episode_{}_job.json", day)),
            feed: output_dir.join(FEED_FILE),
        }
    }
}

/// `<show-slug>/<YYYY-MM-DD>/<file>`
pub fn object_key(show_name: &str, date: NaiveDate, path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}/{}", slugify(show_name), date.format("%Y-%m-%d"), file)
}

pub fn feed_key(show_name: &str) -> String {
    format!("{}/{}", slugify(show_name), FEED_FILE)
}

/// Lists the stories covered, for the feed item description.
pub fn episode_description(show_name: &str, date: NaiveDate, articles: &[Article]) -> String {
    let mut text = format!(
        "{} for {}. In this episode:",
        show_name,
        date.format("%B %-d, %Y")
    );
    for article in articles {
        text.push_str(&format!("\n- {} ({})", article.title, article.url));
    }
    text
}

type StageResult<T> = std::result::Result<T, (Stage, PipelineError)>;

pub struct PipelineOrchestrator {
    config: Config,
    components: Components,
    cancel: CancellationToken,
    publish_date: DateTime<Utc>,
    audio_timing: Option<(Duration, Duration)>,
}

#[derive(Default)]
struct RunState {
    articles: Vec<Article>,
    script: Option<EpisodeScript>,
    audio: Option<AudioArtifact>,
    audio_url: Option<String>,
    feed_xml: Option<String>,
    episode: Option<EpisodeRecord>,
}

impl PipelineOrchestrator {
    pub fn new(config: Config, components: Components) -> Self {
        Self {
            config,
            components,
            cancel: CancellationToken::new(),
            publish_date: Utc::now(),
            audio_timing: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_publish_date(mut self, publish_date: DateTime<Utc>) -> Self {
        self.publish_date = publish_date;
        self
    }

    /// Overrides the configured poll interval and wait budget.
    pub fn with_audio_timing(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.audio_timing = Some((poll_interval, max_wait));
        self
    }

    pub fn paths(&self) -> EpisodePaths {
        EpisodePaths::new(
            &self.config.output_path(),
            self.publish_date.date_naive(),
            &self.config.audio.audio_format,
        )
    }

    /// Runs every enabled stage once. Never fails: the first fatal error ends the run
    /// and is reported in the result next to whatever was already produced.
    pub async fn run(&self) -> PipelineResult {
        let started = Instant::now();
        let mut result = PipelineResult {
            episode_id: Some(EpisodeRecord::episode_id_for(
                &self.config.show.name,
                self.publish_date.date_naive(),
            )),
            ..Default::default()
        };

        match self.run_stages(&mut result).await {
            Ok(()) => {
                result.success = true;
                info!(
                    "Episode {} done: {}",
                    result.episode_id.as_deref().unwrap_or_default(),
                    result
                        .completed_stages
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
            }
            Err((stage, e)) => {
                error!("Stage {} failed: {}", stage.as_str(), e);
                result.error = Some(ErrorDetail::new(stage, &e));
            }
        }
        result.duration_millis = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_stages(&self, result: &mut PipelineResult) -> StageResult<()> {
        let paths = self.paths();
        let mut state = RunState::default();

        let collected = timed(result, Stage::Collect, self.collect()).await?;
        result.articles_collected = collected.len();

        state.articles = timed(result, Stage::Dedup, self.dedup(collected)).await?;
        result.articles_used = state.articles.len();

        if !self.config.pipeline.generate_script {
            info!("Script generation disabled; stopping after dedup");
            return Ok(());
        }
        let script = timed(result, Stage::Script, self.script(&state.articles, &paths)).await?;
        result.script_path = Some(paths.script.clone());
        state
            .articles
            .retain(|a| script.source_article_refs.contains(&a.url));
        result.articles_used = state.articles.len();
        self.record_articles(&state.articles).await;
        state.script = Some(script);

        if self.config.pipeline.generate_audio {
            if let Some(script) = &state.script {
                let audio = timed(result, Stage::Audio, self.audio(script, &paths)).await;
                if paths.job.exists() {
                    result.job_path = Some(paths.job.clone());
                }
                let audio = audio?;
                result.audio_path = Some(audio.path.clone());
                state.audio = Some(audio);
            }
        }

        if self.config.pipeline.generate_feed {
            if let Some(audio) = &state.audio {
                match self.public_audio_url(&paths) {
                    Some(audio_url) => {
                        let (xml, record) = timed(
                            result,
                            Stage::Feed,
                            self.feed(&state.articles, audio, &audio_url, &paths),
                        )
                        .await?;
                        result.feed_path = Some(paths.feed.clone());
                        state.audio_url = Some(audio_url);
                        state.feed_xml = Some(xml);
                        state.episode = Some(record);
                    }
                    None => warn!(
                        "No public URL for the audio (no object store URL, no feed.audio_base_url); skipping feed"
                    ),
                }
            }
        }

        let uploaded = timed(result, Stage::Upload, self.upload(&state, &paths)).await?;
        result.script_url = uploaded.script;
        result.audio_url = uploaded.audio.or(state.audio_url.clone());
        result.feed_url = uploaded.feed;

        if let Some(episode) = &state.episode {
            timed(result, Stage::Record, async {
                if let Err(e) = self.components.records.record_episode(episode).await {
                    warn!("Could not record episode {}: {}", episode.episode_id, e);
                }
                Ok::<_, PipelineError>(())
            })
            .await?;
        }
        Ok(())
    }

    async fn collect(&self) -> Result<Vec<Article>> {
        let collection = &self.config.collection;
        let mut articles = Vec::new();
        for source in &collection.sources {
            for category in &collection.categories {
                let what = format!("collecting {}/{}", source.id, category);
                let found = with_retry(&self.config.retry, &what, || {
                    self.components.collector.collect(
                        &source.id,
                        category,
                        collection.max_articles_per_source,
                    )
                })
                .await;
                match found {
                    Ok(found) => articles.extend(found),
                    Err(e) => warn!("Source {}/{} failed: {}", source.id, category, e),
                }
            }
        }
        info!("Collected {} candidate article(s)", articles.len());
        Ok(articles)
    }

    async fn dedup(&self, collected: Vec<Article>) -> Result<Vec<Article>> {
        let fresh = filter_new_articles(self.components.records.as_ref(), collected).await;
        if fresh.is_empty() {
            return Err(PipelineError::validation("no new articles"));
        }
        info!("{} new article(s) after dedup", fresh.len());
        Ok(fresh)
    }

    async fn script(&self, articles: &[Article], paths: &EpisodePaths) -> Result<EpisodeScript> {
        let llm = self.components.llm.clone().ok_or_else(|| {
            PipelineError::configuration("script generation is enabled but no LLM is configured")
        })?;
        let synthesizer = ScriptSynthesizer::new(
            llm,
            self.config.script.clone(),
            &self.config.show.name,
            self.config.retry.clone(),
        );
        let script = synthesizer.synthesize(articles, paths.date).await?;
        write_file(&paths.script, script.full_text.as_bytes()).await?;
        info!("Script saved to {:?}", paths.script);
        Ok(script)
    }

    async fn record_articles(&self, articles: &[Article]) {
        for article in articles {
            if let Err(e) = self.components.records.record_article(article).await {
                warn!("Could not record article {}: {}", article.url, e);
            }
        }
    }

    fn audio_synthesizer(&self) -> Result<AudioSynthesizer> {
        let speech = self.components.speech.clone().ok_or_else(|| {
            PipelineError::configuration("audio generation is enabled but no speech client is configured")
        })?;
        let synthesizer = AudioSynthesizer::new(
            speech,
            self.config.audio.clone(),
            (
                self.config.script.host_a.clone(),
                self.config.script.host_b.clone(),
            ),
            self.config.retry.clone(),
        );
        Ok(match self.audio_timing {
            Some((poll, wait)) => synthesizer.with_timing(poll, wait),
            None => synthesizer,
        })
    }

    async fn audio(&self, script: &EpisodeScript, paths: &EpisodePaths) -> Result<AudioArtifact> {
        self.audio_synthesizer()?
            .synthesize(&script.full_text, &paths.audio, &paths.job, &self.cancel)
            .await
    }

    fn public_audio_url(&self, paths: &EpisodePaths) -> Option<String> {
        let key = object_key(&self.config.show.name, paths.date, &paths.audio);
        self.components.storage.public_url(&key).or_else(|| {
            let base = self.config.feed.audio_base_url.as_ref()?;
            let file = paths.audio.file_name()?.to_string_lossy();
            Some(format!("{}/{}", base.trim_end_matches('/'), file))
        })
    }

    /// The published copy wins over the local one; the local copy covers runs without storage.
    /// Only a missing feed starts fresh; a store read that keeps failing is an error.
    async fn existing_feed(&self, paths: &EpisodePaths) -> Result<Option<String>> {
        let key = feed_key(&self.config.show.name);
        let published = with_retry(&self.config.retry, "reading published feed", || {
            self.components.storage.get(&key)
        })
        .await?;
        if let Some(bytes) = published {
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(tokio::fs::read_to_string(&paths.feed).await.ok())
    }

    async fn feed(
        &self,
        articles: &[Article],
        audio: &AudioArtifact,
        audio_url: &str,
        paths: &EpisodePaths,
    ) -> Result<(String, EpisodeRecord)> {
        let show = &self.config.show;
        let channel = ChannelMetadata::from_config(&self.config.feed, &show.name, show.author.as_deref());
        let merger = FeedMerger::new(channel, self.config.feed.max_episodes);

        let episode_id = EpisodeRecord::episode_id_for(&show.name, paths.date);
        let record = EpisodeRecord {
            guid: episode_id.clone(),
            episode_id,
            title: String::new(),
            description: episode_description(&show.name, paths.date, articles),
            publish_date: self.publish_date,
            duration_seconds: audio.duration_seconds,
            file_size_bytes: audio.file_size_bytes,
            audio_url: audio_url.to_string(),
            episode_number: None,
            author: show.author.clone(),
        };

        let existing = self.existing_feed(paths).await?;
        let feed = merger.merge(existing.as_deref(), record.clone())?;
        let xml = merger.render(&feed, Utc::now())?;
        write_file(&paths.feed, xml.as_bytes()).await?;

        let merged = feed
            .episodes
            .into_iter()
            .find(|e| e.guid == record.guid)
            .unwrap_or(record);
        info!("Feed updated with '{}' at {:?}", merged.title, paths.feed);
        Ok((xml, merged))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<Option<String>> {
        let what = format!("uploading {}", key);
        with_retry(&self.config.retry, &what, || {
            self.components.storage.put(key, bytes, content_type)
        })
        .await
    }

    async fn upload(&self, state: &RunState, paths: &EpisodePaths) -> Result<Uploaded> {
        let show = &self.config.show.name;
        let mut uploaded = Uploaded::default();

        if let Some(script) = &state.script {
            let key = object_key(show, paths.date, &paths.script);
            uploaded.script = self
                .put(&key, script.full_text.as_bytes(), "text/plain; charset=utf-8")
                .await?;
        }
        if let Some(audio) = &state.audio {
            let key = object_key(show, paths.date, &audio.path);
            let bytes = tokio::fs::read(&audio.path).await?;
            uploaded.audio = self
                .put(&key, &bytes, mime_for_format(&self.config.audio.audio_format))
                .await?;
        }
        if let Some(xml) = &state.feed_xml {
            if self.config.pipeline.upload_feed {
                uploaded.feed = self
                    .put(&feed_key(show), xml.as_bytes(), "application/rss+xml")
                    .await?;
            } else {
                info!("Feed upload disabled; left at {:?}", paths.feed);
            }
        }
        Ok(uploaded)
    }
}

#[derive(Default)]
struct Uploaded {
    script: Option<String>,
    audio: Option<String>,
    feed: Option<String>,
}

/// Awaits one stage, recording its timing, and tags a failure with the stage.
async fn timed<T, F>(result: &mut PipelineResult, stage: Stage, fut: F) -> StageResult<T>
where
    F: Future<Output = Result<T>>,
{
    info!("Stage {} started", stage.as_str());
    let started = Instant::now();
    let outcome = fut.await;
    result.timings.push(StageTiming {
        stage,
        millis: started.elapsed().as_millis() as u64,
    });
    match outcome {
        Ok(value) => {
            result.completed_stages.push(stage);
            Ok(value)
        }
        Err(e) => Err((stage, e)),
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Resumes polling for a job file written by an earlier run.
pub async fn resume_audio(
    config: &Config,
    speech: Arc<dyn SpeechClient>,
    job_path: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<AudioArtifact> {
    AudioSynthesizer::new(
        speech,
        config.audio.clone(),
        (config.script.host_a.clone(), config.script.host_b.clone()),
        config.retry.clone(),
    )
    .resume(job_path, output, cancel)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys_are_date_partitioned() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let paths = EpisodePaths::new(Path::new("out"), date, "mp3");
        assert_eq!(
            object_key("Signal Check", date, &paths.audio),
            "signal-check/2026-03-02/episode_2026-03-02.mp3"
        );
        assert_eq!(
            object_key("Signal Check", date, &paths.script),
            "signal-check/2026-03-02/episode_2026-03-02_script.txt"
        );
        assert_eq!(feed_key("Signal Check"), "signal-check/feed.xml");
        assert_eq!(paths.feed, Path::new("out").join("feed.xml"));
    }

    #[test]
    fn test_episode_description_lists_sources() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let article = Article {
            url: "https://example.com/a".to_string(),
            title: "Patch Tuesday".to_string(),
            source_id: "wired".to_string(),
            category: "security".to_string(),
            published_at: None,
            author: None,
            body_text: String::new(),
        };
        let text = episode_description("Signal Check", date, &[article]);
        assert!(text.starts_with("Signal Check for March 2, 2026."));
        assert!(text.contains("- Patch Tuesday (https://example.com/a)"));
    }

    #[tokio::test]
    async fn test_timed_records_failures_without_completing() {
        let mut result = PipelineResult::default();
        let ok: StageResult<u8> = timed(&mut result, Stage::Collect, async { Ok::<_, PipelineError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: StageResult<u8> = timed(&mut result, Stage::Dedup, async {
            Err(PipelineError::validation("no new articles"))
        })
        .await;
        assert_eq!(err.unwrap_err().0, Stage::Dedup);
        assert_eq!(result.completed_stages, vec![Stage::Collect]);
        assert_eq!(result.timings.len(), 2);
    }
}
