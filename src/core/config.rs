use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::PipelineError;
use crate::core::io::StorageConfig;
use crate::core::retry::RetryPolicy;
use crate::services::collector::CollectionConfig;
use crate::services::feed::FeedConfig;
use crate::services::llm::LlmConfig;
use crate::services::records::RecordsConfig;
use crate::services::script::ScriptConfig;
use crate::services::tts::AudioConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub show: ShowConfig,

    #[serde(default = "default_output")]
    pub output_dir: String,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub script: ScriptConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub records: RecordsConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub pipeline: PipelineToggles,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShowConfig {
    #[serde(default = "default_show_name")]
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            name: default_show_name(),
            author: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    /// One shared client; every request made through it is bounded by the request timeout.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .user_agent(self.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineToggles {
    #[serde(default = "default_true")]
    pub generate_script: bool,
    #[serde(default = "default_true")]
    pub generate_audio: bool,
    #[serde(default = "default_true")]
    pub generate_feed: bool,
    #[serde(default = "default_true")]
    pub upload_feed: bool,
}

impl Default for PipelineToggles {
    fn default() -> Self {
        Self {
            generate_script: true,
            generate_audio: true,
            generate_feed: true,
            upload_feed: true,
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_show_name() -> String {
    "Daily Tech Brief".to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            show: ShowConfig::default(),
            output_dir: default_output(),
            collection: CollectionConfig::default(),
            llm: LlmConfig::default(),
            script: ScriptConfig::default(),
            audio: AudioConfig::default(),
            feed: FeedConfig::default(),
            storage: StorageConfig::default(),
            records: RecordsConfig::default(),
            http: HttpConfig::default(),
            retry: RetryPolicy::default(),
            pipeline: PipelineToggles::default(),
        }
    }
}

impl Config {
    /// Reads the YAML file and fills missing secrets from the process environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env(&|name: &str| std::env::var(name).ok().filter(|v| !v.is_empty()));
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.pipeline.generate_script {
            self.llm.apply_env(lookup);
        }
        if self.pipeline.generate_audio {
            self.audio.apply_env(lookup);
        }
        self.storage.apply_env(lookup);
    }

    /// Only checks what the enabled stages need.
    pub fn validate(&self) -> crate::core::error::Result<()> {
        if self.show.name.trim().is_empty() {
            return Err(PipelineError::configuration("show.name must not be empty"));
        }
        if self.pipeline.generate_audio && !self.pipeline.generate_script {
            return Err(PipelineError::configuration(
                "pipeline.generate_audio requires pipeline.generate_script",
            ));
        }
        if self.pipeline.generate_feed && !self.pipeline.generate_audio {
            return Err(PipelineError::configuration(
                "pipeline.generate_feed requires pipeline.generate_audio",
            ));
        }
        if self.http.request_timeout_secs == 0 {
            return Err(PipelineError::configuration(
                "http.request_timeout_secs must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::configuration("retry.max_attempts must be at least 1"));
        }

        self.collection.validate()?;
        if self.pipeline.generate_script {
            self.llm.validate()?;
            self.script.validate()?;
        }
        if self.pipeline.generate_audio {
            self.audio.validate()?;
        }
        if self.pipeline.generate_feed {
            self.feed.validate()?;
        }
        self.storage.validate()?;
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir))?;
        Ok(())
    }
}
