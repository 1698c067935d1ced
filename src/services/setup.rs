use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::io::create_object_store;
use crate::services::collector::RssArticleCollector;
use crate::services::llm::create_llm;
use crate::services::records::create_record_store;
use crate::services::tts::create_speech_client;
use crate::services::workflow::Components;

/// Picks every collaborator once, from configuration. Disabled stages get no client at all.
pub fn build_components(config: &Config) -> Result<Components> {
    let client = config.http.build_client()?;

    let llm = if config.pipeline.generate_script {
        let llm = create_llm(&config.llm, client.clone()).context("Failed to set up the LLM client")?;
        info!("LLM provider: {}", config.llm.provider);
        Some(llm)
    } else {
        None
    };

    let speech = if config.pipeline.generate_audio {
        info!("Speech synthesis endpoint: {}", config.audio.endpoint);
        Some(create_speech_client(&config.audio, client.clone()))
    } else {
        None
    };

    let storage = create_object_store(&config.storage, client.clone())
        .context("Failed to set up object storage")?;
    let records =
        create_record_store(&config.records).context("Failed to open the record store")?;

    Ok(Components {
        collector: Arc::new(RssArticleCollector::new(config.collection.clone(), client)),
        records,
        storage,
        llm,
        speech,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stages_get_no_clients() {
        let mut config = Config::default();
        config.pipeline.generate_script = false;
        config.pipeline.generate_audio = false;
        config.pipeline.generate_feed = false;
        let components = build_components(&config).unwrap();
        assert!(components.llm.is_none());
        assert!(components.speech.is_none());
        assert!(components.storage.public_url("a/b.mp3").is_none());
    }

    #[test]
    fn test_records_open_sqlite_when_configured() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.pipeline.generate_audio = false;
        config.pipeline.generate_feed = false;
        config.llm.provider = "ollama".to_string();
        config.llm.ollama = Some(crate::services::llm::OllamaConfig {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
        });
        config.records.sqlite_path = Some(
            temp_dir
                .path()
                .join("records.db")
                .to_string_lossy()
                .into_owned(),
        );
        let components = build_components(&config).unwrap();
        assert!(components.llm.is_some());
        assert!(temp_dir.path().join("records.db").exists());
    }
}
