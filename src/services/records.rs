use async_trait::async_trait;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::error::{PipelineError, Result};
use crate::core::models::{Article, EpisodeRecord};

/// Durable history of used articles and published episodes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn has_article(&self, url: &str) -> Result<bool>;
    async fn record_article(&self, article: &Article) -> Result<()>;
    async fn record_episode(&self, record: &EpisodeRecord) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RecordsConfig {
    /// SQLite database file. Tracking is disabled when unset.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

pub fn create_record_store(config: &RecordsConfig) -> Result<Arc<dyn RecordStore>> {
    match &config.sqlite_path {
        Some(path) => Ok(Arc::new(SqliteRecordStore::open(Path::new(path))?)),
        None => {
            info!("Record store not configured; every article counts as new");
            Ok(Arc::new(NoopRecordStore))
        }
    }
}

/// Removes articles already used in a prior episode, plus duplicates within this batch.
/// A failed lookup keeps the article rather than failing the run.
pub async fn filter_new_articles(store: &dyn RecordStore, articles: Vec<Article>) -> Vec<Article> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::with_capacity(articles.len());
    for article in articles {
        if !seen.insert(article.url.clone()) {
            continue;
        }
        match store.has_article(&article.url).await {
            Ok(true) => info!("Skipping already used article: {}", article.url),
            Ok(false) => fresh.push(article),
            Err(e) => {
                warn!("Dedup lookup failed for {}: {}. Keeping it", article.url, e);
                fresh.push(article);
            }
        }
    }
    fresh
}

pub struct NoopRecordStore;

#[async_trait]
impl RecordStore for NoopRecordStore {
    async fn has_article(&self, _url: &str) -> Result<bool> {
        Ok(false)
    }

    async fn record_article(&self, _article: &Article) -> Result<()> {
        Ok(())
    }

    async fn record_episode(&self, _record: &EpisodeRecord) -> Result<()> {
        Ok(())
    }
}

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS articles (
            url TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source_id TEXT NOT NULL,
            category TEXT NOT NULL,
            published_at TEXT,
            recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS episodes (
            episode_id TEXT PRIMARY KEY,
            guid TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            publish_date TEXT NOT NULL,
            duration_seconds INTEGER,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            audio_url TEXT NOT NULL,
            episode_number INTEGER,
            recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        ",
    )?;
    Ok(())
}

impl SqliteRecordStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        create_schema(&conn)?;
        info!("Opened record store: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| PipelineError::storage("record store lock poisoned"))?;
        Ok(f(&conn)?)
    }

    pub fn episode_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n as u64)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn has_article(&self, url: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1 FROM articles WHERE url = ?1", params![url], |_| Ok(()))
                .optional()
                .map(|row| row.is_some())
        })
    }

    async fn record_article(&self, article: &Article) -> Result<()> {
        let published = article.published_at.map(|d| d.to_rfc3339());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO articles (url, title, source_id, category, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    article.url,
                    article.title,
                    article.source_id,
                    article.category,
                    published
                ],
            )
        })?;
        Ok(())
    }

    async fn record_episode(&self, record: &EpisodeRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO episodes
                 (episode_id, guid, title, publish_date, duration_seconds, file_size_bytes, audio_url, episode_number)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.episode_id,
                    record.guid,
                    record.title,
                    record.publish_date.to_rfc3339(),
                    record.duration_seconds.map(|d| d as i64),
                    record.file_size_bytes as i64,
                    record.audio_url,
                    record.episode_number,
                ],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn article(url: &str) -> Article {
        Article {
            url: url.to_string(),
            title: format!("Title for {}", url),
            source_id: "wired".to_string(),
            category: "security".to_string(),
            published_at: None,
            author: None,
            body_text: "body".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dedup_removes_recorded_urls() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.record_article(&article("A")).await.unwrap();

        let fresh = filter_new_articles(&store, vec![article("A"), article("B")]).await;
        let urls: Vec<_> = fresh.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["B"]);
    }

    #[tokio::test]
    async fn test_dedup_removes_in_batch_duplicates() {
        let fresh = filter_new_articles(
            &NoopRecordStore,
            vec![article("A"), article("B"), article("A")],
        )
        .await;
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn test_recording_same_article_twice_is_harmless() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.record_article(&article("A")).await.unwrap();
        store.record_article(&article("A")).await.unwrap();
        assert!(store.has_article("A").await.unwrap());
        assert!(!store.has_article("Z").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_episode_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("db").join("records.db");
        let record = EpisodeRecord {
            episode_id: "signal-check-2026-03-02".to_string(),
            guid: "signal-check-2026-03-02".to_string(),
            title: "Episode 1 - Mar 2nd, 2026".to_string(),
            description: String::new(),
            publish_date: Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap(),
            duration_seconds: Some(600),
            file_size_bytes: 1234,
            audio_url: "https://cdn.example.com/e1.mp3".to_string(),
            episode_number: Some(1),
            author: None,
        };
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.record_episode(&record).await.unwrap();
            store.record_episode(&record).await.unwrap();
        }
        let store = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(store.episode_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_noop_store_treats_everything_as_new() {
        let store = create_record_store(&RecordsConfig::default()).unwrap();
        assert!(!store.has_article("A").await.unwrap());
        store.record_article(&article("A")).await.unwrap();
        assert!(!store.has_article("A").await.unwrap());
    }
}
