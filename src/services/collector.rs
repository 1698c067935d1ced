use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{PipelineError, Result};
use crate::core::models::Article;
use crate::utils::rss::{parse_feed, FeedItem};

/// Supplies candidate articles. Never mutates state.
#[async_trait]
pub trait ArticleCollector: Send + Sync {
    async fn collect(&self, source_id: &str, category: &str, max_count: usize)
        -> Result<Vec<Article>>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_max_per_source")]
    pub max_articles_per_source: usize,
    #[serde(default = "default_min_body_chars")]
    pub min_body_chars: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    /// category -> RSS feed URL
    #[serde(default)]
    pub feeds: BTreeMap<String, String>,
}

fn default_sources() -> Vec<SourceConfig> {
    let source = |id: &str, feeds: &[(&str, &str)]| SourceConfig {
        id: id.to_string(),
        feeds: feeds
            .iter()
            .map(|(c, u)| (c.to_string(), u.to_string()))
            .collect(),
    };
    vec![
        source(
            "wired",
            &[
                ("security", "https://www.wired.com/feed/category/security/latest/rss"),
                ("science", "https://www.wired.com/feed/category/science/latest/rss"),
                ("ai", "https://www.wired.com/feed/tag/ai/latest/rss"),
            ],
        ),
        source(
            "techcrunch",
            &[
                ("ai", "https://techcrunch.com/category/artificial-intelligence/feed/"),
                ("security", "https://techcrunch.com/category/security/feed/"),
            ],
        ),
    ]
}
fn default_categories() -> Vec<String> {
    vec!["security".to_string(), "ai".to_string()]
}
fn default_max_per_source() -> usize {
    1
}
fn default_min_body_chars() -> usize {
    100
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            categories: default_categories(),
            max_articles_per_source: default_max_per_source(),
            min_body_chars: default_min_body_chars(),
        }
    }
}

impl CollectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(PipelineError::configuration("collection.sources is empty"));
        }
        if self.categories.is_empty() {
            return Err(PipelineError::configuration("collection.categories is empty"));
        }
        if self.max_articles_per_source == 0 {
            return Err(PipelineError::configuration(
                "collection.max_articles_per_source must be positive",
            ));
        }
        for source in &self.sources {
            for (category, feed) in &source.feeds {
                url::Url::parse(feed).map_err(|e| {
                    PipelineError::configuration(format!(
                        "feed URL for {}/{} is invalid: {}",
                        source.id, category, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn feed_url(&self, source_id: &str, category: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.id == source_id)
            .and_then(|s| s.feeds.get(category))
            .map(String::as_str)
    }
}

/// Reads a source's per-category RSS feed and turns items into articles.
pub struct RssArticleCollector {
    config: CollectionConfig,
    client: reqwest::Client,
}

impl RssArticleCollector {
    pub fn new(config: CollectionConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("article source", e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::from_reqwest("article source", e))?;
        if !status.is_success() {
            return Err(PipelineError::from_status("article source", status, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl ArticleCollector for RssArticleCollector {
    async fn collect(
        &self,
        source_id: &str,
        category: &str,
        max_count: usize,
    ) -> Result<Vec<Article>> {
        let Some(url) = self.config.feed_url(source_id, category) else {
            warn!("No feed configured for {}/{}, skipping", source_id, category);
            return Ok(Vec::new());
        };

        debug!("Fetching {} ({}/{})", url, source_id, category);
        let xml = self.fetch(url).await?;
        let articles = articles_from_feed(
            &xml,
            source_id,
            category,
            max_count,
            self.config.min_body_chars,
        )?;
        info!(
            "Collected {} article(s) from {}/{}",
            articles.len(),
            source_id,
            category
        );
        Ok(articles)
    }
}

pub fn articles_from_feed(
    xml: &str,
    source_id: &str,
    category: &str,
    max_count: usize,
    min_body_chars: usize,
) -> Result<Vec<Article>> {
    let feed = parse_feed(xml).map_err(|e| {
        PipelineError::validation(format!("feed from {} is malformed: {}", source_id, e))
    })?;

    Ok(feed
        .items
        .into_iter()
        .filter_map(|item| item_to_article(item, source_id, category, min_body_chars))
        .take(max_count)
        .collect())
}

fn item_to_article(
    item: FeedItem,
    source_id: &str,
    category: &str,
    min_body_chars: usize,
) -> Option<Article> {
    let title = item.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
    let url = item
        .link
        .or(item.guid)
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())?;

    let html = item.content_encoded.or(item.description).unwrap_or_default();
    let body_text = html_to_text(&html);
    if body_text.chars().count() < min_body_chars {
        debug!("Skipping '{}': body too short", title);
        return None;
    }

    let published_at = item
        .pub_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
        .map(|d| d.with_timezone(&Utc));

    Some(Article {
        url,
        title,
        source_id: source_id.to_string(),
        category: category.to_string(),
        published_at,
        author: item.author.or(item.itunes_author),
        body_text,
    })
}

fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 10_000).unwrap_or_else(|_| html.to_string());
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_xml(items: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:dc="http://purl.org/dc/elements/1.1/"><channel><title>Feed</title>{}</channel></rss>"#,
            items
        )
    }

    fn long_body() -> String {
        "Researchers disclosed a flaw in a widely deployed VPN appliance. ".repeat(4)
    }

    #[test]
    fn test_items_become_articles() {
        let xml = feed_xml(&format!(
            r#"<item><title>VPN flaw</title><link>https://news.example.com/vpn</link>
            <pubDate>Mon, 02 Mar 2026 08:30:00 +0000</pubDate><dc:creator>R. Lee</dc:creator>
            <content:encoded><![CDATA[<p>{}</p>]]></content:encoded></item>"#,
            long_body()
        ));

        let articles = articles_from_feed(&xml, "wired", "security", 5, 100).unwrap();
        assert_eq!(articles.len(), 1);
        let a = &articles[0];
        assert_eq!(a.title, "VPN flaw");
        assert_eq!(a.url, "https://news.example.com/vpn");
        assert_eq!(a.source_id, "wired");
        assert_eq!(a.category, "security");
        assert_eq!(a.author.as_deref(), Some("R. Lee"));
        assert!(a.body_text.starts_with("Researchers disclosed"));
        assert!(!a.body_text.contains("<p>"));
        assert_eq!(
            a.published_at.unwrap().to_rfc3339(),
            "2026-03-02T08:30:00+00:00"
        );
    }

    #[test]
    fn test_short_and_untitled_items_are_dropped() {
        let xml = feed_xml(&format!(
            r#"<item><title>Short</title><link>https://x/1</link><description>tiny</description></item>
            <item><link>https://x/2</link><description>{}</description></item>
            <item><title>Good</title><link>https://x/3</link><description>{}</description></item>"#,
            long_body(),
            long_body()
        ));
        let articles = articles_from_feed(&xml, "techcrunch", "ai", 5, 100).unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].url, "https://x/3");
    }

    #[test]
    fn test_max_count_caps_results() {
        let item = |n: usize| {
            format!(
                "<item><title>T{n}</title><link>https://x/{n}</link><description>{}</description></item>",
                long_body()
            )
        };
        let xml = feed_xml(&(0..4).map(item).collect::<String>());
        let articles = articles_from_feed(&xml, "wired", "ai", 2, 100).unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[1].url, "https://x/1");
    }

    #[test]
    fn test_malformed_feed_is_validation_error() {
        let err = articles_from_feed("<html>", "wired", "ai", 2, 100).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_category_yields_nothing() {
        let collector = RssArticleCollector::new(CollectionConfig::default(), reqwest::Client::new());
        let articles = collector.collect("wired", "sports", 3).await.unwrap();
        assert!(articles.is_empty());
        let articles = collector.collect("nosuchsource", "ai", 3).await.unwrap();
        assert!(articles.is_empty());
    }

    #[test]
    fn test_default_sources_are_valid() {
        CollectionConfig::default().validate().unwrap();
    }
}
