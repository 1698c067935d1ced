//! Podcast feed maintenance: merge one new episode into the existing RSS document,
//! keep it bounded, and write it back out in full.

use chrono::{DateTime, Datelike, Utc};
use log::{info, warn};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::error::{PipelineError, Result};
use crate::core::models::EpisodeRecord;
use crate::utils::audio::{format_duration, mime_for_format, parse_duration};
use crate::utils::rss::{parse_feed, FeedItem};

const ITUNES_NS: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";
const CONTENT_NS: &str = "http://purl.org/rss/1.0/modules/content/";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeedConfig {
    /// Channel title. Falls back to the show name.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub link: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default = "default_max_episodes")]
    pub max_episodes: usize,
    /// Public prefix for audio files when no object store hands out URLs.
    #[serde(default)]
    pub audio_base_url: Option<String>,
}

fn default_description() -> String {
    "A daily two-host conversation about the news.".to_string()
}
fn default_language() -> String {
    "en-us".to_string()
}
fn default_category() -> String {
    "Technology".to_string()
}
fn default_max_episodes() -> usize {
    50
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            title: None,
            description: default_description(),
            link: String::new(),
            language: default_language(),
            email: None,
            image_url: None,
            category: default_category(),
            explicit: false,
            max_episodes: default_max_episodes(),
            audio_base_url: None,
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_episodes == 0 {
            return Err(PipelineError::configuration("feed.max_episodes must be at least 1"));
        }
        if let Some(base) = &self.audio_base_url {
            url::Url::parse(base).map_err(|e| {
                PipelineError::configuration(format!(
                    "feed.audio_base_url '{}' is not a URL: {}",
                    base, e
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMetadata {
    pub title: String,
    pub description: String,
    pub link: String,
    pub language: String,
    pub author: Option<String>,
    pub email: Option<String>,
    pub image_url: Option<String>,
    pub category: String,
    pub explicit: bool,
}

impl ChannelMetadata {
    pub fn from_config(config: &FeedConfig, show_name: &str, author: Option<&str>) -> Self {
        Self {
            title: config.title.clone().unwrap_or_else(|| show_name.to_string()),
            description: config.description.clone(),
            link: config.link.clone(),
            language: config.language.clone(),
            author: author.map(str::to_string),
            email: config.email.clone(),
            image_url: config.image_url.clone(),
            category: config.category.clone(),
            explicit: config.explicit,
        }
    }
}

/// Episodes are kept newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RssFeed {
    pub channel: ChannelMetadata,
    pub episodes: Vec<EpisodeRecord>,
}

/// `Episode 12 - Mar 2nd, 2026`
pub fn episode_title(number: u32, date: DateTime<Utc>) -> String {
    let day = date.day();
    let suffix = match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!(
        "Episode {} - {} {}{}, {}",
        number,
        date.format("%b"),
        day,
        suffix,
        date.year()
    )
}

pub struct FeedMerger {
    channel: ChannelMetadata,
    max_episodes: usize,
}

impl FeedMerger {
    pub fn new(channel: ChannelMetadata, max_episodes: usize) -> Self {
        Self {
            channel,
            max_episodes: max_episodes.max(1),
        }
    }

    /// Reads the episodes out of a previously published feed. Channel metadata always
    /// comes from configuration. Anything unreadable counts as no feed at all.
    pub fn load(&self, existing: Option<&str>) -> RssFeed {
        let mut feed = RssFeed {
            channel: self.channel.clone(),
            episodes: Vec::new(),
        };
        let Some(xml) = existing.filter(|s| !s.trim().is_empty()) else {
            info!("No existing feed; starting a new one");
            return feed;
        };
        match parse_feed(xml) {
            Ok(parsed) => {
                feed.episodes = parsed.items.into_iter().filter_map(record_from_item).collect();
                info!("Loaded existing feed with {} episode(s)", feed.episodes.len());
            }
            Err(e) => warn!("Existing feed is unreadable ({}); starting a new one", e),
        }
        feed
    }

    /// Inserts `record`, numbering and titling it if needed, then orders newest first
    /// and evicts the oldest entries beyond the cap.
    pub fn merge(&self, existing: Option<&str>, mut record: EpisodeRecord) -> Result<RssFeed> {
        let mut feed = self.load(existing);

        if feed.episodes.iter().any(|e| e.guid == record.guid) {
            return Err(PipelineError::validation(format!(
                "feed already contains an episode with guid '{}'",
                record.guid
            )));
        }

        let number = match record.episode_number {
            Some(n) => n,
            None => {
                let next = feed
                    .episodes
                    .iter()
                    .filter_map(|e| e.episode_number)
                    .max()
                    .unwrap_or(0)
                    + 1;
                record.episode_number = Some(next);
                next
            }
        };
        if record.title.trim().is_empty() {
            record.title = episode_title(number, record.publish_date);
        }

        feed.episodes.push(record);
        feed.episodes.sort_by(|a, b| b.publish_date.cmp(&a.publish_date));
        if feed.episodes.len() > self.max_episodes {
            let evicted = feed.episodes.split_off(self.max_episodes);
            for e in &evicted {
                info!("Evicting episode '{}' ({})", e.title, e.publish_date.to_rfc2822());
            }
        }
        Ok(feed)
    }

    pub fn render(&self, feed: &RssFeed, build_date: DateTime<Utc>) -> Result<String> {
        render_feed(feed, build_date)
            .map_err(|e| PipelineError::storage(format!("feed serialization failed: {}", e)))
    }
}

/// Items without any identity are dropped; a missing date sorts as the oldest possible.
fn record_from_item(item: FeedItem) -> Option<EpisodeRecord> {
    let guid = item
        .guid
        .clone()
        .or_else(|| item.enclosure.as_ref().map(|e| e.url.clone()))
        .or_else(|| item.link.clone())
        .filter(|g| !g.trim().is_empty())?;

    let publish_date = item
        .pub_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| {
            warn!("Episode '{}' has no readable pubDate", guid);
            DateTime::<Utc>::default()
        });

    let (audio_url, file_size_bytes) = match &item.enclosure {
        Some(e) => (e.url.clone(), e.length),
        None => (item.link.clone().unwrap_or_default(), 0),
    };

    Some(EpisodeRecord {
        episode_id: guid.clone(),
        guid,
        title: item.title.unwrap_or_default(),
        description: item.description.unwrap_or_default(),
        publish_date,
        duration_seconds: item.itunes_duration.as_deref().and_then(parse_duration),
        file_size_bytes,
        audio_url,
        episode_number: item.itunes_episode.and_then(|n| n.trim().parse().ok()),
        author: item.itunes_author.or(item.author),
    })
}

fn mime_for_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    mime_for_format(ext)
}

fn description_html(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| format!("<p>{}</p>", quick_xml::escape::escape(l)))
        .collect()
}

type XmlWriter = Writer<Vec<u8>>;

fn text_element(w: &mut XmlWriter, name: &str, text: &str) -> anyhow::Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn render_feed(feed: &RssFeed, build_date: DateTime<Utc>) -> anyhow::Result<String> {
    let channel = &feed.channel;
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.write_event(Event::Start(BytesStart::new("rss").with_attributes([
        ("version", "2.0"),
        ("xmlns:itunes", ITUNES_NS),
        ("xmlns:content", CONTENT_NS),
    ])))?;
    w.write_event(Event::Start(BytesStart::new("channel")))?;

    text_element(&mut w, "title", &channel.title)?;
    text_element(&mut w, "link", &channel.link)?;
    text_element(&mut w, "description", &channel.description)?;
    text_element(&mut w, "language", &channel.language)?;
    text_element(&mut w, "lastBuildDate", &build_date.to_rfc2822())?;
    text_element(
        &mut w,
        "generator",
        &format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    )?;
    text_element(&mut w, "category", &channel.category)?;
    if let Some(email) = &channel.email {
        let contact = match &channel.author {
            Some(author) => format!("{} ({})", email, author),
            None => email.clone(),
        };
        text_element(&mut w, "managingEditor", &contact)?;
        text_element(&mut w, "webMaster", &contact)?;
    }
    if let Some(image) = &channel.image_url {
        w.write_event(Event::Start(BytesStart::new("image")))?;
        text_element(&mut w, "url", image)?;
        text_element(&mut w, "title", &channel.title)?;
        text_element(&mut w, "link", &channel.link)?;
        w.write_event(Event::End(BytesEnd::new("image")))?;
        w.write_event(Event::Empty(
            BytesStart::new("itunes:image").with_attributes([("href", image.as_str())]),
        ))?;
    }
    if let Some(author) = &channel.author {
        text_element(&mut w, "itunes:author", author)?;
    }
    text_element(&mut w, "itunes:summary", &channel.description)?;
    text_element(
        &mut w,
        "itunes:explicit",
        if channel.explicit { "true" } else { "false" },
    )?;
    w.write_event(Event::Empty(
        BytesStart::new("itunes:category").with_attributes([("text", channel.category.as_str())]),
    ))?;
    if let Some(email) = &channel.email {
        w.write_event(Event::Start(BytesStart::new("itunes:owner")))?;
        text_element(
            &mut w,
            "itunes:name",
            channel.author.as_deref().unwrap_or(&channel.title),
        )?;
        text_element(&mut w, "itunes:email", email)?;
        w.write_event(Event::End(BytesEnd::new("itunes:owner")))?;
    }

    let mut seen = HashSet::new();
    for episode in &feed.episodes {
        if !seen.insert(episode.guid.as_str()) {
            continue;
        }
        write_item(&mut w, episode)?;
    }

    w.write_event(Event::End(BytesEnd::new("channel")))?;
    w.write_event(Event::End(BytesEnd::new("rss")))?;

    let mut out = String::from_utf8_lossy(&w.into_inner()).into_owned();
    out.push('\n');
    Ok(out)
}

fn write_item(w: &mut XmlWriter, episode: &EpisodeRecord) -> anyhow::Result<()> {
    w.write_event(Event::Start(BytesStart::new("item")))?;
    text_element(w, "title", &episode.title)?;
    text_element(w, "description", &episode.description)?;
    let html = description_html(&episode.description);
    if !html.is_empty() {
        w.write_event(Event::Start(BytesStart::new("content:encoded")))?;
        w.write_event(Event::CData(BytesCData::new(html.as_str())))?;
        w.write_event(Event::End(BytesEnd::new("content:encoded")))?;
    }
    text_element(w, "link", &episode.audio_url)?;
    w.write_event(Event::Start(
        BytesStart::new("guid").with_attributes([("isPermaLink", "false")]),
    ))?;
    w.write_event(Event::Text(BytesText::new(&episode.guid)))?;
    w.write_event(Event::End(BytesEnd::new("guid")))?;
    text_element(w, "pubDate", &episode.publish_date.to_rfc2822())?;

    let length = episode.file_size_bytes.to_string();
    w.write_event(Event::Empty(BytesStart::new("enclosure").with_attributes([
        ("url", episode.audio_url.as_str()),
        ("length", length.as_str()),
        ("type", mime_for_url(&episode.audio_url)),
    ])))?;

    if let Some(seconds) = episode.duration_seconds {
        text_element(w, "itunes:duration", &format_duration(seconds))?;
    }
    if let Some(n) = episode.episode_number {
        text_element(w, "itunes:episode", &n.to_string())?;
    }
    if let Some(author) = &episode.author {
        text_element(w, "itunes:author", author)?;
    }
    text_element(w, "itunes:episodeType", "full")?;
    w.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn channel() -> ChannelMetadata {
        ChannelMetadata::from_config(
            &FeedConfig {
                email: Some("desk@example.com".to_string()),
                image_url: Some("https://cdn.example.com/cover.png".to_string()),
                link: "https://example.com".to_string(),
                ..Default::default()
            },
            "Signal Check",
            Some("Newsroom"),
        )
    }

    fn record(day: u32) -> EpisodeRecord {
        let date = Utc.with_ymd_and_hms(2026, 3, day, 6, 0, 0).unwrap();
        EpisodeRecord {
            episode_id: format!("signal-check-2026-03-{:02}", day),
            guid: format!("signal-check-2026-03-{:02}", day),
            title: String::new(),
            description: format!("Stories for day {}\n- Some headline: https://example.com/{}", day, day),
            publish_date: date,
            duration_seconds: Some(600 + day as u64),
            file_size_bytes: 1000 * day as u64,
            audio_url: format!("https://cdn.example.com/episode_{}.mp3", day),
            episode_number: None,
            author: Some("Newsroom".to_string()),
        }
    }

    fn build_feed(merger: &FeedMerger, days: &[u32]) -> String {
        let mut xml: Option<String> = None;
        for day in days {
            let feed = merger.merge(xml.as_deref(), record(*day)).unwrap();
            xml = Some(merger.render(&feed, Utc::now()).unwrap());
        }
        xml.unwrap_or_default()
    }

    fn days_in(feed: &RssFeed) -> Vec<u32> {
        feed.episodes.iter().map(|e| e.publish_date.day()).collect()
    }

    #[test]
    fn test_episode_title_suffixes() {
        let at = |d| Utc.with_ymd_and_hms(2026, 3, d, 0, 0, 0).unwrap();
        assert_eq!(episode_title(1, at(1)), "Episode 1 - Mar 1st, 2026");
        assert_eq!(episode_title(2, at(2)), "Episode 2 - Mar 2nd, 2026");
        assert_eq!(episode_title(3, at(3)), "Episode 3 - Mar 3rd, 2026");
        assert_eq!(episode_title(4, at(11)), "Episode 4 - Mar 11th, 2026");
        assert_eq!(episode_title(5, at(12)), "Episode 5 - Mar 12th, 2026");
        assert_eq!(episode_title(6, at(22)), "Episode 6 - Mar 22nd, 2026");
        assert_eq!(episode_title(7, at(31)), "Episode 7 - Mar 31st, 2026");
    }

    #[test]
    fn test_fresh_feed_gets_first_episode() {
        let merger = FeedMerger::new(channel(), 10);
        let feed = merger.merge(None, record(2)).unwrap();
        assert_eq!(feed.episodes.len(), 1);
        assert_eq!(feed.episodes[0].episode_number, Some(1));
        assert_eq!(feed.episodes[0].title, "Episode 1 - Mar 2nd, 2026");
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let merger = FeedMerger::new(channel(), 5);
        let xml = build_feed(&merger, &[1, 2, 3, 4, 5]);
        assert_eq!(days_in(&merger.load(Some(&xml))), vec![5, 4, 3, 2, 1]);

        let capped = FeedMerger::new(channel(), 4);
        let feed = capped.merge(Some(&xml), record(6)).unwrap();
        assert_eq!(days_in(&feed), vec![6, 5, 4, 3]);
        assert_eq!(feed.episodes[0].episode_number, Some(6));
    }

    #[test]
    fn test_bound_holds_for_any_merge_order() {
        let merger = FeedMerger::new(channel(), 3);
        let mut xml: Option<String> = None;
        for day in [9, 2, 14, 1, 20, 7, 3] {
            let feed = merger.merge(xml.as_deref(), record(day)).unwrap();
            assert!(feed.episodes.len() <= 3);
            let dates: Vec<_> = feed.episodes.iter().map(|e| e.publish_date).collect();
            let mut sorted = dates.clone();
            sorted.sort_by(|a, b| b.cmp(a));
            assert_eq!(dates, sorted);
            xml = Some(merger.render(&feed, Utc::now()).unwrap());
        }
        let final_feed = merger.load(xml.as_deref());
        assert_eq!(days_in(&final_feed), vec![20, 14, 9]);
    }

    #[test]
    fn test_guid_collision_is_rejected() {
        let merger = FeedMerger::new(channel(), 10);
        let xml = build_feed(&merger, &[1, 2]);
        let err = merger.merge(Some(&xml), record(2)).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
        assert!(err.to_string().contains("signal-check-2026-03-02"));
    }

    #[test]
    fn test_malformed_feed_is_treated_as_absent() {
        let merger = FeedMerger::new(channel(), 10);
        let feed = merger.merge(Some("<rss><channel><item>"), record(1)).unwrap();
        assert_eq!(feed.episodes.len(), 1);
        let feed = merger.merge(Some("{\"not\": \"xml\"}"), record(1)).unwrap();
        assert_eq!(feed.episodes.len(), 1);
    }

    #[test]
    fn test_unreadable_dates_are_evicted_first() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Old</title>
  <item><title>Mystery</title><guid>old-1</guid><pubDate>someday</pubDate>
    <enclosure url="https://cdn.example.com/old.mp3" length="10" type="audio/mpeg"/></item>
</channel></rss>"#;
        let merger = FeedMerger::new(channel(), 1);
        let feed = merger.merge(Some(xml), record(1)).unwrap();
        assert_eq!(feed.episodes.len(), 1);
        assert_eq!(feed.episodes[0].guid, "signal-check-2026-03-01");
    }

    #[test]
    fn test_rendered_feed_carries_podcast_tags() {
        let merger = FeedMerger::new(channel(), 10);
        let feed = merger.merge(None, record(2)).unwrap();
        let xml = merger.render(&feed, Utc::now()).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("xmlns:itunes=\"http://www.itunes.com/dtds/podcast-1.0.dtd\""));
        assert!(xml.contains("<title>Signal Check</title>"));
        assert!(xml.contains("<itunes:email>desk@example.com</itunes:email>"));
        assert!(xml.contains("<itunes:image href=\"https://cdn.example.com/cover.png\"/>"));
        assert!(xml.contains("<guid isPermaLink=\"false\">signal-check-2026-03-02</guid>"));
        let pub_date = feed.episodes[0].publish_date.to_rfc2822();
        assert!(pub_date.starts_with("Mon, "));
        assert!(xml.contains(&format!("<pubDate>{}</pubDate>", pub_date)));
        assert!(xml.contains(
            "<enclosure url=\"https://cdn.example.com/episode_2.mp3\" length=\"2000\" type=\"audio/mpeg\"/>"
        ));
        assert!(xml.contains("<itunes:duration>00:10:02</itunes:duration>"));
        assert!(xml.contains("<itunes:episode>1</itunes:episode>"));

        let reparsed = merger.load(Some(&xml));
        assert_eq!(reparsed.episodes, feed.episodes);
    }

    #[test]
    fn test_text_is_escaped() {
        let merger = FeedMerger::new(channel(), 10);
        let mut r = record(3);
        r.description = "AT&T <finally> ships".to_string();
        let feed = merger.merge(None, r).unwrap();
        let xml = merger.render(&feed, Utc::now()).unwrap();
        assert!(xml.contains("<description>AT&amp;T &lt;finally&gt; ships</description>"));
        assert_eq!(merger.load(Some(&xml)).episodes[0].description, "AT&T <finally> ships");
    }
}
