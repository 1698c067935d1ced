//! Minimal RSS 2.0 reader shared by the article collector and the feed merger.

use anyhow::{anyhow, bail, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enclosure {
    pub url: String,
    pub length: u64,
    pub mime_type: String,
}

/// Fields of one `<item>`. Text fields keep whatever the document held, unescaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub pub_date: Option<String>,
    pub description: Option<String>,
    pub content_encoded: Option<String>,
    pub author: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub itunes_duration: Option<String>,
    pub itunes_episode: Option<String>,
    pub itunes_author: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

pub fn parse_feed(xml: &str) -> Result<ParsedFeed> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut feed = ParsedFeed::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut item_depth = 0usize;
    let mut seen_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = element_name(&e);
                if !seen_root {
                    if name != "rss" {
                        bail!("not an RSS document (root element <{}>)", name);
                    }
                    seen_root = true;
                }
                if name == "item" && current.is_none() {
                    current = Some(FeedItem::default());
                    item_depth = stack.len() + 1;
                } else if name == "enclosure" {
                    if let Some(item) = current.as_mut() {
                        item.enclosure = Some(read_enclosure(&e)?);
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = element_name(&e);
                if !seen_root {
                    bail!("not an RSS document (root element <{}/>)", name);
                }
                if name == "enclosure" {
                    if let Some(item) = current.as_mut() {
                        item.enclosure = Some(read_enclosure(&e)?);
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                capture(&mut feed, current.as_mut(), &stack, item_depth, &text);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                capture(&mut feed, current.as_mut(), &stack, item_depth, &text);
            }
            Event::End(_) => {
                let name = stack
                    .pop()
                    .ok_or_else(|| anyhow!("unbalanced closing tag"))?;
                if name == "item" && stack.len() + 1 == item_depth {
                    if let Some(item) = current.take() {
                        feed.items.push(item);
                    }
                    item_depth = 0;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        bail!("empty document");
    }
    if !stack.is_empty() {
        bail!("document ended inside <{}>", stack.join("/"));
    }
    Ok(feed)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn read_enclosure(e: &BytesStart) -> Result<Enclosure> {
    let mut enclosure = Enclosure::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.as_ref() {
            b"url" => enclosure.url = value,
            b"length" => enclosure.length = value.trim().parse().unwrap_or(0),
            b"type" => enclosure.mime_type = value,
            _ => {}
        }
    }
    Ok(enclosure)
}

fn capture(
    feed: &mut ParsedFeed,
    item: Option<&mut FeedItem>,
    stack: &[String],
    item_depth: usize,
    text: &str,
) {
    let Some(name) = stack.last() else {
        return;
    };

    let Some(item) = item else {
        // Channel-level title only: rss/channel/title.
        if name == "title" && stack.len() == 3 {
            append(&mut feed.title, text);
        }
        return;
    };

    if stack.len() != item_depth + 1 {
        return;
    }
    let slot = match name.as_str() {
        "title" => &mut item.title,
        "link" => &mut item.link,
        "guid" => &mut item.guid,
        "pubDate" => &mut item.pub_date,
        "description" => &mut item.description,
        "content:encoded" => &mut item.content_encoded,
        "author" | "dc:creator" => &mut item.author,
        "itunes:duration" => &mut item.itunes_duration,
        "itunes:episode" => &mut item.itunes_episode,
        "itunes:author" => &mut item.itunes_author,
        _ => return,
    };
    append(slot, text);
}

fn append(slot: &mut Option<String>, text: &str) {
    match slot {
        Some(existing) => existing.push_str(text),
        None => *slot = Some(text.to_string()),
    }
}
