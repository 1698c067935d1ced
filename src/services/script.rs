use chrono::NaiveDate;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::error::{PipelineError, Result};
use crate::core::models::{Article, EpisodeFramework, EpisodeScript, ScriptSegment};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::services::llm::LlmClient;

pub const OPENING_HEADER: &str = "## SHOW OPENING";
pub const CLOSING_HEADER: &str = "## SHOW CLOSING";
const SEGMENT_SCRIPT_HEADER: &str = "### SEGMENT SCRIPT";
const SEGMENT_SUMMARY_HEADER: &str = "### SEGMENT SUMMARY";
const OFF_TOPIC_MARKER: &str = "NON_TECH_CONTENT:";

/// Initial request plus one retry with identical input.
const PARSE_ATTEMPTS: usize = 2;

const SYSTEM_PROMPT: &str = "You write scripts for a two-host technology news podcast. \
Follow the requested output format exactly and do not add commentary outside it.";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScriptConfig {
    #[serde(default = "default_host_a")]
    pub host_a: String,
    #[serde(default = "default_host_b")]
    pub host_b: String,
    /// Article bodies longer than this are cut before they are sent.
    #[serde(default = "default_max_article_chars")]
    pub max_article_chars: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Abort when any single article fails instead of continuing with the rest.
    #[serde(default)]
    pub strict_segments: bool,
}

fn default_host_a() -> String {
    "Alex".to_string()
}
fn default_host_b() -> String {
    "Sam".to_string()
}
fn default_max_article_chars() -> usize {
    12_000
}
fn default_concurrency() -> usize {
    3
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            host_a: default_host_a(),
            host_b: default_host_b(),
            max_article_chars: default_max_article_chars(),
            concurrency: default_concurrency(),
            strict_segments: false,
        }
    }
}

impl ScriptConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host_a.trim().is_empty() || self.host_b.trim().is_empty() {
            return Err(PipelineError::configuration("script hosts must be named"));
        }
        if self.host_a == self.host_b {
            return Err(PipelineError::configuration(
                "script.host_a and script.host_b must differ",
            ));
        }
        if self.concurrency == 0 || self.max_article_chars == 0 {
            return Err(PipelineError::configuration(
                "script.concurrency and script.max_article_chars must be positive",
            ));
        }
        Ok(())
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the info string (```markdown, ```text ...) on the fence line.
        let body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        body.trim_end().trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Cuts `body` to at most `max_chars` characters on a char boundary.
pub fn truncate_article(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n[article truncated]", body[..idx].trim_end()),
        None => body.to_string(),
    }
}

fn is_refusal(response: &str) -> bool {
    if response
        .lines()
        .any(|l| l.trim().starts_with(OFF_TOPIC_MARKER))
    {
        return true;
    }
    let lower = response.to_lowercase();
    [
        "not a tech news story",
        "not appropriate content for",
        "if you have an actual tech news article",
    ]
    .iter()
    .any(|phrase| lower.contains(phrase))
}

/// Splits a segment response into (dialogue, summary).
pub fn parse_segment_response(response: &str) -> Result<(String, String)> {
    let cleaned = strip_code_blocks(response);
    if is_refusal(&cleaned) {
        let preview: String = cleaned.chars().take(200).collect();
        return Err(PipelineError::TerminalExternal {
            service: "text generation".to_string(),
            message: format!("refused the article as off-topic: {}", preview),
        });
    }

    enum Section {
        None,
        Script,
        Summary,
    }
    let mut section = Section::None;
    let mut script: Vec<&str> = Vec::new();
    let mut summary: Vec<&str> = Vec::new();

    for raw in cleaned.lines() {
        let line = raw.trim();
        let upper = line.to_uppercase();
        if upper.starts_with(SEGMENT_SCRIPT_HEADER) {
            section = Section::Script;
            continue;
        }
        if upper.starts_with(SEGMENT_SUMMARY_HEADER) {
            section = Section::Summary;
            continue;
        }
        if line.is_empty() || line.starts_with("---") {
            continue;
        }
        match section {
            Section::Script => script.push(line),
            Section::Summary => summary.push(line),
            Section::None => {}
        }
    }

    if script.is_empty() {
        return Err(PipelineError::validation(
            "segment response has no SEGMENT SCRIPT section",
        ));
    }
    if summary.is_empty() {
        return Err(PipelineError::validation(
            "segment response has no SEGMENT SUMMARY section",
        ));
    }
    Ok((script.join("\n"), summary.join(" ")))
}

/// Parses opening / transitions / closing. Transitions must cover `1→2 .. (n-1)→n` exactly once.
pub fn parse_framework_response(response: &str, segment_count: usize) -> Result<EpisodeFramework> {
    let cleaned = strip_code_blocks(response);

    #[derive(Clone, Copy)]
    enum Section {
        Opening,
        Transition(usize),
        Closing,
    }
    let mut current: Option<Section> = None;
    let mut opening: Option<Vec<&str>> = None;
    let mut closing: Option<Vec<&str>> = None;
    let mut transitions: BTreeMap<usize, Vec<&str>> = BTreeMap::new();

    for raw in cleaned.lines() {
        let line = raw.trim();
        if line.starts_with("##") {
            let header = line.trim_start_matches('#').trim().to_uppercase();
            let section = if header.starts_with("SHOW OPENING") {
                if opening.replace(Vec::new()).is_some() {
                    return Err(PipelineError::validation("framework has two openings"));
                }
                Section::Opening
            } else if header.starts_with("SHOW CLOSING") {
                if closing.replace(Vec::new()).is_some() {
                    return Err(PipelineError::validation("framework has two closings"));
                }
                Section::Closing
            } else if let Some(rest) = header.strip_prefix("TRANSITION") {
                let from = parse_transition_numbers(rest)?;
                if transitions.insert(from, Vec::new()).is_some() {
                    return Err(PipelineError::validation(format!(
                        "framework repeats transition {}→{}",
                        from,
                        from + 1
                    )));
                }
                Section::Transition(from)
            } else {
                return Err(PipelineError::validation(format!(
                    "unexpected framework section: {}",
                    line
                )));
            };
            current = Some(section);
            continue;
        }
        if line.is_empty() || line.starts_with("---") {
            continue;
        }
        let bucket = match current {
            Some(Section::Opening) => opening.as_mut(),
            Some(Section::Closing) => closing.as_mut(),
            Some(Section::Transition(n)) => transitions.get_mut(&n),
            None => None,
        };
        if let Some(lines) = bucket {
            lines.push(line);
        }
    }

    let opening_text = join_required(opening, "opening")?;
    let closing_text = join_required(closing, "closing")?;

    let expected = segment_count.saturating_sub(1);
    let mut ordered = Vec::with_capacity(expected);
    for from in 1..=expected {
        let lines = transitions.remove(&from).ok_or_else(|| {
            PipelineError::validation(format!(
                "framework is missing transition {}→{}",
                from,
                from + 1
            ))
        })?;
        ordered.push(join_required(Some(lines), &format!("transition {}→{}", from, from + 1))?);
    }
    if let Some((extra, _)) = transitions.into_iter().next() {
        return Err(PipelineError::validation(format!(
            "framework has transition {}→{} but only {} segment(s)",
            extra,
            extra + 1,
            segment_count
        )));
    }

    Ok(EpisodeFramework {
        opening_text,
        transitions: ordered,
        closing_text,
    })
}

fn parse_transition_numbers(rest: &str) -> Result<usize> {
    let numbers: Vec<usize> = rest
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    match numbers.as_slice() {
        [from, to, ..] if *from >= 1 && *to == from + 1 => Ok(*from),
        _ => Err(PipelineError::validation(format!(
            "malformed transition header: TRANSITION{}",
            rest
        ))),
    }
}

fn join_required(lines: Option<Vec<&str>>, what: &str) -> Result<String> {
    match lines {
        Some(lines) if !lines.is_empty() => Ok(lines.join("\n")),
        Some(_) => Err(PipelineError::validation(format!("framework {} is empty", what))),
        None => Err(PipelineError::validation(format!("framework is missing the {}", what))),
    }
}

/// Deterministic composition: opening, then each segment followed by its transition, then closing.
pub fn assemble(segments: &[ScriptSegment], framework: &EpisodeFramework) -> Result<EpisodeScript> {
    if segments.is_empty() {
        return Err(PipelineError::validation("cannot assemble an episode without segments"));
    }
    if framework.transitions.len() != segments.len() - 1 {
        return Err(PipelineError::validation(format!(
            "{} transitions for {} segments",
            framework.transitions.len(),
            segments.len()
        )));
    }

    let mut parts = Vec::with_capacity(segments.len() * 2 + 1);
    parts.push(format!("{}\n{}", OPENING_HEADER, framework.opening_text));
    for (i, segment) in segments.iter().enumerate() {
        parts.push(format!("## SEGMENT {}\n{}", i + 1, segment.dialogue_text));
        if let Some(transition) = framework.transitions.get(i) {
            parts.push(format!("## TRANSITION {}→{}\n{}", i + 1, i + 2, transition));
        }
    }
    parts.push(format!("{}\n{}", CLOSING_HEADER, framework.closing_text));

    Ok(EpisodeScript {
        full_text: parts.join("\n\n"),
        segment_count: segments.len(),
        source_article_refs: segments.iter().map(|s| s.article_ref.clone()).collect(),
        segments: segments.to_vec(),
    })
}

pub struct ScriptSynthesizer {
    llm: Arc<dyn LlmClient>,
    config: ScriptConfig,
    show_name: String,
    retry: RetryPolicy,
}

impl ScriptSynthesizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        config: ScriptConfig,
        show_name: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            config,
            show_name: show_name.to_string(),
            retry,
        }
    }

    pub async fn synthesize(&self, articles: &[Article], date: NaiveDate) -> Result<EpisodeScript> {
        if articles.is_empty() {
            return Err(PipelineError::validation("no articles to write a script for"));
        }
        let segments = self.generate_segments(articles).await?;
        let framework = self.generate_framework(&segments, date).await?;
        let script = assemble(&segments, &framework)?;
        info!(
            "Assembled script with {} segment(s), {} chars",
            script.segment_count,
            script.full_text.len()
        );
        Ok(script)
    }

    /// Phase 1. Results land in slots indexed by article position, so output order is input order.
    pub async fn generate_segments(&self, articles: &[Article]) -> Result<Vec<ScriptSegment>> {
        let pb = ProgressBar::new(articles.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let results: Vec<(usize, Result<ScriptSegment>)> =
            futures_util::stream::iter(articles.iter().enumerate())
                .map(|(i, article)| {
                    let pb = pb.clone();
                    async move {
                        let result = self.generate_segment(article, i).await;
                        pb.inc(1);
                        (i, result)
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
        pb.finish_and_clear();

        let mut slots: Vec<Option<ScriptSegment>> = (0..articles.len()).map(|_| None).collect();
        let mut failures = Vec::new();
        for (i, result) in results {
            match result {
                Ok(segment) => slots[i] = Some(segment),
                Err(e) => {
                    warn!("Segment for '{}' failed: {}", articles[i].title, e);
                    failures.push((i, e));
                }
            }
        }

        if self.config.strict_segments {
            if let Some((i, e)) = failures.into_iter().min_by_key(|(i, _)| *i) {
                return Err(with_article_context(e, &articles[i]));
            }
        }

        let segments: Vec<ScriptSegment> = slots.into_iter().flatten().collect();
        if segments.is_empty() {
            return Err(PipelineError::validation(format!(
                "no usable segments from {} article(s)",
                articles.len()
            )));
        }
        if segments.len() < articles.len() {
            warn!(
                "Continuing with {} of {} segments",
                segments.len(),
                articles.len()
            );
        }
        Ok(segments)
    }

    /// One article. Can be called on its own to regenerate a failed segment.
    pub async fn generate_segment(&self, article: &Article, ordinal: usize) -> Result<ScriptSegment> {
        if article.body_text.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "article '{}' has an empty body",
                article.url
            )));
        }
        let prompt = self.segment_prompt(article);
        let (dialogue_text, summary_text) = self
            .request_parsed("segment generation", &prompt, parse_segment_response)
            .await?;
        Ok(ScriptSegment {
            article_ref: article.url.clone(),
            article_title: article.title.clone(),
            ordinal,
            dialogue_text,
            summary_text,
        })
    }

    /// Phase 2. A response that does not split cleanly is retried once with the same summaries.
    pub async fn generate_framework(
        &self,
        segments: &[ScriptSegment],
        date: NaiveDate,
    ) -> Result<EpisodeFramework> {
        let prompt = self.framework_prompt(segments, date);
        let count = segments.len();
        self.request_parsed("framework generation", &prompt, |response| {
            parse_framework_response(response, count)
        })
        .await
    }

    async fn request_parsed<T, F>(&self, what: &str, prompt: &str, parse: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let mut last_error = None;
        for attempt in 1..=PARSE_ATTEMPTS {
            let response =
                with_retry(&self.retry, what, || self.llm.chat(SYSTEM_PROMPT, prompt)).await?;
            match parse(&response) {
                Ok(value) => return Ok(value),
                Err(e @ PipelineError::Validation { .. }) => {
                    warn!(
                        "{} returned an unusable response (attempt {}/{}): {}",
                        what, attempt, PARSE_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| PipelineError::validation(format!("{} produced nothing", what))))
    }

    fn segment_prompt(&self, article: &Article) -> String {
        let body = truncate_article(&article.body_text, self.config.max_article_chars);
        let (a, b) = (&self.config.host_a, &self.config.host_b);
        format!(
            "Turn the article below into one segment of the show, hosted by {a} and {b}.\n\
             {a} leads the segment and explains the story; {b} asks sharp questions and adds context.\n\
             Aim for two to three minutes of natural, conversational dialogue.\n\
             Every dialogue line starts with the speaker name and a colon, e.g. \"{a}: ...\".\n\
             Do not greet the audience or sign off; this segment sits in the middle of the show.\n\n\
             If the article is not about technology, reply with a single line:\n\
             {marker} <one sentence explaining why>\n\n\
             Otherwise reply in exactly this format:\n\
             {script_header}\n\
             <dialogue>\n\n\
             {summary_header}\n\
             <one paragraph summary of the story for the show producers>\n\n\
             TITLE: {title}\n\
             SOURCE: {source}\n\
             URL: {url}\n\n\
             ARTICLE:\n{body}",
            a = a,
            b = b,
            marker = OFF_TOPIC_MARKER,
            script_header = SEGMENT_SCRIPT_HEADER,
            summary_header = SEGMENT_SUMMARY_HEADER,
            title = article.title,
            source = article.source_id,
            url = article.url,
            body = body,
        )
    }

    fn framework_prompt(&self, segments: &[ScriptSegment], date: NaiveDate) -> String {
        let (a, b) = (&self.config.host_a, &self.config.host_b);
        let summaries = segments
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Segment {}:\n{}", i + 1, s.summary_text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let transitions = (1..segments.len())
            .map(|i| format!("## TRANSITION {}→{}\n<one or two lines bridging the stories>", i, i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "Write the connective narration for today's episode of \"{show}\", hosted by {a} and {b}.\n\
             Date: {date}\n\
             Number of stories: {count}\n\n\
             The segments themselves are already written. Provide:\n\
             - an opening where the hosts welcome listeners and preview every story\n\
             - one short transition between each pair of adjacent segments, in order\n\
             - a closing that wraps up and thanks listeners\n\
             Every dialogue line starts with the speaker name and a colon.\n\n\
             Reply in exactly this format and nothing else:\n\
             {opening}\n<dialogue>\n\n{transitions}{sep}{closing}\n<dialogue>\n\n\
             SEGMENT SUMMARIES:\n{summaries}",
            show = self.show_name,
            a = a,
            b = b,
            date = date.format("%A, %B %-d, %Y"),
            count = segments.len(),
            opening = OPENING_HEADER,
            transitions = transitions,
            sep = if transitions.is_empty() { "" } else { "\n\n" },
            closing = CLOSING_HEADER,
            summaries = summaries,
        )
    }
}

fn with_article_context(err: PipelineError, article: &Article) -> PipelineError {
    let context = format!("article '{}' ({})", article.title, article.url);
    match err {
        PipelineError::Validation { message } => PipelineError::Validation {
            message: format!("{}: {}", context, message),
        },
        PipelineError::TerminalExternal { service, message } => PipelineError::TerminalExternal {
            service,
            message: format!("{}: {}", context, message),
        },
        other => other,
    }
}
