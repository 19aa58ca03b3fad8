//! Hierarchical narrative memory. Answers one question for the writer loop:
//! what prior context should this section see, within the configured budget?

use crate::cleaning::clean_think_tags;
use crate::config::{ContextConfig, ContextMode};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::LanguageModel;
use crate::prompts::PromptRegistry;
use crate::segments::{SegmentConfig, SegmentExtractor};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// How many recent sections feed the "current chapter" part of the context.
const RECENT_SECTIONS: usize = 3;
/// Sections scanned for entity hints.
const ENTITY_SECTIONS: usize = 2;
const MAX_ENTITY_HINTS: usize = 8;
/// Chapter content longer than this is condensed before summarization.
const SUMMARY_SOURCE_LIMIT: usize = 3_000;
const MICRO_SOURCE_LIMIT: usize = 1_500;

const ENTITY_STOPWORDS: [&str; 26] = [
    "El", "La", "Los", "Las", "Un", "Una", "Unos", "Unas", "En", "Con", "Por", "Para", "Cuando",
    "Donde", "Como", "Pero", "Sin", "Tras", "Durante", "Su", "Sus", "Al", "Del", "Que", "Entre",
    "Mientras",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SectionPosition {
    Start,
    Middle,
    End,
}

impl fmt::Display for SectionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SectionPosition::Start => "inicio",
            SectionPosition::Middle => "medio",
            SectionPosition::End => "final",
        };
        f.write_str(label)
    }
}

/// What the writer receives for one section. Field lengths always sum to at
/// most the configured context budget.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextResponse {
    pub framework: String,
    pub previous_chapters_summary: String,
    pub current_chapter_summary: String,
    pub key_entities: BTreeMap<String, String>,
}

impl ContextResponse {
    pub fn total_chars(&self) -> usize {
        self.framework.chars().count()
            + self.previous_chapters_summary.chars().count()
            + self.current_chapter_summary.chars().count()
    }
}

/// Per-chapter memory. `sections` is working context, not the book text: a
/// micro-summary may replace several entries with one condensed line.
#[derive(Clone, Debug)]
pub struct ChapterRecord {
    pub title: String,
    pub rolling_summary: String,
    pub sections: Vec<String>,
    pub entity_hints: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
    index: usize,
    sections_since_micro: usize,
}

impl ChapterRecord {
    fn new(title: String, rolling_summary: String, index: usize) -> Self {
        Self {
            title,
            rolling_summary,
            sections: Vec::new(),
            entity_hints: BTreeMap::new(),
            last_updated: Utc::now(),
            index,
            sections_since_micro: 0,
        }
    }

    fn accumulated_chars(&self) -> usize {
        self.sections.iter().map(|s| s.chars().count()).sum()
    }
}

pub struct ContextManager<'a> {
    framework: String,
    config: ContextConfig,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    extractor: SegmentExtractor,
    records: BTreeMap<String, ChapterRecord>,
    global_summary: String,
}

impl<'a> ContextManager<'a> {
    pub fn new(
        framework: impl Into<String>,
        config: ContextConfig,
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            framework: framework.into(),
            config,
            prompts,
            sink,
            extractor: SegmentExtractor::new(SegmentConfig::default()),
            records: BTreeMap::new(),
            global_summary: String::new(),
        }
    }

    /// Replaces the extractor used to condense over-long chapters.
    pub fn with_segment_config(mut self, config: SegmentConfig) -> Self {
        self.extractor = SegmentExtractor::new(config);
        self
    }

    pub fn framework(&self) -> &str {
        &self.framework
    }

    pub fn global_summary(&self) -> &str {
        &self.global_summary
    }

    pub fn record(&self, key: &str) -> Option<&ChapterRecord> {
        self.records.get(key)
    }

    /// Idempotent: re-registering an existing chapter never clears its
    /// accumulated sections.
    pub fn register_chapter(
        &mut self,
        key: impl Into<String>,
        title: impl Into<String>,
        initial_summary: impl Into<String>,
    ) {
        let key = key.into();
        if self.records.contains_key(&key) {
            return;
        }
        let index = self.records.len();
        let title = title.into();
        self.log(LogLevel::Info, format!("chapter registered: {title}"));
        self.records
            .insert(key, ChapterRecord::new(title, initial_summary.into(), index));
    }

    /// Appends committed prose to the chapter record. In INTELLIGENT mode a
    /// micro-summary replaces the oldest recent sections once either the
    /// section-count interval or the character ceiling is crossed.
    pub fn append_section(
        &mut self,
        model: Option<&dyn LanguageModel>,
        key: &str,
        section_text: impl Into<String>,
    ) {
        if !self.records.contains_key(key) {
            self.register_chapter(key, format!("Capítulo {key}"), String::new());
        }

        let micro_enabled = self.micro_summaries_enabled();
        let mut micro_due = false;
        if let Some(record) = self.records.get_mut(key) {
            record.sections.push(section_text.into());
            record.sections_since_micro += 1;
            record.last_updated = Utc::now();

            micro_due = micro_enabled
                && (record.sections_since_micro >= self.config.micro_summary_interval
                    || record.accumulated_chars() >= self.config.max_accumulation);
        }

        if micro_due {
            self.create_micro_summary(model, key);
        }
    }

    pub fn get_context_for_section(
        &self,
        chapter_number: usize,
        _position: SectionPosition,
        key: &str,
    ) -> ContextResponse {
        let budget = self.config.max_context_size;

        if self.config.mode == ContextMode::Simple {
            return ContextResponse {
                framework: truncate_chars(&self.framework, budget),
                ..ContextResponse::default()
            };
        }

        let framework = truncate_chars(&self.framework, budget);
        let mut used = framework.chars().count();

        let current_index = self
            .records
            .get(key)
            .map(|record| record.index)
            .unwrap_or_else(|| chapter_number.saturating_sub(1));
        let mut previous = String::new();

        // Newest chapters first; the oldest entry that no longer fits is the
        // one that gets truncated away.
        let mut prior: Vec<&ChapterRecord> = self
            .records
            .values()
            .filter(|record| record.index < current_index)
            .collect();
        prior.sort_by(|a, b| b.index.cmp(&a.index));

        for record in prior {
            if record.rolling_summary.trim().is_empty() {
                continue;
            }
            let entry = if record.title.is_empty() {
                record.rolling_summary.clone()
            } else {
                format!("{}: {}", record.title, record.rolling_summary)
            };
            let separator = usize::from(!previous.is_empty());
            let available = budget.saturating_sub(used + separator);
            if available == 0 {
                break;
            }

            let entry_len = entry.chars().count();
            if !previous.is_empty() {
                previous.push(' ');
                used += 1;
            }
            if entry_len <= available {
                previous.push_str(&entry);
                used += entry_len;
            } else {
                previous.push_str(&truncate_chars(&entry, available));
                used += available;
                break;
            }
        }

        let mut current = String::new();
        let mut entities = BTreeMap::new();
        if let Some(record) = self.records.get(key) {
            let from = record.sections.len().saturating_sub(RECENT_SECTIONS);
            let recent = record.sections[from..].join("\n\n");
            let remaining = budget.saturating_sub(used);
            current = tail_chars(&recent, remaining);
            entities = extract_entity_hints(&record.sections);
        }

        ContextResponse {
            framework,
            previous_chapters_summary: previous,
            current_chapter_summary: current,
            key_entities: entities,
        }
    }

    /// Condenses the finished chapter into its rolling summary and returns it.
    /// Never fails: a model error degrades to a deterministic extract.
    pub fn finalize_chapter(&mut self, model: Option<&dyn LanguageModel>, key: &str) -> String {
        let total_chapters = self.records.len();
        let Some(record) = self.records.get(key) else {
            return fallback_summary("(capítulo desconocido)", 0);
        };
        let chapter_number = record.index + 1;
        let title = record.title.clone();

        if record.sections.is_empty() {
            let summary = fallback_summary(&title, chapter_number);
            self.store_summary(key, summary.clone());
            return summary;
        }

        let full_content = record.sections.join("\n\n");
        let condensed = if full_content.chars().count() > SUMMARY_SOURCE_LIMIT {
            self.extractor.extract_with(&full_content, 3, 1_000)
        } else {
            full_content
        };

        let summary = match model {
            Some(model) => {
                match self.invoke_summary_prompt(model, &title, chapter_number, total_chapters, &condensed)
                {
                    Ok(summary) if summary.chars().count() >= 30 => summary,
                    Ok(_) => fallback_summary(&title, chapter_number),
                    Err(error) => {
                        self.log(
                            LogLevel::Warn,
                            format!("chapter summary failed, using extract: {error}"),
                        );
                        extractive_summary(&condensed)
                    }
                }
            }
            None => extractive_summary(&condensed),
        };

        let summary = truncate_chars(&summary, 500);
        self.store_summary(key, summary.clone());
        self.refresh_global_summary(model);
        summary
    }

    fn micro_summaries_enabled(&self) -> bool {
        self.config.mode == ContextMode::Intelligent || self.config.enable_micro_summaries
    }

    fn create_micro_summary(&mut self, model: Option<&dyn LanguageModel>, key: &str) {
        let interval = self.config.micro_summary_interval;
        let (combined, keep_last) = {
            let Some(record) = self.records.get(key) else {
                return;
            };
            if record.sections.len() < 2 {
                return;
            }
            let from = record.sections.len().saturating_sub(interval);
            let combined = record.sections[from..].join("\n\n");
            let keep_last = record
                .sections
                .last()
                .cloned()
                .unwrap_or_default();
            (combined, keep_last)
        };

        self.log(LogLevel::Info, "creating micro-summary to keep context small");

        let summary = match model {
            Some(model) => {
                let prompt = self.prompts.format_with(
                    "micro_summary",
                    [("combined_text", truncate_chars(&combined, MICRO_SOURCE_LIMIT))],
                );
                match prompt {
                    Ok(prompt) => match model.invoke(&prompt) {
                        Ok(response) => {
                            let cleaned = clean_think_tags(&response);
                            if cleaned.chars().count() > 20 {
                                cleaned
                            } else {
                                extractive_summary(&combined)
                            }
                        }
                        Err(error) => {
                            self.log(
                                LogLevel::Warn,
                                format!("micro-summary failed, using extract: {error}"),
                            );
                            extractive_summary(&combined)
                        }
                    },
                    Err(error) => {
                        self.log(LogLevel::Warn, format!("micro-summary prompt error: {error}"));
                        extractive_summary(&combined)
                    }
                }
            }
            None => extractive_summary(&combined),
        };

        if let Some(record) = self.records.get_mut(key) {
            let from = record.sections.len().saturating_sub(interval);
            record.sections.truncate(from);
            record
                .sections
                .push(format!("[Resumen de secciones anteriores: {summary}]"));
            record.sections.push(keep_last);
            record.sections_since_micro = 0;
            record.last_updated = Utc::now();
        }
    }

    fn invoke_summary_prompt(
        &self,
        model: &dyn LanguageModel,
        title: &str,
        chapter_number: usize,
        total_chapters: usize,
        content: &str,
    ) -> Result<String, crate::model::LanguageModelError> {
        let prompt = self
            .prompts
            .format_with(
                "chapter_summary",
                [
                    ("chapter", title.to_string()),
                    ("chapter_number", chapter_number.to_string()),
                    ("total_chapters", total_chapters.to_string()),
                    ("content", content.to_string()),
                ],
            )
            .map_err(crate::model::LanguageModelError::new)?;
        let response = model.invoke(&prompt)?;
        Ok(clean_think_tags(&response))
    }

    fn store_summary(&mut self, key: &str, summary: String) {
        if let Some(record) = self.records.get_mut(key) {
            record.rolling_summary = summary;
            record.sections_since_micro = 0;
            record.last_updated = Utc::now();
        }
    }

    // Keeps a condensed running synopsis across all finished chapters; used
    // by callers that need one string instead of per-chapter summaries.
    fn refresh_global_summary(&mut self, model: Option<&dyn LanguageModel>) {
        let mut ordered: Vec<&ChapterRecord> = self
            .records
            .values()
            .filter(|r| !r.rolling_summary.trim().is_empty())
            .collect();
        if ordered.len() < 2 {
            return;
        }
        ordered.sort_by_key(|r| r.index);

        let combined = ordered
            .iter()
            .map(|r| format!("{}: {}", r.title, truncate_chars(&r.rolling_summary, 100)))
            .collect::<Vec<_>>()
            .join(" | ");

        if combined.chars().count() <= 800 {
            self.global_summary = combined;
            return;
        }

        if let Some(model) = model {
            if let Ok(prompt) = self
                .prompts
                .format_with("condense_global", [("combined", combined.clone())])
            {
                if let Ok(response) = model.invoke(&prompt) {
                    let condensed = clean_think_tags(&response);
                    if condensed.chars().count() > 50 {
                        self.global_summary = truncate_chars(&condensed, 400);
                        return;
                    }
                }
            }
        }
        self.global_summary = truncate_chars(&combined, 800);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn fallback_summary(title: &str, chapter_number: usize) -> String {
    format!("Capítulo {chapter_number} ({title}): La historia continúa desarrollándose.")
}

/// First and last paragraph of the content; the deterministic degradation
/// path when no model is available or the summary call fails.
fn extractive_summary(content: &str) -> String {
    let paragraphs: Vec<&str> = content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match paragraphs.as_slice() {
        [] => String::new(),
        [only] => truncate_chars(only, 400),
        [first, .., last] => {
            let combined = format!("{first} … {last}");
            truncate_chars(&combined, 400)
        }
    }
}

fn extract_entity_hints(sections: &[String]) -> BTreeMap<String, String> {
    let mut hints = BTreeMap::new();
    let from = sections.len().saturating_sub(ENTITY_SECTIONS);

    for section in &sections[from..] {
        for word in section.split_whitespace() {
            let token: String = word
                .trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_string();
            if token.chars().count() <= 2 {
                continue;
            }
            let starts_upper = token
                .chars()
                .next()
                .map(char::is_uppercase)
                .unwrap_or(false);
            if !starts_upper || ENTITY_STOPWORDS.contains(&token.as_str()) {
                continue;
            }
            if hints.len() >= MAX_ENTITY_HINTS && !hints.contains_key(&token) {
                continue;
            }
            hints
                .entry(token)
                .or_insert_with(|| "mencionado en las últimas secciones".to_string());
        }
    }

    hints
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((index, _)) => text[index..].to_string(),
        None => String::new(),
    }
}
