//! Structure chains: title, framework, chapter list and per-chapter ideas.
//! Each is one templated model call plus a deterministic parser; a parse
//! failure earns exactly one stricter retry before surfacing as malformed.

use crate::cleaning::clean_think_tags;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{LanguageModel, LanguageModelError};
use crate::prompts::{PromptError, PromptRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

const STRICT_LIST_REMINDER: &str =
    "\n\nIMPORTANTE: Devuelve SOLO la lista pedida, un elemento por línea, sin numeración ni prefijos.";

const MAX_IDEAS: usize = 5;
const MIN_IDEAS: usize = 3;

static LIST_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-•*]|\d+[.)])\s*").expect("list-prefix pattern must compile")
});

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlanStage {
    Title,
    Framework,
    Chapters,
    Ideas,
}

impl fmt::Display for PlanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanStage::Title => "title",
            PlanStage::Framework => "framework",
            PlanStage::Chapters => "chapter list",
            PlanStage::Ideas => "chapter ideas",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to render {stage} prompt: {source}")]
    Prompt {
        stage: PlanStage,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for {stage}: {source}")]
    Model {
        stage: PlanStage,
        #[source]
        source: LanguageModelError,
    },
    #[error("{stage} response could not be parsed: {reason}")]
    MalformedResponse { stage: PlanStage, reason: String },
}

/// Inputs shared by every structure chain.
#[derive(Clone, Debug, Default)]
pub struct PlanRequest {
    pub subject: String,
    pub genre: String,
    pub style: String,
    pub profile: String,
}

pub struct PlanService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> PlanService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Single-line book title.
    pub fn generate_title<M: LanguageModel>(
        &self,
        model: &M,
        request: &PlanRequest,
    ) -> Result<String, PlanError> {
        self.log(LogLevel::Info, "generating title");
        let prompt = self
            .prompts
            .format_with(
                "book_title",
                [
                    ("subject", request.subject.trim()),
                    ("genre", request.genre.trim()),
                    ("style", request.style.trim()),
                    ("profile", request.profile.trim()),
                ],
            )
            .map_err(|source| PlanError::Prompt {
                stage: PlanStage::Title,
                source,
            })?;

        let response = self.invoke(model, PlanStage::Title, &prompt)?;
        let title = response
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_matches(&['"', '«', '»', '*'][..]).trim().to_string())
            .unwrap_or_default();

        if title.is_empty() {
            return Err(PlanError::MalformedResponse {
                stage: PlanStage::Title,
                reason: "empty title response".to_string(),
            });
        }

        self.log(LogLevel::Info, format!("title: {title}"));
        Ok(title)
    }

    /// Multi-paragraph narrative framework; immutable once produced.
    pub fn generate_framework<M: LanguageModel>(
        &self,
        model: &M,
        request: &PlanRequest,
        title: &str,
    ) -> Result<String, PlanError> {
        self.log(LogLevel::Info, "generating narrative framework");
        let prompt = self
            .prompts
            .format_with(
                "book_framework",
                [
                    ("subject", request.subject.trim()),
                    ("genre", request.genre.trim()),
                    ("style", request.style.trim()),
                    ("profile", request.profile.trim()),
                    ("title", title),
                ],
            )
            .map_err(|source| PlanError::Prompt {
                stage: PlanStage::Framework,
                source,
            })?;

        let framework = self.invoke(model, PlanStage::Framework, &prompt)?;
        if framework.trim().is_empty() {
            return Err(PlanError::MalformedResponse {
                stage: PlanStage::Framework,
                reason: "empty framework response".to_string(),
            });
        }
        Ok(framework)
    }

    /// Ordered `label -> description` pairs, parsed line by line. Order is
    /// the model's; canonical ordering is the caller's concern.
    pub fn generate_chapters<M: LanguageModel>(
        &self,
        model: &M,
        request: &PlanRequest,
        title: &str,
        framework: &str,
    ) -> Result<Vec<(String, String)>, PlanError> {
        self.log(LogLevel::Info, "generating chapter list");
        let prompt = self
            .prompts
            .format_with(
                "chapter_list",
                [
                    ("subject", request.subject.trim()),
                    ("genre", request.genre.trim()),
                    ("style", request.style.trim()),
                    ("profile", request.profile.trim()),
                    ("title", title),
                    ("framework", framework),
                ],
            )
            .map_err(|source| PlanError::Prompt {
                stage: PlanStage::Chapters,
                source,
            })?;

        let response = self.invoke(model, PlanStage::Chapters, &prompt)?;
        let chapters = parse_chapter_lines(&response);
        if !chapters.is_empty() {
            return Ok(chapters);
        }

        self.log(
            LogLevel::Warn,
            "chapter list unparsable, retrying with a stricter reminder",
        );
        let strict = format!("{prompt}{STRICT_LIST_REMINDER}");
        let response = self.invoke(model, PlanStage::Chapters, &strict)?;
        let chapters = parse_chapter_lines(&response);
        if chapters.is_empty() {
            return Err(PlanError::MalformedResponse {
                stage: PlanStage::Chapters,
                reason: "no `label: description` lines found".to_string(),
            });
        }
        Ok(chapters)
    }

    /// 3-5 ordered ideas for one chapter; order seeds section order.
    pub fn generate_ideas<M: LanguageModel>(
        &self,
        model: &M,
        request: &PlanRequest,
        title: &str,
        framework: &str,
        chapter: &str,
        description: &str,
        previous_ideas: &[(String, Vec<String>)],
    ) -> Result<Vec<String>, PlanError> {
        self.log(LogLevel::Info, format!("generating ideas for {chapter}"));
        let previous = previous_ideas
            .iter()
            .map(|(chapter, ideas)| {
                let lines = ideas
                    .iter()
                    .map(|idea| format!("- {}", clean_think_tags(idea)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{chapter}:\n{lines}")
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = self
            .prompts
            .format_with(
                "chapter_ideas",
                [
                    ("genre", request.genre.trim()),
                    ("style", request.style.trim()),
                    ("title", title),
                    ("framework", framework),
                    ("chapter", chapter),
                    ("description", description),
                    ("previous_ideas", previous.as_str()),
                ],
            )
            .map_err(|source| PlanError::Prompt {
                stage: PlanStage::Ideas,
                source,
            })?;

        let response = self.invoke(model, PlanStage::Ideas, &prompt)?;
        let mut ideas = parse_list_items(&response);

        if ideas.is_empty() {
            self.log(
                LogLevel::Warn,
                format!("no ideas parsed for {chapter}, retrying with a stricter reminder"),
            );
            let strict = format!("{prompt}{STRICT_LIST_REMINDER}");
            let response = self.invoke(model, PlanStage::Ideas, &strict)?;
            ideas = parse_list_items(&response);
        }

        if ideas.is_empty() {
            return Err(PlanError::MalformedResponse {
                stage: PlanStage::Ideas,
                reason: format!("no idea lines found for {chapter}"),
            });
        }

        if ideas.len() < MIN_IDEAS {
            self.log(
                LogLevel::Warn,
                format!("only {} ideas for {chapter}, continuing", ideas.len()),
            );
        }
        ideas.truncate(MAX_IDEAS);
        Ok(ideas)
    }

    fn invoke<M: LanguageModel>(
        &self,
        model: &M,
        stage: PlanStage,
        prompt: &str,
    ) -> Result<String, PlanError> {
        let response = model
            .invoke(prompt)
            .map_err(|source| PlanError::Model { stage, source })?;
        Ok(clean_think_tags(&response))
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// Lines shaped `label: description`; list prefixes are tolerated and the
/// label side keeps its original casing.
fn parse_chapter_lines(response: &str) -> Vec<(String, String)> {
    response
        .lines()
        .filter_map(|line| {
            let line = LIST_PREFIX.replace(line.trim(), "");
            let (label, description) = line.split_once(':')?;
            let label = label.trim();
            let description = description.trim();
            if label.is_empty() || label.chars().count() > 80 {
                return None;
            }
            Some((label.to_string(), description.to_string()))
        })
        .collect()
}

fn parse_list_items(response: &str) -> Vec<String> {
    response
        .lines()
        .map(|line| LIST_PREFIX.replace(line.trim(), "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
