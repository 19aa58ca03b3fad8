//! Per-section prose generation: the core loop of the pipeline. Iterates the
//! ordered chapters and their idea lists, consulting the context manager
//! before every model call and committing each section before the next one.

use crate::cleaning::{CleaningStage, TextCleaner};
use crate::context::{ContextManager, SectionPosition};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{LanguageModel, LanguageModelError};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::state::{GenerationStatus, StateError, StateManager, StatePatch};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to render writer prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("language model invocation failed for {chapter}: {source}")]
    Model {
        chapter: String,
        #[source]
        source: LanguageModelError,
    },
    #[error("{chapter} produced no usable prose after a retry")]
    EmptySection { chapter: String },
    #[error("cancellation requested, stopping before the next section")]
    Cancelled,
    #[error(transparent)]
    State(#[from] StateError),
}

/// Everything the writer loop needs besides the collaborating services.
pub struct WriteBookRequest<'a> {
    pub genre: &'a str,
    pub style: &'a str,
    pub title: &'a str,
    /// Chapters in canonical order with their 3-5 ideas each.
    pub ideas: &'a [(String, Vec<String>)],
    pub min_section_length: usize,
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

/// Accumulated book text, chapter key -> ordered section prose.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BookText {
    pub chapters: Vec<(String, Vec<String>)>,
}

impl BookText {
    pub fn total_sections(&self) -> usize {
        self.chapters.iter().map(|(_, sections)| sections.len()).sum()
    }

    pub fn chapter(&self, key: &str) -> Option<&[String]> {
        self.chapters
            .iter()
            .find(|(chapter, _)| chapter == key)
            .map(|(_, sections)| sections.as_slice())
    }
}

impl fmt::Display for BookText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (chapter, sections)) in self.chapters.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{chapter}")?;
            writeln!(f)?;
            for section in sections {
                writeln!(f, "{section}")?;
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

pub struct WriterService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    cleaner: TextCleaner,
}

impl<'a> WriterService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            sink,
            cleaner: TextCleaner::new(),
        }
    }

    /// Writes every chapter in order. Section N is committed to the context
    /// manager before section N+1 is requested; a chapter is finalized before
    /// the next one begins.
    pub fn write_book<M: LanguageModel>(
        &self,
        model: &M,
        context: &mut ContextManager<'_>,
        states: &StateManager,
        request: &WriteBookRequest<'_>,
    ) -> Result<BookText, WriterError> {
        let total_chapters = request.ideas.len();
        let total_sections: usize = request
            .ideas
            .iter()
            .map(|(_, ideas)| ideas.len())
            .sum::<usize>()
            .max(1);
        let mut sections_done = 0usize;
        let mut book = BookText::default();

        for (chapter_index, (chapter_key, idea_list)) in request.ideas.iter().enumerate() {
            self.log(
                LogLevel::Info,
                format!(
                    "writing chapter {}/{total_chapters}: {chapter_key}",
                    chapter_index + 1
                ),
            );
            let mut chapter_sections = Vec::with_capacity(idea_list.len());

            for (idea_index, idea) in idea_list.iter().enumerate() {
                if let Some(flag) = &request.cancel_flag {
                    if flag.load(Ordering::Relaxed) {
                        return Err(WriterError::Cancelled);
                    }
                }

                let position = if idea_index == 0 {
                    SectionPosition::Start
                } else if idea_index + 1 == idea_list.len() {
                    SectionPosition::End
                } else {
                    SectionPosition::Middle
                };

                let section = self.write_section(
                    model,
                    context,
                    request,
                    chapter_key,
                    idea,
                    chapter_index,
                    total_chapters,
                    idea_index,
                    idea_list.len(),
                    position,
                )?;

                context.append_section(Some(model), chapter_key, section.clone());
                chapter_sections.push(section);

                sections_done += 1;
                let progress = ((sections_done * 100) / total_sections).min(99) as u8;
                states.update(
                    StatePatch::new()
                        .progress(progress)
                        .current_chapter(chapter_index as u32 + 1)
                        .current_step(format!(
                            "{chapter_key} · sección {}/{}",
                            idea_index + 1,
                            idea_list.len()
                        )),
                )?;
            }

            let summary = context.finalize_chapter(Some(model), chapter_key);
            self.log(
                LogLevel::Info,
                format!("chapter finalized: {chapter_key} ({} chars of summary)", summary.len()),
            );
            book.chapters.push((chapter_key.clone(), chapter_sections));

            states.update(
                StatePatch::new()
                    .status(GenerationStatus::ChapterComplete)
                    .current_chapter(chapter_index as u32 + 1),
            )?;
            if chapter_index + 1 < total_chapters {
                states.update(StatePatch::new().status(GenerationStatus::WritingBook))?;
            }
        }

        Ok(book)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_section<M: LanguageModel>(
        &self,
        model: &M,
        context: &ContextManager<'_>,
        request: &WriteBookRequest<'_>,
        chapter_key: &str,
        idea: &str,
        chapter_index: usize,
        total_chapters: usize,
        idea_index: usize,
        total_sections: usize,
        position: SectionPosition,
    ) -> Result<String, WriterError> {
        let ctx = context.get_context_for_section(chapter_index + 1, position, chapter_key);
        let entities = ctx
            .key_entities
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");

        let mut arguments = PromptArguments::new();
        arguments.insert("genre".into(), request.genre.to_string());
        arguments.insert("style".into(), request.style.to_string());
        arguments.insert("title".into(), request.title.to_string());
        arguments.insert("chapter".into(), chapter_key.to_string());
        arguments.insert("chapter_number".into(), (chapter_index + 1).to_string());
        arguments.insert("total_chapters".into(), total_chapters.to_string());
        arguments.insert("section_number".into(), (idea_index + 1).to_string());
        arguments.insert("total_sections".into(), total_sections.to_string());
        arguments.insert("position".into(), position.to_string());
        arguments.insert("framework".into(), ctx.framework);
        arguments.insert("previous_summary".into(), ctx.previous_chapters_summary);
        arguments.insert("recent_content".into(), ctx.current_chapter_summary);
        arguments.insert("key_entities".into(), entities);
        arguments.insert("current_idea".into(), idea.to_string());

        let prompt = self.prompts.format("write_section", &arguments)?;

        let raw = model
            .invoke(&prompt)
            .map_err(|source| WriterError::Model {
                chapter: chapter_key.to_string(),
                source,
            })?;
        let mut section = self.clean(&raw);

        // A response that was nothing but a think block reads as transient:
        // the model reasoned and forgot to answer. One forced retry.
        if section.is_empty() && raw.contains("<think>") {
            self.log(
                LogLevel::Warn,
                format!("{chapter_key}: response was reasoning only, retrying"),
            );
            let raw = model
                .invoke(&prompt)
                .map_err(|source| WriterError::Model {
                    chapter: chapter_key.to_string(),
                    source,
                })?;
            section = self.clean(&raw);
        }

        // Empty answer: one retry with the simplified prompt before giving up.
        if section.is_empty() {
            self.log(
                LogLevel::Warn,
                format!("{chapter_key}: empty section, retrying with simplified prompt"),
            );
            let simple = self.prompts.format_with(
                "write_section_simple",
                [
                    ("chapter", chapter_key),
                    ("title", request.title),
                    ("current_idea", idea),
                ],
            )?;
            let raw = model
                .invoke(&simple)
                .map_err(|source| WriterError::Model {
                    chapter: chapter_key.to_string(),
                    source,
                })?;
            section = self.clean(&raw);
        }

        if section.is_empty() {
            return Err(WriterError::EmptySection {
                chapter: chapter_key.to_string(),
            });
        }

        if section.chars().count() < request.min_section_length {
            self.log(
                LogLevel::Warn,
                format!(
                    "{chapter_key}: section {} is short ({} chars), accepting",
                    idea_index + 1,
                    section.chars().count()
                ),
            );
        }

        Ok(section)
    }

    fn clean(&self, raw: &str) -> String {
        self.cleaner.clean(
            raw,
            &[
                CleaningStage::AnsiCodes,
                CleaningStage::ThinkTags,
                CleaningStage::Whitespace,
            ],
        )
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}
