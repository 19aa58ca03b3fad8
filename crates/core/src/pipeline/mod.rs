//! End-to-end orchestration: structure, ideas, prose, document. A run walks
//! the status machine linearly; any failure lands in ERROR with the message
//! attached, and a failed run leaves no output file behind.

use crate::cleaning::TextCleaner;
use crate::config::AppConfig;
use crate::context::ContextManager;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::LanguageModel;
use crate::ordering::sort_chapters;
use crate::plan::{PlanError, PlanRequest, PlanService};
use crate::prompts::PromptRegistry;
use crate::state::{GenerationStatus, StateError, StateManager, StatePatch};
use crate::writer::{BookText, WriteBookRequest, WriterError, WriterService};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to create output directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write document `{path}`: {source}")]
    WriteFile { path: PathBuf, source: io::Error },
}

/// Incoming request from the outer layer (CLI or HTTP façade).
#[derive(Clone, Debug)]
pub struct BookRequest {
    pub subject: String,
    pub profile: String,
    pub style: String,
    pub genre: String,
    pub output_format: String,
    pub output_dir: PathBuf,
}

impl BookRequest {
    pub fn from_config(config: &AppConfig) -> Self {
        let generation = &config.generation;
        Self {
            subject: generation.default_subject.clone(),
            profile: generation.default_profile.clone(),
            style: generation.default_style.clone(),
            genre: generation.default_genre.clone(),
            output_format: generation.output_format.clone(),
            output_dir: PathBuf::from(&generation.output_directory),
        }
    }
}

/// Final result handed back to the caller on COMPLETE.
#[derive(Clone, Debug)]
pub struct BookArtifact {
    pub title: String,
    pub book: BookText,
    pub path: PathBuf,
    pub ordering_warnings: Vec<String>,
}

pub struct BookPipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    config: &'a AppConfig,
}

impl<'a> BookPipeline<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, config: &'a AppConfig) -> Self {
        Self {
            prompts,
            sink,
            config,
        }
    }

    /// Runs the full pipeline. On error the state machine is moved to ERROR
    /// with the originating message before the error is returned.
    pub fn run<M: LanguageModel>(
        &self,
        model: &M,
        states: &StateManager,
        request: &BookRequest,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> Result<BookArtifact, PipelineError> {
        match self.run_inner(model, states, request, cancel_flag) {
            Ok(artifact) => Ok(artifact),
            Err(error) => {
                // Best effort: a failed status update here must not mask the
                // original error.
                let _ = states.update(
                    StatePatch::new()
                        .status(GenerationStatus::Error)
                        .error(error.to_string()),
                );
                Err(error)
            }
        }
    }

    fn run_inner<M: LanguageModel>(
        &self,
        model: &M,
        states: &StateManager,
        request: &BookRequest,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> Result<BookArtifact, PipelineError> {
        states.update(
            StatePatch::new()
                .status(GenerationStatus::Starting)
                .current_step("iniciando generación")
                .progress(0)
                .output_format(request.output_format.clone()),
        )?;
        states.update(
            StatePatch::new()
                .status(GenerationStatus::ConfiguringModel)
                .current_step("configurando modelo"),
        )?;

        let plan_request = PlanRequest {
            subject: request.subject.clone(),
            genre: request.genre.clone(),
            style: request.style.clone(),
            profile: request.profile.clone(),
        };
        let plan = PlanService::new(self.prompts, self.sink);

        states.update(
            StatePatch::new()
                .status(GenerationStatus::GeneratingStructure)
                .current_step("generando estructura"),
        )?;
        let title = plan.generate_title(model, &plan_request)?;
        let framework = plan.generate_framework(model, &plan_request, &title)?;
        let chapters = plan.generate_chapters(model, &plan_request, &title, &framework)?;
        let descriptions: BTreeMap<String, String> = chapters.iter().cloned().collect();

        states.update(
            StatePatch::new()
                .status(GenerationStatus::StructureComplete)
                .title(title.clone())
                .chapter_count(chapters.len() as u32)
                .progress(10),
        )?;

        let ordered = sort_chapters(chapters.iter().map(|(key, _)| key.as_str()));
        for warning in &ordered.warnings {
            self.log(LogLevel::Warn, format!("chapter ordering: {warning}"));
        }

        states.update(
            StatePatch::new()
                .status(GenerationStatus::GeneratingIdeas)
                .current_step("generando ideas por capítulo"),
        )?;

        let mut context =
            ContextManager::new(framework.clone(), self.config.context.clone(), self.prompts, self.sink)
                .with_segment_config(self.config.segments);
        let mut ideas: Vec<(String, Vec<String>)> = Vec::with_capacity(ordered.keys.len());

        for key in &ordered.keys {
            let description = descriptions.get(key).cloned().unwrap_or_default();
            context.register_chapter(key.clone(), key.clone(), description.clone());
            let chapter_ideas = plan.generate_ideas(
                model,
                &plan_request,
                &title,
                &framework,
                key,
                &description,
                &ideas,
            )?;
            ideas.push((key.clone(), chapter_ideas));
        }

        states.update(
            StatePatch::new()
                .status(GenerationStatus::IdeasComplete)
                .progress(20),
        )?;
        states.update(
            StatePatch::new()
                .status(GenerationStatus::WritingBook)
                .current_step("escribiendo el libro"),
        )?;

        let writer = WriterService::new(self.prompts, self.sink);
        let write_request = WriteBookRequest {
            genre: &request.genre,
            style: &request.style,
            title: &title,
            ideas: &ideas,
            min_section_length: self.config.generation.min_section_length,
            cancel_flag,
        };
        let book = writer.write_book(model, &mut context, states, &write_request)?;

        states.update(
            StatePatch::new()
                .status(GenerationStatus::WritingComplete)
                .current_step("escritura finalizada")
                .progress(99),
        )?;
        states.update(
            StatePatch::new()
                .status(GenerationStatus::SavingDocument)
                .current_step("guardando documento"),
        )?;

        let path = self.save_document(&request.output_dir, &title, &book)?;
        self.log(
            LogLevel::Info,
            format!("document saved at {}", path.display()),
        );

        states.update(
            StatePatch::new()
                .status(GenerationStatus::Complete)
                .book_ready(true)
                .file_path(path.display().to_string())
                .progress(100),
        )?;

        Ok(BookArtifact {
            title,
            book,
            path,
            ordering_warnings: ordered.warnings,
        })
    }

    fn save_document(
        &self,
        output_dir: &Path,
        title: &str,
        book: &BookText,
    ) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(output_dir).map_err(|source| PipelineError::CreateDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let path = output_dir.join(format!("{}.txt", slugify(title)));
        let contents = format!("{title}\n\n{book}");
        let contents = TextCleaner::new().clean_lines_starting_with(
            &contents,
            &["Nota:", "Resumen:", "Contexto:", "RESUMEN", "IMPORTANTE:"],
        );
        fs::write(&path, contents).map_err(|source| PipelineError::WriteFile {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        let mapped = match ch {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' | 'ü' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other,
        };
        if mapped.is_ascii_alphanumeric() {
            slug.push(mapped.to_ascii_lowercase());
        } else if (mapped.is_whitespace() || mapped == '-' || mapped == '_')
            && !slug.ends_with('_')
        {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "libro".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::model::LanguageModelError;
    use std::io;
    use tempfile::tempdir;

    struct FailingModel;

    impl LanguageModel for FailingModel {
        fn invoke(&self, _prompt: &str) -> Result<String, LanguageModelError> {
            Err(LanguageModelError::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no provider listening",
            )))
        }
    }

    #[test]
    fn failed_run_lands_in_error_and_writes_nothing() {
        let prompts = PromptRegistry::new().expect("prompts");
        let sink = VecLogSink::new();
        let config = AppConfig::default();
        let states = StateManager::default();
        let output = tempdir().expect("tempdir");

        let request = BookRequest {
            subject: "tema".to_string(),
            profile: "perfil".to_string(),
            style: "estilo".to_string(),
            genre: "género".to_string(),
            output_format: "txt".to_string(),
            output_dir: output.path().to_path_buf(),
        };

        let pipeline = BookPipeline::new(&prompts, &sink, &config);
        let result = pipeline.run(&FailingModel, &states, &request, None);

        assert!(result.is_err());
        assert_eq!(states.current_status(), GenerationStatus::Error);
        assert!(states.state().error.is_some());
        let leftovers: Vec<_> = fs::read_dir(output.path())
            .expect("read dir")
            .collect();
        assert!(leftovers.is_empty(), "failed run must not persist output");
    }

    #[test]
    fn slugify_normalizes_titles() {
        assert_eq!(slugify("Mar de Niebla"), "mar_de_niebla");
        assert_eq!(slugify("  ¡Canción del Río!  "), "cancion_del_rio");
        assert_eq!(slugify("???"), "libro");
    }

    #[test]
    fn request_defaults_come_from_config() {
        let config = AppConfig::default();
        let request = BookRequest::from_config(&config);
        assert_eq!(request.genre, config.generation.default_genre);
        assert_eq!(request.output_format, "txt");
    }
}
