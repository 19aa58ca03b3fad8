pub mod cleaning;
pub mod config;
pub mod context;
pub mod logging;
pub mod model;
pub mod ordering;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod segments;
pub mod state;
pub mod streaming;
pub mod writer;

pub use cleaning::{clean_ansi_codes, clean_think_tags, CleaningStage, TextCleaner};
pub use config::{
    AppConfig, BackoffStrategy, ConfigError, ContextConfig, ContextMode, GenerationConfig,
    ProviderSettings, ProvidersConfig, RateLimitConfig, RetryConfig, SamplingConfig,
};
pub use context::{ChapterRecord, ContextManager, ContextResponse, SectionPosition};
pub use logging::{LogLevel, LogRecord, LogSink, NullLogSink, StdoutLogSink, VecLogSink};
pub use model::{LanguageModel, LanguageModelError};
pub use ordering::{parse_chapter_label, sort_chapters, ChapterKind, ChapterLabel, OrderedChapters};
pub use pipeline::{BookArtifact, BookPipeline, BookRequest, PipelineError};
pub use plan::{PlanError, PlanRequest, PlanService, PlanStage};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptTemplate};
pub use segments::{SegmentConfig, SegmentExtractor, SegmentStrategy};
pub use state::{
    EventObserver, GenerationState, GenerationStatus, LoggingObserver, StateError, StateManager,
    StateObserver, StatePatch,
};
pub use streaming::{StreamDelta, StreamSanitizer, StreamState};
pub use writer::{BookText, WriteBookRequest, WriterError, WriterService};
