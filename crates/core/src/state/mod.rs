//! Immutable workflow state with validated transitions and observer fan-out.
//!
//! Every mutation produces a fresh `GenerationState`; the manager is the only
//! writer and swaps the held value under a mutex. Observers run outside the
//! lock so a slow emitter can never stall a concurrent reader.

use crate::logging::{LogLevel, LogRecord, LogSink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Idle,
    Starting,
    ConfiguringModel,
    GeneratingStructure,
    StructureComplete,
    GeneratingIdeas,
    IdeasComplete,
    WritingBook,
    ChapterComplete,
    WritingComplete,
    SavingDocument,
    Complete,
    Error,
}

impl GenerationStatus {
    /// Legal transitions. The workflow is mostly linear; ERROR is reachable
    /// from every non-terminal state and COMPLETE only from SAVING_DOCUMENT.
    pub fn can_transition_to(self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        let allowed: &[GenerationStatus] = match self {
            Idle => &[Starting],
            Starting => &[ConfiguringModel, Error],
            ConfiguringModel => &[GeneratingStructure, Error],
            GeneratingStructure => &[StructureComplete, Error],
            StructureComplete => &[GeneratingIdeas, Error],
            GeneratingIdeas => &[IdeasComplete, Error],
            IdeasComplete => &[WritingBook, Error],
            WritingBook => &[ChapterComplete, WritingComplete, Error],
            ChapterComplete => &[WritingBook, WritingComplete, Error],
            WritingComplete => &[SavingDocument, Error],
            SavingDocument => &[Complete, Error],
            Complete => &[Idle],
            Error => &[Idle],
        };
        allowed.contains(&next)
    }
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        use GenerationStatus::*;
        match self {
            Idle => "idle",
            Starting => "starting",
            ConfiguringModel => "configuring_model",
            GeneratingStructure => "generating_structure",
            StructureComplete => "structure_complete",
            GeneratingIdeas => "generating_ideas",
            IdeasComplete => "ideas_complete",
            WritingBook => "writing_book",
            ChapterComplete => "chapter_complete",
            WritingComplete => "writing_complete",
            SavingDocument => "saving_document",
            Complete => "complete",
            Error => "error",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state transition: {from} -> {to}")]
    IllegalTransition {
        from: GenerationStatus,
        to: GenerationStatus,
    },
}

/// Immutable snapshot of the run. Serializes directly into the event schema
/// consumed by external UIs (status, progress, timestamps as ISO-8601).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub title: String,
    pub current_step: String,
    pub progress: u8,
    pub chapter_count: u32,
    pub current_chapter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub book_ready: bool,
    pub file_path: String,
    pub output_format: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            status: GenerationStatus::Idle,
            title: String::new(),
            current_step: String::new(),
            progress: 0,
            chapter_count: 0,
            current_chapter: 0,
            error: None,
            book_ready: false,
            file_path: String::new(),
            output_format: "txt".to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl GenerationState {
    fn apply(&self, patch: StatePatch) -> Self {
        let mut next = self.clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(title) = patch.title {
            next.title = title;
        }
        if let Some(current_step) = patch.current_step {
            next.current_step = current_step;
        }
        if let Some(progress) = patch.progress {
            next.progress = progress.min(100);
        }
        if let Some(chapter_count) = patch.chapter_count {
            next.chapter_count = chapter_count;
        }
        if let Some(current_chapter) = patch.current_chapter {
            next.current_chapter = current_chapter;
        }
        if let Some(error) = patch.error {
            next.error = Some(error);
        }
        if let Some(book_ready) = patch.book_ready {
            next.book_ready = book_ready;
        }
        if let Some(file_path) = patch.file_path {
            next.file_path = file_path;
        }
        if let Some(output_format) = patch.output_format {
            next.output_format = output_format;
        }
        next.timestamp = Utc::now();
        next
    }

    pub fn to_event_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Partial update; unset fields keep their current value.
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    status: Option<GenerationStatus>,
    title: Option<String>,
    current_step: Option<String>,
    progress: Option<u8>,
    chapter_count: Option<u32>,
    current_chapter: Option<u32>,
    error: Option<String>,
    book_ready: Option<bool>,
    file_path: Option<String>,
    output_format: Option<String>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: GenerationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn chapter_count(mut self, count: u32) -> Self {
        self.chapter_count = Some(count);
        self
    }

    pub fn current_chapter(mut self, chapter: u32) -> Self {
        self.current_chapter = Some(chapter);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn book_ready(mut self, ready: bool) -> Self {
        self.book_ready = Some(ready);
        self
    }

    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }
}

pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, old_state: &GenerationState, new_state: &GenerationState);
}

/// Forwards transitions to the progress sink.
pub struct LoggingObserver {
    sink: Arc<dyn LogSink>,
}

impl LoggingObserver {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl StateObserver for LoggingObserver {
    fn on_state_changed(&self, old_state: &GenerationState, new_state: &GenerationState) {
        self.sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "state transition: {} -> {} (progress: {}%)",
                old_state.status, new_state.status, new_state.progress
            ),
        ));
        if let Some(error) = &new_state.error {
            self.sink
                .log(LogRecord::new(LogLevel::Error, format!("state error: {error}")));
        }
    }
}

/// Serializes every new state and hands it to an emit function. The network
/// transport (UI socket) stays outside the core; callers inject the send.
pub struct EventObserver {
    emit: Box<dyn Fn(&str) + Send + Sync>,
}

impl EventObserver {
    pub fn new(emit: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            emit: Box::new(emit),
        }
    }
}

impl StateObserver for EventObserver {
    fn on_state_changed(&self, _old_state: &GenerationState, new_state: &GenerationState) {
        (self.emit)(&new_state.to_event_json());
    }
}

struct ManagerInner {
    state: GenerationState,
    observers: Vec<Arc<dyn StateObserver>>,
    history: Vec<GenerationState>,
}

/// Thread-safe owner of the current state. A request thread may read while
/// the pipeline thread writes; updates are serialized through the mutex and
/// notifications preserve the order of state changes.
pub struct StateManager {
    inner: Mutex<ManagerInner>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(GenerationState::default())
    }
}

impl StateManager {
    pub fn new(initial_state: GenerationState) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                history: vec![initial_state.clone()],
                state: initial_state,
                observers: Vec::new(),
            }),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        let mut inner = self.lock();
        inner.observers.push(observer);
    }

    pub fn state(&self) -> GenerationState {
        self.lock().state.clone()
    }

    pub fn current_status(&self) -> GenerationStatus {
        self.lock().state.status
    }

    pub fn history(&self) -> Vec<GenerationState> {
        self.lock().history.clone()
    }

    /// Applies the patch and notifies observers. A patch that carries a
    /// status must follow the transition table; on violation nothing changes
    /// and nobody is notified.
    pub fn update(&self, patch: StatePatch) -> Result<GenerationState, StateError> {
        let (old_state, new_state, observers) = {
            let mut inner = self.lock();
            if let Some(next_status) = patch.status {
                if !inner.state.status.can_transition_to(next_status) {
                    return Err(StateError::IllegalTransition {
                        from: inner.state.status,
                        to: next_status,
                    });
                }
            }

            let old_state = inner.state.clone();
            let new_state = old_state.apply(patch);
            inner.state = new_state.clone();
            inner.history.push(new_state.clone());
            (old_state, new_state, inner.observers.clone())
        };

        for observer in observers {
            observer.on_state_changed(&old_state, &new_state);
        }

        Ok(new_state)
    }

    /// Unconditional return to IDLE; permitted from any state so an operator
    /// can recover a wedged run.
    pub fn reset(&self) -> GenerationState {
        let (old_state, new_state, observers) = {
            let mut inner = self.lock();
            let old_state = inner.state.clone();
            let new_state = GenerationState::default();
            inner.state = new_state.clone();
            inner.history.push(new_state.clone());
            (old_state, new_state, inner.observers.clone())
        };

        for observer in observers {
            observer.on_state_changed(&old_state, &new_state);
        }

        new_state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        transitions: StdMutex<Vec<(GenerationStatus, GenerationStatus)>>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            Self {
                transitions: StdMutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<(GenerationStatus, GenerationStatus)> {
            self.transitions.lock().expect("mutex").clone()
        }
    }

    impl StateObserver for RecordingObserver {
        fn on_state_changed(&self, old_state: &GenerationState, new_state: &GenerationState) {
            self.transitions
                .lock()
                .expect("mutex")
                .push((old_state.status, new_state.status));
        }
    }

    #[test]
    fn rejects_illegal_transition_without_notifying() {
        let manager = StateManager::default();
        let observer = Arc::new(RecordingObserver::new());
        manager.add_observer(observer.clone());

        let result = manager.update(StatePatch::new().status(GenerationStatus::WritingBook));
        assert!(matches!(
            result,
            Err(StateError::IllegalTransition {
                from: GenerationStatus::Idle,
                to: GenerationStatus::WritingBook,
            })
        ));
        assert_eq!(manager.current_status(), GenerationStatus::Idle);
        assert!(observer.seen().is_empty());
    }

    #[test]
    fn legal_chain_notifies_in_order() {
        let manager = StateManager::default();
        let observer = Arc::new(RecordingObserver::new());
        manager.add_observer(observer.clone());

        for status in [
            GenerationStatus::Starting,
            GenerationStatus::ConfiguringModel,
            GenerationStatus::GeneratingStructure,
        ] {
            manager
                .update(StatePatch::new().status(status))
                .expect("legal transition");
        }

        let seen = observer.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen,
            vec![
                (GenerationStatus::Idle, GenerationStatus::Starting),
                (GenerationStatus::Starting, GenerationStatus::ConfiguringModel),
                (
                    GenerationStatus::ConfiguringModel,
                    GenerationStatus::GeneratingStructure
                ),
            ]
        );
    }

    #[test]
    fn chapter_loop_reenters_writing_book() {
        let manager = StateManager::default();
        for status in [
            GenerationStatus::Starting,
            GenerationStatus::ConfiguringModel,
            GenerationStatus::GeneratingStructure,
            GenerationStatus::StructureComplete,
            GenerationStatus::GeneratingIdeas,
            GenerationStatus::IdeasComplete,
            GenerationStatus::WritingBook,
            GenerationStatus::ChapterComplete,
            GenerationStatus::WritingBook,
            GenerationStatus::WritingComplete,
            GenerationStatus::SavingDocument,
            GenerationStatus::Complete,
        ] {
            manager
                .update(StatePatch::new().status(status))
                .expect("legal transition");
        }
        assert_eq!(manager.current_status(), GenerationStatus::Complete);
    }

    #[test]
    fn complete_is_only_reachable_from_saving_document() {
        use GenerationStatus::*;
        for status in [
            Idle,
            Starting,
            ConfiguringModel,
            GeneratingStructure,
            StructureComplete,
            GeneratingIdeas,
            IdeasComplete,
            WritingBook,
            ChapterComplete,
            WritingComplete,
            Error,
        ] {
            assert!(
                !status.can_transition_to(Complete),
                "{status} must not reach COMPLETE directly"
            );
        }
        assert!(SavingDocument.can_transition_to(Complete));
    }

    #[test]
    fn error_reachable_from_every_non_terminal_state() {
        use GenerationStatus::*;
        for status in [
            Starting,
            ConfiguringModel,
            GeneratingStructure,
            StructureComplete,
            GeneratingIdeas,
            IdeasComplete,
            WritingBook,
            ChapterComplete,
            WritingComplete,
            SavingDocument,
        ] {
            assert!(status.can_transition_to(Error), "{status} must reach ERROR");
        }
    }

    #[test]
    fn updates_without_status_do_not_validate() {
        let manager = StateManager::default();
        let state = manager
            .update(StatePatch::new().progress(250).current_step("warming up"))
            .expect("field-only update");
        assert_eq!(state.progress, 100);
        assert_eq!(state.current_step, "warming up");
        assert_eq!(state.status, GenerationStatus::Idle);
    }

    #[test]
    fn event_json_matches_schema() {
        let manager = StateManager::default();
        manager
            .update(
                StatePatch::new()
                    .status(GenerationStatus::Starting)
                    .title("Mar de Niebla"),
            )
            .expect("update");

        let json = manager.state().to_event_json();
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["status"], "starting");
        assert_eq!(value["title"], "Mar de Niebla");
        assert!(value["timestamp"].as_str().expect("timestamp").contains('T'));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn event_observer_emits_serialized_state() {
        let emitted = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&emitted);
        let manager = StateManager::default();
        manager.add_observer(Arc::new(EventObserver::new(move |event: &str| {
            sink.lock().expect("mutex").push(event.to_string());
        })));

        manager
            .update(StatePatch::new().status(GenerationStatus::Starting))
            .expect("update");

        let events = emitted.lock().expect("mutex");
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("\"status\":\"starting\""));
    }

    #[test]
    fn reset_returns_to_idle_from_anywhere() {
        let manager = StateManager::default();
        manager
            .update(StatePatch::new().status(GenerationStatus::Starting))
            .expect("update");
        manager
            .update(
                StatePatch::new()
                    .status(GenerationStatus::Error)
                    .error("provider exploded"),
            )
            .expect("error transition");

        let state = manager.reset();
        assert_eq!(state.status, GenerationStatus::Idle);
        assert!(state.error.is_none());
        assert!(manager.history().len() >= 4);
    }
}
