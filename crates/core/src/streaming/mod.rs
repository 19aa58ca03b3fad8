//! Splits a live token stream into an answer channel and a thought channel.
//!
//! Reasoning models interleave `<think>…</think>` spans with prose, and a
//! streaming transport may cut a tag anywhere, so the split runs character by
//! character: a tag prefix is speculative state held in `pending` and is never
//! emitted on the answer channel until it resolves one way or the other.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Normal,
    PossibleThinkStart,
    InThink,
    PossibleThinkEnd,
}

/// One chunk's worth of classified output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamDelta {
    pub answer: String,
    pub thought: String,
}

impl StreamDelta {
    pub fn is_empty(&self) -> bool {
        self.answer.is_empty() && self.thought.is_empty()
    }
}

type ChannelCallback = Box<dyn FnMut(&str) + Send>;

/// Character-level sanitizer; never fails on content, may be flushed and
/// dropped at any point mid-stream.
#[derive(Default)]
pub struct StreamSanitizer {
    state: StreamState,
    pending: String,
    on_answer: Option<ChannelCallback>,
    on_thought: Option<ChannelCallback>,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState::Normal
    }
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_answer(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_answer = Some(Box::new(callback));
        self
    }

    pub fn on_thought(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_thought = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Content buffered because it could still complete a tag.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Consumes a chunk of arbitrary size and emits every character that can
    /// already be classified. Tag characters themselves are dropped.
    pub fn process_chunk(&mut self, chunk: &str) -> StreamDelta {
        let mut delta = StreamDelta::default();

        for ch in chunk.chars() {
            self.step(ch, &mut delta);
        }

        self.notify(&delta);
        delta
    }

    /// Reclassifies whatever is still ambiguous: a prefix seen while in the
    /// normal channel becomes answer text, one seen inside a think block
    /// becomes thought text.
    pub fn flush(&mut self) -> StreamDelta {
        let mut delta = StreamDelta::default();
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            match self.state {
                StreamState::PossibleThinkStart => {
                    delta.answer.push_str(&pending);
                    self.state = StreamState::Normal;
                }
                StreamState::PossibleThinkEnd => {
                    delta.thought.push_str(&pending);
                    self.state = StreamState::InThink;
                }
                StreamState::Normal | StreamState::InThink => {}
            }
        }

        self.notify(&delta);
        delta
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Normal;
        self.pending.clear();
    }

    fn step(&mut self, ch: char, delta: &mut StreamDelta) {
        match self.state {
            StreamState::Normal => {
                if ch == '<' {
                    self.state = StreamState::PossibleThinkStart;
                    self.pending.push(ch);
                } else {
                    delta.answer.push(ch);
                }
            }
            StreamState::PossibleThinkStart => {
                self.pending.push(ch);
                if self.pending == THINK_OPEN {
                    self.state = StreamState::InThink;
                    self.pending.clear();
                } else if !THINK_OPEN.starts_with(self.pending.as_str()) {
                    // Diverged: everything buffered was ordinary answer text.
                    // The leading `<` is emitted directly so the replay cannot
                    // re-enter speculation on the same character forever.
                    let pending = std::mem::take(&mut self.pending);
                    self.state = StreamState::Normal;
                    let mut chars = pending.chars();
                    if let Some(first) = chars.next() {
                        delta.answer.push(first);
                    }
                    self.replay(chars.as_str(), delta);
                }
            }
            StreamState::InThink => {
                if ch == '<' {
                    self.state = StreamState::PossibleThinkEnd;
                    self.pending.push(ch);
                } else {
                    delta.thought.push(ch);
                }
            }
            StreamState::PossibleThinkEnd => {
                self.pending.push(ch);
                if self.pending == THINK_CLOSE {
                    self.state = StreamState::Normal;
                    self.pending.clear();
                } else if !THINK_CLOSE.starts_with(self.pending.as_str()) {
                    let pending = std::mem::take(&mut self.pending);
                    self.state = StreamState::InThink;
                    let mut chars = pending.chars();
                    if let Some(first) = chars.next() {
                        delta.thought.push(first);
                    }
                    self.replay(chars.as_str(), delta);
                }
            }
        }
    }

    // A diverged buffer may itself contain a `<` that opens a fresh
    // speculative match, so it is replayed through the state machine.
    fn replay(&mut self, text: &str, delta: &mut StreamDelta) {
        for ch in text.chars() {
            self.step(ch, delta);
        }
    }

    fn notify(&mut self, delta: &StreamDelta) {
        if !delta.answer.is_empty() {
            if let Some(callback) = self.on_answer.as_mut() {
                callback(&delta.answer);
            }
        }
        if !delta.thought.is_empty() {
            if let Some(callback) = self.on_thought.as_mut() {
                callback(&delta.thought);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn run_chunks(chunks: &[&str]) -> (String, String) {
        let mut sanitizer = StreamSanitizer::new();
        let mut answer = String::new();
        let mut thought = String::new();
        for chunk in chunks {
            let delta = sanitizer.process_chunk(chunk);
            answer.push_str(&delta.answer);
            thought.push_str(&delta.thought);
        }
        let last = sanitizer.flush();
        answer.push_str(&last.answer);
        thought.push_str(&last.thought);
        (answer, thought)
    }

    #[test]
    fn splits_tag_that_straddles_chunks() {
        let (answer, thought) = run_chunks(&["Hola <thi", "nk>idea</think> mundo"]);
        assert_eq!(answer, "Hola  mundo");
        assert_eq!(thought, "idea");
    }

    #[test]
    fn two_chunk_boundary_inside_open_tag() {
        let (answer, thought) = run_chunks(&["ab<thi", "nk>secret</think>ok"]);
        assert_eq!(answer, "abok");
        assert_eq!(thought, "secret");
    }

    #[test]
    fn diverging_prefix_is_replayed_as_answer() {
        let (answer, thought) = run_chunks(&["a<thirsty> b"]);
        assert_eq!(answer, "a<thirsty> b");
        assert_eq!(thought, "");
    }

    #[test]
    fn diverging_prefix_containing_new_open_bracket() {
        // `<th` diverges on the second `<`, which itself starts a real tag.
        let (answer, thought) = run_chunks(&["x<th<think>t</think>y"]);
        assert_eq!(answer, "x<thy");
        assert_eq!(thought, "t");
    }

    #[test]
    fn close_tag_divergence_stays_on_thought_channel() {
        let (answer, thought) = run_chunks(&["<think>a</thump>b</think>c"]);
        assert_eq!(answer, "c");
        assert_eq!(thought, "a</thump>b");
    }

    #[test]
    fn flush_reclassifies_ambiguous_prefix() {
        let mut sanitizer = StreamSanitizer::new();
        let mut delta = sanitizer.process_chunk("hola <thi");
        assert_eq!(delta.answer, "hola ");
        assert_eq!(sanitizer.state(), StreamState::PossibleThinkStart);

        delta = sanitizer.flush();
        assert_eq!(delta.answer, "<thi");
        assert_eq!(sanitizer.state(), StreamState::Normal);
    }

    #[test]
    fn flush_inside_think_block_goes_to_thought() {
        let mut sanitizer = StreamSanitizer::new();
        sanitizer.process_chunk("<think>plan</thi");
        let delta = sanitizer.flush();
        assert_eq!(delta.thought, "</thi");
        assert_eq!(delta.answer, "");
    }

    #[test]
    fn callbacks_fire_per_classified_delta() {
        let answers = Arc::new(Mutex::new(Vec::new()));
        let thoughts = Arc::new(Mutex::new(Vec::new()));
        let answers_clone = Arc::clone(&answers);
        let thoughts_clone = Arc::clone(&thoughts);

        let mut sanitizer = StreamSanitizer::new()
            .on_answer(move |delta: &str| answers_clone.lock().unwrap().push(delta.to_string()))
            .on_thought(move |delta: &str| thoughts_clone.lock().unwrap().push(delta.to_string()));

        sanitizer.process_chunk("uno <think>dos</think> tres");
        sanitizer.flush();

        assert_eq!(*answers.lock().unwrap(), vec!["uno  tres".to_string()]);
        assert_eq!(*thoughts.lock().unwrap(), vec!["dos".to_string()]);
    }

    // Lossless-split property: for a fixed input, every chunking classifies
    // the same characters the same way, and nothing is lost or invented.
    #[test]
    fn lossless_across_all_two_way_chunkings() {
        let input = "ab<think>cd</think>ef <thin ghi </think> <think>tail";
        let reference = run_chunks(&[input]);

        for split in 0..=input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let (head, tail) = input.split_at(split);
            let observed = run_chunks(&[head, tail]);
            assert_eq!(observed, reference, "chunking at byte {split} diverged");
        }
    }

    #[test]
    fn never_emits_tag_characters() {
        let (answer, thought) = run_chunks(&["a<think>b</think>c<think>d</think>e"]);
        assert_eq!(answer, "ace");
        assert_eq!(thought, "bd");
    }
}
