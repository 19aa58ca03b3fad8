//! Selects representative segments of a long chapter so it can be summarized
//! without feeding the whole text to the model. Deterministic for a given
//! text, strategy and configuration.

use crate::config::EnvLookup;
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentStrategy {
    StartEnd,
    Uniform,
    Adaptive,
    Full,
}

impl SegmentStrategy {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "START_END" => Self::StartEnd,
            "UNIFORM" => Self::Uniform,
            "FULL" => Self::Full,
            _ => Self::Adaptive,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentConfig {
    pub strategy: SegmentStrategy,
    pub max_segments: usize,
    pub base_segment_length: usize,
    pub adaptive_scaling: bool,
    pub respect_boundaries: bool,
    pub min_segment_length: usize,
    pub max_segment_length: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            strategy: SegmentStrategy::Adaptive,
            max_segments: 3,
            base_segment_length: 1_000,
            adaptive_scaling: true,
            respect_boundaries: true,
            min_segment_length: 500,
            max_segment_length: 2_000,
        }
    }
}

impl SegmentConfig {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let defaults = Self::default();
        let parse_usize = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let parse_flag = |key: &str, default: bool| match lookup(key) {
            Some(value) => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes"
            ),
            None => default,
        };

        Self {
            strategy: lookup("SEGMENT_EXTRACTION_STRATEGY")
                .map(|v| SegmentStrategy::parse(&v))
                .unwrap_or(defaults.strategy),
            max_segments: parse_usize("SEGMENT_MAX_COUNT", defaults.max_segments),
            base_segment_length: parse_usize("SEGMENT_BASE_LENGTH", defaults.base_segment_length),
            adaptive_scaling: parse_flag("SEGMENT_ADAPTIVE_SCALING", defaults.adaptive_scaling),
            respect_boundaries: parse_flag(
                "SEGMENT_RESPECT_BOUNDARIES",
                defaults.respect_boundaries,
            ),
            min_segment_length: parse_usize("SEGMENT_MIN_LENGTH", defaults.min_segment_length),
            max_segment_length: parse_usize("SEGMENT_MAX_LENGTH", defaults.max_segment_length),
        }
    }
}

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("paragraph pattern must compile"));
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+[\s\n]+").expect("sentence pattern must compile"));

const ELISION: &str = "[...CONTENIDO OMITIDO...]";
const PART_ELISION: &str = "[...PARTE OMITIDA...]";
const START_LABEL: &str = "INICIO DEL CAPÍTULO";
const MIDDLE_LABEL: &str = "PARTE MEDIA DEL CAPÍTULO";
const END_LABEL: &str = "FINAL DEL CAPÍTULO";

// How far around a target position we look for a natural break.
const BOUNDARY_SEARCH_RANGE: usize = 200;

pub struct SegmentExtractor {
    config: SegmentConfig,
}

impl Default for SegmentExtractor {
    fn default() -> Self {
        Self::new(SegmentConfig::default())
    }
}

impl SegmentExtractor {
    pub fn new(config: SegmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn extract(&self, text: &str) -> String {
        self.extract_with(text, self.config.max_segments, self.config.base_segment_length)
    }

    /// Extracts with per-call overrides; callers that already know the shape
    /// of the content (chapter finalization) pass their own budget.
    pub fn extract_with(&self, text: &str, max_segments: usize, segment_length: usize) -> String {
        let max_segments = max_segments.max(2);
        let mut segment_length = segment_length.max(1);

        if self.config.adaptive_scaling {
            segment_length = self.adaptive_length(text, segment_length);
        }
        segment_length = segment_length
            .max(self.config.min_segment_length)
            .min(self.config.max_segment_length);

        // Already fits: no elision needed regardless of strategy.
        if text.len() <= segment_length.saturating_mul(max_segments) {
            return text.to_string();
        }

        match self.config.strategy {
            SegmentStrategy::Full => text.to_string(),
            SegmentStrategy::StartEnd => self.extract_start_end(text, segment_length),
            SegmentStrategy::Uniform => self.extract_uniform(text, segment_length, max_segments),
            SegmentStrategy::Adaptive => self.extract_adaptive(text, segment_length, max_segments),
        }
    }

    // Long texts get larger segments to capture more context, short ones get
    // smaller segments to avoid redundancy.
    fn adaptive_length(&self, text: &str, base: usize) -> usize {
        let len = text.len();
        let scale = if len > 50_000 {
            1.5
        } else if len > 20_000 {
            1.2
        } else if len < 5_000 {
            0.7
        } else if len < 10_000 {
            0.85
        } else {
            1.0
        };
        ((base as f64) * scale) as usize
    }

    fn find_boundary(&self, text: &str, target: usize, forward: bool) -> usize {
        let target = floor_char_boundary(text, target.min(text.len()));
        if !self.config.respect_boundaries {
            return target;
        }

        let (window_start, window_end) = if forward {
            (
                target,
                floor_char_boundary(text, (target + BOUNDARY_SEARCH_RANGE).min(text.len())),
            )
        } else {
            (
                floor_char_boundary(text, target.saturating_sub(BOUNDARY_SEARCH_RANGE)),
                target,
            )
        };
        let window = &text[window_start..window_end];

        for pattern in [&*PARAGRAPH_BREAK, &*SENTENCE_END] {
            let mut matches = pattern.find_iter(window);
            let chosen = if forward {
                matches.next()
            } else {
                matches.last()
            };
            if let Some(found) = chosen {
                return window_start + found.end();
            }
        }

        target
    }

    fn extract_start_end(&self, text: &str, segment_length: usize) -> String {
        let start_end = self.find_boundary(text, segment_length, true);
        let end_start = self.find_boundary(text, text.len().saturating_sub(segment_length), false);

        format!(
            "{START_LABEL}:\n{}\n\n{ELISION}\n\n{END_LABEL}:\n{}",
            &text[..start_end],
            &text[end_start..]
        )
    }

    fn extract_uniform(&self, text: &str, segment_length: usize, max_segments: usize) -> String {
        let len = text.len();
        let mut pieces: Vec<(String, String)> = Vec::with_capacity(max_segments);

        let span = len.saturating_sub(segment_length);
        let step = span / (max_segments - 1).max(1);

        for index in 0..max_segments {
            let position = index * step;
            let start = self.find_boundary(text, position, true);
            let end = self.find_boundary(text, position + segment_length, true);
            let end = end.max(start);

            let label = if index == 0 {
                START_LABEL.to_string()
            } else if index == max_segments - 1 {
                END_LABEL.to_string()
            } else {
                format!("PARTE {index} DEL CAPÍTULO")
            };
            pieces.push((label, text[start..end].to_string()));
        }

        join_segments(&pieces, PART_ELISION)
    }

    // Start, a sample of the middle third, and the end: establishment,
    // inflection, resolution.
    fn extract_adaptive(&self, text: &str, segment_length: usize, max_segments: usize) -> String {
        let mut pieces: Vec<(String, String)> = Vec::new();

        let start_end = self.find_boundary(text, segment_length, true);
        pieces.push((START_LABEL.to_string(), text[..start_end].to_string()));

        if max_segments > 2 {
            let paragraphs: Vec<&str> = PARAGRAPH_BREAK.split(text).collect();
            let third = paragraphs.len() / 3;
            let middle_text = paragraphs[third..(2 * third).max(third)].join("\n\n");

            let middle = if middle_text.len() > segment_length {
                let mid_point = middle_text.len() / 2;
                let from = self.find_boundary(
                    &middle_text,
                    mid_point.saturating_sub(segment_length / 2),
                    true,
                );
                let to = self.find_boundary(&middle_text, from + segment_length, false);
                middle_text[from..to.max(from)].to_string()
            } else {
                middle_text
            };

            if !middle.trim().is_empty() {
                pieces.push((MIDDLE_LABEL.to_string(), middle));
            }
        }

        let end_start = self.find_boundary(text, text.len().saturating_sub(segment_length), false);
        pieces.push((END_LABEL.to_string(), text[end_start..].to_string()));

        join_segments(&pieces, ELISION)
    }
}

fn join_segments(pieces: &[(String, String)], separator: &str) -> String {
    let mut result = String::new();
    for (index, (label, body)) in pieces.iter().enumerate() {
        if index > 0 {
            result.push_str(&format!("\n\n{separator}\n\n"));
        }
        result.push_str(&format!("{label}:\n{body}"));
    }
    result
}

/// Largest char boundary <= `index`; keeps byte-oriented math safe on UTF-8.
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(strategy: SegmentStrategy) -> SegmentConfig {
        SegmentConfig {
            strategy,
            max_segments: 3,
            base_segment_length: 100,
            adaptive_scaling: false,
            respect_boundaries: false,
            min_segment_length: 10,
            max_segment_length: 400,
        }
    }

    fn long_text() -> String {
        (0..80)
            .map(|i| format!("Párrafo número {i} con algo de contenido narrativo."))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn short_text_passes_through_unchanged() {
        let extractor = SegmentExtractor::new(config(SegmentStrategy::Adaptive));
        let text = "Texto corto.";
        assert_eq!(extractor.extract(text), text);
    }

    #[test]
    fn start_end_keeps_both_extremes() {
        let extractor = SegmentExtractor::new(config(SegmentStrategy::StartEnd));
        let text = long_text();
        let result = extractor.extract(&text);

        assert!(result.starts_with("INICIO DEL CAPÍTULO:"));
        assert!(result.contains(ELISION));
        assert!(result.contains("FINAL DEL CAPÍTULO:"));
        assert!(result.contains("Párrafo número 0"));
        assert!(result.contains("Párrafo número 79"));
        assert!(result.len() < text.len());
    }

    #[test]
    fn uniform_produces_requested_segment_count() {
        let extractor = SegmentExtractor::new(config(SegmentStrategy::Uniform));
        let result = extractor.extract(&long_text());

        assert!(result.contains("INICIO DEL CAPÍTULO:"));
        assert!(result.contains("PARTE 1 DEL CAPÍTULO:"));
        assert!(result.contains("FINAL DEL CAPÍTULO:"));
        assert_eq!(result.matches(PART_ELISION).count(), 2);
    }

    #[test]
    fn adaptive_includes_middle_sample() {
        let extractor = SegmentExtractor::new(config(SegmentStrategy::Adaptive));
        let result = extractor.extract(&long_text());

        assert!(result.contains("INICIO DEL CAPÍTULO:"));
        assert!(result.contains("PARTE MEDIA DEL CAPÍTULO:"));
        assert!(result.contains("FINAL DEL CAPÍTULO:"));
    }

    #[test]
    fn extraction_is_deterministic() {
        let extractor = SegmentExtractor::new(config(SegmentStrategy::Adaptive));
        let text = long_text();
        assert_eq!(extractor.extract(&text), extractor.extract(&text));
    }

    #[test]
    fn boundary_snapping_prefers_paragraph_breaks() {
        let mut cfg = config(SegmentStrategy::StartEnd);
        cfg.respect_boundaries = true;
        let extractor = SegmentExtractor::new(cfg);
        let text = long_text();
        let result = extractor.extract(&text);

        // The opening segment should end at a paragraph break, not mid-word.
        let start_part = result
            .split(ELISION)
            .next()
            .expect("result always has a start part");
        assert!(start_part.trim_end().ends_with('.'));
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_character() {
        let mut cfg = config(SegmentStrategy::Uniform);
        cfg.respect_boundaries = false;
        let extractor = SegmentExtractor::new(cfg);
        let text = "áéíóúñ ".repeat(200);
        // Must not panic on char boundaries.
        let result = extractor.extract(&text);
        assert!(!result.is_empty());
    }

    #[test]
    fn reads_configuration_from_environment() {
        let map = HashMap::from([
            ("SEGMENT_EXTRACTION_STRATEGY", "uniform"),
            ("SEGMENT_MAX_COUNT", "4"),
            ("SEGMENT_BASE_LENGTH", "800"),
            ("SEGMENT_ADAPTIVE_SCALING", "false"),
        ]);
        let lookup = move |key: &str| map.get(key).map(|v| v.to_string());
        let cfg = SegmentConfig::from_lookup(&lookup);

        assert_eq!(cfg.strategy, SegmentStrategy::Uniform);
        assert_eq!(cfg.max_segments, 4);
        assert_eq!(cfg.base_segment_length, 800);
        assert!(!cfg.adaptive_scaling);
    }
}
