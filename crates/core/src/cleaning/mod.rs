use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Cleaning stages in application order. `Whitespace` always runs last so the
/// other stages never leave ragged blank lines behind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CleaningStage {
    AnsiCodes,
    ThinkTags,
    Metadata,
    NarrativeMarkers,
    Whitespace,
}

impl CleaningStage {
    pub const ALL: [CleaningStage; 5] = [
        CleaningStage::AnsiCodes,
        CleaningStage::ThinkTags,
        CleaningStage::Metadata,
        CleaningStage::NarrativeMarkers,
        CleaningStage::Whitespace,
    ];
}

struct CleaningPattern {
    stage: CleaningStage,
    regex: Lazy<Regex>,
    replacement: &'static str,
}

macro_rules! pattern {
    ($stage:expr, $re:expr) => {
        pattern!($stage, $re, "")
    };
    ($stage:expr, $re:expr, $replacement:expr) => {
        CleaningPattern {
            stage: $stage,
            regex: Lazy::new(|| {
                RegexBuilder::new($re)
                    .dot_matches_new_line(true)
                    .case_insensitive(true)
                    .build()
                    .expect("cleaning pattern must compile")
            }),
            replacement: $replacement,
        }
    };
}

// Patterns are registered once, in priority order within each stage. The
// think-tag dialects cover everything observed from reasoning models,
// including an unclosed tag at the end of a truncated response.
static PATTERNS: Lazy<Vec<CleaningPattern>> = Lazy::new(|| vec![
    pattern!(CleaningStage::AnsiCodes, r"\x1B\[[0-?]*[ -/]*[@-~]"),
    pattern!(CleaningStage::AnsiCodes, r"\[\d+m"),
    pattern!(CleaningStage::ThinkTags, r"<think>.*?</think>\s*"),
    pattern!(CleaningStage::ThinkTags, r"<think>.*\z"),
    pattern!(CleaningStage::ThinkTags, r"<razonamiento>.*?</razonamiento>\s*"),
    pattern!(CleaningStage::ThinkTags, r"<reasoning>.*?</reasoning>\s*"),
    pattern!(CleaningStage::ThinkTags, r"\[pensamiento:.*?\]\s*"),
    pattern!(CleaningStage::ThinkTags, r"\[think:.*?\]\s*"),
    pattern!(CleaningStage::ThinkTags, r"\(pensando:.*?\)\s*"),
    pattern!(CleaningStage::ThinkTags, r"\(thinking:.*?\)\s*"),
    pattern!(CleaningStage::Metadata, r"\[Nota:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Desarrollo:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Contexto:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Idea:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Continuación:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Marco:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[Resumen:.*?\]"),
    pattern!(CleaningStage::Metadata, r"\[\.\.\.\]"),
    pattern!(CleaningStage::NarrativeMarkers, r"INICIO DEL CAPÍTULO:"),
    pattern!(
        CleaningStage::NarrativeMarkers,
        r"\[\.\.\.PARTE MEDIA DEL CAPÍTULO\.\.\.\]"
    ),
    pattern!(
        CleaningStage::NarrativeMarkers,
        r"\[\.\.\.FINAL DEL CAPÍTULO\.\.\.\]"
    ),
    pattern!(CleaningStage::NarrativeMarkers, r"Progreso actual:[^\n]*\n?"),
    pattern!(CleaningStage::NarrativeMarkers, r"Elementos clave:[^\n]*\n?"),
    pattern!(CleaningStage::NarrativeMarkers, r"### [^\n#]*? ###"),
    pattern!(CleaningStage::NarrativeMarkers, r"--\s?Fin del capítulo\s?--"),
    pattern!(CleaningStage::NarrativeMarkers, r"--\s?Continuará\s?--"),
]);

static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-run pattern must compile"));
static SPACE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" {2,}").expect("space-run pattern must compile"));

/// Pure regex pipeline over model output. Applying the same stage set twice
/// yields the same text, which lets callers clean defensively at every seam.
#[derive(Clone, Debug)]
pub struct TextCleaner {
    enabled_stages: Vec<CleaningStage>,
}

impl Default for TextCleaner {
    fn default() -> Self {
        Self {
            enabled_stages: CleaningStage::ALL.to_vec(),
        }
    }
}

impl TextCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stages(stages: &[CleaningStage]) -> Self {
        Self {
            enabled_stages: stages.to_vec(),
        }
    }

    pub fn is_stage_enabled(&self, stage: CleaningStage) -> bool {
        self.enabled_stages.contains(&stage)
    }

    /// Applies the requested stages (intersected with the enabled set) in
    /// declared order; `Whitespace` runs last when enabled.
    pub fn clean(&self, text: &str, stages: &[CleaningStage]) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut result = text.to_string();
        for stage in CleaningStage::ALL {
            if stage == CleaningStage::Whitespace {
                continue;
            }
            if stages.contains(&stage) && self.is_stage_enabled(stage) {
                result = clean_stage(&result, stage);
            }
        }

        if stages.contains(&CleaningStage::Whitespace)
            && self.is_stage_enabled(CleaningStage::Whitespace)
        {
            result = collapse_whitespace(&result);
        }

        result
    }

    pub fn clean_all(&self, text: &str) -> String {
        self.clean(text, &CleaningStage::ALL)
    }

    /// Drops whole lines that start with non-narrative prefixes such as
    /// `Nota:` or `RESUMEN`; used before handing prose to the document writer.
    pub fn clean_lines_starting_with(&self, text: &str, prefixes: &[&str]) -> String {
        text.lines()
            .filter(|line| {
                let trimmed = line.trim_start();
                !prefixes.iter().any(|prefix| trimmed.starts_with(prefix))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn clean_stage(text: &str, stage: CleaningStage) -> String {
    let mut result = text.to_string();
    for pattern in PATTERNS.iter().filter(|p| p.stage == stage) {
        result = pattern
            .regex
            .replace_all(&result, pattern.replacement)
            .into_owned();
    }
    result
}

fn collapse_whitespace(text: &str) -> String {
    let collapsed = BLANK_RUNS.replace_all(text, "\n\n");
    let collapsed = SPACE_RUNS.replace_all(&collapsed, " ");
    collapsed.trim().to_string()
}

/// Removes every known reasoning-tag dialect; the shorthand the chains use on
/// their own inputs before prompt assembly.
pub fn clean_think_tags(text: &str) -> String {
    TextCleaner::new().clean(text, &[CleaningStage::ThinkTags, CleaningStage::Whitespace])
}

pub fn clean_ansi_codes(text: &str) -> String {
    TextCleaner::new().clean(text, &[CleaningStage::AnsiCodes])
}
