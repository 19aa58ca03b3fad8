//! Parses and orders chapter labels coming back from a language model.
//!
//! Labels are free text (`"Prólogo"`, `"Capítulo IV: La huida"`, `"chapter 2"`)
//! and are not guaranteed well-formed. The parser is accent- and
//! case-insensitive and understands arabic and roman numerals; anything it
//! cannot place is kept in an UNKNOWN bucket at the end, with a warning,
//! rather than silently reordered.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChapterKind {
    Prologue,
    Numbered,
    Epilogue,
    Unknown,
}

impl ChapterKind {
    fn rank(self) -> u8 {
        match self {
            ChapterKind::Prologue => 0,
            ChapterKind::Numbered => 1,
            ChapterKind::Epilogue => 2,
            ChapterKind::Unknown => 3,
        }
    }
}

/// Parsed form of a chapter key. The original label is kept verbatim; it is
/// the map key downstream code continues to use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChapterLabel {
    pub kind: ChapterKind,
    pub number: Option<u32>,
    pub original: String,
}

impl Ord for ChapterLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .rank()
            .cmp(&other.kind.rank())
            .then_with(|| match (self.kind, other.kind) {
                (ChapterKind::Numbered, ChapterKind::Numbered) => {
                    self.number.unwrap_or(0).cmp(&other.number.unwrap_or(0))
                }
                _ => Ordering::Equal,
            })
            .then_with(|| self.original.cmp(&other.original))
    }
}

impl PartialOrd for ChapterLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

static NUMBERED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:capitulo|cap\.?|chapter)\s+([0-9]+|[ivxlcdm]+)\b")
        .expect("numbered-chapter pattern must compile")
});

const PROLOGUE_WORDS: [&str; 4] = ["prologo", "introduccion", "prefacio", "prologue"];
const EPILOGUE_WORDS: [&str; 5] = ["epilogo", "conclusion", "final", "epilogue", "epilog"];

/// Lowercases and strips the accents that show up in Spanish chapter labels.
fn normalize(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|ch| match ch {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' | 'ü' | 'Ü' => 'u',
            _ => ch.to_ascii_lowercase(),
        })
        .collect()
}

fn roman_to_int(value: &str) -> Option<u32> {
    fn digit(ch: char) -> Option<u32> {
        match ch {
            'i' => Some(1),
            'v' => Some(5),
            'x' => Some(10),
            'l' => Some(50),
            'c' => Some(100),
            'd' => Some(500),
            'm' => Some(1_000),
            _ => None,
        }
    }

    let mut total: i64 = 0;
    let mut prev = 0u32;
    for ch in value.chars().rev() {
        let current = digit(ch)?;
        if current < prev {
            total -= i64::from(current);
        } else {
            total += i64::from(current);
            prev = current;
        }
    }
    u32::try_from(total).ok().filter(|n| *n > 0)
}

pub fn parse_chapter_label(label: &str) -> ChapterLabel {
    let normalized = normalize(label);
    // Titles like "Prólogo: El despertar" carry a subtitle after the colon.
    let head = normalized
        .split(&[':', '-', '—'][..])
        .next()
        .unwrap_or(&normalized)
        .trim()
        .to_string();

    if PROLOGUE_WORDS.contains(&head.as_str()) {
        return ChapterLabel {
            kind: ChapterKind::Prologue,
            number: None,
            original: label.to_string(),
        };
    }
    if EPILOGUE_WORDS.contains(&head.as_str()) {
        return ChapterLabel {
            kind: ChapterKind::Epilogue,
            number: None,
            original: label.to_string(),
        };
    }

    if let Some(captures) = NUMBERED.captures(&head) {
        let token = &captures[1];
        let number = token
            .parse::<u32>()
            .ok()
            .or_else(|| roman_to_int(token));
        if let Some(number) = number {
            return ChapterLabel {
                kind: ChapterKind::Numbered,
                number: Some(number),
                original: label.to_string(),
            };
        }
    }

    ChapterLabel {
        kind: ChapterKind::Unknown,
        number: None,
        original: label.to_string(),
    }
}

/// Sorted chapter keys plus the sequence problems found along the way.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderedChapters {
    pub keys: Vec<String>,
    pub warnings: Vec<String>,
}

/// Stable total order over heterogeneous chapter keys: prologues first,
/// numbered ascending, epilogues, then unparsable labels. O(n log n).
pub fn sort_chapters<I, S>(keys: I) -> OrderedChapters
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut labels: Vec<ChapterLabel> = keys
        .into_iter()
        .map(|key| parse_chapter_label(key.as_ref()))
        .collect();

    let warnings = validate_sequence(&labels);
    labels.sort();

    OrderedChapters {
        keys: labels.into_iter().map(|label| label.original).collect(),
        warnings,
    }
}

fn validate_sequence(labels: &[ChapterLabel]) -> Vec<String> {
    let mut warnings = Vec::new();

    let mut numbers: Vec<(u32, &str)> = labels
        .iter()
        .filter(|label| label.kind == ChapterKind::Numbered)
        .filter_map(|label| label.number.map(|n| (n, label.original.as_str())))
        .collect();
    numbers.sort_by_key(|(n, _)| *n);

    for window in numbers.windows(2) {
        let (a, label_a) = window[0];
        let (b, label_b) = window[1];
        if a == b {
            warnings.push(format!(
                "duplicate chapter number {a}: '{label_a}' and '{label_b}'"
            ));
        } else if b - a > 1 {
            for missing in (a + 1)..b {
                warnings.push(format!("gap in chapter numbering at {missing}"));
            }
        }
    }

    let prologues: Vec<&str> = labels
        .iter()
        .filter(|l| l.kind == ChapterKind::Prologue)
        .map(|l| l.original.as_str())
        .collect();
    if prologues.len() > 1 {
        warnings.push(format!("multiple prologues detected: {prologues:?}"));
    }

    let epilogues: Vec<&str> = labels
        .iter()
        .filter(|l| l.kind == ChapterKind::Epilogue)
        .map(|l| l.original.as_str())
        .collect();
    if epilogues.len() > 1 {
        warnings.push(format!("multiple epilogues detected: {epilogues:?}"));
    }

    for label in labels.iter().filter(|l| l.kind == ChapterKind::Unknown) {
        warnings.push(format!(
            "unrecognized chapter label '{}' kept at the end",
            label.original
        ));
    }

    warnings
}
