//! Prompt template registry. Templates ship as a built-in TOML document and
//! can be overridden from custom directories (TOML or YAML), keyed by name.
//! Placeholders use `{name}` syntax; `{{` and `}}` escape literal braces.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("required key `{argument}` of prompt `{key}` has no matching placeholder")]
    InvalidRequired { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse prompt document: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    placeholders: BTreeSet<String>,
    required: BTreeSet<String>,
    description: Option<String>,
}

impl PromptTemplate {
    fn from_raw(key: String, raw: RawPrompt) -> Result<Self, PromptError> {
        let placeholders = scan_placeholders(&raw.template);
        let required = if raw.required.is_empty() {
            placeholders.clone()
        } else {
            let mut set = BTreeSet::new();
            for argument in raw.required {
                let trimmed = argument.trim().to_string();
                if !placeholders.contains(&trimmed) {
                    return Err(PromptError::InvalidRequired {
                        key: key.clone(),
                        argument: trimmed,
                    });
                }
                set.insert(trimmed);
            }
            set
        };

        Ok(Self {
            key,
            template: raw.template,
            placeholders,
            required,
            description: raw.description,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        for required in &self.required {
            if !arguments.contains_key(required) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: required.clone(),
                });
            }
        }

        let mut output = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    output.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    output.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    if closed {
                        if let Some(value) = arguments.get(name.trim()) {
                            output.push_str(value);
                        }
                    } else {
                        output.push('{');
                        output.push_str(&name);
                    }
                }
                other => output.push(other),
            }
        }

        Ok(output)
    }

    pub fn render_with<I, K, V>(&self, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: PromptArguments = arguments
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.render(&map)
    }
}

fn scan_placeholders(template: &str) -> BTreeSet<String> {
    let mut placeholders = BTreeSet::new();
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '{' {
            if chars.peek() == Some(&'{') {
                chars.next();
                continue;
            }
            let mut name = String::new();
            let mut closed = false;
            for next in chars.by_ref() {
                if next == '}' {
                    closed = true;
                    break;
                }
                name.push(next);
            }
            let trimmed = name.trim();
            if closed && !trimmed.is_empty() {
                placeholders.insert(trimmed.to_string());
            }
        } else if ch == '}' && chars.peek() == Some(&'}') {
            chars.next();
        }
    }
    placeholders
}

#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
}

impl PromptRegistry {
    /// Built-in templates only.
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<&Path>(&[])
    }

    /// Built-in templates overlaid with any `.toml`/`.yaml` files found in the
    /// given directories, later directories winning.
    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut prompts = BTreeMap::new();

        let document: PromptDocument = toml::from_str(BUILT_IN_PROMPTS)?;
        for (key, raw) in document.prompts {
            prompts.insert(key.clone(), PromptTemplate::from_raw(key, raw)?);
        }

        for dir in directories {
            load_directory(dir.as_ref(), &mut prompts)?;
        }

        Ok(Self { prompts })
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prompts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn format(&self, key: &str, arguments: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(arguments)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render_with(arguments)
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let document: PromptDocument = match extension.to_ascii_lowercase().as_str() {
            "toml" => {
                let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&contents)?
            }
            "yaml" | "yml" => {
                let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => continue,
        };

        for (key, raw) in document.prompts {
            prompts.insert(key.clone(), PromptTemplate::from_raw(key, raw)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn built_in_document_parses_and_has_pipeline_prompts() {
        let registry = PromptRegistry::new().expect("built-in prompts must parse");
        for key in [
            "book_title",
            "book_framework",
            "chapter_list",
            "chapter_ideas",
            "write_section",
            "write_section_simple",
            "micro_summary",
            "chapter_summary",
            "condense_global",
        ] {
            assert!(registry.contains(key), "missing built-in prompt `{key}`");
        }
    }

    #[test]
    fn renders_title_prompt() {
        let registry = PromptRegistry::new().expect("registry");
        let output = registry
            .format_with(
                "book_title",
                [
                    ("subject", "una colonia lunar"),
                    ("genre", "ciencia ficción"),
                    ("style", "épico"),
                    ("profile", "lectores adultos"),
                ],
            )
            .expect("render");
        assert!(output.contains("una colonia lunar"));
        assert!(output.contains("ciencia ficción"));
    }

    #[test]
    fn missing_argument_is_an_error() {
        let registry = PromptRegistry::new().expect("registry");
        let template = registry.get("book_title").expect("template");
        let error = template
            .render(&PromptArguments::from([(
                "subject".to_string(),
                "algo".to_string(),
            )]))
            .expect_err("must fail");
        match error {
            PromptError::MissingArgument { key, .. } => assert_eq!(key, "book_title"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn escaped_braces_render_literally() {
        let raw = RawPrompt {
            template: "literal {{corchete}} y {valor}".to_string(),
            description: None,
            required: Vec::new(),
        };
        let template = PromptTemplate::from_raw("test".to_string(), raw).expect("template");
        let output = template
            .render_with([("valor", "x")])
            .expect("render");
        assert_eq!(output, "literal {corchete} y x");
    }

    #[test]
    fn custom_directory_overrides_builtin() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.book_title]\ntemplate = \"personalizado {subject}\"\n",
        )
        .expect("write");

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).expect("registry");
        let output = registry
            .format_with("book_title", [("subject", "mar")])
            .expect("render");
        assert_eq!(output, "personalizado mar");
    }

    #[test]
    fn yaml_files_are_loaded() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("extra.yaml"),
            "prompts:\n  saludo:\n    template: \"hola {nombre}\"\n",
        )
        .expect("write");

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).expect("registry");
        let output = registry
            .format_with("saludo", [("nombre", "mundo")])
            .expect("render");
        assert_eq!(output, "hola mundo");
    }

    #[test]
    fn declared_required_must_match_a_placeholder() {
        let raw = RawPrompt {
            template: "{a}".to_string(),
            description: None,
            required: vec!["b".to_string()],
        };
        let error = PromptTemplate::from_raw("bad".to_string(), raw).expect_err("must fail");
        assert!(matches!(error, PromptError::InvalidRequired { .. }));
    }
}
