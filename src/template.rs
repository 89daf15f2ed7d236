//! Topic template expansion.
//!
//! A template is plain text with placeholders:
//!
//! - `{NAME}` substitutes the value of `NAME`.
//! - `{NAME[]}` splits the value on a space and yields one topic per element.
//! - `{NAME[,]}` splits on a custom single-character separator.
//! - A trailing `?` (`{NAME}?`) marks the variable optional.
//!
//! All array variables in one template must split to the same length; the
//! expansion yields one string per index. Expansion is all-or-nothing: a
//! missing value fails the whole template.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::TemplateError;

/// Placeholder grammar. Group 1: name, group 2: array suffix, group 3:
/// separator, group 4: optional marker.
const PLACEHOLDER_PATTERN: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)(\[(.?)\])?\}(\?)?";

/// Separator used by `{NAME[]}`.
pub const DEFAULT_ARRAY_SEPARATOR: char = ' ';

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"))
}

/// A variable extracted from one placeholder occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVariable {
    name: String,
    is_array: bool,
    array_separator: Option<char>,
    is_optional: bool,
}

impl TemplateVariable {
    /// Variable name as looked up in the environment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the value is split into multiple topics.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.is_array
    }

    /// Explicit separator, `None` for `{NAME[]}` and scalars.
    #[must_use]
    pub const fn array_separator(&self) -> Option<char> {
        self.array_separator
    }

    /// Whether the placeholder carried the `?` marker.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        self.is_optional
    }

    fn separator(&self) -> char {
        self.array_separator.unwrap_or(DEFAULT_ARRAY_SEPARATOR)
    }
}

impl fmt::Display for TemplateVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}", self.name)?;
        if self.is_array {
            match self.array_separator {
                Some(sep) => write!(f, "[{sep}]")?,
                None => f.write_str("[]")?,
            }
        }
        f.write_str("}")?;
        if self.is_optional {
            f.write_str("?")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder(usize),
}

enum Resolved<'a> {
    Scalar(&'a str),
    Array(Vec<&'a str>),
}

/// A parsed topic template.
///
/// Variables are kept in first-occurrence order, one per distinct placeholder
/// text. A placeholder repeated in the template resolves to the same value
/// everywhere it appears.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    variables: Vec<TemplateVariable>,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `raw`. Parsing never fails: text that does not match the
    /// placeholder grammar is kept verbatim.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut variables: Vec<TemplateVariable> = Vec::new();
        let mut index_by_text: HashMap<&str, usize> = HashMap::new();
        let mut segments = Vec::new();
        let mut cursor = 0;

        for caps in placeholder_regex().captures_iter(raw) {
            let Some(whole) = caps.get(0) else {
                continue;
            };

            if whole.start() > cursor {
                segments.push(Segment::Literal(raw[cursor..whole.start()].to_string()));
            }
            cursor = whole.end();

            let idx = *index_by_text.entry(whole.as_str()).or_insert_with(|| {
                variables.push(TemplateVariable {
                    name: caps[1].to_string(),
                    is_array: caps.get(2).is_some(),
                    array_separator: caps.get(3).and_then(|m| m.as_str().chars().next()),
                    is_optional: caps.get(4).is_some(),
                });
                variables.len() - 1
            });
            segments.push(Segment::Placeholder(idx));
        }

        if cursor < raw.len() {
            segments.push(Segment::Literal(raw[cursor..].to_string()));
        }

        Self {
            raw: raw.to_string(),
            variables,
            segments,
        }
    }

    /// The original template text.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Variables in first-occurrence order.
    #[must_use]
    pub fn variables(&self) -> &[TemplateVariable] {
        &self.variables
    }

    /// Returns true if the template contains array placeholders.
    #[must_use]
    pub fn has_arrays(&self) -> bool {
        self.variables.iter().any(TemplateVariable::is_array)
    }

    /// Expands the template against `env`.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::MissingVariable`] if any placeholder has no value.
    /// - [`TemplateError::ArityMismatch`] if two array variables split to
    ///   different lengths; `expected` is the length of the first array seen.
    pub fn expand(&self, env: &HashMap<String, String>) -> Result<Vec<String>, TemplateError> {
        let mut values = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            let Some(value) = env.get(&variable.name) else {
                return Err(TemplateError::MissingVariable {
                    name: variable.name.clone(),
                    optional: variable.is_optional,
                });
            };
            values.push(value.as_str());
        }

        let mut length: Option<usize> = None;
        let mut resolved = Vec::with_capacity(values.len());
        for (variable, value) in self.variables.iter().zip(values) {
            if !variable.is_array {
                resolved.push(Resolved::Scalar(value));
                continue;
            }

            let parts: Vec<&str> = value.split(variable.separator()).collect();
            match length {
                Some(expected) if expected != parts.len() => {
                    return Err(TemplateError::ArityMismatch {
                        name: variable.name.clone(),
                        actual: parts.len(),
                        expected,
                    });
                }
                Some(_) => {}
                None => length = Some(parts.len()),
            }
            resolved.push(Resolved::Array(parts));
        }

        let variants = length.unwrap_or(1);
        Ok((0..variants).map(|i| self.render(&resolved, i)).collect())
    }

    fn render(&self, resolved: &[Resolved<'_>], index: usize) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(idx) => match &resolved[*idx] {
                    Resolved::Scalar(value) => out.push_str(value),
                    Resolved::Array(parts) => out.push_str(parts[index]),
                },
            }
        }
        out
    }
}

/// Parses `content` and expands it against `env`.
///
/// A string without placeholders expands to itself.
///
/// # Errors
///
/// See [`Template::expand`].
pub fn expand(content: &str, env: &HashMap<String, String>) -> Result<Vec<String>, TemplateError> {
    Template::parse(content).expand(env)
}
