//! Topic set computation for one service.

use crate::environment::Environment;
use crate::error::TemplateError;
use crate::template;

/// A manifest template that contributed no topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTemplate {
    /// The manifest template.
    pub template: String,
    /// Why it was skipped.
    pub error: TemplateError,
}

/// Outcome of expanding every manifest template of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicResolution {
    /// All required variables resolved. Templates that failed on an
    /// optional variable are listed in `skipped`.
    Resolved {
        /// Concrete topics in manifest order. Duplicates are kept.
        topics: Vec<String>,
        /// Templates dropped because of an optional variable.
        skipped: Vec<SkippedTemplate>,
    },
    /// A template failed on a required variable (or array arity); the
    /// service must not subscribe to anything.
    Disabled(SkippedTemplate),
}

impl TopicResolution {
    /// Concrete topics, empty when disabled.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        match self {
            Self::Resolved { topics, .. } => topics,
            Self::Disabled(_) => &[],
        }
    }

    /// Returns true if a required variable was missing.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled(_))
    }
}

/// Expands `templates` in order against `env`.
///
/// Stops at the first template failing on a non-optional variable.
pub fn resolve<'a, I>(templates: I, env: &Environment) -> TopicResolution
where
    I: IntoIterator<Item = &'a str>,
{
    let mut topics = Vec::new();
    let mut skipped = Vec::new();

    for raw in templates {
        match template::expand(raw, env) {
            Ok(expanded) => topics.extend(expanded),
            Err(error) if error.is_optional() => skipped.push(SkippedTemplate {
                template: raw.to_string(),
                error,
            }),
            Err(error) => {
                return TopicResolution::Disabled(SkippedTemplate {
                    template: raw.to_string(),
                    error,
                });
            }
        }
    }

    TopicResolution::Resolved { topics, skipped }
}
