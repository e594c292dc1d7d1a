// Question templates: identity, kinds, rendering and seed-time validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Token replaced by a participant's name in `custom_options` questions.
pub const MEMBER_PLACEHOLDER: &str = "{member}";

/// Telegram accepts between 2 and 10 answer options per poll.
pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 10;

/// Maximum length (in characters) of a single poll option.
pub const MAX_OPTION_CHARS: usize = 100;

/// Maximum length (in characters) of a poll question.
pub const MAX_QUESTION_CHARS: usize = 300;

/// Upper bound on stored display names, in characters. A name is also an
/// option of `member_options` polls, so it shares the option limit.
pub const MAX_DISPLAY_NAME_CHARS: usize = MAX_OPTION_CHARS;

/// Stable identifier of a template: the hex SHA-256 digest of its question
/// text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(String);

impl TemplateId {
    /// Derive the identifier from the question text.
    pub fn from_question(question: &str) -> Self {
        let digest = Sha256::digest(question.as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        TemplateId(hex)
    }

    /// Wrap an identifier read back from storage.
    pub fn from_stored(raw: String) -> Self {
        TemplateId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a template's answer options are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Options are drawn from the group's current participants.
    MemberOptions,
    /// One participant is named in the question; options are fixed.
    CustomOptions,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::MemberOptions => "member_options",
            TemplateKind::CustomOptions => "custom_options",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member_options" => Ok(TemplateKind::MemberOptions),
            "custom_options" => Ok(TemplateKind::CustomOptions),
            other => Err(format!("unknown template kind `{other}`")),
        }
    }
}

/// A reusable question definition. Immutable once seeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: TemplateId,
    pub kind: TemplateKind,
    pub question: String,
    /// Fixed options for `CustomOptions`; empty for `MemberOptions`.
    pub options: Vec<String>,
}

impl Template {
    /// Build a template, deriving its identifier from the question text.
    pub fn new(kind: TemplateKind, question: impl Into<String>, options: Vec<String>) -> Self {
        let question = question.into();
        Template {
            id: TemplateId::from_question(&question),
            kind,
            question,
            options,
        }
    }

    /// Substitute `member` for every placeholder in the question text.
    pub fn render(&self, member: &str) -> String {
        self.question.replace(MEMBER_PLACEHOLDER, member)
    }

    /// Check the template's shape against its kind. Returns a human-readable
    /// reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.question.trim().is_empty() {
            return Err("question text is empty".into());
        }

        let placeholders = self.question.matches(MEMBER_PLACEHOLDER).count();

        // Budget for the longest name that can replace each placeholder.
        let rendered_max = self.question.chars().count()
            - placeholders * MEMBER_PLACEHOLDER.chars().count()
            + placeholders * MAX_DISPLAY_NAME_CHARS;
        if rendered_max > MAX_QUESTION_CHARS {
            return Err(format!(
                "question can render to {rendered_max} characters, limit is {MAX_QUESTION_CHARS}"
            ));
        }

        match self.kind {
            TemplateKind::MemberOptions => {
                if !self.options.is_empty() {
                    return Err("member_options templates must not list fixed options".into());
                }
                if placeholders != 0 {
                    return Err(format!(
                        "member_options templates must not contain {MEMBER_PLACEHOLDER}"
                    ));
                }
            }
            TemplateKind::CustomOptions => {
                if placeholders != 1 {
                    return Err(format!(
                        "custom_options templates need exactly one {MEMBER_PLACEHOLDER}, found {placeholders}"
                    ));
                }
                let n = self.options.len();
                if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&n) {
                    return Err(format!(
                        "custom_options templates need {MIN_POLL_OPTIONS}..={MAX_POLL_OPTIONS} options, found {n}"
                    ));
                }
                for (i, option) in self.options.iter().enumerate() {
                    if option.trim().is_empty() {
                        return Err(format!("option {i} is empty"));
                    }
                    if option.chars().count() > MAX_OPTION_CHARS {
                        return Err(format!("option {i} exceeds {MAX_OPTION_CHARS} characters"));
                    }
                    if self.options[..i].contains(option) {
                        return Err(format!("option `{option}` is listed twice"));
                    }
                }
            }
        }

        Ok(())
    }
}
