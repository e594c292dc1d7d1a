// Question seed loading.
//
// Seed files are TOML with one `[[question]]` table per template:
//
//   [[question]]
//   type = "custom_options"
//   question = "How would {member} spend a free afternoon?"
//   options = ["Reading", "Hiking", "Sleeping"]

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::StoreError;
use crate::store::TemplateStore;
use crate::template::{Template, TemplateKind};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse seed file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("question #{index} is invalid: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("question #{index} duplicates an earlier question: {question}")]
    Duplicate { index: usize, question: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Raw serde structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSeedFile {
    #[serde(default)]
    question: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQuestion {
    #[serde(rename = "type")]
    kind: String,
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read and validate a seed file.
pub fn load_seed_file(path: &Path) -> Result<Vec<Template>, SeedError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SeedError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_seed(&contents)
}

/// Parse seed TOML into templates. Every entry is validated; entries are
/// numbered from 1 in error messages.
pub fn parse_seed(contents: &str) -> Result<Vec<Template>, SeedError> {
    let raw: RawSeedFile = toml::from_str(contents)?;

    let mut seen = HashSet::new();
    let mut templates = Vec::with_capacity(raw.question.len());
    for (i, entry) in raw.question.into_iter().enumerate() {
        let index = i + 1;
        let kind: TemplateKind = entry
            .kind
            .parse()
            .map_err(|reason| SeedError::Invalid { index, reason })?;

        let question = entry.question.trim().to_string();
        let options = entry
            .options
            .into_iter()
            .map(|o| o.trim().to_string())
            .collect();
        let template = Template::new(kind, question, options);
        template
            .validate()
            .map_err(|reason| SeedError::Invalid { index, reason })?;

        if !seen.insert(template.question.clone()) {
            return Err(SeedError::Duplicate {
                index,
                question: template.question,
            });
        }
        templates.push(template);
    }
    Ok(templates)
}

/// Replace the store's template set and return how many templates it holds.
pub fn seed_store<S: TemplateStore + ?Sized>(
    store: &S,
    templates: &[Template],
) -> Result<usize, SeedError> {
    store.replace_all(templates)?;
    let count = store.count_all()?;
    info!("Seeded {count} question templates");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::AskedLedger;

    const SAMPLE: &str = r#"
[[question]]
type = "member_options"
question = "Who is most likely to adopt three cats?"

[[question]]
type = "custom_options"
question = "What would {member} bring to a picnic?"
options = ["Sandwiches", "A guitar", "Nothing at all"]
"#;

    #[test]
    fn parses_both_kinds() {
        let templates = parse_seed(SAMPLE).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].kind, TemplateKind::MemberOptions);
        assert!(templates[0].options.is_empty());
        assert_eq!(templates[1].kind, TemplateKind::CustomOptions);
        assert_eq!(templates[1].options, vec!["Sandwiches", "A guitar", "Nothing at all"]);
    }

    #[test]
    fn ids_depend_only_on_question_text() {
        let a = parse_seed(SAMPLE).unwrap();
        let b = parse_seed(SAMPLE).unwrap();
        assert_eq!(a[0].id, b[0].id);
        assert_ne!(a[0].id, a[1].id);
    }

    #[test]
    fn empty_file_yields_no_templates() {
        assert!(parse_seed("").unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected_with_index() {
        let toml = r#"
[[question]]
type = "member_options"
question = "Who sings loudest?"

[[question]]
type = "open_text"
question = "Anything?"
"#;
        match parse_seed(toml) {
            Err(SeedError::Invalid { index, reason }) => {
                assert_eq!(index, 2);
                assert!(reason.contains("open_text"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn custom_question_without_placeholder_is_rejected() {
        let toml = r#"
[[question]]
type = "custom_options"
question = "Favourite colour?"
options = ["Red", "Blue"]
"#;
        assert!(matches!(parse_seed(toml), Err(SeedError::Invalid { index: 1, .. })));
    }

    #[test]
    fn overlong_question_is_rejected() {
        let toml = format!(
            "[[question]]\ntype = \"member_options\"\nquestion = \"{}\"\n",
            "a".repeat(400)
        );
        match parse_seed(&toml) {
            Err(SeedError::Invalid { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("300"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn custom_question_with_one_option_is_rejected() {
        let toml = r#"
[[question]]
type = "custom_options"
question = "Would {member} go skydiving?"
options = ["Yes"]
"#;
        assert!(matches!(parse_seed(toml), Err(SeedError::Invalid { .. })));
    }

    #[test]
    fn duplicate_questions_are_rejected() {
        let toml = r#"
[[question]]
type = "member_options"
question = "Who is the best cook?"

[[question]]
type = "member_options"
question = "  Who is the best cook?  "
"#;
        match parse_seed(toml) {
            Err(SeedError::Duplicate { index, question }) => {
                assert_eq!(index, 2);
                assert_eq!(question, "Who is the best cook?");
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let toml = r#"
[[question]]
type = "member_options"
question = "Who dances best?"
answer = "everyone"
"#;
        assert!(matches!(parse_seed(toml), Err(SeedError::Parse(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_seed_file(Path::new("/nonexistent/questions.toml")).unwrap_err();
        assert!(matches!(err, SeedError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/questions.toml"));
    }

    #[test]
    fn load_seed_file_reads_from_disk() {
        let dir = std::env::temp_dir().join("groupquiz_seed_test_load");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("questions.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let templates = load_seed_file(&path).unwrap();
        assert_eq!(templates.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn seed_store_reports_count_and_is_repeatable() {
        let db = Database::open(":memory:").unwrap();
        let templates = parse_seed(SAMPLE).unwrap();

        assert_eq!(seed_store(&db, &templates).unwrap(), 2);
        assert_eq!(seed_store(&db, &templates).unwrap(), 2);
    }

    #[test]
    fn reseeding_keeps_history_of_surviving_questions() {
        let db = Database::open(":memory:").unwrap();
        let templates = parse_seed(SAMPLE).unwrap();
        seed_store(&db, &templates).unwrap();
        db.record_asked(1, &templates[0].id).unwrap();
        db.record_asked(1, &templates[1].id).unwrap();

        seed_store(&db, &templates[..1]).unwrap();

        let excluded = db.exclusion_set(1).unwrap();
        assert_eq!(excluded.len(), 1);
        assert!(excluded.contains(&templates[0].id));
    }
}
