// SQLite persistence for templates, participants and the asked-question ledger.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{AskedLedger, GroupId, ParticipantRegistry, TemplateStore, UserId};
use crate::template::{Template, TemplateId, TemplateKind};

/// SQLite-backed implementation of every storage collaborator.
///
/// The handle is created once by the process entry point and shared (behind
/// an `Arc`) with the selector, the orchestrator and the command layer.
pub struct Database {
    conn: Mutex<Connection>,
}

/// Raw template row as stored; converted to a [`Template`] outside the
/// rusqlite row closure so decoding failures get their own error variant.
struct TemplateRow {
    id: String,
    kind: String,
    question: String,
    options: String,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(StoreError::unavailable("open"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::unavailable("set pragmas"))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS question_templates (
                id       TEXT PRIMARY KEY,
                kind     TEXT NOT NULL,
                question TEXT NOT NULL UNIQUE,
                options  TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS participants (
                group_id     INTEGER NOT NULL,
                user_id      INTEGER NOT NULL,
                display_name TEXT NOT NULL,
                joined_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS asked_questions (
                group_id    INTEGER NOT NULL,
                template_id TEXT NOT NULL REFERENCES question_templates(id),
                asked_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (group_id, template_id)
            );
            ",
        )
        .map_err(StoreError::unavailable("create schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

impl TemplateRow {
    fn into_template(self) -> Result<Template, StoreError> {
        let kind: TemplateKind = self
            .kind
            .parse()
            .map_err(|reason| StoreError::InvalidTemplate {
                id: self.id.clone(),
                reason,
            })?;
        let options: Vec<String> =
            serde_json::from_str(&self.options).map_err(|e| StoreError::InvalidTemplate {
                id: self.id.clone(),
                reason: format!("options are not a JSON string array: {e}"),
            })?;
        Ok(Template {
            id: TemplateId::from_stored(self.id),
            kind,
            question: self.question,
            options,
        })
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

impl TemplateStore for Database {
    fn random_excluding(
        &self,
        excluded: &HashSet<TemplateId>,
    ) -> Result<Option<Template>, StoreError> {
        let mut sql = String::from("SELECT id, kind, question, options FROM question_templates");
        if !excluded.is_empty() {
            let placeholders = vec!["?"; excluded.len()].join(", ");
            sql.push_str(&format!(" WHERE id NOT IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY RANDOM() LIMIT 1");

        let conn = self.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(StoreError::unavailable("prepare random template query"))?;
        let mut rows = stmt
            .query_map(params_from_iter(excluded.iter().map(|id| id.as_str())), |row| {
                Ok(TemplateRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    question: row.get(2)?,
                    options: row.get(3)?,
                })
            })
            .map_err(StoreError::unavailable("query random template"))?;

        let first = rows.next();
        match first {
            Some(row) => {
                let row = row.map_err(StoreError::unavailable("read template row"))?;
                row.into_template().map(Some)
            }
            None => Ok(None),
        }
    }

    fn count_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM question_templates", [], |row| row.get(0))
            .map_err(StoreError::unavailable("count templates"))?;
        Ok(count as usize)
    }

    fn all_ids(&self) -> Result<HashSet<TemplateId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id FROM question_templates")
            .map_err(StoreError::unavailable("prepare template id query"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StoreError::unavailable("query template ids"))?
            .map(|r| r.map(TemplateId::from_stored))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StoreError::unavailable("read template ids"))?;
        Ok(ids)
    }

    fn replace_all(&self, templates: &[Template]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(StoreError::unavailable("begin template import"))?;

        let keep: HashSet<&str> = templates.iter().map(|t| t.id.as_str()).collect();
        let existing: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM question_templates")
                .map_err(StoreError::unavailable("prepare template id query"))?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(StoreError::unavailable("query template ids"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::unavailable("read template ids"))?;
            ids
        };

        for stale in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            tx.execute(
                "DELETE FROM asked_questions WHERE template_id = ?1",
                params![stale],
            )
            .map_err(StoreError::unavailable("drop asked records of removed template"))?;
            tx.execute("DELETE FROM question_templates WHERE id = ?1", params![stale])
                .map_err(StoreError::unavailable("delete removed template"))?;
            debug!("Removed template {stale}");
        }

        for template in templates {
            let options_json =
                serde_json::to_string(&template.options).map_err(|source| StoreError::Encoding {
                    what: "template options",
                    source,
                })?;
            tx.execute(
                "INSERT INTO question_templates (id, kind, question, options)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    kind    = excluded.kind,
                    options = excluded.options",
                params![
                    template.id.as_str(),
                    template.kind.as_str(),
                    template.question,
                    options_json,
                ],
            )
            .map_err(StoreError::unavailable("insert template"))?;
        }

        tx.commit()
            .map_err(StoreError::unavailable("commit template import"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

impl ParticipantRegistry for Database {
    fn add(&self, group: GroupId, user: UserId, name: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO participants (group_id, user_id, display_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                display_name = excluded.display_name",
            params![group, user, name],
        )
        .map_err(StoreError::unavailable("add participant"))?;
        Ok(())
    }

    fn remove(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let removed = conn
            .execute(
                "DELETE FROM participants WHERE group_id = ?1 AND user_id = ?2",
                params![group, user],
            )
            .map_err(StoreError::unavailable("remove participant"))?;
        Ok(removed > 0)
    }

    fn list_names(&self, group: GroupId) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT display_name FROM participants WHERE group_id = ?1 ORDER BY rowid")
            .map_err(StoreError::unavailable("prepare participant name query"))?;
        let names = stmt
            .query_map(params![group], |row| row.get(0))
            .map_err(StoreError::unavailable("query participant names"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(StoreError::unavailable("read participant names"))?;
        Ok(names)
    }

    fn count(&self, group: GroupId) -> Result<usize, StoreError> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM participants WHERE group_id = ?1",
                params![group],
                |row| row.get(0),
            )
            .map_err(StoreError::unavailable("count participants"))?;
        Ok(count as usize)
    }

    fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM participants WHERE group_id = ?1 AND user_id = ?2)",
                params![group, user],
                |row| row.get(0),
            )
            .map_err(StoreError::unavailable("check participation"))?;
        Ok(exists)
    }

    fn groups_with_participants(&self) -> Result<BTreeSet<GroupId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT group_id FROM participants")
            .map_err(StoreError::unavailable("prepare group query"))?;
        let groups = stmt
            .query_map([], |row| row.get(0))
            .map_err(StoreError::unavailable("query groups"))?
            .collect::<Result<BTreeSet<GroupId>, _>>()
            .map_err(StoreError::unavailable("read groups"))?;
        Ok(groups)
    }
}

// ---------------------------------------------------------------------------
// Asked-question ledger
// ---------------------------------------------------------------------------

impl AskedLedger for Database {
    fn record_asked(&self, group: GroupId, template: &TemplateId) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO asked_questions (group_id, template_id) VALUES (?1, ?2)",
            params![group, template.as_str()],
        )
        .map_err(StoreError::unavailable("record asked question"))?;
        Ok(())
    }

    fn exclusion_set(&self, group: GroupId) -> Result<HashSet<TemplateId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT template_id FROM asked_questions WHERE group_id = ?1")
            .map_err(StoreError::unavailable("prepare exclusion set query"))?;
        let ids = stmt
            .query_map(params![group], |row| row.get::<_, String>(0))
            .map_err(StoreError::unavailable("query exclusion set"))?
            .map(|r| r.map(TemplateId::from_stored))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StoreError::unavailable("read exclusion set"))?;
        Ok(ids)
    }

    fn reset(&self, group: GroupId) -> Result<(), StoreError> {
        let conn = self.conn();
        let cleared = conn
            .execute(
                "DELETE FROM asked_questions WHERE group_id = ?1",
                params![group],
            )
            .map_err(StoreError::unavailable("reset asked questions"))?;
        debug!(group, cleared, "Cleared asked-question ledger");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: GroupId = -100_123;
    const OTHER_GROUP: GroupId = -100_456;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    fn member_template(question: &str) -> Template {
        Template::new(TemplateKind::MemberOptions, question, vec![])
    }

    fn seeded_db(n: usize) -> (Database, Vec<Template>) {
        let db = test_db();
        let templates: Vec<Template> = (0..n)
            .map(|i| member_template(&format!("Question number {i}?")))
            .collect();
        db.replace_all(&templates).unwrap();
        (db, templates)
    }

    // ------------------------------------------------------------------
    // Schema / open
    // ------------------------------------------------------------------

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"question_templates".to_string()));
        assert!(tables.contains(&"participants".to_string()));
        assert!(tables.contains(&"asked_questions".to_string()));
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    #[test]
    fn replace_all_stores_templates_with_options() {
        let db = test_db();
        let custom = Template::new(
            TemplateKind::CustomOptions,
            "Would {member} win a dance-off?",
            vec!["Yes".into(), "No".into(), "Only on Fridays".into()],
        );
        db.replace_all(&[custom.clone(), member_template("Who naps most?")])
            .unwrap();

        assert_eq!(db.count_all().unwrap(), 2);

        let mut excluded = HashSet::new();
        excluded.insert(TemplateId::from_question("Who naps most?"));
        let drawn = db.random_excluding(&excluded).unwrap().unwrap();
        assert_eq!(drawn, custom);
    }

    #[test]
    fn replace_all_twice_does_not_duplicate() {
        let (db, templates) = seeded_db(3);
        db.replace_all(&templates).unwrap();
        assert_eq!(db.count_all().unwrap(), 3);
    }

    #[test]
    fn random_excluding_returns_none_when_all_excluded() {
        let (db, templates) = seeded_db(3);
        let all: HashSet<TemplateId> = templates.iter().map(|t| t.id.clone()).collect();
        assert!(db.random_excluding(&all).unwrap().is_none());
    }

    #[test]
    fn random_excluding_returns_none_on_empty_store() {
        let db = test_db();
        assert!(db.random_excluding(&HashSet::new()).unwrap().is_none());
        assert_eq!(db.count_all().unwrap(), 0);
    }

    #[test]
    fn random_excluding_never_returns_excluded_ids() {
        let (db, templates) = seeded_db(5);
        let excluded: HashSet<TemplateId> =
            templates[..4].iter().map(|t| t.id.clone()).collect();
        for _ in 0..20 {
            let t = db.random_excluding(&excluded).unwrap().unwrap();
            assert_eq!(t.id, templates[4].id);
        }
    }

    #[test]
    fn all_ids_matches_seeded_set() {
        let (db, templates) = seeded_db(4);
        let expected: HashSet<TemplateId> = templates.iter().map(|t| t.id.clone()).collect();
        assert_eq!(db.all_ids().unwrap(), expected);
    }

    #[test]
    fn replace_all_drops_asked_records_of_removed_templates() {
        let (db, templates) = seeded_db(3);
        db.record_asked(GROUP, &templates[0].id).unwrap();
        db.record_asked(GROUP, &templates[1].id).unwrap();

        // Re-seed without template 0.
        db.replace_all(&templates[1..]).unwrap();

        let excluded = db.exclusion_set(GROUP).unwrap();
        assert_eq!(excluded.len(), 1);
        assert!(excluded.contains(&templates[1].id));
        assert!(excluded.is_subset(&db.all_ids().unwrap()));
    }

    #[test]
    fn unknown_stored_kind_is_reported_as_invalid_template() {
        let db = test_db();
        db.conn()
            .execute(
                "INSERT INTO question_templates (id, kind, question, options)
                 VALUES ('abc', 'free_text', 'Anything?', '[]')",
                [],
            )
            .unwrap();

        let err = db.random_excluding(&HashSet::new()).unwrap_err();
        match err {
            StoreError::InvalidTemplate { id, reason } => {
                assert_eq!(id, "abc");
                assert!(reason.contains("free_text"));
            }
            other => panic!("expected InvalidTemplate, got: {other}"),
        }
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    #[test]
    fn add_is_an_upsert() {
        let db = test_db();
        db.add(GROUP, 1, "Alex").unwrap();
        db.add(GROUP, 1, "Alexandra").unwrap();

        assert_eq!(db.count(GROUP).unwrap(), 1);
        assert_eq!(db.list_names(GROUP).unwrap(), vec!["Alexandra".to_string()]);
    }

    #[test]
    fn remove_reports_whether_anything_was_removed() {
        let db = test_db();
        db.add(GROUP, 1, "Alex").unwrap();

        assert!(db.remove(GROUP, 1).unwrap());
        assert!(!db.remove(GROUP, 1).unwrap());
        assert!(!db.is_member(GROUP, 1).unwrap());
    }

    #[test]
    fn participants_are_scoped_per_group() {
        let db = test_db();
        db.add(GROUP, 1, "Alex").unwrap();
        db.add(GROUP, 2, "Blair").unwrap();
        db.add(OTHER_GROUP, 1, "Alex").unwrap();

        assert_eq!(db.count(GROUP).unwrap(), 2);
        assert_eq!(db.count(OTHER_GROUP).unwrap(), 1);
        assert!(db.is_member(OTHER_GROUP, 1).unwrap());
        assert!(!db.is_member(OTHER_GROUP, 2).unwrap());
    }

    #[test]
    fn list_names_preserves_join_order() {
        let db = test_db();
        for (id, name) in [(3, "Casey"), (1, "Alex"), (2, "Blair")] {
            db.add(GROUP, id, name).unwrap();
        }
        assert_eq!(db.list_names(GROUP).unwrap(), vec!["Casey", "Alex", "Blair"]);
    }

    #[test]
    fn groups_with_participants_lists_each_group_once() {
        let db = test_db();
        db.add(GROUP, 1, "Alex").unwrap();
        db.add(GROUP, 2, "Blair").unwrap();
        db.add(OTHER_GROUP, 3, "Casey").unwrap();
        db.add(42, 4, "Drew").unwrap();
        db.remove(42, 4).unwrap();

        let groups: Vec<GroupId> = db.groups_with_participants().unwrap().into_iter().collect();
        assert_eq!(groups, vec![OTHER_GROUP, GROUP]);
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    #[test]
    fn record_asked_is_idempotent() {
        let (db, templates) = seeded_db(2);
        db.record_asked(GROUP, &templates[0].id).unwrap();
        let once = db.exclusion_set(GROUP).unwrap();
        db.record_asked(GROUP, &templates[0].id).unwrap();
        let twice = db.exclusion_set(GROUP).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn record_asked_rejects_unknown_template() {
        let (db, _) = seeded_db(1);
        let bogus = TemplateId::from_question("never seeded");
        assert!(db.record_asked(GROUP, &bogus).is_err());
        assert!(db.exclusion_set(GROUP).unwrap().is_empty());
    }

    #[test]
    fn reset_clears_only_the_given_group() {
        let (db, templates) = seeded_db(2);
        db.record_asked(GROUP, &templates[0].id).unwrap();
        db.record_asked(OTHER_GROUP, &templates[1].id).unwrap();

        db.reset(GROUP).unwrap();

        assert!(db.exclusion_set(GROUP).unwrap().is_empty());
        assert_eq!(db.exclusion_set(OTHER_GROUP).unwrap().len(), 1);
    }

    #[test]
    fn record_asked_auto_generates_timestamp() {
        let (db, templates) = seeded_db(1);
        db.record_asked(GROUP, &templates[0].id).unwrap();

        let ts: String = db
            .conn()
            .query_row(
                "SELECT asked_at FROM asked_questions WHERE group_id = ?1",
                params![GROUP],
                |row| row.get(0),
            )
            .unwrap();
        assert!(ts.contains('T'));
    }

    #[test]
    fn database_persists_across_reopen() {
        let db_path = std::env::temp_dir().join(format!("groupquiz_reopen_{}.db", std::process::id()));
        let db_path_str = db_path.to_str().unwrap();
        let template = member_template("Who remembers birthdays?");

        {
            let db = Database::open(db_path_str).unwrap();
            db.replace_all(&[template.clone()]).unwrap();
            db.add(GROUP, 7, "Quinn").unwrap();
            db.record_asked(GROUP, &template.id).unwrap();
        }

        let db = Database::open(db_path_str).unwrap();
        assert_eq!(db.count_all().unwrap(), 1);
        assert!(db.is_member(GROUP, 7).unwrap());
        assert!(db.exclusion_set(GROUP).unwrap().contains(&template.id));

        drop(db);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(format!("{db_path_str}-wal"));
        let _ = std::fs::remove_file(format!("{db_path_str}-shm"));
    }
}
