// Storage collaborators used by the selector and the delivery orchestrator.
//
// The traits are synchronous: the only production backend is a local SQLite
// file (see `db.rs`). Tests swap in stubs where a failing backend is needed.

use std::collections::{BTreeSet, HashSet};

use crate::error::StoreError;
use crate::template::{Template, TemplateId};

/// Telegram chat identifier of a group.
pub type GroupId = i64;

/// Telegram user identifier.
pub type UserId = i64;

/// Holds the question templates.
pub trait TemplateStore: Send + Sync {
    /// One template chosen uniformly at random among those whose id is not in
    /// `excluded`, or `None` if every template is excluded (or none exist).
    fn random_excluding(&self, excluded: &HashSet<TemplateId>)
        -> Result<Option<Template>, StoreError>;

    fn count_all(&self) -> Result<usize, StoreError>;

    fn all_ids(&self) -> Result<HashSet<TemplateId>, StoreError>;

    /// Replace the template set with `templates`. Asked records for templates
    /// that disappear are dropped so exclusion sets stay within the pool.
    fn replace_all(&self, templates: &[Template]) -> Result<(), StoreError>;
}

/// Per-group set of opted-in participants.
pub trait ParticipantRegistry: Send + Sync {
    /// Insert the participant, or refresh the display name if already present.
    fn add(&self, group: GroupId, user: UserId, name: &str) -> Result<(), StoreError>;

    /// Returns `true` if a participant was actually removed.
    fn remove(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;

    /// Display names in join order.
    fn list_names(&self, group: GroupId) -> Result<Vec<String>, StoreError>;

    fn count(&self, group: GroupId) -> Result<usize, StoreError>;

    fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;

    fn groups_with_participants(&self) -> Result<BTreeSet<GroupId>, StoreError>;
}

/// Per-group record of templates already delivered.
pub trait AskedLedger: Send + Sync {
    /// Mark `template` as asked in `group`. Recording the same pair twice has
    /// no additional effect.
    fn record_asked(&self, group: GroupId, template: &TemplateId) -> Result<(), StoreError>;

    fn exclusion_set(&self, group: GroupId) -> Result<HashSet<TemplateId>, StoreError>;

    /// Forget everything asked in `group`.
    fn reset(&self, group: GroupId) -> Result<(), StoreError>;
}

/// Everything the quiz engine needs from storage.
pub trait QuizStore: TemplateStore + ParticipantRegistry + AskedLedger {}

impl<T> QuizStore for T where T: TemplateStore + ParticipantRegistry + AskedLedger {}
