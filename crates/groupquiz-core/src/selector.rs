// Question selection with per-group rotation.
//
// A draw excludes every template already asked in the group. When the draw
// comes back empty while templates exist, the group's ledger is reset and the
// draw is retried once against the full pool, so rotation never starves.

use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{GroupId, QuizStore};
use crate::template::{Template, TemplateId, TemplateKind};

/// Fewest participants a `member_options` question can be built from.
pub const MIN_MEMBER_OPTIONS: usize = 3;

/// Most participant names offered as options in one poll.
pub const MAX_MEMBER_OPTIONS: usize = 6;

/// A question ready to be sent as a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuestion {
    pub text: String,
    pub options: Vec<String>,
    pub template_id: TemplateId,
}

/// Business-rule reasons a question cannot be produced right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    NoTemplates,
    InsufficientParticipants,
    NoParticipants,
    /// A stored template could not be interpreted.
    InvalidTemplate,
}

impl BlockReason {
    /// Message shown to the group when a requested question is blocked.
    pub fn user_message(&self) -> &'static str {
        match self {
            BlockReason::NoTemplates => "Sorry, no questions available!",
            BlockReason::InsufficientParticipants => {
                "Sorry, need at least 3 participants for this type of question!"
            }
            BlockReason::NoParticipants => "Sorry, no participants available for this question!",
            BlockReason::InvalidTemplate => "Sorry, invalid question type!",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockReason::NoTemplates => "no_templates_exist",
            BlockReason::InsufficientParticipants => "insufficient_participants",
            BlockReason::NoParticipants => "no_participants",
            BlockReason::InvalidTemplate => "invalid_template",
        };
        f.write_str(s)
    }
}

/// Result of a selection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready(PreparedQuestion),
    Blocked(BlockReason),
}

/// Picks the next question for a group.
pub struct QuestionSelector<S> {
    store: Arc<S>,
}

impl<S> Clone for QuestionSelector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: QuizStore> QuestionSelector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Produce a ready-to-send question for `group`, or the reason none can
    /// be produced. Storage failures are returned as errors.
    ///
    /// This may reset the group's ledger (when every template has been
    /// asked) but never records anything: marking a template as asked is the
    /// caller's job once delivery is confirmed.
    pub fn select<R: Rng + ?Sized>(
        &self,
        group: GroupId,
        rng: &mut R,
    ) -> Result<Outcome, StoreError> {
        let template = match self.draw_template(group) {
            Ok(Some(template)) => template,
            Ok(None) => return Ok(Outcome::Blocked(BlockReason::NoTemplates)),
            Err(StoreError::InvalidTemplate { id, reason }) => {
                warn!("Skipping question for group {group}: template {id} is invalid ({reason})");
                return Ok(Outcome::Blocked(BlockReason::InvalidTemplate));
            }
            Err(e) => return Err(e),
        };

        match template.kind {
            TemplateKind::MemberOptions => self.member_question(group, template, rng),
            TemplateKind::CustomOptions => self.custom_question(group, template, rng),
        }
    }

    /// Two-phase draw: exclude asked templates, and on exhaustion reset the
    /// ledger and retry once against the full pool.
    fn draw_template(&self, group: GroupId) -> Result<Option<Template>, StoreError> {
        let excluded = self.store.exclusion_set(group)?;
        if let Some(template) = self.store.random_excluding(&excluded)? {
            return Ok(Some(template));
        }

        if self.store.count_all()? == 0 {
            warn!("No question templates in store");
            return Ok(None);
        }

        info!(
            "All {} templates asked in group {group}, starting a new rotation",
            excluded.len()
        );
        self.store.reset(group)?;

        let retry = self.store.random_excluding(&Default::default())?;
        if retry.is_none() {
            warn!("Template draw for group {group} came back empty after ledger reset");
        }
        Ok(retry)
    }

    fn member_question<R: Rng + ?Sized>(
        &self,
        group: GroupId,
        template: Template,
        rng: &mut R,
    ) -> Result<Outcome, StoreError> {
        let names = distinct(self.store.list_names(group)?);
        if names.len() < MIN_MEMBER_OPTIONS {
            debug!(
                "Group {group} has {} distinct participants, member question needs {MIN_MEMBER_OPTIONS}",
                names.len()
            );
            return Ok(Outcome::Blocked(BlockReason::InsufficientParticipants));
        }

        let upper = names.len().min(MAX_MEMBER_OPTIONS);
        let count = rng.gen_range(MIN_MEMBER_OPTIONS..=upper);
        let options: Vec<String> = names.choose_multiple(rng, count).cloned().collect();

        Ok(Outcome::Ready(PreparedQuestion {
            text: template.question,
            options,
            template_id: template.id,
        }))
    }

    fn custom_question<R: Rng + ?Sized>(
        &self,
        group: GroupId,
        template: Template,
        rng: &mut R,
    ) -> Result<Outcome, StoreError> {
        let names = self.store.list_names(group)?;
        let Some(member) = names.choose(rng) else {
            return Ok(Outcome::Blocked(BlockReason::NoParticipants));
        };

        Ok(Outcome::Ready(PreparedQuestion {
            text: template.render(member),
            options: template.options,
            template_id: template.id,
        }))
    }
}

/// Drop repeated display names, keeping first occurrences in order. Poll
/// options must be distinct.
fn distinct(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}
