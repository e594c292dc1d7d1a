// Delivery orchestration: select a question, send it as a poll, and record
// it in the ledger only once the send is confirmed.
//
// Attempt state machine:
//   Selecting -> Sending(primary) -> Success
//                                 -> Sending(fallback) -> Success | Failed
//             -> Blocked | Failed

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::DeliveryError;
use crate::selector::{BlockReason, Outcome, PreparedQuestion, QuestionSelector};
use crate::store::{GroupId, QuizStore};
use crate::template::TemplateId;

// ---------------------------------------------------------------------------
// Messaging collaborator
// ---------------------------------------------------------------------------

/// Where a poll is posted: a chat, optionally narrowed to a forum topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: GroupId,
    pub thread_id: Option<i64>,
}

impl Destination {
    pub fn chat(chat_id: GroupId) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "{}/{}", self.chat_id, thread),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub destination: Destination,
    pub question: String,
    pub options: Vec<String>,
    pub anonymous: bool,
    pub multiple_answers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The chat or topic the poll was addressed to does not exist.
    DestinationNotFound,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn destination_not_found(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::DestinationNotFound,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Other,
            message: message.into(),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SendError {}

/// Sends polls to the chat platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_poll(&self, poll: &PollRequest) -> Result<(), SendError>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// What started a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The daily job. Groups without participants are skipped outright.
    Scheduled,
    /// A participant asked for a question. The caller has already checked
    /// that the requester participates.
    OnDemand,
}

/// Terminal state of one delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Sent {
        template_id: TemplateId,
        destination: Destination,
    },
    SkippedNoParticipants,
    Blocked(BlockReason),
    Failed(DeliveryError),
}

/// Poll presentation settings applied to every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Forum topic to post into first; falls back to the chat itself when the
    /// topic does not exist.
    pub topic_id: Option<i64>,
    pub anonymous: bool,
    pub multiple_answers: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            topic_id: None,
            anonymous: false,
            multiple_answers: true,
        }
    }
}

pub struct DeliveryOrchestrator<S, M> {
    store: Arc<S>,
    messenger: Arc<M>,
    selector: QuestionSelector<S>,
    settings: PollSettings,
}

impl<S: QuizStore, M: Messenger> DeliveryOrchestrator<S, M> {
    pub fn new(store: Arc<S>, messenger: Arc<M>, settings: PollSettings) -> Self {
        let selector = QuestionSelector::new(Arc::clone(&store));
        Self {
            store,
            messenger,
            selector,
            settings,
        }
    }

    /// Run one delivery attempt for `group`.
    pub async fn deliver(&self, group: GroupId, trigger: Trigger) -> DeliveryOutcome {
        if trigger == Trigger::Scheduled {
            match self.store.count(group) {
                Ok(0) => {
                    info!("Group {group} has no participants, skipping");
                    return DeliveryOutcome::SkippedNoParticipants;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to count participants of group {group}: {e}");
                    return DeliveryOutcome::Failed(e.into());
                }
            }
        }

        // The RNG is not Send; keep it out of any await.
        let selected = {
            let mut rng = rand::thread_rng();
            self.selector.select(group, &mut rng)
        };

        let question = match selected {
            Ok(Outcome::Ready(question)) => question,
            Ok(Outcome::Blocked(reason)) => {
                info!("Question for group {group} blocked: {reason}");
                return DeliveryOutcome::Blocked(reason);
            }
            Err(e) => {
                error!("Question selection for group {group} failed: {e}");
                return DeliveryOutcome::Failed(e.into());
            }
        };

        let destination = match self.send(group, &question).await {
            Ok(destination) => destination,
            Err(e) => {
                error!("Failed to send poll to group {group}: {e}");
                return DeliveryOutcome::Failed(DeliveryError::Send(e));
            }
        };

        // The poll is out; a ledger failure only risks a repeat later.
        if let Err(e) = self.store.record_asked(group, &question.template_id) {
            warn!(
                "Poll sent to {destination} but template {} was not recorded: {e}",
                question.template_id
            );
        }

        info!(
            "Sent question {} to {destination} ({} options)",
            question.template_id,
            question.options.len()
        );
        DeliveryOutcome::Sent {
            template_id: question.template_id,
            destination,
        }
    }

    /// Send to the configured topic, falling back once to the chat itself if
    /// the topic is gone. Returns where the poll ended up.
    async fn send(
        &self,
        group: GroupId,
        question: &PreparedQuestion,
    ) -> Result<Destination, SendError> {
        let primary = Destination {
            chat_id: group,
            thread_id: self.settings.topic_id,
        };

        match self.messenger.send_poll(&self.poll_for(primary, question)).await {
            Ok(()) => Ok(primary),
            Err(e) if e.kind == SendErrorKind::DestinationNotFound && primary.thread_id.is_some() => {
                warn!("Topic {primary} not found ({e}), retrying in the main chat");
                let fallback = Destination::chat(group);
                self.messenger
                    .send_poll(&self.poll_for(fallback, question))
                    .await
                    .map(|()| fallback)
            }
            Err(e) => Err(e),
        }
    }

    fn poll_for(&self, destination: Destination, question: &PreparedQuestion) -> PollRequest {
        PollRequest {
            destination,
            question: question.text.clone(),
            options: question.options.clone(),
            anonymous: self.settings.anonymous,
            multiple_answers: self.settings.multiple_answers,
        }
    }
}
