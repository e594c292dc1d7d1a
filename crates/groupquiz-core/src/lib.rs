// Library root for the group quiz engine: data model, storage, question
// rotation and poll delivery. The chat-platform side lives in groupquiz-bot.

pub mod db;
pub mod delivery;
pub mod error;
pub mod seed;
pub mod selector;
pub mod store;
pub mod template;

pub use db::Database;
pub use delivery::{
    DeliveryOrchestrator, DeliveryOutcome, Destination, Messenger, PollRequest, PollSettings,
    SendError, SendErrorKind, Trigger,
};
pub use error::{DeliveryError, StoreError};
pub use selector::{BlockReason, Outcome, PreparedQuestion, QuestionSelector};
pub use store::{AskedLedger, GroupId, ParticipantRegistry, QuizStore, TemplateStore, UserId};
pub use template::{Template, TemplateId, TemplateKind};
