// Chat command parsing and handling.
//
// Each command maps to one registry or orchestrator call plus a fixed reply.
// Replies are returned to the caller rather than sent from here, so the
// handler can be tested without a chat connection.

use std::sync::Arc;

use groupquiz_core::template::MAX_DISPLAY_NAME_CHARS;
use groupquiz_core::{
    DeliveryOrchestrator, DeliveryOutcome, GroupId, Messenger, QuizStore, StoreError, Trigger,
};
use tracing::{error, info, warn};

use crate::telegram::User;

const GENERIC_ERROR: &str = "Sorry, something went wrong. Please try again.";

const HELP_TEXT: &str = "\
*Group Quiz Commands*

/start - Welcome message and instructions
/participate - Join the quiz in this group
/unparticipate - Stop participating (you can rejoin anytime)
/question - Get a question poll right now (participants only)
/participants - See how many people are participating
/help - Show this help message

A new question is posted every day. Vote for whoever fits best!";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Participate,
    Unparticipate,
    Question,
    Participants,
}

impl Command {
    /// Parse the leading `/command` of a message. `/command@name` is only
    /// accepted when `name` is this bot's username.
    pub fn parse(text: &str, bot_username: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.strip_prefix('/')?;
        let name = match word.split_once('@') {
            Some((name, target)) => {
                if !target.eq_ignore_ascii_case(bot_username) {
                    return None;
                }
                name
            }
            None => word,
        };

        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "participate" => Some(Command::Participate),
            "unparticipate" => Some(Command::Unparticipate),
            "question" => Some(Command::Question),
            "participants" => Some(Command::Participants),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Handling
// ---------------------------------------------------------------------------

/// Who issued a command, and where.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub chat_id: GroupId,
    pub user: &'a User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub markdown: bool,
}

impl Reply {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: false,
        }
    }

    fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: true,
        }
    }
}

/// Name stored for a participant: first name, else username, else `User<id>`.
pub fn display_name(user: &User) -> String {
    let first = user.first_name.trim();
    let name = if !first.is_empty() {
        first.to_string()
    } else if let Some(username) = user.username.as_deref().filter(|u| !u.trim().is_empty()) {
        username.trim().to_string()
    } else {
        format!("User{}", user.id)
    };
    name.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
}

pub struct CommandHandler<S, M> {
    store: Arc<S>,
    orchestrator: Arc<DeliveryOrchestrator<S, M>>,
    ask_now_enabled: bool,
}

impl<S: QuizStore, M: Messenger> CommandHandler<S, M> {
    pub fn new(
        store: Arc<S>,
        orchestrator: Arc<DeliveryOrchestrator<S, M>>,
        ask_now_enabled: bool,
    ) -> Self {
        Self {
            store,
            orchestrator,
            ask_now_enabled,
        }
    }

    /// Handle one command. `None` means nothing needs to be posted back.
    pub async fn handle(&self, command: Command, ctx: CommandContext<'_>) -> Option<Reply> {
        let result = match command {
            Command::Start => Ok(Some(self.start(ctx))),
            Command::Help => Ok(Some(Reply::markdown(HELP_TEXT))),
            Command::Participate => self.participate(ctx).map(Some),
            Command::Unparticipate => self.unparticipate(ctx).map(Some),
            Command::Question => self.question(ctx).await,
            Command::Participants => self.participants(ctx).map(Some),
        };

        result.unwrap_or_else(|e| {
            error!("/{command:?} in chat {} failed: {e}", ctx.chat_id);
            Some(Reply::plain(GENERIC_ERROR))
        })
    }

    fn start(&self, ctx: CommandContext<'_>) -> Reply {
        Reply::plain(format!(
            "Hi {}!\n\n\
             Welcome to the group quiz. To take part, use /participate.\n\
             Then use /question to get a poll about the group, \
             and /participants to see how many people have joined.",
            display_name(ctx.user)
        ))
    }

    fn participate(&self, ctx: CommandContext<'_>) -> Result<Reply, StoreError> {
        let name = display_name(ctx.user);
        if self.store.is_member(ctx.chat_id, ctx.user.id)? {
            return Ok(Reply::plain(format!(
                "You're already participating, {name}! Use /question to get a question."
            )));
        }
        self.store.add(ctx.chat_id, ctx.user.id, &name)?;
        info!("User {} joined chat {}", ctx.user.id, ctx.chat_id);
        Ok(Reply::plain(format!(
            "Great! {name} is now participating. Use /question to get started!"
        )))
    }

    fn unparticipate(&self, ctx: CommandContext<'_>) -> Result<Reply, StoreError> {
        let name = display_name(ctx.user);
        if !self.store.remove(ctx.chat_id, ctx.user.id)? {
            return Ok(Reply::plain(format!(
                "You're not currently participating, {name}. Use /participate to join!"
            )));
        }
        info!("User {} left chat {}", ctx.user.id, ctx.chat_id);
        Ok(Reply::plain(format!(
            "{name} has stopped participating. You can rejoin anytime with /participate!"
        )))
    }

    async fn question(&self, ctx: CommandContext<'_>) -> Result<Option<Reply>, StoreError> {
        if !self.ask_now_enabled {
            return Ok(Some(Reply::plain(
                "This feature is currently disabled. A new question is posted every day!",
            )));
        }
        if !self.store.is_member(ctx.chat_id, ctx.user.id)? {
            return Ok(Some(Reply::plain(
                "You need to participate first! Use /participate",
            )));
        }

        let reply = match self.orchestrator.deliver(ctx.chat_id, Trigger::OnDemand).await {
            DeliveryOutcome::Sent { .. } => None,
            DeliveryOutcome::Blocked(reason) => Some(Reply::plain(reason.user_message())),
            DeliveryOutcome::SkippedNoParticipants => {
                Some(Reply::plain("Sorry, no participants available for this question!"))
            }
            DeliveryOutcome::Failed(e) => {
                warn!("On-demand question for chat {} failed: {e}", ctx.chat_id);
                Some(Reply::plain(
                    "Sorry, I couldn't post a question right now. Please try again later.",
                ))
            }
        };
        Ok(reply)
    }

    fn participants(&self, ctx: CommandContext<'_>) -> Result<Reply, StoreError> {
        let count = self.store.count(ctx.chat_id)?;
        if count == 0 {
            return Ok(Reply::plain(
                "No participants yet in this group! Be the first with /participate",
            ));
        }
        Ok(Reply::plain(format!(
            "Participants in this group: {count}\n\nKeep it going with /question!"
        )))
    }
}
