// Telegram Bot API client.
//
// Speaks the JSON flavor of the Bot API over reqwest. Every response arrives
// in the `{ ok, result, description, error_code }` envelope, including
// non-2xx statuses, so the status code is not checked separately.

use std::time::Duration;

use async_trait::async_trait;
use groupquiz_core::{GroupId, Messenger, PollRequest, SendError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Slack added on top of the long-poll timeout before the HTTP request
/// itself gives up.
const LONG_POLL_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request to Telegram failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error {code}: {description}")]
    Api {
        code: i64,
        description: String,
    },

    #[error("Telegram returned ok without a result for {method}")]
    MissingResult { method: &'static str },
}

impl TelegramError {
    /// True when the API rejected the request because the forum topic it
    /// targeted does not exist or is not usable.
    pub fn is_destination_not_found(&self) -> bool {
        match self {
            TelegramError::Api { description, .. } => {
                let description = description.to_ascii_lowercase();
                description.contains("thread not found")
                    || description.contains("topic_deleted")
                    || description.contains("topic_closed")
            }
            _ => false,
        }
    }
}

impl From<TelegramError> for SendError {
    fn from(e: TelegramError) -> Self {
        if e.is_destination_not_found() {
            SendError::destination_not_found(e.to_string())
        } else {
            SendError::other(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub is_topic_message: bool,
}

impl Message {
    /// Thread to reply into: only set for messages posted inside a forum topic.
    pub fn reply_thread(&self) -> Option<i64> {
        if self.is_topic_message {
            self.message_thread_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: GroupId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

// ---------------------------------------------------------------------------
// TelegramClient
// ---------------------------------------------------------------------------

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, TelegramError> {
        debug!(method, "Telegram API call");
        let response: ApiResponse<T> = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(TelegramError::Api {
                code: response.error_code.unwrap_or_default(),
                description: response
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            });
        }
        response
            .result
            .ok_or(TelegramError::MissingResult { method })
    }

    /// The bot's own account.
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", json!({}), REQUEST_TIMEOUT).await
    }

    /// Long-poll for message updates newer than `offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
    ) -> Result<Vec<Update>, TelegramError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", body, timeout + LONG_POLL_GRACE).await
    }

    pub async fn send_message(
        &self,
        chat_id: GroupId,
        thread_id: Option<i64>,
        text: &str,
        markdown: bool,
    ) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(thread) = thread_id {
            body["message_thread_id"] = json!(thread);
        }
        if markdown {
            body["parse_mode"] = json!("Markdown");
        }
        let _: serde_json::Value = self.call("sendMessage", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn send_poll(&self, poll: &PollRequest) -> Result<(), TelegramError> {
        let options: Vec<_> = poll.options.iter().map(|o| json!({ "text": o })).collect();
        let mut body = json!({
            "chat_id": poll.destination.chat_id,
            "question": poll.question,
            "options": options,
            "is_anonymous": poll.anonymous,
            "allows_multiple_answers": poll.multiple_answers,
        });
        if let Some(thread) = poll.destination.thread_id {
            body["message_thread_id"] = json!(thread);
        }
        let _: serde_json::Value = self.call("sendPoll", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send_poll(&self, poll: &PollRequest) -> Result<(), SendError> {
        TelegramClient::send_poll(self, poll)
            .await
            .map_err(SendError::from)
    }
}
