// Application event loop: incoming chat updates and schedule ticks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use groupquiz_core::{DeliveryOrchestrator, GroupId, Messenger, QuizStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, CommandContext, CommandHandler, Reply};
use crate::scheduler::{self, JobSummary, Tick};
use crate::telegram::{TelegramClient, Update};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Reply channel
// ---------------------------------------------------------------------------

/// Posts command replies back into a chat.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn reply(&self, chat_id: GroupId, thread_id: Option<i64>, reply: &Reply)
        -> anyhow::Result<()>;
}

#[async_trait]
impl Replier for TelegramClient {
    async fn reply(
        &self,
        chat_id: GroupId,
        thread_id: Option<i64>,
        reply: &Reply,
    ) -> anyhow::Result<()> {
        self.send_message(chat_id, thread_id, &reply.text, reply.markdown)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Update poller
// ---------------------------------------------------------------------------

/// Long-poll Telegram for updates and forward them to the app loop. Errors
/// back off exponentially. Returns when the receiver is gone.
pub async fn run_update_poller(
    client: Arc<TelegramClient>,
    tx: mpsc::Sender<Update>,
    timeout: Duration,
) {
    let mut offset = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match client.get_updates(offset, timeout).await {
            Ok(updates) => {
                backoff = INITIAL_BACKOFF;
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if tx.send(update).await.is_err() {
                        info!("Update receiver closed, stopping poller");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("getUpdates failed: {e}; retrying in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState<S, M, R> {
    store: Arc<S>,
    orchestrator: Arc<DeliveryOrchestrator<S, M>>,
    commands: CommandHandler<S, M>,
    replier: Arc<R>,
    bot_username: String,
    pause_between_groups: Duration,
    daily_job: Option<JoinHandle<JobSummary>>,
}

impl<S, M, R> AppState<S, M, R>
where
    S: QuizStore + 'static,
    M: Messenger + 'static,
    R: Replier,
{
    pub fn new(
        store: Arc<S>,
        orchestrator: Arc<DeliveryOrchestrator<S, M>>,
        replier: Arc<R>,
        bot_username: String,
        ask_now_enabled: bool,
        pause_between_groups: Duration,
    ) -> Self {
        let commands =
            CommandHandler::new(Arc::clone(&store), Arc::clone(&orchestrator), ask_now_enabled);
        Self {
            store,
            orchestrator,
            commands,
            replier,
            bot_username,
            pause_between_groups,
            daily_job: None,
        }
    }

    async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let (Some(text), Some(user)) = (message.text.as_deref(), message.from.as_ref()) else {
            return;
        };
        if user.is_bot {
            return;
        }
        let Some(command) = Command::parse(text, &self.bot_username) else {
            return;
        };

        debug!("{command:?} from user {} in chat {}", user.id, message.chat.id);
        let ctx = CommandContext {
            chat_id: message.chat.id,
            user,
        };
        if let Some(reply) = self.commands.handle(command, ctx).await {
            if let Err(e) = self
                .replier
                .reply(message.chat.id, message.reply_thread(), &reply)
                .await
            {
                warn!("Failed to reply in chat {}: {e:#}", message.chat.id);
            }
        }
    }

    /// Start the daily job in the background unless the previous run is
    /// still going.
    fn start_daily_job(&mut self, tick: Tick) {
        if self.daily_job.as_ref().is_some_and(|job| !job.is_finished()) {
            warn!("Daily job from an earlier tick is still running, skipping {}", tick.scheduled_for);
            return;
        }

        info!("Starting daily job scheduled for {}", tick.scheduled_for);
        let store = Arc::clone(&self.store);
        let orchestrator = Arc::clone(&self.orchestrator);
        let pause = self.pause_between_groups;
        self.daily_job = Some(tokio::spawn(async move {
            scheduler::run_daily_job(store.as_ref(), &orchestrator, pause).await
        }));
    }

    /// Wait for an in-flight daily job, if any.
    pub async fn finish_daily_job(&mut self) -> Option<JobSummary> {
        let job = self.daily_job.take()?;
        match job.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("Daily job task failed: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the application event loop until the update channel closes.
///
/// Commands are handled inline. Each schedule tick spawns the daily job as a
/// separate task so commands keep flowing while it runs.
pub async fn run<S, M, R>(
    mut update_rx: mpsc::Receiver<Update>,
    mut tick_rx: mpsc::Receiver<Tick>,
    state: &mut AppState<S, M, R>,
) -> anyhow::Result<()>
where
    S: QuizStore + 'static,
    M: Messenger + 'static,
    R: Replier,
{
    info!("Application event loop started");

    // The scheduler may be disabled; stop polling its channel once closed.
    let mut ticks_open = true;

    loop {
        tokio::select! {
            update = update_rx.recv() => {
                match update {
                    Some(update) => state.handle_update(update).await,
                    None => {
                        info!("Update channel closed, shutting down");
                        break;
                    }
                }
            }

            tick = tick_rx.recv(), if ticks_open => {
                match tick {
                    Some(tick) => state.start_daily_job(tick),
                    None => {
                        info!("Schedule channel closed");
                        ticks_open = false;
                    }
                }
            }
        }
    }

    info!("Application event loop exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupquiz_core::{
        AskedLedger, Database, ParticipantRegistry, PollRequest, PollSettings, SendError,
        Template, TemplateKind, TemplateStore,
    };
    use std::sync::Mutex;

    const CHAT: GroupId = -900;

    #[derive(Default)]
    struct MockMessenger {
        polls: Mutex<Vec<PollRequest>>,
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_poll(&self, poll: &PollRequest) -> Result<(), SendError> {
            self.polls.lock().unwrap().push(poll.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockReplier {
        replies: Mutex<Vec<(GroupId, Option<i64>, String)>>,
    }

    #[async_trait]
    impl Replier for MockReplier {
        async fn reply(
            &self,
            chat_id: GroupId,
            thread_id: Option<i64>,
            reply: &Reply,
        ) -> anyhow::Result<()> {
            self.replies
                .lock()
                .unwrap()
                .push((chat_id, thread_id, reply.text.clone()));
            Ok(())
        }
    }

    type TestState = AppState<Database, MockMessenger, MockReplier>;

    fn state() -> (TestState, Arc<Database>, Arc<MockMessenger>, Arc<MockReplier>) {
        let db = Arc::new(Database::open(":memory:").unwrap());
        db.replace_all(&[Template::new(
            TemplateKind::MemberOptions,
            "Who would make the best astronaut?",
            vec![],
        )])
        .unwrap();
        let messenger = Arc::new(MockMessenger::default());
        let replier = Arc::new(MockReplier::default());
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&messenger),
            PollSettings::default(),
        ));
        let state = AppState::new(
            Arc::clone(&db),
            orchestrator,
            Arc::clone(&replier),
            "quiz_bot".into(),
            true,
            Duration::ZERO,
        );
        (state, db, messenger, replier)
    }

    fn command_update(update_id: i64, user_id: i64, name: &str, text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "chat": { "id": CHAT, "type": "supergroup" },
                "from": { "id": user_id, "is_bot": false, "first_name": name },
                "text": text,
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn commands_are_answered_in_the_originating_chat() {
        let (mut state, db, _, replier) = state();
        let (update_tx, update_rx) = mpsc::channel(8);
        let (_tick_tx, tick_rx) = mpsc::channel(1);

        update_tx.send(command_update(1, 10, "Ada", "/participate")).await.unwrap();
        update_tx.send(command_update(2, 11, "Bo", "just chatting")).await.unwrap();
        update_tx.send(command_update(3, 11, "Bo", "/participants@quiz_bot")).await.unwrap();
        drop(update_tx);

        run(update_rx, tick_rx, &mut state).await.unwrap();

        assert!(db.is_member(CHAT, 10).unwrap());
        let replies = replier.replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(chat, thread, _)| *chat == CHAT && thread.is_none()));
        assert!(replies[1].2.contains(": 1"));
    }

    #[tokio::test]
    async fn messages_from_bots_are_ignored() {
        let (mut state, db, _, replier) = state();
        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": { "id": CHAT, "type": "group" },
                "from": { "id": 99, "is_bot": true, "first_name": "Other" },
                "text": "/participate",
            }
        }))
        .unwrap();
        let (update_tx, update_rx) = mpsc::channel(1);
        let (_tick_tx, tick_rx) = mpsc::channel(1);
        update_tx.send(update).await.unwrap();
        drop(update_tx);

        run(update_rx, tick_rx, &mut state).await.unwrap();

        assert_eq!(db.count(CHAT).unwrap(), 0);
        assert!(replier.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_runs_daily_job_in_background() {
        let (mut state, db, messenger, _) = state();
        for (id, name) in [(1, "Ada"), (2, "Bo"), (3, "Cy")] {
            db.add(CHAT, id, name).unwrap();
        }
        let (update_tx, update_rx) = mpsc::channel(1);
        let (tick_tx, tick_rx) = mpsc::channel(1);

        let driver = async {
            tick_tx
                .send(Tick {
                    scheduled_for: chrono::Utc::now(),
                })
                .await
                .unwrap();
            drop(tick_tx);
            // Let the loop pick up the tick before the update channel closes.
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(update_tx);
        };
        let (result, ()) = tokio::join!(run(update_rx, tick_rx, &mut state), driver);
        result.unwrap();

        let summary = state.finish_daily_job().await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(messenger.polls.lock().unwrap().len(), 1);
        assert_eq!(db.exclusion_set(CHAT).unwrap().len(), 1);
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        use tokio::io::AsyncReadExt;

        let mut request = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some((head, body)) = text.split_once("\r\n\r\n") {
                let length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if body.len() >= length {
                    break;
                }
            }
        }
        String::from_utf8(request).unwrap()
    }

    fn body_json(raw: &str) -> serde_json::Value {
        let body = raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn poller_forwards_updates_and_advances_offset() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for body in [
                r#"{"ok":true,"result":[{"update_id":5},{"update_id":6}]}"#,
                r#"{"ok":true,"result":[]}"#,
            ] {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
            }
            requests
        });

        let client = Arc::new(TelegramClient::new(&format!("http://{addr}"), "t"));
        let (tx, mut rx) = mpsc::channel(8);
        let poller = tokio::spawn(run_update_poller(client, tx, Duration::from_secs(1)));

        assert_eq!(rx.recv().await.unwrap().update_id, 5);
        assert_eq!(rx.recv().await.unwrap().update_id, 6);

        let requests = server.await.unwrap();
        poller.abort();
        assert_eq!(body_json(&requests[0])["offset"], 0);
        assert_eq!(body_json(&requests[1])["offset"], 7);
    }
}
