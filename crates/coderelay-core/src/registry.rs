//! Per-conversation queues and the single-flight dispatch loop.
//!
//! Every conversation key owns one [`UserSession`]. Messages are appended to
//! its queue and a dispatch loop drains them into the agent one at a time,
//! waiting for the receiver to observe each turn's result before sending the
//! next. The `dispatching` flag lives under the same lock as the queue, so a
//! loop is started by exactly one of any number of concurrent `try_start`
//! calls.

use std::collections::{HashMap as StdHashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coderelay_agent::{AgentClient, AgentEngine, AgentError, ConnectOptions};
use coderelay_schema::{ConversationKey, MessageContext, QueuedMessage, SettingsKey};
use coderelay_settings::SettingsStore;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chat::{deliver, ChatGateway};
use crate::context::ResolvedContext;
use crate::formatter::Formatter;
use crate::receiver::{ReceiverHandle, ReceiverTask};
use crate::workdir::{effective_working_directory, WorkingDirectoryScope};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_working_directory: PathBuf,
    pub permission_mode: String,
    pub system_prompt: Option<String>,
    /// Pause between two drained messages of one conversation
    pub pacing: Duration,
}

impl RegistryConfig {
    pub fn new(default_working_directory: impl Into<PathBuf>) -> Self {
        Self {
            default_working_directory: default_working_directory.into(),
            permission_mode: "bypassPermissions".to_string(),
            system_prompt: None,
            pacing: Duration::from_millis(500),
        }
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = mode.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }
}

/// Engine session id for one conversation in one directory.
pub fn composite_session_id(key: &ConversationKey, working_path: &Path) -> String {
    format!("{}:{}", key.base_session_id(), working_path.display())
}

struct SessionState {
    queue: VecDeque<QueuedMessage>,
    dispatching: bool,
    current_anchor: Option<String>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

pub(crate) struct AgentConnection {
    client: Arc<dyn AgentClient>,
    working_path: PathBuf,
    receiver: ReceiverHandle,
}

impl AgentConnection {
    async fn close(self) {
        self.receiver.stop().await;
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!(cwd = %self.working_path.display(), "agent disconnect failed: {e}");
        }
    }
}

pub struct UserSession {
    key: ConversationKey,
    settings_key: SettingsKey,
    reply_to: MessageContext,
    state: TokioMutex<SessionState>,
    executing: watch::Sender<bool>,
    shutdown: CancellationToken,
    connection: TokioMutex<Option<AgentConnection>>,
}

impl UserSession {
    fn new(context: &ResolvedContext) -> Self {
        let (executing, _) = watch::channel(false);
        Self {
            key: context.conversation_key.clone(),
            settings_key: context.settings_key.clone(),
            reply_to: context.reply_to.clone(),
            state: TokioMutex::new(SessionState {
                queue: VecDeque::new(),
                dispatching: false,
                current_anchor: None,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
            }),
            executing,
            shutdown: CancellationToken::new(),
            connection: TokioMutex::new(None),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn settings_key(&self) -> &SettingsKey {
        &self.settings_key
    }

    pub fn reply_to(&self) -> &MessageContext {
        &self.reply_to
    }

    pub fn is_executing(&self) -> bool {
        *self.executing.borrow()
    }

    pub(crate) fn finish_turn(&self) {
        self.executing.send_replace(false);
    }

    pub(crate) async fn touch(&self) {
        self.state.lock().await.touch();
    }

    pub(crate) async fn current_anchor(&self) -> Option<String> {
        self.state.lock().await.current_anchor.clone()
    }

    /// Resolves when the running turn ends, or with `false` on shutdown.
    async fn wait_turn_end(&self) -> bool {
        let mut executing = self.executing.subscribe();
        loop {
            if !*executing.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = executing.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    async fn has_queued(&self) -> bool {
        !self.state.lock().await.queue.is_empty()
    }

    /// Stops the loop, drops the queue and the connection. Safe to repeat.
    async fn close(&self) {
        self.shutdown.cancel();
        {
            let mut state = self.state.lock().await;
            state.queue.clear();
            state.dispatching = false;
        }
        self.executing.send_replace(false);
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub executing: bool,
    pub queued: Vec<QueuedMessage>,
    pub last_activity: DateTime<Utc>,
    /// Directory of the live agent connection, if any
    pub working_directory: Option<PathBuf>,
}

pub struct SessionRegistry {
    sessions: TokioMutex<StdHashMap<ConversationKey, Arc<UserSession>>>,
    engine: Arc<dyn AgentEngine>,
    chat: Arc<dyn ChatGateway>,
    formatter: Arc<dyn Formatter>,
    settings: Arc<SettingsStore>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        chat: Arc<dyn ChatGateway>,
        formatter: Arc<dyn Formatter>,
        settings: Arc<SettingsStore>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: TokioMutex::new(StdHashMap::new()),
            engine,
            chat,
            formatter,
            settings,
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Appends to the conversation's queue, creating the session on first use.
    /// Returns the queue length after the append.
    pub async fn enqueue(&self, context: &ResolvedContext, message: QueuedMessage) -> usize {
        // the map stays locked until the message is queued, so a concurrent
        // teardown cannot strand it in a removed session
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(context.conversation_key.clone())
            .or_insert_with(|| {
                tracing::info!(conversation = %context.conversation_key, "session created");
                Arc::new(UserSession::new(context))
            })
            .clone();

        let mut state = session.state.lock().await;
        state.queue.push_back(message);
        state.touch();
        state.queue.len()
    }

    /// Starts a dispatch loop unless one is already draining this key.
    pub async fn try_start(self: &Arc<Self>, key: &ConversationKey) -> bool {
        let Some(session) = self.session(key).await else {
            return false;
        };

        {
            let mut state = session.state.lock().await;
            if state.dispatching || state.queue.is_empty() || session.shutdown.is_cancelled() {
                return false;
            }
            state.dispatching = true;
            session.executing.send_replace(true);
        }

        tokio::spawn(self.clone().run_dispatch_loop(session));
        true
    }

    pub async fn is_executing(&self, key: &ConversationKey) -> bool {
        match self.session(key).await {
            Some(session) => session.is_executing(),
            None => false,
        }
    }

    pub async fn snapshot(&self, key: &ConversationKey) -> Option<SessionSnapshot> {
        let session = self.session(key).await?;
        let (queued, last_activity) = {
            let state = session.state.lock().await;
            (state.queue.iter().cloned().collect(), state.last_activity_at)
        };
        let working_directory = session
            .connection
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.working_path.clone());
        Some(SessionSnapshot {
            executing: session.is_executing(),
            queued,
            last_activity,
            working_directory,
        })
    }

    /// Drops the queue and interrupts the running turn.
    /// Returns how many queued messages were discarded.
    pub async fn stop(&self, key: &ConversationKey) -> Option<usize> {
        let session = self.session(key).await?;
        let discarded = {
            let mut state = session.state.lock().await;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };

        if session.is_executing() {
            let client = session
                .connection
                .lock()
                .await
                .as_ref()
                .map(|connection| connection.client.clone());
            if let Some(client) = client {
                if let Err(e) = client.interrupt().await {
                    tracing::warn!(conversation = %key, "agent interrupt failed: {e}");
                }
            }
        }
        Some(discarded)
    }

    /// Removes the session and releases its agent connection.
    /// Returns `false` when there was nothing to tear down.
    pub async fn teardown(&self, key: &ConversationKey) -> bool {
        let Some(session) = self.sessions.lock().await.remove(key) else {
            return false;
        };
        session.close().await;
        tracing::info!(conversation = %key, "session torn down");
        true
    }

    /// Tears down one specific session; a newer session under the same key
    /// is left alone.
    pub(crate) async fn retire(&self, session: &Arc<UserSession>) {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .get(&session.key)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.key);
            }
        }
        session.close().await;
        tracing::info!(conversation = %session.key, "session retired");
    }

    /// Tears down every session idle for at least `threshold`, queued work
    /// included. Returns the keys that went away.
    pub async fn sweep_inactive(&self, threshold: Duration) -> Vec<ConversationKey> {
        let stale: Vec<Arc<UserSession>> = {
            let mut sessions = self.sessions.lock().await;
            let mut expired = Vec::new();
            for (key, session) in sessions.iter() {
                if session.state.lock().await.last_activity.elapsed() >= threshold {
                    expired.push(key.clone());
                }
            }
            expired
                .iter()
                .filter_map(|key| sessions.remove(key))
                .collect()
        };

        let mut keys = Vec::with_capacity(stale.len());
        for session in stale {
            session.close().await;
            tracing::info!(conversation = %session.key, "inactive session swept");
            keys.push(session.key.clone());
        }
        keys
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn session(&self, key: &ConversationKey) -> Option<Arc<UserSession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    async fn run_dispatch_loop(self: Arc<Self>, session: Arc<UserSession>) {
        tracing::debug!(conversation = %session.key, "dispatch loop started");

        loop {
            let message = {
                let mut state = session.state.lock().await;
                let next = if session.shutdown.is_cancelled() {
                    None
                } else {
                    state.queue.pop_front()
                };
                match next {
                    Some(message) => {
                        state.current_anchor = message.thread_anchor.clone();
                        state.touch();
                        session.executing.send_replace(true);
                        message
                    }
                    None => {
                        state.dispatching = false;
                        session.executing.send_replace(false);
                        break;
                    }
                }
            };

            if let Err(err) = self.dispatch_one(&session, &message).await {
                if session.shutdown.is_cancelled() {
                    break;
                }
                self.abort_dispatch(&session, &message, err).await;
                continue;
            }

            if !session.wait_turn_end().await {
                break;
            }

            if !self.config.pacing.is_zero() && session.has_queued().await {
                tokio::time::sleep(self.config.pacing).await;
            }
        }

        tracing::debug!(conversation = %session.key, "dispatch loop finished");
    }

    async fn dispatch_one(
        self: &Arc<Self>,
        session: &Arc<UserSession>,
        message: &QueuedMessage,
    ) -> Result<(), AgentError> {
        let custom = self.settings.working_directory(&session.settings_key).await;
        let working_path =
            effective_working_directory(custom.as_deref(), &self.config.default_working_directory);

        let client = self.ensure_connection(session, &working_path).await?;
        let session_id = composite_session_id(&session.key, &working_path);

        tracing::info!(
            conversation = %session.key,
            cwd = %working_path.display(),
            "sending message to agent"
        );
        let _scope = WorkingDirectoryScope::enter(client.as_ref(), working_path);
        client.query(&message.text, &session_id).await
    }

    /// Returns the live client for `working_path`, connecting when there is
    /// none, when it is bound elsewhere, or when its stream has ended.
    async fn ensure_connection(
        self: &Arc<Self>,
        session: &Arc<UserSession>,
        working_path: &Path,
    ) -> Result<Arc<dyn AgentClient>, AgentError> {
        let mut slot = session.connection.lock().await;
        if session.shutdown.is_cancelled() {
            return Err(AgentError::Closed);
        }

        if let Some(connection) = slot.as_ref() {
            if connection.working_path == working_path && !connection.receiver.is_finished() {
                return Ok(connection.client.clone());
            }
        }
        if let Some(stale) = slot.take() {
            tracing::info!(
                conversation = %session.key,
                from = %stale.working_path.display(),
                to = %working_path.display(),
                "replacing agent connection"
            );
            stale.close().await;
        }

        let base_session_id = session.key.base_session_id();
        let path_key = working_path.to_string_lossy().to_string();
        let resume = self
            .settings
            .session_mapping(&session.settings_key, &base_session_id, &path_key)
            .await;
        tracing::info!(
            conversation = %session.key,
            cwd = %path_key,
            resume = ?resume,
            "connecting to agent"
        );

        let options = ConnectOptions::new(working_path, self.config.permission_mode.clone())
            .with_resume(resume)
            .with_system_prompt(self.config.system_prompt.clone());
        let client = self.engine.connect(options).await?;
        let stream = match client.receive_messages().await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(disconnect_err) = client.disconnect().await {
                    tracing::warn!("agent disconnect failed: {disconnect_err}");
                }
                return Err(e);
            }
        };

        let receiver = ReceiverTask {
            session: session.clone(),
            registry: Arc::downgrade(self),
            settings: self.settings.clone(),
            chat: self.chat.clone(),
            formatter: self.formatter.clone(),
            base_session_id,
            working_path: working_path.to_path_buf(),
        }
        .spawn(stream);

        *slot = Some(AgentConnection {
            client: client.clone(),
            working_path: working_path.to_path_buf(),
            receiver,
        });
        Ok(client)
    }

    /// Drops what is queued behind the failed message and reports once.
    async fn abort_dispatch(&self, session: &UserSession, failed: &QueuedMessage, err: AgentError) {
        let discarded = {
            let mut state = session.state.lock().await;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        tracing::error!(
            conversation = %session.key,
            discarded,
            "agent call failed: {err}"
        );

        if let Some(connection) = session.connection.lock().await.take() {
            connection.close().await;
        }

        let mut text = format!("The agent request failed: {err}.");
        if discarded > 0 {
            text.push_str(&format!(" {discarded} queued message(s) were discarded."));
        }
        text.push_str(" Send your message again, or use /clear to reset the session.");

        let anchor = if self.chat.uses_threaded_replies() {
            failed.thread_anchor.as_deref()
        } else {
            None
        };
        deliver(
            self.chat.as_ref(),
            &session.reply_to,
            &self.formatter.format_error(&text),
            anchor,
        )
        .await;
    }
}
