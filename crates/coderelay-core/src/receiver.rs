//! Long-lived reader of one agent connection's message stream.
//!
//! The receiver is the only place a turn ends: on a result message it marks
//! the session idle so the dispatch loop can send the next queued message.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use coderelay_agent::{AgentError, AgentMessageStream};
use coderelay_schema::AgentMessage;
use coderelay_settings::SettingsStore;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::chat::{deliver, ChatGateway};
use crate::formatter::{split_message, Formatter};
use crate::registry::{SessionRegistry, UserSession};

const CONNECTION_LOST: &str =
    "Lost the connection to the agent. Use /clear to reset the session, then send your message again.";

pub(crate) struct ReceiverHandle {
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
    /// Held while one message is being handled
    busy: Arc<TokioMutex<()>>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Cancels the task and waits for the message in hand, if any, so nothing
    /// it persists can land after this returns.
    ///
    /// Must not be called from inside [`ReceiverTask::handle`].
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let _idle = self.busy.lock().await;
    }

    /// True once the stream is over, even while the task is still wrapping up.
    pub(crate) fn is_finished(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.task.is_finished()
    }
}

pub(crate) struct ReceiverTask {
    pub(crate) session: Arc<UserSession>,
    pub(crate) registry: Weak<SessionRegistry>,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) chat: Arc<dyn ChatGateway>,
    pub(crate) formatter: Arc<dyn Formatter>,
    pub(crate) base_session_id: String,
    pub(crate) working_path: PathBuf,
}

impl ReceiverTask {
    pub(crate) fn spawn(self, stream: AgentMessageStream) -> ReceiverHandle {
        let cancel = CancellationToken::new();
        let ended = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(TokioMutex::new(()));
        let token = cancel.clone();
        let flag = ended.clone();
        let gate = busy.clone();
        let task = tokio::spawn(async move { self.run(stream, token, flag, gate).await });
        ReceiverHandle {
            cancel,
            ended,
            busy,
            task,
        }
    }

    async fn run(
        self,
        mut stream: AgentMessageStream,
        cancel: CancellationToken,
        ended: Arc<AtomicBool>,
        busy: Arc<TokioMutex<()>>,
    ) {
        tracing::debug!(
            conversation = %self.session.key(),
            cwd = %self.working_path.display(),
            "receiver started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let _handling = busy.lock().await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.handle(message).await;
                }
                Some(Err(e)) if e.is_recoverable() => {
                    tracing::warn!(
                        conversation = %self.session.key(),
                        "skipping undecodable agent message: {e}"
                    );
                }
                Some(Err(e)) => {
                    ended.store(true, Ordering::SeqCst);
                    // a replaced connection fails on its way out
                    if !cancel.is_cancelled() {
                        self.connection_lost(e).await;
                    }
                    break;
                }
                None => {
                    ended.store(true, Ordering::SeqCst);
                    if !cancel.is_cancelled() {
                        self.stream_ended().await;
                    }
                    break;
                }
            }
        }

        tracing::debug!(conversation = %self.session.key(), "receiver stopped");
    }

    async fn handle(&self, message: AgentMessage) {
        self.session.touch().await;

        if let Some(engine_session_id) = message.handshake_session_id() {
            let path_key = self.working_path.to_string_lossy();
            self.settings
                .set_session_mapping(
                    self.session.settings_key(),
                    &self.base_session_id,
                    &path_key,
                    engine_session_id,
                )
                .await;
            tracing::info!(
                conversation = %self.session.key(),
                cwd = %path_key,
                engine_session_id,
                "agent session captured"
            );
        }

        if message.has_no_content() {
            return;
        }

        let hidden = match message.category() {
            Some(category) => {
                self.settings
                    .is_hidden(self.session.settings_key(), category)
                    .await
            }
            None => false,
        };
        if !hidden {
            let text = self.formatter.format_message(&message, &self.working_path);
            self.send(&text).await;
        }

        // a hidden result still ends the turn
        if message.is_result() {
            self.session.finish_turn();
            self.send(&self.formatter.format_ready()).await;
        }
    }

    async fn connection_lost(&self, error: AgentError) {
        tracing::error!(
            conversation = %self.session.key(),
            "agent stream failed: {error}"
        );
        let text = self.formatter.format_error(CONNECTION_LOST);
        self.send(&text).await;

        match self.registry.upgrade() {
            Some(registry) => registry.retire(&self.session).await,
            None => self.session.finish_turn(),
        }
    }

    async fn stream_ended(&self) {
        tracing::info!(conversation = %self.session.key(), "agent stream ended");
        if self.session.is_executing() {
            self.session.finish_turn();
            self.send(&self.formatter.format_warning(
                "The agent stopped before finishing. Send your message again.",
            ))
            .await;
        }
    }

    async fn send(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let anchor = if self.chat.uses_threaded_replies() {
            self.session.current_anchor().await
        } else {
            None
        };
        for chunk in split_message(text, self.formatter.max_message_len()) {
            deliver(
                self.chat.as_ref(),
                self.session.reply_to(),
                &chunk,
                anchor.as_deref(),
            )
            .await;
        }
    }
}
