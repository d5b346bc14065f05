//! In-process engine that answers without spawning anything.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use coderelay_schema::{AgentMessage, ContentBlock, ResultMessage};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{AgentClient, AgentEngine, AgentError, AgentMessageStream, ConnectOptions};

type Outbound = Result<AgentMessage, AgentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubReply {
    /// Every query is answered with `echo: <text>` and a result.
    Echo,
    /// Nothing is sent until [`StubClient::respond`] is called.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubQuery {
    pub client: usize,
    pub text: String,
    pub session_id: String,
    pub working_directory: PathBuf,
}

#[derive(Debug, Default)]
struct StubLog {
    connects: Vec<ConnectOptions>,
    queries: Vec<StubQuery>,
    interrupts: usize,
    disconnects: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn assistant_text(text: impl Into<String>) -> AgentMessage {
    AgentMessage::AssistantText {
        content: vec![ContentBlock::Text { text: text.into() }],
        model: Some("stub".to_string()),
    }
}

pub fn result_message(subtype: &str, text: Option<&str>) -> AgentMessage {
    AgentMessage::Result(ResultMessage {
        subtype: subtype.to_string(),
        duration_ms: 1200,
        num_turns: 1,
        is_error: subtype != "success",
        result: text.map(str::to_string),
        ..Default::default()
    })
}

pub fn init_message(session_id: &str, cwd: &str) -> AgentMessage {
    AgentMessage::System {
        subtype: "init".to_string(),
        data: json!({ "type": "system", "subtype": "init", "session_id": session_id, "cwd": cwd }),
    }
}

pub struct StubEngine {
    reply: StubReply,
    fail_on: Option<String>,
    log: Arc<Mutex<StubLog>>,
    clients: Mutex<Vec<Arc<StubClient>>>,
}

impl StubEngine {
    pub fn new(reply: StubReply) -> Self {
        Self {
            reply,
            fail_on: None,
            log: Arc::new(Mutex::new(StubLog::default())),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(StubReply::Echo)
    }

    pub fn manual() -> Self {
        Self::new(StubReply::Manual)
    }

    /// Queries with exactly this text fail with a transport error.
    pub fn failing_on(mut self, text: impl Into<String>) -> Self {
        self.fail_on = Some(text.into());
        self
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        lock(&self.log).connects.clone()
    }

    pub fn queries(&self) -> Vec<StubQuery> {
        lock(&self.log).queries.clone()
    }

    pub fn query_texts(&self) -> Vec<String> {
        lock(&self.log)
            .queries
            .iter()
            .map(|query| query.text.clone())
            .collect()
    }

    pub fn interrupts(&self) -> usize {
        lock(&self.log).interrupts
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.log).disconnects
    }

    pub fn client(&self, index: usize) -> Option<Arc<StubClient>> {
        lock(&self.clients).get(index).cloned()
    }

    pub fn last_client(&self) -> Option<Arc<StubClient>> {
        lock(&self.clients).last().cloned()
    }
}

#[async_trait]
impl AgentEngine for StubEngine {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn AgentClient>, AgentError> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let mut clients = lock(&self.clients);
        let index = clients.len();
        let client = Arc::new(StubClient {
            index,
            engine_session_id: options
                .resume_session_id
                .clone()
                .unwrap_or_else(|| format!("stub-session-{index}")),
            reply: self.reply,
            fail_on: self.fail_on.clone(),
            log: self.log.clone(),
            working_directory: ArcSwap::from_pointee(options.working_directory.clone()),
            announced: AtomicBool::new(false),
            outbox: Mutex::new(Some(outbox)),
            inbox: Mutex::new(Some(inbox)),
        });
        lock(&self.log).connects.push(options);
        clients.push(client.clone());
        Ok(client)
    }
}

pub struct StubClient {
    index: usize,
    engine_session_id: String,
    reply: StubReply,
    fail_on: Option<String>,
    log: Arc<Mutex<StubLog>>,
    working_directory: ArcSwap<PathBuf>,
    announced: AtomicBool,
    outbox: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl StubClient {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn engine_session_id(&self) -> &str {
        &self.engine_session_id
    }

    pub fn emit(&self, item: Outbound) {
        if let Some(outbox) = lock(&self.outbox).as_ref() {
            // the receiver may already be gone
            let _ = outbox.send(item);
        }
    }

    /// Emits one raw stream-json line as the CLI would print it.
    pub fn emit_line(&self, line: &str) {
        match crate::decode::decode_line(line) {
            Ok(Some(message)) => self.emit(Ok(message)),
            Ok(None) => {}
            Err(e) => self.emit(Err(e)),
        }
    }

    /// Finishes the current turn with `text`.
    pub fn respond(&self, text: &str) {
        self.emit(Ok(assistant_text(text)));
        self.emit(Ok(result_message("success", Some(text))));
    }

    /// Ends the message stream as if the process exited.
    pub fn close_stream(&self) {
        lock(&self.outbox).take();
    }
}

#[async_trait]
impl AgentClient for StubClient {
    fn working_directory(&self) -> PathBuf {
        (**self.working_directory.load()).clone()
    }

    fn set_working_directory(&self, directory: PathBuf) {
        self.working_directory.store(Arc::new(directory));
    }

    async fn query(&self, text: &str, session_id: &str) -> Result<(), AgentError> {
        lock(&self.log).queries.push(StubQuery {
            client: self.index,
            text: text.to_string(),
            session_id: session_id.to_string(),
            working_directory: self.working_directory(),
        });

        if self.fail_on.as_deref() == Some(text) {
            return Err(AgentError::Transport("stub agent refused the query".to_string()));
        }
        if lock(&self.outbox).is_none() {
            return Err(AgentError::Closed);
        }

        if !self.announced.swap(true, Ordering::SeqCst) {
            let cwd = self.working_directory().to_string_lossy().to_string();
            self.emit(Ok(init_message(&self.engine_session_id, &cwd)));
        }
        if self.reply == StubReply::Echo {
            self.respond(&format!("echo: {text}"));
        }
        Ok(())
    }

    async fn receive_messages(&self) -> Result<AgentMessageStream, AgentError> {
        let inbox = lock(&self.inbox).take().ok_or(AgentError::StreamTaken)?;
        Ok(Box::pin(UnboundedReceiverStream::new(inbox)))
    }

    async fn interrupt(&self) -> Result<(), AgentError> {
        lock(&self.log).interrupts += 1;
        self.emit(Ok(result_message("error_during_execution", None)));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        lock(&self.log).disconnects += 1;
        self.close_stream();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn echo_client_announces_once_then_answers() {
        let engine = StubEngine::echo();
        let client = engine
            .connect(ConnectOptions::new("/tmp/stub", "default"))
            .await
            .unwrap();
        let mut stream = client.receive_messages().await.unwrap();

        client.query("one", "k:/tmp/stub").await.unwrap();
        client.query("two", "k:/tmp/stub").await.unwrap();
        client.disconnect().await.unwrap();

        let mut kinds = Vec::new();
        while let Some(item) = stream.next().await {
            let message = item.unwrap();
            kinds.push(match message {
                AgentMessage::System { .. } => "system",
                AgentMessage::AssistantText { .. } => "assistant",
                AgentMessage::Result(_) => "result",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["system", "assistant", "result", "assistant", "result"]
        );
        assert_eq!(engine.query_texts(), vec!["one", "two"]);
        assert!(matches!(
            client.receive_messages().await,
            Err(AgentError::StreamTaken)
        ));
    }

    #[tokio::test]
    async fn resume_id_is_reused_as_engine_session() {
        let engine = StubEngine::manual();
        engine
            .connect(ConnectOptions::new("/tmp/a", "default").with_resume(Some("abc".into())))
            .await
            .unwrap();
        assert_eq!(engine.client(0).unwrap().engine_session_id(), "abc");
    }
}
