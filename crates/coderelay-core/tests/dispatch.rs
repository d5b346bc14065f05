use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coderelay_agent::{AgentError, StubEngine};
use coderelay_core::{
    resolve_context, RegistryConfig, ResolvedContext, SessionRegistry, SlackFormatter, StubChat,
};
use coderelay_schema::{ConversationKey, InboundEvent, MessageCategory, Platform, QueuedMessage};
use coderelay_settings::{SettingsBackend, SettingsStore};
use tokio::sync::Semaphore;

const READY: &str = "Ready for your next message";

struct Harness {
    engine: Arc<StubEngine>,
    chat: Arc<StubChat>,
    settings: Arc<SettingsStore>,
    registry: Arc<SessionRegistry>,
    workdir: tempfile::TempDir,
}

impl Harness {
    async fn new(engine: StubEngine, platform: Platform) -> Self {
        Self::with_settings(engine, platform, SettingsStore::in_memory().await).await
    }

    async fn with_settings(
        engine: StubEngine,
        platform: Platform,
        settings: SettingsStore,
    ) -> Self {
        let workdir = tempfile::TempDir::new().unwrap();
        let engine = Arc::new(engine);
        let chat = Arc::new(StubChat::new(platform));
        let settings = Arc::new(settings);
        let registry = SessionRegistry::new(
            engine.clone(),
            chat.clone(),
            Arc::new(SlackFormatter),
            settings.clone(),
            RegistryConfig::new(workdir.path()).with_pacing(Duration::ZERO),
        );
        Self {
            engine,
            chat,
            settings,
            registry,
            workdir,
        }
    }

    async fn send(&self, event: &InboundEvent) -> (usize, bool) {
        let ctx = resolve_context(event);
        let len = self
            .registry
            .enqueue(&ctx, QueuedMessage::new(&event.text, ctx.thread_anchor.clone()))
            .await;
        let started = self.registry.try_start(&ctx.conversation_key).await;
        (len, started)
    }

    fn default_dir(&self) -> PathBuf {
        self.workdir.path().to_path_buf()
    }
}

/// Settings backend whose writes can be held open.
struct GatedBackend {
    armed: AtomicBool,
    entered: AtomicBool,
    gate: Semaphore,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl SettingsBackend for GatedBackend {
    async fn load(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn store(&self, _document: &str) -> anyhow::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            let _permit = self.gate.acquire().await?;
        }
        Ok(())
    }
}

fn dm(text: &str) -> InboundEvent {
    InboundEvent::new("telegram", "7", "7", text)
}

fn dm_context() -> ResolvedContext {
    resolve_context(&dm(""))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_idle(registry: &SessionRegistry, key: &ConversationKey) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.is_executing(key).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never went idle"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn first_index(texts: &[String], needle: &str) -> usize {
    texts
        .iter()
        .position(|text| text.contains(needle))
        .unwrap_or_else(|| panic!("no message contains {needle:?}"))
}

#[tokio::test]
async fn messages_drain_in_order_one_turn_at_a_time() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;
    let key = dm_context().conversation_key;

    assert_eq!(h.send(&dm("first")).await, (1, true));
    eventually("first query", || h.engine.queries().len() == 1).await;
    assert!(h.registry.is_executing(&key).await);

    let (len, started) = h.send(&dm("second")).await;
    assert_eq!(len, 1);
    assert!(!started);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.query_texts(), vec!["first"]);

    h.engine.client(0).unwrap().respond("answer one");
    eventually("second query", || h.engine.queries().len() == 2).await;
    assert_eq!(h.engine.query_texts(), vec!["first", "second"]);

    h.engine.client(0).unwrap().respond("answer two");
    eventually("two ready notices", || h.chat.count_containing(READY) == 2).await;
    wait_idle(&h.registry, &key).await;

    let texts = h.chat.texts();
    assert!(first_index(&texts, "answer one") < first_index(&texts, "answer two"));
    assert_eq!(h.engine.connects().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_start_a_single_loop() {
    let h = Arc::new(Harness::new(StubEngine::manual(), Platform::Telegram).await);
    let key = dm_context().conversation_key;

    let mut tasks = Vec::new();
    for i in 0..12 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            h.send(&dm(&format!("m{i}"))).await.1
        }));
    }
    let mut started = 0;
    for task in tasks {
        if task.await.unwrap() {
            started += 1;
        }
    }
    assert_eq!(started, 1);

    for turn in 1..=12 {
        eventually("next query", || h.engine.queries().len() == turn).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.engine.queries().len(), turn, "a second turn started early");
        h.engine.client(0).unwrap().respond("ok");
    }
    wait_idle(&h.registry, &key).await;

    let mut texts = h.engine.query_texts();
    texts.sort();
    let mut expected: Vec<String> = (0..12).map(|i| format!("m{i}")).collect();
    expected.sort();
    assert_eq!(texts, expected);
    assert_eq!(h.engine.connects().len(), 1);
}

#[tokio::test]
async fn failed_query_discards_backlog_and_reports_once() {
    let h = Harness::new(StubEngine::echo().failing_on("boom"), Platform::Telegram).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();

    for text in ["boom", "y", "z"] {
        h.registry.enqueue(&ctx, QueuedMessage::new(text, None)).await;
    }
    assert!(h.registry.try_start(&key).await);

    eventually("error notice", || h.chat.count_containing("request failed") == 1).await;
    wait_idle(&h.registry, &key).await;

    assert_eq!(h.engine.query_texts(), vec!["boom"]);
    let texts = h.chat.texts();
    let notice = &texts[first_index(&texts, "request failed")];
    assert!(notice.contains("2 queued message(s) were discarded"));

    let snapshot = h.registry.snapshot(&key).await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert!(!snapshot.executing);
    assert!(snapshot.working_directory.is_none());
    assert_eq!(h.engine.disconnects(), 1);

    assert_eq!(h.send(&dm("again")).await, (1, true));
    eventually("recovered turn", || h.chat.count_containing("echo: again") > 0).await;
    assert_eq!(h.chat.count_containing("request failed"), 1);
    assert_eq!(h.engine.connects().len(), 2);
}

#[tokio::test]
async fn hidden_categories_are_filtered_and_results_still_end_turns() {
    let h = Harness::new(StubEngine::echo(), Platform::Telegram).await;
    let ctx = dm_context();
    h.settings
        .toggle_hidden_category(&ctx.settings_key, MessageCategory::System)
        .await;
    h.settings
        .toggle_hidden_category(&ctx.settings_key, MessageCategory::Result)
        .await;

    h.send(&dm("a")).await;
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;
    wait_idle(&h.registry, &ctx.conversation_key).await;

    assert_eq!(h.chat.count_containing("System init"), 0);
    assert_eq!(h.chat.count_containing("📊"), 0);
    assert_eq!(h.chat.count_containing("echo: a"), 1);

    h.settings
        .toggle_hidden_category(&ctx.settings_key, MessageCategory::Result)
        .await;
    h.send(&dm("b")).await;
    eventually("second ready notice", || h.chat.count_containing(READY) == 2).await;
    assert_eq!(h.chat.count_containing("📊"), 1);
    assert_eq!(h.chat.count_containing("System init"), 0);
}

#[tokio::test]
async fn engine_session_is_captured_and_resumed() {
    let h = Harness::new(StubEngine::echo(), Platform::Telegram).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();
    let path = h.default_dir().to_string_lossy().to_string();

    h.send(&dm("a")).await;
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;
    assert_eq!(
        h.settings
            .session_mapping(&ctx.settings_key, &key.base_session_id(), &path)
            .await
            .as_deref(),
        Some("stub-session-0")
    );

    assert!(h.registry.teardown(&key).await);
    h.send(&dm("b")).await;
    eventually("second ready notice", || h.chat.count_containing(READY) == 2).await;

    let connects = h.engine.connects();
    assert_eq!(connects.len(), 2);
    assert_eq!(connects[0].resume_session_id, None);
    assert_eq!(connects[1].resume_session_id.as_deref(), Some("stub-session-0"));
    assert_eq!(
        h.engine.queries()[1].session_id,
        format!("{}:{}", key.base_session_id(), path)
    );
}

#[tokio::test]
async fn changing_directory_reconnects_in_the_new_place() {
    let h = Harness::new(StubEngine::echo(), Platform::Telegram).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();

    h.send(&dm("a")).await;
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;

    let other = h.workdir.path().join("other");
    std::fs::create_dir_all(&other).unwrap();
    h.settings
        .set_working_directory(&ctx.settings_key, Some(other.to_string_lossy().to_string()))
        .await;

    h.send(&dm("b")).await;
    eventually("second ready notice", || h.chat.count_containing(READY) == 2).await;

    let connects = h.engine.connects();
    assert_eq!(connects.len(), 2);
    assert_eq!(connects[0].working_directory, h.default_dir());
    assert_eq!(connects[1].working_directory, other);
    assert_eq!(h.engine.queries()[1].working_directory, other);
    assert_eq!(h.engine.disconnects(), 1);

    let snapshot = h.registry.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.working_directory, Some(other.clone()));

    let base = key.base_session_id();
    let default_path = h.default_dir().to_string_lossy().to_string();
    let other_path = other.to_string_lossy().to_string();
    assert_eq!(
        h.settings
            .session_mapping(&ctx.settings_key, &base, &default_path)
            .await
            .as_deref(),
        Some("stub-session-0")
    );
    assert_eq!(
        h.settings
            .session_mapping(&ctx.settings_key, &base, &other_path)
            .await
            .as_deref(),
        Some("stub-session-1")
    );
}

#[tokio::test]
async fn stop_interrupts_and_drops_backlog() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();

    for text in ["a", "b", "c"] {
        h.registry.enqueue(&ctx, QueuedMessage::new(text, None)).await;
    }
    assert!(h.registry.try_start(&key).await);
    eventually("first query", || h.engine.queries().len() == 1).await;

    assert_eq!(h.registry.stop(&key).await, Some(2));
    assert_eq!(h.engine.interrupts(), 1);
    wait_idle(&h.registry, &key).await;

    assert_eq!(h.engine.query_texts(), vec!["a"]);
    let nobody = ConversationKey::new(Platform::Telegram, "nobody", None);
    assert_eq!(h.registry.stop(&nobody).await, None);
}

#[tokio::test]
async fn teardown_is_idempotent_even_mid_turn() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;
    let key = dm_context().conversation_key;

    h.send(&dm("a")).await;
    eventually("first query", || h.engine.queries().len() == 1).await;

    assert!(h.registry.teardown(&key).await);
    assert!(!h.registry.teardown(&key).await);
    assert!(!h.registry.is_executing(&key).await);
    assert_eq!(h.registry.session_count().await, 0);
    assert_eq!(h.engine.disconnects(), 1);

    assert_eq!(h.send(&dm("b")).await, (1, true));
    eventually("query on fresh session", || h.engine.queries().len() == 2).await;
    assert_eq!(h.engine.connects().len(), 2);
    h.engine.client(1).unwrap().respond("fresh");
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;
}

#[tokio::test]
async fn inactive_sessions_are_swept() {
    let h = Harness::new(StubEngine::echo(), Platform::Telegram).await;
    let key = dm_context().conversation_key;

    h.send(&dm("a")).await;
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;
    wait_idle(&h.registry, &key).await;

    assert!(h.registry.sweep_inactive(Duration::from_secs(3600)).await.is_empty());
    assert_eq!(h.registry.sweep_inactive(Duration::ZERO).await, vec![key]);
    assert_eq!(h.registry.session_count().await, 0);
    assert_eq!(h.engine.disconnects(), 1);
}

#[tokio::test]
async fn threaded_platform_replies_into_the_anchor() {
    let h = Harness::new(StubEngine::echo(), Platform::Slack).await;
    let event = InboundEvent::new("slack", "U1", "C1", "hi").with_message_id("1700.01");
    let key = resolve_context(&event).conversation_key;

    h.send(&event).await;
    eventually("ready notice", || h.chat.count_containing(READY) == 1).await;
    wait_idle(&h.registry, &key).await;

    let sent = h.chat.sent();
    assert!(!sent.is_empty());
    assert!(sent
        .iter()
        .all(|message| message.thread_anchor.as_deref() == Some("1700.01")));
}

#[tokio::test]
async fn lost_stream_reports_and_retires_the_session() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;

    h.send(&dm("a")).await;
    eventually("first query", || h.engine.queries().len() == 1).await;
    let client = h.engine.client(0).unwrap();

    client.emit(Err(AgentError::Decode("not json".into())));
    client.emit(Err(AgentError::Transport("pipe closed".into())));
    eventually("lost notice", || h.chat.count_containing("Lost the connection") == 1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.registry.session_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "session was not retired");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.engine.disconnects(), 1);
}

#[tokio::test]
async fn ended_stream_warns_and_next_message_reconnects() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;
    let key = dm_context().conversation_key;

    h.send(&dm("a")).await;
    eventually("first query", || h.engine.queries().len() == 1).await;
    h.engine.client(0).unwrap().close_stream();

    eventually("stopped notice", || {
        h.chat.count_containing("stopped before finishing") == 1
    })
    .await;
    wait_idle(&h.registry, &key).await;

    h.send(&dm("b")).await;
    eventually("reconnect", || h.engine.connects().len() == 2).await;
    assert_eq!(
        h.engine.connects()[1].resume_session_id.as_deref(),
        Some("stub-session-0")
    );
}

#[tokio::test]
async fn result_without_subtype_ends_the_turn() {
    let h = Harness::new(StubEngine::manual(), Platform::Telegram).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();

    for text in ["a", "b"] {
        h.registry.enqueue(&ctx, QueuedMessage::new(text, None)).await;
    }
    assert!(h.registry.try_start(&key).await);
    eventually("first query", || h.engine.queries().len() == 1).await;

    h.engine
        .client(0)
        .unwrap()
        .emit_line(r#"{"type":"result","is_error":false,"duration_ms":10,"result":"done"}"#);
    eventually("second query", || h.engine.queries().len() == 2).await;
    assert_eq!(h.engine.query_texts(), vec!["a", "b"]);
    assert_eq!(h.chat.count_containing(READY), 1);
}

#[tokio::test]
async fn working_directory_override_stays_with_its_owner() {
    let h = Harness::new(StubEngine::echo(), Platform::Telegram).await;
    let for_a = InboundEvent::new("telegram", "1", "1", "for a");
    let for_b = InboundEvent::new("telegram", "2", "2", "for b");

    let a_only = h.workdir.path().join("a_only");
    std::fs::create_dir_all(&a_only).unwrap();
    h.settings
        .set_working_directory(
            &resolve_context(&for_a).settings_key,
            Some(a_only.to_string_lossy().to_string()),
        )
        .await;

    h.send(&for_a).await;
    h.send(&for_b).await;
    eventually("both ready notices", || h.chat.count_containing(READY) == 2).await;

    let connects = h.engine.connects();
    assert_eq!(connects.len(), 2);
    for query in h.engine.queries() {
        let expected = if query.text == "for a" {
            a_only.clone()
        } else {
            h.default_dir()
        };
        assert_eq!(query.working_directory, expected, "query {:?}", query.text);
        assert_eq!(connects[query.client].working_directory, expected);
    }
}

#[tokio::test]
async fn teardown_waits_for_the_message_in_hand() {
    let backend = Arc::new(GatedBackend::new());
    let settings = SettingsStore::open(backend.clone()).await.unwrap();
    let h = Harness::with_settings(StubEngine::manual(), Platform::Telegram, settings).await;
    let ctx = dm_context();
    let key = ctx.conversation_key.clone();
    let path = h.default_dir().to_string_lossy().to_string();

    h.send(&dm("a")).await;
    eventually("first query", || h.engine.queries().len() == 1).await;
    eventually("first mapping", || h.chat.count_containing("System init") == 1).await;

    backend.armed.store(true, Ordering::SeqCst);
    h.engine.client(0).unwrap().emit_line(&format!(
        r#"{{"type":"system","subtype":"init","session_id":"late-id","cwd":"{path}"}}"#
    ));
    eventually("held mapping write", || backend.entered.load(Ordering::SeqCst)).await;

    let registry = h.registry.clone();
    let teardown_key = key.clone();
    let teardown = tokio::spawn(async move { registry.teardown(&teardown_key).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!teardown.is_finished());

    backend.armed.store(false, Ordering::SeqCst);
    backend.gate.add_permits(1);
    assert!(tokio::time::timeout(Duration::from_secs(5), teardown)
        .await
        .unwrap()
        .unwrap());

    h.settings
        .clear_session_mapping(&ctx.settings_key, &key.base_session_id(), None)
        .await;
    assert_eq!(
        h.settings
            .session_mapping(&ctx.settings_key, &key.base_session_id(), &path)
            .await,
        None
    );

    h.send(&dm("b")).await;
    eventually("fresh connection", || h.engine.connects().len() == 2).await;
    assert_eq!(h.engine.connects()[1].resume_session_id, None);
}
