//! The stream orchestrator.
//!
//! Drives any [`Strategy`] the same way: every chunk is folded into the
//! [`Turn`] and forwarded as an [`OutboundRecord`], a title is generated
//! concurrently and attached to at most one record, and the finished turn
//! is saved exactly once after the stream ends, however it ended.

use futures::FutureExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use threadloom_core::error::SessionError;
use threadloom_core::{
    AgentRunLog, Block, ConversationStore, Error, OutboundRecord, ResponseChunk, Result, SessionContext, SessionId,
    Turn,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::factory::StrategyProvider;
use crate::strategy::{Strategy, StrategyStream, chunk_channel};

/// Sessions with a title task in flight, shared by every run of one
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct TitleRegistry {
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
}

impl TitleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session. Returns `None` if another run already holds it.
    pub fn try_claim(&self, session_id: &SessionId) -> Option<TitleClaim> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(session_id.clone()).then(|| TitleClaim {
            registry: self.clone(),
            session_id: session_id.clone(),
        })
    }

    pub fn is_in_flight(&self, session_id: &SessionId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    fn release(&self, session_id: &SessionId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

/// Holds a session's registry slot; dropping it frees the slot.
#[derive(Debug)]
pub struct TitleClaim {
    registry: TitleRegistry,
    session_id: SessionId,
}

impl Drop for TitleClaim {
    fn drop(&mut self) {
        self.registry.release(&self.session_id);
    }
}

/// A `summarize` call running beside the response stream.
pub struct TitleTask {
    session_id: SessionId,
    handle: JoinHandle<Result<String>>,
    claim: TitleClaim,
}

impl TitleTask {
    pub fn spawn(strategy: Arc<dyn Strategy>, turn: Turn, claim: TitleClaim) -> Self {
        let session_id = claim.session_id.clone();
        let handle = tokio::spawn(async move { strategy.summarize(&turn).await });
        Self {
            session_id,
            handle,
            claim,
        }
    }

    /// Zero-wait check. `Some` once the task has finished; the task must
    /// not be polled again after that.
    pub fn poll_ready(&mut self) -> Option<Result<String>> {
        (&mut self.handle).now_or_never().map(flatten_join)
    }

    /// Wait for the title, persist it, then free the registry slot.
    async fn finish(self, store: Arc<dyn ConversationStore>) {
        let outcome = flatten_join(self.handle.await);
        settle_title(store, self.session_id, outcome, self.claim).await;
    }
}

fn flatten_join(joined: std::result::Result<Result<String>, tokio::task::JoinError>) -> Result<String> {
    joined.map_err(|e| Error::Internal(format!("title task failed: {e}")))?
}

async fn settle_title(
    store: Arc<dyn ConversationStore>,
    session_id: SessionId,
    outcome: Result<String>,
    claim: TitleClaim,
) {
    match outcome {
        Ok(title) => match store.set_title(&session_id, &title).await {
            Ok(()) => info!(session_id = %session_id, title = %title, "Session titled"),
            Err(e) => error!(session_id = %session_id, error = %e, "Failed to persist session title"),
        },
        Err(e) => warn!(session_id = %session_id, error = %e, "Title generation failed; a later turn will retry"),
    }
    drop(claim);
}

pub struct StreamOrchestrator {
    strategies: Arc<dyn StrategyProvider>,
    store: Arc<dyn ConversationStore>,
    titles: TitleRegistry,
}

impl StreamOrchestrator {
    pub fn new(strategies: Arc<dyn StrategyProvider>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            strategies,
            store,
            titles: TitleRegistry::new(),
        }
    }

    pub fn titles(&self) -> &TitleRegistry {
        &self.titles
    }

    /// Process one turn and return the outbound record stream.
    ///
    /// Configuration errors are returned here and nothing is persisted.
    /// Once this returns `Ok`, the turn is saved exactly once.
    pub async fn process_turn(&self, turn: Turn, ctx: &SessionContext) -> Result<mpsc::Receiver<OutboundRecord>> {
        let assistant = self
            .store
            .get_assistant(&ctx.assistant_id)
            .await?
            .ok_or_else(|| SessionError::AssistantNotFound(ctx.assistant_id.to_string()))?;
        let strategy = self.strategies.build(&assistant)?;

        let stream = match strategy.respond(&turn, ctx).await {
            Ok(stream) => stream,
            Err(e) if e.is_config() => return Err(e),
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "Strategy failed to start");
                failed_stream(e)
            }
        };

        let title = self.start_title(&strategy, &turn, &ctx.session_id).await;
        info!(
            session_id = %ctx.session_id,
            turn_id = %turn.id,
            kind = %strategy.kind(),
            titling = title.is_some(),
            "Processing turn"
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(drain(turn, stream, tx, title, self.store.clone()));
        Ok(rx)
    }

    /// The claim is taken before `has_title` is read, so a title written by
    /// a run that just released its claim is always seen here.
    async fn start_title(&self, strategy: &Arc<dyn Strategy>, turn: &Turn, session_id: &SessionId) -> Option<TitleTask> {
        let Some(claim) = self.titles.try_claim(session_id) else {
            debug!(session_id = %session_id, "Title already in flight");
            return None;
        };
        match self.store.has_title(session_id).await {
            Ok(true) => None,
            Ok(false) => Some(TitleTask::spawn(strategy.clone(), turn.clone(), claim)),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Could not check session title; skipping");
                None
            }
        }
    }
}

fn failed_stream(e: Error) -> StrategyStream {
    let (tx, stream) = chunk_channel();
    // Fresh channel with spare capacity
    let _ = tx.try_send(Err(e));
    stream
}

/// Fold a chunk into the turn and return the block to forward.
///
/// Text accumulates into one block and the forwarded block carries the full
/// text so far. Status blocks are forwarded but never persisted.
pub fn fold_chunk(turn: &mut Turn, chunk: ResponseChunk) -> Block {
    if let ResponseChunk::Text { content } = &chunk {
        return turn.push_text(content);
    }
    match Block::from_structured(chunk) {
        Some(block @ Block::Status { .. }) => block,
        Some(block) => {
            turn.push_block(block.clone());
            block
        }
        // Only text has no standalone block
        None => turn.push_text(""),
    }
}

async fn drain(
    mut turn: Turn,
    stream: StrategyStream,
    tx: mpsc::Sender<OutboundRecord>,
    mut title: Option<TitleTask>,
    store: Arc<dyn ConversationStore>,
) {
    let StrategyStream { mut chunks, run_log } = stream;
    let mut forwarding = true;
    let mut failed = false;
    let mut forwarded = 0usize;

    while let Some(item) = chunks.recv().await {
        let block = match item {
            Ok(chunk) => fold_chunk(&mut turn, chunk),
            Err(e) => {
                warn!(turn_id = %turn.id, error = %e, "Strategy stream failed");
                failed = true;
                let block = Block::Error {
                    message: e.to_string(),
                };
                turn.push_block(block.clone());
                block
            }
        };

        let mut record = OutboundRecord::new(turn.id.clone(), turn.assistant_id.clone(), block);
        if let Some(ready) = title.as_mut().and_then(TitleTask::poll_ready)
            && let Some(task) = title.take()
        {
            record.title = attach_title(task, ready, store.clone());
        }

        if forwarding {
            if tx.send(record).await.is_err() {
                info!(turn_id = %turn.id, "Client disconnected; finishing turn without forwarding");
                forwarding = false;
            } else {
                forwarded += 1;
            }
        }
        if failed {
            break;
        }
    }
    drop(chunks);

    if !failed {
        persist_run_log(store.as_ref(), run_log).await;
    }
    match store.save_turn(&turn).await {
        Ok(()) => info!(turn_id = %turn.id, forwarded, blocks = turn.blocks.len(), "Turn saved"),
        Err(e) => error!(turn_id = %turn.id, error = %e, "Failed to save turn"),
    }

    // Closes the client stream; the title below is best effort.
    drop(tx);
    if let Some(task) = title {
        task.finish(store).await;
    }
}

/// Returns the title to put on the current record, scheduling its
/// persistence off the critical path.
fn attach_title(task: TitleTask, ready: Result<String>, store: Arc<dyn ConversationStore>) -> Option<String> {
    let TitleTask {
        session_id, claim, ..
    } = task;
    let title = ready.as_ref().ok().cloned();
    tokio::spawn(settle_title(store, session_id, ready, claim));
    title
}

async fn persist_run_log(store: &dyn ConversationStore, run_log: Option<oneshot::Receiver<AgentRunLog>>) {
    let Some(rx) = run_log else {
        return;
    };
    // A dropped sender means the run produced no log
    let Ok(log) = rx.await else {
        return;
    };
    if log.is_empty() {
        return;
    }
    if let Err(e) = store.append_run_log(&log).await {
        error!(session_id = %log.session_id, error = %e, "Failed to append run log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::{ResearchEngine, ResearchStrategy};
    use crate::test_helpers::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use threadloom_core::error::{OracleError, PersistenceError};
    use threadloom_core::oracle::ModelSettings;
    use threadloom_core::{Assistant, AssistantId, Session, StrategyKind, ToolRegistry};
    use threadloom_memory::InMemoryStore;

    /// Hands out prepared strategies in order.
    struct Prepared(Mutex<VecDeque<Arc<dyn Strategy>>>);

    impl Prepared {
        fn new(strategies: Vec<Arc<dyn Strategy>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(strategies.into())))
        }
    }

    impl StrategyProvider for Prepared {
        fn build(&self, assistant: &Assistant) -> Result<Arc<dyn Strategy>> {
            assistant.strategy_kind()?;
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Internal("no strategy prepared".into()))
        }
    }

    async fn seeded(kind: StrategyKind) -> (InMemoryStore, Session, Assistant) {
        let store = InMemoryStore::new();
        let (session, assistant) = session_fixture(kind);
        store.insert_session(session.clone()).await;
        store.insert_assistant(assistant.clone()).await;
        (store, session, assistant)
    }

    async fn recv_all(rx: &mut mpsc::Receiver<OutboundRecord>) -> Vec<OutboundRecord> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn text(s: &str) -> Result<ResponseChunk> {
        Ok(ResponseChunk::text(s))
    }

    #[tokio::test]
    async fn last_text_record_is_full_concatenation() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        for fragment in ["Hel", "lo, ", "world"] {
            handles.chunks.send(text(fragment)).await.unwrap();
        }
        drop(handles.chunks);

        let records = recv_all(&mut rx).await;
        let texts: Vec<String> = records
            .iter()
            .map(|r| match &r.block {
                Block::Text { text } => text.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["Hel", "Hello, ", "Hello, world"]);

        let saved = store.turns(&session.id).await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].ai_content, "Hello, world");
        assert_eq!(saved[0].blocks.len(), 1);
    }

    #[tokio::test]
    async fn title_rides_on_the_record_current_when_it_finishes() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();

        let mut records = Vec::new();
        for i in 1..=3 {
            handles.chunks.send(text(&format!("f{i} "))).await.unwrap();
            records.push(rx.recv().await.unwrap());
        }
        handles.title.send("Greeting".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 4..=5 {
            handles.chunks.send(text(&format!("f{i} "))).await.unwrap();
        }
        drop(handles.chunks);
        records.extend(recv_all(&mut rx).await);

        let titled: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.title.is_some())
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(titled, vec![4]);
        assert_eq!(records[3].title.as_deref(), Some("Greeting"));

        let id = session.id.clone();
        let s = store.clone();
        wait_for(move || s.title_write_count() == 1).await;
        assert_eq!(store.title(&id).await.as_deref(), Some("Greeting"));
        assert!(!orch.titles().is_in_flight(&id));
    }

    #[tokio::test]
    async fn stream_does_not_wait_for_a_slow_title() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let strategy = Arc::new(strategy);
        let orch = StreamOrchestrator::new(Prepared::new(vec![strategy.clone()]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        handles.chunks.send(text("done")).await.unwrap();
        drop(handles.chunks);

        let records = recv_all(&mut rx).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].title.is_none());
        assert_eq!(store.save_count(), 1);

        // Title resolves after the stream closed and is still persisted
        handles.title.send("Late title".into()).unwrap();
        let s = store.clone();
        wait_for(move || s.title_write_count() == 1).await;
        assert_eq!(store.title(&session.id).await.as_deref(), Some("Late title"));
        assert_eq!(strategy.summarize_calls(), 1);
    }

    #[tokio::test]
    async fn titled_session_is_never_summarized_again() {
        let (store, mut session, _) = seeded(StrategyKind::Direct).await;
        session.title = Some("Existing".into());
        store.insert_session(session.clone()).await;

        let (strategy, handles) = ManualStrategy::new();
        let strategy = Arc::new(strategy);
        let orch = StreamOrchestrator::new(Prepared::new(vec![strategy.clone()]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        handles.chunks.send(text("a")).await.unwrap();
        drop(handles.chunks);

        assert!(recv_all(&mut rx).await.iter().all(|r| r.title.is_none()));
        assert_eq!(strategy.summarize_calls(), 0);
        assert_eq!(store.title_write_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_turns_start_one_title_task() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (first, first_handles) = ManualStrategy::new();
        let (second, second_handles) = ManualStrategy::new();
        let (first, second) = (Arc::new(first), Arc::new(second));
        let orch = StreamOrchestrator::new(
            Prepared::new(vec![first.clone(), second.clone()]),
            Arc::new(store.clone()),
        );

        let ctx = session.context();
        let mut rx1 = orch.process_turn(Turn::new(&ctx, "one"), &ctx).await.unwrap();
        let mut rx2 = orch.process_turn(Turn::new(&ctx, "two"), &ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.summarize_calls(), 1);
        assert_eq!(second.summarize_calls(), 0);

        drop(first_handles.chunks);
        drop(second_handles.chunks);
        recv_all(&mut rx1).await;
        recv_all(&mut rx2).await;
        assert_eq!(store.save_count(), 2);
        drop(second_handles.title);

        first_handles.title.send("Only title".into()).unwrap();
        let s = store.clone();
        wait_for(move || s.title_write_count() == 1).await;
        assert!(!orch.titles().is_in_flight(&session.id));
    }

    /// Reads `has_title`, then holds the answer for the next queued delay
    /// before returning it.
    struct SlowTitleCheck {
        inner: InMemoryStore,
        delays: Mutex<VecDeque<Duration>>,
    }

    #[async_trait::async_trait]
    impl ConversationStore for SlowTitleCheck {
        fn name(&self) -> &str {
            "slow_title_check"
        }

        async fn get_session(&self, id: &SessionId) -> std::result::Result<Option<Session>, PersistenceError> {
            self.inner.get_session(id).await
        }

        async fn get_assistant(&self, id: &AssistantId) -> std::result::Result<Option<Assistant>, PersistenceError> {
            self.inner.get_assistant(id).await
        }

        async fn has_title(&self, id: &SessionId) -> std::result::Result<bool, PersistenceError> {
            let answer = self.inner.has_title(id).await;
            let delay = self.delays.lock().unwrap().pop_front().unwrap_or_default();
            tokio::time::sleep(delay).await;
            answer
        }

        async fn set_title(&self, id: &SessionId, title: &str) -> std::result::Result<(), PersistenceError> {
            self.inner.set_title(id, title).await
        }

        async fn save_turn(&self, turn: &Turn) -> std::result::Result<(), PersistenceError> {
            self.inner.save_turn(turn).await
        }

        async fn recent_turns(&self, id: &SessionId, limit: usize) -> std::result::Result<Vec<Turn>, PersistenceError> {
            self.inner.recent_turns(id, limit).await
        }

        async fn append_run_log(&self, log: &AgentRunLog) -> std::result::Result<(), PersistenceError> {
            self.inner.append_run_log(log).await
        }

        async fn load_prior_run_log(&self, id: &SessionId) -> std::result::Result<Option<AgentRunLog>, PersistenceError> {
            self.inner.load_prior_run_log(id).await
        }
    }

    #[tokio::test]
    async fn turn_racing_a_finished_title_does_not_retitle() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (first, first_handles) = ManualStrategy::new();
        let (second, second_handles) = ManualStrategy::new();
        let (first, second) = (Arc::new(first), Arc::new(second));
        let slow = SlowTitleCheck {
            inner: store.clone(),
            delays: Mutex::new(VecDeque::from([Duration::ZERO, Duration::from_millis(100)])),
        };
        let orch = Arc::new(StreamOrchestrator::new(
            Prepared::new(vec![first.clone(), second.clone()]),
            Arc::new(slow),
        ));

        let ctx = session.context();
        let mut rx1 = orch.process_turn(Turn::new(&ctx, "one"), &ctx).await.unwrap();
        assert_eq!(first.summarize_calls(), 1);

        // The second turn starts while the first title is still pending and
        // its title check is slow to answer
        let racing = orch.clone();
        let racing_ctx = ctx.clone();
        let second_turn =
            tokio::spawn(async move { racing.process_turn(Turn::new(&racing_ctx, "two"), &racing_ctx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        first_handles.title.send("First".into()).unwrap();
        let (s, titles, id) = (store.clone(), orch.titles().clone(), session.id.clone());
        wait_for(move || s.title_write_count() == 1 && !titles.is_in_flight(&id)).await;

        let mut rx2 = second_turn.await.unwrap().unwrap();
        drop(first_handles.chunks);
        drop(second_handles.chunks);
        recv_all(&mut rx1).await;
        recv_all(&mut rx2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(second.summarize_calls(), 0);
        assert_eq!(store.title(&session.id).await.as_deref(), Some("First"));
        assert_eq!(store.title_write_count(), 1);
        drop(second_handles.title);
    }

    #[tokio::test]
    async fn stream_error_is_forwarded_and_turn_saved_once() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        handles.chunks.send(text("partial")).await.unwrap();
        handles
            .chunks
            .send(Err(Error::Internal("strategy crashed".into())))
            .await
            .unwrap();

        // Draining stops at the error even though the sender is still alive
        let records = recv_all(&mut rx).await;
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1].block, Block::Error { message } if message.contains("strategy crashed")));

        assert_eq!(store.save_count(), 1);
        let saved = &store.turns(&session.id).await[0];
        assert_eq!(saved.ai_content, "partial");
        assert_eq!(saved.blocks.len(), 2);
        drop(handles.chunks);
    }

    #[tokio::test]
    async fn status_is_forwarded_but_not_persisted() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        handles.chunks.send(Ok(ResponseChunk::status("working"))).await.unwrap();
        handles
            .chunks
            .send(Ok(ResponseChunk::Table {
                rows: vec![],
                title: "t".into(),
                description: "d".into(),
            }))
            .await
            .unwrap();
        drop(handles.chunks);

        let records = recv_all(&mut rx).await;
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].block, Block::Status { .. }));

        let saved = &store.turns(&session.id).await[0];
        assert_eq!(saved.blocks.len(), 1);
        assert!(matches!(saved.blocks[0], Block::Table { .. }));
    }

    #[tokio::test]
    async fn disconnected_client_still_gets_a_complete_turn() {
        let (store, session, _) = seeded(StrategyKind::Direct).await;
        let (strategy, handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap();
        handles.chunks.send(text("one ")).await.unwrap();
        rx.recv().await.unwrap();
        drop(rx);

        handles.chunks.send(text("two")).await.unwrap();
        drop(handles.chunks);

        let s = store.clone();
        wait_for(move || s.save_count() == 1).await;
        assert_eq!(store.turns(&session.id).await[0].ai_content, "one two");
    }

    #[tokio::test]
    async fn configuration_error_rejects_before_streaming() {
        let store = InMemoryStore::new();
        let (session, mut assistant) = session_fixture(StrategyKind::Direct);
        assistant.config.kind = "poetry".into();
        store.insert_session(session.clone()).await;
        store.insert_assistant(assistant).await;

        let (strategy, _handles) = ManualStrategy::new();
        let orch = StreamOrchestrator::new(Prepared::new(vec![Arc::new(strategy)]), Arc::new(store.clone()));
        let ctx = session.context();
        let err = orch.process_turn(Turn::new(&ctx, "hi"), &ctx).await.unwrap_err();

        assert!(err.is_config());
        assert_eq!(store.save_count(), 0);
        assert!(!orch.titles().is_in_flight(&session.id));
    }

    #[tokio::test]
    async fn failed_synthesis_keeps_streamed_fragments() {
        let (store, session, _) = seeded(StrategyKind::Research).await;
        let oracle = Arc::new(ScriptedOracle::new().plan(&[]).stream(ScriptedStream::failing_after(
            &["Part one. ", "Part two."],
            OracleError::StreamInterrupted("connection reset".into()),
        )));
        let engine = ResearchEngine::new(oracle, Arc::new(ToolRegistry::new()), ModelSettings::new("m"));
        let orch = StreamOrchestrator::new(
            Prepared::new(vec![Arc::new(ResearchStrategy::new(engine))]),
            Arc::new(store.clone()),
        );

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "objective"), &ctx).await.unwrap();
        let records = recv_all(&mut rx).await;

        let kinds: Vec<&str> = records
            .iter()
            .map(|r| match r.block {
                Block::Text { .. } => "text",
                Block::Error { .. } => "error",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["text", "text", "error"]);

        assert_eq!(store.save_count(), 1);
        let saved = &store.turns(&session.id).await[0];
        assert_eq!(saved.ai_content, "Part one. Part two.");

        // Research titles need no oracle call
        let s = store.clone();
        wait_for(move || s.title_write_count() == 1).await;
        assert_eq!(store.title(&session.id).await.as_deref(), Some("Deep Research: objective..."));
    }

    #[tokio::test]
    async fn research_run_log_seeds_the_next_turn() {
        let (store, session, _) = seeded(StrategyKind::Research).await;
        let oracle = Arc::new(
            ScriptedOracle::new()
                .plan(&["look"])
                .reply("seen")
                .stream(ScriptedStream::fragments(&["Answer"])),
        );
        let engine = ResearchEngine::new(oracle, Arc::new(ToolRegistry::new()), ModelSettings::new("m"));
        let orch = StreamOrchestrator::new(
            Prepared::new(vec![Arc::new(ResearchStrategy::new(engine))]),
            Arc::new(store.clone()),
        );

        let ctx = session.context();
        let mut rx = orch.process_turn(Turn::new(&ctx, "objective"), &ctx).await.unwrap();
        recv_all(&mut rx).await;

        let log = store.load_prior_run_log(&session.id).await.unwrap().unwrap();
        assert_eq!(log.entries.first().unwrap().content, "objective");
        assert_eq!(log.entries.last().unwrap().content, "Answer");
    }

    #[test]
    fn fold_chunk_keeps_one_text_block() {
        let mut turn = turn_fixture("q");
        fold_chunk(&mut turn, ResponseChunk::text("a"));
        fold_chunk(&mut turn, ResponseChunk::error("boom"));
        let block = fold_chunk(&mut turn, ResponseChunk::text("b"));
        assert_eq!(block, Block::Text { text: "ab".into() });
        assert_eq!(turn.blocks.len(), 2);
        assert_eq!(turn.ai_content, "ab");
    }
}
