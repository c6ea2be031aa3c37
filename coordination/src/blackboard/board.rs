//! In-process publish/subscribe hub with append-only history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::types::{
    BlackboardSnapshot, BoardPayload, Envelope, FinalInsightPayload, MessageEnvelope, PublishMeta,
    RawDataPayload, SemanticSummaryPayload,
};

/// `None` is the finalize sentinel.
type Message = Option<Arc<Envelope>>;

/// Shared reference to a [`SharedBlackboard`].
pub type SharedBlackboardRef = Arc<SharedBlackboard>;

/// A subscriber's receiving end.
///
/// Open until the finalize sentinel (or a closed channel) is observed, then
/// permanently closed.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next envelope, or `None` once the blackboard has been finalized.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(Some(envelope)) => Some(envelope),
            Some(None) | None => self.close(),
        }
    }

    /// Non-blocking variant of [`Self::recv`]. `None` also when nothing is
    /// queued yet; check [`Self::is_closed`] to tell the cases apart.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        if self.closed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Some(envelope)) => Some(envelope),
            Ok(None) | Err(mpsc::error::TryRecvError::Disconnected) => self.close(),
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }

    fn close(&mut self) -> Option<Arc<Envelope>> {
        self.closed = true;
        self.rx.close();
        None
    }
}

/// Stores and broadcasts pipeline messages.
///
/// Publishing never waits on subscribers: each one owns an unbounded queue.
/// `finalize` delivers a single sentinel to every subscriber; later calls
/// are counted but otherwise no-ops.
///
/// A board created with [`Self::scope`] has its own subscribers and
/// finalize signal, and forwards every envelope to its parent. Finalizing a
/// scope never finalizes the parent.
pub struct SharedBlackboard {
    history: Mutex<Vec<Arc<Envelope>>>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_subscriber: AtomicU64,
    finalized: watch::Sender<bool>,
    finalize_calls: AtomicUsize,
    parent: Option<SharedBlackboardRef>,
    closed_scopes: AtomicUsize,
}

impl SharedBlackboard {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<SharedBlackboardRef>) -> Self {
        let (finalized, _) = watch::channel(false);
        Self {
            history: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            finalized,
            finalize_calls: AtomicUsize::new(0),
            parent,
            closed_scopes: AtomicUsize::new(0),
        }
    }

    pub fn shared(self) -> SharedBlackboardRef {
        Arc::new(self)
    }

    /// Child board for one unit of work (a document run or a batch).
    pub fn scope(self: &Arc<Self>) -> SharedBlackboardRef {
        Arc::new(Self::with_parent(Some(Arc::clone(self))))
    }

    /// Number of child scopes that have been finalized.
    pub fn closed_scopes(&self) -> usize {
        self.closed_scopes.load(Ordering::SeqCst)
    }

    pub fn publish_raw(&self, agent: &str, payload: RawDataPayload, meta: PublishMeta) -> Arc<Envelope> {
        self.publish(agent, payload, meta)
    }

    pub fn publish_summary(
        &self,
        agent: &str,
        payload: SemanticSummaryPayload,
        meta: PublishMeta,
    ) -> Arc<Envelope> {
        self.publish(agent, payload, meta)
    }

    pub fn publish_insight(
        &self,
        agent: &str,
        payload: FinalInsightPayload,
        meta: PublishMeta,
    ) -> Arc<Envelope> {
        self.publish(agent, payload, meta)
    }

    /// Append to history, then fan out to current subscribers and to the
    /// parent board.
    pub fn publish<P: BoardPayload>(&self, agent: &str, payload: P, meta: PublishMeta) -> Arc<Envelope> {
        let envelope = Arc::new(P::into_envelope(MessageEnvelope {
            agent: agent.to_string(),
            kind: P::KIND,
            payload,
            timestamp: Utc::now(),
            tokens: meta.tokens,
            latency_ms: meta.latency_ms,
            correlation_id: meta.correlation_id,
        }));

        let mut board = Some(self);
        while let Some(current) = board {
            current.deliver(&envelope);
            board = current.parent.as_deref();
        }
        envelope
    }

    fn deliver(&self, envelope: &Arc<Envelope>) {
        lock(&self.history).push(Arc::clone(envelope));

        let targets: Vec<(u64, mpsc::UnboundedSender<Message>)> = lock(&self.subscribers)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        let dead: Vec<u64> = targets
            .into_iter()
            .filter(|(_, tx)| tx.send(Some(Arc::clone(envelope))).is_err())
            .map(|(id, _)| id)
            .collect();
        if !dead.is_empty() {
            let mut subscribers = lock(&self.subscribers);
            for id in &dead {
                subscribers.remove(id);
            }
        }

        debug!(
            kind = %envelope.kind(),
            document_id = %envelope.document_id(),
            scoped = self.parent.is_some(),
            dropped_subscribers = dead.len(),
            "Blackboard publish"
        );
    }

    /// Register a subscriber. After finalize the subscription is delivered
    /// the sentinel immediately.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = lock(&self.subscribers);
        if self.is_finalized() {
            let _ = tx.send(None);
        } else {
            subscribers.insert(id, tx);
        }

        Subscription {
            id,
            rx,
            closed: false,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        lock(&self.subscribers).remove(&subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Deliver the sentinel to every subscriber and flip the finalized
    /// signal. Only the first call has an effect.
    pub fn finalize(&self) {
        let calls = self.finalize_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let drained: Vec<mpsc::UnboundedSender<Message>> = {
            let mut subscribers = lock(&self.subscribers);
            if self.is_finalized() {
                debug!(calls, "Blackboard already finalized");
                return;
            }
            self.finalized.send_replace(true);
            subscribers.drain().map(|(_, tx)| tx).collect()
        };

        for tx in &drained {
            let _ = tx.send(None);
        }
        if let Some(parent) = &self.parent {
            parent.closed_scopes.fetch_add(1, Ordering::SeqCst);
        }
        debug!(calls, subscribers = drained.len(), "Blackboard finalized");
    }

    pub fn is_finalized(&self) -> bool {
        *self.finalized.borrow()
    }

    /// Number of times [`Self::finalize`] was called.
    pub fn finalize_count(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    /// Resolve once the blackboard has been finalized.
    pub async fn wait_finalized(&self) {
        let mut rx = self.finalized.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// All envelopes in publish order.
    pub fn history(&self) -> Vec<Arc<Envelope>> {
        lock(&self.history).clone()
    }

    pub fn snapshot(&self) -> BlackboardSnapshot {
        let mut snapshot = BlackboardSnapshot::default();
        for envelope in lock(&self.history).iter() {
            match &**envelope {
                Envelope::Raw(e) => snapshot.raw.push(e.clone()),
                Envelope::Summary(e) => snapshot.summaries.push(e.clone()),
                Envelope::Insight(e) => snapshot.insights.push(e.clone()),
            }
        }
        snapshot
    }
}

impl Default for SharedBlackboard {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::MessageKind;
    use serde_json::json;
    use std::time::Duration;

    fn raw(document_id: &str) -> RawDataPayload {
        RawDataPayload {
            document_id: document_id.to_string(),
            stage: "extraction".to_string(),
            data: json!({"items": 1}),
            metadata: Default::default(),
        }
    }

    fn insight(document_id: &str) -> FinalInsightPayload {
        FinalInsightPayload {
            document_id: document_id.to_string(),
            stage: "insight".to_string(),
            summary: "done".to_string(),
            insights: vec!["keep going".to_string()],
            provenance: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order_then_sentinel() {
        let board = SharedBlackboard::new();
        let mut sub = board.subscribe();

        board.publish_raw("extractor", raw("a"), PublishMeta::new().tokens(5));
        board.publish_summary(
            "auditor",
            SemanticSummaryPayload::new("a", "audit", "ok"),
            PublishMeta::new(),
        );
        board.finalize();

        assert_eq!(sub.recv().await.unwrap().kind(), MessageKind::Raw);
        assert_eq!(sub.recv().await.unwrap().kind(), MessageKind::Summary);
        assert!(sub.recv().await.is_none());
        assert!(sub.is_closed());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let board = SharedBlackboard::new();
        let mut sub = board.subscribe();

        board.finalize();
        board.finalize();

        assert_eq!(board.finalize_count(), 2);
        assert!(sub.try_recv().is_none());
        assert!(sub.is_closed());
        assert_eq!(board.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_finalize_does_not_block() {
        let board = SharedBlackboard::new();
        board.finalize();

        let mut late = board.subscribe();
        let next = tokio::time::timeout(Duration::from_millis(100), late.recv())
            .await
            .expect("late subscriber must not block");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_wait_finalized_resolves() {
        let board = SharedBlackboard::new().shared();
        let waiter = {
            let board = Arc::clone(&board);
            tokio::spawn(async move { board.wait_finalized().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        board.finalize();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolves")
            .unwrap();
        // Already finalized: resolves immediately.
        board.wait_finalized().await;
    }

    #[test]
    fn test_publish_without_subscribers_and_unsubscribe() {
        let board = SharedBlackboard::new();
        let sub = board.subscribe();
        assert_eq!(board.subscriber_count(), 1);
        board.unsubscribe(sub);
        assert_eq!(board.subscriber_count(), 0);

        let envelope = board.publish_insight("intelligence", insight("a"), PublishMeta::new());
        assert_eq!(envelope.document_id(), "a");
        assert_eq!(board.history().len(), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let board = SharedBlackboard::new();
        drop(board.subscribe());
        board.publish_raw("extractor", raw("a"), PublishMeta::new());
        assert_eq!(board.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_forwards_and_closes_alone() {
        let parent = SharedBlackboard::new().shared();
        let mut parent_sub = parent.subscribe();
        let first = parent.scope();
        let second = parent.scope();
        let mut first_sub = first.subscribe();
        let mut second_sub = second.subscribe();

        first.publish_raw("extractor", raw("a"), PublishMeta::new());
        first.finalize();
        second.publish_insight("intelligence", insight("b"), PublishMeta::new());

        assert_eq!(first_sub.recv().await.unwrap().document_id(), "a");
        assert!(first_sub.recv().await.is_none());
        assert_eq!(second_sub.recv().await.unwrap().document_id(), "b");
        assert!(second_sub.try_recv().is_none());
        assert!(!second_sub.is_closed());

        assert_eq!(parent_sub.recv().await.unwrap().document_id(), "a");
        assert_eq!(parent_sub.recv().await.unwrap().document_id(), "b");
        assert!(!parent.is_finalized());
        assert_eq!(parent.closed_scopes(), 1);
        assert_eq!(parent.history().len(), 2);
        assert_eq!(second.history().len(), 1);

        second.finalize();
        second.finalize();
        assert_eq!(parent.closed_scopes(), 2);
    }

    #[test]
    fn test_snapshot_groups_by_kind() {
        let board = SharedBlackboard::new();
        board.publish_raw("extractor", raw("a"), PublishMeta::new());
        board.publish_insight("intelligence", insight("a"), PublishMeta::new());
        board.publish_insight("intelligence", insight("b"), PublishMeta::new().correlation_id("r"));

        let snapshot = board.snapshot();
        assert_eq!(snapshot.raw.len(), 1);
        assert!(snapshot.summaries.is_empty());
        assert_eq!(snapshot.insights_for("a"), 1);
        assert_eq!(snapshot.insights_for("b"), 1);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["insights"][1]["correlationId"], "r");
        assert!(value.get("summaries").unwrap().as_array().unwrap().is_empty());
    }
}
