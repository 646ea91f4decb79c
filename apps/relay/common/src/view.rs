use crate::realtime::{ChangeFeed, FeedEvent};
use crate::store::MessageStore;
use crate::{Message, ServiceError, StoreConfig};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Display-only connection status. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Live,
    LiveStreaming,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Live => "Live",
            ConnectionStatus::LiveStreaming => "Live Streaming",
        }
    }
}

/// How pushed rows are merged into the displayed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Prepend every pushed row. A row delivered by both the initial page
    /// and the feed shows up twice.
    #[default]
    PrependAll,
    /// Prepend, dropping any older copy with the same external id.
    DedupByExternalId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub status: ConnectionStatus,
    pub messages: Vec<Message>,
}

struct ViewState {
    status: ConnectionStatus,
    messages: Vec<Message>,
}

impl ViewState {
    fn advance(&mut self, status: ConnectionStatus) {
        if status > self.status {
            self.status = status;
        }
    }

    fn push(&mut self, row: Message, policy: MergePolicy) {
        if policy == MergePolicy::DedupByExternalId {
            self.messages
                .retain(|existing| existing.discord_message_id != row.discord_message_id);
        }
        self.messages.insert(0, row);
    }

    fn apply_history(&mut self, rows: Vec<Message>, policy: MergePolicy) {
        // Anything pushed before the page arrived is newer than the page.
        let mut merged = std::mem::take(&mut self.messages);
        match policy {
            MergePolicy::PrependAll => merged.extend(rows),
            MergePolicy::DedupByExternalId => {
                let pushed: Vec<String> = merged
                    .iter()
                    .map(|row| row.discord_message_id.clone())
                    .collect();
                merged.extend(
                    rows.into_iter()
                        .filter(|row| !pushed.contains(&row.discord_message_id)),
                );
            }
        }
        self.messages = merged;
    }
}

/// Live, newest-first view of the message store: seeded from history and
/// kept current from the change feed while mounted.
#[derive(Clone)]
pub struct LiveView {
    state: Arc<RwLock<ViewState>>,
    mounted: Arc<AtomicBool>,
    policy: MergePolicy,
}

impl LiveView {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            state: Arc::new(RwLock::new(ViewState {
                status: ConnectionStatus::Connecting,
                messages: Vec::new(),
            })),
            mounted: Arc::new(AtomicBool::new(false)),
            policy,
        }
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        let state = self.state.read().await;
        ViewSnapshot {
            status: state.status,
            messages: state.messages.clone(),
        }
    }

    /// Starts the history load and the feed subscription concurrently.
    pub fn mount(&self, store: Arc<dyn MessageStore>, feed: Arc<dyn ChangeFeed>) -> MountedView {
        self.mounted.store(true, Ordering::SeqCst);

        tokio::spawn(self.clone().load_history(store));

        let (stop_tx, stop_rx) = oneshot::channel();
        let feed_task = tokio::spawn(self.clone().stream_changes(feed, stop_rx));

        MountedView {
            view: self.clone(),
            stop: Some(stop_tx),
            feed_task: Some(feed_task),
        }
    }

    async fn load_history(self, store: Arc<dyn MessageStore>) {
        let result = store.recent(StoreConfig::HISTORY_LIMIT).await;

        let mut state = self.state.write().await;
        if !self.mounted.load(Ordering::SeqCst) {
            return;
        }

        match result {
            Ok(rows) => {
                info!("Loaded {} messages of history", rows.len());
                state.apply_history(rows, self.policy);
            }
            Err(e) => error!("Error fetching history: {}", e),
        }
        state.advance(ConnectionStatus::Live);
    }

    async fn stream_changes(self, feed: Arc<dyn ChangeFeed>, mut stop: oneshot::Receiver<()>) {
        let subscribed: Result<_, ServiceError> = tokio::select! {
            _ = &mut stop => return,
            subscribed = feed.subscribe() => subscribed,
        };

        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to subscribe to the change feed: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = subscription.next() => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        warn!("Change feed ended");
                        break;
                    }
                },
            }
        }

        subscription.release();
    }

    async fn apply(&self, event: FeedEvent) {
        let mut state = self.state.write().await;
        if !self.mounted.load(Ordering::SeqCst) {
            return;
        }

        match event {
            FeedEvent::Accepted => {
                info!("Change feed subscription accepted");
                state.advance(ConnectionStatus::LiveStreaming);
            }
            FeedEvent::Insert(row) => {
                info!("New message received: {}", row.discord_message_id);
                state.push(row, self.policy);
            }
            FeedEvent::Rejected(reason) => {
                warn!("Change feed rejected the subscription: {}", reason);
            }
        }
    }
}

/// Handle for a mounted view. The feed subscription lives exactly as long as
/// this handle: [`MountedView::unmount`] releases it, and so does dropping it.
pub struct MountedView {
    view: LiveView,
    stop: Option<oneshot::Sender<()>>,
    feed_task: Option<JoinHandle<()>>,
}

impl MountedView {
    pub async fn unmount(mut self) {
        {
            // Taking the write lock orders the flag after any in-flight update.
            let _state = self.view.state.write().await;
            self.view.mounted.store(false, Ordering::SeqCst);
        }

        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.feed_task.take() {
            if let Err(e) = task.await {
                error!("Change feed task failed: {}", e);
            }
        }
        info!("View unmounted");
    }
}

impl Drop for MountedView {
    fn drop(&mut self) {
        self.view.mounted.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // Aborting drops the subscription, which releases it.
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFeed, MemoryStore, base_time, eventually, row};
    use chrono::Duration;

    fn history() -> Vec<Message> {
        (1..=3)
            .map(|i| row(i, &format!("h{}", i), "old", base_time() + Duration::seconds(i)))
            .collect()
    }

    async fn wait_for<F>(view: &LiveView, check: F) -> bool
    where
        F: Fn(&ViewSnapshot) -> bool + Clone,
    {
        eventually(|| {
            let view = view.clone();
            let check = check.clone();
            async move { check(&view.snapshot().await) }
        })
        .await
    }

    fn ids(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot
            .messages
            .iter()
            .map(|row| row.discord_message_id.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_initial_load_is_newest_first_then_live() {
        let store = Arc::new(MemoryStore::with_rows(history()));
        let feed = Arc::new(FakeFeed::default());
        let view = LiveView::new(MergePolicy::PrependAll);

        assert_eq!(view.snapshot().await.status, ConnectionStatus::Connecting);
        let mounted = view.mount(store, feed.clone());

        assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live).await);
        assert_eq!(ids(&view.snapshot().await), vec!["h3", "h2", "h1"]);

        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_subscribed() }
        })
        .await);
        feed.push(FeedEvent::Accepted);
        assert!(wait_for(&view, |s| s.status == ConnectionStatus::LiveStreaming).await);

        mounted.unmount().await;
    }

    #[tokio::test]
    async fn test_failed_history_still_goes_live() {
        let store = Arc::new(MemoryStore::with_rows(history()));
        store.set_failing_reads(true);
        let view = LiveView::new(MergePolicy::PrependAll);

        let mounted = view.mount(store, Arc::new(FakeFeed::default()));

        assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live).await);
        assert!(view.snapshot().await.messages.is_empty());
        mounted.unmount().await;
    }

    #[tokio::test]
    async fn test_push_is_prepended_regardless_of_timestamp() {
        let store = Arc::new(MemoryStore::with_rows(history()));
        let feed = Arc::new(FakeFeed::default());
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(store, feed.clone());

        assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live).await);
        let loaded = view.snapshot().await.messages;

        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_subscribed() }
        })
        .await);
        // Older than everything on the page, still goes to the front.
        let pushed = row(99, "late", "pushed", base_time() - Duration::hours(1));
        feed.push(FeedEvent::Insert(pushed.clone()));

        assert!(wait_for(&view, |s| s.messages.len() == 4).await);
        let mut expected = vec![pushed];
        expected.extend(loaded);
        assert_eq!(view.snapshot().await.messages, expected);

        mounted.unmount().await;
    }

    #[tokio::test]
    async fn test_overlap_is_shown_twice_unless_deduplicating() {
        for (policy, expected) in [
            (MergePolicy::PrependAll, vec!["h3", "h3", "h2", "h1"]),
            (MergePolicy::DedupByExternalId, vec!["h3", "h2", "h1"]),
        ] {
            let store = Arc::new(MemoryStore::with_rows(history()));
            let feed = Arc::new(FakeFeed::default());
            let view = LiveView::new(policy);
            let mounted = view.mount(store, feed.clone());

            assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live).await);
            assert!(eventually(|| {
                let feed = feed.clone();
                async move { feed.is_subscribed() }
            })
            .await);

            let mut edited = history()[2].clone();
            edited.content = "edited".to_string();
            feed.push(FeedEvent::Insert(edited));

            let len = expected.len();
            assert!(
                wait_for(&view, move |s| {
                    s.messages.len() == len && s.messages[0].content == "edited"
                })
                .await
            );
            assert_eq!(ids(&view.snapshot().await), expected);

            mounted.unmount().await;
        }
    }

    #[tokio::test]
    async fn test_push_before_history_is_kept_in_front() {
        let store = Arc::new(MemoryStore::holding_reads(history()));
        let feed = Arc::new(FakeFeed::default());
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(store.clone(), feed.clone());

        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_subscribed() }
        })
        .await);
        feed.push(FeedEvent::Accepted);
        feed.push(FeedEvent::Insert(row(10, "fresh", "new", base_time() + Duration::hours(1))));
        assert!(wait_for(&view, |s| s.messages.len() == 1).await);
        assert_eq!(view.snapshot().await.status, ConnectionStatus::LiveStreaming);

        store.release_reads();
        assert!(wait_for(&view, |s| s.messages.len() == 4).await);

        let snapshot = view.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["fresh", "h3", "h2", "h1"]);
        // Completing the history load never moves the status backwards.
        assert_eq!(snapshot.status, ConnectionStatus::LiveStreaming);

        mounted.unmount().await;
    }

    #[tokio::test]
    async fn test_unmount_releases_and_ignores_later_events() {
        let store = Arc::new(MemoryStore::with_rows(history()));
        let feed = Arc::new(FakeFeed::default());
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(store, feed.clone());

        assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live).await);
        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_subscribed() }
        })
        .await);

        mounted.unmount().await;
        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_released() }
        })
        .await);

        let before = view.snapshot().await.messages;
        feed.push(FeedEvent::Insert(row(50, "after", "too late", base_time())));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(view.snapshot().await.messages, before);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let feed = Arc::new(FakeFeed::default());
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(Arc::new(MemoryStore::default()), feed.clone());

        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_subscribed() }
        })
        .await);
        drop(mounted);

        assert!(eventually(|| {
            let feed = feed.clone();
            async move { feed.is_released() }
        })
        .await);
    }

    #[tokio::test]
    async fn test_late_history_after_unmount_is_ignored() {
        let store = Arc::new(MemoryStore::holding_reads(history()));
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(store.clone(), Arc::new(FakeFeed::default()));

        mounted.unmount().await;
        store.release_reads();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snapshot = view.snapshot().await;
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_subscription_failure_does_not_block_history() {
        let store = Arc::new(MemoryStore::with_rows(history()));
        let view = LiveView::new(MergePolicy::PrependAll);
        let mounted = view.mount(store, Arc::new(FakeFeed::failing()));

        assert!(wait_for(&view, |s| s.status == ConnectionStatus::Live && s.messages.len() == 3).await);
        mounted.unmount().await;
    }
}
