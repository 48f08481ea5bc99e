//! Decides *when* the active category refreshes.
//!
//! Connectivity changes, foreground/background transitions, debounced
//! realtime hints, a periodic timer and user actions all arrive as
//! [`SyncEvent`]s (hints and ticks are produced internally). Each one is
//! turned into a [`LoadKind`] by [`plan_load`], which applies the refresh
//! guards, and the resulting load is spawned on the active [`CategoryFeed`].

use crate::feed::{CategoryCatalog, CategoryFeed, CategoryKey, FeedOptions, HttpFetcher, LoadOutcome};
use crate::realtime::{ChannelGate, RealtimeChannel};
use crate::storage::{Database, DiskCache};
use crate::sync::MemoryIndex;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pending realtime hints before the oldest is dropped.
const HINT_QUEUE: usize = 16;

/// External inputs to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConnectivityChanged(bool),
    Foreground,
    Background,
    RealtimeHint,
    ManualRefresh,
    SelectCategory(String),
    /// `None` or blank text clears the filter.
    FilterChanged(Option<String>),
    Shutdown,
}

/// Why a load is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Reconnected,
    Foreground,
    Hint,
    Tick,
    Manual,
    CategorySwitch { loaded_once: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Reset,
    Refresh,
    Silent,
}

/// Conditions every automatic refresh must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConditions {
    pub online: bool,
    pub foreground: bool,
    pub filter: Option<String>,
}

impl SyncConditions {
    pub fn allows_refresh(&self) -> bool {
        self.online && self.foreground && self.filter.is_none()
    }

    fn gate(&self) -> ChannelGate {
        ChannelGate {
            foreground: self.foreground,
            online: self.online,
        }
    }
}

/// Maps a trigger to the load it should issue, if any.
///
/// Manual refresh and the first display of a category always reset-load;
/// everything else is an incremental refresh subject to the guards.
pub fn plan_load(conditions: &SyncConditions, trigger: Trigger) -> Option<LoadKind> {
    match trigger {
        Trigger::Manual | Trigger::CategorySwitch { loaded_once: false } => Some(LoadKind::Reset),
        _ if !conditions.allows_refresh() => None,
        Trigger::Tick => Some(LoadKind::Silent),
        Trigger::Reconnected
        | Trigger::Foreground
        | Trigger::Hint
        | Trigger::CategorySwitch { loaded_once: true } => Some(LoadKind::Refresh),
    }
}

/// Trailing-edge debounce: every hint pushes the deadline out by `window`.
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once per burst, when the quiet window has elapsed.
    pub fn take_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Shared services the coordinator hands to every feed it creates.
#[derive(Clone)]
pub struct SyncServices {
    pub fetcher: HttpFetcher,
    pub cache: DiskCache,
    pub index: MemoryIndex,
    /// Where the active category is persisted; `None` skips persistence.
    pub db: Option<Database>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub catalog: CategoryCatalog,
    pub feed_options: FeedOptions,
    /// Zero disables the periodic refresh.
    pub refresh_interval: Duration,
    pub hint_debounce: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            catalog: CategoryCatalog::default(),
            feed_options: FeedOptions::default(),
            refresh_interval: Duration::from_secs(120),
            hint_debounce: Duration::from_millis(500),
        }
    }
}

pub struct SyncCoordinator {
    services: SyncServices,
    settings: SyncSettings,
    feeds: HashMap<CategoryKey, Arc<CategoryFeed>>,
    active_tx: watch::Sender<Arc<CategoryFeed>>,
    conditions: SyncConditions,
    gate_tx: watch::Sender<ChannelGate>,
    debounce: Debounce,
    loads: JoinSet<(CategoryKey, LoadOutcome)>,
    realtime: Option<RealtimeChannel>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(services: SyncServices, settings: SyncSettings) -> Self {
        let cancel = CancellationToken::new();
        let conditions = SyncConditions {
            online: services.fetcher.connectivity().is_online(),
            foreground: true,
            filter: None,
        };
        let (gate_tx, _) = watch::channel(conditions.gate());

        let fallback = settings.catalog.fallback().clone();
        let first = Arc::new(Self::build_feed(&services, &settings, &cancel, fallback.clone()));
        let (active_tx, _) = watch::channel(first.clone());

        let mut feeds = HashMap::new();
        feeds.insert(fallback, first);

        Self {
            debounce: Debounce::new(settings.hint_debounce),
            services,
            settings,
            feeds,
            active_tx,
            conditions,
            gate_tx,
            loads: JoinSet::new(),
            realtime: None,
            cancel,
        }
    }

    /// Attaches the push channel. It is spawned by [`run`](Self::run) and
    /// follows the coordinator's foreground/online gate.
    pub fn with_realtime(mut self, channel: RealtimeChannel) -> Self {
        self.realtime = Some(channel);
        self
    }

    fn build_feed(
        services: &SyncServices,
        settings: &SyncSettings,
        cancel: &CancellationToken,
        key: CategoryKey,
    ) -> CategoryFeed {
        CategoryFeed::new(
            key,
            services.fetcher.clone(),
            services.cache.clone(),
            services.index.clone(),
            settings.feed_options,
        )
        .with_parent_token(cancel)
    }

    fn feed(&mut self, key: &CategoryKey) -> Arc<CategoryFeed> {
        if let Some(feed) = self.feeds.get(key) {
            return feed.clone();
        }
        let feed = Arc::new(Self::build_feed(
            &self.services,
            &self.settings,
            &self.cancel,
            key.clone(),
        ));
        self.feeds.insert(key.clone(), feed.clone());
        feed
    }

    pub fn active_feed(&self) -> Arc<CategoryFeed> {
        self.active_tx.borrow().clone()
    }

    /// Receives the feed that became active after every category switch.
    pub fn subscribe_active(&self) -> watch::Receiver<Arc<CategoryFeed>> {
        self.active_tx.subscribe()
    }

    pub fn subscribe_gate(&self) -> watch::Receiver<ChannelGate> {
        self.gate_tx.subscribe()
    }

    pub fn conditions(&self) -> &SyncConditions {
        &self.conditions
    }

    /// Cancelling this token stops the coordinator's tasks and disposes every feed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Selects the initial category and reset-loads it.
    ///
    /// `requested` wins over the persisted choice; either is normalized
    /// against the catalog.
    pub async fn start(&mut self, requested: Option<&str>) {
        let persisted = match (&self.services.db, requested) {
            (Some(db), None) => db.active_category().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read saved category");
                None
            }),
            _ => None,
        };
        let key = self
            .settings
            .catalog
            .normalize(requested.or(persisted.as_deref()).unwrap_or_default());

        let feed = self.feed(&key);
        self.active_tx.send_replace(feed.clone());
        self.persist_active(&key).await;
        tracing::info!(category = %key, "Sync started");
        self.spawn_load(feed, LoadKind::Reset);
    }

    /// Applies one event. `Break` means shutdown was requested.
    pub async fn handle(&mut self, event: SyncEvent) -> ControlFlow<()> {
        match event {
            SyncEvent::ConnectivityChanged(online) => {
                let was_online = self.services.fetcher.connectivity().set_online(online);
                self.conditions.online = online;
                self.publish_gate();
                tracing::info!(online, "Connectivity changed");
                if online && !was_online {
                    self.trigger(Trigger::Reconnected);
                }
            }
            SyncEvent::Foreground => {
                let was_foreground = std::mem::replace(&mut self.conditions.foreground, true);
                self.publish_gate();
                if !was_foreground {
                    tracing::debug!("Returned to foreground");
                    self.trigger(Trigger::Foreground);
                }
            }
            SyncEvent::Background => {
                self.conditions.foreground = false;
                self.publish_gate();
                tracing::debug!("Moved to background");
            }
            SyncEvent::RealtimeHint => self.debounce.trigger(Instant::now()),
            SyncEvent::ManualRefresh => self.trigger(Trigger::Manual),
            SyncEvent::SelectCategory(raw) => self.select_category(&raw).await,
            SyncEvent::FilterChanged(filter) => {
                self.conditions.filter = filter
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty());
            }
            SyncEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn select_category(&mut self, raw: &str) {
        let key = self.settings.catalog.normalize(raw);
        if key == *self.active_feed().key() {
            return;
        }

        let feed = self.feed(&key);
        self.active_tx.send_replace(feed.clone());
        self.persist_active(&key).await;

        let loaded_once = feed.snapshot().loaded_once;
        tracing::info!(category = %key, loaded_once, "Switched category");
        if let Some(kind) = plan_load(&self.conditions, Trigger::CategorySwitch { loaded_once }) {
            self.spawn_load(feed, kind);
        }
    }

    async fn persist_active(&self, key: &CategoryKey) {
        if let Some(db) = &self.services.db {
            if let Err(e) = db.set_active_category(key.as_str()).await {
                tracing::warn!(category = %key, error = %e, "Failed to save active category");
            }
        }
    }

    fn publish_gate(&self) {
        let gate = self.conditions.gate();
        self.gate_tx.send_if_modified(|current| {
            let changed = *current != gate;
            *current = gate;
            changed
        });
    }

    fn trigger(&mut self, trigger: Trigger) {
        match plan_load(&self.conditions, trigger) {
            Some(kind) => {
                let feed = self.active_feed();
                self.spawn_load(feed, kind);
            }
            None => tracing::debug!(?trigger, "Refresh skipped by guards"),
        }
    }

    fn spawn_load(&mut self, feed: Arc<CategoryFeed>, kind: LoadKind) {
        tracing::debug!(category = %feed.key(), ?kind, "Spawning load");
        self.loads.spawn(async move {
            let outcome = match kind {
                LoadKind::Reset => feed.load(true).await,
                LoadKind::Refresh => feed.load(false).await,
                LoadKind::Silent => feed.load_silent().await,
            };
            (feed.key().clone(), outcome)
        });
    }

    fn log_outcome(result: Result<(CategoryKey, LoadOutcome), tokio::task::JoinError>) {
        match result {
            Ok((key, LoadOutcome::Applied { fetched })) => {
                tracing::debug!(category = %key, fetched, "Load applied");
            }
            Ok((key, LoadOutcome::Failed(e))) if e.is_quiet() => {
                tracing::debug!(category = %key, error = %e, "Load failed");
            }
            Ok((key, LoadOutcome::Failed(e))) => {
                tracing::warn!(category = %key, error = %e, "Load failed");
            }
            Ok((key, outcome)) => tracing::debug!(category = %key, ?outcome, "Load dropped"),
            Err(e) => tracing::warn!(error = %e, "Load task failed"),
        }
    }

    /// Waits for every spawned load to finish.
    pub async fn settle(&mut self) {
        while let Some(result) = self.loads.join_next().await {
            Self::log_outcome(result);
        }
    }

    /// Event loop. Returns after `Shutdown`, when `events` closes, or when
    /// the cancel token fires; feeds are disposed and cache writes flushed.
    pub async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>) {
        let (hint_tx, mut hint_rx) = mpsc::channel(HINT_QUEUE);
        let realtime_task = self.realtime.take().map(|channel| {
            tokio::spawn(channel.run(self.subscribe_gate(), hint_tx, self.cancel.child_token()))
        });

        let mut ticker = (!self.settings.refresh_interval.is_zero()).then(|| {
            let period = self.settings.refresh_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let hint_deadline = self.debounce.deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle(event).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },

                Some(()) = hint_rx.recv() => self.debounce.trigger(Instant::now()),

                _ = async {
                    match hint_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if self.debounce.take_if_due(Instant::now()) {
                        self.trigger(Trigger::Hint);
                    }
                }

                _ = async {
                    match ticker.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => self.trigger(Trigger::Tick),

                Some(result) = self.loads.join_next(), if !self.loads.is_empty() => {
                    Self::log_outcome(result);
                }
            }
        }

        self.shutdown(realtime_task).await;
    }

    async fn shutdown(mut self, realtime_task: Option<tokio::task::JoinHandle<()>>) {
        tracing::info!("Sync shutting down");
        self.cancel.cancel();
        for feed in self.feeds.values() {
            feed.dispose();
        }
        self.settle().await;
        if let Some(task) = realtime_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Realtime task failed");
            }
        }
        for feed in self.feeds.values() {
            feed.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Connectivity;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conditions(online: bool, foreground: bool, filter: Option<&str>) -> SyncConditions {
        SyncConditions {
            online,
            foreground,
            filter: filter.map(str::to_string),
        }
    }

    #[test]
    fn test_plan_load_guards() {
        let open = conditions(true, true, None);
        assert_eq!(plan_load(&open, Trigger::Hint), Some(LoadKind::Refresh));
        assert_eq!(plan_load(&open, Trigger::Reconnected), Some(LoadKind::Refresh));
        assert_eq!(plan_load(&open, Trigger::Foreground), Some(LoadKind::Refresh));
        assert_eq!(plan_load(&open, Trigger::Tick), Some(LoadKind::Silent));

        for blocked in [
            conditions(false, true, None),
            conditions(true, false, None),
            conditions(true, true, Some("cats")),
        ] {
            assert_eq!(plan_load(&blocked, Trigger::Hint), None);
            assert_eq!(plan_load(&blocked, Trigger::Tick), None);
            assert_eq!(
                plan_load(&blocked, Trigger::CategorySwitch { loaded_once: true }),
                None
            );
        }
    }

    #[test]
    fn test_manual_and_first_display_bypass_guards() {
        let blocked = conditions(false, false, Some("cats"));
        assert_eq!(plan_load(&blocked, Trigger::Manual), Some(LoadKind::Reset));
        assert_eq!(
            plan_load(&blocked, Trigger::CategorySwitch { loaded_once: false }),
            Some(LoadKind::Reset)
        );
    }

    #[test]
    fn test_debounce_collapses_burst() {
        let start = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(500));

        debounce.trigger(start);
        debounce.trigger(start + Duration::from_millis(300));
        assert!(!debounce.take_if_due(start + Duration::from_millis(600)));
        assert!(debounce.take_if_due(start + Duration::from_millis(800)));
        assert!(!debounce.take_if_due(start + Duration::from_millis(900)));
        assert!(debounce.deadline().is_none());
    }

    async fn coordinator_for(server: &MockServer, db: Option<Database>) -> SyncCoordinator {
        coordinator_with(server, db, SyncSettings::default())
    }

    fn coordinator_with(
        server: &MockServer,
        db: Option<Database>,
        settings: SyncSettings,
    ) -> SyncCoordinator {
        let fetcher = HttpFetcher::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
            Connectivity::new(true),
        );
        let services = SyncServices {
            fetcher,
            cache: DiskCache::disabled(),
            index: MemoryIndex::new(),
            db,
        };
        SyncCoordinator::new(services, settings)
    }

    async fn mount_listing(server: &MockServer, category: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path("/v1/feed"))
            .and(query_param("category", category))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    async fn listing_requests(server: &MockServer) -> usize {
        server.received_requests().await.map_or(0, |r| r.len())
    }

    /// Polls until the server has seen `n` requests, then returns the last URL.
    async fn wait_for_requests(server: &MockServer, n: usize) -> Url {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let requests = server.received_requests().await.unwrap_or_default();
                if requests.len() >= n {
                    return requests[n - 1].url.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected request count not reached")
    }

    const ONE_ITEM: &str = r#"{"items":[{"id":"a","title":"A","normalizedAt":"2024-01-01T00:00:00Z"}]}"#;

    #[tokio::test]
    async fn test_start_reset_loads_active_category() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let mut coordinator = coordinator_for(&server, None).await;
        coordinator.start(None).await;
        coordinator.settle().await;

        let snapshot = coordinator.active_feed().snapshot();
        assert!(snapshot.loaded_once);
        assert_eq!(snapshot.items.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_blocks_automatic_refresh_but_not_manual() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let mut coordinator = coordinator_for(&server, None).await;
        coordinator.start(None).await;
        coordinator.settle().await;
        assert_eq!(listing_requests(&server).await, 1);

        let _ = coordinator
            .handle(SyncEvent::FilterChanged(Some("cats".into())))
            .await;
        let _ = coordinator.handle(SyncEvent::Background).await;
        let _ = coordinator.handle(SyncEvent::Foreground).await;
        coordinator.settle().await;
        assert_eq!(listing_requests(&server).await, 1);

        let _ = coordinator.handle(SyncEvent::ManualRefresh).await;
        coordinator.settle().await;
        assert_eq!(listing_requests(&server).await, 2);
    }

    #[tokio::test]
    async fn test_blank_filter_clears() {
        let server = MockServer::start().await;
        let mut coordinator = coordinator_for(&server, None).await;

        let _ = coordinator
            .handle(SyncEvent::FilterChanged(Some("  ".into())))
            .await;
        assert!(coordinator.conditions().filter.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_once() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let mut coordinator = coordinator_for(&server, None).await;
        coordinator.start(None).await;
        coordinator.settle().await;

        let _ = coordinator.handle(SyncEvent::ConnectivityChanged(false)).await;
        assert!(!coordinator.subscribe_gate().borrow().allows());
        let _ = coordinator.handle(SyncEvent::ConnectivityChanged(true)).await;
        // Already online: not a transition
        let _ = coordinator.handle(SyncEvent::ConnectivityChanged(true)).await;
        coordinator.settle().await;

        assert!(coordinator.subscribe_gate().borrow().allows());
        assert_eq!(listing_requests(&server).await, 2);
    }

    #[tokio::test]
    async fn test_category_switch_persists_and_reset_loads() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;
        mount_listing(&server, "sports", r#"{"items":[{"id":"s","title":"S"}]}"#).await;

        let db = Database::open(":memory:").await.unwrap();
        let mut coordinator = coordinator_for(&server, Some(db.clone())).await;
        coordinator.start(None).await;
        coordinator.settle().await;

        let _ = coordinator
            .handle(SyncEvent::SelectCategory("Sports".into()))
            .await;
        coordinator.settle().await;

        let active = coordinator.active_feed();
        assert_eq!(active.key().as_str(), "sports");
        assert_eq!(active.snapshot().items[0].id, "s");
        assert_eq!(db.active_category().await.unwrap().as_deref(), Some("sports"));
    }

    #[tokio::test]
    async fn test_start_restores_persisted_category() {
        let server = MockServer::start().await;
        mount_listing(&server, "science", ONE_ITEM).await;

        let db = Database::open(":memory:").await.unwrap();
        db.set_active_category("science").await.unwrap();

        let mut coordinator = coordinator_for(&server, Some(db)).await;
        coordinator.start(None).await;
        coordinator.settle().await;

        assert_eq!(coordinator.active_feed().key().as_str(), "science");
    }

    #[tokio::test]
    async fn test_unknown_category_falls_back() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let mut coordinator = coordinator_for(&server, None).await;
        coordinator.start(Some("no-such-vertical")).await;
        coordinator.settle().await;

        assert_eq!(coordinator.active_feed().key().as_str(), "all");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_disposes_feeds() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let mut coordinator = coordinator_for(&server, None).await;
        coordinator.start(None).await;
        let feed = coordinator.active_feed();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(SyncEvent::Shutdown).await.unwrap();
        task.await.unwrap();

        assert!(feed.is_disposed());
    }

    #[tokio::test]
    async fn test_run_debounces_hint_burst_into_one_refresh() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let settings = SyncSettings {
            refresh_interval: Duration::ZERO,
            hint_debounce: Duration::from_millis(100),
            ..SyncSettings::default()
        };
        let mut coordinator = coordinator_with(&server, None, settings);
        coordinator.start(None).await;
        coordinator.settle().await;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(coordinator.run(rx));
        for _ in 0..5 {
            tx.send(SyncEvent::RealtimeHint).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let refresh = wait_for_requests(&server, 2).await;
        assert!(refresh.query().unwrap_or_default().contains("since="));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(listing_requests(&server).await, 2);

        tx.send(SyncEvent::Shutdown).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_ticker_issues_silent_incremental_load() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let settings = SyncSettings {
            refresh_interval: Duration::from_millis(200),
            ..SyncSettings::default()
        };
        let mut coordinator = coordinator_with(&server, None, settings);
        coordinator.start(None).await;
        coordinator.settle().await;
        let mut snapshots = coordinator.active_feed().subscribe();
        snapshots.borrow_and_update();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(coordinator.run(rx));

        let tick = wait_for_requests(&server, 2).await;
        assert!(tick.query().unwrap_or_default().contains("since="));
        // A silent load publishes once, on completion, without the refreshing flag
        tokio::time::timeout(Duration::from_secs(2), snapshots.changed())
            .await
            .expect("tick load published")
            .unwrap();
        assert!(!snapshots.borrow_and_update().refreshing);

        tx.send(SyncEvent::Shutdown).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_ticker_respects_filter_and_background() {
        let server = MockServer::start().await;
        mount_listing(&server, "all", ONE_ITEM).await;

        let settings = SyncSettings {
            refresh_interval: Duration::from_millis(100),
            ..SyncSettings::default()
        };
        let mut coordinator = coordinator_with(&server, None, settings);
        coordinator.start(None).await;
        coordinator.settle().await;
        let _ = coordinator
            .handle(SyncEvent::FilterChanged(Some("cats".into())))
            .await;

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(coordinator.run(rx));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(listing_requests(&server).await, 1);

        tx.send(SyncEvent::Background).await.unwrap();
        tx.send(SyncEvent::FilterChanged(None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(listing_requests(&server).await, 1);

        tx.send(SyncEvent::Shutdown).await.unwrap();
        task.await.unwrap();
    }
}
