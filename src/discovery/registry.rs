use super::{AnnouncementSink, QueryKind, Searcher, ServiceAnnouncement};
use anyhow::Result;
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Predicate = Box<dyn Fn(&ServiceAnnouncement) -> bool + Send + Sync>;

struct Registration {
    priority: i32,
    predicate: Predicate,
    sink: Arc<dyn AnnouncementSink>,
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Period of the search loop
    pub search_interval: Duration,
    /// Minimum gap between the end of one cycle and the start of the next
    pub min_search_interval: Duration,
    /// How long each query stays open
    pub search_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_interval: Duration::from_secs(300),
            min_search_interval: Duration::from_secs(60),
            search_window: Duration::from_secs(10),
        }
    }
}

/// What a call to [`DiscoveryRegistry::search`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Previous cycle still running or finished too recently
    Skipped,
    Completed { dispatched: usize },
}

#[derive(Default)]
struct SearchState {
    in_flight: bool,
    last_completed: Option<Instant>,
}

/// Clears the in-flight flag however the cycle ends.
struct CycleGuard<'a> {
    state: &'a Mutex<SearchState>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = false;
        state.last_completed = Some(Instant::now());
    }
}

/// Ordered (priority, predicate, sink) registrations plus the periodic search.
///
/// Lower priority numbers are evaluated first. Each announcement goes to the
/// first matching registration only, so a catch-all registered with the
/// weakest priority only sees what nobody else claimed.
pub struct DiscoveryRegistry {
    searcher: Arc<dyn Searcher>,
    config: DiscoveryConfig,
    registrations: Mutex<Vec<Registration>>,
    search_state: Mutex<SearchState>,
}

impl DiscoveryRegistry {
    pub fn new(searcher: Arc<dyn Searcher>, config: DiscoveryConfig) -> Self {
        Self {
            searcher,
            config,
            registrations: Mutex::new(Vec::new()),
            search_state: Mutex::new(SearchState::default()),
        }
    }

    /// Adds a registration. Ties keep registration order; duplicates are not detected.
    pub fn register<P>(&self, priority: i32, predicate: P, sink: Arc<dyn AnnouncementSink>)
    where
        P: Fn(&ServiceAnnouncement) -> bool + Send + Sync + 'static,
    {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.push(Registration {
            priority,
            predicate: Box::new(predicate),
            sink,
        });
        // Stable sort keeps insertion order among equal priorities
        registrations.sort_by_key(|r| r.priority);
        debug!(priority = priority, total = registrations.len(), "Discovery registration added");
    }

    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forwards the announcement to the first matching sink. Returns false if
    /// nothing claimed it.
    pub fn dispatch(&self, announcement: &ServiceAnnouncement) -> bool {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match registrations.iter().find(|r| (r.predicate)(announcement)) {
            Some(registration) => {
                registration.sink.accept(announcement.clone());
                true
            }
            None => {
                debug!(
                    serial = %announcement.serial_number,
                    service_type = %announcement.service_type,
                    "Announcement not claimed"
                );
                false
            }
        }
    }

    /// Runs one discovery cycle: a root-device query, then a general one.
    ///
    /// Skipped with a warning while another cycle is running or when the last
    /// one finished less than `min_search_interval` ago. A failing query is
    /// logged and the cycle moves on.
    pub async fn search(&self, cancel: &CancellationToken) -> SearchOutcome {
        {
            let mut state = self
                .search_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.in_flight {
                warn!("Discovery search still in progress, skipping cycle");
                return SearchOutcome::Skipped;
            }
            if let Some(last) = state.last_completed {
                let since = last.elapsed();
                if since < self.config.min_search_interval {
                    warn!(
                        since_ms = since.as_millis() as u64,
                        min_interval_ms = self.config.min_search_interval.as_millis() as u64,
                        "Previous discovery search completed too recently, skipping cycle"
                    );
                    return SearchOutcome::Skipped;
                }
            }
            state.in_flight = true;
        }
        let _guard = CycleGuard {
            state: &self.search_state,
        };

        let mut dispatched = 0;
        for query in [QueryKind::RootDevices, QueryKind::All] {
            if cancel.is_cancelled() {
                break;
            }
            dispatched += self.run_query(query, cancel).await;
        }

        info!(dispatched = dispatched, "Discovery search completed");
        SearchOutcome::Completed { dispatched }
    }

    async fn run_query(&self, query: QueryKind, cancel: &CancellationToken) -> usize {
        let mut stream = match self.searcher.start_discovery(query).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(query = %query, error = %format!("{:#}", e), "Discovery query failed");
                return 0;
            }
        };

        let window = tokio::time::sleep(self.config.search_window);
        tokio::pin!(window);

        let mut dispatched = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = &mut window => break,
                next = stream.next() => match next {
                    Some(announcement) => {
                        if self.dispatch(&announcement) {
                            dispatched += 1;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!(query = %query, dispatched = dispatched, "Discovery query stopped");
        dispatched
    }

    /// Searches every `search_interval` until cancelled. The first cycle starts immediately.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.search_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.search(&cancel).await;
                }
            }
        }
        Ok(())
    }
}
