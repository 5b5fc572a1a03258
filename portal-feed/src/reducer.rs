use crate::event::{DocumentUploaded, DocumentVoted, DomainEvent, StreamEvent, StreamEventKind};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Number of transaction hashes remembered before the seen set is compacted.
pub const SEEN_CAPACITY: usize = 1000;
/// Number of most recent hashes kept by a compaction.
pub const SEEN_RETAINED: usize = 500;
pub const HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_WARM_UP: Duration = Duration::from_secs(2);

/// When the reducer starts invoking callbacks.
///
/// Connecting to the stream usually replays a backlog of older events. The
/// warm-up suppresses callbacks for that backlog. It is a heuristic: events
/// are still recorded in the history during the warm-up, they just do not
/// notify anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmUp {
    /// Callbacks fire for every event.
    Disabled,
    /// Callbacks are suppressed until the given time has passed since the
    /// first classified event. That first event never fires a callback.
    AfterFirstEvent(Duration),
}

impl Default for WarmUp {
    fn default() -> Self {
        WarmUp::AfterFirstEvent(DEFAULT_WARM_UP)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerConfig {
    /// Package id events must belong to. Matched as a substring of the
    /// event type.
    pub package_id: String,
    pub warm_up: WarmUp,
}

impl ReducerConfig {
    pub fn new(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            warm_up: WarmUp::default(),
        }
    }
}

type Callback<T> = Box<dyn FnMut(&T) + Send>;

/// Turns raw stream events into deduplicated document events.
///
/// Each transaction hash is surfaced at most once while it is remembered by
/// the seen set. Classified events are kept in a bounded history, newest
/// first.
pub struct DocumentEventReducer {
    config: ReducerConfig,
    seen: SeenSet,
    history: VecDeque<DomainEvent>,
    warm_up_started: Option<Instant>,
    on_uploaded: Option<Callback<DocumentUploaded>>,
    on_voted: Option<Callback<DocumentVoted>>,
}

impl DocumentEventReducer {
    pub fn new(config: ReducerConfig) -> Self {
        Self {
            config,
            seen: SeenSet::new(SEEN_CAPACITY, SEEN_RETAINED),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            warm_up_started: None,
            on_uploaded: None,
            on_voted: None,
        }
    }

    pub fn on_document_uploaded(
        mut self,
        callback: impl FnMut(&DocumentUploaded) + Send + 'static,
    ) -> Self {
        self.on_uploaded = Some(Box::new(callback));
        self
    }

    pub fn on_document_voted(
        mut self,
        callback: impl FnMut(&DocumentVoted) + Send + 'static,
    ) -> Self {
        self.on_voted = Some(Box::new(callback));
        self
    }

    pub fn handle(&mut self, event: StreamEvent) -> Option<DomainEvent> {
        self.handle_at(event, Instant::now())
    }

    /// Process `event` as if it arrived at `now`.
    ///
    /// Returns the classified event if it was new and recognised, whether or
    /// not a callback fired for it.
    pub fn handle_at(&mut self, event: StreamEvent, now: Instant) -> Option<DomainEvent> {
        if event.kind != StreamEventKind::PackageEvent {
            return None;
        }

        let event_type = &event.payload.event_type;
        if !event_type.contains(&self.config.package_id) {
            tracing::trace!(%event_type, "Ignoring event from foreign package");
            return None;
        }

        if !self.seen.insert(&event.transaction_hash) {
            tracing::trace!(tx = %event.transaction_hash, "Ignoring duplicate event");
            return None;
        }

        let domain_event = if event_type.contains("DocumentUploaded") {
            DomainEvent::DocumentUploaded(DocumentUploaded::from_stream(&event))
        } else if event_type.contains("DocumentVoted") {
            DomainEvent::DocumentVoted(DocumentVoted::from_stream(&event))
        } else {
            tracing::debug!(%event_type, "Ignoring unknown document event type");
            return None;
        };

        self.history.push_front(domain_event.clone());
        self.history.truncate(HISTORY_CAPACITY);

        let notify = self.past_warm_up(now);
        if self.warm_up_started.is_none() {
            self.warm_up_started = Some(now);
        }

        if notify {
            match &domain_event {
                DomainEvent::DocumentUploaded(uploaded) => {
                    if let Some(callback) = self.on_uploaded.as_mut() {
                        callback(uploaded);
                    }
                }
                DomainEvent::DocumentVoted(voted) => {
                    if let Some(callback) = self.on_voted.as_mut() {
                        callback(voted);
                    }
                }
            }
        } else {
            tracing::debug!(
                tx = %domain_event.transaction_hash(),
                "Event received during warm-up, not notifying"
            );
        }

        Some(domain_event)
    }

    fn past_warm_up(&self, now: Instant) -> bool {
        match self.config.warm_up {
            WarmUp::Disabled => true,
            WarmUp::AfterFirstEvent(duration) => self
                .warm_up_started
                .is_some_and(|started| now.saturating_duration_since(started) >= duration),
        }
    }

    /// Recent events, newest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &DomainEvent> {
        self.history.iter()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Forget the history and every seen transaction hash.
    pub fn clear(&mut self) {
        self.history.clear();
        self.seen.clear();
    }

    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }
}

/// Set of transaction hashes with an insertion-order bound.
///
/// Insertion order approximates recency; this is not an LRU.
#[derive(Debug)]
struct SeenSet {
    hashes: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
    retained: usize,
}

impl SeenSet {
    fn new(capacity: usize, retained: usize) -> Self {
        Self {
            hashes: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            retained,
        }
    }

    /// Returns `false` if the hash was already present.
    fn insert(&mut self, hash: &str) -> bool {
        if self.contains(hash) {
            return false;
        }

        self.hashes.insert(hash.to_owned());
        self.order.push_back(hash.to_owned());

        if self.order.len() > self.capacity {
            while self.order.len() > self.retained {
                if let Some(oldest) = self.order.pop_front() {
                    self.hashes.remove(&oldest);
                }
            }
            tracing::debug!(retained = self.order.len(), "Compacted seen transaction hashes");
        }

        true
    }

    fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    fn len(&self) -> usize {
        self.hashes.len()
    }

    fn clear(&mut self) {
        self.hashes.clear();
        self.order.clear();
    }
}
