//! Per-session event sequencing and live fan-out.
//!
//! Appends are serialized per session so the durable `MAX(sequence)+1`
//! assignment in [`EventRepo::append`] never races with itself. After the
//! durable append, the event is published to a per-session broadcast channel
//! for live observers. Subscribers backfill from the log first, then follow
//! the live feed, deduplicating by sequence — the same replay mechanism
//! recovery uses to rebuild state after a crash.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::event::{EventType, SessionEvent};
use crate::persistence::db::Database;
use crate::persistence::event_repo::EventRepo;
use crate::{AppError, Result};

/// Capacity of each per-session live channel; a lagging subscriber refills
/// from the durable log rather than observing a gap.
const CHANNEL_CAPACITY: usize = 256;

struct SessionChannel {
    tx: broadcast::Sender<SessionEvent>,
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Assigns gap-free sequence numbers and fans events out to live observers.
pub struct EventSequencer {
    repo: EventRepo,
    channels: Mutex<HashMap<String, SessionChannel>>,
}

impl EventSequencer {
    /// Create a sequencer over the shared database pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            repo: EventRepo::new(db),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, session_id: &str) -> Result<(broadcast::Sender<SessionEvent>, Arc<tokio::sync::Mutex<()>>)> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| AppError::Db("sequencer channel map poisoned".into()))?;
        let entry = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| SessionChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                append_lock: Arc::new(tokio::sync::Mutex::new(())),
            });
        Ok((entry.tx.clone(), Arc::clone(&entry.append_lock)))
    }

    /// Durably append an event and publish it to live subscribers.
    ///
    /// The sequence number is assigned at the moment of the durable append;
    /// a failed write never consumes one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the append fails.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<SessionEvent> {
        let (tx, append_lock) = self.channel(session_id)?;
        let _guard = append_lock.lock().await;

        let event = self.repo.append(session_id, event_type, payload).await?;
        debug!(
            session_id,
            sequence = event.sequence,
            event_type = ?event.event_type,
            "event appended"
        );

        // No live subscribers is not an error.
        let _ = tx.send(event.clone());
        Ok(event)
    }

    /// Subscribe to a session's ordered stream from `from_sequence`
    /// (exclusive).
    ///
    /// The subscription yields the durable backlog first, then live events,
    /// with duplicates across the seam filtered by sequence.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the backlog query fails.
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_sequence: i64,
    ) -> Result<EventSubscription> {
        let (tx, _) = self.channel(session_id)?;
        // Subscribe before backfilling so no event can fall between the two.
        let live = tx.subscribe();
        let backlog = self.repo.list_after(session_id, from_sequence).await?;
        let last_sequence = backlog.last().map_or(from_sequence, |e| e.sequence);

        Ok(EventSubscription {
            repo: self.repo.clone(),
            session_id: session_id.to_owned(),
            backlog: VecDeque::from(backlog),
            live,
            last_sequence,
        })
    }
}

/// An ordered, gap-free view of one session's event stream.
pub struct EventSubscription {
    repo: EventRepo,
    session_id: String,
    backlog: VecDeque<SessionEvent>,
    live: broadcast::Receiver<SessionEvent>,
    last_sequence: i64,
}

impl EventSubscription {
    /// Next event in order, or `None` once the stream is closed and drained.
    ///
    /// A lagged live receiver refills from the durable log, so observers
    /// never see a gap — at worst they see the log's slightly older tail.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.last_sequence = event.sequence;
                return Some(event);
            }

            match self.live.recv().await {
                Ok(event) => {
                    if event.sequence > self.last_sequence {
                        self.last_sequence = event.sequence;
                        return Some(event);
                    }
                    // Duplicate of the backfilled prefix.
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    match self
                        .repo
                        .list_after(&self.session_id, self.last_sequence)
                        .await
                    {
                        Ok(missed) => self.backlog = VecDeque::from(missed),
                        Err(_) => return None,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Sequence of the last event yielded.
    #[must_use]
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    /// Adapt the subscription into a [`Stream`] for SSE-style consumers.
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}
