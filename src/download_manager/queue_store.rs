//! Authoritative in-memory state of the download queue.
//!
//! All item mutations go through `QueueStore` and happen under a single
//! mutex. Each mutation publishes its event to the broadcaster before the
//! lock is released, so subscribers see per-item events in the order the
//! transitions happened. Workers prove ownership of an item with the
//! `ClaimToken` handed out by `claim_next`.

use super::broadcaster::ProgressBroadcaster;
use super::models::*;
use crate::server::metrics;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors returned synchronously by queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Queue is busy: {active} item(s) in progress")]
    Busy { active: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Claim on item {0} is no longer valid")]
    StaleClaim(String),

    #[error("Invalid transition for item {item_id}: {from} -> {to}")]
    InvalidTransition {
        item_id: String,
        from: ItemState,
        to: ItemState,
    },
}

impl QueueError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::NotFound(_) => "not_found",
            QueueError::Busy { .. } => "busy",
            QueueError::Closed => "closed",
            QueueError::StaleClaim(_) => "stale_claim",
            QueueError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Proof of write-ownership over one item, issued at claim time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    item_id: String,
    generation: u64,
}

impl ClaimToken {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

/// An item handed to a worker.
#[derive(Debug, Clone)]
pub struct Claim {
    pub item: QueueItem,
    pub token: ClaimToken,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was pending and is now cancelled.
    Cancelled,
    /// The item is owned by a worker, which will acknowledge at its next checkpoint.
    Requested,
    /// The item had already reached a terminal state.
    AlreadyTerminal(ItemState),
}

impl CancelOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::Requested => "requested",
            CancelOutcome::AlreadyTerminal(_) => "already_terminal",
        }
    }
}

struct Entry {
    item: QueueItem,
    generation: u64,
    cancel_requested: bool,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    /// Admission order of every item currently held.
    order: Vec<String>,
    pending: VecDeque<String>,
    /// source_reference -> id, for non-terminal items only.
    in_flight_refs: HashMap<String, String>,
    next_generation: u64,
    closed: bool,
}

impl QueueState {
    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.entries.values() {
            counts.add(entry.item.state);
        }
        counts
    }

    fn owned_entry_mut(&mut self, token: &ClaimToken) -> Result<&mut Entry, QueueError> {
        let entry = self
            .entries
            .get_mut(&token.item_id)
            .ok_or_else(|| QueueError::NotFound(token.item_id.clone()))?;
        if entry.generation != token.generation {
            return Err(QueueError::StaleClaim(token.item_id.clone()));
        }
        Ok(entry)
    }
}

pub struct QueueStore {
    state: Mutex<QueueState>,
    broadcaster: Arc<ProgressBroadcaster>,
    work_available: Notify,
}

impl QueueStore {
    pub fn new(broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            broadcaster,
            work_available: Notify::new(),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    // === Admission ===

    /// Admits a new pending item, or returns the id of the non-terminal item
    /// already queued for the same reference.
    pub fn enqueue(&self, source_reference: &str) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(QueueError::Closed);
        }

        if let Some(existing) = state.in_flight_refs.get(source_reference) {
            debug!(
                "Reference {} already queued as {}",
                source_reference, existing
            );
            return Ok(EnqueueOutcome {
                item_id: existing.clone(),
                created: false,
            });
        }

        let id = Uuid::new_v4().to_string();
        let item = QueueItem::new(id.clone(), source_reference.to_string());
        state
            .in_flight_refs
            .insert(source_reference.to_string(), id.clone());
        state.order.push(id.clone());
        state.pending.push_back(id.clone());
        self.publish_item(&item);
        state.entries.insert(
            id.clone(),
            Entry {
                item,
                generation: 0,
                cancel_requested: false,
            },
        );
        self.publish_queue_changed(&state);
        drop(state);

        self.work_available.notify_one();
        info!("Queued {} as {}", source_reference, id);
        Ok(EnqueueOutcome {
            item_id: id,
            created: true,
        })
    }

    /// Stops accepting new items. Items already queued are unaffected.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.work_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    // === Claiming ===

    /// Takes the oldest pending item, moving it to `resolving`.
    pub fn claim_next(&self) -> Option<Claim> {
        let mut state = self.state.lock().unwrap();
        let id = state.pending.pop_front()?;
        state.next_generation += 1;
        let generation = state.next_generation;
        let remaining = !state.pending.is_empty();

        let entry = state.entries.get_mut(&id)?;
        entry.generation = generation;
        entry.item.state = ItemState::Resolving;
        entry.item.updated_at = Utc::now();
        let item = entry.item.clone();
        self.publish_transition(&state, &item);
        drop(state);

        if remaining {
            self.work_available.notify_one();
        }
        Some(Claim {
            item,
            token: ClaimToken {
                item_id: id,
                generation,
            },
        })
    }

    /// Waits until a pending item can be claimed.
    pub async fn wait_for_claim(&self) -> Claim {
        loop {
            if let Some(claim) = self.claim_next() {
                return claim;
            }
            self.work_available.notified().await;
        }
    }

    // === Owner operations ===

    /// Records the resolved descriptor and moves the item to `fetching`.
    pub fn begin_fetching(
        &self,
        token: &ClaimToken,
        descriptor: TrackDescriptor,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.owned_entry_mut(token)?;
        if entry.item.state != ItemState::Resolving {
            return Err(QueueError::InvalidTransition {
                item_id: token.item_id.clone(),
                from: entry.item.state,
                to: ItemState::Fetching,
            });
        }
        entry.item.descriptor = Some(descriptor);
        entry.item.state = ItemState::Fetching;
        entry.item.updated_at = Utc::now();
        let item = entry.item.clone();
        self.publish_transition(&state, &item);
        Ok(())
    }

    /// Appends to the item's fallback audit trail.
    pub fn record_attempt(
        &self,
        token: &ClaimToken,
        attempt: ServiceAttempt,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.owned_entry_mut(token)?;
        if entry.item.state.is_terminal() {
            return Err(QueueError::InvalidTransition {
                item_id: token.item_id.clone(),
                from: entry.item.state,
                to: entry.item.state,
            });
        }
        entry.item.attempted_services.push(attempt);
        entry.item.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the item's progress forward. Returns whether the update was applied.
    ///
    /// Ignored unless the item is `fetching`, the token is current and no
    /// cancellation is pending. Fractions are clamped to [0, 1] and values
    /// not above the current progress are rejected.
    pub fn update_progress(&self, token: &ClaimToken, fraction: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry = match state.owned_entry_mut(token) {
            Ok(entry) => entry,
            Err(_) => return false,
        };
        if entry.item.state != ItemState::Fetching || entry.cancel_requested {
            return false;
        }

        if fraction.is_nan() {
            return false;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction <= entry.item.progress_fraction {
            return false;
        }

        entry.item.progress_fraction = fraction;
        entry.item.updated_at = Utc::now();
        let item = entry.item.clone();
        self.publish_item(&item);
        true
    }

    /// Whether the owner should stop at its next checkpoint.
    ///
    /// A token that no longer matches the item counts as cancelled.
    pub fn is_cancel_requested(&self, token: &ClaimToken) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.owned_entry_mut(token) {
            Ok(entry) => entry.cancel_requested || entry.item.state.is_terminal(),
            Err(_) => true,
        }
    }

    /// Terminal success. Idempotent: on an already terminal item nothing
    /// changes and the existing state is returned. If cancellation was
    /// requested the item becomes `cancelled` and no result path is stored.
    pub fn complete(
        &self,
        token: &ClaimToken,
        result_path: PathBuf,
    ) -> Result<QueueItem, QueueError> {
        self.finish(token, ItemState::Completed, |item| {
            item.result_path = Some(result_path);
            item.progress_fraction = 1.0;
        })
    }

    /// Terminal failure, with the same idempotency and cancellation rules as `complete`.
    pub fn fail(&self, token: &ClaimToken, error_message: &str) -> Result<QueueItem, QueueError> {
        let message = error_message.to_string();
        self.finish(token, ItemState::Failed, |item| {
            item.error_message = Some(message);
        })
    }

    /// The owner has observed a cancellation and stopped working on the item.
    pub fn acknowledge_cancel(&self, token: &ClaimToken) -> Result<QueueItem, QueueError> {
        self.finish(token, ItemState::Cancelled, |_| {})
    }

    fn finish(
        &self,
        token: &ClaimToken,
        target: ItemState,
        apply: impl FnOnce(&mut QueueItem),
    ) -> Result<QueueItem, QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.owned_entry_mut(token)?;
        if entry.item.state.is_terminal() {
            return Ok(entry.item.clone());
        }
        if target == ItemState::Completed && entry.item.state != ItemState::Fetching {
            return Err(QueueError::InvalidTransition {
                item_id: token.item_id.clone(),
                from: entry.item.state,
                to: target,
            });
        }

        let target = if entry.cancel_requested {
            ItemState::Cancelled
        } else {
            target
        };
        if target != ItemState::Cancelled {
            apply(&mut entry.item);
        }
        entry.item.state = target;
        entry.item.updated_at = Utc::now();
        let item = entry.item.clone();
        state.in_flight_refs.remove(&item.source_reference);
        self.publish_transition(&state, &item);
        Ok(item)
    }

    // === Caller operations ===

    /// Cancels an item: immediately when pending, cooperatively when active.
    pub fn cancel(&self, item_id: &str) -> Result<CancelOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .get_mut(item_id)
            .ok_or_else(|| QueueError::NotFound(item_id.to_string()))?;

        match entry.item.state {
            ItemState::Pending => {
                entry.item.state = ItemState::Cancelled;
                entry.item.updated_at = Utc::now();
                let item = entry.item.clone();
                state.pending.retain(|id| id != item_id);
                state.in_flight_refs.remove(&item.source_reference);
                self.publish_transition(&state, &item);
                info!("Cancelled pending item {}", item_id);
                Ok(CancelOutcome::Cancelled)
            }
            ItemState::Resolving | ItemState::Fetching => {
                entry.cancel_requested = true;
                info!("Cancellation requested for active item {}", item_id);
                Ok(CancelOutcome::Requested)
            }
            terminal => Ok(CancelOutcome::AlreadyTerminal(terminal)),
        }
    }

    /// Cancels every pending item in one pass. Active items are untouched.
    pub fn cancel_all_pending(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<String> = state.pending.drain(..).collect();
        let now = Utc::now();
        for id in &pending {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.item.state = ItemState::Cancelled;
                entry.item.updated_at = now;
                let item = entry.item.clone();
                state.in_flight_refs.remove(&item.source_reference);
                self.publish_item(&item);
            }
        }
        if !pending.is_empty() {
            self.publish_queue_changed(&state);
            info!("Cancelled {} pending item(s)", pending.len());
        }
        pending.len()
    }

    /// Removes every completed, failed and cancelled item.
    pub fn clear_completed(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let removed = Self::remove_terminal(&mut state);
        if removed > 0 {
            self.publish_queue_changed(&state);
            info!("Cleared {} finished item(s)", removed);
        }
        removed
    }

    /// Empties the queue: pending items are cancelled and everything is removed.
    ///
    /// Fails with `Busy` and changes nothing while any item is owned by a worker.
    pub fn clear_all(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().unwrap();
        let active = state
            .entries
            .values()
            .filter(|e| e.item.state.is_active())
            .count();
        if active > 0 {
            warn!("Refusing to clear queue, {} item(s) in progress", active);
            return Err(QueueError::Busy { active });
        }

        let pending: Vec<String> = state.pending.drain(..).collect();
        let now = Utc::now();
        for id in &pending {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.item.state = ItemState::Cancelled;
                entry.item.updated_at = now;
                let item = entry.item.clone();
                self.publish_item(&item);
            }
        }
        state.in_flight_refs.clear();

        let removed = Self::remove_terminal(&mut state);
        self.publish_queue_changed(&state);
        info!("Cleared all {} item(s)", removed);
        Ok(removed)
    }

    fn remove_terminal(state: &mut QueueState) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.item.state.is_terminal());
        let entries = &state.entries;
        state.order.retain(|id| entries.contains_key(id));
        before - state.entries.len()
    }

    // === Reads ===

    /// Point-in-time copy of every item in admission order.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().unwrap();
        let items: Vec<QueueItem> = state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.item.clone())
            .collect();
        let counts = state.counts();
        QueueSnapshot { items, counts }
    }

    pub fn get(&self, item_id: &str) -> Option<QueueItem> {
        let state = self.state.lock().unwrap();
        state.entries.get(item_id).map(|e| e.item.clone())
    }

    pub fn counts(&self) -> QueueCounts {
        self.state.lock().unwrap().counts()
    }

    /// Progress of one item, or of the oldest active item when no id is given.
    pub fn progress(&self, item_id: Option<&str>) -> Result<ProgressView, QueueError> {
        let state = self.state.lock().unwrap();
        match item_id {
            Some(id) => {
                let entry = state
                    .entries
                    .get(id)
                    .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
                Ok(ProgressView {
                    is_downloading: entry.item.state.is_active(),
                    item: Some(ItemProgress::from(&entry.item)),
                })
            }
            None => {
                let active = state
                    .order
                    .iter()
                    .filter_map(|id| state.entries.get(id))
                    .find(|e| e.item.state.is_active());
                Ok(ProgressView {
                    is_downloading: active.is_some(),
                    item: active.map(|e| ItemProgress::from(&e.item)),
                })
            }
        }
    }

    // === Events ===

    fn publish_item(&self, item: &QueueItem) {
        self.broadcaster.publish(ProgressEvent::Item {
            item_id: item.id.clone(),
            state: item.state,
            progress_fraction: item.progress_fraction,
            timestamp: item.updated_at,
        });
    }

    fn publish_transition(&self, state: &QueueState, item: &QueueItem) {
        self.publish_item(item);
        metrics::set_queue_counts(&state.counts());
    }

    fn publish_queue_changed(&self, state: &QueueState) {
        let summary = state.counts();
        metrics::set_queue_counts(&summary);
        self.broadcaster.publish(ProgressEvent::QueueChanged {
            summary,
            timestamp: Utc::now(),
        });
    }
}
