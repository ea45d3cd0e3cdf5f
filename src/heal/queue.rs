// =============================================================================
// Backfill Queue — prioritised, deduplicated healing work
// =============================================================================
//
// One queue for the whole engine.  Enqueueing the same (instrument,
// resolution, window) twice while the first item is still live is a no-op;
// claiming flips Pending to Processing atomically under the queue lock so
// concurrent drains never double-fetch a window.  Finished items are kept for
// a retention window so the integrity sweep can report on recent healing.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::types::{BackfillItem, BackfillStatus, Resolution};

pub struct BackfillQueue {
    items: RwLock<Vec<BackfillItem>>,
    max_attempts: u32,
    retention: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BackfillQueue {
    pub fn new(max_attempts: u32, retention: Duration) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            max_attempts: max_attempts.max(1),
            retention,
        }
    }

    /// Add work unless an equivalent live item (pending or processing) for
    /// the same window already exists.  Returns the item id when enqueued.
    pub fn enqueue(&self, item: BackfillItem) -> Option<Uuid> {
        let mut items = self.items.write();
        let duplicate = items.iter().any(|existing| {
            matches!(
                existing.status,
                BackfillStatus::Pending | BackfillStatus::Processing
            ) && existing.instrument == item.instrument
                && existing.resolution == item.resolution
                && existing.from == item.from
                && existing.to == item.to
        });
        if duplicate {
            return None;
        }
        let id = item.id;
        debug!(
            instrument = %item.instrument,
            resolution = %item.resolution,
            from = %item.from,
            to = %item.to,
            priority = item.priority,
            "backfill item enqueued"
        );
        items.push(item);
        Some(id)
    }

    /// Claim the highest-priority pending item (oldest first within a
    /// priority), marking it Processing before the lock is released.
    pub fn claim_next(&self) -> Option<BackfillItem> {
        let mut items = self.items.write();
        let idx = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == BackfillStatus::Pending)
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at))
            })
            .map(|(idx, _)| idx)?;
        let item = &mut items[idx];
        item.status = BackfillStatus::Processing;
        item.attempts += 1;
        Some(item.clone())
    }

    pub fn complete(&self, id: Uuid, now: DateTime<Utc>) {
        let mut items = self.items.write();
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            item.status = BackfillStatus::Completed;
            item.completed_at = Some(now);
            item.last_error = None;
        }
    }

    /// Record a failed attempt.  The item returns to Pending until its
    /// attempt budget is spent, then parks as Failed.
    pub fn retry_or_fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> BackfillStatus {
        let mut items = self.items.write();
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return BackfillStatus::Failed;
        };
        item.last_error = Some(error.to_string());
        if item.attempts >= self.max_attempts {
            item.status = BackfillStatus::Failed;
            item.completed_at = Some(now);
        } else {
            item.status = BackfillStatus::Pending;
        }
        item.status
    }

    /// Return a Processing item to Pending without consuming an attempt
    /// beyond the claim.  Used when the breaker opens mid-drain.
    pub fn release(&self, id: Uuid) {
        let mut items = self.items.write();
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            if item.status == BackfillStatus::Processing {
                item.status = BackfillStatus::Pending;
                item.attempts = item.attempts.saturating_sub(1);
            }
        }
    }

    /// Drop finished items older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|i| match i.status {
            BackfillStatus::Completed | BackfillStatus::Failed => i
                .completed_at
                .map_or(true, |done| now - done < self.retention),
            _ => true,
        });
        before - items.len()
    }

    pub fn depth(&self) -> QueueDepth {
        let items = self.items.read();
        let mut depth = QueueDepth::default();
        for item in items.iter() {
            match item.status {
                BackfillStatus::Pending => depth.pending += 1,
                BackfillStatus::Processing => depth.processing += 1,
                BackfillStatus::Completed => depth.completed += 1,
                BackfillStatus::Failed => depth.failed += 1,
            }
        }
        depth
    }

    pub fn has_live_item(&self, instrument: &str, resolution: Resolution) -> bool {
        self.items.read().iter().any(|i| {
            matches!(
                i.status,
                BackfillStatus::Pending | BackfillStatus::Processing
            ) && i.instrument == instrument
                && i.resolution == resolution
        })
    }
}
