//! Priority FIFO queue for calls that would exceed a limit but whose
//! tenant's tier allows deferral.
//!
//! Ordering is priority descending, then queued-at ascending. Entries
//! age out after `queue_max_age_secs` regardless of priority: the queue
//! is a shock absorber, not a backlog.

use chrono::Utc;
use quotaguard_core::{
    CoreError, LimitExceededInfo, QueuedInfo, Result, Tenant, TierCapabilities,
};
use quotaguard_storage::QuotaStore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Queue {
    store: Arc<dyn QuotaStore>,
    max_age_secs: u64,
}

/// Outcome of one `drain_one` attempt, distinguishing why no entry was
/// admitted so a caller can tell "keep trying" from "stop here".
#[derive(Debug)]
pub enum DrainStep {
    /// Nothing pending for this tenant.
    Empty,
    /// The dequeued entry aged out; it was not admitted, but the caller
    /// should keep trying the next candidate.
    Expired,
    /// The admission predicate refused the dequeued entry; it was
    /// re-pended and the caller should stop draining.
    Refused,
    /// The entry was admitted and removed from the queue.
    Admitted(quotaguard_core::QueueEntry),
}

impl Queue {
    pub fn new(store: Arc<dyn QuotaStore>, max_age_secs: u64) -> Self {
        Self { store, max_age_secs }
    }

    /// Admits `payload` to the queue for `tenant` if its tier allows
    /// queueing and the tenant's queue has spare capacity.
    ///
    /// Returns the assigned queue id and a `QueuedInfo` describing its
    /// position, wrapped as the `CoreError::Queued` variant so callers
    /// that treat queueing as an exception keep a single control-flow
    /// branch, per the pipeline's fail-closed admission contract.
    pub fn enqueue(
        &self,
        tenant: &Tenant,
        caps: TierCapabilities,
        provider: &str,
        model: &str,
        payload: &str,
        priority: i32,
        limit_info: &LimitExceededInfo,
    ) -> Result<CoreError> {
        if !caps.may_queue {
            warn!(tenant_id = %tenant.tenant_id, "queueing disabled for tier");
            return Ok(CoreError::QueueDisabled);
        }

        let pending = self.store.pending_count(&tenant.tenant_id)?;
        if pending >= caps.max_queue_size {
            warn!(tenant_id = %tenant.tenant_id, pending, max = caps.max_queue_size, "queue at capacity");
            return Ok(CoreError::QueueFull);
        }

        let id = Uuid::new_v4().to_string();
        let entry = quotaguard_core::QueueEntry {
            id: id.clone(),
            tenant_id: tenant.tenant_id.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            payload: payload.to_string(),
            priority,
            retry_count: 0,
            max_retries: quotaguard_core::DEFAULT_MAX_RETRIES,
            status: quotaguard_core::QueueStatus::Pending,
            queued_at: Utc::now(),
            processed_at: None,
            error: None,
        };
        self.store.enqueue(&entry)?;

        let position = self.store.queue_position(&id)?.unwrap_or(0);
        debug!(tenant_id = %tenant.tenant_id, queue_id = %id, position, "enqueued");

        Ok(CoreError::Queued(QueuedInfo {
            queue_id: id,
            horizon: limit_info.horizon,
            current: limit_info.current,
            limit: limit_info.limit,
            percent_used: limit_info.percent_used,
        }))
    }

    /// Pulls the next admissible entry for `tenant_id`, if any, expiring
    /// anything older than `max_age_secs` along the way. `admit` decides
    /// whether the dequeued entry may proceed; if it refuses, the entry
    /// is re-pended without incrementing its retry count.
    pub fn drain_one<F>(&self, tenant_id: &str, admit: F) -> Result<DrainStep>
    where
        F: FnOnce(&quotaguard_core::QueueEntry) -> bool,
    {
        let Some(entry) = self.store.dequeue_one(tenant_id)? else {
            return Ok(DrainStep::Empty);
        };

        let age = (Utc::now() - entry.queued_at).num_seconds().max(0) as u64;
        if age > self.max_age_secs {
            info!(tenant_id, queue_id = %entry.id, age, "queue entry expired");
            self.store.complete_queued(&entry.id, false, Some("expired"))?;
            return Ok(DrainStep::Expired);
        }

        if admit(&entry) {
            debug!(tenant_id, queue_id = %entry.id, "queue entry admitted");
            Ok(DrainStep::Admitted(entry))
        } else {
            self.store.repend(&entry.id)?;
            Ok(DrainStep::Refused)
        }
    }

    /// Drains up to `bound` entries, calling `admit` for each dequeued
    /// candidate. Per §4.5 step 4, an expired entry is skipped and the
    /// next candidate is tried, but the first refusal stops the drain
    /// outright rather than cycling through the rest of the queue.
    pub fn drain_bounded<F>(
        &self,
        tenant_id: &str,
        bound: usize,
        mut admit: F,
    ) -> Result<Vec<quotaguard_core::QueueEntry>>
    where
        F: FnMut(&quotaguard_core::QueueEntry) -> bool,
    {
        let mut drained = Vec::new();
        for _ in 0..bound {
            match self.drain_one(tenant_id, |e| admit(e))? {
                DrainStep::Admitted(entry) => drained.push(entry),
                DrainStep::Expired => continue,
                DrainStep::Refused | DrainStep::Empty => break,
            }
        }
        Ok(drained)
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        self.store.cancel_queue_entry(id)
    }

    pub fn update_priority(&self, id: &str, priority: i32) -> Result<()> {
        self.store.update_queue_priority(id, priority)
    }

    pub fn position(&self, id: &str) -> Result<Option<usize>> {
        self.store.queue_position(id)
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.store.complete_queued(id, false, Some(error))
    }

    pub fn mark_completed(&self, id: &str) -> Result<()> {
        self.store.complete_queued(id, true, None)
    }

    pub fn entries(&self, tenant_id: &str, limit: usize) -> Result<Vec<quotaguard_core::QueueEntry>> {
        self.store.queue_entries(tenant_id, limit)
    }

    pub fn pending_count(&self, tenant_id: &str) -> Result<i64> {
        self.store.pending_count(tenant_id)
    }
}
