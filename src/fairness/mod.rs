//! Per-user concurrency accounting. A slot is one in-flight job for a user;
//! ceilings come from the plan tier. Counters are process-local and advisory
//! across replicas.

pub mod middleware;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    ProPlus,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free: u32,
    pub pro: u32,
    pub pro_plus: u32,
    pub enterprise: u32,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: 1,
            pro: 3,
            pro_plus: 4,
            enterprise: 5,
        }
    }
}

impl TierLimits {
    pub fn limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::ProPlus => self.pro_plus,
            Tier::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug)]
struct UserSlot {
    tier: Tier,
    count: u32,
    jobs: HashSet<Uuid>,
}

/// In-memory slot counter keyed by user id. An empty user id means the job is
/// system-originated and bypasses accounting entirely.
#[derive(Debug, Clone)]
pub struct FairnessLimiter {
    limits: TierLimits,
    slots: Arc<Mutex<HashMap<String, UserSlot>>>,
}

impl FairnessLimiter {
    pub fn new(limits: TierLimits) -> Self {
        Self {
            limits,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomically takes a slot for `(user_id, tier)` if the user is below the
    /// tier ceiling. The returned guard releases the slot on drop, so no exit
    /// path (including panic unwind) can leak it.
    pub fn try_acquire(&self, user_id: &str, tier: Tier, job_id: Uuid) -> Option<SlotGuard> {
        if user_id.is_empty() {
            return Some(SlotGuard::system());
        }

        let mut slots = self.slots.lock();
        let slot = slots.entry(user_id.to_owned()).or_insert_with(|| UserSlot {
            tier,
            count: 0,
            jobs: HashSet::new(),
        });
        slot.tier = tier;

        if slot.jobs.contains(&job_id) {
            // Re-dispatch of a job we already track; don't double count.
            return Some(SlotGuard::tracked(self.clone(), user_id, job_id));
        }
        if slot.count >= self.limits.limit(tier) {
            if slot.count == 0 {
                slots.remove(user_id);
            }
            return None;
        }

        slot.count += 1;
        slot.jobs.insert(job_id);
        Some(SlotGuard::tracked(self.clone(), user_id, job_id))
    }

    /// Idempotent within a job lifetime: only the first release for a tracked
    /// `job_id` decrements.
    pub fn release(&self, user_id: &str, job_id: Uuid) {
        if user_id.is_empty() {
            return;
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(user_id) {
            if slot.jobs.remove(&job_id) {
                slot.count = slot.count.saturating_sub(1);
            }
            if slot.count == 0 {
                slots.remove(user_id);
            }
        }
    }

    pub fn active_count(&self, user_id: &str) -> u32 {
        self.slots
            .lock()
            .get(user_id)
            .map(|slot| slot.count)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.slots.lock().len()
    }
}

/// RAII slot token. System jobs get an untracked guard whose drop is a no-op.
#[derive(Debug)]
pub struct SlotGuard {
    tracked: Option<(FairnessLimiter, String, Uuid)>,
}

impl SlotGuard {
    fn system() -> Self {
        Self { tracked: None }
    }

    fn tracked(limiter: FairnessLimiter, user_id: &str, job_id: Uuid) -> Self {
        Self {
            tracked: Some((limiter, user_id.to_owned(), job_id)),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some((limiter, user_id, job_id)) = self.tracked.take() {
            limiter.release(&user_id, job_id);
        }
    }
}
