//! The resource ledger.
//!
//! Every step runs under a reservation. [`ResourceManager::reserve_budget`]
//! approves or rejects a step against what is available, debiting the
//! user's tracked balance up front; [`ResourceManager::track_usage`] merges
//! usage as it is reported; [`ResourceManager::finalize_usage`] closes the
//! reservation and settles the global pool. Allocations outlive their
//! finalization by a retention window so they can still be inspected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strata_types::{
    AvailableResources, ResourceConstraints, ResourceUsage, ReservationId, SharedEventBus,
};

use crate::error::{ResourceError, Result};

/// Usage ratio an allocation is steered towards.
const TARGET_USAGE_RATIO: f64 = 0.8;

/// Rate limiter key that finalized API calls are counted against.
pub const API_CALLS_RESOURCE: &str = "api_calls";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// A sliding-window limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub limit: u64,
    pub window: Duration,
}

/// Resource manager configuration.
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub global_credits: f64,
    /// How long a finalized allocation is kept before deletion.
    pub retention: Duration,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub child_allocation_ratio: f64,
    pub rate_limits: HashMap<String, RateLimit>,
    /// Tracked credit balances. Users not listed are not gated.
    pub user_credits: HashMap<String, f64>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            global_credits: 10_000.0,
            retention: Duration::from_secs(60),
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            child_allocation_ratio: 0.3,
            rate_limits: HashMap::new(),
            user_credits: HashMap::new(),
        }
    }
}

impl ResourceManagerConfig {
    pub fn with_global_credits(mut self, credits: f64) -> Self {
        self.global_credits = credits;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_user_credits(mut self, user_id: impl Into<String>, credits: f64) -> Self {
        self.user_credits.insert(user_id.into(), credits);
        self
    }

    pub fn with_rate_limit(mut self, resource_type: impl Into<String>, limit: RateLimit) -> Self {
        self.rate_limits.insert(resource_type.into(), limit);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Allocation records
// ─────────────────────────────────────────────────────────────────────────────

/// Status of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Completed,
    Exceeded,
}

/// One reservation for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub reservation_id: ReservationId,
    pub step_id: String,
    pub user_id: Option<String>,
    pub swarm_id: Option<String>,
    /// Snapshot of what was available when reserving.
    pub allocated: AvailableResources,
    /// Estimated usage.
    pub reserved: ResourceUsage,
    /// Actual usage so far.
    pub used: ResourceUsage,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: AllocationStatus,
    pub warnings: Vec<String>,
    /// Efficiency score, set on finalization.
    pub efficiency: Option<f64>,
}

impl ResourceAllocation {
    /// Whether the allocation has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Outcome of a reservation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReservation {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub reserved: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BudgetReservation {
    fn approved(reservation_id: ReservationId, reserved: ResourceUsage) -> Self {
        Self {
            approved: true,
            reservation_id: Some(reservation_id),
            reserved,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            approved: false,
            reservation_id: None,
            reserved: ResourceUsage::default(),
            reason: Some(reason),
        }
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ledger metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub reservations_approved: u64,
    pub reservations_rejected: u64,
    pub reservations_released: u64,
    pub active_allocations: usize,
    pub total_credits_used: f64,
    pub average_efficiency: f64,
    pub global_credits_remaining: f64,
}

#[derive(Debug, Default)]
struct Counters {
    approved: u64,
    rejected: u64,
    released: u64,
    finalized: u64,
    credits_used: f64,
    efficiency_sum: f64,
}

#[derive(Debug)]
struct Window {
    count: u64,
    reset_at: Instant,
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceManager
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks and enforces computational budgets per step.
pub struct ResourceManager {
    config: ResourceManagerConfig,
    allocations: Arc<RwLock<HashMap<ReservationId, ResourceAllocation>>>,
    user_credits: Mutex<HashMap<String, f64>>,
    global_credits: Mutex<f64>,
    windows: Mutex<HashMap<String, Window>>,
    counters: Mutex<Counters>,
    events: SharedEventBus,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig, events: SharedEventBus) -> Self {
        Self {
            user_credits: Mutex::new(config.user_credits.clone()),
            global_credits: Mutex::new(config.global_credits),
            allocations: Arc::new(RwLock::new(HashMap::new())),
            windows: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// Reserve a budget for a step.
    ///
    /// Approves only if the available credits cover `max_cost`, the time
    /// limit covers `max_time` (when both are given), every model required
    /// by the allowed strategies is available, and a tracked user has
    /// enough credits. Rejections are values, never errors.
    pub async fn reserve_budget(
        &self,
        step_id: &str,
        available: &AvailableResources,
        constraints: &ResourceConstraints,
        user_id: Option<&str>,
        swarm_id: Option<&str>,
    ) -> BudgetReservation {
        if let Some(reason) = Self::check_constraints(available, constraints) {
            return self.reject(step_id, reason);
        }

        let reserved = ResourceUsage {
            cost: constraints.max_cost.unwrap_or(0.0),
            tokens: constraints.max_tokens.unwrap_or(0),
            compute_time_ms: constraints
                .max_time_ms
                .or(available.time_limit_ms)
                .unwrap_or(0),
            ..Default::default()
        };

        // Check and debit under one lock so concurrent reservations of the
        // same user cannot both pass on the same balance.
        if let Some(user) = user_id {
            let mut balances = self.user_credits.lock();
            if let Some(balance) = balances.get_mut(user) {
                if *balance < reserved.cost {
                    let reason = format!(
                        "Insufficient user credits: required {}, available {}",
                        reserved.cost, balance
                    );
                    drop(balances);
                    return self.reject(step_id, reason);
                }
                *balance -= reserved.cost;
            }
        }

        let reservation_id = ReservationId::new();
        let allocation = ResourceAllocation {
            reservation_id,
            step_id: step_id.to_string(),
            user_id: user_id.map(str::to_string),
            swarm_id: swarm_id.map(str::to_string),
            allocated: available.clone(),
            reserved,
            used: ResourceUsage::default(),
            start_time: Utc::now(),
            end_time: None,
            status: AllocationStatus::Active,
            warnings: Vec::new(),
            efficiency: None,
        };
        self.allocations.write().insert(reservation_id, allocation);
        self.counters.lock().approved += 1;

        tracing::debug!(%reservation_id, step_id, cost = reserved.cost, "Budget reserved");
        self.publish(
            "resource.reserved",
            json!({
                "reservation_id": reservation_id,
                "step_id": step_id,
                "user_id": user_id,
                "swarm_id": swarm_id,
                "reserved": reserved,
            }),
        )
        .await;

        BudgetReservation::approved(reservation_id, reserved)
    }

    fn check_constraints(
        available: &AvailableResources,
        constraints: &ResourceConstraints,
    ) -> Option<String> {
        if let Some(max_cost) = constraints.max_cost
            && available.credits < max_cost
        {
            return Some(format!(
                "Insufficient credits: required {}, available {}",
                max_cost, available.credits
            ));
        }

        if let (Some(max_time), Some(time_limit)) = (constraints.max_time_ms, available.time_limit_ms)
            && time_limit < max_time
        {
            return Some(format!(
                "Insufficient time: required {max_time}ms, available {time_limit}ms"
            ));
        }

        constraints
            .required_models()
            .into_iter()
            .find(|model| !available.model_available(model))
            .map(|model| format!("Required model unavailable: {model}"))
    }

    fn reject(&self, step_id: &str, reason: String) -> BudgetReservation {
        self.counters.lock().rejected += 1;
        tracing::info!(step_id, reason = %reason, "Budget reservation rejected");
        BudgetReservation::rejected(reason)
    }

    /// Merge incremental usage into the newest active allocation of
    /// `step_id`.
    ///
    /// Step ids are only unique within one execution; callers that hold the
    /// reservation id should use [`track_reservation_usage`](Self::track_reservation_usage).
    /// Returns the resulting usage ratio, or `None` (after logging a
    /// warning) if no allocation is tracked for the step.
    pub async fn track_usage(&self, step_id: &str, usage: &ResourceUsage) -> Option<f64> {
        let reservation_id = self
            .allocations
            .read()
            .values()
            .filter(|a| a.step_id == step_id && !a.is_finalized())
            .max_by_key(|a| a.start_time)
            .map(|a| a.reservation_id);
        let Some(reservation_id) = reservation_id else {
            tracing::warn!(step_id, "Usage reported for unknown step");
            return None;
        };
        self.track_reservation_usage(reservation_id, usage).await
    }

    /// Merge incremental usage into one reservation's allocation.
    ///
    /// Returns the resulting usage ratio, or `None` (after logging a
    /// warning) if the reservation is unknown or already finalized.
    pub async fn track_reservation_usage(
        &self,
        reservation_id: ReservationId,
        usage: &ResourceUsage,
    ) -> Option<f64> {
        let mut pending = Vec::new();
        let (step_id, ratio) = {
            let mut allocations = self.allocations.write();
            let Some(allocation) = allocations
                .get_mut(&reservation_id)
                .filter(|a| !a.is_finalized())
            else {
                tracing::warn!(%reservation_id, "Usage reported for unknown reservation");
                return None;
            };
            let step_id = allocation.step_id.clone();

            allocation.used.merge(usage);
            let ratio = usage_ratio(&allocation.used, &allocation.reserved);
            let payload = json!({
                "reservation_id": allocation.reservation_id,
                "step_id": step_id,
                "ratio": ratio,
                "used": allocation.used,
            });

            if ratio >= self.config.critical_threshold {
                if allocation.status != AllocationStatus::Exceeded {
                    allocation.status = AllocationStatus::Exceeded;
                    allocation
                        .warnings
                        .push(format!("usage at {:.0}% of reservation", ratio * 100.0));
                    pending.push(("resource.critical", payload));
                }
            } else if ratio >= self.config.warning_threshold
                && allocation.status == AllocationStatus::Active
                && allocation.warnings.is_empty()
            {
                allocation
                    .warnings
                    .push(format!("usage at {:.0}% of reservation", ratio * 100.0));
                pending.push(("resource.warning", payload));
            }
            (step_id, ratio)
        };

        for (topic, payload) in pending {
            tracing::warn!(%reservation_id, step_id = %step_id, ratio, topic, "Resource usage threshold crossed");
            self.publish(topic, payload).await;
        }
        Some(ratio)
    }

    /// Close a reservation with its actual usage.
    ///
    /// `actual` replaces the tracked usage as the authoritative total. The
    /// global pool is debited, the user's preemptive debit is reconciled
    /// against the actual cost, and the allocation is scheduled for
    /// deletion after the retention window.
    pub async fn finalize_usage(
        &self,
        reservation_id: ReservationId,
        actual: ResourceUsage,
    ) -> Result<ResourceUsage> {
        let (step_id, user_id, reserved, efficiency, duration_ms) = {
            let mut allocations = self.allocations.write();
            let allocation = allocations
                .get_mut(&reservation_id)
                .ok_or(ResourceError::ReservationNotFound(reservation_id))?;
            if allocation.is_finalized() {
                return Err(ResourceError::AlreadyFinalized(reservation_id));
            }

            let end = Utc::now();
            let duration_ms = (end - allocation.start_time).num_milliseconds().max(0) as u64;
            let efficiency = calculate_efficiency(&allocation.reserved, &actual, duration_ms);
            allocation.used = actual;
            allocation.end_time = Some(end);
            allocation.efficiency = Some(efficiency);
            if allocation.status == AllocationStatus::Active {
                allocation.status = AllocationStatus::Completed;
            }
            (
                allocation.step_id.clone(),
                allocation.user_id.clone(),
                allocation.reserved,
                efficiency,
                duration_ms,
            )
        };

        *self.global_credits.lock() -= actual.cost;
        if let Some(ref user) = user_id
            && let Some(balance) = self.user_credits.lock().get_mut(user)
        {
            *balance += reserved.cost - actual.cost;
        }
        if actual.api_calls > 0 {
            self.consume_window(API_CALLS_RESOURCE, actual.api_calls);
        }
        {
            let mut counters = self.counters.lock();
            counters.finalized += 1;
            counters.credits_used += actual.cost;
            counters.efficiency_sum += efficiency;
        }

        tracing::debug!(%reservation_id, step_id = %step_id, efficiency, "Usage finalized");
        self.publish(
            "resource.completed",
            json!({
                "reservation_id": reservation_id,
                "step_id": step_id,
                "usage": actual,
                "efficiency": efficiency,
                "duration_ms": duration_ms,
            }),
        )
        .await;

        self.schedule_removal(reservation_id);
        Ok(actual)
    }

    fn schedule_removal(&self, reservation_id: ReservationId) {
        let allocations = Arc::clone(&self.allocations);
        let retention = self.config.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            allocations.write().remove(&reservation_id);
        });
    }

    /// Abandon a reservation.
    ///
    /// Unused reserved credits are refunded to the user and the allocation
    /// is deleted immediately.
    pub async fn release_reservation(&self, reservation_id: ReservationId) -> Result<()> {
        let allocation = {
            let mut allocations = self.allocations.write();
            match allocations.get(&reservation_id) {
                None => return Err(ResourceError::ReservationNotFound(reservation_id)),
                Some(a) if a.is_finalized() => {
                    return Err(ResourceError::AlreadyFinalized(reservation_id));
                }
                Some(_) => {}
            }
            allocations.remove(&reservation_id)
        };
        let Some(mut allocation) = allocation else {
            return Err(ResourceError::ReservationNotFound(reservation_id));
        };

        allocation.status = AllocationStatus::Exceeded;
        allocation.end_time = Some(Utc::now());
        let refund = (allocation.reserved.cost - allocation.used.cost).max(0.0);
        if let Some(ref user) = allocation.user_id
            && let Some(balance) = self.user_credits.lock().get_mut(user)
        {
            *balance += refund;
        }
        self.counters.lock().released += 1;
        tracing::debug!(%reservation_id, refund, "Reservation released");
        Ok(())
    }

    /// Lightweight gate against global credits and the resource type's
    /// rate limit. An allowed check counts against the limit.
    pub async fn check_quota(&self, resource_type: &str, estimated_cost: f64) -> QuotaCheck {
        let global = *self.global_credits.lock();
        if global < estimated_cost {
            return QuotaCheck {
                allowed: false,
                reason: Some(format!(
                    "Insufficient global credits: required {estimated_cost}, available {global}"
                )),
            };
        }

        let Some(limit) = self.config.rate_limits.get(resource_type) else {
            return QuotaCheck {
                allowed: true,
                reason: None,
            };
        };

        let mut windows = self.windows.lock();
        let window = current_window(&mut windows, resource_type, limit);
        if window.count >= limit.limit {
            return QuotaCheck {
                allowed: false,
                reason: Some(format!(
                    "Rate limit for '{}' reached: {} per {}s",
                    resource_type,
                    limit.limit,
                    limit.window.as_secs()
                )),
            };
        }
        window.count += 1;
        QuotaCheck {
            allowed: true,
            reason: None,
        }
    }

    fn consume_window(&self, resource_type: &str, amount: u64) {
        let Some(limit) = self.config.rate_limits.get(resource_type) else {
            return;
        };
        let mut windows = self.windows.lock();
        current_window(&mut windows, resource_type, limit).count += amount;
    }

    /// Derive a reduced budget for spawned child work.
    ///
    /// Credits and time are scaled by `ratio` (default from config); model,
    /// tool and API availability is kept unchanged.
    pub fn configure_child_allocation(
        &self,
        parent: &AvailableResources,
        ratio: Option<f64>,
    ) -> AvailableResources {
        let ratio = ratio
            .unwrap_or(self.config.child_allocation_ratio)
            .clamp(0.0, 1.0);
        AvailableResources {
            credits: parent.credits * ratio,
            time_limit_ms: parent
                .time_limit_ms
                .map(|t| (t as f64 * ratio).floor() as u64),
            ..parent.clone()
        }
    }

    /// A copy of an allocation.
    pub fn allocation(&self, reservation_id: ReservationId) -> Option<ResourceAllocation> {
        self.allocations.read().get(&reservation_id).cloned()
    }

    /// Tracked credit balance of a user.
    pub fn user_credits(&self, user_id: &str) -> Option<f64> {
        self.user_credits.lock().get(user_id).copied()
    }

    /// Remaining global credits.
    pub fn global_credits(&self) -> f64 {
        *self.global_credits.lock()
    }

    pub fn metrics(&self) -> ResourceMetrics {
        let active_allocations = self
            .allocations
            .read()
            .values()
            .filter(|a| !a.is_finalized())
            .count();
        let counters = self.counters.lock();
        ResourceMetrics {
            reservations_approved: counters.approved,
            reservations_rejected: counters.rejected,
            reservations_released: counters.released,
            active_allocations,
            total_credits_used: counters.credits_used,
            average_efficiency: if counters.finalized > 0 {
                counters.efficiency_sum / counters.finalized as f64
            } else {
                0.0
            },
            global_credits_remaining: self.global_credits(),
        }
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if let Err(e) = self.events.publish(topic, payload).await {
            tracing::warn!(topic, error = %e, "Failed to publish resource event");
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("allocations", &self.allocations.read().len())
            .field("global_credits", &self.global_credits())
            .finish()
    }
}

/// The window for `resource_type`, reset if it has expired.
fn current_window<'a>(
    windows: &'a mut HashMap<String, Window>,
    resource_type: &str,
    limit: &RateLimit,
) -> &'a mut Window {
    let now = Instant::now();
    let window = windows
        .entry(resource_type.to_string())
        .or_insert_with(|| Window {
            count: 0,
            reset_at: now + limit.window,
        });
    if now > window.reset_at {
        window.count = 0;
        window.reset_at = now + limit.window;
    }
    window
}

// ─────────────────────────────────────────────────────────────────────────────
// Ratios
// ─────────────────────────────────────────────────────────────────────────────

/// Largest of used/reserved over cost, tokens and compute time. Dimensions
/// with nothing reserved are ignored.
pub fn usage_ratio(used: &ResourceUsage, reserved: &ResourceUsage) -> f64 {
    let pairs = [
        (used.cost, reserved.cost),
        (used.tokens as f64, reserved.tokens as f64),
        (used.compute_time_ms as f64, reserved.compute_time_ms as f64),
    ];
    pairs
        .iter()
        .filter(|(_, reserved)| *reserved > 0.0)
        .map(|(used, reserved)| used / reserved)
        .fold(0.0, f64::max)
}

/// Efficiency of a finished allocation in [0, 1].
///
/// `clamp(1 - |usage_ratio - 0.8|, 0, 1)` multiplied by
/// `actual_duration / reserved_compute_time` (1 when no compute time was
/// reserved), clamped to [0, 1].
pub fn calculate_efficiency(reserved: &ResourceUsage, actual: &ResourceUsage, duration_ms: u64) -> f64 {
    let ratio = usage_ratio(actual, reserved);
    let usage_score = (1.0 - (ratio - TARGET_USAGE_RATIO).abs()).clamp(0.0, 1.0);
    let time_factor = if reserved.compute_time_ms > 0 {
        duration_ms as f64 / reserved.compute_time_ms as f64
    } else {
        1.0
    };
    (usage_score * time_factor).clamp(0.0, 1.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::InMemoryEventBus;

    fn manager_with(config: ResourceManagerConfig) -> (ResourceManager, Arc<InMemoryEventBus>) {
        let bus = InMemoryEventBus::shared();
        (ResourceManager::new(config, bus.clone()), bus)
    }

    fn manager() -> (ResourceManager, Arc<InMemoryEventBus>) {
        manager_with(ResourceManagerConfig::default())
    }

    fn cost(cost: f64) -> ResourceConstraints {
        ResourceConstraints::default().with_max_cost(cost)
    }

    #[tokio::test]
    async fn test_reject_insufficient_credits_names_both_numbers() {
        let (rm, bus) = manager();
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(50.0), &cost(100.0), None, None)
            .await;
        assert!(!res.approved);
        let reason = res.reason.unwrap();
        assert!(reason.contains("100"), "{reason}");
        assert!(reason.contains("50"), "{reason}");
        assert_eq!(rm.metrics().reservations_rejected, 1);
        assert_eq!(bus.count("resource.*"), 0);
    }

    #[tokio::test]
    async fn test_reject_insufficient_time() {
        let (rm, _) = manager();
        let available = AvailableResources::with_credits(100.0).with_time_limit(1_000);
        let constraints = ResourceConstraints::default().with_max_time(5_000);
        let res = rm.reserve_budget("s", &available, &constraints, None, None).await;
        assert!(!res.approved);
        assert!(res.reason.unwrap().contains("time"));
    }

    #[tokio::test]
    async fn test_reject_unavailable_model() {
        let (rm, _) = manager();
        let available = AvailableResources::with_credits(100.0)
            .with_model("small", true)
            .with_model("large", false);
        let constraints = ResourceConstraints::default().with_strategy("deep", &["large"]);
        let res = rm.reserve_budget("s", &available, &constraints, None, None).await;
        assert!(!res.approved);
        assert!(res.reason.unwrap().contains("large"));

        let constraints = ResourceConstraints::default().with_strategy("fast", &["small"]);
        assert!(rm.reserve_budget("s", &available, &constraints, None, None).await.approved);
    }

    #[tokio::test]
    async fn test_reject_insufficient_user_credits() {
        let (rm, _) = manager_with(ResourceManagerConfig::default().with_user_credits("alice", 10.0));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(20.0), Some("alice"), None)
            .await;
        assert!(!res.approved);
        assert_eq!(rm.user_credits("alice"), Some(10.0));
    }

    #[tokio::test]
    async fn test_approval_debits_user_and_emits_event() {
        let (rm, bus) = manager_with(ResourceManagerConfig::default().with_user_credits("alice", 100.0));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(30.0), Some("alice"), None)
            .await;
        assert!(res.approved);
        assert_eq!(rm.user_credits("alice"), Some(70.0));
        assert_eq!(bus.count("resource.reserved"), 1);
        let allocation = rm.allocation(res.reservation_id.unwrap()).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Active);
        assert_eq!(allocation.reserved.cost, 30.0);
    }

    #[tokio::test]
    async fn test_untracked_user_is_not_gated() {
        let (rm, _) = manager();
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(30.0), Some("bob"), None)
            .await;
        assert!(res.approved);
        assert_eq!(rm.user_credits("bob"), None);
    }

    #[tokio::test]
    async fn test_critical_usage_marks_exceeded_once() {
        let (rm, bus) = manager();
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(100.0), None, None)
            .await;

        let ratio = rm
            .track_usage("s", &ResourceUsage { cost: 96.0, ..Default::default() })
            .await
            .unwrap();
        assert!((ratio - 0.96).abs() < 1e-9);

        let allocation = rm.allocation(res.reservation_id.unwrap()).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Exceeded);
        let critical = bus.recent("resource.critical");
        assert_eq!(critical.len(), 1);
        assert!((critical[0].payload["ratio"].as_f64().unwrap() - 0.96).abs() < 1e-9);

        rm.track_usage("s", &ResourceUsage { cost: 1.0, ..Default::default() })
            .await;
        assert_eq!(bus.count("resource.critical"), 1);
    }

    #[tokio::test]
    async fn test_warning_usage_keeps_status() {
        let (rm, bus) = manager();
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(100.0), None, None)
            .await;
        rm.track_usage("s", &ResourceUsage { cost: 85.0, ..Default::default() })
            .await;
        let allocation = rm.allocation(res.reservation_id.unwrap()).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Active);
        assert_eq!(bus.count("resource.warning"), 1);
        assert_eq!(bus.count("resource.critical"), 0);
    }

    #[tokio::test]
    async fn test_track_by_reservation_ignores_newer_same_step() {
        let (rm, bus) = manager();
        let older = rm
            .reserve_budget("Task", &AvailableResources::with_credits(100.0), &cost(10.0), None, None)
            .await
            .reservation_id
            .unwrap();
        let newer = rm
            .reserve_budget("Task", &AvailableResources::with_credits(100.0), &cost(100.0), None, None)
            .await
            .reservation_id
            .unwrap();

        let ratio = rm
            .track_reservation_usage(older, &ResourceUsage { cost: 9.9, ..Default::default() })
            .await
            .unwrap();
        assert!((ratio - 0.99).abs() < 1e-9);
        assert_eq!(rm.allocation(older).unwrap().status, AllocationStatus::Exceeded);
        assert_eq!(rm.allocation(newer).unwrap().used.cost, 0.0);
        assert_eq!(bus.count("resource.critical"), 1);

        rm.finalize_usage(older, ResourceUsage::default()).await.unwrap();
        assert!(rm
            .track_reservation_usage(older, &ResourceUsage::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_track_unknown_step_is_noop() {
        let (rm, bus) = manager();
        assert!(rm.track_usage("ghost", &ResourceUsage::default()).await.is_none());
        assert_eq!(bus.count("*"), 0);
    }

    #[tokio::test]
    async fn test_finalize_deducts_once() {
        let (rm, bus) = manager_with(ResourceManagerConfig::default().with_global_credits(1000.0));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(50.0), None, None)
            .await;
        let id = res.reservation_id.unwrap();
        let usage = ResourceUsage { cost: 40.0, ..Default::default() };

        rm.finalize_usage(id, usage).await.unwrap();
        assert_eq!(rm.global_credits(), 960.0);
        assert!(matches!(
            rm.finalize_usage(id, usage).await,
            Err(ResourceError::AlreadyFinalized(_))
        ));
        assert_eq!(rm.global_credits(), 960.0);
        assert_eq!(bus.count("resource.completed"), 1);

        let allocation = rm.allocation(id).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Completed);
        assert!(allocation.efficiency.is_some());
    }

    #[tokio::test]
    async fn test_finalize_reconciles_user_debit() {
        let (rm, _) = manager_with(ResourceManagerConfig::default().with_user_credits("alice", 100.0));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(50.0), Some("alice"), None)
            .await;
        rm.finalize_usage(res.reservation_id.unwrap(), ResourceUsage { cost: 20.0, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rm.user_credits("alice"), Some(80.0));
    }

    #[tokio::test]
    async fn test_finalized_allocation_removed_after_retention() {
        let (rm, _) =
            manager_with(ResourceManagerConfig::default().with_retention(Duration::from_millis(30)));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(10.0), &cost(1.0), None, None)
            .await;
        let id = res.reservation_id.unwrap();
        rm.finalize_usage(id, ResourceUsage::default()).await.unwrap();
        assert!(rm.allocation(id).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rm.allocation(id).is_none());
    }

    #[tokio::test]
    async fn test_release_refunds_and_deletes() {
        let (rm, _) = manager_with(ResourceManagerConfig::default().with_user_credits("alice", 100.0));
        let res = rm
            .reserve_budget("s", &AvailableResources::with_credits(100.0), &cost(30.0), Some("alice"), None)
            .await;
        let id = res.reservation_id.unwrap();
        rm.release_reservation(id).await.unwrap();
        assert_eq!(rm.user_credits("alice"), Some(100.0));
        assert!(rm.allocation(id).is_none());
        assert!(matches!(
            rm.release_reservation(id).await,
            Err(ResourceError::ReservationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_check_quota_rate_limit_window() {
        let config = ResourceManagerConfig::default().with_rate_limit(
            "steps",
            RateLimit {
                limit: 2,
                window: Duration::from_millis(50),
            },
        );
        let (rm, _) = manager_with(config);
        assert!(rm.check_quota("steps", 1.0).await.allowed);
        assert!(rm.check_quota("steps", 1.0).await.allowed);
        let denied = rm.check_quota("steps", 1.0).await;
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("steps"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rm.check_quota("steps", 1.0).await.allowed);
        assert!(rm.check_quota("unlimited", 1.0).await.allowed);
    }

    #[tokio::test]
    async fn test_check_quota_global_credits() {
        let (rm, _) = manager_with(ResourceManagerConfig::default().with_global_credits(5.0));
        assert!(!rm.check_quota("steps", 10.0).await.allowed);
        assert!(rm.check_quota("steps", 5.0).await.allowed);
    }

    #[test]
    fn test_child_allocation_scales_budget() {
        let (rm, _) = manager();
        let parent = AvailableResources::with_credits(100.0)
            .with_time_limit(10_000)
            .with_model("small", true);
        let child = rm.configure_child_allocation(&parent, None);
        assert!((child.credits - 30.0).abs() < 1e-9);
        assert_eq!(child.time_limit_ms, Some(3_000));
        assert_eq!(child.models, parent.models);

        let half = rm.configure_child_allocation(&parent, Some(0.5));
        assert_eq!(half.credits, 50.0);
    }

    #[test]
    fn test_efficiency_formula() {
        let reserved = ResourceUsage {
            cost: 100.0,
            compute_time_ms: 1000,
            ..Default::default()
        };
        let actual = ResourceUsage {
            cost: 80.0,
            ..Default::default()
        };
        assert!((calculate_efficiency(&reserved, &actual, 1000) - 1.0).abs() < 1e-9);
        assert!((calculate_efficiency(&reserved, &actual, 500) - 0.5).abs() < 1e-9);

        let over = ResourceUsage {
            cost: 150.0,
            ..Default::default()
        };
        assert!((calculate_efficiency(&reserved, &over, 1000) - 0.3).abs() < 1e-9);

        let no_time = ResourceUsage {
            cost: 100.0,
            ..Default::default()
        };
        assert!((calculate_efficiency(&no_time, &actual, 12_345) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_usage_ratio_ignores_unreserved_dimensions() {
        let reserved = ResourceUsage {
            tokens: 100,
            ..Default::default()
        };
        let used = ResourceUsage {
            cost: 1_000.0,
            tokens: 50,
            ..Default::default()
        };
        assert_eq!(usage_ratio(&used, &reserved), 0.5);
        assert_eq!(usage_ratio(&used, &ResourceUsage::default()), 0.0);
    }
}
