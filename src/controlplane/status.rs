//! Status State Machine
//!
//! The custom resource reports its state through three conditions:
//!
//! | State         | Available | Progressing | Degraded |
//! |---------------|-----------|-------------|----------|
//! | Deploying     | False     | True        | False    |
//! | Upgrading     | True      | True        | True     |
//! | Healthy       | True      | False       | False    |
//! | Failed        | False     | False       | True     |
//! | FailedHealing | False     | True        | True     |
//!
//! The observed version only moves forward, and only once the provisioner
//! daemons are fully ready.

use crate::crd::{ConditionType, HostPathProvisionerStatus};
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use semver::Version;
use std::cmp::Ordering;

// =============================================================================
// Reasons
// =============================================================================

pub const DEPLOY_STARTED: &str = "DeployStarted";
pub const DEPLOY_STARTED_MESSAGE: &str = "Started Deployment";
pub const UPGRADE_STARTED: &str = "UpgradeStarted";
pub const PROVISIONER_HEALTHY: &str = "ProvisionerHealthy";
pub const PROVISIONER_HEALTHY_MESSAGE: &str = "Provisioner Healthy";
pub const WATCH_NAMESPACE: &str = "WatchNameSpace";
pub const RECONCILE_FAILED: &str = "Reconcile Failed";
pub const HEALTHY_REASON: &str = "Complete";
pub const HEALTHY_MESSAGE: &str = "Application Available";

// =============================================================================
// Condition marks
// =============================================================================

/// Set all three conditions, `reason` and `message` go on `annotated`
fn mark(
    status: &mut HostPathProvisionerStatus,
    [available, progressing, degraded]: [bool; 3],
    annotated: ConditionType,
    reason: &str,
    message: &str,
) {
    for (condition, value) in [
        (ConditionType::Available, available),
        (ConditionType::Progressing, progressing),
        (ConditionType::Degraded, degraded),
    ] {
        if condition == annotated {
            status.set_condition(condition, value, reason, message);
        } else {
            status.set_condition(condition, value, "", "");
        }
    }
}

// [Available, Progressing, Degraded] of each state
pub const DEPLOYING: [bool; 3] = [false, true, false];
pub const UPGRADING: [bool; 3] = [true, true, true];
pub const HEALTHY: [bool; 3] = [true, false, false];

pub fn mark_deploying(status: &mut HostPathProvisionerStatus, reason: &str, message: &str) {
    mark(status, DEPLOYING, ConditionType::Progressing, reason, message);
}

pub fn mark_upgrading(status: &mut HostPathProvisionerStatus, reason: &str, message: &str) {
    mark(status, UPGRADING, ConditionType::Degraded, reason, message);
}

pub fn mark_healthy(status: &mut HostPathProvisionerStatus, reason: &str, message: &str) {
    mark(status, HEALTHY, ConditionType::Available, reason, message);
}

/// Needs a human to fix
pub fn mark_failed(status: &mut HostPathProvisionerStatus, reason: &str, message: &str) {
    mark(status, [false, false, true], ConditionType::Degraded, reason, message);
}

/// Failed, but the operator keeps retrying
pub fn mark_failed_healing(status: &mut HostPathProvisionerStatus, reason: &str, message: &str) {
    mark(status, [false, true, true], ConditionType::Degraded, reason, message);
}

/// Available, Progressing and Degraded as booleans
pub fn state(status: &HostPathProvisionerStatus) -> [bool; 3] {
    [
        status.is_condition_true(ConditionType::Available),
        status.is_condition_true(ConditionType::Progressing),
        status.is_condition_true(ConditionType::Degraded),
    ]
}

/// Restore the timestamps of conditions that ended up as in `before`.
///
/// A pass marks intermediate states before the final one, so a condition can
/// flip and flip back within one pass.
pub fn settle(status: &mut HostPathProvisionerStatus, before: &HostPathProvisionerStatus) {
    for condition in &mut status.conditions {
        let unchanged = before.conditions.iter().find(|b| {
            b.r#type == condition.r#type
                && b.status == condition.status
                && b.reason == condition.reason
                && b.message == condition.message
        });
        if let Some(previous) = unchanged {
            condition.last_heartbeat_time = previous.last_heartbeat_time;
            condition.last_transition_time = previous.last_transition_time;
        }
    }
}

pub fn is_healthy(status: &HostPathProvisionerStatus) -> bool {
    let is_false = |c| {
        status
            .condition(c)
            .map_or(false, |cond| cond.status == "False")
    };
    status.is_condition_true(ConditionType::Available)
        && is_false(ConditionType::Progressing)
        && is_false(ConditionType::Degraded)
}

/// Nothing has been fully rolled out yet
pub fn is_deploying(status: &HostPathProvisionerStatus) -> bool {
    status.observed_version.is_empty()
}

pub fn is_upgrading(status: &HostPathProvisionerStatus) -> bool {
    !status.observed_version.is_empty() && status.observed_version != status.target_version
}

// =============================================================================
// Versions
// =============================================================================

/// Parse a semantic version, a leading `v` is accepted
pub fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    Version::parse(s.strip_prefix('v').unwrap_or(s)).ok()
}

/// Whether moving from `current` to `target` is an upgrade.
///
/// Nothing deployed yet or the same version is not an upgrade. Versions that
/// are not semver are always eligible. A lower target is an error.
pub fn can_upgrade(current: &str, target: &str) -> Result<bool> {
    if current.is_empty() || current == target {
        return Ok(false);
    }
    match (parse_version(current), parse_version(target)) {
        (Some(from), Some(to)) => match to.cmp(&from) {
            Ordering::Less => Err(Error::Downgrade {
                from: current.to_string(),
                to: target.to_string(),
            }),
            Ordering::Equal => Ok(false),
            Ordering::Greater => Ok(true),
        },
        _ => Ok(true),
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Rollout state of the provisioner daemons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Every daemon set has at least one ready pod
    pub available: bool,
    /// Every daemon set has a ready pod on each scheduled node
    pub ready: bool,
}

impl Readiness {
    /// Readiness of `daemon_sets`, `None` entries are missing daemon sets
    pub fn of(daemon_sets: &[Option<DaemonSet>]) -> Self {
        if daemon_sets.is_empty() {
            return Self::default();
        }
        let counts: Vec<(i32, i32)> = daemon_sets
            .iter()
            .map(|ds| {
                ds.as_ref()
                    .and_then(|ds| ds.status.as_ref())
                    .map_or((0, 0), |s| (s.number_ready, s.desired_number_scheduled))
            })
            .collect();
        let available = counts.iter().all(|(ready, _)| *ready > 0);
        Self {
            available,
            ready: available && counts.iter().all(|(ready, desired)| ready >= desired),
        }
    }
}

/// Set the Degraded condition from readiness, returns whether degraded.
///
/// A not ready workload only counts as degraded once something was rolled
/// out; during the first deploy it is just progressing.
pub fn check_degraded(status: &mut HostPathProvisionerStatus, readiness: Readiness) -> bool {
    let degraded = !readiness.ready;
    let (reason, message) = status
        .condition(ConditionType::Degraded)
        .map(|c| {
            (
                c.reason.clone().unwrap_or_default(),
                c.message.clone().unwrap_or_default(),
            )
        })
        .unwrap_or_default();
    status.set_condition(
        ConditionType::Degraded,
        degraded && !is_deploying(status),
        &reason,
        &message,
    );
    degraded
}
