use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{Commitment, LockOrigin, ResourceLock};

// ── Remote snapshot ───────────────────────────────────────────────

/// Server-side view of blocked resources, as last fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAvailability {
    /// No fetch issued yet (or the target has no range to query).
    NotRequested,
    /// Blocked resources reported for exactly `span`.
    Loaded { span: Span, blocked: BlockedResources },
    /// Fetch failed or timed out. Local locks still apply.
    Unavailable { reason: String },
}

impl RemoteAvailability {
    /// Remote locks usable for `span`. A snapshot queried for another range
    /// is stale and contributes nothing until refetched.
    pub fn blocked_for(&self, span: Option<Span>) -> Option<&BlockedResources> {
        match self {
            RemoteAvailability::Loaded { span: queried, blocked } if Some(*queried) == span => Some(blocked),
            _ => None,
        }
    }

    /// The advisory to show while remote checks cannot be trusted.
    pub fn advisory(&self) -> Option<&str> {
        match self {
            RemoteAvailability::Unavailable { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

// ── Aggregation ───────────────────────────────────────────────────

/// Union of local and remote blocked sets per kind. Exempt mobile units are
/// removed from `units` whatever their source.
pub fn compute_blocked(
    target: &Commitment,
    local: &BlockedResources,
    remote: &RemoteAvailability,
    exempt_unit_ids: &ResourceSet,
) -> BlockedResources {
    let mut blocked = local.clone();
    if let Some(remote_blocked) = remote.blocked_for(target.span) {
        blocked.extend(remote_blocked);
    }
    blocked.units.retain(|id| !exempt_unit_ids.contains(id));
    blocked
}

/// Locks that hit a resource the target itself has assigned. These are the
/// conflict warnings; they never block a save.
pub fn assigned_conflicts(
    target: &Commitment,
    local: &[ResourceLock],
    remote: &RemoteAvailability,
    exempt_unit_ids: &ResourceSet,
) -> Vec<ResourceLock> {
    let exempt = |kind: ResourceKind, id: &Ulid| kind == ResourceKind::MobileUnit && exempt_unit_ids.contains(id);

    let mut conflicts: Vec<ResourceLock> = local
        .iter()
        .filter(|lock| target.holds(lock.kind, &lock.resource_id) && !exempt(lock.kind, &lock.resource_id))
        .copied()
        .collect();

    if let Some(remote_blocked) = remote.blocked_for(target.span) {
        for kind in [ResourceKind::Trainer, ResourceKind::Room, ResourceKind::MobileUnit] {
            for id in remote_blocked.of_kind(kind) {
                if target.holds(kind, id) && !exempt(kind, id) {
                    conflicts.push(ResourceLock {
                        kind,
                        resource_id: *id,
                        origin: LockOrigin::Remote,
                    });
                }
            }
        }
    }
    conflicts
}

// ── Selection state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionState {
    Available,
    /// Shown disabled.
    Blocked,
    /// Already on the target and now locked elsewhere. Stays enabled so it
    /// can be inspected or removed.
    SelectedConflict,
}

impl OptionState {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, OptionState::Blocked)
    }
}

pub fn option_state(kind: ResourceKind, id: &Ulid, blocked: &BlockedResources, target: &Commitment) -> OptionState {
    match (blocked.contains(kind, id), target.holds(kind, id)) {
        (false, _) => OptionState::Available,
        (true, true) => OptionState::SelectedConflict,
        (true, false) => OptionState::Blocked,
    }
}

/// Clear a room id the catalog no longer knows. Returns whether it changed.
pub fn reconcile_room(form: &mut SessionForm, room_catalog: &ResourceSet) -> bool {
    match form.room_id {
        Some(room) if !room_catalog.contains(&room) => {
            tracing::debug!(session = %form.key, %room, "room dropped from catalog; clearing");
            form.room_id = None;
            true
        }
        _ => false,
    }
}
