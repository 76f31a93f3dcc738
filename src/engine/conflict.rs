use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::range::{form_range, session_range};

/// What one session commits, flattened for overlap checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub key: Ulid,
    pub span: Option<Span>,
    pub trainer_ids: ResourceSet,
    pub room_id: Option<Ulid>,
    pub mobile_unit_ids: ResourceSet,
}

impl Commitment {
    pub fn from_session(session: &Session) -> Self {
        Self {
            key: session.id,
            span: session_range(session),
            trainer_ids: session.trainer_ids.clone(),
            room_id: session.room_id,
            mobile_unit_ids: session.mobile_unit_ids.clone(),
        }
    }

    pub fn from_form(form: &SessionForm, tz: Tz) -> Self {
        Self {
            key: form.key,
            span: form_range(form, tz),
            trainer_ids: form.trainer_set(),
            room_id: form.room_id,
            mobile_unit_ids: form.mobile_unit_set(),
        }
    }

    pub fn holds(&self, kind: ResourceKind, id: &Ulid) -> bool {
        match kind {
            ResourceKind::Trainer => self.trainer_ids.contains(id),
            ResourceKind::Room => self.room_id.as_ref() == Some(id),
            ResourceKind::MobileUnit => self.mobile_unit_ids.contains(id),
        }
    }

    fn resources(&self) -> impl Iterator<Item = (ResourceKind, Ulid)> + '_ {
        self.trainer_ids
            .iter()
            .map(|id| (ResourceKind::Trainer, *id))
            .chain(self.room_id.map(|id| (ResourceKind::Room, id)))
            .chain(self.mobile_unit_ids.iter().map(|id| (ResourceKind::MobileUnit, *id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum LockOrigin {
    /// Inferred from a sibling held in client state.
    Local { session_key: Ulid },
    /// Reported by the server for the queried range.
    Remote,
}

/// "Resource R is committed to an overlapping interval." Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLock {
    pub kind: ResourceKind,
    pub resource_id: Ulid,
    #[serde(flatten)]
    pub origin: LockOrigin,
}

/// Every resource of every sibling overlapping `target`, one lock per
/// (resource, sibling) pair. The target is excluded by key; siblings
/// without an effective range contribute nothing.
pub fn local_locks(target: &Commitment, siblings: &[Commitment]) -> Vec<ResourceLock> {
    let Some(span) = target.span else {
        return Vec::new();
    };
    let mut locks = Vec::new();
    for sibling in siblings {
        if sibling.key == target.key {
            continue;
        }
        let Some(other) = sibling.span else { continue };
        if !span.overlaps(&other) {
            continue;
        }
        for (kind, resource_id) in sibling.resources() {
            locks.push(ResourceLock {
                kind,
                resource_id,
                origin: LockOrigin::Local { session_key: sibling.key },
            });
        }
    }
    locks
}

/// Resource ids already committed by overlapping siblings, per kind.
pub fn compute_local_locks(target: &Commitment, siblings: &[Commitment]) -> BlockedResources {
    let mut blocked = BlockedResources::default();
    for lock in local_locks(target, siblings) {
        blocked.insert(lock.kind, lock.resource_id);
    }
    blocked
}
