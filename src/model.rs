use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Unordered, duplicate-free set of resource references.
pub type ResourceSet = BTreeSet<Ulid>;

/// Closed interval `[start, end]`. Touching endpoints overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    /// `None` for an inverted pair.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Draft,
    Scheduled,
    Suspended,
    Cancelled,
    Completed,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Draft,
        SessionState::Scheduled,
        SessionState::Suspended,
        SessionState::Cancelled,
        SessionState::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Draft => "DRAFT",
            SessionState::Scheduled => "SCHEDULED",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Cancelled => "CANCELLED",
            SessionState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Trainer,
    Room,
    MobileUnit,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Trainer => "trainer",
            ResourceKind::Room => "room",
            ResourceKind::MobileUnit => "mobile_unit",
        })
    }
}

/// Persisted session as the server echoes it. Times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub deal_id: Ulid,
    pub deal_product_id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start: Option<Ms>,
    #[serde(default)]
    pub end: Option<Ms>,
    #[serde(default)]
    pub room_id: Option<Ulid>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub trainer_ids: ResourceSet,
    #[serde(default)]
    pub mobile_unit_ids: ResourceSet,
    /// Folder reference owned by the document collaborator.
    #[serde(default)]
    pub drive_url: Option<String>,
}

/// Editable client-side state of one session.
///
/// Times are wall-clock strings in the display timezone, exactly as typed.
/// Resource lists keep UI order and may hold duplicates; diffs compare them
/// as sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionForm {
    /// Client identity. Equals `id` once persisted.
    pub key: Ulid,
    pub id: Option<Ulid>,
    pub deal_id: Ulid,
    pub deal_product_id: Ulid,
    pub name: String,
    pub start_local: String,
    pub end_local: String,
    pub room_id: Option<Ulid>,
    pub address: String,
    pub state: SessionState,
    pub trainer_ids: Vec<Ulid>,
    pub mobile_unit_ids: Vec<Ulid>,
}

impl SessionForm {
    /// Blank unsaved draft owned by `deal_product_id`.
    pub fn draft(deal_id: Ulid, deal_product_id: Ulid) -> Self {
        Self {
            key: Ulid::new(),
            id: None,
            deal_id,
            deal_product_id,
            name: String::new(),
            start_local: String::new(),
            end_local: String::new(),
            room_id: None,
            address: String::new(),
            state: SessionState::Draft,
            trainer_ids: Vec::new(),
            mobile_unit_ids: Vec::new(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Trimmed name, or `Session {index}` when blank.
    pub fn display_name(&self, index: usize) -> String {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            format!("Session {index}")
        } else {
            trimmed.to_string()
        }
    }

    pub fn trainer_set(&self) -> ResourceSet {
        self.trainer_ids.iter().copied().collect()
    }

    pub fn mobile_unit_set(&self) -> ResourceSet {
        self.mobile_unit_ids.iter().copied().collect()
    }
}

/// Blocked resource ids per kind for one time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedResources {
    #[serde(default)]
    pub trainers: ResourceSet,
    #[serde(default)]
    pub rooms: ResourceSet,
    #[serde(default)]
    pub units: ResourceSet,
}

impl BlockedResources {
    pub fn is_empty(&self) -> bool {
        self.trainers.is_empty() && self.rooms.is_empty() && self.units.is_empty()
    }

    pub fn contains(&self, kind: ResourceKind, id: &Ulid) -> bool {
        self.of_kind(kind).contains(id)
    }

    pub fn of_kind(&self, kind: ResourceKind) -> &ResourceSet {
        match kind {
            ResourceKind::Trainer => &self.trainers,
            ResourceKind::Room => &self.rooms,
            ResourceKind::MobileUnit => &self.units,
        }
    }

    pub fn insert(&mut self, kind: ResourceKind, id: Ulid) {
        match kind {
            ResourceKind::Trainer => self.trainers.insert(id),
            ResourceKind::Room => self.rooms.insert(id),
            ResourceKind::MobileUnit => self.units.insert(id),
        };
    }

    pub fn extend(&mut self, other: &BlockedResources) {
        self.trainers.extend(other.trainers.iter().copied());
        self.rooms.extend(other.rooms.iter().copied());
        self.units.extend(other.units.iter().copied());
    }
}
