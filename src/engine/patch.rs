use chrono_tz::Tz;
use serde::{Serialize, Serializer};
use ulid::Ulid;

use crate::model::*;
use crate::timezone::{format_local, local_str_to_utc, parse_local, utc_to_local_str};

use super::error::ValidationError;
use super::lifecycle::{can_transition, is_planifiable};

/// One field of a patch: left out, explicitly cleared, or set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Field<T> {
    #[default]
    Unset,
    Null,
    Value(T),
}

impl<T> Field<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Field::Unset)
    }

    /// `None` becomes an explicit `Null`, never `Unset`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Value(v),
            None => Field::Null,
        }
    }

    /// `Some(None)` for a clear, `None` when the field is not in the patch.
    pub fn as_change(&self) -> Option<Option<&T>> {
        match self {
            Field::Unset => None,
            Field::Null => Some(None),
            Field::Value(v) => Some(Some(v)),
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Unset | Field::Null => serializer.serialize_none(),
            Field::Value(v) => serializer.serialize_some(v),
        }
    }
}

/// Changed fields to hand to the persistence collaborator. `deal_id` and
/// `deal_product_id` only appear when creating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Patch {
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub deal_id: Field<Ulid>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub deal_product_id: Field<Ulid>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub name: Field<String>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub start: Field<Ms>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub end: Field<Ms>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub room_id: Field<Ulid>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub address: Field<String>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub state: Field<SessionState>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub trainer_ids: Field<Vec<Ulid>>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    pub mobile_unit_ids: Field<Vec<Ulid>>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let fields: [(&'static str, bool); 10] = [
            ("deal_id", self.deal_id.is_unset()),
            ("deal_product_id", self.deal_product_id.is_unset()),
            ("name", self.name.is_unset()),
            ("start", self.start.is_unset()),
            ("end", self.end.is_unset()),
            ("room_id", self.room_id.is_unset()),
            ("address", self.address.is_unset()),
            ("state", self.state.is_unset()),
            ("trainer_ids", self.trainer_ids.is_unset()),
            ("mobile_unit_ids", self.mobile_unit_ids.is_unset()),
        ];
        fields
            .into_iter()
            .filter(|(_, unset)| !unset)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Apply onto a session. Owner fields are not touched here.
    pub fn apply(&self, session: &mut Session) {
        if let Some(v) = self.name.as_change() {
            session.name = v.cloned();
        }
        if let Some(v) = self.start.as_change() {
            session.start = v.copied();
        }
        if let Some(v) = self.end.as_change() {
            session.end = v.copied();
        }
        if let Some(v) = self.room_id.as_change() {
            session.room_id = v.copied();
        }
        if let Some(v) = self.address.as_change() {
            session.address = v.cloned();
        }
        if let Some(Some(state)) = self.state.as_change() {
            session.state = *state;
        }
        if let Some(v) = self.trainer_ids.as_change() {
            session.trainer_ids = v.map(|ids| ids.iter().copied().collect()).unwrap_or_default();
        }
        if let Some(v) = self.mobile_unit_ids.as_change() {
            session.mobile_unit_ids = v.map(|ids| ids.iter().copied().collect()).unwrap_or_default();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Nothing changed: succeed immediately, no network call.
    NoOp,
    Patch(Patch),
}

fn normalize_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn normalize_saved_text(value: Option<&str>) -> Option<String> {
    value.and_then(normalize_text)
}

/// Forms carry minute precision; compare stored instants the same way.
fn to_minute(ms: Ms) -> Ms {
    ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// A stored instant is unchanged when it renders to the wall time the form
/// shows. Inside a repeated fall-back hour this keeps whichever occurrence
/// was stored instead of re-encoding it to the other one.
fn instant_changed(form_local: &str, parsed: Option<Ms>, stored: Option<Ms>, tz: Tz) -> bool {
    if let (Some(_), Some(ms)) = (parsed, stored)
        && let Ok(Some(local)) = parse_local(form_local)
        && utc_to_local_str(ms, tz).is_ok_and(|shown| shown == format_local(&local))
    {
        return false;
    }
    parsed != stored.map(to_minute)
}

/// Minimal set of changes from `saved` to `current`.
///
/// Date checks short-circuit in order: start, end, then the pair. With no
/// saved snapshot the whole normalized form is returned. A target state the
/// lifecycle does not allow is left out silently.
pub fn build_patch(current: &SessionForm, saved: Option<&Session>, tz: Tz) -> Result<PatchOutcome, ValidationError> {
    let start = local_str_to_utc(&current.start_local, tz).map_err(|_| ValidationError::InvalidStart)?;
    let end = local_str_to_utc(&current.end_local, tz).map_err(|_| ValidationError::InvalidEnd)?;
    if let (Some(s), Some(e)) = (start, end)
        && e < s
    {
        return Err(ValidationError::InvalidRange);
    }

    let name = normalize_text(&current.name);
    let address = normalize_text(&current.address);
    let trainers = current.trainer_set();
    let units = current.mobile_unit_set();
    let planifiable = is_planifiable(current, tz);

    let Some(saved) = saved else {
        let state = if can_transition(SessionState::Draft, current.state, planifiable) {
            current.state
        } else {
            SessionState::Draft
        };
        return Ok(PatchOutcome::Patch(Patch {
            deal_id: Field::Value(current.deal_id),
            deal_product_id: Field::Value(current.deal_product_id),
            name: Field::from_option(name),
            start: Field::from_option(start),
            end: Field::from_option(end),
            room_id: Field::from_option(current.room_id),
            address: Field::from_option(address),
            state: Field::Value(state),
            trainer_ids: Field::Value(trainers.into_iter().collect()),
            mobile_unit_ids: Field::Value(units.into_iter().collect()),
        }));
    };

    let mut patch = Patch::default();
    if name != normalize_saved_text(saved.name.as_deref()) {
        patch.name = Field::from_option(name);
    }
    if instant_changed(&current.start_local, start, saved.start, tz) {
        patch.start = Field::from_option(start);
    }
    if instant_changed(&current.end_local, end, saved.end, tz) {
        patch.end = Field::from_option(end);
    }
    if current.room_id != saved.room_id {
        patch.room_id = Field::from_option(current.room_id);
    }
    if address != normalize_saved_text(saved.address.as_deref()) {
        patch.address = Field::from_option(address);
    }
    if current.state != saved.state && can_transition(saved.state, current.state, planifiable) {
        patch.state = Field::Value(current.state);
    }
    if trainers != saved.trainer_ids {
        patch.trainer_ids = Field::Value(trainers.into_iter().collect());
    }
    if units != saved.mobile_unit_ids {
        patch.mobile_unit_ids = Field::Value(units.into_iter().collect());
    }

    if patch.is_empty() {
        Ok(PatchOutcome::NoOp)
    } else {
        Ok(PatchOutcome::Patch(patch))
    }
}
