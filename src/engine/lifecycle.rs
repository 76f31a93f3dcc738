use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::timezone::{CodecError, utc_to_local_str};

use super::EngineError;
use super::range::{form_range, session_range};

// ── Planifiable gate ──────────────────────────────────────────────

/// One precondition for entering SCHEDULED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Name,
    TimeRange,
    Location,
    Trainer,
    MobileUnit,
}

fn missing(
    name: &str,
    span: Option<Span>,
    room_id: Option<Ulid>,
    address: &str,
    has_trainer: bool,
    has_unit: bool,
) -> Vec<Requirement> {
    let mut out = Vec::new();
    if name.trim().is_empty() {
        out.push(Requirement::Name);
    }
    if span.is_none() {
        out.push(Requirement::TimeRange);
    }
    if room_id.is_none() && address.trim().is_empty() {
        out.push(Requirement::Location);
    }
    if !has_trainer {
        out.push(Requirement::Trainer);
    }
    if !has_unit {
        out.push(Requirement::MobileUnit);
    }
    out
}

pub fn missing_requirements(form: &SessionForm, tz: Tz) -> Vec<Requirement> {
    missing(
        &form.name,
        form_range(form, tz),
        form.room_id,
        &form.address,
        !form.trainer_ids.is_empty(),
        !form.mobile_unit_ids.is_empty(),
    )
}

/// Conflicts are not considered: a planifiable session may still clash
/// with a sibling.
pub fn is_planifiable(form: &SessionForm, tz: Tz) -> bool {
    missing_requirements(form, tz).is_empty()
}

pub fn session_is_planifiable(session: &Session) -> bool {
    missing(
        session.name.as_deref().unwrap_or_default(),
        session_range(session),
        session.room_id,
        session.address.as_deref().unwrap_or_default(),
        !session.trainer_ids.is_empty(),
        !session.mobile_unit_ids.is_empty(),
    )
    .is_empty()
}

// ── State machine ─────────────────────────────────────────────────
//
// Every state except SCHEDULED is reachable from every state at any time.
// SCHEDULED needs the planifiable gate at the moment of transition. There is
// no terminal state.

pub fn can_transition(from: SessionState, to: SessionState, planifiable: bool) -> bool {
    match to {
        SessionState::Scheduled => from == SessionState::Scheduled || planifiable,
        SessionState::Draft | SessionState::Suspended | SessionState::Cancelled | SessionState::Completed => true,
    }
}

/// States to offer in the selector, in display order.
pub fn allowed_targets(from: SessionState, planifiable: bool) -> Vec<SessionState> {
    SessionState::ALL
        .into_iter()
        .filter(|to| can_transition(from, *to, planifiable))
        .collect()
}

pub fn transition(from: SessionState, to: SessionState, planifiable: bool) -> Result<SessionState, EngineError> {
    if can_transition(from, to, planifiable) {
        Ok(to)
    } else {
        Err(EngineError::IllegalTransition { from, to })
    }
}

/// A save whose resulting state is SCHEDULED needs a planifiable form,
/// including a session that was already scheduled and lost a requirement.
pub fn save_gate(key: Ulid, effective_state: SessionState, planifiable: bool) -> Result<(), EngineError> {
    if effective_state == SessionState::Scheduled && !planifiable {
        return Err(EngineError::NotPlanifiable(key));
    }
    Ok(())
}

// ── Creation ──────────────────────────────────────────────────────

/// Editable form for a persisted session. The form key is the session id.
pub fn form_from_session(session: &Session, tz: Tz) -> Result<SessionForm, CodecError> {
    let start_local = session.start.map(|ms| utc_to_local_str(ms, tz)).transpose()?;
    let end_local = session.end.map(|ms| utc_to_local_str(ms, tz)).transpose()?;
    Ok(SessionForm {
        key: session.id,
        id: Some(session.id),
        deal_id: session.deal_id,
        deal_product_id: session.deal_product_id,
        name: session.name.clone().unwrap_or_default(),
        start_local: start_local.unwrap_or_default(),
        end_local: end_local.unwrap_or_default(),
        room_id: session.room_id,
        address: session.address.clone().unwrap_or_default(),
        state: session.state,
        trainer_ids: session.trainer_ids.iter().copied().collect(),
        mobile_unit_ids: session.mobile_unit_ids.iter().copied().collect(),
    })
}

/// Unsaved copy of `source` under the same deal-product. Always DRAFT;
/// the document folder is not carried over.
pub fn duplicate(source: &Session, tz: Tz) -> Result<SessionForm, CodecError> {
    let mut form = form_from_session(source, tz)?;
    form.key = Ulid::new();
    form.id = None;
    form.state = SessionState::Draft;
    Ok(form)
}

/// Same as [`duplicate`], starting from what is on screen.
pub fn duplicate_form(source: &SessionForm) -> SessionForm {
    SessionForm {
        key: Ulid::new(),
        id: None,
        state: SessionState::Draft,
        ..source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MADRID: Tz = chrono_tz::Europe::Madrid;

    fn planifiable_form() -> SessionForm {
        let mut form = SessionForm::draft(Ulid::new(), Ulid::new());
        form.name = "Extinción de incendios".into();
        form.start_local = "2024-05-10T09:00".into();
        form.end_local = "2024-05-10T13:00".into();
        form.address = "Calle Mayor 1".into();
        form.trainer_ids = vec![Ulid::new()];
        form.mobile_unit_ids = vec![Ulid::new()];
        form
    }

    #[test]
    fn full_form_is_planifiable() {
        assert!(is_planifiable(&planifiable_form(), MADRID));
    }

    #[test]
    fn room_satisfies_location() {
        let mut form = planifiable_form();
        form.address.clear();
        form.room_id = Some(Ulid::new());
        assert!(is_planifiable(&form, MADRID));
    }

    #[test]
    fn each_requirement_is_needed() {
        let cases: [(Requirement, fn(&mut SessionForm)); 5] = [
            (Requirement::Name, |f| f.name = "  ".into()),
            (Requirement::TimeRange, |f| f.end_local = "2024-05-10T08:00".into()),
            (Requirement::Location, |f| f.address = " ".into()),
            (Requirement::Trainer, |f| f.trainer_ids.clear()),
            (Requirement::MobileUnit, |f| f.mobile_unit_ids.clear()),
        ];
        for (requirement, break_it) in cases {
            let mut form = planifiable_form();
            break_it(&mut form);
            assert!(!is_planifiable(&form, MADRID));
            assert_eq!(missing_requirements(&form, MADRID), vec![requirement]);
        }
    }

    #[test]
    fn half_open_range_is_not_planifiable() {
        let mut form = planifiable_form();
        form.end_local.clear();
        assert_eq!(missing_requirements(&form, MADRID), vec![Requirement::TimeRange]);
    }

    #[test]
    fn scheduled_needs_planifiable() {
        for from in SessionState::ALL {
            assert!(!can_transition(from, SessionState::Scheduled, false) || from == SessionState::Scheduled);
            assert!(can_transition(from, SessionState::Scheduled, true));
        }
        assert!(matches!(
            transition(SessionState::Draft, SessionState::Scheduled, false),
            Err(EngineError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn manual_states_reachable_from_anywhere() {
        for from in SessionState::ALL {
            for to in [
                SessionState::Draft,
                SessionState::Suspended,
                SessionState::Cancelled,
                SessionState::Completed,
            ] {
                assert_eq!(transition(from, to, false).unwrap(), to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn allowed_targets_hide_scheduled_until_planifiable() {
        let offered = allowed_targets(SessionState::Draft, false);
        assert!(!offered.contains(&SessionState::Scheduled));
        assert_eq!(offered.len(), 4);
        assert_eq!(allowed_targets(SessionState::Draft, true).len(), 5);
    }

    #[test]
    fn save_gate_blocks_unplanifiable_scheduled() {
        let key = Ulid::new();
        assert!(matches!(
            save_gate(key, SessionState::Scheduled, false),
            Err(EngineError::NotPlanifiable(k)) if k == key
        ));
        assert!(save_gate(key, SessionState::Scheduled, true).is_ok());
        assert!(save_gate(key, SessionState::Cancelled, false).is_ok());
    }

    #[test]
    fn duplicate_of_scheduled_is_draft() {
        let source = Session {
            id: Ulid::new(),
            deal_id: Ulid::new(),
            deal_product_id: Ulid::new(),
            name: Some("Carretilla".into()),
            start: Some(1_715_324_400_000),
            end: Some(1_715_338_800_000),
            room_id: Some(Ulid::new()),
            address: None,
            state: SessionState::Scheduled,
            trainer_ids: [Ulid::new()].into(),
            mobile_unit_ids: [Ulid::new()].into(),
            drive_url: Some("https://drive.example/folder".into()),
        };
        let copy = duplicate(&source, MADRID).unwrap();
        assert_eq!(copy.state, SessionState::Draft);
        assert_eq!(copy.id, None);
        assert_ne!(copy.key, source.id);
        assert_eq!(copy.deal_product_id, source.deal_product_id);
        assert_eq!(copy.trainer_set(), source.trainer_ids);
        assert_eq!(copy.start_local, utc_to_local_str(1_715_324_400_000, MADRID).unwrap());
        assert!(session_is_planifiable(&source));
    }
}
