//! Per-session editing context: the form on screen, the last saved
//! snapshot and the in-flight save flag.

use std::time::{Duration, Instant};

use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::availability::{RemoteAvailability, assigned_conflicts, compute_blocked};
use crate::engine::conflict::{Commitment, ResourceLock, local_locks};
use crate::engine::lifecycle::{Requirement, allowed_targets, duplicate, form_from_session, missing_requirements, save_gate};
use crate::engine::patch::{Field, Patch, PatchOutcome, build_patch};
use crate::engine::{EngineError, ValidationError};
use crate::model::*;
use crate::observability;
use crate::repository::{AvailabilitySource, RepositoryError, SessionRepository};
use crate::timezone::CodecError;

// ── Recompute ─────────────────────────────────────────────────────

/// Why the save button is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SaveBlock {
    Validation { code: &'static str },
    NotPlanifiable { missing: Vec<Requirement> },
}

/// Everything the editing surface derives from its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditorView {
    pub range: Option<Span>,
    pub blocked: BlockedResources,
    /// Assigned resources that clash. Warnings only.
    pub conflicts: Vec<ResourceLock>,
    pub planifiable: bool,
    pub missing: Vec<Requirement>,
    pub allowed_states: Vec<SessionState>,
    pub save_block: Option<SaveBlock>,
    pub availability_advisory: Option<String>,
}

/// Derive the editor view from the form, its snapshot, one consistent read
/// of sibling commitments and the remote snapshot. Pure; callers rerun it
/// whenever the range, the sibling set or the resource catalog changes.
pub fn recompute(
    form: &SessionForm,
    saved: Option<&Session>,
    siblings: &[Commitment],
    remote: &RemoteAvailability,
    exempt_unit_ids: &ResourceSet,
    tz: Tz,
) -> EditorView {
    let target = Commitment::from_form(form, tz);
    let locks = local_locks(&target, siblings);

    let mut local = BlockedResources::default();
    for lock in &locks {
        local.insert(lock.kind, lock.resource_id);
    }
    let blocked = compute_blocked(&target, &local, remote, exempt_unit_ids);
    let conflicts = assigned_conflicts(&target, &locks, remote, exempt_unit_ids);

    let missing = missing_requirements(form, tz);
    let planifiable = missing.is_empty();
    let from = saved.map_or(SessionState::Draft, |s| s.state);

    let save_block = match build_patch(form, saved, tz) {
        Err(e) => Some(SaveBlock::Validation { code: e.code() }),
        Ok(outcome) if effective_state(&outcome, saved) == SessionState::Scheduled && !planifiable => {
            Some(SaveBlock::NotPlanifiable { missing: missing.clone() })
        }
        Ok(_) => None,
    };

    debug!(
        session = %form.key,
        siblings = siblings.len(),
        conflicts = conflicts.len(),
        planifiable,
        "recomputed editor view"
    );

    EditorView {
        range: target.span,
        blocked,
        conflicts,
        planifiable,
        missing,
        allowed_states: allowed_targets(from, planifiable),
        save_block,
        availability_advisory: remote.advisory().map(str::to_string),
    }
}

/// State the session ends up in once `outcome` is persisted.
fn effective_state(outcome: &PatchOutcome, saved: Option<&Session>) -> SessionState {
    let saved_state = saved.map_or(SessionState::Draft, |s| s.state);
    match outcome {
        PatchOutcome::Patch(Patch {
            state: Field::Value(state),
            ..
        }) => *state,
        _ => saved_state,
    }
}

/// Ask the server for blocked resources, bounded by `timeout`. Failure or
/// timeout degrades to `Unavailable`; it is never an error.
pub async fn fetch_remote<A: AvailabilitySource + ?Sized>(
    source: &A,
    span: Option<Span>,
    exclude_session_id: Option<Ulid>,
    timeout: Duration,
) -> RemoteAvailability {
    let Some(span) = span else {
        return RemoteAvailability::NotRequested;
    };
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, source.fetch_availability(span, exclude_session_id)).await;
    metrics::histogram!(observability::AVAILABILITY_FETCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(blocked)) => RemoteAvailability::Loaded { span, blocked },
        Ok(Err(e)) => {
            warn!("availability lookup failed, using local locks only: {e}");
            metrics::counter!(observability::AVAILABILITY_FALLBACKS_TOTAL, "reason" => "error").increment(1);
            RemoteAvailability::Unavailable {
                reason: format!("couldn't verify availability: {e}"),
            }
        }
        Err(_) => {
            warn!("availability lookup timed out after {timeout:?}, using local locks only");
            metrics::counter!(observability::AVAILABILITY_FALLBACKS_TOTAL, "reason" => "timeout").increment(1);
            RemoteAvailability::Unavailable {
                reason: format!("couldn't verify availability: timed out after {}ms", timeout.as_millis()),
            }
        }
    }
}

// ── Editor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Leave the form as is; the caller saves or keeps editing.
    Keep,
    /// Throw the edits away and go back to the snapshot.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    NoOp,
    Saved(Session),
}

/// A save handed out by [`SessionEditor::begin_save`]. Exactly one can be
/// outstanding per editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSave {
    pub session_id: Option<Ulid>,
    pub patch: Patch,
    submitted: SessionForm,
}

#[derive(Debug, Clone)]
pub struct SessionEditor {
    form: SessionForm,
    saved: Option<Session>,
    pending: bool,
    tz: Tz,
}

impl SessionEditor {
    pub fn new_draft(deal_id: Ulid, deal_product_id: Ulid, tz: Tz) -> Self {
        Self::from_form(SessionForm::draft(deal_id, deal_product_id), tz)
    }

    /// Editor for an unsaved form (a fresh draft or a duplicate).
    pub fn from_form(form: SessionForm, tz: Tz) -> Self {
        Self {
            form,
            saved: None,
            pending: false,
            tz,
        }
    }

    pub fn from_session(session: Session, tz: Tz) -> Result<Self, CodecError> {
        let form = form_from_session(&session, tz)?;
        Ok(Self {
            form,
            saved: Some(session),
            pending: false,
            tz,
        })
    }

    /// Editor for a DRAFT copy of a persisted session.
    pub fn duplicate_of(source: &Session, tz: Tz) -> Result<Self, CodecError> {
        Ok(Self::from_form(duplicate(source, tz)?, tz))
    }

    pub fn key(&self) -> Ulid {
        self.form.key
    }

    pub fn form(&self) -> &SessionForm {
        &self.form
    }

    pub fn form_mut(&mut self) -> &mut SessionForm {
        &mut self.form
    }

    pub fn saved(&self) -> Option<&Session> {
        self.saved.as_ref()
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn is_save_pending(&self) -> bool {
        self.pending
    }

    /// Unsaved drafts and forms with validation errors count as dirty.
    pub fn is_dirty(&self) -> bool {
        self.saved.is_none() || !matches!(build_patch(&self.form, self.saved.as_ref(), self.tz), Ok(PatchOutcome::NoOp))
    }

    pub fn commitment(&self) -> Commitment {
        Commitment::from_form(&self.form, self.tz)
    }

    pub fn view(&self, siblings: &[Commitment], remote: &RemoteAvailability, exempt_unit_ids: &ResourceSet) -> EditorView {
        recompute(&self.form, self.saved.as_ref(), siblings, remote, exempt_unit_ids, self.tz)
    }

    /// Put the form back to the last saved snapshot (or a blank draft with
    /// the same key and owner).
    pub fn revert(&mut self) {
        match &self.saved {
            Some(saved) => match form_from_session(saved, self.tz) {
                Ok(form) => self.form = form,
                Err(e) => warn!(session = %self.form.key, "cannot render saved snapshot: {e}"),
            },
            None => {
                let key = self.form.key;
                self.form = SessionForm {
                    key,
                    ..SessionForm::draft(self.form.deal_id, self.form.deal_product_id)
                };
            }
        }
    }

    /// Run before switching away or closing. Returns whether edits were
    /// thrown away.
    pub fn close(&mut self, decision: CloseDecision) -> bool {
        if !self.is_dirty() || decision == CloseDecision::Keep {
            return false;
        }
        debug!(session = %self.form.key, "discarding unsaved edits");
        self.revert();
        true
    }

    /// Validate and diff. `Ok(None)` means nothing to send.
    pub fn begin_save(&mut self) -> Result<Option<PendingSave>, EngineError> {
        if self.pending {
            return Err(EngineError::SaveInProgress(self.form.key));
        }
        let outcome = build_patch(&self.form, self.saved.as_ref(), self.tz);
        metrics::counter!(observability::PATCHES_TOTAL, "outcome" => observability::outcome_label(&outcome)).increment(1);
        let outcome = outcome?;

        let planifiable = missing_requirements(&self.form, self.tz).is_empty();
        if let Err(e) = save_gate(self.form.key, effective_state(&outcome, self.saved.as_ref()), planifiable) {
            metrics::counter!(observability::SAVES_GATED_TOTAL).increment(1);
            return Err(e);
        }

        let PatchOutcome::Patch(patch) = outcome else {
            return Ok(None);
        };
        self.pending = true;
        Ok(Some(PendingSave {
            session_id: self.saved.as_ref().map(|s| s.id),
            patch,
            submitted: self.form.clone(),
        }))
    }

    /// Record the collaborator's answer. On success the snapshot becomes the
    /// server's echo; edits typed while the save was in flight survive. On
    /// failure nothing is reverted.
    pub fn finish_save(&mut self, pending: PendingSave, result: Result<Session, RepositoryError>) -> Result<Session, EngineError> {
        if !self.pending {
            return Err(EngineError::NoPendingSave(self.form.key));
        }
        self.pending = false;
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!(session = %self.form.key, "save rejected: {e}");
                metrics::counter!(observability::SAVE_FAILURES_TOTAL).increment(1);
                return Err(e.into());
            }
        };

        // The write is accepted: adopt the echo before anything can fail.
        info!(session = %session.id, fields = ?pending.patch.changed_fields(), "session saved");
        let untouched = self.form == pending.submitted;
        self.saved = Some(session.clone());
        self.form.key = session.id;
        self.form.id = Some(session.id);
        if untouched {
            self.form = form_from_session(&session, self.tz)?;
        }
        Ok(session)
    }

    pub async fn save<R: SessionRepository + ?Sized>(&mut self, repo: &R) -> Result<SaveOutcome, EngineError> {
        let Some(pending) = self.begin_save()? else {
            return Ok(SaveOutcome::NoOp);
        };
        let started = Instant::now();
        let result = repo.persist(pending.session_id, &pending.patch).await;
        metrics::histogram!(observability::SAVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        self.finish_save(pending, result).map(SaveOutcome::Saved)
    }

    /// Adopt a newer server copy. A clean form follows it; a dirty one is
    /// left alone and will diff against the new copy.
    pub(crate) fn rebase(&mut self, session: Session) -> Result<(), CodecError> {
        let dirty = self.pending || self.is_dirty();
        if !dirty {
            self.form = form_from_session(&session, self.tz)?;
        }
        self.saved = Some(session);
        Ok(())
    }

    /// Validation only, for showing the field error without saving.
    pub fn validate(&self) -> Result<(), ValidationError> {
        build_patch(&self.form, self.saved.as_ref(), self.tz).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::timezone::local_str_to_utc;

    const MADRID: Tz = chrono_tz::Europe::Madrid;

    fn at(local: &str) -> Ms {
        local_str_to_utc(local, MADRID).unwrap().unwrap()
    }

    fn persisted(deal_id: Ulid, start: &str, end: &str, trainers: &[Ulid]) -> Session {
        Session {
            id: Ulid::new(),
            deal_id,
            deal_product_id: Ulid::new(),
            name: Some("PRL básico".into()),
            start: Some(at(start)),
            end: Some(at(end)),
            room_id: Some(Ulid::new()),
            address: None,
            state: SessionState::Draft,
            trainer_ids: trainers.iter().copied().collect(),
            mobile_unit_ids: [Ulid::new()].into(),
            drive_url: None,
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl AvailabilitySource for FailingSource {
        async fn fetch_availability(&self, _: Span, _: Option<Ulid>) -> Result<BlockedResources, RepositoryError> {
            Err(RepositoryError::Unavailable("503".into()))
        }
    }

    struct SlowSource;

    #[async_trait::async_trait]
    impl AvailabilitySource for SlowSource {
        async fn fetch_availability(&self, _: Span, _: Option<Ulid>) -> Result<BlockedResources, RepositoryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(BlockedResources::default())
        }
    }

    #[test]
    fn recompute_reports_blocked_and_conflicts() {
        let deal = Ulid::new();
        let t1 = Ulid::new();
        let a = persisted(deal, "2024-05-10T09:00", "2024-05-10T11:00", &[t1]);
        let b = persisted(deal, "2024-05-10T10:00", "2024-05-10T12:00", &[t1]);
        let editor = SessionEditor::from_session(a.clone(), MADRID).unwrap();
        let siblings = vec![Commitment::from_session(&a), Commitment::from_session(&b)];

        let view = editor.view(&siblings, &RemoteAvailability::NotRequested, &ResourceSet::new());
        assert!(view.blocked.trainers.contains(&t1));
        assert_eq!(view.conflicts.len(), 1);
        assert!(view.planifiable);
        assert_eq!(view.save_block, None);
        assert_eq!(view.allowed_states.len(), 5);
    }

    #[test]
    fn recompute_flags_validation_and_gate() {
        let mut editor = SessionEditor::new_draft(Ulid::new(), Ulid::new(), MADRID);
        editor.form_mut().start_local = "2024-02-30T10:00".into();
        let view = editor.view(&[], &RemoteAvailability::NotRequested, &ResourceSet::new());
        assert_eq!(view.save_block, Some(SaveBlock::Validation { code: "INVALID_START" }));

        let deal = Ulid::new();
        let mut session = persisted(deal, "2024-05-10T09:00", "2024-05-10T11:00", &[Ulid::new()]);
        session.state = SessionState::Scheduled;
        let mut editor = SessionEditor::from_session(session, MADRID).unwrap();
        editor.form_mut().trainer_ids.clear();
        let view = editor.view(&[], &RemoteAvailability::NotRequested, &ResourceSet::new());
        assert_eq!(
            view.save_block,
            Some(SaveBlock::NotPlanifiable {
                missing: vec![Requirement::Trainer]
            })
        );
        assert!(view.allowed_states.contains(&SessionState::Scheduled));
    }

    #[tokio::test]
    async fn fetch_remote_degrades_on_error() {
        let span = Some(Span::new(0, 1));
        let remote = fetch_remote(&FailingSource, span, None, Duration::from_secs(1)).await;
        assert!(matches!(remote, RemoteAvailability::Unavailable { .. }));
        assert!(remote.advisory().unwrap().contains("couldn't verify availability"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_remote_degrades_on_timeout() {
        let remote = fetch_remote(&SlowSource, Some(Span::new(0, 1)), None, Duration::from_millis(50)).await;
        assert!(matches!(remote, RemoteAvailability::Unavailable { .. }));
    }

    #[tokio::test]
    async fn fetch_remote_skips_rangeless_target() {
        let remote = fetch_remote(&FailingSource, None, None, Duration::from_secs(1)).await;
        assert_eq!(remote, RemoteAvailability::NotRequested);
    }

    #[tokio::test]
    async fn save_creates_then_noop() {
        let repo = InMemoryRepository::new();
        let mut editor = SessionEditor::new_draft(Ulid::new(), Ulid::new(), MADRID);
        let draft_key = editor.key();
        editor.form_mut().name = "Nueva sesión".into();

        let SaveOutcome::Saved(created) = editor.save(&repo).await.unwrap() else {
            panic!("expected a save");
        };
        assert_ne!(created.id, draft_key);
        assert_eq!(editor.key(), created.id);
        assert!(!editor.is_dirty());
        assert_eq!(editor.save(&repo).await.unwrap(), SaveOutcome::NoOp);
    }

    #[tokio::test]
    async fn second_begin_save_rejected() {
        let mut editor = SessionEditor::new_draft(Ulid::new(), Ulid::new(), MADRID);
        let pending = editor.begin_save().unwrap().unwrap();
        assert!(editor.is_save_pending());
        assert!(matches!(editor.begin_save(), Err(EngineError::SaveInProgress(_))));

        let repo = InMemoryRepository::new();
        let result = repo.persist(pending.session_id, &pending.patch).await;
        editor.finish_save(pending, result).unwrap();
        assert!(!editor.is_save_pending());
    }

    #[tokio::test]
    async fn failed_save_keeps_form_and_snapshot() {
        let repo = InMemoryRepository::new();
        let deal = Ulid::new();
        let session = persisted(deal, "2024-05-10T09:00", "2024-05-10T11:00", &[]);
        // Not in the repository: the update fails with NotFound.
        let mut editor = SessionEditor::from_session(session.clone(), MADRID).unwrap();
        editor.form_mut().name = "Cambiado".into();

        let result = editor.save(&repo).await;
        assert!(matches!(result, Err(EngineError::Repository(RepositoryError::NotFound(_)))));
        assert_eq!(editor.form().name, "Cambiado");
        assert_eq!(editor.saved(), Some(&session));
        assert!(editor.is_dirty());
        assert!(!editor.is_save_pending());
    }

    #[tokio::test]
    async fn edits_during_flight_survive_success() {
        let deal = Ulid::new();
        let session = persisted(deal, "2024-05-10T09:00", "2024-05-10T11:00", &[]);
        let repo = InMemoryRepository::load(vec![session.clone()]);
        let mut editor = SessionEditor::from_session(session, MADRID).unwrap();

        editor.form_mut().name = "Primera".into();
        let pending = editor.begin_save().unwrap().unwrap();
        editor.form_mut().address = "Avenida Libertad 12".into();
        let result = repo.persist(pending.session_id, &pending.patch).await;
        editor.finish_save(pending, result).unwrap();

        assert_eq!(editor.saved().unwrap().name.as_deref(), Some("Primera"));
        assert_eq!(editor.form().address, "Avenida Libertad 12");
        let PatchOutcome::Patch(next) = build_patch(editor.form(), editor.saved(), MADRID).unwrap() else {
            panic!("expected the in-flight edit to remain");
        };
        assert_eq!(next.changed_fields(), vec!["address"]);
    }

    #[test]
    fn unrenderable_echo_still_replaces_snapshot() {
        let mut editor = SessionEditor::new_draft(Ulid::new(), Ulid::new(), MADRID);
        editor.form_mut().name = "Espacios confinados".into();
        let pending = editor.begin_save().unwrap().unwrap();
        let echo = Session {
            start: Some(Ms::MAX - 1),
            ..persisted(editor.form().deal_id, "2024-05-10T09:00", "2024-05-10T11:00", &[])
        };

        let result = editor.finish_save(pending, Ok(echo.clone()));
        assert!(matches!(result, Err(EngineError::Codec(CodecError::OutOfRange(_)))));
        assert_eq!(editor.saved(), Some(&echo));
        assert_eq!(editor.key(), echo.id);
        assert_eq!(editor.form().id, Some(echo.id));
        assert!(!editor.is_save_pending());
        assert!(editor.begin_save().is_ok());
    }

    #[tokio::test]
    async fn gated_save_makes_no_call() {
        let deal = Ulid::new();
        let mut session = persisted(deal, "2024-05-10T09:00", "2024-05-10T11:00", &[Ulid::new()]);
        session.state = SessionState::Scheduled;
        let repo = InMemoryRepository::load(vec![session.clone()]);
        let mut editor = SessionEditor::from_session(session.clone(), MADRID).unwrap();
        editor.form_mut().trainer_ids.clear();

        assert!(matches!(editor.save(&repo).await, Err(EngineError::NotPlanifiable(_))));
        assert_eq!(repo.get_session(&session.id).await.unwrap(), session);
        assert!(!editor.is_save_pending());
    }

    #[tokio::test]
    async fn validation_error_blocks_save() {
        let repo = InMemoryRepository::new();
        let mut editor = SessionEditor::new_draft(Ulid::new(), Ulid::new(), MADRID);
        editor.form_mut().start_local = "2024-05-10T12:00".into();
        editor.form_mut().end_local = "2024-05-10T10:00".into();
        let err = editor.save(&repo).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::InvalidRange)));
        assert!(err.is_validation());
        assert_eq!(repo.session_count(), 0);
    }

    #[test]
    fn close_discard_reverts() {
        let session = persisted(Ulid::new(), "2024-05-10T09:00", "2024-05-10T11:00", &[]);
        let mut editor = SessionEditor::from_session(session, MADRID).unwrap();
        editor.form_mut().name = "Sin guardar".into();

        assert!(!editor.close(CloseDecision::Keep));
        assert_eq!(editor.form().name, "Sin guardar");
        assert!(editor.close(CloseDecision::Discard));
        assert_eq!(editor.form().name, "PRL básico");
        assert!(!editor.is_dirty());
    }

    #[test]
    fn duplicate_editor_is_unsaved_draft() {
        let mut session = persisted(Ulid::new(), "2024-05-10T09:00", "2024-05-10T11:00", &[]);
        session.state = SessionState::Scheduled;
        let editor = SessionEditor::duplicate_of(&session, MADRID).unwrap();
        assert_eq!(editor.form().state, SessionState::Draft);
        assert!(editor.saved().is_none());
        assert!(editor.is_dirty());
    }
}
