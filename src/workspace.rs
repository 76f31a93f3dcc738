//! All editors of one deal, kept consistent with each other.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::editor::{EditorView, SaveOutcome, SessionEditor, fetch_remote, recompute};
use crate::engine::EngineError;
use crate::engine::availability::{OptionState, RemoteAvailability, option_state, reconcile_room};
use crate::engine::conflict::Commitment;
use crate::engine::lifecycle::duplicate_form;
use crate::model::*;
use crate::observability;
use crate::repository::{AvailabilitySource, SessionRepository, SiblingSnapshot};

pub struct DealWorkspace {
    deal_id: Ulid,
    version: u64,
    /// In display order. Unsaved drafts keep their local key.
    editors: Vec<SessionEditor>,
    /// Last remote answer per editor key.
    remote: HashMap<Ulid, RemoteAvailability>,
    config: EngineConfig,
}

impl DealWorkspace {
    pub async fn load<R: SessionRepository + ?Sized>(
        repo: &R,
        deal_id: Ulid,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let snapshot = repo.fetch_sibling_sessions(deal_id).await?;
        Self::from_snapshot(snapshot, config)
    }

    pub fn from_snapshot(snapshot: SiblingSnapshot, config: EngineConfig) -> Result<Self, EngineError> {
        let editors = snapshot
            .sessions
            .into_iter()
            .map(|s| SessionEditor::from_session(s, config.timezone))
            .collect::<Result<Vec<_>, _>>()?;
        info!(deal = %snapshot.deal_id, version = snapshot.version, sessions = editors.len(), "deal workspace loaded");
        Ok(Self {
            deal_id: snapshot.deal_id,
            version: snapshot.version,
            editors,
            remote: HashMap::new(),
            config,
        })
    }

    pub fn deal_id(&self) -> Ulid {
        self.deal_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn editors(&self) -> &[SessionEditor] {
        &self.editors
    }

    pub fn editor(&self, key: Ulid) -> Option<&SessionEditor> {
        self.editors.iter().find(|e| e.key() == key)
    }

    pub fn editor_mut(&mut self, key: Ulid) -> Result<&mut SessionEditor, EngineError> {
        self.editors
            .iter_mut()
            .find(|e| e.key() == key)
            .ok_or(EngineError::UnknownSession(key))
    }

    fn position(&self, key: Ulid) -> Result<usize, EngineError> {
        self.editors
            .iter()
            .position(|e| e.key() == key)
            .ok_or(EngineError::UnknownSession(key))
    }

    /// Labels in display order, numbering unnamed sessions from 1.
    pub fn display_names(&self) -> Vec<(Ulid, String)> {
        self.editors
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key(), e.form().display_name(i + 1)))
            .collect()
    }

    pub fn add_draft(&mut self, deal_product_id: Ulid) -> Ulid {
        let editor = SessionEditor::new_draft(self.deal_id, deal_product_id, self.config.timezone);
        let key = editor.key();
        self.editors.push(editor);
        key
    }

    /// Unsaved DRAFT copy of what `key` shows, placed right after it.
    pub fn duplicate(&mut self, key: Ulid) -> Result<Ulid, EngineError> {
        let index = self.position(key)?;
        let copy = duplicate_form(self.editors[index].form());
        let copy_key = copy.key;
        self.editors
            .insert(index + 1, SessionEditor::from_form(copy, self.config.timezone));
        debug!(source = %key, copy = %copy_key, "session duplicated");
        Ok(copy_key)
    }

    /// Every sibling as currently on screen, read in one pass.
    pub fn commitments(&self) -> Vec<Commitment> {
        self.editors.iter().map(SessionEditor::commitment).collect()
    }

    pub fn recompute(&self, key: Ulid) -> Result<EditorView, EngineError> {
        let editor = self.editor(key).ok_or(EngineError::UnknownSession(key))?;
        let siblings = self.commitments();
        let remote = self.remote.get(&key).unwrap_or(&RemoteAvailability::NotRequested);
        Ok(recompute(
            editor.form(),
            editor.saved(),
            &siblings,
            remote,
            &self.config.exempt_unit_ids,
            self.config.timezone,
        ))
    }

    /// Selector state for one candidate resource of `key`.
    pub fn option_state(&self, key: Ulid, kind: ResourceKind, id: &Ulid) -> Result<OptionState, EngineError> {
        let view = self.recompute(key)?;
        let target = self.editor(key).ok_or(EngineError::UnknownSession(key))?.commitment();
        Ok(option_state(kind, id, &view.blocked, &target))
    }

    /// Ask `source` about the current range of `key`, then recompute.
    pub async fn refresh_availability<A: AvailabilitySource + ?Sized>(
        &mut self,
        key: Ulid,
        source: &A,
    ) -> Result<EditorView, EngineError> {
        let editor = self.editor(key).ok_or(EngineError::UnknownSession(key))?;
        let span = editor.commitment().span;
        let exclude = editor.saved().map(|s| s.id);
        let remote = fetch_remote(source, span, exclude, self.config.availability_timeout).await;
        self.remote.insert(key, remote);
        self.recompute(key)
    }

    /// Clear rooms the catalog no longer lists. Returns the touched keys.
    pub fn reconcile_rooms(&mut self, room_catalog: &ResourceSet) -> Vec<Ulid> {
        self.editors
            .iter_mut()
            .filter_map(|e| reconcile_room(e.form_mut(), room_catalog).then(|| e.key()))
            .collect()
    }

    pub async fn save<R: SessionRepository + ?Sized>(&mut self, key: Ulid, repo: &R) -> Result<SaveOutcome, EngineError> {
        let outcome = self.editor_mut(key)?.save(repo).await?;
        if let SaveOutcome::Saved(session) = &outcome
            && session.id != key
            && let Some(remote) = self.remote.remove(&key)
        {
            // A created draft takes the server id as its key.
            self.remote.insert(session.id, remote);
        }
        Ok(outcome)
    }

    /// Persisted sessions are deleted remotely first; the editor goes away
    /// only if that succeeds. Unsaved drafts are dropped locally.
    pub async fn delete<R: SessionRepository + ?Sized>(&mut self, key: Ulid, repo: &R) -> Result<(), EngineError> {
        let index = self.position(key)?;
        if let Some(id) = self.editors[index].saved().map(|s| s.id) {
            repo.delete(id).await?;
        }
        self.editors.remove(index);
        self.remote.remove(&key);
        info!(session = %key, deal = %self.deal_id, "session removed from deal");
        Ok(())
    }

    /// Merge a newer sibling snapshot. Older snapshots are refused; dirty
    /// forms are kept; sessions gone from the server are dropped.
    pub fn apply_refresh(&mut self, snapshot: SiblingSnapshot) -> Result<(), EngineError> {
        if snapshot.version < self.version {
            metrics::counter!(observability::STALE_SNAPSHOTS_TOTAL).increment(1);
            return Err(EngineError::StaleSnapshot {
                current: self.version,
                received: snapshot.version,
            });
        }
        if snapshot.version == self.version {
            return Ok(());
        }

        // Build the whole new set first; nothing changes unless all of it
        // renders.
        let mut incoming: HashMap<Ulid, Session> = snapshot.sessions.iter().map(|s| (s.id, s.clone())).collect();
        let mut editors = Vec::with_capacity(snapshot.sessions.len());
        let mut dropped = Vec::new();
        for editor in &self.editors {
            let Some(id) = editor.saved().map(|s| s.id) else {
                editors.push(editor.clone());
                continue;
            };
            match incoming.remove(&id) {
                Some(session) => {
                    let mut editor = editor.clone();
                    editor.rebase(session)?;
                    editors.push(editor);
                }
                None => {
                    if editor.is_dirty() {
                        warn!(session = %id, "session deleted remotely; dropping unsaved edits");
                    }
                    dropped.push(id);
                }
            }
        }
        // New sessions keep the server's order.
        for session in snapshot.sessions {
            if let Some(session) = incoming.remove(&session.id) {
                editors.push(SessionEditor::from_session(session, self.config.timezone)?);
            }
        }

        debug!(deal = %self.deal_id, from = self.version, to = snapshot.version, "sibling snapshot applied");
        for id in dropped {
            self.remote.remove(&id);
        }
        self.editors = editors;
        self.version = snapshot.version;
        Ok(())
    }
}
