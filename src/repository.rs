//! Boundary contracts with the persistence and availability collaborators,
//! plus an in-memory implementation of both.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::lifecycle::session_is_planifiable;
use crate::engine::patch::{Field, Patch};
use crate::engine::range::session_range;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("session {0} cannot move to another deal or deal product")]
    OwnerChanged(Ulid),
    #[error("illegal transition for session {id}: {from} -> {to}")]
    IllegalTransition {
        id: Ulid,
        from: SessionState,
        to: SessionState,
    },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Every session of one deal, read at a single version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingSnapshot {
    pub deal_id: Ulid,
    pub version: u64,
    pub sessions: Vec<Session>,
}

#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Resources committed anywhere to a session overlapping `span`,
    /// leaving out `exclude_session_id`.
    async fn fetch_availability(
        &self,
        span: Span,
        exclude_session_id: Option<Ulid>,
    ) -> Result<BlockedResources, RepositoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn fetch_sibling_sessions(&self, deal_id: Ulid) -> Result<SiblingSnapshot, RepositoryError>;

    /// Create when `session_id` is `None`, otherwise update. Returns the
    /// authoritative stored session.
    async fn persist(&self, session_id: Option<Ulid>, patch: &Patch) -> Result<Session, RepositoryError>;

    async fn delete(&self, session_id: Ulid) -> Result<(), RepositoryError>;
}

// ── In-memory implementation ──────────────────────────────────────

#[derive(Debug, Default)]
pub struct DealState {
    pub version: u64,
    pub sessions: Vec<Session>,
}

pub type SharedDealState = Arc<RwLock<DealState>>;

/// Holds its own invariants independently of any client: valid ranges,
/// the planifiable gate for SCHEDULED, fixed ownership.
pub struct InMemoryRepository {
    deals: DashMap<Ulid, SharedDealState>,
    /// Reverse lookup: session id → deal id
    session_to_deal: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            deals: DashMap::new(),
            session_to_deal: DashMap::new(),
        }
    }

    /// Seed with already persisted sessions. No invariant checks.
    pub fn load(sessions: Vec<Session>) -> Self {
        let repo = Self::new();
        let mut by_deal: std::collections::HashMap<Ulid, DealState> = std::collections::HashMap::new();
        for session in sessions {
            repo.session_to_deal.insert(session.id, session.deal_id);
            by_deal.entry(session.deal_id).or_default().sessions.push(session);
        }
        for (deal_id, state) in by_deal {
            repo.deals.insert(deal_id, Arc::new(RwLock::new(state)));
        }
        repo
    }

    pub fn session_count(&self) -> usize {
        self.session_to_deal.len()
    }

    fn get_deal(&self, deal_id: &Ulid) -> Option<SharedDealState> {
        self.deals.get(deal_id).map(|e| e.value().clone())
    }

    fn deal_for_session(&self, session_id: &Ulid) -> Result<SharedDealState, RepositoryError> {
        let deal_id = self
            .session_to_deal
            .get(session_id)
            .map(|e| *e.value())
            .ok_or(RepositoryError::NotFound(*session_id))?;
        self.get_deal(&deal_id).ok_or(RepositoryError::NotFound(deal_id))
    }

    pub async fn get_session(&self, session_id: &Ulid) -> Option<Session> {
        let deal = self.deal_for_session(session_id).ok()?;
        let guard = deal.read().await;
        guard.sessions.iter().find(|s| s.id == *session_id).cloned()
    }

    async fn create(&self, patch: &Patch) -> Result<Session, RepositoryError> {
        let (Field::Value(deal_id), Field::Value(deal_product_id)) = (&patch.deal_id, &patch.deal_product_id) else {
            return Err(RepositoryError::Rejected("create needs deal and deal product".into()));
        };
        let mut session = Session {
            id: Ulid::new(),
            deal_id: *deal_id,
            deal_product_id: *deal_product_id,
            name: None,
            start: None,
            end: None,
            room_id: None,
            address: None,
            state: SessionState::Draft,
            trainer_ids: ResourceSet::new(),
            mobile_unit_ids: ResourceSet::new(),
            drive_url: None,
        };
        patch.apply(&mut session);
        check_stored(&session, SessionState::Draft)?;

        let deal = self.deals.entry(*deal_id).or_default().value().clone();
        let mut guard = deal.write().await;
        guard.sessions.push(session.clone());
        guard.version += 1;
        self.session_to_deal.insert(session.id, *deal_id);
        debug!(session = %session.id, deal = %deal_id, "session created");
        Ok(session)
    }

    async fn update(&self, session_id: Ulid, patch: &Patch) -> Result<Session, RepositoryError> {
        let deal = self.deal_for_session(&session_id)?;
        let mut guard = deal.write().await;
        let slot = guard
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or(RepositoryError::NotFound(session_id))?;

        let moves_deal = matches!(patch.deal_id, Field::Value(id) if id != slot.deal_id);
        let moves_product = matches!(patch.deal_product_id, Field::Value(id) if id != slot.deal_product_id);
        if moves_deal || moves_product {
            return Err(RepositoryError::OwnerChanged(session_id));
        }

        let mut updated = slot.clone();
        patch.apply(&mut updated);
        check_stored(&updated, slot.state)?;
        *slot = updated.clone();
        guard.version += 1;
        debug!(session = %session_id, fields = ?patch.changed_fields(), "session updated");
        Ok(updated)
    }
}

fn check_stored(session: &Session, previous: SessionState) -> Result<(), RepositoryError> {
    if let (Some(start), Some(end)) = (session.start, session.end)
        && end < start
    {
        return Err(RepositoryError::Rejected("end before start".into()));
    }
    if session.state == SessionState::Scheduled && !session_is_planifiable(session) {
        warn!(session = %session.id, "refusing SCHEDULED for a session that is not planifiable");
        return Err(RepositoryError::IllegalTransition {
            id: session.id,
            from: previous,
            to: SessionState::Scheduled,
        });
    }
    Ok(())
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn fetch_sibling_sessions(&self, deal_id: Ulid) -> Result<SiblingSnapshot, RepositoryError> {
        let Some(deal) = self.get_deal(&deal_id) else {
            return Ok(SiblingSnapshot {
                deal_id,
                version: 0,
                sessions: Vec::new(),
            });
        };
        let guard = deal.read().await;
        Ok(SiblingSnapshot {
            deal_id,
            version: guard.version,
            sessions: guard.sessions.clone(),
        })
    }

    async fn persist(&self, session_id: Option<Ulid>, patch: &Patch) -> Result<Session, RepositoryError> {
        match session_id {
            None => self.create(patch).await,
            Some(id) => self.update(id, patch).await,
        }
    }

    async fn delete(&self, session_id: Ulid) -> Result<(), RepositoryError> {
        let deal = self.deal_for_session(&session_id)?;
        let mut guard = deal.write().await;
        let before = guard.sessions.len();
        guard.sessions.retain(|s| s.id != session_id);
        if guard.sessions.len() == before {
            return Err(RepositoryError::NotFound(session_id));
        }
        guard.version += 1;
        self.session_to_deal.remove(&session_id);
        debug!(session = %session_id, "session deleted");
        Ok(())
    }
}

#[async_trait]
impl AvailabilitySource for InMemoryRepository {
    async fn fetch_availability(
        &self,
        span: Span,
        exclude_session_id: Option<Ulid>,
    ) -> Result<BlockedResources, RepositoryError> {
        // Collect the Arcs first so no map guard is held across an await.
        let deals: Vec<SharedDealState> = self.deals.iter().map(|e| e.value().clone()).collect();
        let mut blocked = BlockedResources::default();
        for deal in deals {
            let guard = deal.read().await;
            for session in &guard.sessions {
                if Some(session.id) == exclude_session_id {
                    continue;
                }
                let Some(range) = session_range(session) else { continue };
                if !range.overlaps(&span) {
                    continue;
                }
                blocked.trainers.extend(session.trainer_ids.iter().copied());
                blocked.rooms.extend(session.room_id);
                blocked.units.extend(session.mobile_unit_ids.iter().copied());
            }
        }
        Ok(blocked)
    }
}
