//! Relationship state transitions for Tether.
//!
//! A relationship leaves `Pending` exactly once, when its creation change is
//! completed. The change's response and status and the relationship's status
//! are updated together by [`RelationshipTransitions::complete_change`]; on
//! any error nothing is modified.
//!
//! ```text
//! Pending ──accept──► Active
//!         ──reject──► Rejected
//!         ──revoke──► Revoked
//! ```
//!
//! The network side (encrypting, signing and submitting the response) is
//! performed by sync-client; this module only decides whether a transition
//! is allowed and applies it.

use thiserror::Error;
use tether_sync_types::{
    Relationship, RelationshipChange, RelationshipChangeId, RelationshipChangeMessage,
    RelationshipChangeStatus, RelationshipChangeType, RelationshipId, RelationshipStatus,
};

/// Errors for relationship transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The relationship's cache has not been hydrated.
    #[error("relationship {relationship_id} has no cache")]
    CacheEmpty {
        /// The relationship
        relationship_id: RelationshipId,
    },

    /// No change with the given id is cached for the relationship.
    #[error("change {change_id} not found on relationship {relationship_id}")]
    ChangeNotFound {
        /// The relationship
        relationship_id: RelationshipId,
        /// The missing change
        change_id: RelationshipChangeId,
    },

    /// The change was already completed.
    #[error("change {change_id} is {status:?}, expected Pending")]
    WrongChangeStatus {
        /// The change
        change_id: RelationshipChangeId,
        /// Its current status
        status: RelationshipChangeStatus,
    },

    /// Only creation changes can be completed.
    #[error("change {change_id} has type {change_type:?}, expected Creation")]
    WrongChangeType {
        /// The change
        change_id: RelationshipChangeId,
        /// Its type
        change_type: RelationshipChangeType,
    },

    /// The relationship already left Pending.
    #[error("relationship {relationship_id} is {status:?}, expected Pending")]
    WrongRelationshipStatus {
        /// The relationship
        relationship_id: RelationshipId,
        /// Its current status
        status: RelationshipStatus,
    },
}

/// Terminal state a creation change is completed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionTarget {
    /// Templator accepted; relationship becomes Active.
    Accepted,
    /// Templator rejected; relationship becomes Rejected.
    Rejected,
    /// Requester revoked; relationship becomes Revoked.
    Revoked,
}

impl CompletionTarget {
    /// Change status after completion.
    pub fn change_status(&self) -> RelationshipChangeStatus {
        match self {
            Self::Accepted => RelationshipChangeStatus::Accepted,
            Self::Rejected => RelationshipChangeStatus::Rejected,
            Self::Revoked => RelationshipChangeStatus::Revoked,
        }
    }

    /// Relationship status after completion.
    pub fn relationship_status(&self) -> RelationshipStatus {
        match self {
            Self::Accepted => RelationshipStatus::Active,
            Self::Rejected => RelationshipStatus::Rejected,
            Self::Revoked => RelationshipStatus::Revoked,
        }
    }

    /// Target matching a completed change status; `None` for Pending.
    pub fn from_change_status(status: RelationshipChangeStatus) -> Option<Self> {
        match status {
            RelationshipChangeStatus::Pending => None,
            RelationshipChangeStatus::Accepted => Some(Self::Accepted),
            RelationshipChangeStatus::Rejected => Some(Self::Rejected),
            RelationshipChangeStatus::Revoked => Some(Self::Revoked),
        }
    }
}

/// What to do with an incoming creation change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStep {
    /// No local relationship yet: create it, and apply the response right
    /// away if the change already carries one.
    Create {
        /// The change already carries a response
        apply_response: bool,
    },
    /// Local relationship is Pending and the change carries a response.
    ApplyResponse,
    /// Already terminal, or nothing new to apply.
    Ignore,
}

/// Decide how an incoming creation change affects local state.
///
/// Re-delivery of a change that was already applied yields `Ignore`.
pub fn creation_step(local: Option<&Relationship>, has_response: bool) -> CreationStep {
    match local {
        None => CreationStep::Create {
            apply_response: has_response,
        },
        Some(rel) if rel.status == RelationshipStatus::Pending && has_response => {
            CreationStep::ApplyResponse
        }
        Some(_) => CreationStep::Ignore,
    }
}

/// Transition operations on a [`Relationship`].
pub trait RelationshipTransitions {
    /// Check that `change_id` can be completed and return it.
    fn completable_change(
        &self,
        change_id: &RelationshipChangeId,
    ) -> Result<&RelationshipChange, TransitionError>;

    /// Set the change's response and status and the relationship's status.
    fn complete_change(
        &mut self,
        change_id: &RelationshipChangeId,
        target: CompletionTarget,
        response: RelationshipChangeMessage,
    ) -> Result<(), TransitionError>;
}

impl RelationshipTransitions for Relationship {
    fn completable_change(
        &self,
        change_id: &RelationshipChangeId,
    ) -> Result<&RelationshipChange, TransitionError> {
        let cache = self.cache.as_ref().ok_or_else(|| TransitionError::CacheEmpty {
            relationship_id: self.id.clone(),
        })?;
        let change = cache
            .changes
            .iter()
            .find(|c| &c.id == change_id)
            .ok_or_else(|| TransitionError::ChangeNotFound {
                relationship_id: self.id.clone(),
                change_id: change_id.clone(),
            })?;

        if change.status != RelationshipChangeStatus::Pending {
            return Err(TransitionError::WrongChangeStatus {
                change_id: change.id.clone(),
                status: change.status,
            });
        }
        if change.change_type != RelationshipChangeType::Creation {
            return Err(TransitionError::WrongChangeType {
                change_id: change.id.clone(),
                change_type: change.change_type,
            });
        }
        if self.status != RelationshipStatus::Pending {
            return Err(TransitionError::WrongRelationshipStatus {
                relationship_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(change)
    }

    fn complete_change(
        &mut self,
        change_id: &RelationshipChangeId,
        target: CompletionTarget,
        response: RelationshipChangeMessage,
    ) -> Result<(), TransitionError> {
        self.completable_change(change_id)?;

        if let Some(change) = self
            .cache
            .as_mut()
            .and_then(|cache| cache.changes.iter_mut().find(|c| &c.id == change_id))
        {
            change.status = target.change_status();
            change.response = Some(response);
        }
        self.status = target.relationship_status();
        Ok(())
    }
}
