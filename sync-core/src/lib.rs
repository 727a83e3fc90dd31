//! # sync-core
//!
//! Pure logic for the Tether sync engine (no I/O, instant tests).
//!
//! This crate implements the ordering rules and state transitions of the
//! sync engine and the relationship handshake without any network, disk or
//! crypto, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (backbone calls, stores, secrets) is performed by
//! `sync-client`, which applies the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod outbox;
pub mod plan;
pub mod relationship;
pub mod slot;
pub mod template;

pub use index::{IndexError, IndexTracker};
pub use outbox::{Outbox, QueuedModification};
pub use plan::{merge_shallow, CacheRefresh, MergedCreate, ModificationPlan};
pub use relationship::{
    creation_step, CompletionTarget, CreationStep, RelationshipTransitions, TransitionError,
};
pub use slot::{SlotDecision, SlotState, SyncSlot};
pub use template::{
    ensure_usable, expiry_after, TemplateError, TemplateReference, DEFAULT_TEMPLATE_TTL,
};
