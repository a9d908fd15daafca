//! Progress synchronization between the local cache, optimistic local
//! edits, and the remote store's live subscription.
//!
//! Conflict rule: a snapshot from the remote store always replaces the local
//! value. Plans deleted through the coordinator are tombstoned and never come
//! back; plans that merely vanish from a snapshot can reappear in a later one.

pub mod cache_codec;
mod coordinator;
mod state;

pub use cache_codec::CachedProgress;
pub use coordinator::SyncCoordinator;
pub use state::{
    MutationOutcome, PlanPhase, PlanStatus, PlansObserver, ProgressObserver, ProgressUpdate,
    TimerObserver, TimerOutcome, TimerView,
};
