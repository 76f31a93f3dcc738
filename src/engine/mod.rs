//! Pure scheduling rules: ranges, overlap locks, availability merging,
//! the lifecycle gate and patch construction. Nothing here does I/O.

pub mod availability;
pub mod conflict;
mod error;
pub mod lifecycle;
pub mod patch;
pub mod range;

pub use availability::{RemoteAvailability, compute_blocked, option_state};
pub use conflict::{Commitment, compute_local_locks};
pub use error::{EngineError, ValidationError};
pub use lifecycle::{can_transition, is_planifiable};
pub use patch::{Field, Patch, PatchOutcome, build_patch};
pub use range::{derive_range, overlaps};
