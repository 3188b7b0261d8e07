//! Resumable, checkpointed pipeline runner for cairn.
//!
//! A pipeline is an ordered list of named stages acting on a collection of
//! work units. After every stage that completes, the runner persists a
//! single-slot checkpoint; a later run may resume after the last completed
//! stage when the caller's [`CheckpointProtocol`] trusts that checkpoint.

pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod options;
pub mod protocol;
pub mod resume;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod state;
pub mod vcs;
pub mod work_unit;

pub use checkpoint::*;
pub use errors::*;
pub use events::*;
pub use options::*;
pub use protocol::*;
pub use resume::*;
pub use runner::*;
pub use stage::*;
pub use state::*;
pub use vcs::*;
pub use work_unit::*;
