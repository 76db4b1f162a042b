//! Core types, errors, and utilities shared across bpfsync crates.
//!
//! - [`ProgramSpec`] describes a desired program; [`LogicalIdentity`] names it
//!   stably, [`KernelId`] names its current kernel incarnation.
//! - [`Error`] is the single failure taxonomy used by the daemon client and the
//!   reconciler.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod program_type;
pub mod result;
pub mod types;

pub use error::Error;
pub use program_type::ProgramType;
pub use result::{Result, ResultExt};
pub use types::{
    BytecodeImage, BytecodeSource, IDENTITY_METADATA_KEY, KernelId, LogicalIdentity, MapTable,
    ProgramSpec, PullPolicy, SecretRef,
};
