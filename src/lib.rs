//! # bpfsync
//!
//! Command-line front end for the eBPF program reconciler: configuration,
//! CLI definitions and command handlers. The engine lives in
//! [`bpfsync_reconciler`]; the daemon protocol in [`bpfsync_daemon`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cli;
pub mod commands;
pub mod config;

pub use bpfsync_core;
pub use bpfsync_daemon;
pub use bpfsync_reconciler;
