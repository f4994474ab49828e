#![deny(missing_docs)]
//! The server manager: everything around the pipeline that is not in the
//! frame path.
//!
//! Three long-lived pieces run in this process:
//!
//! * the saved-action writer (see [`saved_actions`]) persisting audit
//!   snapshots to object storage, with a local-directory fallback;
//! * the admin HTTP surface (see [`admin`]) over the client-status
//!   snapshot;
//! * the file-ops worker (see [`file_ops`]) mirroring the snapshot to JSON
//!   files for tooling without broker or Redis access, and recomputing the
//!   deactivated set.

pub mod admin;
pub mod config;
pub mod file_ops;
pub mod metrics;
pub mod saved_actions;
