#![deny(missing_docs)]
//! Shared plumbing for vigil services.
//!
//! Every long-lived vigil process composes the same ambient pieces: a sizing
//! profile (see [`profile`]), tracing initialization (see [`observability`]),
//! a cancellation-token based shutdown path (see [`shutdown`]), readiness
//! flags with a `/health` route (see [`health`]), and access to the enrolment
//! directory (see [`users`]). Binaries wire these together at their
//! composition root and inject them into the service structs; nothing in this
//! crate is a process-wide singleton.

use clap::ValueEnum;

pub mod health;
pub mod observability;
pub mod profile;
pub mod shutdown;
pub mod users;

/// The environment the service is running in.
///
/// Main usage is to call [`Environment::assert_is_dev`]. Conveniences that
/// are intended for `dev` only (static storage credentials, path-style
/// endpoints for the local emulator, ...) shall assert that they are called
/// from the `dev` environment.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Environment {
    /// Production environment.
    Prod,
    /// Development environment.
    Dev,
}

impl Environment {
    /// Asserts that `Environment` is `dev`. Panics if not the case.
    pub fn assert_is_dev(&self) {
        assert!(matches!(self, Environment::Dev), "Is not dev environment")
    }
}
