//! Centralized constants for the lease-lock workspace.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod lock;
pub mod paths;
pub mod state;
