//! Command implementations: migrate, status, verify, reset, rollback.

pub mod migrate;
pub mod reset;
pub mod rollback;
pub mod status;
pub mod verify;
