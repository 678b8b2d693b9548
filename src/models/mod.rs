//! Core data models for the ephemeral drop service.
//!
//! Rows map to the `drops` table via `sqlx::FromRow`.

pub mod drop_record;
