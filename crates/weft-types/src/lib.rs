//! Shared domain types for Weft.
//!
//! This crate contains the core domain types used across the Weft workflow
//! engine: workflow definitions, execution records, checkpoints, events,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
