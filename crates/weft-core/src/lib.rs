//! Orchestration core and repository trait definitions for Weft.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the full orchestration core: dependency graph
//! resolution, validation, the execution state machine, templating,
//! checkpointing, and the level-by-level workflow engine. It depends only on
//! `weft-types` -- never on `weft-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
