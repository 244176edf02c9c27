//! Workflow engine core: definition parsing, graph resolution, and
//! level-by-level execution with durable checkpointing.
//!
//! This module contains the "brain" of the workflow engine:
//! - `definition` -- YAML/JSON parsing, fail-fast validation, filesystem load/save
//! - `validate` -- advisory validation returning the full issue list
//! - `graph` -- dependency graph resolver: cycle detection, topological levels
//! - `context` -- execution context with step output tracking and templating
//! - `state` -- execution state machine with an explicit transition table
//! - `retry` -- per-step retry policy evaluation with exponential backoff
//! - `step` -- the external step-executor capability contract
//! - `checkpoint` -- checkpoint service for pause/resume and crash recovery
//! - `engine` -- the level-by-level workflow engine

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod engine;
pub mod graph;
pub mod retry;
pub mod state;
pub mod step;
pub mod validate;
