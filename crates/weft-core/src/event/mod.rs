//! Event distribution for workflow execution.

pub mod bus;

pub use bus::EventBus;
