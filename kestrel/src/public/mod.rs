//! The scheduler-facing API: plan types, checkpoints, their storage, and the simulation driver.

pub mod checkpoint;
pub mod config;
pub mod directive;
pub mod error;
pub mod facade;
pub mod model;
pub mod predicate;
pub mod simulation;
pub mod store;
