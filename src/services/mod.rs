//! Scheduling pipeline services

pub mod cooldown;
pub mod evaluator;
pub mod guard;
pub mod orchestrator;
pub mod selection;
