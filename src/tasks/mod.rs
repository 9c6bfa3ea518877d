//! Background tasks

pub mod dispatch;
pub mod reaper;
pub mod scheduler;
