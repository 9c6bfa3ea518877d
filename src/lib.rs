//! Indicator scheduler library exports

pub mod buffer;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod tasks;
