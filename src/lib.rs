// Core modules
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use broker::Broker;
pub use crate::config::AppConfig;
pub use engine::{CycleOutcome, EngineEvent, TradingEngine};
pub use error::{EngineError, Result};
pub use models::*;
