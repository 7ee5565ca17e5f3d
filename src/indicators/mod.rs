// Technical indicators module
// Incremental SMA and ATR trackers feeding the crossover engine

pub mod atr;
pub mod moving_average;
pub mod trend;

pub use atr::AtrTracker;
pub use moving_average::SmaTracker;
pub use trend::IndicatorEngine;
