// Trading strategy module
pub mod signals;

pub use signals::{minute_bucket, SignalGenerator};
