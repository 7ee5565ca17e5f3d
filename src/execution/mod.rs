// Market data intake, order execution and position tracking
pub mod executor;
pub mod feed_buffer;
pub mod market_feed;
pub mod position_state;

pub use executor::{CloseReport, ExecutionOutcome, OrderExecutor};
pub use feed_buffer::FeedBuffer;
pub use market_feed::MarketDataFeed;
pub use position_state::{EntryRecord, PositionPhase, PositionStateMachine};
