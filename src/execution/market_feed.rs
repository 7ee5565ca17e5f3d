use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::FeedBuffer;
use crate::broker::Broker;
use crate::config::FeedConfig;
use crate::error::{EngineError, Result};
use crate::models::{Bar, Timeframe};

/// Polls the broker in a background task and publishes new bars
///
/// In tick mode every new quote becomes a degenerate bar. Items are only
/// accepted when strictly newer than the last accepted one.
pub struct MarketDataFeed {
    broker: Arc<dyn Broker>,
    config: FeedConfig,
    buffer: FeedBuffer,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Newest preloaded bar; anything at or before it is history
    history_until: Option<DateTime<Utc>>,
}

/// State owned by the polling task
struct FeedPoller {
    broker: Arc<dyn Broker>,
    symbol: String,
    timeframe: Timeframe,
    tick_mode: bool,
    buffer: FeedBuffer,
    last_accepted: Option<DateTime<Utc>>,
}

impl FeedPoller {
    /// One poll iteration; Ok(true) when a new item was published
    async fn poll_once(&mut self) -> Result<bool> {
        let candidate = if self.tick_mode {
            self.broker
                .fetch_latest_tick(&self.symbol)
                .await?
                .map(|tick| tick.to_bar())
        } else {
            self.broker
                .fetch_recent_bars(&self.symbol, self.timeframe, 2)
                .await?
                .pop()
        };

        let Some(bar) = candidate else {
            return Err(EngineError::DataUnavailable(format!(
                "no {} returned for {}",
                if self.tick_mode { "tick" } else { "bar" },
                self.symbol
            )));
        };

        if self.last_accepted.is_some_and(|last| bar.timestamp <= last) {
            return Ok(false);
        }

        self.last_accepted = Some(bar.timestamp);
        if !self.tick_mode {
            tracing::info!(
                symbol = %self.symbol,
                time = %bar.timestamp,
                "📊 New bar: O={:.2} H={:.2} L={:.2} C={:.2}",
                bar.open,
                bar.high,
                bar.low,
                bar.close
            );
        }
        if self.buffer.push(bar) {
            tracing::debug!(
                dropped = self.buffer.dropped(),
                "Feed buffer full, dropped oldest bar"
            );
        }

        Ok(true)
    }

    async fn run(mut self, stop: Arc<AtomicBool>, interval: Duration) {
        tracing::info!(symbol = %self.symbol, "📡 Feed task running");

        while !stop.load(Ordering::Acquire) {
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::trace!(error = %e, "Poll miss, retrying next interval");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed, retrying next interval");
                }
            }
            tokio::time::sleep(interval).await;
        }

        // Let a consumer blocked on the buffer notice the shutdown
        self.buffer.wake();
        tracing::info!(symbol = %self.symbol, "📡 Feed task exiting");
    }
}

impl MarketDataFeed {
    /// Create a new feed; nothing is fetched until `start`
    pub fn new(broker: Arc<dyn Broker>, config: FeedConfig) -> Self {
        let buffer = FeedBuffer::new(config.buffer_capacity);
        Self {
            broker,
            config,
            buffer,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            history_until: None,
        }
    }

    /// Preload the warm-up window and spawn the polling task
    ///
    /// Calling `start` on a running feed is a no-op.
    pub async fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let last_accepted = self.preload_history().await;
        self.history_until = last_accepted;

        self.stop.store(false, Ordering::Release);
        let poller = FeedPoller {
            broker: self.broker.clone(),
            symbol: self.config.symbol.clone(),
            timeframe: self.config.timeframe,
            tick_mode: self.config.tick_mode,
            buffer: self.buffer.clone(),
            last_accepted,
        };
        let stop = self.stop.clone();
        let interval = self.config.poll_interval();

        self.handle = Some(tokio::spawn(poller.run(stop, interval)));
        let mode = if self.config.tick_mode { "tick" } else { "bar" };
        tracing::info!(
            symbol = %self.config.symbol,
            mode,
            timeframe = %self.config.timeframe,
            "🚀 Live data feed started"
        );
    }

    /// Load `warmup_days` of history into the buffer
    ///
    /// Returns the newest preloaded timestamp, used as the dedup watermark.
    async fn preload_history(&self) -> Option<DateTime<Utc>> {
        if self.config.warmup_days <= 0 {
            tracing::info!("warmup_days <= 0, skipping history load");
            return None;
        }

        let end = Utc::now();
        let start = end - ChronoDuration::days(self.config.warmup_days);
        let bars = match self
            .broker
            .fetch_historical_range(&self.config.symbol, self.config.timeframe, start, end)
            .await
        {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => {
                tracing::warn!(symbol = %self.config.symbol, "No historical data returned");
                return None;
            }
            Err(e) => {
                tracing::warn!(symbol = %self.config.symbol, error = %e, "Failed to load historical data");
                return None;
            }
        };

        let count = bars.len();
        let newest = bars.iter().map(|b| b.timestamp).max();
        let evicted = self.buffer.extend(bars);
        tracing::info!(count, evicted, "📊 Loaded historical bars");

        newest
    }

    /// Request shutdown and wait up to the stop timeout for the task
    ///
    /// A task that does not exit in time is left running and reported as
    /// `ShutdownTimeout`; it is never aborted mid-call.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.buffer.wake();

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        let timeout = self.config.stop_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                tracing::info!("⏹️ Live data feed stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Feed task ended abnormally");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(?timeout, "Feed task did not exit in time, leaving it detached");
                Err(EngineError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Next buffered bar
    ///
    /// Waits on the readiness signal and retries after each wait timeout.
    /// Returns `None` only once the feed is stopped and drained.
    pub async fn next(&self) -> Option<Bar> {
        let wait = self.config.consumer_wait();
        loop {
            if let Some(bar) = self.buffer.pop_timeout(wait).await {
                return Some(bar);
            }
            if self.stop.load(Ordering::Acquire) && self.buffer.is_empty() {
                return None;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Timestamp of the newest preloaded bar, in the broker's clock
    pub fn history_until(&self) -> Option<DateTime<Utc>> {
        self.history_until
    }

    /// Get the feed buffer
    pub fn buffer(&self) -> &FeedBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }
}
