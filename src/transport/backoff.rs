//! Reconnect policy
//!
//! Decides whether a closed socket should be reconnected and how long to wait
//! before each attempt. Delays grow linearly with the attempt number up to a
//! fixed multiplier cap, so a flapping server is retried quickly at first and
//! then at a steady pace until the attempt budget runs out.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Tracks reconnect attempts for one logical connection
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    delay_cap: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, delay_cap: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            delay_cap: delay_cap.max(1),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is exhausted.
    ///
    /// Consumes one attempt: the first call after a failure returns
    /// `base_delay * 1`, the second `base_delay * 2`, and so on up to
    /// `base_delay * delay_cap`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = (self.attempt + 1).min(self.delay_cap);
        self.attempt += 1;
        Some(self.base_delay * factor)
    }

    /// Clear the attempt counter after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Whether a close frame signals an intentional shutdown.
///
/// Normal (1000) and going-away (1001) closures are final; anything else,
/// including a stream that ends with no close frame at all, is treated as an
/// abnormal drop worth reconnecting from.
pub fn is_clean_close(frame: Option<&CloseFrame<'_>>) -> bool {
    matches!(
        frame.map(|f| f.code),
        Some(CloseCode::Normal) | Some(CloseCode::Away)
    )
}
