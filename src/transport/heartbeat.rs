//! Heartbeat monitor
//!
//! Periodically sends a keep-alive carrying the server-assigned connection id
//! so the server can reap dead connections. A monitor only exists once the
//! handshake has delivered that id; every reconnect therefore gets a fresh
//! monitor. A failed send means the socket is gone, and the monitor stops
//! instead of retrying into a dead connection.

use std::time::Duration;

use crate::protocol::{ClientMessage, HeartbeatPayload};

/// Background task sending heartbeats for one established connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Spawn the monitor. The first beat goes out one full period after the
    /// handshake, then every period after that.
    pub fn start<F>(connection_id: String, period: Duration, send: F) -> Self
    where
        F: Fn(ClientMessage) -> crate::Result<()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so we don't beat
            // right on top of the handshake.
            interval.tick().await;

            tracing::debug!(
                connection_id = %connection_id,
                period_secs = period.as_secs(),
                "Heartbeat monitor started"
            );

            loop {
                interval.tick().await;
                let beat = ClientMessage::Heartbeat(HeartbeatPayload {
                    connection_id: connection_id.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = send(beat) {
                    tracing::debug!(
                        connection_id = %connection_id,
                        error = %e,
                        "Heartbeat send failed, stopping monitor"
                    );
                    break;
                }
                tracing::trace!(connection_id = %connection_id, "Heartbeat sent");
            }
        });

        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_beats_once_per_period() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _monitor = HeartbeatMonitor::start(
            "abc123_1700000000.5".to_string(),
            Duration::from_secs(30),
            move |msg| tx.send(msg).map_err(|_| Error::NotConnected),
        );

        tokio::time::sleep(Duration::from_secs(95)).await;

        let mut beats = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            beats.push(msg);
        }
        assert_eq!(beats.len(), 3);
        for beat in beats {
            match beat {
                ClientMessage::Heartbeat(payload) => {
                    assert_eq!(payload.connection_id, "abc123_1700000000.5");
                    assert!(!payload.timestamp.is_empty());
                }
                other => panic!("Expected Heartbeat, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_beat_before_first_period() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _monitor = HeartbeatMonitor::start(
            "c1".to_string(),
            Duration::from_secs(30),
            move |msg| tx.send(msg).map_err(|_| Error::NotConnected),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_stops_monitor() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let monitor = HeartbeatMonitor::start("c1".to_string(), Duration::from_secs(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotConnected)
        });

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_monitor() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start("c1".to_string(), Duration::from_secs(10), move |msg| {
            tx.send(msg).map_err(|_| Error::NotConnected)
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(rx.try_recv().is_ok());
        drop(monitor);

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
