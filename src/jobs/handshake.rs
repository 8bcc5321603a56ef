//! Starting handshake
//!
//! Before an application unit is created, launches pause so that anyone
//! watching for app starts (a compositor, a shell) can register interest.
//! A local observer runs in our own process and would deadlock if the
//! worker waited on it, so the wait collapses to zero in that case;
//! otherwise out-of-process observers get a one second grace period.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

const OBSERVED_TIMEOUT: Duration = Duration::ZERO;
const UNOBSERVED_TIMEOUT: Duration = Duration::from_secs(1);

/// Notification that an application is about to start
#[derive(Debug, Clone)]
pub struct StartingEvent {
    pub appid: String,
    pub instance: String,
    ack: mpsc::Sender<()>,
}

impl StartingEvent {
    /// Let the launch proceed
    pub fn ack(&self) {
        let _ = self.ack.try_send(());
    }
}

/// Fan-out point for starting notifications
pub struct StartingSignal {
    tx: broadcast::Sender<StartingEvent>,
}

impl StartingSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Watch for apps about to start
    pub fn observe(&self) -> broadcast::Receiver<StartingEvent> {
        self.tx.subscribe()
    }

    pub fn is_watching(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Announce a launch and return its handshake
    pub fn begin(&self, appid: &str, instance: &str) -> Handshake {
        let timeout = if self.is_watching() {
            OBSERVED_TIMEOUT
        } else {
            UNOBSERVED_TIMEOUT
        };

        let (ack_tx, ack_rx) = mpsc::channel(1);
        let _ = self.tx.send(StartingEvent {
            appid: appid.to_string(),
            instance: instance.to_string(),
            ack: ack_tx,
        });

        Handshake { timeout, ack_rx }
    }
}

impl Default for StartingSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One launch's barrier
pub struct Handshake {
    timeout: Duration,
    ack_rx: mpsc::Receiver<()>,
}

impl Handshake {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until an observer acknowledges or the timeout passes
    ///
    /// When the announcement reached nobody the ack channel is already
    /// closed and the wait returns at once.
    pub async fn wait(mut self) {
        if self.timeout.is_zero() {
            return;
        }
        let _ = tokio::time::timeout(self.timeout, self.ack_rx.recv()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_timeout_without_observer() {
        let signal = StartingSignal::new();
        assert!(!signal.is_watching());
        let handshake = signal.begin("gedit", "1");
        assert_eq!(handshake.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_with_observer() {
        let signal = StartingSignal::new();
        let _rx = signal.observe();
        assert!(signal.is_watching());
        let handshake = signal.begin("gedit", "1");
        assert_eq!(handshake.timeout(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_returns_fast_when_nobody_listens() {
        let signal = StartingSignal::new();
        let handshake = signal.begin("gedit", "1");

        let before = Instant::now();
        handshake.wait().await;
        // The ack channel closed with the undelivered event, no need to
        // sit out the full grace period
        assert!(before.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_observer_sees_event() {
        let signal = StartingSignal::new();
        let mut rx = signal.observe();

        let handshake = signal.begin("gedit", "42");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.appid, "gedit");
        assert_eq!(event.instance, "42");
        event.ack();

        handshake.wait().await;
    }

    #[tokio::test]
    async fn test_ack_completes_wait_within_grace() {
        let signal = StartingSignal::new();
        let mut rx = signal.observe();

        // Force the one second path by subscribing after the count check
        // is not possible, so emulate a slow observer instead: the event
        // is delivered, the timeout is zero, wait returns immediately and
        // the late ack is harmless.
        let handshake = signal.begin("gedit", "1");
        let event = rx.try_recv().unwrap();
        handshake.wait().await;
        event.ack();
    }
}
