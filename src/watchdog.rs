//! Init-monitor watchdog.
//!
//! One timer per `ImageBasedUpgrade`. When an armed timer expires before the
//! upgrade completes, a rollback request is sent to the controller, which
//! applies it under the same lock as reconcile.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::machine::{RollbackTrigger, WatchdogCommand};

/// Rollback requested by an expired timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollbackRequest {
    pub name: String,
    pub trigger: RollbackTrigger,
    pub message: String,
}

struct Timer {
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct Watchdog {
    timers: Mutex<HashMap<String, Timer>>,
    tx: mpsc::Sender<RollbackRequest>,
}

impl Watchdog {
    /// Create a watchdog and the receiver its expirations are sent to.
    pub fn new() -> (Self, mpsc::Receiver<RollbackRequest>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                timers: Mutex::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    pub fn apply(&self, name: &str, command: WatchdogCommand) {
        match command {
            WatchdogCommand::Keep => {}
            WatchdogCommand::Arm(deadline) => self.arm(name, deadline),
            WatchdogCommand::Disarm => self.disarm(name),
        }
    }

    /// Arm the timer for `name`. Re-arming with the same deadline is a no-op.
    pub fn arm(&self, name: &str, deadline: DateTime<Utc>) {
        let Ok(mut timers) = self.timers.lock() else {
            warn!("Watchdog state poisoned, not arming {}", name);
            return;
        };
        if let Some(timer) = timers.get(name)
            && timer.deadline == deadline
            && !timer.handle.is_finished()
        {
            return;
        }

        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        info!(
            "Arming init monitor for {} (expires at {}, in {}s)",
            name,
            deadline.to_rfc3339(),
            wait.as_secs()
        );

        let tx = self.tx.clone();
        let request = RollbackRequest {
            name: name.to_string(),
            trigger: RollbackTrigger::InitMonitor,
            message: format!(
                "Init monitor expired at {}, upgrade did not complete in time",
                deadline.to_rfc3339()
            ),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            warn!("Init monitor expired for {}", request.name);
            if tx.send(request).await.is_err() {
                debug!("Rollback receiver closed, dropping init monitor expiry");
            }
        });

        if let Some(old) = timers.insert(name.to_string(), Timer { deadline, handle }) {
            old.handle.abort();
        }
    }

    pub fn disarm(&self, name: &str) {
        if let Ok(mut timers) = self.timers.lock()
            && let Some(timer) = timers.remove(name)
        {
            info!("Disarming init monitor for {}", name);
            timer.handle.abort();
        }
    }

    /// Deadline of a pending timer.
    pub fn deadline(&self, name: &str) -> Option<DateTime<Utc>> {
        let timers = self.timers.lock().ok()?;
        timers
            .get(name)
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.deadline)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for timer in timers.values() {
                timer.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_millis(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn test_expired_timer_requests_rollback() {
        let (watchdog, mut rx) = Watchdog::new();
        watchdog.arm("upgrade", in_millis(50));

        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timer did not fire")
            .unwrap();
        assert_eq!(request.name, "upgrade");
        assert_eq!(request.trigger, RollbackTrigger::InitMonitor);
        assert!(request.message.contains("Init monitor expired"));
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let (watchdog, mut rx) = Watchdog::new();
        watchdog.arm("upgrade", in_millis(-60_000));
        let request = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(request.is_ok());
    }

    #[tokio::test]
    async fn test_disarm_cancels_timer() {
        let (watchdog, mut rx) = Watchdog::new();
        watchdog.apply("upgrade", WatchdogCommand::Arm(in_millis(100)));
        assert!(watchdog.deadline("upgrade").is_some());
        watchdog.apply("upgrade", WatchdogCommand::Disarm);
        assert!(watchdog.deadline("upgrade").is_none());

        let request = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(request.is_err(), "disarmed timer fired");
    }

    #[tokio::test]
    async fn test_rearm_replaces_deadline() {
        let (watchdog, mut rx) = Watchdog::new();
        let first = in_millis(60_000);
        watchdog.arm("upgrade", first);
        watchdog.arm("upgrade", first);
        assert_eq!(watchdog.deadline("upgrade"), Some(first));

        watchdog.arm("upgrade", in_millis(50));
        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(request.is_ok());

        // The replaced long timer was aborted, nothing else arrives.
        let again = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_keep_does_nothing() {
        let (watchdog, _rx) = Watchdog::new();
        watchdog.apply("upgrade", WatchdogCommand::Keep);
        assert!(watchdog.deadline("upgrade").is_none());
    }
}
