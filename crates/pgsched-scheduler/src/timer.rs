use std::{future::pending, pin::Pin, time::Duration};

use tokio::time::{sleep, Sleep};

/// A one-shot timer with a single slot.
///
/// Arming always replaces whatever was pending, so at most one wake-up is
/// outstanding per timer. Cancellation is dropping the inner `Sleep`.
#[derive(Debug, Default)]
pub struct WakeTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl WakeTimer {
    pub fn new() -> Self {
        Self { sleep: None }
    }

    /// Arm the timer `delay` from now. Returns `true` if a pending wake-up was
    /// replaced.
    pub fn arm(&mut self, delay: Duration) -> bool {
        let replaced = self.sleep.is_some();
        self.sleep = Some(Box::pin(sleep(delay)));
        replaced
    }

    /// Drop any pending wake-up.
    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolve when the armed deadline passes, then disarm.
    ///
    /// Never resolves while disarmed. Cancel safe: dropping the returned
    /// future leaves the deadline armed.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(s) => {
                s.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}
