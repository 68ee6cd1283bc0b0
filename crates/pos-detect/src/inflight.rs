use tokio::sync::watch;

/// Counts frames sent but not yet answered by the detector.
///
/// This is the only synchronization point between "all frames accounted
/// for" and "safe to show final results": the session layer awaits
/// [`InFlight::drained`] before reporting processing complete, and
/// force-clears the counter when a dropped connection leaves frames
/// unanswered past its timeout.
#[derive(Debug)]
pub struct InFlight {
    count: watch::Sender<usize>,
}

impl InFlight {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Called once per frame, before transmission.
    pub fn increment(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    /// Called exactly once per handled detector message, after its
    /// detections have been resolved. Floored at zero so a late or
    /// duplicate settle can never underflow.
    pub fn settle(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Presumes every outstanding frame lost and unblocks waiters.
    pub fn force_clear(&self) {
        self.count.send_if_modified(|n| {
            if *n == 0 {
                false
            } else {
                *n = 0;
                true
            }
        });
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once the counter reaches zero (immediately if it already is).
    pub async fn drained(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}
