//! HTTP/2 flow-control windows.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW: i32 = 0x7FFF_FFFF;

/// A signed 31-bit flow-control window.
///
/// One counter exists per stream and one for the connection. The serve
/// loop credits the window from WINDOW_UPDATE frames; handler tasks
/// debit it before emitting DATA, waiting when it is exhausted. The
/// window may go negative when the peer shrinks
/// SETTINGS_INITIAL_WINDOW_SIZE mid-stream.
#[derive(Debug)]
pub struct FlowControl {
    window: Mutex<i32>,
    available: Notify,
}

impl FlowControl {
    pub fn new(initial: i32) -> Self {
        Self {
            window: Mutex::new(initial),
            available: Notify::new(),
        }
    }

    /// Current window balance.
    pub fn available(&self) -> i32 {
        *self.window.lock().unwrap()
    }

    /// Credit (or, for a negative `n`, debit) the window.
    ///
    /// Returns `false` when the result would exceed 2^31 - 1; the
    /// caller must treat that as a FLOW_CONTROL_ERROR at the window's
    /// scope.
    pub fn add(&self, n: i32) -> bool {
        let mut window = self.window.lock().unwrap();
        let sum = *window as i64 + n as i64;
        if sum > MAX_WINDOW as i64 {
            return false;
        }
        *window = sum as i32;
        if *window > 0 {
            self.available.notify_one();
        }
        true
    }

    /// Take up to `max` bytes from the window, waiting until at least
    /// one byte is available.
    pub async fn take(&self, max: i32) -> i32 {
        debug_assert!(max > 0);
        loop {
            let notified = self.available.notified();
            {
                let mut window = self.window.lock().unwrap();
                if *window > 0 {
                    let n = max.min(*window);
                    *window -= n;
                    // Wake the next waiter if credit remains.
                    if *window > 0 {
                        self.available.notify_one();
                    }
                    return n;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_add_and_available() {
        let flow = FlowControl::new(65_535);
        assert_eq!(flow.available(), 65_535);
        assert!(flow.add(1_000));
        assert_eq!(flow.available(), 66_535);
    }

    #[test]
    fn test_add_detects_overflow() {
        let flow = FlowControl::new(MAX_WINDOW);
        assert!(!flow.add(1));
        // The window is left untouched on overflow.
        assert_eq!(flow.available(), MAX_WINDOW);
        assert!(flow.add(0));
    }

    #[test]
    fn test_add_negative_delta() {
        let flow = FlowControl::new(65_535);
        assert!(flow.add(-70_000));
        assert_eq!(flow.available(), -4_465);
        // A shrunken window can grow back up to the limit.
        assert!(flow.add(70_000));
        assert_eq!(flow.available(), 65_535);
    }

    #[tokio::test]
    async fn test_take_is_bounded() {
        let flow = FlowControl::new(10);
        assert_eq!(flow.take(4).await, 4);
        assert_eq!(flow.take(100).await, 6);
        assert_eq!(flow.available(), 0);
    }

    #[tokio::test]
    async fn test_take_waits_for_credit() {
        let flow = Arc::new(FlowControl::new(0));
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.take(100).await })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert!(flow.add(25));
        assert_eq!(waiter.await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_take_wakes_multiple_waiters() {
        let flow = Arc::new(FlowControl::new(0));
        let a = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.take(10).await })
        };
        let b = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.take(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(flow.add(20));
        let got = a.await.unwrap() + b.await.unwrap();
        assert_eq!(got, 20);
    }
}
