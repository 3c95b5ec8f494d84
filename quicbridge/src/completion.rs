//! Latch-once completion primitive
//!
//! Sends and datagram acknowledgments expose both push-style notification
//! and pull-style awaiting over the same transition. `Completion` is the
//! pull half: it latches exactly one value, every observer sees that same
//! value, and late observers see it immediately.

use tokio::sync::watch;

/// A value that is set at most once and observable by any number of
/// waiters, before or after the fact.
pub(crate) struct Completion<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Completion<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Latch the value. Returns `true` only for the first call; later calls
    /// leave the original value in place.
    pub(crate) fn complete(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_modify(|current| {
            if current.is_none() {
                *current = slot.take();
            }
        });
        slot.is_none()
    }

    /// Whether a value has been latched.
    pub(crate) fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The latched value, if any.
    pub(crate) fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Suspend until the value is latched.
    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let guard = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("completion sender lives as long as the completion");
        guard.clone().expect("guarded by wait_for")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_exactly_once() {
        let completion = Completion::new();
        assert!(completion.complete(1));
        assert!(!completion.complete(2));
        assert_eq!(completion.peek(), Some(1));
        assert_eq!(completion.wait().await, 1);
    }

    #[tokio::test]
    async fn wakes_waiters_registered_before_completion() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            tokio::spawn(async move { completion.wait().await })
        };
        // Give the waiter a chance to suspend first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        completion.complete(7u32);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn late_waiters_see_the_value_immediately() {
        let completion = Completion::new();
        completion.complete("done");
        assert_eq!(completion.wait().await, "done");
        assert!(completion.is_complete());
    }
}
