//! Module to signal shutdown to the metric consolidator.
//!
//! The consolidator's flush loop, its producers and any caller racing a drain
//! against a deadline all need the same thing: a one-time event they can wait
//! on. This crate provides that event.
//!
//! The mechanism here has two components, a `Broadcaster` and a `Watcher`. The
//! `Broadcaster` is responsible for signaling every `Watcher` that shutdown has
//! begun. This is a one-time event. The `Watcher` is responsible for waiting
//! for the signal to be sent.
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances.
//! The `Broadcaster` may wait for every `Watcher` to drop off, which is how a
//! caller learns that the flush loop has completed its final flush.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use tokio::sync::watch;
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // A watch channel carries exactly the state we need: whether the signal
    // has fired, plus a count of live receivers that `Sender::closed` can wait
    // on. Dropping the sender is also observable, so a `Broadcaster` that is
    // dropped without signaling still releases its watchers.
    let (sender, receiver) = watch::channel(false);

    let w = Watcher {
        receiver,
        signal_received: false,
    };
    let b = Broadcaster { sender };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that shutdown has
/// begun.
pub struct Broadcaster {
    /// Transmission point for the signal to `Watcher` instances. The number of
    /// live receivers doubles as the peer count.
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have ack'ed the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until every `Watcher` has been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug, Clone)]
/// Mechanism to watch for shutdown.
///
/// Every clone is a peer of the `Broadcaster`: `signal_and_wait` does not
/// return until all of them have been dropped.
pub struct Watcher {
    /// Used to track if the signal has been received without synchronization.
    signal_received: bool,
    /// Transmission point for the signal from `Broadcaster`.
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Receive the shutdown notice. This function will block if a notice has
    /// not already been sent.
    ///
    /// If `recv` is called multiple times after the signal has been received
    /// this function will return immediately. The `Watcher` remains a peer of
    /// the `Broadcaster` until it is dropped, not when the signal arrives.
    pub async fn recv(&mut self) {
        if self.signal_received {
            // Once the signal is received if this function were called in a
            // `select!` it might drown out every other arm.
            tokio::task::yield_now().await;
            return;
        }

        // An error here means the `Broadcaster` was dropped, which we treat
        // the same as an explicit signal.
        let _ = self.receiver.wait_for(|fired| *fired).await;
        self.signal_received = true;
    }

    /// Check if a shutdown notice has been sent without blocking.
    ///
    /// If the signal has not been received returns Ok(false). If it has been
    /// received Ok(true). All calls after will return `TryRecvError::SignalReceived`.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` if the signal has already been
    /// received and processed by this watcher.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        let fired = match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow_and_update(),
            Err(_) => true,
        };
        if fired {
            self.signal_received = true;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::{TryRecvError, signal};

    #[tokio::test]
    async fn basic_signal() {
        let (mut watcher, broadcaster) = signal();

        let watcher_handle = tokio::spawn(async move {
            watcher.recv().await;
        });

        broadcaster.signal_and_wait().await;
        watcher_handle.await.unwrap();
    }

    #[tokio::test]
    async fn multiple_watchers() {
        let (mut watcher1, broadcaster) = signal();
        let mut watcher2 = watcher1.clone();

        let watcher_handle1 = tokio::spawn(async move { watcher1.recv().await });
        let watcher_handle2 = tokio::spawn(async move { watcher2.recv().await });

        broadcaster.signal_and_wait().await;

        watcher_handle1.await.unwrap();
        watcher_handle2.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn signal_and_wait_blocks_on_live_watcher() {
        let (mut watcher, broadcaster) = signal();
        let lingering = watcher.clone();

        let waiter = tokio::spawn(broadcaster.signal_and_wait());
        watcher.recv().await;
        drop(watcher);

        // `lingering` has not dropped, so the broadcaster is still waiting.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        drop(lingering);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("broadcaster never observed the last watcher drop")
            .unwrap();
    }

    #[test]
    fn try_receive_before_signal() {
        let (mut watcher, broadcaster) = signal();

        assert!(!watcher.try_recv().unwrap());

        broadcaster.signal();

        assert!(watcher.try_recv().unwrap());
    }

    #[test]
    fn try_receive_after_signal() {
        let (mut watcher, broadcaster) = signal();

        broadcaster.signal();

        assert!(watcher.try_recv().unwrap());

        // From this point every call to try_recv errors.
        assert!(matches!(
            watcher.try_recv(),
            Err(TryRecvError::SignalReceived)
        ));
    }

    #[test]
    fn dropped_broadcaster_is_a_signal() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);

        assert!(watcher.try_recv().unwrap());
    }

    #[tokio::test]
    async fn recv_after_dropped_broadcaster() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);

        timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("watcher did not observe the dropped broadcaster");

        // A second recv returns immediately.
        timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("repeated recv should not block");
    }

    #[tokio::test]
    async fn signal_without_watchers() {
        let (watcher, broadcaster) = signal();

        drop(watcher);
        broadcaster.signal_and_wait().await;
    }
}
