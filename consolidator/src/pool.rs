//! Bounded slot pool of accumulators.
//!
//! The pool is a bounded channel whose occupancy is the only synchronization
//! in the consolidator. Taking an accumulator waits while the channel is
//! empty; putting one back never waits because it returns a slot that the
//! matching take freed.

use std::{future::Future, num::NonZeroUsize};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};

/// Errors produced by [`Pool`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Error {
    /// Every sender or the receiver is gone.
    #[error("pool channel closed")]
    Closed,
    /// A put found no free slot.
    #[error("pool is already at capacity")]
    Overfull,
}

#[derive(Debug)]
pub(crate) struct Pool<M> {
    sender: mpsc::Sender<M>,
    // Borrowers share the single receiver. The lock is held only while
    // waiting for an item, never while an item is checked out.
    receiver: Mutex<mpsc::Receiver<M>>,
    spots: NonZeroUsize,
}

impl<M> Pool<M> {
    /// Create an empty pool with room for `spots` accumulators.
    pub(crate) fn new(spots: NonZeroUsize) -> Self {
        let (sender, receiver) = mpsc::channel(spots.get());
        Self {
            sender,
            receiver: Mutex::new(receiver),
            spots,
        }
    }

    pub(crate) fn spots(&self) -> NonZeroUsize {
        self.spots
    }

    /// Take one accumulator, waiting until one is available.
    pub(crate) async fn take(&self) -> Result<M, Error> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or(Error::Closed)
    }

    /// Put one accumulator back. Never waits.
    pub(crate) fn put(&self, item: M) -> Result<(), Error> {
        self.sender.try_send(item).map_err(|err| match err {
            TrySendError::Full(_) => Error::Overfull,
            TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Take every accumulator. Returns `None` if `cancel` resolves first, in
    /// which case everything taken so far has been put back.
    ///
    /// Cancel safe: dropping the returned future also puts back everything
    /// taken so far.
    pub(crate) async fn take_all<F>(&self, cancel: F) -> Result<Option<Checkout<'_, M>>, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        let spots = self.spots.get();
        let mut checkout = Checkout {
            pool: self,
            items: Vec::with_capacity(spots),
        };

        // A borrower parked in `take` holds the lock until an item comes
        // back, so the wait for the lock must be cancellable too.
        let mut receiver = tokio::select! {
            biased;

            () = &mut cancel => return Ok(None),
            receiver = self.receiver.lock() => receiver,
        };

        while checkout.items.len() < spots {
            tokio::select! {
                biased;

                () = &mut cancel => return Ok(None),
                item = receiver.recv() => {
                    checkout.items.push(item.ok_or(Error::Closed)?);
                }
            }
        }

        Ok(Some(checkout))
    }

    /// Number of accumulators currently idle in the pool.
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.spots.get() - self.sender.capacity()
    }
}

/// Accumulators taken out of a [`Pool`]. Whatever is still held when this is
/// dropped goes back to the pool.
#[derive(Debug)]
pub(crate) struct Checkout<'a, M> {
    pool: &'a Pool<M>,
    items: Vec<M>,
}

impl<M> Checkout<'_, M> {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Keep the accumulators, they no longer return to the pool.
    pub(crate) fn into_inner(mut self) -> Vec<M> {
        std::mem::take(&mut self.items)
    }
}

impl<M> Drop for Checkout<'_, M> {
    fn drop(&mut self) {
        for item in self.items.drain(..) {
            // Every item freed a slot when it was taken and nothing puts
            // without taking first, so this cannot be overfull.
            let _ = self.pool.put(item);
        }
    }
}
