//! Bounds the number of messages admitted into the sink but not yet written to the claims store.
//!
//! Each admitted message holds one permit of a [Semaphore] until the batch containing it
//! completes, at which point the permits for the whole batch are released with
//! [AdmissionController::allow]. A producer calling [AdmissionController::reserve] while every
//! permit is taken waits until a batch completes. Dropping the `reserve` future cancels the wait.

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit, mpsc};

use crate::error::{Error, Result};

pub(crate) struct AdmissionController<T> {
    capacity: usize,
    semaphore: Semaphore,
    /// `None` once admission is completed.
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> AdmissionController<T> {
    /// Creates the controller along with the receiving end of admitted items.
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<T>) {
        // the channel itself does not need a bound, the semaphore is the bound.
        let (tx, rx) = mpsc::unbounded_channel();
        (
            AdmissionController {
                capacity,
                semaphore: Semaphore::new(capacity),
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Waits for one unit of capacity. Dropping the returned future, or the reservation, gives
    /// the capacity back.
    pub(crate) async fn reserve(&self) -> Result<Reservation<'_, T>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Admission("admission is closed".to_string()))?;
        Ok(Reservation {
            permit,
            controller: self,
        })
    }

    /// Sends `item` without taking capacity, used for control messages.
    pub(crate) fn send_control(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Admission("admission is closed".to_string()));
        }
        self.send(item)
    }

    fn send(&self, item: T) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Error::Admission("admission is completed".to_string()));
        };
        sender
            .send(item)
            .map_err(|_| Error::Admission("receiver of admitted messages is gone".to_string()))
    }

    /// Releases `n` units of capacity.
    pub(crate) fn allow(&self, n: usize) {
        if n > 0 {
            self.semaphore.add_permits(n);
        }
    }

    /// No more items will be admitted. The receiver drains what is already queued and then ends.
    pub(crate) fn complete(&self) {
        self.sender.lock().take();
    }

    /// Fails every waiting and future reservation.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Admitted items whose capacity has not been released yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }
}

/// Capacity reserved for one item.
pub(crate) struct Reservation<'a, T> {
    permit: SemaphorePermit<'a>,
    controller: &'a AdmissionController<T>,
}

impl<T> Reservation<'_, T> {
    /// Admits `item` using the reserved capacity.
    pub(crate) fn send(self, item: T) -> Result<()> {
        self.controller.send(item)?;
        // the permit is returned through allow() when the item's batch completes
        self.permit.forget();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    async fn emit<T>(admission: &AdmissionController<T>, item: T) -> Result<()> {
        admission.reserve().await?.send(item)
    }

    #[tokio::test]
    async fn test_emit_blocks_at_capacity() {
        let (admission, mut rx) = AdmissionController::new(3);
        let admission = Arc::new(admission);

        for i in 0..3 {
            emit(&admission, i).await.unwrap();
        }
        assert_eq!(admission.outstanding(), 3);

        // the fourth emit has no capacity left
        let blocked = timeout(Duration::from_millis(100), emit(&admission, 3)).await;
        assert!(blocked.is_err(), "emit should block at capacity");

        let producer = tokio::spawn({
            let admission = Arc::clone(&admission);
            async move { emit(&admission, 3).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        admission.allow(1);
        timeout(Duration::from_secs(1), producer)
            .await
            .expect("emit should resume once capacity is released")
            .unwrap()
            .unwrap();

        for expected in 0..4 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_control_does_not_take_capacity() {
        let (admission, mut rx) = AdmissionController::new(1);
        emit(&admission, "data").await.unwrap();
        admission.send_control("flush").unwrap();
        admission.send_control("flush").unwrap();
        assert_eq!(admission.outstanding(), 1);

        assert_eq!(rx.recv().await, Some("data"));
        assert_eq!(rx.recv().await, Some("flush"));
        assert_eq!(rx.recv().await, Some("flush"));
    }

    #[tokio::test]
    async fn test_close_fails_blocked_emit() {
        let (admission, _rx) = AdmissionController::new(1);
        let admission = Arc::new(admission);
        emit(&admission, 1).await.unwrap();

        let producer = tokio::spawn({
            let admission = Arc::clone(&admission);
            async move { emit(&admission, 2).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        admission.close();

        let result = timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Admission(_))));
        assert!(admission.is_closed());
        assert!(admission.send_control(3).is_err());
    }

    #[tokio::test]
    async fn test_dropped_reservation_returns_capacity() {
        let (admission, mut rx) = AdmissionController::new(1);
        let reservation = admission.reserve().await.unwrap();
        assert_eq!(admission.outstanding(), 1);
        drop(reservation);
        assert_eq!(admission.outstanding(), 0);

        admission.reserve().await.unwrap().send(7).unwrap();
        assert_eq!(admission.outstanding(), 1);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_complete_ends_receiver() {
        let (admission, mut rx) = AdmissionController::new(4);
        emit(&admission, 1).await.unwrap();
        admission.complete();

        assert!(matches!(emit(&admission, 2).await, Err(Error::Admission(_))));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }
}
