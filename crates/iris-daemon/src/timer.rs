//! Deferred messages back into the scheduler queue

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::Message;

/// A single re-armable timer that posts a message when it expires
///
/// Each arming bumps a generation number carried by the posted message;
/// [`fire`](Self::fire) accepts only the live generation, so a message that
/// was already queued when the timer was disarmed is ignored.
pub struct DeferredMessage {
    tx: mpsc::UnboundedSender<Message>,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl DeferredMessage {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            generation: 0,
            handle: None,
        }
    }

    /// (Re)arm the timer
    pub fn arm(&mut self, delay: Duration, message: fn(u64) -> Message) {
        self.disarm();
        self.generation += 1;
        let tx = self.tx.clone();
        let message = message(self.generation);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        }));
    }

    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Consume an expiry; false for stale or disarmed generations
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for DeferredMessage {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(generation: u64) -> Message {
        Message::CancelTimeout { generation }
    }

    fn generation_of(message: Message) -> u64 {
        match message {
            Message::CancelTimeout { generation } => generation,
            _ => panic!("unexpected message"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeferredMessage::new(tx);
        timer.arm(Duration::from_secs(3), timeout);
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let generation = generation_of(rx.try_recv().unwrap());
        assert!(timer.fire(generation));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_old_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeferredMessage::new(tx);
        timer.arm(Duration::from_millis(10), timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = generation_of(rx.try_recv().unwrap());

        timer.arm(Duration::from_secs(1), timeout);
        assert!(!timer.fire(stale));
        assert!(timer.is_armed());

        timer.disarm();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
