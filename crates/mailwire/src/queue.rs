//! Ordered line queue shared between the read pump and consumers.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::{CloseReason, Error, Result};

#[derive(Debug, Default)]
struct Inner {
    lines: VecDeque<String>,
    closed: Option<CloseReason>,
}

/// Unbounded FIFO of complete lines.
///
/// A single producer pushes; any number of consumers wait in [`pop`](Self::pop).
/// Waiters suspend on a [`Notify`] instead of polling. Closing the queue
/// wakes every waiter; lines already queued are still handed out before
/// [`Error::QueueClosed`] is returned.
#[derive(Debug, Default)]
pub struct LineQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl LineQueue {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a line. Returns false if the queue is closed and the line was dropped.
    pub fn push(&self, line: String) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return false;
            }
            inner.lines.push_back(line);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] once the queue is closed and drained.
    pub async fn pop(&self) -> Result<String> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(line) = self.try_pop()? {
                return Ok(line);
            }

            notified.await;
        }
    }

    /// Takes the next line without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the queue is closed and drained.
    pub fn try_pop(&self) -> Result<Option<String>> {
        let mut inner = self.lock();
        if let Some(line) = inner.lines.pop_front() {
            return Ok(Some(line));
        }
        match &inner.closed {
            Some(reason) => Err(Error::QueueClosed(reason.clone())),
            None => Ok(None),
        }
    }

    /// Returns the number of queued lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    /// Returns true if no lines are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Discards all queued lines and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.lines.len();
        inner.lines.clear();
        dropped
    }

    /// Closes the queue and wakes all waiters.
    ///
    /// The first reason wins, except that a local close overrides a broken
    /// connection so that the queue reports the terminal state.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut inner = self.lock();
            match &inner.closed {
                None => inner.closed = Some(reason),
                Some(existing) if existing.is_broken() && !reason.is_broken() => {
                    inner.closed = Some(reason);
                }
                Some(_) => {}
            }
        }
        self.notify.notify_waiters();
    }

    /// Returns why the queue closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = LineQueue::new();
        for i in 0..5 {
            assert!(queue.push(format!("line{i}")));
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop().await.unwrap(), format!("line{i}"));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(LineQueue::new());
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.push("* OK".into());
        let line = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "* OK");
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let queue = Arc::new(LineQueue::new());
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close(CloseReason::Closed);

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::QueueClosed(CloseReason::Closed))));
    }

    #[tokio::test]
    async fn test_close_drains_before_failing() {
        let queue = LineQueue::new();
        queue.push("* BYE".into());
        queue.close(CloseReason::EndOfStream);

        assert!(!queue.push("late".into()));
        assert_eq!(queue.pop().await.unwrap(), "* BYE");
        assert!(matches!(
            queue.pop().await,
            Err(Error::QueueClosed(CloseReason::EndOfStream))
        ));
    }

    #[test]
    fn test_try_pop() {
        let queue = LineQueue::new();
        assert_eq!(queue.try_pop().unwrap(), None);
        queue.push("250 OK".into());
        assert_eq!(queue.try_pop().unwrap().as_deref(), Some("250 OK"));
        queue.close(CloseReason::Closed);
        assert!(queue.try_pop().is_err());
    }

    #[test]
    fn test_local_close_overrides_broken() {
        let queue = LineQueue::new();
        queue.close(CloseReason::EndOfStream);
        queue.close(CloseReason::ReadFailed("reset".into()));
        assert_eq!(queue.close_reason(), Some(CloseReason::EndOfStream));
        queue.close(CloseReason::Closed);
        assert_eq!(queue.close_reason(), Some(CloseReason::Closed));
    }

    #[test]
    fn test_clear() {
        let queue = LineQueue::new();
        queue.push("a".into());
        queue.push("b".into());
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_consumers_each_line_once() {
        let queue = Arc::new(LineQueue::new());
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move { queue.pop().await.unwrap() }));
        }

        for i in 0..4 {
            queue.push(format!("{i}"));
        }

        let mut seen = Vec::new();
        for consumer in consumers {
            seen.push(
                tokio::time::timeout(Duration::from_secs(1), consumer)
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2", "3"]);
        assert!(queue.is_empty());
    }
}
