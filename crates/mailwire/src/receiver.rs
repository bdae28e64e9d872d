//! Consumer side of a connection's line queue.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::channel::with_timeout;
use crate::queue::LineQueue;
use crate::Result;

const CRLF: &str = "\r\n";

/// Decides whether a line ends a multi-line reply.
///
/// The line is passed without its CRLF.
pub trait Terminator {
    /// Returns true if `line` completes the reply.
    fn is_terminator(&self, line: &str) -> bool;
}

/// Matches anywhere in the line; anchor with `^`/`$` as needed.
impl Terminator for Regex {
    fn is_terminator(&self, line: &str) -> bool {
        self.is_match(line)
    }
}

impl<F> Terminator for F
where
    F: Fn(&str) -> bool,
{
    fn is_terminator(&self, line: &str) -> bool {
        self(line)
    }
}

/// Cloneable handle for reading lines from a connection.
///
/// Handles can be moved to other tasks. If the connection breaks or is
/// closed while a handle is waiting, the wait ends with
/// [`Error::QueueClosed`](crate::Error::QueueClosed).
#[derive(Debug, Clone)]
pub struct LineReceiver {
    queue: Arc<LineQueue>,
    timeout: Option<Duration>,
}

impl LineReceiver {
    pub(crate) const fn new(queue: Arc<LineQueue>, timeout: Option<Duration>) -> Self {
        Self { queue, timeout }
    }

    /// Waits for the next line and returns it with CRLF re-appended.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the connection is gone and every queued
    /// line has been read, or `Timeout` if a receive timeout is configured
    /// and elapses.
    pub async fn receive_line(&self) -> Result<String> {
        let mut line = with_timeout(self.timeout, self.queue.pop()).await?;
        line.push_str(CRLF);
        Ok(line)
    }

    /// Returns the next line if one is already queued.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the connection is gone and drained.
    pub fn try_receive_line(&self) -> Result<Option<String>> {
        Ok(self.queue.try_pop()?.map(|mut line| {
            line.push_str(CRLF);
            line
        }))
    }

    /// Reads lines until one matches `terminator`.
    ///
    /// Returns every line read, CRLF included, up to and including the
    /// matching one. Lines after it stay queued. With no receive timeout
    /// this waits indefinitely for an unterminated reply.
    ///
    /// # Errors
    ///
    /// As for [`receive_line`](Self::receive_line). Lines read before the
    /// error are discarded.
    pub async fn receive_until<T>(&self, terminator: &T) -> Result<String>
    where
        T: Terminator + ?Sized,
    {
        let mut reply = String::new();
        loop {
            let line = self.receive_line().await?;
            let done = terminator.is_terminator(line.strip_suffix(CRLF).unwrap_or(&line));
            reply.push_str(&line);
            if done {
                return Ok(reply);
            }
        }
    }

    /// Returns the number of lines waiting to be read.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
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
    use crate::error::CloseReason;
    use crate::framer::LineFramer;
    use crate::Error;

    fn receiver_with(input: &[u8]) -> LineReceiver {
        let queue = Arc::new(LineQueue::new());
        let mut framer = LineFramer::new();
        for line in framer.feed(input) {
            queue.push(line);
        }
        LineReceiver::new(queue, Some(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_receive_line_appends_crlf() {
        let receiver = receiver_with(b"+OK ready\r\n");
        assert_eq!(receiver.receive_line().await.unwrap(), "+OK ready\r\n");
        assert_eq!(receiver.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_until_tagged() {
        let receiver = receiver_with(b"line1\r\nline2\r\nTAG OK done\r\n");
        let pattern = Regex::new("^TAG ").unwrap();

        let reply = receiver.receive_until(&pattern).await.unwrap();
        assert_eq!(reply, "line1\r\nline2\r\nTAG OK done\r\n");
        assert_eq!(receiver.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_until_leaves_later_lines() {
        let receiver = receiver_with(b"* 1 EXISTS\r\nA1 OK\r\n* 2 EXISTS\r\nA2 OK\r\n");
        let pattern = Regex::new(r"^A\d+ (OK|NO|BAD)").unwrap();

        assert_eq!(
            receiver.receive_until(&pattern).await.unwrap(),
            "* 1 EXISTS\r\nA1 OK\r\n"
        );
        assert_eq!(receiver.pending(), 2);
        assert_eq!(
            receiver.receive_until(&pattern).await.unwrap(),
            "* 2 EXISTS\r\nA2 OK\r\n"
        );
    }

    #[tokio::test]
    async fn test_receive_until_closure() {
        // POP3 multi-line responses end with a lone dot.
        let receiver = receiver_with(b"+OK 2 messages\r\n1 120\r\n2 200\r\n.\r\n");
        let reply = receiver.receive_until(&|line: &str| line == ".").await.unwrap();
        assert_eq!(reply, "+OK 2 messages\r\n1 120\r\n2 200\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_terminator_sees_stripped_line() {
        let receiver = receiver_with(b"250 OK\r\n");
        let pattern = Regex::new("^250 OK$").unwrap();
        assert_eq!(receiver.receive_until(&pattern).await.unwrap(), "250 OK\r\n");
    }

    #[tokio::test]
    async fn test_receive_until_closed_mid_reply() {
        let receiver = receiver_with(b"* 1 FETCH\r\n");
        receiver.queue.close(CloseReason::EndOfStream);

        let pattern = Regex::new("^A1 ").unwrap();
        assert!(matches!(
            receiver.receive_until(&pattern).await,
            Err(Error::QueueClosed(CloseReason::EndOfStream))
        ));
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let receiver = LineReceiver::new(
            Arc::new(LineQueue::new()),
            Some(Duration::from_millis(20)),
        );
        assert!(matches!(
            receiver.receive_line().await,
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_try_receive_line() {
        let receiver = receiver_with(b"a\r\n");
        assert_eq!(receiver.try_receive_line().unwrap().as_deref(), Some("a\r\n"));
        assert_eq!(receiver.try_receive_line().unwrap(), None);
    }
}
