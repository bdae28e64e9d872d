//! Background task that drains a reader into the line queue.
//!
//! One pump runs per connection. It reads a chunk, frames it, and pushes
//! every completed line onto the shared [`LineQueue`] in arrival order.
//! End of stream or a read error closes the queue and ends the task;
//! reconnecting is left to the caller.
//!
//! The pump is stopped by a oneshot signal raced against the pending read,
//! and [`ReadPump::stop`] joins the task and hands the reader back, so the
//! channel is never torn down underneath a running read.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{Chunk, read_chunk};
use crate::config::MIN_READ_BUFFER_SIZE;
use crate::error::CloseReason;
use crate::framer::LineFramer;
use crate::queue::LineQueue;

/// What a stopped pump hands back.
#[derive(Debug)]
pub struct PumpExit<R> {
    /// The reader the pump was draining.
    pub reader: R,
    /// The framer, holding any unterminated tail.
    pub framer: LineFramer,
}

/// Handle to a running read pump.
///
/// Dropping the handle without calling [`stop`](Self::stop) signals and
/// aborts the task.
#[derive(Debug)]
pub struct ReadPump<R> {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<PumpExit<R>>>,
}

impl<R> ReadPump<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Spawns a pump reading up to `buffer_size` bytes at a time into `queue`.
    ///
    /// `buffer_size` is raised to [`MIN_READ_BUFFER_SIZE`] if smaller, since
    /// an empty read buffer would look like end of stream.
    #[must_use]
    pub fn spawn(reader: R, queue: Arc<LineQueue>, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(MIN_READ_BUFFER_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(reader, queue, buffer_size, shutdown_rx));
        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Returns true once the task has exited on its own or been stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals the task to stop and waits for it to exit.
    ///
    /// Returns `None` if the task panicked or was aborted.
    pub async fn stop(mut self) -> Option<PumpExit<R>> {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already have exited on its own.
            let _ = shutdown.send(());
        }
        let handle = self.handle.take()?;
        match handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!(error = %e, "Read pump task did not exit cleanly");
                None
            }
        }
    }
}

impl<R> Drop for ReadPump<R> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            debug!("Aborting read pump");
            handle.abort();
        }
    }
}

async fn run<R>(
    mut reader: R,
    queue: Arc<LineQueue>,
    buffer_size: usize,
    mut shutdown: oneshot::Receiver<()>,
) -> PumpExit<R>
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; buffer_size];
    debug!(buffer_size, "Read pump started");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                debug!(residual = framer.residual_len(), "Read pump stopping");
                break;
            }

            chunk = read_chunk(&mut reader, &mut buf) => match chunk {
                Ok(Chunk::Data(data)) => {
                    trace!(len = data.len(), "Read chunk");
                    for line in framer.feed(data) {
                        trace!(%line, "Line received");
                        queue.push(line);
                    }
                }
                Ok(Chunk::EndOfStream) => {
                    info!(residual = framer.residual_len(), "Peer closed the connection");
                    queue.close(CloseReason::EndOfStream);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read pump failed");
                    queue.close(CloseReason::ReadFailed(e.to_string()));
                    break;
                }
            },
        }
    }

    PumpExit { reader, framer }
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
    use crate::Error;
    use std::io;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    async fn drain(queue: &LineQueue) -> (Vec<String>, Error) {
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(1), queue.pop())
                .await
                .unwrap()
            {
                Ok(line) => lines.push(line),
                Err(e) => return (lines, e),
            }
        }
    }

    #[tokio::test]
    async fn test_lines_in_arrival_order() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n* 2 EXI")
            .read(b"STS\r")
            .read(b"\nA1 OK done\r\n")
            .build();
        let queue = Arc::new(LineQueue::new());
        let pump = ReadPump::spawn(mock, Arc::clone(&queue), 1024);

        let (lines, err) = drain(&queue).await;
        assert_eq!(lines, vec!["* OK ready", "* 2 EXISTS", "A1 OK done"]);
        assert!(matches!(err, Error::QueueClosed(CloseReason::EndOfStream)));

        let exit = pump.stop().await.unwrap();
        assert!(exit.framer.is_empty());
    }

    #[tokio::test]
    async fn test_zero_buffer_size_is_raised() {
        let mock = Builder::new().read(b"+OK ready\r\n").build();
        let queue = Arc::new(LineQueue::new());
        let pump = ReadPump::spawn(mock, Arc::clone(&queue), 0);

        let (lines, err) = drain(&queue).await;
        assert_eq!(lines, vec!["+OK ready"]);
        assert!(matches!(err, Error::QueueClosed(CloseReason::EndOfStream)));
        pump.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_closes_queue() {
        let mock = Builder::new()
            .read(b"+OK\r\npartial")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let queue = Arc::new(LineQueue::new());
        let pump = ReadPump::spawn(mock, Arc::clone(&queue), 1024);

        let (lines, err) = drain(&queue).await;
        assert_eq!(lines, vec!["+OK"]);
        assert!(matches!(
            err,
            Error::QueueClosed(CloseReason::ReadFailed(_))
        ));

        let exit = pump.stop().await.unwrap();
        assert_eq!(exit.framer.residual(), b"partial");
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_read() {
        let (client, mut server) = tokio::io::duplex(256);
        let queue = Arc::new(LineQueue::new());
        let pump = ReadPump::spawn(client, Arc::clone(&queue), 1024);

        server.write_all(b"220 ready\r\n250-PART").await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "220 ready");
        assert!(!pump.is_finished());

        let exit = tokio::time::timeout(Duration::from_secs(1), pump.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.framer.residual(), b"250-PART");
        assert!(queue.close_reason().is_none());

        // The reader is handed back intact.
        let mut reader = exit.reader;
        server.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 16];
        let chunk = read_chunk(&mut reader, &mut buf).await.unwrap();
        assert_eq!(chunk, Chunk::Data(b"more"));
    }

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let (client, mut server) = tokio::io::duplex(256);
        let queue = Arc::new(LineQueue::new());
        let pump = ReadPump::spawn(client, Arc::clone(&queue), 1024);
        drop(pump);

        // Once the task is gone the client half is dropped and writes fail.
        let result = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if server.write_all(b"x").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok());
    }
}
