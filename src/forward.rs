//! Bidirectional relay between two established connections.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::traffic::TrafficCounters;

/// Per-direction copy buffer, 32 x 1 KiB
pub const PIPE_BUF_LEN: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> destination
    Upload,
    /// destination -> client
    Download,
}

/// How one copy loop ended
#[derive(Debug)]
pub struct PipeOutcome {
    pub direction: Direction,
    pub bytes: u64,
    /// `None` on a clean zero-length read
    pub error: Option<io::Error>,
}

/// Totals for a finished forward
#[derive(Debug, Default)]
pub struct ForwardReport {
    pub upload: u64,
    pub download: u64,
    pub errors: Vec<(Direction, io::Error)>,
}

/// Relay `client` <-> `server` until both directions have terminated.
///
/// Each direction runs in its own task and reports on a completion channel of
/// capacity two; the call returns only after both reports arrived (or both
/// tasks are gone), so no copy task outlives it. A direction that stops shuts
/// down its destination's write side so the peer sees EOF. Dropping the halves
/// afterwards closes both connections.
pub async fn forward<C, S>(
    client: C,
    server: S,
    counters: Option<Arc<TrafficCounters>>,
) -> ForwardReport
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (server_rd, server_wr) = tokio::io::split(server);
    let (done_tx, mut done_rx) = mpsc::channel::<PipeOutcome>(2);

    tokio::spawn(pipe(
        client_rd,
        server_wr,
        Direction::Upload,
        counters.clone(),
        done_tx.clone(),
    ));
    tokio::spawn(pipe(server_rd, client_wr, Direction::Download, counters, done_tx));

    let mut report = ForwardReport::default();
    for _ in 0..2 {
        // None means both senders dropped without reporting (task panicked)
        let Some(outcome) = done_rx.recv().await else {
            break;
        };
        match outcome.direction {
            Direction::Upload => report.upload = outcome.bytes,
            Direction::Download => report.download = outcome.bytes,
        }
        if let Some(err) = outcome.error {
            report.errors.push((outcome.direction, err));
        }
    }
    report
}

async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    counters: Option<Arc<TrafficCounters>>,
    done: mpsc::Sender<PipeOutcome>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUF_LEN];
    let mut bytes = 0u64;

    let error = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Some(e);
        }
        if let Err(e) = dst.flush().await {
            break Some(e);
        }
        bytes += n as u64;
        if let Some(counters) = &counters {
            match direction {
                Direction::Upload => counters.add_upload(n as u64),
                Direction::Download => counters.add_download(n as u64),
            }
        }
    };

    let _ = dst.shutdown().await;
    trace!("{:?} pipe finished after {} bytes", direction, bytes);
    let _ = done
        .send(PipeOutcome {
            direction,
            bytes,
            error,
        })
        .await;
}
