//! Duplex frame replication between the client side and the backend side
//!
//! Each direction runs in its own task ([`relay_loop`]). The coordinator
//! ([`replicate`]) waits for the first error of either direction or for an
//! external stop, stops the remaining direction, waits for both, then closes
//! both connections.

use futures_util::{SinkExt, StreamExt};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::endpoint::{Endpoint, FrameSink, FrameSource};
use crate::frame::{CloseFrame, Frame, FrameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client to server"),
            Direction::ServerToClient => f.write_str("server to client"),
        }
    }
}

/// Terminal condition of a relay engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Error when copying from {direction}: {source}")]
    Copy {
        direction: Direction,
        #[source]
        source: FrameError,
    },

    #[error("client upgrade failed: {0}")]
    Upgrade(String),
}

impl RelayError {
    fn should_log(&self) -> bool {
        match self {
            RelayError::Copy { source, .. } => !source.is_graceful_close(),
            RelayError::Upgrade(_) => true,
        }
    }
}

/// Forward frames from `source` to `dest` until stopped or until either side fails.
///
/// The next frame is read only after the current one has been written, so
/// frames keep their receive order and at most one frame is in flight. A stop
/// is observed only while waiting for a read, never in the middle of a write.
///
/// On exit the destination sink is handed back so the caller can close it.
pub async fn relay_loop(
    name: u64,
    direction: Direction,
    mut source: FrameSource,
    mut dest: FrameSink,
    errors: mpsc::Sender<RelayError>,
    stop: CancellationToken,
) -> FrameSink {
    loop {
        let next = tokio::select! {
            biased;

            _ = stop.cancelled() => {
                let _ = dest.send(Frame::Close(CloseFrame::normal("Interrupted"))).await;
                info!("proxy {} ({}): connection closed (interrupted)", name, direction);
                return dest;
            }
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return fail_read(name, direction, dest, err, &errors).await,
            None => {
                return fail_read(name, direction, dest, FrameError::unexpected_eof(), &errors)
                    .await
            }
        };

        match &frame {
            Frame::Text(text) => info!("proxy {} ({}): {}", name, direction, text),
            other => debug!(
                "proxy {} ({}): {} frame, {} bytes",
                name,
                direction,
                other.kind(),
                payload_len(other)
            ),
        }

        if let Err(err) = dest.send(frame).await {
            info!("proxy {} ({}): cannot write message: {}", name, direction, err);
            let _ = errors.try_send(RelayError::Copy {
                direction,
                source: err,
            });
            return dest;
        }
    }
}

async fn fail_read(
    name: u64,
    direction: Direction,
    mut dest: FrameSink,
    err: FrameError,
    errors: &mpsc::Sender<RelayError>,
) -> FrameSink {
    let close = CloseFrame::for_error(&err);
    if err.is_graceful_close() {
        info!("proxy {} ({}): connection closed", name, direction);
    }
    let _ = dest.send(Frame::Close(close)).await;
    let _ = errors.try_send(RelayError::Copy {
        direction,
        source: err,
    });
    dest
}

fn payload_len(frame: &Frame) -> usize {
    match frame {
        Frame::Text(text) => text.len(),
        Frame::Binary(data) => data.len(),
        Frame::Close(close) => close.reason.len(),
    }
}

/// Run both directions until one fails or `stop` is cancelled.
///
/// Returns the first direction's error, or `None` when the relay was stopped
/// from outside. Both connections are closed before this returns.
pub async fn replicate(
    name: u64,
    client: Endpoint,
    backend: Endpoint,
    stop: CancellationToken,
) -> Option<RelayError> {
    // Room for one error per direction so neither loop ever blocks on reporting
    let (errors_tx, mut errors_rx) = mpsc::channel::<RelayError>(2);
    let loops_stop = stop.child_token();

    let to_client = tokio::spawn(relay_loop(
        name,
        Direction::ServerToClient,
        backend.source,
        client.sink,
        errors_tx.clone(),
        loops_stop.clone(),
    ));
    let to_backend = tokio::spawn(relay_loop(
        name,
        Direction::ClientToServer,
        client.source,
        backend.sink,
        errors_tx,
        loops_stop.clone(),
    ));

    let terminal = tokio::select! {
        Some(err) = errors_rx.recv() => {
            loops_stop.cancel();
            Some(err)
        }
        _ = stop.cancelled() => {
            info!("proxy {}: got signal: interrupted", name);
            None
        }
    };

    if let Some(err) = &terminal {
        if err.should_log() {
            info!("proxy {}: {}", name, err);
        }
    }

    let (client_sink, backend_sink) = tokio::join!(to_client, to_backend);
    for sink in [client_sink, backend_sink] {
        match sink {
            Ok(mut sink) => {
                let _ = sink.close().await;
            }
            Err(e) => error!("proxy {}: relay task failed: {}", name, e),
        }
    }
    debug!("proxy {}: connections closed", name);

    terminal
}
