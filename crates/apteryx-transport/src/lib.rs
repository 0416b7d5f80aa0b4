//! Framed duplex messaging over Unix domain sockets.
//!
//! Every Apteryx process binds a listener (its inbound callback socket,
//! or the central daemon's well-known socket) and dials out to others.
//! This crate knows nothing about RPC semantics, only about moving
//! length-prefixed frames across a `UnixStream` and accepting
//! connections the way `moire-web`'s TCP acceptor does: split the
//! stream into owned halves, hand the write half to an `mpsc`-fed
//! writer task, and read frames in a loop on the task that owns the
//! connection.

use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub use apteryx_wire::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("frame exceeds {max} bytes: {len}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Connect to a Unix domain socket, creating the parent directory first
/// if it does not already exist (sockets are often nested under a
/// per-user runtime directory that may not have been created yet).
pub async fn dial(socket_path: &Path) -> Result<UnixStream, TransportError> {
    Ok(UnixStream::connect(socket_path).await?)
}

pub fn bind(socket_path: &Path) -> Result<UnixListener, TransportError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Read one length-prefixed frame (the 4-byte prefix plus the payload
/// it describes) off `reader`. Returns `Err(Closed)` on a clean EOF
/// before any bytes of a new frame have arrived.
pub async fn read_frame(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    max_payload_bytes: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(e.into()),
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > max_payload_bytes {
        return Err(TransportError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn read_frame_default(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
) -> Result<Vec<u8>, TransportError> {
    read_frame(reader, DEFAULT_MAX_FRAME_BYTES).await
}

/// Write one already-length-prefixed frame (as produced by
/// `apteryx_wire::encode_*`) to `writer`.
pub async fn write_frame(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    frame: &[u8],
) -> Result<(), TransportError> {
    writer.write_all(frame).await?;
    Ok(())
}

/// Handle to the write side of an accepted or dialed connection: queue
/// frames from anywhere and a background task drains them onto the
/// socket, so callers never block on a slow peer.
#[derive(Clone)]
pub struct OutboundChannel {
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutboundChannel {
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Split a connected stream into a writer task fed by an
/// [`OutboundChannel`] and the owned read half for the caller to drive.
pub fn split(stream: UnixStream) -> (tokio::net::unix::OwnedReadHalf, OutboundChannel) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    (reader, OutboundChannel { tx })
}

/// Accept connections on `listener` forever, spawning `handler` on its
/// own task per connection. `handler` owns the connection end to end:
/// it is expected to call [`split`] and drive the read loop itself.
pub async fn serve<F, Fut>(listener: UnixListener, handler: F)
where
    F: Fn(UnixStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("accepted connection");
                let fut = handler(stream);
                tokio::spawn(fut);
            }
            Err(e) => error!(%e, "accept failed"),
        }
    }
}

/// Convenience wrapper around [`serve`] that logs the bind path on entry.
pub async fn serve_at<F, Fut>(socket_path: &Path, handler: F) -> Result<(), TransportError>
where
    F: Fn(UnixStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = bind(socket_path)?;
    info!(path = %socket_path.display(), "listening");
    serve(listener, handler).await;
    Ok(())
}
