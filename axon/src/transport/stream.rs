use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use axon_common::{Error, Result};

use super::{CloseState, DropListener, Transport};

/// Reliable, ordered, byte-stream transport wrapping a single `TcpStream`.
///
/// Writes are handed off to an internal unbounded channel drained by a dedicated write task so
/// that `enqueue_write` never blocks the caller; reads are driven entirely by whichever task owns
/// the read loop, matching the spec's "reads only happen on the poll thread" rule.
pub struct StreamTransport {
    local: SocketAddr,
    peer: SocketAddr,
    write_tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<CloseState>,
}

impl StreamTransport {
    /// Wraps an already-connected or already-accepted `TcpStream`, splitting it into owned read
    /// and write halves. Returns the transport plus the read half for the caller to drive a read
    /// loop with (via [`read_frame_loop`]).
    pub fn new(stream: TcpStream) -> Result<(Arc<Self>, OwnedReadHalf)> {
        stream.set_nodelay(true).ok();
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let state = Arc::new(CloseState::default());

        tokio::spawn(Self::write_task(write_half, write_rx, state.clone()));

        Ok((
            Arc::new(Self {
                local,
                peer,
                write_tx,
                state,
            }),
            read_half,
        ))
    }

    async fn write_task(
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        state: Arc<CloseState>,
    ) {
        while let Some(chunk) = rx.recv().await {
            if let Err(err) = write_half.write_all(&chunk).await {
                debug!("stream transport write failed, closing: {err}");
                state.fire();
                return;
            }
        }
        // All senders dropped (transport closed by its owner): best-effort shutdown.
        let _ = write_half.shutdown().await;
        state.fire();
    }
}

impl Transport for StreamTransport {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn peer_endpoint(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn enqueue_write(&self, data: Bytes) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::Disconnected);
        }
        self.write_tx
            .send(data)
            .map_err(|_| Error::Disconnected)?;
        Ok(())
    }

    fn close(&self) {
        self.state.fire();
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn add_drop_listener(&self, listener: DropListener) {
        self.state.add_listener(listener);
    }
}

/// Reads `[4-byte length][payload]` frames from `read_half` until EOF or error, handing each
/// payload to `on_frame`. Closes `transport` on any I/O error or EOF, which fires drop listeners
/// and causes the paired write task to stop accepting work.
///
/// This is the spec's §4.D "read path: a small state machine alternates between reading length
/// and reading payload states" — expressed directly as sequential awaits since each connection
/// owns its own task rather than sharing a single reactor thread.
pub async fn read_frame_loop(
    mut read_half: OwnedReadHalf,
    transport: Arc<StreamTransport>,
    mut on_frame: impl FnMut(Vec<u8>) -> bool + Send,
) {
    const MAX_FRAME_BYTES: usize = 64 << 20;
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(err) = read_half.read_exact(&mut len_buf).await {
            trace!("stream read loop ending: {err}");
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            debug!("stream read loop got oversized frame length {len}, closing");
            break;
        }
        let mut payload = vec![0u8; len];
        if let Err(err) = read_half.read_exact(&mut payload).await {
            trace!("stream read loop ending mid-payload: {err}");
            break;
        }
        if !on_frame(payload) {
            break;
        }
    }
    transport.close();
}
