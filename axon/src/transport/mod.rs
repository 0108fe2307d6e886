//! Transport abstractions (spec §4.B): a non-blocking stream transport and a datagram transport
//! behind one shared capability set.
//!
//! Grounded on `roslibrust/src/ros1/publisher.rs`'s tokio `TcpListener`/`TcpStream` accept loop,
//! generalized into an explicit [`Transport`] trait so the connection and topic/service managers
//! don't need to know which concrete variant backs a given link.

mod datagram;
mod stream;

pub use datagram::DatagramTransport;
pub use stream::{read_frame_loop, StreamTransport};

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use axon_common::Result;

/// A closure invoked once when a transport transitions to `closed`.
pub type DropListener = Box<dyn Fn() + Send + Sync>;

/// Shared capability set for both transport variants (spec §4.B).
///
/// Write enqueue is thread-safe from any task; actual reads only ever happen on the task that
/// owns the transport's read loop (the stand-in for the spec's single poll thread, see
/// [`crate::poll`]).
pub trait Transport: Send + Sync + 'static {
    /// The locally bound address this transport is listening/connected on.
    fn local_endpoint(&self) -> SocketAddr;

    /// The remote peer's address, if this transport represents an established link.
    fn peer_endpoint(&self) -> Option<SocketAddr>;

    /// Queues `data` to be written out. Returns once queued, not once sent.
    fn enqueue_write(&self, data: Bytes) -> Result<()>;

    /// Moves the transport to the terminal `closed` state and fires drop listeners.
    /// Idempotent.
    fn close(&self);

    /// True once `close` has been called or an I/O error has occurred.
    fn is_closed(&self) -> bool;

    /// Registers a listener fired exactly once when the transport closes. If the transport is
    /// already closed, the listener fires immediately (inline).
    fn add_drop_listener(&self, listener: DropListener);
}

/// Shared bookkeeping used by both transport implementations for the closed-state / drop
/// listener bit, so neither duplicates the logic.
#[derive(Default)]
pub(crate) struct CloseState {
    closed: std::sync::atomic::AtomicBool,
    listeners: Mutex<Vec<DropListener>>,
}

impl CloseState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Marks closed and fires every registered listener exactly once. Safe to call more than
    /// once; only the first call has any effect.
    pub(crate) fn fire(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn add_listener(&self, listener: DropListener) {
        if self.is_closed() {
            listener();
            return;
        }
        self.listeners.lock().push(listener);
    }
}

/// Encodes a message payload as the `[4-byte little-endian length][payload]` frame described in
/// spec §6, shared by both the stream read loop and the header handshake's message-after-header
/// writes (e.g. a latched publisher's cached last message).
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Strips the `[4-byte length]` prefix [`encode_frame`] adds, assuming `buf` is exactly one
/// already-delineated frame. Datagram reassembly delineates message boundaries itself (one
/// reassembled body per `send_frame` call), so the length prefix carried inside it is redundant
/// and just needs to be skipped rather than re-parsed.
pub fn strip_frame_prefix(buf: &[u8]) -> &[u8] {
    buf.get(4..).unwrap_or(&[])
}

pub(crate) type ArcTransport = Arc<dyn Transport>;
