//! The live connection record and its handshake state machine (spec §3 "Connection", §4.D).
//!
//! A [`Connection`] is only ever constructed *after* a handshake has completed successfully — the
//! handshake itself (reading/writing [`Header`]s over the raw socket) is performed by whoever
//! accepts or opens the socket ([`crate::connection_manager`] for inbound links,
//! [`crate::topic_manager`]/[`crate::service_manager`] for outbound ones) because only they know
//! the role-specific validation rules.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use axon_common::{Error, Result};

use crate::header::Header;
use crate::transport::{encode_frame, ArcTransport, DropListener};

/// Process-wide monotonically increasing connection id generator.
#[derive(Default)]
pub struct ConnectionIdGenerator(AtomicU32);

impl ConnectionIdGenerator {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// What kind of peer this connection was negotiated with, derived from which header key was
/// present on the inbound handshake (spec §4.E: `topic` -> subscriber link, `service` -> service
/// link, neither -> protocol error).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We are a publisher; this connection is a remote subscriber pulling our messages.
    PublicationLink,
    /// We are a subscriber; this connection is a remote publisher pushing us messages.
    SubscriptionLink,
    /// We are a service server; this connection is a remote client issuing calls.
    ServiceServerLink,
    /// We are a service client; this connection is to a remote service server.
    ServiceClientLink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    HeaderSent = 1,
    Active = 2,
    Dropped = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::New,
            1 => ConnState::HeaderSent,
            2 => ConnState::Active,
            _ => ConnState::Dropped,
        }
    }
}

/// A single peer connection: a transport plus the negotiated header and role.
pub struct Connection {
    pub id: u32,
    pub role: Role,
    transport: ArcTransport,
    peer_header: Mutex<Option<Header>>,
    state: AtomicU8,
}

impl Connection {
    /// Constructs a connection record for an already-negotiated link. `peer_header` is the
    /// header the *other* side sent us.
    pub fn new(id: u32, role: Role, transport: ArcTransport, peer_header: Header) -> Arc<Self> {
        let conn = Arc::new(Self {
            id,
            role,
            transport,
            peer_header: Mutex::new(Some(peer_header)),
            state: AtomicU8::new(ConnState::Active as u8),
        });
        conn.transport.add_drop_listener({
            let conn = Arc::downgrade(&conn);
            Box::new(move || {
                if let Some(conn) = conn.upgrade() {
                    conn.mark_dropped();
                }
            }) as DropListener
        });
        conn
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn mark_dropped(&self) {
        self.state.store(ConnState::Dropped as u8, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.state() == ConnState::Dropped
    }

    pub fn peer_header(&self) -> Option<Header> {
        self.peer_header.lock().clone()
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.transport.local_endpoint()
    }

    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.transport.peer_endpoint()
    }

    /// Enqueues a raw, already-framed payload for write. Used for message frames.
    pub fn send_frame(&self, payload: &[u8]) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::Disconnected);
        }
        self.transport.enqueue_write(encode_frame(payload))
    }

    /// Enqueues a header, length-prefixed per the header wire format (not the message frame
    /// format -- `Header::to_bytes` already includes its own length prefix).
    pub fn send_header(&self, header: &Header) -> Result<()> {
        self.transport
            .enqueue_write(Bytes::from(header.to_bytes()))
    }

    pub fn add_drop_listener(&self, listener: DropListener) {
        self.transport.add_drop_listener(listener);
    }

    pub fn close(&self) {
        self.mark_dropped();
        self.transport.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        log::trace!("connection {} dropped", self.id);
    }
}
