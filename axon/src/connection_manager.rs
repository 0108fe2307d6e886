//! Owns the process-wide set of live connections (spec §4.E).
//!
//! Grounded directly on `original_source/core/roscpp/src/libros/connection_manager.cpp`:
//! `addConnection`/`onConnectionDropped`/`removeDroppedConnections` map onto
//! [`ConnectionManager::track`] and the reap tick listener registered with [`crate::poll`];
//! `tcprosAcceptConnection`/`onConnectionHeaderReceived`'s dispatch-by-header-key becomes the
//! `InboundLink::Topic`/`InboundLink::Service` split below, delivered over a channel instead of a
//! virtual call so the connection manager never needs to know about the topic/service managers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use axon_common::{Error, Result};

use crate::connection::{Connection, ConnectionIdGenerator};
use crate::header::Header;
use crate::poll::PollSet;
use crate::transport::{DatagramTransport, StreamTransport};

/// Maximum single UDP payload used by datagram links (spec §4.B / scenario S6 exercises
/// fragmentation against exactly this MTU).
pub const DATAGRAM_MTU: usize = 1400;

/// An inbound TCP connection whose header has been read but not yet validated against a
/// concrete publication/service -- that's the topic/service manager's job.
pub struct InboundLink {
    pub id: u32,
    pub header: Header,
    pub stream: TcpStream,
}

/// Owns the stream listener, the live connection set and the dropped-connection reap cycle.
pub struct ConnectionManager {
    id_gen: ConnectionIdGenerator,
    stream_port: u16,
    live: Mutex<HashMap<u32, Arc<Connection>>>,
    advertise_host: Ipv4Addr,
}

impl ConnectionManager {
    /// Binds the stream listener on an ephemeral port and starts the accept loop, forwarding
    /// each inbound connection's header to `inbound_tx` once it has been read. Registers the
    /// dropped-connection reap as a tick listener on `poll_set`.
    pub async fn start(
        advertise_host: Ipv4Addr,
        poll_set: &PollSet,
        inbound_tx: mpsc::UnboundedSender<InboundLink>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((advertise_host, 0)).await?;
        let stream_port = listener.local_addr()?.port();

        let manager = Arc::new(Self {
            id_gen: ConnectionIdGenerator::default(),
            stream_port,
            live: Mutex::new(HashMap::new()),
            advertise_host,
        });

        tokio::spawn(Self::accept_loop(listener, inbound_tx));

        let reap_manager = manager.clone();
        poll_set.add_tick_listener(move || {
            reap_manager.reap_dropped();
        });

        Ok(manager)
    }

    async fn accept_loop(listener: TcpListener, inbound_tx: mpsc::UnboundedSender<InboundLink>) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(err) => {
                    warn!("connection manager accept loop failed: {err}");
                    continue;
                }
            };
            info!("connection manager accepted a connection from {peer}");
            let inbound_tx = inbound_tx.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                match Header::read_from(&mut stream).await {
                    Ok(header) => {
                        debug!("connection manager read inbound header: {header}");
                        // Note: the id is assigned by the caller once it knows whether this is a
                        // topic or service link; we hand the raw stream across unassigned.
                        let _ = inbound_tx.send(InboundLink { id: 0, header, stream });
                    }
                    Err(err) => {
                        warn!("failed to read inbound connection header from {peer}: {err}");
                    }
                }
            });
        }
    }

    pub fn next_connection_id(&self) -> u32 {
        self.id_gen.next()
    }

    pub fn stream_port(&self) -> u16 {
        self.stream_port
    }

    pub fn advertise_host(&self) -> Ipv4Addr {
        self.advertise_host
    }

    /// Registers a freshly negotiated connection in the live set and arranges for it to be
    /// reaped once its transport drops.
    pub fn track(&self, conn: Arc<Connection>) {
        self.live.lock().insert(conn.id, conn);
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.live.lock().get(&id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Tick-listener body: drops every connection whose transport has closed out of the live
    /// set. Mirrors `ConnectionManager::removeDroppedConnections` in the original source, but
    /// scans the live set directly instead of draining a separate dropped-list, since our
    /// per-connection drop listener only flips an atomic rather than pushing to a queue.
    fn reap_dropped(&self) {
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|_, conn| !conn.is_dropped());
        let reaped = before - live.len();
        if reaped > 0 {
            debug!("connection manager reaped {reaped} dropped connection(s)");
        }
    }

    /// Opens an outbound TCP connection to `addr` and wraps it in a [`StreamTransport`],
    /// returning the transport and the read half for the caller to drive a read loop with.
    pub async fn connect_stream(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<StreamTransport>, tokio::net::tcp::OwnedReadHalf)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::TransportError(e))?;
        StreamTransport::new(stream)
    }

    /// Binds a fresh ephemeral `UdpSocket` for one datagram link (spec §4.G: every accepted
    /// `DATAGRAM` `requestTopic` offer gets its own transport, demultiplexed by `connection_id`).
    pub async fn bind_datagram_link(&self, connection_id: u32) -> Result<Arc<DatagramTransport>> {
        let local = SocketAddr::new(IpAddr::V4(self.advertise_host), 0);
        DatagramTransport::bind(local, connection_id, DATAGRAM_MTU).await
    }

    /// Shuts down every live connection. Called from node shutdown.
    pub fn shutdown(&self) {
        let live = std::mem::take(&mut *self.live.lock());
        for (_, conn) in live {
            conn.close();
        }
    }
}
