use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use axon_common::{Error, Result};

use super::{CloseState, DropListener, Transport};

/// How long an incomplete fragmented message is kept before being discarded (spec §4.B: "an
/// implementer should choose" a timeout; documented decision in SPEC_FULL.md §4.B: 1 second).
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-packet header prefixing every datagram fragment (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FragmentHeader {
    connection_id: u32,
    message_id: u8,
    block_index: u16,
    block_count: u16,
    opcode: u8,
}

const FRAGMENT_HEADER_LEN: usize = 4 + 1 + 2 + 2 + 1;

/// First block of a message that is also bootstrapping a fresh datagram "connection" embeds the
/// connection header ahead of the message payload chunk.
const OPCODE_DATA: u8 = 0;
const OPCODE_FIRST_WITH_HEADER: u8 = 1;

impl FragmentHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.connection_id.to_le_bytes());
        out.push(self.message_id);
        out.extend_from_slice(&self.block_index.to_le_bytes());
        out.extend_from_slice(&self.block_count.to_le_bytes());
        out.push(self.opcode);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        Some(Self {
            connection_id: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            message_id: buf[4],
            block_index: u16::from_le_bytes(buf[5..7].try_into().ok()?),
            block_count: u16::from_le_bytes(buf[7..9].try_into().ok()?),
            opcode: buf[9],
        })
    }
}

struct PendingMessage {
    blocks: HashMap<u16, Vec<u8>>,
    block_count: u16,
    first_seen: Instant,
    has_embedded_header: bool,
}

/// Unreliable, message-oriented transport over a single `UdpSocket`, fragmenting messages larger
/// than `max_datagram_size` and reassembling them on receive (spec §4.B).
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: Mutex<Option<SocketAddr>>,
    connection_id: u32,
    max_datagram_size: usize,
    next_message_id: AtomicU8,
    state: Arc<CloseState>,
}

impl DatagramTransport {
    pub async fn bind(local: SocketAddr, connection_id: u32, max_datagram_size: usize) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let local = socket.local_addr()?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local,
            peer: Mutex::new(None),
            connection_id,
            max_datagram_size,
            next_message_id: AtomicU8::new(0),
            state: Arc::new(CloseState::default()),
        }))
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock() = Some(peer);
    }

    /// Fragments and sends `payload` (optionally preceded by an embedded connection header on
    /// the very first message of a fresh logical connection) to `peer`.
    pub async fn send_message(
        &self,
        peer: SocketAddr,
        payload: &[u8],
        embedded_header: Option<&[u8]>,
    ) -> Result<()> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut body = Vec::new();
        if let Some(header_bytes) = embedded_header {
            body.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
            body.extend_from_slice(header_bytes);
        }
        body.extend_from_slice(payload);

        let chunk_cap = self.max_datagram_size.saturating_sub(FRAGMENT_HEADER_LEN).max(1);
        let chunks: Vec<&[u8]> = body.chunks(chunk_cap).collect();
        let block_count = chunks.len().max(1) as u16;

        for (idx, chunk) in chunks.iter().enumerate() {
            let opcode = if idx == 0 && embedded_header.is_some() {
                OPCODE_FIRST_WITH_HEADER
            } else {
                OPCODE_DATA
            };
            let header = FragmentHeader {
                connection_id: self.connection_id,
                message_id,
                block_index: idx as u16,
                block_count,
                opcode,
            };
            let mut packet = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            header.encode(&mut packet);
            packet.extend_from_slice(chunk);
            self.socket.send_to(&packet, peer).await?;
        }
        Ok(())
    }

    /// Runs the receive loop: reassembles fragments addressed to `connection_id`, discarding any
    /// in-flight message that hasn't completed within [`REASSEMBLY_TIMEOUT`]. Complete reassembled
    /// bodies (header blob stripped off, if present) are handed to `on_message`.
    pub async fn run_receive_loop(
        self: Arc<Self>,
        mut on_message: impl FnMut(Option<Vec<u8>>, Vec<u8>) -> bool + Send,
    ) {
        let mut pending: HashMap<u8, PendingMessage> = HashMap::new();
        let mut buf = vec![0u8; 65536];
        loop {
            let sweep = tokio::time::sleep(REASSEMBLY_TIMEOUT);
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match recv {
                        Ok(v) => v,
                        Err(err) => {
                            debug!("datagram transport recv failed, closing: {err}");
                            break;
                        }
                    };
                    self.set_peer(from);
                    let Some(header) = FragmentHeader::decode(&buf[..len]) else {
                        warn!("datagram transport got a runt packet, dropping");
                        continue;
                    };
                    if header.connection_id != self.connection_id {
                        continue;
                    }
                    let chunk = buf[FRAGMENT_HEADER_LEN..len].to_vec();
                    let entry = pending.entry(header.message_id).or_insert_with(|| PendingMessage {
                        blocks: HashMap::new(),
                        block_count: header.block_count,
                        first_seen: Instant::now(),
                        has_embedded_header: false,
                    });
                    if header.block_index == 0 && header.opcode == OPCODE_FIRST_WITH_HEADER {
                        entry.has_embedded_header = true;
                    }
                    entry.blocks.insert(header.block_index, chunk);

                    if entry.blocks.len() as u16 == entry.block_count {
                        let completed = pending.remove(&header.message_id).unwrap();
                        let mut body = Vec::new();
                        let mut missing_block = false;
                        for idx in 0..completed.block_count {
                            match completed.blocks.get(&idx) {
                                Some(chunk) => body.extend_from_slice(chunk),
                                None => {
                                    warn!("datagram reassembly missing block {idx}, discarding message");
                                    missing_block = true;
                                    break;
                                }
                            }
                        }
                        if missing_block {
                            continue;
                        }
                        let (embedded_header, payload) =
                            split_embedded_header(&body, completed.has_embedded_header);
                        if !on_message(embedded_header, payload) {
                            break;
                        }
                    }
                }
                _ = sweep => {
                    let now = Instant::now();
                    let before = pending.len();
                    pending.retain(|_, msg| now.duration_since(msg.first_seen) < REASSEMBLY_TIMEOUT);
                    let dropped = before - pending.len();
                    if dropped > 0 {
                        trace!("datagram transport discarded {dropped} incomplete message(s) after reassembly timeout");
                    }
                }
            }
            if self.state.is_closed() {
                break;
            }
        }
        self.state.fire();
    }
}

fn split_embedded_header(body: &[u8], has_header: bool) -> (Option<Vec<u8>>, Vec<u8>) {
    if !has_header || body.len() < 4 {
        return (None, body.to_vec());
    }
    let header_len = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
    if body.len() < 4 + header_len {
        return (None, body.to_vec());
    }
    let header = body[4..4 + header_len].to_vec();
    let payload = body[4 + header_len..].to_vec();
    (Some(header), payload)
}

impl Transport for DatagramTransport {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn peer_endpoint(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    fn enqueue_write(&self, data: Bytes) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::Disconnected);
        }
        let Some(peer) = self.peer_endpoint() else {
            return Err(Error::Disconnected);
        };
        let socket = self.socket.clone();
        let connection_id = self.connection_id;
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let max_datagram_size = self.max_datagram_size;
        tokio::spawn(async move {
            let chunk_cap = max_datagram_size.saturating_sub(FRAGMENT_HEADER_LEN).max(1);
            let chunks: Vec<&[u8]> = data.chunks(chunk_cap).collect();
            let block_count = chunks.len().max(1) as u16;
            for (idx, chunk) in chunks.iter().enumerate() {
                let header = FragmentHeader {
                    connection_id,
                    message_id,
                    block_index: idx as u16,
                    block_count,
                    opcode: OPCODE_DATA,
                };
                let mut packet = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
                header.encode(&mut packet);
                packet.extend_from_slice(chunk);
                let _ = socket.send_to(&packet, peer).await;
            }
        });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fragments_reassemble_exactly() {
        let a = DatagramTransport::bind("127.0.0.1:0".parse().unwrap(), 1, 64).await.unwrap();
        let b = DatagramTransport::bind("127.0.0.1:0".parse().unwrap(), 1, 64).await.unwrap();
        let b_addr = b.local_endpoint();
        a.set_peer(b_addr);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let payload_clone = payload.clone();
        let recv_task = tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::channel(1);
            tokio::spawn(b.run_receive_loop(move |_h, body| {
                let _ = tx.try_send(body);
                false
            }));
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap()
        });

        a.send_message(b_addr, &payload_clone, None).await.unwrap();
        let received = recv_task.await.unwrap();
        assert_eq!(received, payload);
    }
}
