//! The service manager (spec §4.H): owns service servers and clients and drives the
//! request/response framing over a persistent or one-shot stream connection.
//!
//! Grounded on the same `original_source/core/roscpp/src/libros/connection_manager.cpp`
//! header-key dispatch as [`crate::topic_manager`] (this time keyed on `service` rather than
//! `topic`), and on `roslibrust/src/ros1/publisher.rs`'s handshake/md5-validation shape. The
//! type-erasure pattern (`ErasedServer`, `as_any_arc`) is reused verbatim from the topic manager
//! since both managers solve the same "heterogeneous generic records in one map" problem.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use axon_common::{Error, MessageType, Result, ServiceFn, ServiceType};

use crate::callback_queue::{CallbackQueue, OwnerToken};
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::header::{md5_compatible, Header};
use crate::master::MasterClient;
use crate::transport::Transport;

/// Type-erased view of a service server, so the manager can hold servers of unrelated
/// request/response types in one map.
#[async_trait]
trait ErasedServer: Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn service_name(&self) -> &'static str;
    fn md5sum(&self) -> &'static str;
    fn request_type_name(&self) -> &'static str;
    fn response_type_name(&self) -> &'static str;
    /// Deserializes `request`, posts the handler invocation to this server's callback queue, and
    /// waits for it to run and serialize a result. The round trip through the queue is what lets
    /// a user choose which execution context (single-/multi-threaded spinner) actually runs the
    /// handler body, while this function's caller only cares about the framed bytes.
    async fn dispatch(&self, request: Vec<u8>) -> std::result::Result<Vec<u8>, String>;
}

struct ServerRecord<T: ServiceType> {
    handler: Arc<dyn ServiceFn<T>>,
    queue: Arc<CallbackQueue>,
    owner: OwnerToken,
}

#[async_trait]
impl<T: ServiceType> ErasedServer for ServerRecord<T> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn service_name(&self) -> &'static str {
        T::SERVICE_NAME
    }

    fn md5sum(&self) -> &'static str {
        T::MD5SUM
    }

    fn request_type_name(&self) -> &'static str {
        T::Request::DATA_TYPE_NAME
    }

    fn response_type_name(&self) -> &'static str {
        T::Response::DATA_TYPE_NAME
    }

    async fn dispatch(&self, request: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
        let handler = self.handler.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.add_callback(
            move || {
                let result = (|| {
                    let request: T::Request =
                        serde_rosmsg::from_slice(&request).map_err(|e| e.to_string())?;
                    let response = handler(request).map_err(|e| e.to_string())?;
                    serde_rosmsg::to_vec(&response).map_err(|e| e.to_string())
                })();
                let _ = tx.send(result);
            },
            self.owner,
            None,
            0,
        );
        rx.await.map_err(|_| "service handler was dropped before it ran".to_string())?
    }
}

struct ServerSlot {
    record: Arc<dyn ErasedServer>,
    handle_count: usize,
}

/// Owns every locally advertised service server for one node. Clients are stateless request/
/// response sessions and don't need persistent bookkeeping beyond the connection itself, so
/// [`ServiceManager::call`] opens, uses and (for non-persistent calls) tears down its own
/// connection inline rather than through a slot map.
pub struct ServiceManager {
    master: Arc<MasterClient>,
    caller_id: String,
    caller_api: String,
    connection_manager: Arc<ConnectionManager>,
    servers: Mutex<HashMap<String, ServerSlot>>,
}

impl ServiceManager {
    pub fn new(
        master: Arc<MasterClient>,
        caller_id: impl Into<String>,
        caller_api: impl Into<String>,
        connection_manager: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            master,
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
            connection_manager,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Advertises `service`, registering `handler` to run (via `queue`) for every incoming call.
    /// Idempotent per service name for a compatible type; fails with `TypeMismatch` if an
    /// existing server on this name has a different type.
    pub async fn advertise<T: ServiceType>(
        &self,
        service: &str,
        owner: OwnerToken,
        queue: Arc<CallbackQueue>,
        handler: impl ServiceFn<T>,
    ) -> Result<()> {
        {
            let mut servers = self.servers.lock();
            if let Some(slot) = servers.get_mut(service) {
                if slot.record.service_name() != T::SERVICE_NAME {
                    return Err(Error::TypeMismatch {
                        expected: slot.record.service_name().to_string(),
                        actual: T::SERVICE_NAME.to_string(),
                    });
                }
                slot.handle_count += 1;
                return Ok(());
            }
            let record = Arc::new(ServerRecord::<T> {
                handler: Arc::new(handler),
                queue,
                owner,
            });
            servers.insert(service.to_string(), ServerSlot { record, handle_count: 1 });
        }

        let service_uri = format!(
            "rosrpc://{}:{}",
            self.connection_manager.advertise_host(),
            self.connection_manager.stream_port()
        );
        self.master
            .register_service(&self.caller_id, service, &service_uri, &self.caller_api)
            .await;
        info!("advertised service {service} as {}", T::SERVICE_NAME);
        Ok(())
    }

    pub async fn unadvertise(&self, service: &str) {
        let should_unregister = {
            let mut servers = self.servers.lock();
            match servers.get_mut(service) {
                Some(slot) => {
                    slot.handle_count = slot.handle_count.saturating_sub(1);
                    if slot.handle_count == 0 {
                        servers.remove(service);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if should_unregister {
            let service_uri = format!(
                "rosrpc://{}:{}",
                self.connection_manager.advertise_host(),
                self.connection_manager.stream_port()
            );
            if let Err(err) = self.master.unregister_service(&self.caller_id, service, &service_uri).await {
                warn!("unregisterService({service}) failed: {err}");
            }
        }
    }

    /// Ambient introspection: locally advertised service names with type names.
    pub fn get_services(&self) -> Vec<(String, String)> {
        self.servers
            .lock()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.record.service_name().to_string()))
            .collect()
    }

    /// Validates an inbound connection's header against a server (the `service` key was present)
    /// and, on success, spawns the task that reads and answers every subsequent request on this
    /// connection. Mirrors `accept_subscriber_link`'s role in `crate::topic_manager`: reads come
    /// off the raw `read_half` directly (response framing needs a synchronous round trip per
    /// request, unlike a subscription's fire-and-forget message stream), and responses are
    /// written back out through `transport`'s queue like every other outbound frame.
    pub fn accept_server_link(
        &self,
        service_key: &str,
        peer_header: &Header,
        conn: Arc<Connection>,
        transport: Arc<crate::transport::StreamTransport>,
        read_half: OwnedReadHalf,
    ) -> Result<()> {
        let record = {
            let servers = self.servers.lock();
            let Some(slot) = servers.get(service_key) else {
                return Err(Error::HeaderError(format!("no service server for {service_key}")));
            };
            let their_md5 = peer_header.get("md5sum").unwrap_or("*");
            if !md5_compatible(slot.record.md5sum(), their_md5) {
                return Err(Error::TypeMismatch {
                    expected: slot.record.md5sum().to_string(),
                    actual: their_md5.to_string(),
                });
            }
            slot.record.clone()
        };
        let accept_header = Header::new()
            .with("callerid", self.caller_id.clone())
            .with("type", record.service_name())
            .with("request_type", record.request_type_name())
            .with("response_type", record.response_type_name())
            .with("md5sum", record.md5sum());
        conn.send_header(&accept_header)?;
        let persistent = peer_header.get("persistent").map(|v| v == "1").unwrap_or(false);
        tokio::spawn(serve_requests(record, conn, transport, read_half, persistent));
        Ok(())
    }

    /// Looks up `service` via the directory, connects, negotiates the handshake, sends `request`
    /// and reads back the response. `persistent` connections are left open for the caller to
    /// reuse via [`Self::call_on`]; non-persistent ones are torn down after the single exchange.
    pub async fn call<T: ServiceType>(&self, service: &str, request: &T::Request, persistent: bool) -> Result<T::Response> {
        let uri = self.master.lookup_service(&self.caller_id, service).await?;
        let addr = parse_rosrpc_uri(&uri)?;
        let (transport, read_half) = self.connection_manager.connect_stream(addr).await?;

        let our_header = Header::new()
            .with("service", service)
            .with("callerid", self.caller_id.clone())
            .with("md5sum", T::MD5SUM)
            .with("persistent", if persistent { "1" } else { "0" });
        transport.enqueue_write(bytes::Bytes::from(our_header.to_bytes()))?;

        let mut read_half = read_half;
        let peer_header = Header::read_from(&mut read_half).await?;
        if peer_header.is_error() {
            return Err(Error::HeaderError(format!(
                "service server rejected our call to {service}: {:?}",
                peer_header.get("error")
            )));
        }
        let their_md5 = peer_header.get("md5sum").unwrap_or("*");
        if !md5_compatible(T::MD5SUM, their_md5) {
            return Err(Error::TypeMismatch {
                expected: T::MD5SUM.to_string(),
                actual: their_md5.to_string(),
            });
        }

        let body = serde_rosmsg::to_vec(request).map_err(|e| Error::SerializationError(e.to_string()))?;
        transport.enqueue_write(encode_request_frame(&body))?;

        let response = read_response_frame(&mut read_half).await?;
        transport.close();
        Ok(response)
    }

    /// Same as [`Self::call`] but driven over an already-open persistent connection the caller
    /// is reusing (spec §4.H "reuse the connection until the client handle is dropped").
    pub async fn call_on<T: ServiceType>(
        &self,
        transport: &Arc<crate::transport::StreamTransport>,
        read_half: &mut OwnedReadHalf,
        request: &T::Request,
    ) -> Result<T::Response> {
        let body = serde_rosmsg::to_vec(request).map_err(|e| Error::SerializationError(e.to_string()))?;
        transport.enqueue_write(encode_request_frame(&body))?;
        read_response_frame(read_half).await
    }

    /// Opens a persistent connection to `service` without issuing a call yet, for a client
    /// handle that wants to hold the link open across multiple [`Self::call_on`] invocations.
    pub async fn open_persistent(
        &self,
        service: &str,
        expected_md5: &str,
    ) -> Result<(Arc<crate::transport::StreamTransport>, OwnedReadHalf)> {
        let uri = self.master.lookup_service(&self.caller_id, service).await?;
        let addr = parse_rosrpc_uri(&uri)?;
        let (transport, mut read_half) = self.connection_manager.connect_stream(addr).await?;

        let our_header = Header::new()
            .with("service", service)
            .with("callerid", self.caller_id.clone())
            .with("md5sum", expected_md5)
            .with("persistent", "1");
        transport.enqueue_write(bytes::Bytes::from(our_header.to_bytes()))?;

        let peer_header = Header::read_from(&mut read_half).await?;
        if peer_header.is_error() {
            return Err(Error::HeaderError(format!(
                "service server rejected persistent connection to {service}: {:?}",
                peer_header.get("error")
            )));
        }
        let their_md5 = peer_header.get("md5sum").unwrap_or("*");
        if !md5_compatible(expected_md5, their_md5) {
            return Err(Error::TypeMismatch {
                expected: expected_md5.to_string(),
                actual: their_md5.to_string(),
            });
        }
        Ok((transport, read_half))
    }
}

/// Serves requests on one already-negotiated service connection until it errors, closes, or (for
/// non-persistent connections) the first request/response exchange completes.
async fn serve_requests(
    record: Arc<dyn ErasedServer>,
    conn: Arc<Connection>,
    transport: Arc<crate::transport::StreamTransport>,
    mut read_half: OwnedReadHalf,
    persistent: bool,
) {
    loop {
        let request = match read_request_frame(&mut read_half).await {
            Ok(req) => req,
            Err(err) => {
                debug!("service connection {} read ended: {err}", conn.id);
                break;
            }
        };

        let frame = match record.dispatch(request).await {
            Ok(response) => {
                let mut out = Vec::with_capacity(response.len() + 5);
                out.push(1u8);
                out.extend_from_slice(&(response.len() as u32).to_le_bytes());
                out.extend_from_slice(&response);
                out
            }
            Err(reason) => {
                let mut out = Vec::with_capacity(reason.len() + 5);
                out.push(0u8);
                out.extend_from_slice(&(reason.len() as u32).to_le_bytes());
                out.extend_from_slice(reason.as_bytes());
                out
            }
        };
        if let Err(err) = transport.enqueue_write(bytes::Bytes::from(frame)) {
            debug!("service connection {} write failed: {err}", conn.id);
            break;
        }

        if !persistent {
            break;
        }
    }
    conn.close();
}

async fn read_request_frame(read_half: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    const MAX_REQUEST_BYTES: usize = 64 << 20;
    if len > MAX_REQUEST_BYTES {
        return Err(Error::SerializationError(format!(
            "service request claims {len} bytes, exceeding the {MAX_REQUEST_BYTES} byte cap"
        )));
    }
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    Ok(payload)
}

fn encode_request_frame(body: &[u8]) -> bytes::Bytes {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    bytes::Bytes::from(out)
}

async fn read_response_frame<T: MessageType>(read_half: &mut OwnedReadHalf) -> Result<T> {
    let mut ok_byte = [0u8; 1];
    read_half.read_exact(&mut ok_byte).await?;
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    const MAX_RESPONSE_BYTES: usize = 64 << 20;
    if len > MAX_RESPONSE_BYTES {
        return Err(Error::SerializationError(format!(
            "service response claims {len} bytes, exceeding the {MAX_RESPONSE_BYTES} byte cap"
        )));
    }
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    if ok_byte[0] == 0 {
        let reason = String::from_utf8_lossy(&payload).to_string();
        return Err(Error::ServerError(reason));
    }
    serde_rosmsg::from_slice(&payload).map_err(|e| Error::SerializationError(e.to_string()))
}

fn parse_rosrpc_uri(uri: &str) -> Result<SocketAddr> {
    let stripped = uri.strip_prefix("rosrpc://").unwrap_or(uri);
    stripped
        .parse()
        .or_else(|_| {
            let mut parts = stripped.trim_end_matches('/').rsplitn(2, ':');
            let port: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(|| {
                Error::HeaderError(format!("malformed service uri {uri}"))
            })?;
            let host = parts.next().ok_or_else(|| Error::HeaderError(format!("malformed service uri {uri}")))?;
            format!("{host}:{port}")
                .parse()
                .map_err(|_| Error::HeaderError(format!("unresolvable service uri {uri}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rosrpc_uri() {
        let addr = parse_rosrpc_uri("rosrpc://127.0.0.1:9000").unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(parse_rosrpc_uri("not-a-uri").is_err());
    }

    #[test]
    fn request_frame_round_trips_length_prefix() {
        let body = b"hello".to_vec();
        let framed = encode_request_frame(&body);
        let len = u32::from_le_bytes(framed[..4].try_into().unwrap()) as usize;
        assert_eq!(len, body.len());
        assert_eq!(&framed[4..], &body[..]);
    }
}
