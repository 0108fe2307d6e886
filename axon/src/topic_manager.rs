//! The topic manager (spec §4.G): owns publications and subscriptions and drives their
//! lifecycle against the directory.
//!
//! Grounded on `roslibrust/src/ros1/publisher.rs`'s `Publication`/`ConnectionHeader` handling for
//! the per-link handshake and latching replay, and on
//! `original_source/core/roscpp/src/libros/connection_manager.cpp`'s header-key dispatch for how
//! an inbound link gets matched to a publication or subscription. Type erasure (`ErasedPublication`
//! / `ErasedSubscription`) is this crate's own generalization: the teacher's `Publication` is
//! monomorphic per call site, but the manager here has to hold publications of unrelated message
//! types in one map.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use axon_common::{Error, MessageType, Result};

use crate::callback_queue::{CallbackQueue, OwnerToken};
use crate::connection::{Connection, ConnectionIdGenerator, Role};
use crate::connection_manager::ConnectionManager;
use crate::header::{md5_compatible, Header};
use crate::master::{MasterClient, NodeClient, Value};
use crate::transport::{read_frame_loop, strip_frame_prefix, DatagramTransport, StreamTransport, Transport};

/// Type-erased view of a publication, so the manager can hold publications of unrelated message
/// types in one map.
trait ErasedPublication: Send + Sync {
    /// Upcasts to `Arc<dyn Any>` so a caller who already knows the concrete `T` can downcast
    /// back to `Arc<PublicationRecord<T>>` (object-safe via an `Arc<Self>` receiver).
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
    fn md5sum(&self) -> &'static str;
    fn definition(&self) -> &'static str;
    fn latching(&self) -> bool;
    fn link_ids(&self) -> Vec<u32>;
    fn add_link(&self, id: u32, conn: Arc<Connection>);
    fn drop_link(&self, id: u32);
    fn last_message_bytes(&self) -> Option<Vec<u8>>;
}

pub(crate) struct PublicationRecord<T: MessageType> {
    links: Mutex<HashMap<u32, Arc<Connection>>>,
    latching: bool,
    last_message: Mutex<Option<Arc<T>>>,
}

impl<T: MessageType> ErasedPublication for PublicationRecord<T> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        T::DATA_TYPE_NAME
    }

    fn md5sum(&self) -> &'static str {
        T::MD5SUM
    }

    fn definition(&self) -> &'static str {
        T::DEFINITION
    }

    fn latching(&self) -> bool {
        self.latching
    }

    fn link_ids(&self) -> Vec<u32> {
        self.links.lock().keys().copied().collect()
    }

    fn add_link(&self, id: u32, conn: Arc<Connection>) {
        self.links.lock().insert(id, conn);
    }

    fn drop_link(&self, id: u32) {
        self.links.lock().remove(&id);
    }

    fn last_message_bytes(&self) -> Option<Vec<u8>> {
        let last = self.last_message.lock();
        last.as_ref().and_then(|m| serde_rosmsg::to_vec(m.as_ref()).ok())
    }
}

/// Type-erased view of a subscription.
trait ErasedSubscription: Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
    fn md5sum(&self) -> &'static str;
    fn deliver_raw(&self, payload: &[u8]);
    fn deliver_typed_any(&self, msg: Arc<dyn Any + Send + Sync>);
    fn link_ids(&self) -> Vec<u32>;
    fn add_link(&self, id: u32, conn: Arc<Connection>);
    fn drop_link(&self, id: u32);
    fn remove_owner(&self, owner: OwnerToken);
    fn callback_count(&self) -> usize;
}

#[derive(Clone)]
struct CallbackEntry<T> {
    owner: OwnerToken,
    queue: Arc<CallbackQueue>,
    func: Arc<dyn Fn(Arc<T>) + Send + Sync>,
    /// Bounds how many of this callback's dispatches may sit pending in `queue` at once; `0`
    /// means unbounded (spec: the subscription's `queue_size` field, spec.md:147).
    queue_size: usize,
}

pub(crate) struct SubscriptionRecord<T: MessageType> {
    callbacks: Mutex<Vec<CallbackEntry<T>>>,
    links: Mutex<HashMap<u32, Arc<Connection>>>,
}

impl<T: MessageType> SubscriptionRecord<T> {
    fn dispatch(&self, msg: Arc<T>) {
        let callbacks = self.callbacks.lock().clone();
        for cb in callbacks {
            let msg = msg.clone();
            let func = cb.func.clone();
            cb.queue.add_callback(move || func(msg), cb.owner, None, cb.queue_size);
        }
    }
}

impl<T: MessageType> ErasedSubscription for SubscriptionRecord<T> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        T::DATA_TYPE_NAME
    }

    fn md5sum(&self) -> &'static str {
        T::MD5SUM
    }

    fn deliver_raw(&self, payload: &[u8]) {
        match serde_rosmsg::from_slice::<T>(payload) {
            Ok(msg) => self.dispatch(Arc::new(msg)),
            Err(err) => warn!("failed to deserialize a message for {}: {err}", T::DATA_TYPE_NAME),
        }
    }

    fn deliver_typed_any(&self, msg: Arc<dyn Any + Send + Sync>) {
        if let Ok(msg) = msg.downcast::<T>() {
            self.dispatch(msg);
        }
    }

    fn link_ids(&self) -> Vec<u32> {
        self.links.lock().keys().copied().collect()
    }

    fn add_link(&self, id: u32, conn: Arc<Connection>) {
        self.links.lock().insert(id, conn);
    }

    fn drop_link(&self, id: u32) {
        self.links.lock().remove(&id);
    }

    fn remove_owner(&self, owner: OwnerToken) {
        self.callbacks.lock().retain(|cb| cb.owner != owner);
    }

    fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }
}

struct PublicationSlot {
    record: Arc<dyn ErasedPublication>,
    handle_count: usize,
}

struct SubscriptionSlot {
    record: Arc<dyn ErasedSubscription>,
    handle_count: usize,
    known_publishers: Vec<String>,
    links_by_uri: HashMap<String, u32>,
}

/// Owns every locally known publication and subscription for one node.
pub struct TopicManager {
    master: Arc<MasterClient>,
    node_client: NodeClient,
    caller_id: String,
    caller_api: String,
    connection_manager: Arc<ConnectionManager>,
    datagram_ids: ConnectionIdGenerator,
    publications: Mutex<HashMap<String, PublicationSlot>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSlot>>,
}

impl TopicManager {
    pub fn new(
        master: Arc<MasterClient>,
        caller_id: impl Into<String>,
        caller_api: impl Into<String>,
        connection_manager: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            master,
            node_client: NodeClient::new(),
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
            connection_manager,
            datagram_ids: ConnectionIdGenerator::default(),
            publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Advertises `topic`. Idempotent per topic per process for a compatible message type;
    /// fails with `TypeMismatch` if an existing publication on this topic has a different type.
    pub async fn advertise<T: MessageType>(
        self: &Arc<Self>,
        topic: &str,
        latching: bool,
    ) -> Result<Arc<PublicationRecord<T>>> {
        {
            let mut pubs = self.publications.lock();
            if let Some(slot) = pubs.get_mut(topic) {
                return match slot.record.clone().as_any_arc().downcast::<PublicationRecord<T>>() {
                    Ok(record) => {
                        slot.handle_count += 1;
                        Ok(record)
                    }
                    Err(_) => Err(Error::TypeMismatch {
                        expected: slot.record.type_name().to_string(),
                        actual: T::DATA_TYPE_NAME.to_string(),
                    }),
                };
            }
        }

        let record = Arc::new(PublicationRecord::<T> {
            links: Mutex::new(HashMap::new()),
            latching,
            last_message: Mutex::new(None),
        });
        self.publications.lock().insert(
            topic.to_string(),
            PublicationSlot { record: record.clone(), handle_count: 1 },
        );

        let _subscriber_uris = self
            .master
            .register_publisher(&self.caller_id, topic, T::DATA_TYPE_NAME, &self.caller_api)
            .await;
        info!("advertised {topic} as {}", T::DATA_TYPE_NAME);
        Ok(record)
    }

    pub async fn unadvertise(&self, topic: &str) {
        let should_unregister = {
            let mut pubs = self.publications.lock();
            match pubs.get_mut(topic) {
                Some(slot) => {
                    slot.handle_count = slot.handle_count.saturating_sub(1);
                    if slot.handle_count == 0 {
                        pubs.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if should_unregister {
            if let Err(err) = self.master.unregister_publisher(&self.caller_id, topic, &self.caller_api).await {
                warn!("unregisterPublisher({topic}) failed: {err}");
            }
        }
    }

    /// Subscribes to `topic`, registering one callback owned by `owner` on `queue`, bounded to
    /// at most `queue_size` pending dispatches (`0` = unbounded, spec.md:47/147). Multiple
    /// subscriptions to the same topic coalesce into one directory registration; each call just
    /// adds another callback.
    pub async fn subscribe<T: MessageType>(
        self: &Arc<Self>,
        topic: &str,
        owner: OwnerToken,
        queue: Arc<CallbackQueue>,
        queue_size: usize,
        callback: impl Fn(Arc<T>) + Send + Sync + 'static,
    ) -> Result<Arc<SubscriptionRecord<T>>> {
        let is_new = {
            let mut subs = self.subscriptions.lock();
            match subs.get_mut(topic) {
                Some(slot) => {
                    if slot.record.type_name() != T::DATA_TYPE_NAME {
                        return Err(Error::TypeMismatch {
                            expected: slot.record.type_name().to_string(),
                            actual: T::DATA_TYPE_NAME.to_string(),
                        });
                    }
                    slot.handle_count += 1;
                    false
                }
                None => {
                    let record = Arc::new(SubscriptionRecord::<T> {
                        callbacks: Mutex::new(Vec::new()),
                        links: Mutex::new(HashMap::new()),
                    });
                    subs.insert(
                        topic.to_string(),
                        SubscriptionSlot {
                            record,
                            handle_count: 1,
                            known_publishers: Vec::new(),
                            links_by_uri: HashMap::new(),
                        },
                    );
                    true
                }
            }
        };

        let record = self.typed_subscription::<T>(topic).expect("just inserted");
        record.callbacks.lock().push(CallbackEntry {
            owner,
            queue,
            func: Arc::new(callback),
            queue_size,
        });

        if is_new {
            let publishers = self
                .master
                .register_subscriber(&self.caller_id, topic, T::DATA_TYPE_NAME, &self.caller_api)
                .await;
            self.connect_to_publishers(topic, publishers).await;
        }

        Ok(record)
    }

    pub async fn unsubscribe(&self, topic: &str, owner: OwnerToken) {
        let (should_unregister, erased) = {
            let mut subs = self.subscriptions.lock();
            match subs.get_mut(topic) {
                Some(slot) => {
                    slot.record.remove_owner(owner);
                    slot.handle_count = slot.handle_count.saturating_sub(1);
                    if slot.handle_count == 0 {
                        let erased = subs.remove(topic).map(|s| s.record);
                        (true, erased)
                    } else {
                        (false, None)
                    }
                }
                None => (false, None),
            }
        };
        if let Some(erased) = erased {
            for id in erased.link_ids() {
                if let Some(conn) = self.connection_manager.get(id) {
                    conn.close();
                }
            }
        }
        if should_unregister {
            if let Err(err) = self.master.unregister_subscriber(&self.caller_id, topic, &self.caller_api).await {
                warn!("unregisterSubscriber({topic}) failed: {err}");
            }
        }
    }

    /// Publishes `message` on `publication`: serializes once for every network link, replaces
    /// the latched cache if applicable, and delivers directly (no serialization) to any local
    /// subscription on the same topic with a matching type.
    pub fn publish<T: MessageType>(&self, topic: &str, publication: &Arc<PublicationRecord<T>>, message: &T) -> Result<()> {
        let links: Vec<Arc<Connection>> = publication.links.lock().values().cloned().collect();
        if !links.is_empty() {
            let bytes = serde_rosmsg::to_vec(message)
                .map_err(|e| Error::SerializationError(e.to_string()))?;
            for link in links {
                if let Err(err) = link.send_frame(&bytes) {
                    debug!("publish on {topic}: link {} send failed: {err}", link.id);
                }
            }
        }

        if publication.latching {
            *publication.last_message.lock() = Some(Arc::new(message.clone()));
        }

        if let Some(sub) = self.subscriptions.lock().get(topic).map(|s| s.record.clone()) {
            if sub.type_name() == T::DATA_TYPE_NAME {
                let msg: Arc<dyn Any + Send + Sync> = Arc::new(message.clone());
                sub.deliver_typed_any(msg);
            }
        }

        Ok(())
    }

    /// Ambient introspection: locally known publications and subscriptions with type names.
    pub fn get_topics(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (topic, slot) in self.publications.lock().iter() {
            out.push((topic.clone(), slot.record.type_name().to_string()));
        }
        for (topic, slot) in self.subscriptions.lock().iter() {
            out.push((topic.clone(), slot.record.type_name().to_string()));
        }
        out
    }

    /// Called from the directory-RPC server's `publisherUpdate` handler: diffs against the
    /// subscription's currently known peers and opens/closes links accordingly.
    pub async fn handle_publisher_update(&self, topic: &str, publisher_uris: Vec<String>) {
        let (to_add, to_remove, record) = {
            let mut subs = self.subscriptions.lock();
            let Some(slot) = subs.get_mut(topic) else { return };
            let to_add: Vec<String> = publisher_uris
                .iter()
                .filter(|u| !slot.known_publishers.contains(u))
                .cloned()
                .collect();
            let to_remove: Vec<String> = slot
                .known_publishers
                .iter()
                .filter(|u| !publisher_uris.contains(u))
                .cloned()
                .collect();
            slot.known_publishers = publisher_uris;
            (to_add, to_remove, slot.record.clone())
        };

        for uri in to_remove {
            debug!("{topic}: publisher {uri} disappeared, dropping its link");
            let id = self.subscriptions.lock().get_mut(topic).and_then(|s| s.links_by_uri.remove(&uri));
            if let Some(id) = id {
                record.drop_link(id);
                if let Some(conn) = self.connection_manager.get(id) {
                    conn.close();
                }
            }
        }

        if !to_add.is_empty() {
            self.connect_to_publishers(topic, to_add).await;
        }
    }

    /// Called from the directory-RPC server's `requestTopic` handler: we are the publisher being
    /// asked how a subscriber should connect. Prefers `STREAM` when offered (reliable delivery is
    /// the conventional default); falls back to `DATAGRAM` only when the caller didn't offer
    /// `STREAM` at all.
    pub async fn handle_request_topic(self: &Arc<Self>, topic: &str, protocols: &[Value]) -> Result<Value> {
        let offers_stream = protocol_offered(protocols, "stream");
        let offers_datagram = protocol_offered(protocols, "datagram");

        let host = self.connection_manager.advertise_host().to_string();
        if !offers_stream && offers_datagram {
            let connection_id = self.datagram_ids.next();
            let transport = self.connection_manager.bind_datagram_link(connection_id).await?;
            let port = transport.local_endpoint().port();
            self.spawn_datagram_publication_link(topic.to_string(), transport);
            Ok(Value::Array(vec![
                Value::String("DATAGRAM".into()),
                Value::String(host),
                Value::Int(port as i32),
                Value::Int(connection_id as i32),
            ]))
        } else {
            Ok(Value::Array(vec![
                Value::String("STREAM".into()),
                Value::String(host),
                Value::Int(self.connection_manager.stream_port() as i32),
            ]))
        }
    }

    /// Validates and registers an inbound datagram link once its embedded connection header has
    /// arrived, mirroring [`Self::accept_subscriber_link`]'s checks for the stream path.
    fn accept_subscriber_datagram_link(
        &self,
        topic_key: &str,
        peer_header: &Header,
        transport: Arc<DatagramTransport>,
    ) -> Result<Arc<Connection>> {
        let pubs = self.publications.lock();
        let Some(slot) = pubs.get(topic_key) else {
            return Err(Error::HeaderError(format!("no publication for topic {topic_key}")));
        };
        let their_md5 = peer_header.get("md5sum").unwrap_or("*");
        if !md5_compatible(slot.record.md5sum(), their_md5) {
            return Err(Error::TypeMismatch {
                expected: slot.record.md5sum().to_string(),
                actual: their_md5.to_string(),
            });
        }
        let id = self.connection_manager.next_connection_id();
        let conn = Connection::new(id, Role::PublicationLink, transport, peer_header.clone());
        self.connection_manager.track(conn.clone());
        slot.record.add_link(conn.id, conn.clone());
        if let Some(bytes) = slot.record.last_message_bytes() {
            let _ = conn.send_frame(&bytes);
        }
        Ok(conn)
    }

    /// Drives one datagram-link publication socket: the subscriber's first fragment embeds its
    /// connection header (there is no TCP handshake to carry it), after which the link behaves
    /// like any other publication link -- it never reads application messages back.
    fn spawn_datagram_publication_link(self: &Arc<Self>, topic: String, transport: Arc<DatagramTransport>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut registered_id: Option<u32> = None;
            transport
                .clone()
                .run_receive_loop(move |embedded_header, _payload| match registered_id {
                    Some(_) => true,
                    None => {
                        let Some(header_bytes) = embedded_header else {
                            warn!("datagram link for {topic} sent data before its connection header, dropping it");
                            return false;
                        };
                        let peer_header = match Header::from_bytes(&header_bytes) {
                            Ok(h) => h,
                            Err(err) => {
                                warn!("datagram link for {topic} sent an unparsable connection header: {err}");
                                return false;
                            }
                        };
                        match this.accept_subscriber_datagram_link(&topic, &peer_header, transport.clone()) {
                            Ok(conn) => {
                                registered_id = Some(conn.id);
                                true
                            }
                            Err(err) => {
                                warn!("rejected datagram subscriber for {topic}: {err}");
                                false
                            }
                        }
                    }
                })
                .await;
        });
    }

    /// Validates an inbound connection's header against a publication (the `topic` key was
    /// present) and, on success, sends the publisher's accept header (spec §6: `type`, `md5sum`,
    /// `callerid`, `message_definition`, `latching`), registers the link, and replays the
    /// latched message if any.
    pub fn accept_subscriber_link(&self, topic_key: &str, peer_header: &Header, conn: Arc<Connection>) -> Result<()> {
        let pubs = self.publications.lock();
        let Some(slot) = pubs.get(topic_key) else {
            return Err(Error::HeaderError(format!("no publication for topic {topic_key}")));
        };
        let their_md5 = peer_header.get("md5sum").unwrap_or("*");
        if !md5_compatible(slot.record.md5sum(), their_md5) {
            return Err(Error::TypeMismatch {
                expected: slot.record.md5sum().to_string(),
                actual: their_md5.to_string(),
            });
        }
        let accept_header = Header::new()
            .with("type", slot.record.type_name())
            .with("md5sum", slot.record.md5sum())
            .with("callerid", self.caller_id.clone())
            .with("message_definition", slot.record.definition())
            .with("latching", if slot.record.latching() { "1" } else { "0" });
        conn.send_header(&accept_header)?;
        slot.record.add_link(conn.id, conn.clone());
        if let Some(bytes) = slot.record.last_message_bytes() {
            let _ = conn.send_frame(&bytes);
        }
        Ok(())
    }

    /// Registers a freshly connected link to a publisher and spawns the task that deserializes
    /// and dispatches every subsequent message frame to the subscription's callbacks.
    fn attach_subscription_link(
        &self,
        topic: &str,
        conn: Arc<Connection>,
        transport: Arc<StreamTransport>,
        read_half: tokio::net::tcp::OwnedReadHalf,
    ) {
        let Some(record) = self.subscriptions.lock().get(topic).map(|s| s.record.clone()) else {
            conn.close();
            return;
        };
        record.add_link(conn.id, conn.clone());
        tokio::spawn(async move {
            read_frame_loop(read_half, transport, move |payload| {
                record.deliver_raw(&payload);
                true
            })
            .await;
        });
    }

    fn typed_subscription<T: MessageType>(&self, topic: &str) -> Option<Arc<SubscriptionRecord<T>>> {
        let record = self.subscriptions.lock().get(topic)?.record.clone();
        record.as_any_arc().downcast::<SubscriptionRecord<T>>().ok()
    }

    async fn connect_to_publishers(&self, topic: &str, publisher_uris: Vec<String>) {
        for uri in publisher_uris {
            match self.connect_to_one_publisher(topic, &uri).await {
                Ok(id) => {
                    if let Some(slot) = self.subscriptions.lock().get_mut(topic) {
                        slot.links_by_uri.insert(uri, id);
                    }
                }
                Err(err) => warn!("failed to connect to publisher {uri} for {topic}: {err}"),
            }
        }
    }

    async fn connect_to_one_publisher(&self, topic: &str, uri: &str) -> Result<u32> {
        let response = self
            .node_client
            .call(
                uri,
                "requestTopic",
                vec![
                    self.caller_id.clone().into(),
                    topic.into(),
                    Value::Array(vec![
                        Value::Array(vec![Value::String("STREAM".into())]),
                        Value::Array(vec![Value::String("DATAGRAM".into())]),
                    ]),
                ],
            )
            .await?;
        let fields = response
            .into_array()
            .ok_or_else(|| Error::HeaderError("requestTopic: malformed protocol params".to_string()))?;
        let protocol = fields.first().and_then(Value::as_str).unwrap_or("STREAM");
        let host = fields.get(1).and_then(Value::as_str).ok_or_else(|| {
            Error::HeaderError("requestTopic: missing host".to_string())
        })?;
        let port = fields.get(2).and_then(Value::as_i32).ok_or_else(|| {
            Error::HeaderError("requestTopic: missing port".to_string())
        })? as u16;
        let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|_| {
            Error::HeaderError(format!("requestTopic returned an unparsable address {host}:{port}"))
        })?;

        let (expected_md5, expected_type) = self
            .subscriptions
            .lock()
            .get(topic)
            .map(|s| (s.record.md5sum().to_string(), s.record.type_name().to_string()))
            .ok_or_else(|| Error::HeaderError(format!("no local subscription for {topic}")))?;
        let our_header = Header::new()
            .with("topic", topic)
            .with("callerid", self.caller_id.clone())
            .with("md5sum", expected_md5.clone())
            .with("type", expected_type.clone());

        if protocol.eq_ignore_ascii_case("datagram") {
            let connection_id = fields.get(3).and_then(Value::as_i32).ok_or_else(|| {
                Error::HeaderError("requestTopic: DATAGRAM response missing connection_id".to_string())
            })? as u32;
            self.connect_datagram_link(topic, addr, connection_id, our_header).await
        } else {
            self.connect_stream_link(topic, addr, expected_md5, our_header).await
        }
    }

    async fn connect_stream_link(
        &self,
        topic: &str,
        addr: SocketAddr,
        expected_md5: String,
        our_header: Header,
    ) -> Result<u32> {
        let (transport, mut read_half) = self.connection_manager.connect_stream(addr).await?;
        transport.enqueue_write(bytes::Bytes::from(our_header.to_bytes()))?;

        let peer_header = Header::read_from(&mut read_half).await?;
        if peer_header.is_error() {
            return Err(Error::HeaderError(format!(
                "publisher rejected our subscription to {topic}: {:?}",
                peer_header.get("error")
            )));
        }
        let their_md5 = peer_header.get("md5sum").unwrap_or("*");
        if !md5_compatible(&expected_md5, their_md5) {
            return Err(Error::TypeMismatch { expected: expected_md5, actual: their_md5.to_string() });
        }

        let id = self.connection_manager.next_connection_id();
        let conn = Connection::new(id, Role::SubscriptionLink, transport.clone(), peer_header);
        self.connection_manager.track(conn.clone());
        self.attach_subscription_link(topic, conn, transport, read_half);
        Ok(id)
    }

    /// Datagram counterpart of [`Self::connect_stream_link`]: there is no handshake read-back, so
    /// the link is considered established as soon as our header has gone out, and the publisher's
    /// first published message is handled (like any other subscription link) by
    /// `attach_subscription_datagram_link`'s receive loop.
    async fn connect_datagram_link(
        &self,
        topic: &str,
        peer: SocketAddr,
        connection_id: u32,
        our_header: Header,
    ) -> Result<u32> {
        let transport = self.connection_manager.bind_datagram_link(connection_id).await?;
        transport.set_peer(peer);
        transport.send_message(peer, &[], Some(&our_header.to_bytes())).await?;

        let id = self.connection_manager.next_connection_id();
        let conn = Connection::new(id, Role::SubscriptionLink, transport.clone(), Header::new());
        self.connection_manager.track(conn.clone());
        self.attach_subscription_datagram_link(topic, conn, transport);
        Ok(id)
    }

    fn attach_subscription_datagram_link(&self, topic: &str, conn: Arc<Connection>, transport: Arc<DatagramTransport>) {
        let Some(record) = self.subscriptions.lock().get(topic).map(|s| s.record.clone()) else {
            conn.close();
            return;
        };
        record.add_link(conn.id, conn.clone());
        tokio::spawn(async move {
            transport
                .run_receive_loop(move |_embedded_header, payload| {
                    record.deliver_raw(strip_frame_prefix(&payload));
                    true
                })
                .await;
        });
    }
}

fn protocol_offered(protocols: &[Value], name: &str) -> bool {
    protocols.iter().any(|p| {
        p.as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    })
}
