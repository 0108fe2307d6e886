//! Node lifecycle and top-level API surface (spec §4.L).
//!
//! Grounded on `original_source/core/roscpp/src/libros/init.cpp`'s `ros::start`/`ros::shutdown`
//! phase machine and its `PollManager`-driven shutdown check, and on
//! `original_source/core/roscpp/src/libros/connection_manager.cpp`'s header-key dispatch for how
//! an inbound link gets routed to the topic manager (`topic` key) or the service manager
//! (`service` key) -- the one piece of routing the connection manager itself was deliberately
//! kept ignorant of (see `crate::connection_manager`'s module doc).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use axon_common::{Error, MessageType, Result, ServiceFn, ServiceType};

use crate::callback_queue::{self, CallbackQueue, OwnerToken};
use crate::cli::parse_argv;
use crate::connection::{Connection, Role};
use crate::connection_manager::{ConnectionManager, InboundLink};
use crate::handle::{Publisher, ServiceClient, ServiceServer, Subscription};
use crate::header::Header;
use crate::master::{CallbackServer, MasterCallbacks, MasterClient, Value};
use crate::names::{Resolver, SpecialArgs};
use crate::params::ParamCache;
use crate::poll::{PollSet, DEFAULT_TICK_PERIOD};
use crate::service_manager::ServiceManager;
use crate::topic_manager::TopicManager;
use crate::transport::StreamTransport;

/// `NodeHandle`'s lifecycle phase (spec §4.L: `Uninitialized -> Initialized -> Started ->
/// ShuttingDown`). `advertise`/`subscribe`/parameter calls are only valid once `Started`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    Initialized = 1,
    Started = 2,
    ShuttingDown = 3,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            0 => Phase::Uninitialized,
            1 => Phase::Initialized,
            2 => Phase::Started,
            _ => Phase::ShuttingDown,
        }
    }
}

/// Options accepted by [`NodeHandle::init`] beyond what CLI remapping covers.
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    /// Overrides the directory URI even if `MASTER_URI`/`__master` set one; mainly for tests.
    pub master_uri: Option<String>,
    /// Number of spinner worker tasks to start automatically; `0` means the caller drives
    /// spinning itself via [`NodeHandle::callback_queue`].
    pub spin_workers: usize,
}

/// The frozen identity a node commits to at `init()` time: its resolved name, namespace,
/// remap table and the directory URI it will talk to.
struct Identity {
    resolver: Resolver,
    master_uri: String,
    advertise_host: Ipv4Addr,
    /// `__log:=` override for where this node's log file should live; the crate itself doesn't
    /// open one (logging setup is the process's own business, see `axon_common`'s doc), it just
    /// surfaces the value for whoever configures the process's `log` backend.
    log_path: Option<String>,
}

/// Handle to one running node. Cloning is cheap (it's a thin `Arc` wrapper); every clone shares
/// the same underlying managers and shutdown state.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<Inner>,
}

struct Inner {
    phase: AtomicU8,
    identity: Identity,
    master: Arc<MasterClient>,
    params: Arc<ParamCache>,
    poll_set: Arc<PollSet>,
    connection_manager: parking_lot::Mutex<Option<Arc<ConnectionManager>>>,
    topic_manager: parking_lot::Mutex<Option<Arc<TopicManager>>>,
    service_manager: parking_lot::Mutex<Option<Arc<ServiceManager>>>,
    callback_server: parking_lot::Mutex<Option<CallbackServer>>,
    default_queue: Arc<CallbackQueue>,
    /// `ChildTask` aborts its spinner on drop, so `shutdown()` just needs to drain and drop these
    /// rather than tracking and calling `.abort()` itself.
    spinner_handles: parking_lot::Mutex<Vec<abort_on_drop::ChildTask<()>>>,
}

impl NodeHandle {
    /// Parses `argv` for remaps/specials, applies environment fallbacks for anything a special
    /// argument didn't pin, and freezes the name/remap/directory-URI triple. Does not touch the
    /// network; call [`Self::start`] for that.
    pub fn init(node_name: &str, argv: &[String], options: InitOptions) -> Result<Self> {
        let parsed = parse_argv(argv.iter().cloned());
        let SpecialArgs { name, namespace, master_uri, ip, hostname, log_path } = parsed.special;

        let resolved_name = name.unwrap_or_else(|| node_name.to_string());
        let namespace = namespace
            .or_else(|| std::env::var("NAMESPACE").ok())
            .unwrap_or_else(|| "/".to_string());

        let master_uri = options
            .master_uri
            .or(master_uri)
            .or_else(|| std::env::var("MASTER_URI").ok())
            .ok_or_else(|| Error::Unexpected(anyhow::anyhow!("no directory URI: pass InitOptions::master_uri, __master:=, or set MASTER_URI")))?;

        let advertise_host = ip
            .or(hostname)
            .or_else(|| std::env::var("IP").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .or_else(|| {
                gethostname::gethostname()
                    .to_str()
                    .and_then(|s| std::net::ToSocketAddrs::to_socket_addrs(&(s, 0)).ok())
                    .and_then(|mut addrs| addrs.find_map(|a| match a.ip() {
                        std::net::IpAddr::V4(v4) => Some(v4),
                        _ => None,
                    }))
            })
            .unwrap_or(Ipv4Addr::LOCALHOST);

        let resolver = Resolver::new(namespace, resolved_name).with_remappings(parsed.remappings);

        let identity = Identity { resolver, master_uri: master_uri.clone(), advertise_host, log_path };
        let master = Arc::new(MasterClient::new(master_uri));
        let caller_id = identity.resolver.fully_qualified_name().to_string();

        Ok(Self {
            inner: Arc::new(Inner {
                phase: AtomicU8::new(Phase::Initialized as u8),
                identity,
                params: Arc::new(ParamCache::new(master.clone(), caller_id, "")),
                master,
                poll_set: PollSet::new(),
                connection_manager: parking_lot::Mutex::new(None),
                topic_manager: parking_lot::Mutex::new(None),
                service_manager: parking_lot::Mutex::new(None),
                callback_server: parking_lot::Mutex::new(None),
                default_queue: CallbackQueue::new(),
                spinner_handles: parking_lot::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.inner.phase.load(Ordering::SeqCst))
    }

    pub fn ok(&self) -> bool {
        self.phase() != Phase::ShuttingDown
    }

    pub fn fully_qualified_name(&self) -> &str {
        self.inner.identity.resolver.fully_qualified_name()
    }

    /// The `__log:=` override given at init, if any.
    pub fn log_path(&self) -> Option<&str> {
        self.inner.identity.log_path.as_deref()
    }

    pub fn resolve_name(&self, name: &str) -> Result<String> {
        self.inner.identity.resolver.resolve(name, true)
    }

    pub fn default_callback_queue(&self) -> Arc<CallbackQueue> {
        self.inner.default_queue.clone()
    }

    /// Binds the stream/datagram listeners, starts the directory-RPC callback server, and begins
    /// routing inbound connections by header key. `advertise`/`subscribe`/parameter calls made
    /// before this returns are rejected with `Error::Shutdown`.
    pub async fn start(&self, options: InitOptions) -> Result<()> {
        if self.phase() != Phase::Initialized {
            return Err(Error::Unexpected(anyhow::anyhow!(
                "start() called outside the Initialized phase"
            )));
        }

        let caller_id = self.fully_qualified_name().to_string();
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel::<InboundLink>();
        let connection_manager = ConnectionManager::start(
            self.inner.identity.advertise_host,
            &self.inner.poll_set,
            inbound_tx,
        )
        .await?;

        // The directory callback server's own port is what goes out as `caller_api` in every
        // register*/unregister* call -- it's how the directory and peers reach back into this
        // node over XML-RPC (`publisherUpdate`, `requestTopic`). `NodeCallbacks` looks its
        // topic/service managers up through `Inner` rather than owning them directly, since
        // those managers need the callback server's port before they can be constructed.
        let callbacks: Arc<dyn MasterCallbacks> = Arc::new(NodeCallbacks { node: Arc::downgrade(&self.inner) });
        let server = CallbackServer::start(callbacks).await?;
        let caller_api = format!("http://{}:{}", self.inner.identity.advertise_host, server.port());
        *self.inner.callback_server.lock() = Some(server);

        let topic_manager = TopicManager::new(
            self.inner.master.clone(),
            caller_id.clone(),
            caller_api.clone(),
            connection_manager.clone(),
        );
        let service_manager = ServiceManager::new(
            self.inner.master.clone(),
            caller_id.clone(),
            caller_api.clone(),
            connection_manager.clone(),
        );

        *self.inner.connection_manager.lock() = Some(connection_manager.clone());
        *self.inner.topic_manager.lock() = Some(topic_manager.clone());
        *self.inner.service_manager.lock() = Some(service_manager.clone());

        tokio::spawn(inbound_dispatch_loop(topic_manager.clone(), service_manager.clone(), inbound_rx));

        self.inner.poll_set.spawn(DEFAULT_TICK_PERIOD);
        install_signal_shutdown(self.clone());

        if options.spin_workers > 0 {
            let handles = callback_queue::spin_multi_threaded(
                self.inner.default_queue.clone(),
                options.spin_workers,
                {
                    let node = self.clone();
                    move || node.ok()
                },
            );
            *self.inner.spinner_handles.lock() = handles.into_iter().map(Into::into).collect();
        }

        self.inner.phase.store(Phase::Started as u8, Ordering::SeqCst);
        info!("node {caller_id} started ({})", self.inner.identity.master_uri);
        Ok(())
    }

    fn require_started(&self) -> Result<()> {
        if self.phase() != Phase::Started {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    pub async fn advertise<T: MessageType>(&self, topic: &str, latching: bool) -> Result<Publisher<T>> {
        self.require_started()?;
        let topic = self.resolve_name(topic)?;
        let topic_manager = self.topic_manager();
        let record = topic_manager.advertise::<T>(&topic, latching).await?;
        let owner = OwnerToken::new();
        Ok(Publisher::new(topic, owner, self.inner.default_queue.clone(), topic_manager, record))
    }

    /// `queue_size` bounds how many pending dispatches of this callback may queue up before the
    /// oldest is evicted; `0` means unbounded (spec.md:47/147).
    pub async fn subscribe<T: MessageType>(
        &self,
        topic: &str,
        queue_size: usize,
        callback: impl Fn(Arc<T>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.require_started()?;
        let topic = self.resolve_name(topic)?;
        let topic_manager = self.topic_manager();
        let owner = OwnerToken::new();
        let queue = self.inner.default_queue.clone();
        topic_manager.subscribe::<T>(&topic, owner, queue.clone(), queue_size, callback).await?;
        Ok(Subscription::new(topic, owner, queue, topic_manager))
    }

    pub async fn advertise_service<T: ServiceType>(
        &self,
        service: &str,
        handler: impl ServiceFn<T>,
    ) -> Result<ServiceServer> {
        self.require_started()?;
        let service = self.resolve_name(service)?;
        let service_manager = self.service_manager();
        let owner = OwnerToken::new();
        let queue = self.inner.default_queue.clone();
        service_manager.advertise::<T>(&service, owner, queue.clone(), handler).await?;
        Ok(ServiceServer::new(service, owner, queue, service_manager))
    }

    /// Builds a non-persistent client: each `call` on the returned handle opens a fresh
    /// connection and tears it down afterward.
    pub fn service_client<T: ServiceType>(&self, service: &str) -> Result<ServiceClient<T>> {
        self.require_started()?;
        let service = self.resolve_name(service)?;
        Ok(ServiceClient::non_persistent(service, self.service_manager()))
    }

    /// Builds a persistent client: opens one connection immediately and reuses it for every
    /// `call` until the handle is dropped (spec §4.H).
    pub async fn persistent_service_client<T: ServiceType>(&self, service: &str) -> Result<ServiceClient<T>> {
        self.require_started()?;
        let service = self.resolve_name(service)?;
        let service_manager = self.service_manager();
        let (transport, read_half) = service_manager.open_persistent(&service, T::MD5SUM).await?;
        Ok(ServiceClient::persistent(service, service_manager, transport, read_half))
    }

    pub async fn get_param(&self, key: &str) -> Option<Value> {
        self.inner.params.get_param(key).await
    }

    pub async fn set_param(&self, key: &str, value: Value) -> Result<()> {
        self.inner.params.set_param(key, value).await
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        self.inner.params.delete_param(key).await
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        self.inner.params.has_param(key).await
    }

    pub async fn search_param(&self, key: &str) -> Result<Option<String>> {
        self.inner.params.search_param(key).await
    }

    pub async fn subscribe_param(&self, key: &str) -> Result<Value> {
        self.inner.params.subscribe_param(key).await
    }

    fn topic_manager(&self) -> Arc<TopicManager> {
        self.inner.topic_manager.lock().clone().expect("started")
    }

    fn service_manager(&self) -> Arc<ServiceManager> {
        self.inner.service_manager.lock().clone().expect("started")
    }

    /// Idempotent. Disables the default callback queue, stops the poll loop and directory
    /// callback server, and drops every live connection. Safe to call more than once or from
    /// more than one task concurrently; only the first caller does any work.
    pub async fn shutdown(&self, reason: &str) {
        let previous = self.inner.phase.swap(Phase::ShuttingDown as u8, Ordering::SeqCst);
        if previous == Phase::ShuttingDown as u8 {
            return;
        }
        info!("node {} shutting down: {reason}", self.fully_qualified_name());

        self.inner.default_queue.disable();
        self.inner.poll_set.stop();
        if let Some(server) = self.inner.callback_server.lock().take() {
            server.stop();
        }
        if let Some(connection_manager) = self.inner.connection_manager.lock().take() {
            connection_manager.shutdown();
        }
        // `ChildTask::drop` aborts its task, so draining the vec is enough to stop every spinner.
        self.inner.spinner_handles.lock().drain(..);
    }
}

/// Consumes inbound links forever, dispatching each by header key: a `topic` field means a
/// remote subscriber connecting to one of our publications, a `service` field means a remote
/// client calling one of our services. Neither key present is a protocol error (spec §4.E).
async fn inbound_dispatch_loop(
    topic_manager: Arc<TopicManager>,
    service_manager: Arc<ServiceManager>,
    mut inbound_rx: tokio::sync::mpsc::UnboundedReceiver<InboundLink>,
) {
    while let Some(InboundLink { header, stream, .. }) = inbound_rx.recv().await {
        if let Some(topic) = header.get("topic").map(str::to_string) {
            match StreamTransport::new(stream) {
                Ok((transport, read_half)) => {
                    accept_topic_link(&topic_manager, header, transport, read_half).await;
                }
                Err(err) => warn!("failed to wrap inbound topic connection for {topic}: {err}"),
            }
        } else if let Some(service) = header.get("service").map(str::to_string) {
            match StreamTransport::new(stream) {
                Ok((transport, read_half)) => {
                    accept_service_link(&service_manager, header, transport, read_half).await;
                }
                Err(err) => warn!("failed to wrap inbound service connection for {service}: {err}"),
            }
        } else {
            warn!("inbound connection header had neither a topic nor a service key: {header}");
        }
    }
}

async fn accept_topic_link(
    topic_manager: &Arc<TopicManager>,
    header: Header,
    transport: Arc<StreamTransport>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
) {
    let topic = header.get("topic").unwrap_or_default().to_string();
    let id = rand_connection_id();
    let conn = Connection::new(id, Role::PublicationLink, transport.clone(), header.clone());

    match topic_manager.accept_subscriber_link(&topic, &header, conn.clone()) {
        Ok(()) => {
            tokio::spawn(async move {
                crate::transport::read_frame_loop(read_half, transport, move |_payload| {
                    // Publication links never read application messages from their subscriber;
                    // any bytes here would be a protocol violation. Keep draining so the
                    // connection's drop listener still fires on peer disconnect.
                    true
                })
                .await;
            });
        }
        Err(err) => {
            let error_header = Header::error(err.to_string());
            let _ = conn.send_header(&error_header);
            conn.close();
            // Drain and drop the read half so its resources are released promptly.
            let mut discard = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut read_half, &mut discard).await;
        }
    }
}

async fn accept_service_link(
    service_manager: &Arc<ServiceManager>,
    header: Header,
    transport: Arc<StreamTransport>,
    read_half: tokio::net::tcp::OwnedReadHalf,
) {
    let service = header.get("service").unwrap_or_default().to_string();
    let id = rand_connection_id();
    let conn = Connection::new(id, Role::ServiceServerLink, transport.clone(), header.clone());

    match service_manager.accept_server_link(&service, &header, conn.clone(), transport, read_half) {
        Ok(()) => {}
        Err(err) => {
            let error_header = Header::error(err.to_string());
            let _ = conn.send_header(&error_header);
            conn.close();
        }
    }
}

fn rand_connection_id() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen()
}

struct NodeCallbacks {
    /// Weak so the callback server (owned by `Inner`, which owns this callbacks object) doesn't
    /// keep `Inner` alive on its own. Looks the topic manager/params up through `Inner` on every
    /// call rather than owning them directly, since the callback server has to exist before
    /// either manager can be constructed (see `NodeHandle::start`).
    node: std::sync::Weak<Inner>,
}

#[async_trait::async_trait]
impl MasterCallbacks for NodeCallbacks {
    fn publisher_update(&self, _caller_id: &str, topic: &str, publishers: Vec<String>) {
        let Some(inner) = self.node.upgrade() else { return };
        let Some(topic_manager) = inner.topic_manager.lock().clone() else { return };
        let topic = topic.to_string();
        tokio::spawn(async move {
            topic_manager.handle_publisher_update(&topic, publishers).await;
        });
    }

    async fn request_topic(&self, _caller_id: &str, topic: &str, protocols: &[Value]) -> Result<Value> {
        let inner = self.node.upgrade().ok_or(Error::Shutdown)?;
        let topic_manager = inner.topic_manager.lock().clone().ok_or(Error::Shutdown)?;
        topic_manager.handle_request_topic(topic, protocols).await
    }

    fn param_update(&self, _caller_id: &str, key: &str, value: Value) {
        let Some(inner) = self.node.upgrade() else { return };
        inner.params.apply_update(key, value);
    }

    fn shutdown(&self, caller_id: &str, reason: &str) {
        warn!("directory asked {caller_id} to shut down: {reason}");
        let Some(inner) = self.node.upgrade() else { return };
        let reason = reason.to_string();
        tokio::spawn(async move {
            NodeHandle { inner }.shutdown(&reason).await;
        });
    }
}

fn install_signal_shutdown(node: NodeHandle) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        node.shutdown("received shutdown signal").await;
    });
}
