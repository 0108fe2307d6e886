//! User-facing reference-counted handles (spec §4.J).
//!
//! Grounded on `roslibrust/src/ros1/publisher.rs`/`subscriber.rs`'s `Drop` impls, which tear
//! down their registration when the last handle disappears; generalized here to go through the
//! owner-token/callback-queue bookkeeping of [`crate::callback_queue`] rather than a raw
//! `tokio::spawn`'d cleanup task, since a handle drop must be synchronous from the caller's
//! perspective (spec §4.J.1 "removes pending callbacks... synchronously, blocking on in-flight
//! ones").
//!
//! Every handle here needs to run async cleanup (`unadvertise`/`unsubscribe` are `async fn`s) on
//! `Drop`, which is itself synchronous. We do what the teacher's own publisher/subscriber drop
//! impls don't have to: spawn the cleanup onto the current Tokio runtime rather than blocking the
//! dropping thread, since there is no synchronous directory-unregister primitive to call.

use std::sync::Arc;

use tokio::runtime::Handle as RuntimeHandle;

use crate::callback_queue::{CallbackQueue, OwnerToken};
use crate::service_manager::ServiceManager;
use crate::topic_manager::TopicManager;

/// Runs `fut` to completion on whatever Tokio runtime is currently entered, without blocking the
/// calling thread if one is already driving it (i.e. from inside a `Drop` impl running on a
/// worker thread, `spawn` is used instead of `block_on`, which would panic there).
fn run_cleanup(fut: impl std::future::Future<Output = ()> + Send + 'static) {
    match RuntimeHandle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => {
            // No runtime entered (e.g. a handle dropped after the runtime itself has shut down);
            // there is nothing left to unregister from.
            log::trace!("handle dropped with no Tokio runtime available, skipping cleanup");
        }
    }
}

/// A live publication. Dropping the last clone unadvertises the topic.
pub struct Publisher<T: axon_common::MessageType> {
    topic: String,
    owner: OwnerToken,
    queue: Arc<CallbackQueue>,
    topic_manager: Arc<TopicManager>,
    record: Arc<crate::topic_manager::PublicationRecord<T>>,
}

impl<T: axon_common::MessageType> Publisher<T> {
    pub(crate) fn new(
        topic: impl Into<String>,
        owner: OwnerToken,
        queue: Arc<CallbackQueue>,
        topic_manager: Arc<TopicManager>,
        record: Arc<crate::topic_manager::PublicationRecord<T>>,
    ) -> Self {
        Self { topic: topic.into(), owner, queue, topic_manager, record }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&self, message: &T) -> axon_common::Result<()> {
        self.topic_manager.publish(&self.topic, &self.record, message)
    }
}

impl<T: axon_common::MessageType> Drop for Publisher<T> {
    fn drop(&mut self) {
        let topic = self.topic.clone();
        let owner = self.owner;
        let queue = self.queue.clone();
        let topic_manager = self.topic_manager.clone();
        run_cleanup(async move {
            queue.remove_by_owner(owner).await;
            topic_manager.unadvertise(&topic).await;
        });
    }
}

/// A live subscription. Dropping the last clone removes this callback and, if it was the last
/// one on the topic, unsubscribes from the directory.
pub struct Subscription {
    topic: String,
    owner: OwnerToken,
    queue: Arc<CallbackQueue>,
    topic_manager: Arc<TopicManager>,
}

impl Subscription {
    pub(crate) fn new(
        topic: impl Into<String>,
        owner: OwnerToken,
        queue: Arc<CallbackQueue>,
        topic_manager: Arc<TopicManager>,
    ) -> Self {
        Self { topic: topic.into(), owner, queue, topic_manager }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let topic = self.topic.clone();
        let owner = self.owner;
        let queue = self.queue.clone();
        let topic_manager = self.topic_manager.clone();
        run_cleanup(async move {
            queue.remove_by_owner(owner).await;
            topic_manager.unsubscribe(&topic, owner).await;
        });
    }
}

/// A live service server. Dropping the last clone unregisters the service.
pub struct ServiceServer {
    service: String,
    owner: OwnerToken,
    queue: Arc<CallbackQueue>,
    service_manager: Arc<ServiceManager>,
}

impl ServiceServer {
    pub(crate) fn new(
        service: impl Into<String>,
        owner: OwnerToken,
        queue: Arc<CallbackQueue>,
        service_manager: Arc<ServiceManager>,
    ) -> Self {
        Self { service: service.into(), owner, queue, service_manager }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        let service = self.service.clone();
        let owner = self.owner;
        let queue = self.queue.clone();
        let service_manager = self.service_manager.clone();
        run_cleanup(async move {
            queue.remove_by_owner(owner).await;
            service_manager.unadvertise(&service).await;
        });
    }
}

/// A service client. Non-persistent clients hold no connection between calls; persistent ones
/// hold one open for the lifetime of the handle and close it on drop.
pub struct ServiceClient<T: axon_common::ServiceType> {
    service: String,
    service_manager: Arc<ServiceManager>,
    persistent_link: Option<parking_lot::Mutex<(Arc<crate::transport::StreamTransport>, tokio::net::tcp::OwnedReadHalf)>>,
    _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T: axon_common::ServiceType> ServiceClient<T> {
    pub(crate) fn non_persistent(service: impl Into<String>, service_manager: Arc<ServiceManager>) -> Self {
        Self {
            service: service.into(),
            service_manager,
            persistent_link: None,
            _phantom: std::marker::PhantomData,
        }
    }

    pub(crate) fn persistent(
        service: impl Into<String>,
        service_manager: Arc<ServiceManager>,
        transport: Arc<crate::transport::StreamTransport>,
        read_half: tokio::net::tcp::OwnedReadHalf,
    ) -> Self {
        Self {
            service: service.into(),
            service_manager,
            persistent_link: Some(parking_lot::Mutex::new((transport, read_half))),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn call(&self, request: &T::Request) -> axon_common::Result<T::Response> {
        match &self.persistent_link {
            Some(link) => {
                // A persistent client only ever has one in-flight call at a time by contract
                // (spec §4.H describes request/response, not pipelining); the lock is held only
                // long enough to issue one request and read its matching response.
                let mut guard = link.lock();
                let (transport, read_half) = &mut *guard;
                self.service_manager.call_on::<T>(transport, read_half, request).await
            }
            None => self.service_manager.call::<T>(&self.service, request, false).await,
        }
    }
}

impl<T: axon_common::ServiceType> Drop for ServiceClient<T> {
    fn drop(&mut self) {
        if let Some(link) = self.persistent_link.take() {
            let (transport, _) = link.into_inner();
            use crate::transport::Transport;
            transport.close();
        }
    }
}
