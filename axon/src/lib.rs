//! # axon
//! An in-process runtime for a distributed publish/subscribe and request/response messaging
//! system in the style of ROS1: a directory service for name/address discovery, native
//! TCPROS/UDPROS-style transports, and a callback-queue dispatch layer a process can drive with
//! its own choice of spinner.
//!
//! [`NodeHandle`] is the entry point: [`NodeHandle::init`] resolves a node's name/namespace/remap
//! table from argv and environment, and [`NodeHandle::start`] binds the transports and begins
//! talking to the directory. From there, [`NodeHandle::advertise`]/[`NodeHandle::subscribe`]
//! hand out [`Publisher`]/[`Subscription`] handles, and [`NodeHandle::advertise_service`]/
//! [`NodeHandle::service_client`] hand out [`ServiceServer`]/[`ServiceClient`] handles. All four
//! handles unregister themselves on drop.

mod callback_queue;
mod cli;
mod connection;
mod connection_manager;
mod handle;
mod header;
mod master;
mod names;
mod node;
mod params;
mod poll;
mod service_manager;
mod topic_manager;
mod transport;

pub use axon_common::{Error, MessageType, Result, ServiceFn, ServiceType, ShapeShifter};

pub use callback_queue::{spin_multi_threaded, CallbackQueue, OwnerToken};
pub use handle::{Publisher, ServiceClient, ServiceServer, Subscription};
pub use master::Value;
pub use node::{InitOptions, NodeHandle, Phase};
