//! The directory-RPC boundary (spec §4.F): a client for outbound calls and a server for the
//! callbacks the directory initiates.

mod client;
mod server;
mod value;

pub use client::{MasterClient, NodeClient};
pub use server::{CallbackServer, MasterCallbacks};
pub use value::Value;
