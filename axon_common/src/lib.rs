//! # axon_common
//! Shared traits, error types and wire-agnostic primitives used throughout the `axon` runtime.
//!
//! This crate deliberately knows nothing about transports, the directory, or the wire format.
//! It exists so that message types generated by an external code generator, and the `axon`
//! runtime itself, can agree on a small vocabulary without either depending on the other's
//! internals.

/// The central error type used throughout axon.
///
/// All runtime operations coerce their failures into this type so that callers have one error
/// surface to match on, regardless of which component produced the failure.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when communication with the directory or a peer is fully lost.
    /// The runtime is expected to be self-healing: once connectivity returns, existing
    /// publications/subscriptions resume without needing to be recreated.
    #[error("No connection to directory or peer")]
    Disconnected,
    /// An operation took longer than its configured timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),
    /// A message was received but could not be serialized/deserialized into its Rust type.
    ///
    /// Also returned when an md5 fingerprint mismatch is detected at handshake time.
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// An md5 fingerprint disagreement between a publisher and subscriber, or a service's
    /// client and server, that is fatal to the specific advertise/subscribe/call in question.
    #[error("Type mismatch: expected md5 {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    /// An I/O failure on a single connection. Never propagates past the connection boundary;
    /// the connection is dropped and the affected link is recreated on the next directory
    /// update or lookup.
    #[error("Transport error: {0}")]
    TransportError(#[from] std::io::Error),
    /// An RPC call to the directory failed. Registrations retry with backoff; lookups surface
    /// this immediately to the caller.
    #[error("Directory unreachable: {0}")]
    DirectoryUnreachable(String),
    /// A connection header was malformed, rejected by the peer, or failed local validation.
    /// Fatal to the connection, not to the node.
    #[error("Connection header error: {0}")]
    HeaderError(String),
    /// A name did not meet the hierarchical naming requirements.
    #[error("Name does not meet naming requirements: {0}")]
    InvalidName(String),
    /// The runtime is shutting down or has already shut down.
    #[error("Runtime is shutting down")]
    Shutdown,
    /// A backend reported an error that doesn't cleanly fit any of the above.
    #[error("Backend reported an error: {0}")]
    ServerError(String),
    /// Any other failure that doesn't cleanly fit the categories above.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Generic result type used throughout axon.
pub type Result<T> = std::result::Result<T, Error>;

/// Fundamental trait for message types the runtime works with.
///
/// This trait is satisfied by any type produced by an external message-code generator; the
/// runtime is entirely generic over it and never constructs or inspects message bodies itself.
pub trait MessageType:
    'static + serde::de::DeserializeOwned + Send + serde::Serialize + Sync + Clone + std::fmt::Debug
{
    /// The combination `pkg_name/type_name` string describing the type, e.g. `std_msgs/Header`.
    const DATA_TYPE_NAME: &'static str;

    /// The computed md5 fingerprint of the message definition and its dependencies.
    /// Only needed for the native stream/datagram transports; left blank for backends that
    /// don't perform schema negotiation.
    const MD5SUM: &'static str = "";

    /// The expanded definition text of the message, used to populate `message_definition` in
    /// the connection header.
    const DEFINITION: &'static str = "";

    /// Whether every instance of this type serializes to the same number of bytes.
    const IS_FIXED_SIZE: bool = false;

    /// Whether the type carries a `Header`-shaped first field (used by some transports to
    /// stamp sequence numbers). Defaults to false; generated code overrides it.
    const HAS_HEADER: bool = false;
}

// Allows services with no request or no response to use `()` as the missing half.
impl MessageType for () {
    const DATA_TYPE_NAME: &'static str = "";
    const MD5SUM: &'static str = "";
    const DEFINITION: &'static str = "";
    const IS_FIXED_SIZE: bool = true;
}

/// Represents a request/response service type definition corresponding to a `.srv`-like file.
///
/// Not typically implemented by hand; generated by an external message-code generator. Used by
/// the service manager to constrain [`ServiceFn`] and validate handshake md5s.
pub trait ServiceType: 'static + Send + Sync {
    /// Name of the service, e.g. `rospy_tutorials/AddTwoInts`.
    const SERVICE_NAME: &'static str;
    /// The computed md5 fingerprint of the combined request/response definition.
    const MD5SUM: &'static str;
    /// The type of data sent in the request.
    type Request: MessageType;
    /// The type of data sent in the response.
    type Response: MessageType;
}

/// A function that can validly act as a service server handler.
///
/// Defined as a trait (rather than a bare `Fn` bound) because the full bound is too verbose to
/// repeat at every call site and trait aliases are unstable.
pub trait ServiceFn<T: ServiceType>:
    Fn(
        T::Request,
    ) -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
    + Send
    + Sync
    + 'static
{
}

impl<T, F> ServiceFn<T> for F
where
    T: ServiceType,
    F: Fn(
            T::Request,
        )
            -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
}

/// A type-erased message, carrying its own fingerprint and opaque wire bytes.
///
/// This is the runtime-typed "pass-through" representation described as a REDESIGN FLAG in the
/// original source: callers that only need to move bytes around (bag playback, a generic relay)
/// use this instead of a concrete [`MessageType`]. Typed callbacks deserialize lazily; this type
/// never does.
#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone, PartialEq)]
pub struct ShapeShifter(pub Vec<u8>);

impl ShapeShifter {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl MessageType for ShapeShifter {
    const DATA_TYPE_NAME: &'static str = "*";
    const MD5SUM: &'static str = "*";
    const DEFINITION: &'static str = "";
}
