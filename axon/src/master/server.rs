//! Directory-RPC server: the core's inbound half of spec §4.F.
//!
//! Hosts the four callbacks the directory initiates (`publisherUpdate`, `requestTopic`,
//! `paramUpdate`, `shutdown`) behind a small `hyper` service, dispatching by method name onto
//! whatever implements [`MasterCallbacks`] -- the node wires the topic manager, service manager
//! and parameter cache in.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::{debug, warn};

use axon_common::Result;

use super::value::Value;

/// Callbacks the directory is allowed to push into this node.
#[async_trait]
pub trait MasterCallbacks: Send + Sync + 'static {
    fn publisher_update(&self, caller_id: &str, topic: &str, publishers: Vec<String>);
    /// Binds whatever transport the negotiated protocol needs, so this is async: a `DATAGRAM`
    /// offer binds a fresh `UdpSocket` before a reply can be formed.
    async fn request_topic(&self, caller_id: &str, topic: &str, protocols: &[Value]) -> Result<Value>;
    fn param_update(&self, caller_id: &str, key: &str, value: Value);
    fn shutdown(&self, caller_id: &str, reason: &str);
}

/// Hosts the XML-RPC server on an ephemeral port for the lifetime of the returned handle.
pub struct CallbackServer {
    port: u16,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl CallbackServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signals the hyper server to stop accepting new connections and finish in-flight ones.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn start(callbacks: Arc<dyn MasterCallbacks>) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
        let make_svc = make_service_fn(move |_conn| {
            let callbacks = callbacks.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let callbacks = callbacks.clone();
                    async move { Ok::<_, Infallible>(handle_request(callbacks, req).await) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        let port = server.local_addr().port();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        tokio::spawn(async move {
            if let Err(err) = graceful.await {
                warn!("directory callback server exited with an error: {err}");
            }
        });

        Ok(Self { port, shutdown_tx })
    }
}

async fn handle_request(callbacks: Arc<dyn MasterCallbacks>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(err) => return text_response(&fault_xml(&format!("failed to read request body: {err}"))),
    };
    let body = match std::str::from_utf8(&body) {
        Ok(s) => s,
        Err(_) => return text_response(&fault_xml("request body was not valid utf-8")),
    };

    let (method, params) = match serde_xmlrpc::request_from_str(body) {
        Ok(v) => v,
        Err(err) => return text_response(&fault_xml(&format!("malformed xmlrpc request: {err}"))),
    };
    let params: Vec<Value> = params.into_iter().map(Value::from).collect();
    debug!("directory callback server received {method} with {} params", params.len());

    let result = dispatch(callbacks.as_ref(), &method, params).await;
    match result {
        Ok(value) => {
            let xmlrpc_value: serde_xmlrpc::Value = value.into();
            match serde_xmlrpc::response_to_string(xmlrpc_value) {
                Ok(xml) => text_response(&xml),
                Err(err) => text_response(&fault_xml(&format!("failed to encode response: {err}"))),
            }
        }
        Err(reason) => text_response(&fault_xml(&reason)),
    }
}

async fn dispatch(callbacks: &dyn MasterCallbacks, method: &str, mut params: Vec<Value>) -> std::result::Result<Value, String> {
    // Every callback's first argument is the caller id of whoever is pushing the update; the
    // rest varies by method. A malformed or unknown call gets a generic success-with-empty-body
    // envelope rather than tearing down the connection, mirroring the directory's own leniency.
    match method {
        "publisherUpdate" => {
            let (caller_id, topic, publishers) = (
                take_str(&mut params, 0)?,
                take_str(&mut params, 1)?,
                params.get(2).cloned().map(Value::into_uri_list).unwrap_or_default(),
            );
            callbacks.publisher_update(&caller_id, &topic, publishers);
            Ok(ok_envelope(Value::Int(0)))
        }
        "requestTopic" => {
            let caller_id = take_str(&mut params, 0)?;
            let topic = take_str(&mut params, 1)?;
            let protocols = params.get(2).and_then(Value::as_array).unwrap_or(&[]).to_vec();
            callbacks
                .request_topic(&caller_id, &topic, &protocols)
                .await
                .map(ok_envelope)
                .map_err(|e| e.to_string())
        }
        "paramUpdate" => {
            let caller_id = take_str(&mut params, 0)?;
            let key = take_str(&mut params, 1)?;
            let value = params.into_iter().nth(2).unwrap_or(Value::Int(0));
            callbacks.param_update(&caller_id, &key, value);
            Ok(ok_envelope(Value::Int(0)))
        }
        "shutdown" => {
            let caller_id = take_str(&mut params, 0)?;
            let reason = params.get(1).and_then(Value::as_str).unwrap_or("").to_string();
            callbacks.shutdown(&caller_id, &reason);
            Ok(ok_envelope(Value::Int(0)))
        }
        other => Err(format!("unknown directory callback method {other}")),
    }
}

fn take_str(params: &mut Vec<Value>, idx: usize) -> std::result::Result<String, String> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing or non-string parameter at index {idx}"))
}

fn ok_envelope(payload: Value) -> Value {
    Value::Array(vec![Value::Int(1), Value::String(String::new()), payload])
}

fn fault_xml(reason: &str) -> String {
    // A best-effort fault response; a handful of directory implementations are lenient about
    // fault structure, so we keep this minimal rather than depending on serde_xmlrpc's own fault
    // helpers (which this crate version may not expose).
    format!(
        "<?xml version=\"1.0\"?><methodResponse><fault><value><struct>\
         <member><name>faultCode</name><value><int>-1</int></value></member>\
         <member><name>faultString</name><value><string>{reason}</string></value></member>\
         </struct></value></fault></methodResponse>"
    )
}

fn text_response(body: &str) -> Response<Body> {
    Response::builder()
        .header("Content-Type", "text/xml")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(String::new())))
}
