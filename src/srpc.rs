//! A simple RPC transport for bootstrap.
//!
//! RDMA peers need some other communication primitive (TCP/IP here) to
//! exchange connection metadata before the data path exists, so the server
//! side runs on a current-thread tokio runtime that the daemon thread drives
//! one batch at a time, and the client side is a plain synchronous stream.
//!
//! One request is one JSON envelope ([`proto::RpcMessage`]); the reply bytes
//! are written back on the same stream. Bytes that do not decode into an
//! envelope, or that name an unregistered opcode, are answered with a
//! generic `WrongArg` reply rather than dropped.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::marshal;
use crate::proto::{self, RpcOpcode};
use crate::CMError;

/// A registered request handler: raw request bytes in, reply bytes out.
pub type RpcHandlerFn = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Bound on how long one batch waits for a new connection or for pending
/// bytes on one stream, so `run_one_event_loop` never blocks unboundedly.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

const MAX_MSG_SZ: usize = 2048;

/// The server side of the bootstrap RPC channel.
///
/// The owner registers one handler per opcode and then repeatedly calls
/// [`SRpcServer::run_one_event_loop`] from a single thread.
pub struct SRpcServer {
    runtime: tokio::runtime::Runtime,
    listener: TcpListener,
    streams: Vec<TcpStream>,
    handlers: HashMap<RpcOpcode, RpcHandlerFn>,
}

impl SRpcServer {
    /// Bind the listening endpoint. Pass port 0 to let the OS choose.
    pub fn new(port: u16) -> Result<Self, CMError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CMError::ServerError("build runtime", e))?;
        let listener = runtime
            .block_on(TcpListener::bind(("0.0.0.0", port)))
            .map_err(|e| CMError::ServerError("bind listener", e))?;
        Ok(Self {
            runtime,
            listener,
            streams: Vec::new(),
            handlers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CMError> {
        self.listener
            .local_addr()
            .map_err(|e| CMError::ServerError("query local addr", e))
    }

    /// Register `handler` for `op`. Returns false if `op` already has one.
    pub fn register_handler(&mut self, op: RpcOpcode, handler: RpcHandlerFn) -> bool {
        if self.handlers.contains_key(&op) {
            log::error!("handler for {:?} already registered", op);
            return false;
        }
        self.handlers.insert(op, handler);
        true
    }

    /// Process one batch of pending work: accept waiting connections, then
    /// serve at most one request per live stream. Returns the number of
    /// requests processed in this batch.
    pub fn run_one_event_loop(&mut self) -> usize {
        let Self {
            runtime,
            listener,
            streams,
            handlers,
        } = self;
        runtime.block_on(poll_once(listener, streams, handlers))
    }
}

async fn poll_once(
    listener: &TcpListener,
    streams: &mut Vec<TcpStream>,
    handlers: &mut HashMap<RpcOpcode, RpcHandlerFn>,
) -> usize {
    if let Ok(Ok((stream, _))) = timeout(POLL_TIMEOUT, listener.accept()).await {
        streams.push(stream);
    }

    let mut processed = 0;
    let mut alive = Vec::with_capacity(streams.len());
    for mut stream in streams.drain(..) {
        let mut buf = [0u8; MAX_MSG_SZ];
        match timeout(POLL_TIMEOUT, stream.read(&mut buf)).await {
            // no bytes pending on this stream, keep it for the next batch
            Err(_) => alive.push(stream),
            // peer disconnected or the stream broke
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => {
                let reply = dispatch(handlers, &buf[..n]);
                processed += 1;
                if stream.write_all(&reply).await.is_ok() {
                    alive.push(stream);
                } else {
                    log::error!("send response error");
                }
            }
        }
    }
    *streams = alive;
    processed
}

fn dispatch(handlers: &mut HashMap<RpcOpcode, RpcHandlerFn>, bytes: &[u8]) -> Vec<u8> {
    let msg: proto::RpcMessage = match marshal::dedump(bytes) {
        Some(m) => m,
        None => return marshal::wrong_arg_reply(),
    };
    match handlers.get_mut(&msg.op) {
        Some(handler) => handler(msg.serialized.as_bytes()),
        None => marshal::wrong_arg_reply(),
    }
}

/// The peer side of the bootstrap RPC channel: a synchronous
/// request/response stream, one call at a time.
pub struct SRpcClient {
    stream: std::net::TcpStream,
}

impl SRpcClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, CMError> {
        let stream = std::net::TcpStream::connect(addr)
            .map_err(|e| CMError::ServerError("connect server", e))?;
        Ok(Self { stream })
    }

    /// Send one request and block for its reply bytes.
    pub fn call(&mut self, op: RpcOpcode, payload: &[u8]) -> Result<Vec<u8>, CMError> {
        let serialized =
            String::from_utf8(payload.to_vec()).map_err(|_| CMError::Marshal("payload"))?;
        let msg = proto::RpcMessage { op, serialized };
        let bytes = marshal::dump(&msg)?;
        self.stream
            .write_all(&bytes)
            .map_err(|_| CMError::SendError("request"))?;

        let mut buf = [0u8; MAX_MSG_SZ];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|_| CMError::SendError("reply"))?;
        if n == 0 {
            return Err(CMError::SendError("server disconnected"));
        }
        Ok(buf[..n].to_vec())
    }

    /// Fetch the remote-access attributes of the memory region registered
    /// under `id` at the server.
    pub fn fetch_mr(&mut self, id: u64) -> Result<proto::MRReply, CMError> {
        let payload = marshal::dump(&proto::MRReq { id })?;
        let reply = self.call(RpcOpcode::FetchMr, &payload)?;
        marshal::dedump(&reply).ok_or(CMError::Marshal("MR reply"))
    }

    /// Ask the server to create-and-connect an RC queue pair, or to report
    /// an existing one (see [`proto::RCReq`]).
    pub fn rc_request(&mut self, req: &proto::RCReq) -> Result<proto::RCReply, CMError> {
        let payload = marshal::dump(req)?;
        let reply = self.call(RpcOpcode::CreateRC, &payload)?;
        marshal::dedump(&reply).ok_or(CMError::Marshal("RC reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CallbackStatus;

    #[test]
    fn duplicated_handler_rejected() {
        let mut server = SRpcServer::new(0).unwrap();
        assert!(server.register_handler(RpcOpcode::FetchMr, Box::new(|_| Vec::new())));
        assert!(!server.register_handler(RpcOpcode::FetchMr, Box::new(|_| Vec::new())));
    }

    #[test]
    fn dispatch_garbled_envelope() {
        let mut handlers: HashMap<RpcOpcode, RpcHandlerFn> = HashMap::new();
        let reply = dispatch(&mut handlers, b"definitely not an envelope");
        let reply: crate::proto::MRReply = marshal::dedump(&reply).unwrap();
        assert_eq!(reply.status, CallbackStatus::WrongArg);
    }

    #[test]
    fn dispatch_unregistered_opcode() {
        let mut handlers: HashMap<RpcOpcode, RpcHandlerFn> = HashMap::new();
        let msg = crate::proto::RpcMessage {
            op: RpcOpcode::CreateRC,
            serialized: String::new(),
        };
        let reply = dispatch(&mut handlers, &marshal::dump(&msg).unwrap());
        let reply: crate::proto::RCReply = marshal::dedump(&reply).unwrap();
        assert_eq!(reply.status, CallbackStatus::WrongArg);
    }

    #[test]
    fn dispatch_reaches_handler() {
        let mut handlers: HashMap<RpcOpcode, RpcHandlerFn> = HashMap::new();
        handlers.insert(RpcOpcode::FetchMr, Box::new(|bytes: &[u8]| bytes.to_vec()));
        let msg = crate::proto::RpcMessage {
            op: RpcOpcode::FetchMr,
            serialized: "ping".to_string(),
        };
        let reply = dispatch(&mut handlers, &marshal::dump(&msg).unwrap());
        assert_eq!(reply, b"ping");
    }
}
