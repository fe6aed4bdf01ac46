//! rctrl is a control-path daemon that handles all RDMA bootstrap requests
//! sent to this machine. A process registers the RDMA resources it owns
//! (opened NICs, memory regions, queue pairs) into the daemon's registries,
//! and remote peers use an out-of-band RPC channel to query a memory region's
//! remote-access attributes or to bring up a reliable connection (RC) queue
//! pair against a locally registered one.
//!
//! rctrl is **thread-safe**: the embedding application may register resources
//! from arbitrary threads while the daemon thread serves peer requests.
//!
//! The actual verbs operations (QP creation, RC handshake) live behind the
//! [`nic::RdmaNic`] and [`queue_pair::ReliableConnection`] traits, so the
//! daemon itself never touches the ibverbs bindings.

/// Status taxonomy, RPC opcodes and the typed request/reply messages
pub mod proto;

/// Wire-level encode/decode of the protocol messages
pub mod marshal;

/// Memory region attributes and the MR registry
pub mod memory_region;

/// The NIC seam and the registry of opened NICs
pub mod nic;

/// Queue pair configuration, connection attributes and the QP registry
pub mod queue_pair;

/// The simple RPC transport used for bootstrap
pub mod srpc;

/// The control-path daemon itself
pub mod rctrl;

pub use memory_region::{MRRegistry, MemoryRegionAttr};
pub use nic::{NicRef, NicRegistry, RdmaNic};
pub use proto::{CallbackStatus, MRReply, MRReq, RCReply, RCReq, RpcOpcode};
pub use queue_pair::{QPAttr, QPConfig, QPRegistry, QueuePairStatus, ReliableConnection};
pub use rctrl::RCtrl;
pub use srpc::{SRpcClient, SRpcServer};

/// The error type of control plane operations.
/// These mainly include errors of creating QPs, registering MRs, etc.
#[derive(thiserror::Error, Debug)]
pub enum ControlpathError {
    /// Used for identify create different resource error
    /// e.g., QP, MR, etc.
    #[error("create {0} error")]
    CreationError(&'static str),

    #[error("Invalid arg for {0}")]
    InvalidArg(&'static str),

    #[error("Query error: {0}")]
    QueryError(&'static str),
}

/// The error type of bootstrap communication.
/// This captures errors carried on during the out-of-band handshake.
#[derive(thiserror::Error, Debug)]
pub enum CMError {
    #[error("Failed to marshal {0}")]
    Marshal(&'static str),

    #[error("Create server error: {0}: {1}")]
    ServerError(&'static str, std::io::Error),

    #[error("CM send error: {0}")]
    SendError(&'static str),

    #[error("Invalid arg on {0}")]
    InvalidArg(&'static str),

    #[error("Unknown error")]
    Unknown,
}
