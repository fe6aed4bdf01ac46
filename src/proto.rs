//! The bootstrap protocol between RDMA peers.
//!
//! Every reply carries a [`CallbackStatus`] so that errors never cross the
//! RPC boundary as anything but a status code. The attribute payload of a
//! reply is present iff the status is `Ok`.

use serde_derive::{Deserialize, Serialize};

use crate::memory_region::MemoryRegionAttr;
use crate::queue_pair::{QPAttr, QPConfig};

/// The outcome of a bootstrap callback, carried in every reply.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CallbackStatus {
    Ok,
    NotFound,
    WrongArg,
}

/// Operation identifiers the daemon registers its handlers against.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum RpcOpcode {
    FetchMr,
    CreateRC,
}

/// The envelope of a single request: the opcode selects the handler, the
/// `serialized` field holds the marshalled request message.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RpcMessage {
    pub op: RpcOpcode,
    pub serialized: String,
}

/// Query the remote-access attributes of a registered memory region.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct MRReq {
    pub id: u64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct MRReply {
    pub status: CallbackStatus,
    pub attr: Option<MemoryRegionAttr>,
}

/// Create an RC queue pair on this machine and connect it to the requester
/// (`whether_create == 1`), or query an already created one
/// (`whether_create == 0`).
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct RCReq {
    /// The id the queue pair is (or will be) registered under
    pub id: u64,
    /// Which opened NIC to create the queue pair on
    pub nic_id: u64,
    /// 0 or 1; any other value is rejected as WrongArg
    pub whether_create: u8,
    pub config: QPConfig,
    /// The requester's side of the RC handshake
    pub attr: QPAttr,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct RCReply {
    pub status: CallbackStatus,
    pub attr: Option<QPAttr>,
}

impl MRReply {
    #[inline]
    pub fn err(status: CallbackStatus) -> Self {
        Self { status, attr: None }
    }
}

impl RCReply {
    #[inline]
    pub fn err(status: CallbackStatus) -> Self {
        Self { status, attr: None }
    }
}
