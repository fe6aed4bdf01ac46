//! RCtrl is a control-path daemon that handles all RDMA bootstrap requests
//! to this machine.
//!
//! The embedding application registers its NICs, memory regions and queue
//! pairs into the public registries at any time; a dedicated background
//! thread drains the bootstrap RPC channel one batch at a time and answers
//! peers. Every failure is turned into a reply status, so a bad request can
//! never take the daemon down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::marshal;
use crate::memory_region::MRRegistry;
use crate::nic::NicRegistry;
use crate::proto::{self, CallbackStatus, RpcOpcode};
use crate::queue_pair::QPRegistry;
use crate::srpc::SRpcServer;
use crate::CMError;

pub struct RCtrl {
    running: Arc<AtomicBool>,

    handler_tid: Option<thread::JoinHandle<u64>>,

    /// Present between construction and `start_daemon`, then owned by the
    /// daemon thread.
    rpc: Option<SRpcServer>,

    addr: SocketAddr,

    /// The registries which allow the user to **register** MRs, QPs and
    /// NICs so that others can establish communication with them.
    pub registered_mrs: Arc<MRRegistry>,
    pub registered_qps: Arc<QPRegistry>,
    pub opened_nics: Arc<NicRegistry>,
}

impl RCtrl {
    /// Bind the bootstrap endpoint on `port` (0 lets the OS choose) and
    /// register the protocol handlers over fresh registries. The daemon
    /// thread is not started yet.
    pub fn new(port: u16) -> Result<Self, CMError> {
        Self::with_registries(
            port,
            Arc::new(MRRegistry::new()),
            Arc::new(QPRegistry::new()),
            Arc::new(NicRegistry::new()),
        )
    }

    /// Like [`RCtrl::new`], but over registries the embedding application
    /// already owns (e.g., shared with another local service).
    pub fn with_registries(
        port: u16,
        registered_mrs: Arc<MRRegistry>,
        registered_qps: Arc<QPRegistry>,
        opened_nics: Arc<NicRegistry>,
    ) -> Result<Self, CMError> {
        let mut rpc = SRpcServer::new(port)?;
        let addr = rpc.local_addr()?;

        let mrs = registered_mrs.clone();
        if !rpc.register_handler(
            RpcOpcode::FetchMr,
            Box::new(move |bytes| fetch_mr_handler(&mrs, bytes)),
        ) {
            return Err(CMError::InvalidArg("FetchMr handler"));
        }

        let nics = opened_nics.clone();
        let qps = registered_qps.clone();
        if !rpc.register_handler(
            RpcOpcode::CreateRC,
            Box::new(move |bytes| rc_handler(&nics, &qps, bytes)),
        ) {
            return Err(CMError::InvalidArg("CreateRC handler"));
        }

        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            handler_tid: None,
            rpc: Some(rpc),
            addr,
            registered_mrs,
            registered_qps,
            opened_nics,
        })
    }

    /// The bootstrap endpoint peers should send their requests to.
    #[inline]
    pub fn listen_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the daemon thread for handling RDMA connection requests.
    ///
    /// The running flag is set before the thread is spawned, so the loop is
    /// guaranteed to observe it. A failed spawn is fatal at startup and
    /// reported here; a second start is an error.
    pub fn start_daemon(&mut self) -> Result<(), CMError> {
        let mut rpc = self
            .rpc
            .take()
            .ok_or(CMError::InvalidArg("daemon already started"))?;

        self.running.store(true, Ordering::Release);

        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("rctrl-daemon".to_string())
            .spawn(move || {
                let mut total_reqs: u64 = 0;
                while running.load(Ordering::Acquire) {
                    total_reqs += rpc.run_one_event_loop() as u64;
                }
                log::info!("stop with: {} processed.", total_reqs);
                total_reqs
            })
            .map_err(|e| CMError::ServerError("spawn daemon thread", e))?;

        self.handler_tid = Some(handle);
        Ok(())
    }

    /// Stop the daemon thread and block until it has fully exited; no
    /// handler runs after this returns. Returns the number of requests the
    /// daemon processed over its lifetime, or `None` if it never ran.
    pub fn stop_daemon(&mut self) -> Option<u64> {
        let handle = self.handler_tid.take()?;
        self.running.store(false, Ordering::Release);
        handle.join().ok()
    }
}

impl Drop for RCtrl {
    fn drop(&mut self) {
        self.stop_daemon();
    }
}

fn fetch_mr_handler(mrs: &MRRegistry, bytes: &[u8]) -> Vec<u8> {
    let reply = match marshal::dedump::<proto::MRReq>(bytes) {
        Some(req) => match mrs.get_attr_byid(req.id) {
            Some(attr) => proto::MRReply {
                status: CallbackStatus::Ok,
                attr: Some(attr),
            },
            None => proto::MRReply::err(CallbackStatus::NotFound),
        },
        None => proto::MRReply::err(CallbackStatus::WrongArg),
    };
    marshal::dump(&reply).unwrap_or_else(|_| marshal::wrong_arg_reply())
}

fn rc_handler(nics: &NicRegistry, qps: &QPRegistry, bytes: &[u8]) -> Vec<u8> {
    let reply = handle_rc_req(nics, qps, bytes);
    marshal::dump(&reply).unwrap_or_else(|_| marshal::wrong_arg_reply())
}

/// Handling the RC request.
///
/// The process has three steps:
/// 1. sanity check the request
/// 2. if the requester asks for it, create the QP on the named NIC and
///    connect it; a failed connect deregisters the QP before replying
/// 3. query the RC attribute and return it to the requester
fn handle_rc_req(nics: &NicRegistry, qps: &QPRegistry, bytes: &[u8]) -> proto::RCReply {
    let req = match marshal::dedump::<proto::RCReq>(bytes) {
        Some(r) => r,
        None => return proto::RCReply::err(CallbackStatus::WrongArg),
    };

    if req.whether_create != 0 && req.whether_create != 1 {
        return proto::RCReply::err(CallbackStatus::WrongArg);
    }

    if req.whether_create == 1 {
        let nic = match nics.find_opened_nic(req.nic_id) {
            Some(nic) => nic,
            None => return proto::RCReply::err(CallbackStatus::WrongArg),
        };

        let qp = match qps.create_and_register_rc(req.id, &nic, req.config) {
            Ok(qp) => qp,
            Err(_) => return proto::RCReply::err(CallbackStatus::WrongArg),
        };

        if qp.connect(&req.attr).is_err() {
            // the record must not outlive the failed connect
            qps.deregister_rc(req.id);
            return proto::RCReply::err(CallbackStatus::WrongArg);
        }
        qps.mark_connected(req.id);
    }

    fetch_qp_attr(qps, req.id)
}

/// Given a QP id, query its attribute from the registered QPs.
fn fetch_qp_attr(qps: &QPRegistry, id: u64) -> proto::RCReply {
    match qps.query_rc(id) {
        Some(qp) => proto::RCReply {
            status: CallbackStatus::Ok,
            attr: Some(qp.my_attr()),
        },
        None => proto::RCReply::err(CallbackStatus::NotFound),
    }
}
