//! RC queue pair records managed on behalf of remote peers.
//!
//! A queue pair created through the bootstrap path lives in the
//! [`QPRegistry`] under the id the requester chose. The record is observable
//! iff creation succeeded and, when the request also connected it, the
//! connect succeeded too: a failed connect deregisters the record in the
//! same request, so once the reply is sent no half-built queue pair is
//! visible. The guarantee is per request, not per lookup: while a connect
//! is still in flight, a concurrent lookup may see the record in `Created`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::nic::NicRef;
use crate::ControlpathError;

/// A serializable `ibv_gid`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct GidWrapper {
    pub subnet_prefix: u64,
    pub interface_id: u64,
}

/// The connection attributes one side of an RC handshake reports to the
/// other: enough for the peer to bring its own queue pair up to
/// ready-to-send against ours.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct QPAttr {
    pub lid: u32,
    pub gid: GidWrapper,
    pub qpn: u32,
    pub psn: u32,
    pub port_num: u8,
}

/// Caller-supplied queue pair creation parameters, forwarded to the NIC
/// untouched.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct QPConfig {
    pub access_flags: u32,
    pub max_send_size: u32,
    pub max_recv_size: u32,
    pub timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
}

impl Default for QPConfig {
    fn default() -> Self {
        Self {
            access_flags: 0,
            max_send_size: 64,
            max_recv_size: 64,
            timeout: 20,
            retry_count: 6,
            rnr_retry: 6,
        }
    }
}

/// An RC queue pair as the daemon sees it: it can be connected to a peer
/// once, and it can report its local connection attributes.
pub trait ReliableConnection: Send + Sync {
    fn connect(&self, peer: &QPAttr) -> Result<(), ControlpathError>;
    fn my_attr(&self) -> QPAttr;
}

/// Connection state of a registered queue pair. A record never moves
/// backward from `Connected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePairStatus {
    Created,
    Connected,
}

struct QPRecord {
    qp: Arc<dyn ReliableConnection>,
    status: QueuePairStatus,
}

/// Registry of the RC queue pairs created through bootstrap, keyed by the
/// requester-chosen id. Safe for concurrent use by the daemon thread and
/// the application's own threads.
#[derive(Default)]
pub struct QPRegistry {
    registered_qps: Mutex<HashMap<u64, QPRecord>>,
}

impl QPRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Create an RC queue pair on `nic` and register it under `id` in the
    /// `Created` state. Fails if `id` is already taken or the NIC fails to
    /// create the queue pair; in both cases the registry is unchanged.
    ///
    /// The record is inserted before the caller runs `connect`, so other
    /// threads may observe it in `Created` until the connect resolves; a
    /// failed connect must deregister it before the request replies.
    pub fn create_and_register_rc(
        &self,
        id: u64,
        nic: &NicRef,
        config: QPConfig,
    ) -> Result<Arc<dyn ReliableConnection>, ControlpathError> {
        let mut qps = self.registered_qps.lock().unwrap_or_else(|e| e.into_inner());
        if qps.contains_key(&id) {
            return Err(ControlpathError::InvalidArg("duplicated QP id"));
        }
        let qp = nic.create_rc(config)?;
        qps.insert(
            id,
            QPRecord {
                qp: qp.clone(),
                status: QueuePairStatus::Created,
            },
        );
        Ok(qp)
    }

    #[inline]
    pub fn query_rc(&self, id: u64) -> Option<Arc<dyn ReliableConnection>> {
        self.registered_qps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|r| r.qp.clone())
    }

    #[inline]
    pub fn state_of(&self, id: u64) -> Option<QueuePairStatus> {
        self.registered_qps.lock().unwrap_or_else(|e| e.into_inner()).get(&id).map(|r| r.status)
    }

    /// Mark the record under `id` connected after a successful handshake.
    pub fn mark_connected(&self, id: u64) {
        if let Some(r) = self.registered_qps.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&id) {
            r.status = QueuePairStatus::Connected;
        }
    }

    /// Remove the record under `id`, if any. The only way to undo a
    /// `create_and_register_rc`; removing an absent id is not an error.
    pub fn deregister_rc(&self, id: u64) {
        self.registered_qps.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRc {
        attr: QPAttr,
        fail_connect: bool,
    }

    impl ReliableConnection for FakeRc {
        fn connect(&self, _peer: &QPAttr) -> Result<(), ControlpathError> {
            if self.fail_connect {
                return Err(ControlpathError::CreationError("connect"));
            }
            Ok(())
        }

        fn my_attr(&self) -> QPAttr {
            self.attr
        }
    }

    struct FakeNic {
        fail_create: bool,
    }

    impl crate::nic::RdmaNic for FakeNic {
        fn create_rc(
            &self,
            _config: QPConfig,
        ) -> Result<Arc<dyn ReliableConnection>, ControlpathError> {
            if self.fail_create {
                return Err(ControlpathError::CreationError("QP"));
            }
            Ok(Arc::new(FakeRc {
                attr: QPAttr {
                    lid: 1,
                    qpn: 73,
                    ..Default::default()
                },
                fail_connect: false,
            }))
        }
    }

    #[test]
    fn create_register_query() {
        let qps = QPRegistry::new();
        let nic: NicRef = Arc::new(FakeNic { fail_create: false });

        let qp = qps
            .create_and_register_rc(12, &nic, Default::default())
            .unwrap();
        assert_eq!(qp.my_attr().qpn, 73);
        assert_eq!(qps.state_of(12), Some(QueuePairStatus::Created));

        qps.mark_connected(12);
        assert_eq!(qps.state_of(12), Some(QueuePairStatus::Connected));

        // duplicated id must be rejected without touching the record
        assert!(qps
            .create_and_register_rc(12, &nic, Default::default())
            .is_err());
        assert_eq!(qps.state_of(12), Some(QueuePairStatus::Connected));

        qps.deregister_rc(12);
        assert!(qps.query_rc(12).is_none());
        qps.deregister_rc(12); // idempotent
    }

    #[test]
    fn failed_creation_leaves_no_record() {
        let qps = QPRegistry::new();
        let nic: NicRef = Arc::new(FakeNic { fail_create: true });
        assert!(qps
            .create_and_register_rc(12, &nic, Default::default())
            .is_err());
        assert!(qps.query_rc(12).is_none());
    }
}
