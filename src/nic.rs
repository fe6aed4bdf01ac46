//! The seam between the daemon and the verbs layer.
//!
//! The daemon only ever asks an opened NIC for one thing: create an RC queue
//! pair with a caller-supplied configuration. Everything else (device
//! enumeration, context/PD setup) belongs to the embedding application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::queue_pair::{QPConfig, ReliableConnection};
use crate::ControlpathError;

/// An opened RDMA-capable NIC on which RC queue pairs can be created.
pub trait RdmaNic: Send + Sync {
    fn create_rc(&self, config: QPConfig) -> Result<Arc<dyn ReliableConnection>, ControlpathError>;
}

pub type NicRef = Arc<dyn RdmaNic>;

/// Registry of the NICs the embedding application has opened, keyed by a
/// machine-local id. The daemon only looks NICs up; it never opens or
/// closes them.
#[derive(Default)]
pub struct NicRegistry {
    opened_nics: Mutex<HashMap<u64, NicRef>>,
}

impl NicRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Ids are unique: registering an already used id is an error.
    pub fn register_nic(&self, id: u64, nic: NicRef) -> Result<(), ControlpathError> {
        let mut nics = self.opened_nics.lock().unwrap_or_else(|e| e.into_inner());
        if nics.contains_key(&id) {
            return Err(ControlpathError::InvalidArg("duplicated NIC id"));
        }
        nics.insert(id, nic);
        Ok(())
    }

    #[inline]
    pub fn find_opened_nic(&self, id: u64) -> Option<NicRef> {
        self.opened_nics.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    /// Removing an absent id is not an error.
    pub fn deregister_nic(&self, id: u64) {
        self.opened_nics.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}
