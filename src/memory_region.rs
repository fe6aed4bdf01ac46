//! Remote-access attributes of registered memory regions.
//!
//! The daemon never owns the memory itself: the embedding application pins
//! and registers its regions with the verbs layer, then publishes the
//! resulting attributes here so that peers can fetch them over bootstrap.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::ControlpathError;

/// The remote-access descriptor of one registered memory region:
/// its virtual address, capacity and remote key.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct MemoryRegionAttr {
    pub addr: u64,
    pub capacity: u64,
    pub rkey: u32,
}

/// Registry of the memory regions opened for remote access, keyed by a
/// machine-local id. Safe to use from the daemon thread and from the
/// application's own threads concurrently.
#[derive(Default)]
pub struct MRRegistry {
    registered_mrs: Mutex<HashMap<u64, MemoryRegionAttr>>,
}

impl MRRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Publish the attributes of a memory region under `id`.
    /// Ids are unique: registering an already used id is an error.
    pub fn register(&self, id: u64, attr: MemoryRegionAttr) -> Result<(), ControlpathError> {
        let mut mrs = self.registered_mrs.lock().unwrap_or_else(|e| e.into_inner());
        if mrs.contains_key(&id) {
            return Err(ControlpathError::InvalidArg("duplicated MR id"));
        }
        mrs.insert(id, attr);
        Ok(())
    }

    #[inline]
    pub fn get_attr_byid(&self, id: u64) -> Option<MemoryRegionAttr> {
        self.registered_mrs.lock().unwrap_or_else(|e| e.into_inner()).get(&id).copied()
    }

    /// Remove the region registered under `id`, if any.
    /// Removing an absent id is not an error.
    pub fn deregister(&self, id: u64) {
        self.registered_mrs.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_query_deregister() {
        let mrs = MRRegistry::new();
        let attr = MemoryRegionAttr {
            addr: 0xdead_beef,
            capacity: 1024,
            rkey: 12,
        };
        assert!(mrs.register(73, attr).is_ok());
        assert_eq!(mrs.get_attr_byid(73), Some(attr));

        // duplicated id must be rejected
        assert!(mrs.register(73, attr).is_err());

        mrs.deregister(73);
        assert_eq!(mrs.get_attr_byid(73), None);

        // deregister is idempotent
        mrs.deregister(73);
    }

    #[test]
    fn never_registered_is_absent() {
        let mrs = MRRegistry::new();
        assert_eq!(mrs.get_attr_byid(42), None);
    }

    #[test]
    fn concurrent_registration() {
        let mrs = Arc::new(MRRegistry::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let mrs = mrs.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..64u64 {
                    let id = t * 64 + i;
                    let attr = MemoryRegionAttr {
                        addr: id,
                        capacity: 4096,
                        rkey: id as u32,
                    };
                    mrs.register(id, attr).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for id in 0..256u64 {
            let attr = mrs.get_attr_byid(id).unwrap();
            assert_eq!(attr.addr, id);
            assert_eq!(attr.rkey, id as u32);
        }
    }
}
