//! The host registry.
//!
//! Three mappings kept consistent under one lock: by VPN IP (primary), by
//! our local connection index, and by the peer's index. Two instances
//! exist per node, pending (attempts in progress, owned by the handshake
//! manager) and main (established tunnels); a HostInfo lives in at most
//! one of them at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::{Subnet4, VpnIp};

use super::info::{HostInfo, HostState};

struct Indexes {
    by_vpn_ip: HashMap<VpnIp, Arc<HostInfo>>,
    by_local_index: HashMap<u32, Arc<HostInfo>>,
    by_remote_index: HashMap<u32, Arc<HostInfo>>,
}

/// One registry of peers, triple-indexed.
pub struct HostMap {
    name: &'static str,
    preferred_ranges: Vec<Subnet4>,
    inner: Mutex<Indexes>,
}

impl HostMap {
    /// Create an empty registry. `name` tags log lines; the preferred
    /// ranges rank candidate remotes.
    pub fn new(name: &'static str, preferred_ranges: Vec<Subnet4>) -> Self {
        Self {
            name,
            preferred_ranges,
            inner: Mutex::new(Indexes {
                by_vpn_ip: HashMap::new(),
                by_local_index: HashMap::new(),
                by_remote_index: HashMap::new(),
            }),
        }
    }

    /// Ranges used to rank candidate remotes.
    pub fn preferred_ranges(&self) -> &[Subnet4] {
        &self.preferred_ranges
    }

    /// Register a host under every index it has. The caller holds the
    /// host's lock and passes its guard, which also pins the lock order
    /// (host before map). Returns the entry this one displaced, if any.
    pub fn add_host_info(&self, hi: &Arc<HostInfo>, st: &HostState) -> Option<Arc<HostInfo>> {
        let mut inner = self.lock();
        let prior = inner.by_vpn_ip.insert(st.host_id, Arc::clone(hi));
        if let Some(prior) = &prior {
            if !Arc::ptr_eq(prior, hi) {
                debug!(map = self.name, vpn_ip = %st.host_id, "replacing existing host entry");
            }
        }
        if st.local_index_id != 0 {
            inner.by_local_index.insert(st.local_index_id, Arc::clone(hi));
        }
        if st.remote_index_id != 0 {
            inner.by_remote_index.insert(st.remote_index_id, Arc::clone(hi));
        }
        prior.filter(|p| !Arc::ptr_eq(p, hi))
    }

    /// Register a host only under its local index, before its VPN IP entry
    /// exists. Used while a stage-0 packet is being built.
    pub fn add_local_index(&self, hi: &Arc<HostInfo>, local_index: u32) {
        let mut inner = self.lock();
        inner.by_local_index.insert(local_index, Arc::clone(hi));
    }

    /// Remove a host from every index, if the entries still refer to it.
    /// Entries that were already replaced by a newer record are left
    /// alone. Returns whether anything was removed.
    pub fn delete_host_info(&self, hi: &Arc<HostInfo>, st: &HostState) -> bool {
        let mut inner = self.lock();
        let mut removed = false;
        if let Some(existing) = inner.by_vpn_ip.get(&st.host_id) {
            if Arc::ptr_eq(existing, hi) {
                inner.by_vpn_ip.remove(&st.host_id);
                removed = true;
            }
        }
        if let Some(existing) = inner.by_local_index.get(&st.local_index_id) {
            if Arc::ptr_eq(existing, hi) {
                inner.by_local_index.remove(&st.local_index_id);
                removed = true;
            }
        }
        if let Some(existing) = inner.by_remote_index.get(&st.remote_index_id) {
            if Arc::ptr_eq(existing, hi) {
                inner.by_remote_index.remove(&st.remote_index_id);
                removed = true;
            }
        }
        if removed {
            debug!(map = self.name, vpn_ip = %st.host_id, local_index = st.local_index_id, "deleted host entry");
        }
        removed
    }

    /// Look up by overlay address.
    pub fn query_vpn_ip(&self, vpn_ip: VpnIp) -> Option<Arc<HostInfo>> {
        self.lock().by_vpn_ip.get(&vpn_ip).cloned()
    }

    /// Register `candidate` under a VPN IP unless an entry already exists,
    /// atomically. Returns the winning record and whether the candidate
    /// was inserted. Keeps concurrent workers from racing two attempts to
    /// the same peer.
    pub fn get_or_insert_vpn_ip(
        &self,
        vpn_ip: VpnIp,
        candidate: Arc<HostInfo>,
    ) -> (Arc<HostInfo>, bool) {
        let mut inner = self.lock();
        if let Some(existing) = inner.by_vpn_ip.get(&vpn_ip) {
            return (Arc::clone(existing), false);
        }
        inner.by_vpn_ip.insert(vpn_ip, Arc::clone(&candidate));
        (candidate, true)
    }

    /// Look up by our connection index.
    pub fn query_index(&self, local_index: u32) -> Option<Arc<HostInfo>> {
        self.lock().by_local_index.get(&local_index).cloned()
    }

    /// Look up by the peer's connection index.
    pub fn query_reverse_index(&self, remote_index: u32) -> Option<Arc<HostInfo>> {
        self.lock().by_remote_index.get(&remote_index).cloned()
    }

    /// Is a local index already taken in this map?
    pub fn index_in_use(&self, local_index: u32) -> bool {
        self.lock().by_local_index.contains_key(&local_index)
    }

    /// Snapshot of every registered host, for timer sweeps. The sweep must
    /// tolerate hosts being deleted between the snapshot and their turn.
    pub fn hosts(&self) -> Vec<Arc<HostInfo>> {
        self.lock().by_vpn_ip.values().cloned().collect()
    }

    /// Number of hosts registered by VPN IP.
    pub fn len(&self) -> usize {
        self.lock().by_vpn_ip.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indexes> {
        self.inner.lock().expect("hostmap lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::REPLAY_WINDOW_SIZE;
    use crate::crypto::{ConnectionState, PresharedKey, StaticKeypair};
    use std::time::Instant;

    fn test_host(ip: VpnIp, local: u32, remote: u32) -> Arc<HostInfo> {
        let keys = StaticKeypair::generate();
        let conn =
            ConnectionState::new(&keys, &PresharedKey::default(), true, REPLAY_WINDOW_SIZE)
                .unwrap();
        let hi = Arc::new(HostInfo::new(ip, conn, Instant::now()));
        {
            let mut st = hi.lock();
            st.local_index_id = local;
            st.remote_index_id = remote;
        }
        hi
    }

    #[test]
    fn test_triple_index_consistency() {
        let map = HostMap::new("main", Vec::new());
        let ip = VpnIp::from_octets(10, 0, 0, 1);
        let hi = test_host(ip, 11, 22);

        {
            let st = hi.lock();
            map.add_host_info(&hi, &st);
        }

        let by_ip = map.query_vpn_ip(ip).unwrap();
        let by_local = map.query_index(11).unwrap();
        let by_remote = map.query_reverse_index(22).unwrap();
        assert!(Arc::ptr_eq(&by_ip, &by_local));
        assert!(Arc::ptr_eq(&by_ip, &by_remote));
        assert!(Arc::ptr_eq(&by_ip, &hi));
    }

    #[test]
    fn test_delete_purges_all_indices() {
        let map = HostMap::new("main", Vec::new());
        let ip = VpnIp::from_octets(10, 0, 0, 2);
        let hi = test_host(ip, 33, 44);

        {
            let st = hi.lock();
            map.add_host_info(&hi, &st);
            assert!(map.delete_host_info(&hi, &st));
        }

        assert!(map.query_vpn_ip(ip).is_none());
        assert!(map.query_index(33).is_none());
        assert!(map.query_reverse_index(44).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_replacement_returns_prior() {
        let map = HostMap::new("main", Vec::new());
        let ip = VpnIp::from_octets(10, 0, 0, 3);
        let old = test_host(ip, 1, 2);
        let new = test_host(ip, 3, 4);

        {
            let st = old.lock();
            assert!(map.add_host_info(&old, &st).is_none());
        }
        let prior = {
            let st = new.lock();
            map.add_host_info(&new, &st)
        };
        assert!(Arc::ptr_eq(&prior.unwrap(), &old));

        // Deleting the displaced record must not disturb the new one.
        {
            let st = old.lock();
            map.delete_host_info(&old, &st);
        }
        assert!(Arc::ptr_eq(&map.query_vpn_ip(ip).unwrap(), &new));
        assert!(map.query_index(3).is_some());
        // The old local index does go away.
        assert!(map.query_index(1).is_none());
    }

    #[test]
    fn test_index_in_use() {
        let map = HostMap::new("pending", Vec::new());
        let hi = test_host(VpnIp::from_octets(10, 0, 0, 4), 77, 0);
        assert!(!map.index_in_use(77));
        map.add_local_index(&hi, 77);
        assert!(map.index_in_use(77));
    }
}
