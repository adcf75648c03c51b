//! Registry of addresses per domain.

use std::collections::HashMap;
use std::io::{Error, ErrorKind::Other, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;

use crate::message::{lossy, DomainId};

/// Stores the addresses registered under each domain.
///
/// Implementations must be safe to call concurrently from many handlers.
/// The server only needs these two operations, so a deployment can swap in
/// its own store, e.g. one shared by several load balanced servers.
pub trait AddressStore: Send + Sync {
    /// Return every address registered under `domain` except `addr`, then
    /// add (or refresh) `addr` in that domain.
    ///
    /// `addr` is removed again once `ttl` passes without another
    /// registration. With `ttl` of `None` it never expires.
    fn register(
        &self,
        domain: &[u8],
        addr: SocketAddr,
        ttl: Option<Duration>,
    ) -> Result<Vec<SocketAddr>>;

    /// Every address of every domain.
    fn list_all(&self) -> Result<Vec<SocketAddr>>;
}

struct Entry {
    addr: SocketAddr,
    // bumped on every registration, so an older expiry can't remove a refreshed entry
    generation: u64,
}

#[derive(Default)]
struct Domains {
    map: HashMap<DomainId, Vec<Entry>>,
    generation: u64,
}

/// In-memory [`AddressStore`] guarded by a single mutex.
///
/// Each registration with a ttl spawns one timer task on the current tokio
/// runtime.
#[derive(Clone, Default)]
pub struct DomainAddrMap {
    inner: Arc<Mutex<Domains>>,
}

impl DomainAddrMap {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Domains> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// addresses currently registered under `domain`, in registration order.
    pub fn peers(&self, domain: &[u8]) -> Option<Vec<SocketAddr>> {
        self.lock()
            .map
            .get(domain)
            .map(|entries| entries.iter().map(|e| e.addr).collect())
    }

    /// remove `addr` from `domain` now. Returns whether it was present.
    pub fn remove(&self, domain: &[u8], addr: SocketAddr) -> bool {
        let mut domains = self.lock();
        let Some(entries) = domains.map.get_mut(domain) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|e| e.addr != addr);
        let removed = entries.len() != before;

        if entries.is_empty() {
            domains.map.remove(domain);
        }

        removed
    }

    pub fn clear(&self) {
        self.lock().map.clear();
    }

    fn expire(&self, domain: &[u8], addr: SocketAddr, generation: u64) {
        let mut domains = self.lock();
        let Some(entries) = domains.map.get_mut(domain) else {
            return;
        };

        if let Some(i) = entries
            .iter()
            .position(|e| e.addr == addr && e.generation == generation)
        {
            entries.remove(i);
            log::debug!(addr:% = addr, domain:% = lossy(domain); "expired");
        }

        if entries.is_empty() {
            domains.map.remove(domain);
        }
    }
}

impl AddressStore for DomainAddrMap {
    fn register(
        &self,
        domain: &[u8],
        addr: SocketAddr,
        ttl: Option<Duration>,
    ) -> Result<Vec<SocketAddr>> {
        let runtime = match ttl {
            Some(_) => Some(Handle::try_current().map_err(|e| Error::new(Other, e))?),
            None => None,
        };

        let (peers, generation) = {
            let mut domains = self.lock();
            domains.generation += 1;
            let generation = domains.generation;

            let entries = domains.map.entry(domain.to_vec()).or_default();
            let peers: Vec<SocketAddr> = entries
                .iter()
                .map(|e| e.addr)
                .filter(|a| *a != addr)
                .collect();

            entries.retain(|e| e.addr != addr);
            entries.push(Entry { addr, generation });

            (peers, generation)
        };

        log::debug!(
            addr:% = addr,
            domain:% = lossy(domain),
            peers = peers.len();
            "registered"
        );

        if let (Some(ttl), Some(runtime)) = (ttl, runtime) {
            let store = self.clone();
            let domain = domain.to_vec();
            runtime.spawn(async move {
                sleep(ttl).await;
                store.expire(&domain, addr, generation);
            });
        }

        Ok(peers)
    }

    fn list_all(&self) -> Result<Vec<SocketAddr>> {
        Ok(self
            .lock()
            .map
            .values()
            .flat_map(|entries| entries.iter().map(|e| e.addr))
            .collect())
    }
}
