//! In-process tunnel routing table.
//!
//! Three indexes map public identifiers to live multiplex sessions:
//! subdomain → HTTP entry, external port → TCP entry, external port → UDP
//! entry. Entries hold a non-owning [`MuxHandle`]; the relay handler that
//! created a session removes its bindings on teardown, so no entry outlives
//! the session it points at.

use std::collections::HashMap;
use std::sync::RwLock;

use portway_proto::mux::MuxHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tunnel already registered")]
    TunnelExists,
    #[error("subdomain required")]
    SubdomainRequired,
    #[error("tunnel id required")]
    TunnelIdRequired,
    #[error("external port required")]
    PortRequired,
}

/// Live binding for an HTTP tunnel.
#[derive(Clone)]
pub struct HttpEntry {
    pub tunnel_id: String,
    pub subdomain: String,
    pub allowlist: Vec<String>,
    pub session: MuxHandle,
}

/// Live binding for a raw TCP tunnel.
#[derive(Clone)]
pub struct TcpEntry {
    pub tunnel_id: String,
    pub external_port: u16,
    pub session: MuxHandle,
}

/// Live binding for a UDP tunnel.
#[derive(Clone)]
pub struct UdpEntry {
    pub tunnel_id: String,
    pub external_port: u16,
    pub session: MuxHandle,
}

#[derive(Default)]
struct Maps {
    http: HashMap<String, HttpEntry>,
    tcp: HashMap<u16, TcpEntry>,
    udp: HashMap<u16, UdpEntry>,
}

/// Thread-safe routing table. All operations take a short critical section
/// on a single reader-preferring lock.
#[derive(Default)]
pub struct Registry {
    maps: RwLock<Maps>,
}

fn subdomain_key(subdomain: &str) -> String {
    subdomain.trim().to_lowercase()
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a subdomain. Fails if the subdomain is already taken, by any
    /// tunnel.
    pub fn register_http(
        &self,
        tunnel_id: &str,
        session: MuxHandle,
        subdomain: &str,
        allowlist: Vec<String>,
    ) -> Result<(), RegistryError> {
        let key = subdomain_key(subdomain);
        if key.is_empty() {
            return Err(RegistryError::SubdomainRequired);
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        if maps.http.contains_key(&key) {
            return Err(RegistryError::TunnelExists);
        }
        maps.http.insert(
            key.clone(),
            HttpEntry {
                tunnel_id: tunnel_id.to_string(),
                subdomain: key,
                allowlist,
                session,
            },
        );
        Ok(())
    }

    pub fn remove_http(&self, subdomain: &str) {
        let key = subdomain_key(subdomain);
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.http.remove(&key);
    }

    /// Remove every HTTP binding owned by `tunnel_id`, returning them.
    pub fn remove_http_by_tunnel_id(&self, tunnel_id: &str) -> Vec<HttpEntry> {
        if tunnel_id.is_empty() {
            return Vec::new();
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        let keys: Vec<String> = maps
            .http
            .iter()
            .filter(|(_, entry)| entry.tunnel_id == tunnel_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| maps.http.remove(key)).collect()
    }

    #[must_use]
    pub fn lookup_http(&self, subdomain: &str) -> Option<HttpEntry> {
        let key = subdomain_key(subdomain);
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.http.get(&key).cloned()
    }

    #[must_use]
    pub fn lookup_http_by_tunnel_id(&self, tunnel_id: &str) -> Option<HttpEntry> {
        if tunnel_id.is_empty() {
            return None;
        }
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.http
            .values()
            .find(|entry| entry.tunnel_id == tunnel_id)
            .cloned()
    }

    #[must_use]
    pub fn list_http(&self) -> Vec<HttpEntry> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.http.values().cloned().collect()
    }

    /// Bind a TCP port. Re-binding by the same tunnel id replaces the entry
    /// (reconnect without an explicit remove); a different owner conflicts.
    pub fn register_tcp(
        &self,
        tunnel_id: &str,
        session: MuxHandle,
        external_port: u16,
    ) -> Result<(), RegistryError> {
        if tunnel_id.is_empty() {
            return Err(RegistryError::TunnelIdRequired);
        }
        if external_port == 0 {
            return Err(RegistryError::PortRequired);
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        if let Some(existing) = maps.tcp.get(&external_port) {
            if existing.tunnel_id != tunnel_id {
                return Err(RegistryError::TunnelExists);
            }
        }
        maps.tcp.insert(
            external_port,
            TcpEntry {
                tunnel_id: tunnel_id.to_string(),
                external_port,
                session,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn lookup_tcp(&self, external_port: u16) -> Option<TcpEntry> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.tcp.get(&external_port).cloned()
    }

    pub fn remove_tcp(&self, external_port: u16) {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.tcp.remove(&external_port);
    }

    pub fn remove_tcp_by_tunnel_id(&self, tunnel_id: &str) -> Vec<TcpEntry> {
        if tunnel_id.is_empty() {
            return Vec::new();
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        let ports: Vec<u16> = maps
            .tcp
            .iter()
            .filter(|(_, entry)| entry.tunnel_id == tunnel_id)
            .map(|(port, _)| *port)
            .collect();
        ports.iter().filter_map(|port| maps.tcp.remove(port)).collect()
    }

    #[must_use]
    pub fn list_tcp(&self) -> Vec<TcpEntry> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.tcp.values().cloned().collect()
    }

    /// Bind a UDP port, with the same rebind tolerance as TCP.
    pub fn register_udp(
        &self,
        tunnel_id: &str,
        session: MuxHandle,
        external_port: u16,
    ) -> Result<(), RegistryError> {
        if tunnel_id.is_empty() {
            return Err(RegistryError::TunnelIdRequired);
        }
        if external_port == 0 {
            return Err(RegistryError::PortRequired);
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        if let Some(existing) = maps.udp.get(&external_port) {
            if existing.tunnel_id != tunnel_id {
                return Err(RegistryError::TunnelExists);
            }
        }
        maps.udp.insert(
            external_port,
            UdpEntry {
                tunnel_id: tunnel_id.to_string(),
                external_port,
                session,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn lookup_udp(&self, external_port: u16) -> Option<UdpEntry> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.udp.get(&external_port).cloned()
    }

    pub fn remove_udp(&self, external_port: u16) {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.udp.remove(&external_port);
    }

    pub fn remove_udp_by_tunnel_id(&self, tunnel_id: &str) -> Vec<UdpEntry> {
        if tunnel_id.is_empty() {
            return Vec::new();
        }
        let mut maps = self.maps.write().expect("registry lock poisoned");
        let ports: Vec<u16> = maps
            .udp
            .iter()
            .filter(|(_, entry)| entry.tunnel_id == tunnel_id)
            .map(|(port, _)| *port)
            .collect();
        ports.iter().filter_map(|port| maps.udp.remove(port)).collect()
    }

    #[must_use]
    pub fn list_udp(&self) -> Vec<UdpEntry> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.udp.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session() -> MuxHandle {
        use tokio_util::compat::TokioAsyncReadCompatExt;
        let (a, _b) = tokio::io::duplex(64);
        let (handle, _incoming) = portway_proto::mux::spawn(a.compat(), portway_proto::mux::Mode::Client);
        handle
    }

    #[tokio::test]
    async fn test_register_http_duplicate_subdomain() {
        let registry = Registry::new();
        registry
            .register_http("t1", dummy_session(), "app", Vec::new())
            .unwrap();
        let err = registry
            .register_http("t2", dummy_session(), "app", Vec::new())
            .unwrap_err();
        assert_eq!(err, RegistryError::TunnelExists);
    }

    #[tokio::test]
    async fn test_subdomain_keys_normalized() {
        let registry = Registry::new();
        registry
            .register_http("t1", dummy_session(), "  App ", Vec::new())
            .unwrap();
        assert!(registry.lookup_http("APP").is_some());
        registry.remove_http("app");
        assert!(registry.lookup_http("app").is_none());
    }

    #[tokio::test]
    async fn test_register_tcp_conflict_and_rebind() {
        let registry = Registry::new();
        registry.register_tcp("t1", dummy_session(), 25000).unwrap();
        let err = registry
            .register_tcp("t2", dummy_session(), 25000)
            .unwrap_err();
        assert_eq!(err, RegistryError::TunnelExists);
        // Same tunnel id may rebind without removing first.
        registry.register_tcp("t1", dummy_session(), 25000).unwrap();
        assert_eq!(registry.lookup_tcp(25000).unwrap().tunnel_id, "t1");
    }

    #[tokio::test]
    async fn test_udp_and_tcp_port_spaces_are_disjoint() {
        let registry = Registry::new();
        registry.register_tcp("t1", dummy_session(), 30000).unwrap();
        registry.register_udp("t2", dummy_session(), 30000).unwrap();
        assert_eq!(registry.lookup_tcp(30000).unwrap().tunnel_id, "t1");
        assert_eq!(registry.lookup_udp(30000).unwrap().tunnel_id, "t2");
    }

    #[tokio::test]
    async fn test_remove_http_by_tunnel_id_complete() {
        let registry = Registry::new();
        registry
            .register_http("t1", dummy_session(), "app", Vec::new())
            .unwrap();
        registry
            .register_http("t1", dummy_session(), "api", Vec::new())
            .unwrap();
        registry
            .register_http("t2", dummy_session(), "other", Vec::new())
            .unwrap();

        let removed = registry.remove_http_by_tunnel_id("t1");
        assert_eq!(removed.len(), 2);
        assert!(registry.lookup_http("app").is_none());
        assert!(registry.lookup_http("api").is_none());
        assert!(registry.lookup_http("other").is_some());
        assert!(registry.lookup_http_by_tunnel_id("t2").is_some());
    }

    #[tokio::test]
    async fn test_remove_by_tunnel_id_for_ports() {
        let registry = Registry::new();
        registry.register_tcp("t1", dummy_session(), 25000).unwrap();
        registry.register_udp("t1", dummy_session(), 40000).unwrap();
        registry.register_udp("t2", dummy_session(), 40001).unwrap();

        assert_eq!(registry.remove_tcp_by_tunnel_id("t1").len(), 1);
        assert_eq!(registry.remove_udp_by_tunnel_id("t1").len(), 1);
        assert!(registry.lookup_tcp(25000).is_none());
        assert!(registry.lookup_udp(40000).is_none());
        assert!(registry.lookup_udp(40001).is_some());
    }

    #[tokio::test]
    async fn test_list_snapshots() {
        let registry = Registry::new();
        registry
            .register_http("t1", dummy_session(), "app", vec!["10.0.0.0/8".to_string()])
            .unwrap();
        registry.register_tcp("t1", dummy_session(), 25000).unwrap();
        registry.register_udp("t1", dummy_session(), 40000).unwrap();
        assert_eq!(registry.list_http().len(), 1);
        assert_eq!(registry.list_tcp().len(), 1);
        assert_eq!(registry.list_udp().len(), 1);
        assert_eq!(registry.list_http()[0].allowlist, vec!["10.0.0.0/8"]);
    }
}
