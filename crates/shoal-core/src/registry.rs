// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use crate::{config::normalize_addr, transport::Peer};

/// The file server's view of connected peers, keyed by remote address.
/// Peers are owned by the transport; the registry holds shared handles.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A second insert for the same remote address wins
    /// and the displaced handle is returned so the caller can close it.
    pub fn insert(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(peer.remote_addr(), peer)
    }

    /// Remove a peer. Idempotent: removing an unknown address is a no-op.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.inner.lock().expect("registry lock poisoned").remove(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(addr)
            .cloned()
    }

    /// Consistent snapshot for broadcast fan-out.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve user-supplied target selectors (`"host:port"` or bare
    /// `":port"`) against connected peers. A selector matches a peer's
    /// remote address, the address it was dialed at, or, for bare ports,
    /// the remote port alone.
    pub fn select(&self, targets: &[String]) -> Vec<Arc<Peer>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut matched: HashMap<SocketAddr, Arc<Peer>> = HashMap::new();
        for target in targets {
            let normalized = normalize_addr(target);
            let bare_port = target
                .strip_prefix(':')
                .and_then(|port| port.parse::<u16>().ok());
            for (addr, peer) in inner.iter() {
                let hit = addr.to_string() == normalized
                    || peer.dial_addr() == Some(normalized.as_str())
                    || bare_port.is_some_and(|port| addr.port() == port);
                if hit {
                    matched.insert(*addr, Arc::clone(peer));
                }
            }
        }
        matched.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Build a connected peer pair; returns the dialer-side handle.
    async fn outbound_peer() -> (Arc<Peer>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (accepted, _) = listener.accept().await.expect("accept");
        let stream = dial.await.expect("join").expect("connect");
        let peer = Peer::new(stream, true, Some(addr.to_string())).expect("peer");
        (peer, accepted)
    }

    #[tokio::test]
    async fn duplicate_insert_displaces_the_prior_handle() {
        let registry = PeerRegistry::new();
        let (peer, _held) = outbound_peer().await;

        assert!(registry.insert(Arc::clone(&peer)).is_none());
        let displaced = registry.insert(Arc::clone(&peer)).expect("displaced");
        assert_eq!(displaced.remote_addr(), peer.remote_addr());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = PeerRegistry::new();
        let (peer, _held) = outbound_peer().await;
        let addr = peer.remote_addr();

        registry.insert(peer);
        assert!(registry.remove(&addr).is_some());
        assert!(registry.remove(&addr).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn select_matches_dial_addr_and_bare_port() {
        let registry = PeerRegistry::new();
        let (peer, _held) = outbound_peer().await;
        let addr = peer.remote_addr();
        registry.insert(Arc::clone(&peer));

        let by_addr = registry.select(&[addr.to_string()]);
        assert_eq!(by_addr.len(), 1);

        let by_port = registry.select(&[format!(":{}", addr.port())]);
        assert_eq!(by_port.len(), 1);

        let no_match = registry.select(&[":1".to_string()]);
        assert!(no_match.is_empty());

        // Duplicate specs still yield one handle per peer.
        let deduped = registry.select(&[addr.to_string(), format!(":{}", addr.port())]);
        assert_eq!(deduped.len(), 1);
    }
}
