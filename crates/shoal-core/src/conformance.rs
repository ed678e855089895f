// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! End-to-end cluster scenarios on loopback nodes sharing one key.
#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use tokio::{
        io::AsyncWriteExt,
        net::TcpStream,
        time::sleep,
    };

    use crate::{
        crypto::{EncryptionKey, IV_LEN},
        error::Error,
        ids::Fingerprint,
        server::{FileServer, FileServerConfig, ServedFrom},
        transport::{TcpTransport, TcpTransportConfig},
    };

    const PAYLOAD: &[u8] = b"hello watashino soul society";

    async fn spawn_node(
        root: &Path,
        name: &str,
        bootstrap: Vec<String>,
        key: &EncryptionKey,
        request_timeout: Duration,
    ) -> Arc<FileServer> {
        let storage_root = root.join(name);
        let config = FileServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            bootstrap_peers: bootstrap,
            storage_root: storage_root.clone(),
            audit_path: storage_root.join("audit.log"),
            enc_key: key.clone(),
            request_timeout,
        };
        let transport = TcpTransport::new(TcpTransportConfig::new(config.listen_addr.clone()));
        let server = FileServer::new(config, transport).expect("build server");
        server.start().await.expect("start server");
        server
    }

    fn addr_of(server: &FileServer) -> String {
        server.local_addr().expect("listening").to_string()
    }

    async fn wait_for_peers(server: &FileServer, count: usize) {
        for _ in 0..150 {
            if server.peer_count() >= count {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("peers never connected");
    }

    async fn wait_for_copy(server: &FileServer, fingerprint: &Fingerprint, present: bool) {
        for _ in 0..150 {
            if server.store().has(fingerprint).await == present {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("replica state never converged");
    }

    /// Wait until a fully written replica of the given size exists (the
    /// file appears on disk before its payload finishes arriving).
    async fn wait_for_replica(server: &FileServer, fingerprint: &Fingerprint, size: u64) {
        for _ in 0..150 {
            if let Ok((len, _)) = server.store().read(fingerprint).await
                && len == size
            {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("replica never reached {size} bytes");
    }

    /// S1 / replication liveness: a store on one node lands a
    /// ciphertext copy of `len + IV` bytes on every peer, and the
    /// originator serves the plaintext back from its local copy.
    #[tokio::test]
    async fn store_replicates_to_every_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let b = spawn_node(dir.path(), "b", vec![addr_of(&a)], &key, timeout).await;
        let c = spawn_node(dir.path(), "c", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 2).await;

        let outcome = a
            .store_file("note.txt", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("store");
        assert!(outcome.replicas >= 1, "at least one peer must ack");
        assert_eq!(outcome.size_on_disk, PAYLOAD.len() as u64 + IV_LEN as u64);

        let fingerprint = Fingerprint::of("note.txt");
        wait_for_replica(&b, &fingerprint, outcome.size_on_disk).await;
        wait_for_replica(&c, &fingerprint, outcome.size_on_disk).await;

        let mut out = Vec::new();
        let got = a.get("note.txt", &mut out).await.expect("local get");
        assert_eq!(got.served_from, ServedFrom::Local);
        assert_eq!(out, PAYLOAD);

        let audit = std::fs::read_to_string(a.audit().path()).expect("audit");
        assert!(audit.contains("STORE_LOCAL"));
        assert!(audit.contains("STORE_BROADCAST"));
        assert!(audit.contains("PEER_CONNECT"));
    }

    /// S2 / remote GET: a node without a copy pulls it from a peer,
    /// returns the original plaintext, and keeps a write-through copy.
    #[tokio::test]
    async fn cold_node_pulls_copy_from_peers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let c = spawn_node(dir.path(), "c", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 1).await;
        wait_for_peers(&c, 1).await;

        let fingerprint = Fingerprint::of("note.txt");
        let stored = a
            .store_file("note.txt", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("store");
        wait_for_replica(&c, &fingerprint, stored.size_on_disk).await;

        assert!(c.delete_local("note.txt").await.expect("delete local"));
        assert!(!c.store().has(&fingerprint).await);

        let mut out = Vec::new();
        let got = c.get("note.txt", &mut out).await.expect("remote get");
        assert_eq!(out, PAYLOAD);
        assert!(matches!(got.served_from, ServedFrom::Peer(_)));
        assert!(
            c.store().has(&fingerprint).await,
            "remote get must cache a local copy"
        );
        let (cached, _) = c.store().read(&fingerprint).await.expect("cached");
        assert_eq!(cached, PAYLOAD.len() as u64 + IV_LEN as u64);
    }

    /// S3 / broadcast delete: every node loses its copy and empty
    /// content-path ancestors are pruned back to the storage roots.
    #[tokio::test]
    async fn delete_clears_the_whole_cluster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let b = spawn_node(dir.path(), "b", vec![addr_of(&a)], &key, timeout).await;
        let c = spawn_node(dir.path(), "c", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 2).await;

        let fingerprint = Fingerprint::of("note.txt");
        a.store_file("note.txt", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("store");
        wait_for_copy(&b, &fingerprint, true).await;
        wait_for_copy(&c, &fingerprint, true).await;

        let outcome = a.delete("note.txt").await.expect("delete");
        assert!(outcome.removed_local);
        assert_eq!(outcome.remote_acks, 2);

        for node in [&a, &b, &c] {
            assert!(!node.store().has(&fingerprint).await);
            let first_level = node.store().root().join(&fingerprint.to_hex()[..5]);
            assert!(!first_level.exists(), "empty ancestors must be pruned");
            assert!(node.store().root().exists());
        }

        // Idempotent: a second broadcast delete still succeeds.
        let again = a.delete("note.txt").await.expect("second delete");
        assert!(!again.removed_local);
        assert_eq!(again.remote_acks, 2);
    }

    /// Negative GET with live peers that don't hold the key.
    #[tokio::test]
    async fn get_for_unknown_key_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let b = spawn_node(dir.path(), "b", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 1).await;
        wait_for_peers(&b, 1).await;

        let mut out = Vec::new();
        let err = b
            .get("missing.txt", &mut out)
            .await
            .expect_err("nobody holds it");
        assert!(matches!(err, Error::NotFound(_)));
    }

    /// S4 / deadline path: with its peers gone, a GET fails with
    /// NotFound instead of hanging.
    #[tokio::test]
    async fn get_after_peers_stopped_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_millis(600);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let b = spawn_node(dir.path(), "b", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 1).await;

        b.shutdown().await;
        for _ in 0..150 {
            if a.peer_count() == 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.peer_count(), 0, "dead peer must leave the registry");

        let mut out = Vec::new();
        let err = a
            .get("missing.txt", &mut out)
            .await
            .expect_err("no peers left");
        assert!(matches!(err, Error::NotFound(_)));
    }

    /// S5 / targeted remote delete: only the selected peer loses its
    /// copy; the other replica and the local copy survive.
    #[tokio::test]
    async fn delete_remote_hits_only_selected_peers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        // A dials B and C so it can address them by their listen addrs.
        let b = spawn_node(dir.path(), "b", vec![], &key, timeout).await;
        let c = spawn_node(dir.path(), "c", vec![], &key, timeout).await;
        let a = spawn_node(dir.path(), "a", vec![addr_of(&b), addr_of(&c)], &key, timeout).await;
        wait_for_peers(&a, 2).await;

        let fingerprint = Fingerprint::of("note.txt");
        a.store_file("note.txt", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("store");
        wait_for_copy(&b, &fingerprint, true).await;
        wait_for_copy(&c, &fingerprint, true).await;

        let outcome = a
            .delete_remote("note.txt", &[addr_of(&b)])
            .await
            .expect("targeted delete");
        assert_eq!(outcome.remote_acks, 1);
        assert!(!outcome.removed_local);

        wait_for_copy(&b, &fingerprint, false).await;
        assert!(c.store().has(&fingerprint).await, "untargeted peer keeps its copy");
        assert!(a.store().has(&fingerprint).await, "local copy is untouched");
    }

    /// Duplicate probe: re-storing a key skips peers that already hold
    /// it instead of re-sending the payload.
    #[tokio::test]
    async fn duplicate_probe_skips_existing_holders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_secs(2);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        let b = spawn_node(dir.path(), "b", vec![addr_of(&a)], &key, timeout).await;
        wait_for_peers(&a, 1).await;

        let fingerprint = Fingerprint::of("dup.bin");
        a.store_file("dup.bin", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("first store");
        wait_for_copy(&b, &fingerprint, true).await;

        let second = a
            .store_file("dup.bin", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect("second store");
        assert_eq!(second.replicas, 1, "holder counts as a replica without resending");
        assert!(b.store().has(&fingerprint).await);
    }

    /// A peer that never acks costs the deadline: STORE with zero acks
    /// surfaces as Timeout.
    #[tokio::test]
    async fn store_with_mute_peer_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        let timeout = Duration::from_millis(500);

        let a = spawn_node(dir.path(), "a", vec![], &key, timeout).await;
        // A raw connection that admits but never speaks the protocol back.
        let mut mute = TcpStream::connect(a.local_addr().expect("addr"))
            .await
            .expect("connect");
        wait_for_peers(&a, 1).await;

        let err = a
            .store_file("unacked.bin", &mut PAYLOAD.to_vec().as_slice())
            .await
            .expect_err("no acks must time out");
        assert!(matches!(err, Error::Timeout(_)));

        // The local copy still exists; only replication failed.
        assert!(a.store().has(&Fingerprint::of("unacked.bin")).await);
        mute.shutdown().await.expect("close mute peer");
    }
}
