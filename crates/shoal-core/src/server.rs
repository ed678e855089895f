// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The file-server state machine.
//!
//! One dispatch task drains the transport's inbound channel and routes
//! control messages and bulk streams; user-facing operations (STORE, GET,
//! DELETE) run on their callers' tasks and rendezvous with the dispatcher
//! through the pending-request table. Replication is best effort: a STORE
//! succeeds on the first positive ack, per-peer failures cost only that
//! peer.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};

use crate::{
    audit::AuditLog,
    config::storage_root_for,
    crypto::{self, EncryptionKey},
    error::{Error, Result},
    ids::{Fingerprint, NodeId},
    pending::{PeerReply, PendingRequests},
    registry::PeerRegistry,
    store::DiskStore,
    transport::{Peer, RpcMessage, TcpTransport},
    wire::{Command, Frame},
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct FileServerConfig {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    pub storage_root: PathBuf,
    pub audit_path: PathBuf,
    pub enc_key: EncryptionKey,
    pub request_timeout: Duration,
}

impl FileServerConfig {
    /// Derive per-node paths from the listen address.
    pub fn for_addr(
        listen_addr: impl Into<String>,
        bootstrap_peers: Vec<String>,
        enc_key: EncryptionKey,
    ) -> Self {
        let listen_addr = listen_addr.into();
        let storage_root = storage_root_for(&listen_addr);
        let audit_path = storage_root.join("audit.log");
        Self {
            listen_addr,
            bootstrap_peers,
            storage_root,
            audit_path,
            enc_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Local,
    Peer(SocketAddr),
}

#[derive(Debug)]
pub struct StoreOutcome {
    pub fingerprint: Fingerprint,
    pub size_on_disk: u64,
    /// Peers confirmed to hold the object: fresh acks plus peers that
    /// already held it per the duplicate probe.
    pub replicas: usize,
}

#[derive(Debug)]
pub struct GetOutcome {
    pub fingerprint: Fingerprint,
    /// Plaintext bytes written to the caller.
    pub len: u64,
    /// Location of the local (ciphertext) copy.
    pub path: PathBuf,
    pub served_from: ServedFrom,
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub removed_local: bool,
    pub remote_acks: usize,
}

/// A `StoreFile` announcement staged until its bulk payload arrives on
/// the same connection.
#[derive(Debug, Clone)]
struct InboundStore {
    origin: NodeId,
    fingerprint: Fingerprint,
    size: u64,
}

pub struct FileServer {
    id: NodeId,
    config: FileServerConfig,
    store: DiskStore,
    transport: Arc<TcpTransport>,
    registry: PeerRegistry,
    pending: PendingRequests,
    audit: Arc<AuditLog>,
    inbound_store: StdMutex<HashMap<SocketAddr, InboundStore>>,
}

impl FileServer {
    pub fn new(config: FileServerConfig, transport: Arc<TcpTransport>) -> Result<Arc<Self>> {
        let audit = AuditLog::open(&config.audit_path)?;
        let store = DiskStore::new(&config.storage_root);
        Ok(Arc::new(Self {
            id: NodeId::generate(),
            store,
            transport,
            registry: PeerRegistry::new(),
            pending: PendingRequests::new(),
            audit,
            inbound_store: StdMutex::new(HashMap::new()),
            config,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Bring up the listener, wire the transport hooks, start the
    /// dispatch task, and kick off background dials to every bootstrap
    /// peer. Returns once the listener is live.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.transport.set_on_peer(Arc::new(move |peer| match weak.upgrade() {
            Some(server) => server.on_peer(peer),
            None => Ok(()),
        }));
        let weak = Arc::downgrade(self);
        self.transport.set_on_disconnect(Arc::new(move |peer| {
            if let Some(server) = weak.upgrade() {
                server.on_peer_disconnect(peer);
            }
        }));

        self.transport.listen_and_serve().await?;
        let inbound = self.transport.consume()?;
        let server = Arc::clone(self);
        tokio::spawn(async move { server.dispatch(inbound).await });

        for addr in self.config.bootstrap_peers.clone() {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(err) = transport.dial(&addr).await {
                    tracing::warn!(peer = %addr, error = %err, "bootstrap dial failed");
                }
            });
        }

        tracing::info!(
            node = %self.id,
            addr = ?self.transport.local_addr(),
            "file server started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.transport.close().await;
    }

    // ---- originator operations -------------------------------------------

    /// STORE: encrypt `src` into the local store, then replicate the
    /// ciphertext to every connected peer that does not already hold it.
    /// Succeeds once any peer acks; zero acks with live peers is a
    /// `Timeout`.
    pub async fn store_file<R>(self: &Arc<Self>, key: &str, src: &mut R) -> Result<StoreOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let fingerprint = Fingerprint::of(key);

        // Dedup probe runs before the store claims the fingerprint slot.
        let holders = self.duplicate_check(&fingerprint).await.unwrap_or_default();

        let mut replies = self.open_slot(fingerprint, false).await?;

        let size_on_disk = match self
            .store
            .write_stream(&fingerprint, &self.config.enc_key, src)
            .await
        {
            Ok(size) => {
                self.audit.record("STORE_LOCAL", &fingerprint.to_hex(), "-", "OK");
                size
            }
            Err(err) => {
                self.audit.record("STORE_LOCAL", &fingerprint.to_hex(), "-", "ERR");
                self.pending.complete(&fingerprint);
                return Err(err);
            }
        };

        let peers: Vec<Arc<Peer>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|peer| !holders.contains(&peer.remote_addr()))
            .collect();

        if peers.is_empty() {
            self.pending.complete(&fingerprint);
            self.audit
                .record("STORE_BROADCAST", &fingerprint.to_hex(), "-", "NO_PEERS");
            return Ok(StoreOutcome {
                fingerprint,
                size_on_disk,
                replicas: holders.len(),
            });
        }

        // Fan out per peer: announce, then replay the local ciphertext as
        // the bulk payload. The pair goes out atomically per connection.
        for peer in &peers {
            let server = Arc::clone(self);
            let peer = Arc::clone(peer);
            let command = Command::StoreFile {
                origin: self.id,
                fingerprint,
                size: size_on_disk,
            };
            tokio::spawn(async move {
                let sent = async {
                    let (len, mut file) = server.store.read(&fingerprint).await?;
                    peer.send_command_and_stream(&command, len, &mut file).await
                }
                .await;
                if let Err(err) = sent {
                    tracing::warn!(
                        peer = %peer.remote_addr(),
                        error = %err,
                        "store fan-out failed"
                    );
                    server.audit.record(
                        "STORE_SEND",
                        &fingerprint.to_hex(),
                        &peer.remote_addr().to_string(),
                        "ERR",
                    );
                    server.drop_peer(&peer).await;
                }
            });
        }

        // Best-effort replication: done as soon as one ack lands.
        let started = Instant::now();
        let mut acked = 0usize;
        loop {
            let Some(remaining) = self.config.request_timeout.checked_sub(started.elapsed())
            else {
                self.pending.timed_out(&fingerprint);
                self.audit
                    .record("STORE_BROADCAST", &fingerprint.to_hex(), "-", "TIMEOUT");
                return Err(Error::Timeout(self.config.request_timeout));
            };
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(PeerReply::StoreAcked { from, ok })) => {
                    self.audit.record(
                        "STORE_ACK",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        if ok { "OK" } else { "ERR" },
                    );
                    if ok {
                        acked += 1;
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    self.pending.timed_out(&fingerprint);
                    self.audit
                        .record("STORE_BROADCAST", &fingerprint.to_hex(), "-", "TIMEOUT");
                    return Err(Error::Timeout(self.config.request_timeout));
                }
            }
        }
        if acked == 0 {
            self.pending.timed_out(&fingerprint);
            return Err(Error::Timeout(self.config.request_timeout));
        }

        self.audit
            .record("STORE_BROADCAST", &fingerprint.to_hex(), "-", "OK");

        // Drain stragglers for the audit trail, then free the slot. The
        // slot lives until every peer answered or the deadline fires.
        let server = Arc::clone(self);
        let expected = peers.len();
        let drain_budget = self
            .config
            .request_timeout
            .saturating_sub(started.elapsed());
        tokio::spawn(async move {
            let mut answered = acked;
            let _ = tokio::time::timeout(drain_budget, async {
                while answered < expected {
                    match replies.recv().await {
                        Some(PeerReply::StoreAcked { from, ok }) => {
                            answered += 1;
                            server.audit.record(
                                "STORE_ACK",
                                &fingerprint.to_hex(),
                                &from.to_string(),
                                if ok { "OK" } else { "ERR" },
                            );
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            })
            .await;
            server.pending.complete(&fingerprint);
        });

        Ok(StoreOutcome {
            fingerprint,
            size_on_disk,
            replicas: acked + holders.len(),
        })
    }

    /// GET: serve from the local store when possible, otherwise query
    /// peers and write the first delivered copy through to disk before
    /// decrypting it out to `dst`.
    pub async fn get<W>(self: &Arc<Self>, key: &str, dst: &mut W) -> Result<GetOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let fingerprint = Fingerprint::of(key);

        if self.store.has(&fingerprint).await {
            let outcome = self.read_local(&fingerprint, ServedFrom::Local, dst).await?;
            self.audit.record("GET_LOCAL", &fingerprint.to_hex(), "-", "HIT");
            return Ok(outcome);
        }

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            self.audit
                .record("GET_MISS", &fingerprint.to_hex(), "-", "NO_PEERS");
            return Err(Error::NotFound(key.to_string()));
        }

        let mut replies = self.open_slot(fingerprint, true).await?;
        let command = Command::GetFile {
            origin: self.id,
            fingerprint,
        };
        let queried = self.broadcast(&peers, &command).await;
        if queried == 0 {
            self.pending.complete(&fingerprint);
            return Err(Error::NotFound(key.to_string()));
        }

        let started = Instant::now();
        let mut refused = 0usize;
        loop {
            let Some(remaining) = self.config.request_timeout.checked_sub(started.elapsed())
            else {
                self.pending.timed_out(&fingerprint);
                self.audit
                    .record("GET_MISS", &fingerprint.to_hex(), "-", "TIMEOUT");
                return Err(Error::NotFound(key.to_string()));
            };
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(PeerReply::Delivered { from, .. })) => {
                    // First stream wins; the dispatcher discards any that
                    // arrive for this fingerprint from here on.
                    self.pending.complete(&fingerprint);
                    let outcome = self
                        .read_local(&fingerprint, ServedFrom::Peer(from), dst)
                        .await?;
                    self.audit.record(
                        "GET_REMOTE",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        "OK",
                    );
                    return Ok(outcome);
                }
                Ok(Some(PeerReply::NotFound { from })) => {
                    refused += 1;
                    self.audit.record(
                        "GET_MISS",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        "NOT_FOUND",
                    );
                    if refused >= queried {
                        self.pending.complete(&fingerprint);
                        return Err(Error::NotFound(key.to_string()));
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.pending.complete(&fingerprint);
                    return Err(Error::NotFound(key.to_string()));
                }
                Err(_) => {
                    self.pending.timed_out(&fingerprint);
                    self.audit
                        .record("GET_MISS", &fingerprint.to_hex(), "-", "TIMEOUT");
                    return Err(Error::NotFound(key.to_string()));
                }
            }
        }
    }

    /// DELETE: remove locally and broadcast the delete to every peer.
    pub async fn delete(self: &Arc<Self>, key: &str) -> Result<DeleteOutcome> {
        let fingerprint = Fingerprint::of(key);
        let removed_local = self.store.has(&fingerprint).await;
        self.store.delete(&fingerprint).await?;
        self.audit.record(
            "DELETE_LOCAL",
            &fingerprint.to_hex(),
            "-",
            if removed_local { "OK" } else { "ABSENT" },
        );

        let peers = self.registry.snapshot();
        let remote_acks = self.delete_on(&peers, &fingerprint).await?;
        Ok(DeleteOutcome {
            removed_local,
            remote_acks,
        })
    }

    /// DELETE-LOCAL: remove only this node's copy. Returns whether a copy
    /// existed.
    pub async fn delete_local(&self, key: &str) -> Result<bool> {
        let fingerprint = Fingerprint::of(key);
        let removed = self.store.has(&fingerprint).await;
        self.store.delete(&fingerprint).await?;
        self.audit.record(
            "DELETE_LOCAL",
            &fingerprint.to_hex(),
            "-",
            if removed { "OK" } else { "ABSENT" },
        );
        Ok(removed)
    }

    /// DELETE-REMOTE: delete on the selected peers only; the local copy is
    /// untouched. Zero acks within the deadline is a `Timeout`.
    pub async fn delete_remote(
        self: &Arc<Self>,
        key: &str,
        targets: &[String],
    ) -> Result<DeleteOutcome> {
        let fingerprint = Fingerprint::of(key);
        let peers = self.registry.select(targets);
        if peers.is_empty() {
            return Err(Error::NotFound(format!(
                "no connected peer matches {targets:?}"
            )));
        }
        let remote_acks = self.delete_on(&peers, &fingerprint).await?;
        if remote_acks == 0 {
            return Err(Error::Timeout(self.config.request_timeout));
        }
        Ok(DeleteOutcome {
            removed_local: false,
            remote_acks,
        })
    }

    /// Pre-STORE probe: ask every peer whether it already holds the
    /// fingerprint so replication can skip it. Best effort; peers that
    /// miss the (shortened) probe deadline just don't get skipped.
    pub async fn duplicate_check(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
    ) -> Result<HashSet<SocketAddr>> {
        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return Ok(HashSet::new());
        }
        let Some(mut replies) = self.pending.try_open(*fingerprint, false) else {
            // Same-key operation already in flight; skip the probe.
            return Ok(HashSet::new());
        };

        let command = Command::DuplicateCheck {
            origin: self.id,
            fingerprint: *fingerprint,
        };
        let queried = self.broadcast(&peers, &command).await;
        if queried == 0 {
            self.pending.complete(fingerprint);
            return Ok(HashSet::new());
        }

        let probe_budget = self.config.request_timeout / 2;
        let started = Instant::now();
        let mut held = HashSet::new();
        let mut answered = 0usize;
        while answered < queried {
            let Some(remaining) = probe_budget.checked_sub(started.elapsed()) else {
                break;
            };
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(PeerReply::Duplicate { from, held: holds })) => {
                    answered += 1;
                    if holds {
                        held.insert(from);
                    }
                    self.audit.record(
                        "DUP_CHECK",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        if holds { "HELD" } else { "ABSENT" },
                    );
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if answered >= queried {
            self.pending.complete(fingerprint);
        } else {
            self.pending.timed_out(fingerprint);
        }
        Ok(held)
    }

    // ---- shared originator plumbing --------------------------------------

    /// Claim the per-fingerprint slot, waiting out any same-key operation
    /// still in flight (bounded by the request deadline).
    async fn open_slot(
        &self,
        fingerprint: Fingerprint,
        expecting_stream: bool,
    ) -> Result<mpsc::UnboundedReceiver<PeerReply>> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            if let Some(rx) = self.pending.try_open(fingerprint, expecting_stream) {
                return Ok(rx);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.request_timeout));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send one control message to each peer; failed peers are dropped.
    /// Returns how many sends went out.
    async fn broadcast(self: &Arc<Self>, peers: &[Arc<Peer>], command: &Command) -> usize {
        let mut delivered = 0usize;
        for peer in peers {
            match peer.send_command(command).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        peer = %peer.remote_addr(),
                        command = command.label(),
                        error = %err,
                        "broadcast send failed"
                    );
                    self.drop_peer(peer).await;
                }
            }
        }
        delivered
    }

    /// Broadcast `DeleteFile` to `peers` and count positive acks until all
    /// answered or the deadline fires (the deadline is not an error here;
    /// callers decide what zero acks means).
    async fn delete_on(
        self: &Arc<Self>,
        peers: &[Arc<Peer>],
        fingerprint: &Fingerprint,
    ) -> Result<usize> {
        if peers.is_empty() {
            return Ok(0);
        }
        let mut replies = self.open_slot(*fingerprint, false).await?;
        let command = Command::DeleteFile {
            origin: self.id,
            fingerprint: *fingerprint,
        };
        let queried = self.broadcast(peers, &command).await;
        if queried == 0 {
            self.pending.complete(fingerprint);
            return Ok(0);
        }

        let started = Instant::now();
        let mut acks = 0usize;
        let mut answered = 0usize;
        while answered < queried {
            let Some(remaining) = self.config.request_timeout.checked_sub(started.elapsed())
            else {
                break;
            };
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(PeerReply::DeleteAcked { from, ok })) => {
                    answered += 1;
                    if ok {
                        acks += 1;
                    }
                    self.audit.record(
                        "DELETE_REMOTE",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        if ok { "OK" } else { "ERR" },
                    );
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if answered >= queried {
            self.pending.complete(fingerprint);
        } else {
            self.pending.timed_out(fingerprint);
        }
        Ok(acks)
    }

    /// Open the local ciphertext and decrypt it out to the caller.
    async fn read_local<W>(
        &self,
        fingerprint: &Fingerprint,
        served_from: ServedFrom,
        dst: &mut W,
    ) -> Result<GetOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (size_on_disk, mut file) = self.store.read(fingerprint).await?;
        let len = crypto::copy_decrypt(&self.config.enc_key, &mut file, size_on_disk, dst).await?;
        Ok(GetOutcome {
            fingerprint: *fingerprint,
            len,
            path: self.store.path_for(fingerprint),
            served_from,
        })
    }

    // ---- dispatch ---------------------------------------------------------

    async fn dispatch(self: Arc<Self>, mut inbound: mpsc::Receiver<RpcMessage>) {
        while let Some(message) = inbound.recv().await {
            match message.frame {
                Frame::Control(command) => self.handle_command(message.from, command).await,
                Frame::Stream { len } => self.handle_stream(message.from, len).await,
            }
        }
        tracing::debug!(node = %self.id, "dispatch loop ended");
    }

    async fn handle_command(self: &Arc<Self>, from: SocketAddr, command: Command) {
        match command {
            Command::StoreFile {
                origin,
                fingerprint,
                size,
            } => {
                let staged = self.inbound_store.lock().expect("staging lock poisoned").insert(
                    from,
                    InboundStore {
                        origin,
                        fingerprint,
                        size,
                    },
                );
                if staged.is_some() {
                    tracing::warn!(peer = %from, "previous store announcement never produced a stream");
                }
            }
            Command::GetFile { fingerprint, .. } => self.serve_get(from, fingerprint).await,
            Command::DeleteFile { fingerprint, .. } => self.serve_delete(from, fingerprint).await,
            Command::DuplicateCheck { fingerprint, .. } => {
                self.serve_duplicate_check(from, fingerprint).await
            }
            Command::GetFileNotFound { fingerprint, .. } => {
                self.route_reply(from, &fingerprint, PeerReply::NotFound { from }, "GetFileNotFound")
            }
            Command::StoreAck {
                fingerprint, ok, ..
            } => self.route_reply(from, &fingerprint, PeerReply::StoreAcked { from, ok }, "StoreAck"),
            Command::DeleteAck {
                fingerprint, ok, ..
            } => self.route_reply(
                from,
                &fingerprint,
                PeerReply::DeleteAcked { from, ok },
                "DeleteAck",
            ),
            Command::DuplicateResponse {
                fingerprint, held, ..
            } => self.route_reply(
                from,
                &fingerprint,
                PeerReply::Duplicate { from, held },
                "DuplicateResponse",
            ),
        }
    }

    fn route_reply(&self, from: SocketAddr, fingerprint: &Fingerprint, reply: PeerReply, label: &str) {
        if !self.pending.deliver(fingerprint, reply) {
            // Slot already terminal: keep the straggler for the audit trail.
            self.audit
                .record("LATE_REPLY", &fingerprint.to_hex(), &from.to_string(), label);
        }
    }

    /// A bulk stream arrived from `from`. Attribute it (staged replica
    /// first, then an in-flight GET), consume it directly off the socket,
    /// and resume that peer's dispatch exactly once.
    async fn handle_stream(self: &Arc<Self>, from: SocketAddr, len: u64) {
        let Some(peer) = self.registry.get(&from) else {
            tracing::warn!(peer = %from, "stream from unregistered peer");
            return;
        };

        let staged = self.inbound_store.lock().expect("staging lock poisoned").remove(&from);
        let consumed: Result<()> = match staged {
            Some(inbound) if inbound.size == len => self.receive_replica(&peer, inbound).await,
            Some(inbound) => Err(Error::protocol(format!(
                "announced {} bytes for {} but stream declares {len}",
                inbound.size, inbound.fingerprint
            ))),
            None => match self.pending.match_stream(from) {
                Some(fingerprint) => self.receive_delivery(&peer, fingerprint, len).await,
                None => {
                    // Nothing wants it (late GET answer, or noise): drain it
                    // so the gate can be released in good conscience.
                    self.audit.record(
                        "STREAM_DISCARD",
                        "-",
                        &from.to_string(),
                        &format!("{len} bytes"),
                    );
                    peer.discard_stream(len).await
                }
            },
        };

        // The gate is released exactly once per stream frame. On failure
        // the socket may hold unconsumed payload, so the peer is dropped
        // and its resumed read loop dies on the broken framing.
        peer.resume_read();
        if let Err(err) = consumed {
            tracing::warn!(peer = %from, error = %err, "bulk stream consumption failed");
            self.drop_peer(&peer).await;
        }
    }

    /// STORE responder path: exact-copy the announced ciphertext into the
    /// content path and ack.
    async fn receive_replica(&self, peer: &Arc<Peer>, inbound: InboundStore) -> Result<()> {
        let written = {
            let mut socket = peer.reader_guard().await;
            self.store
                .write_stream_raw(&inbound.fingerprint, &mut *socket, inbound.size)
                .await
        };
        let ok = written.is_ok();
        self.audit.record(
            "STORE_REPLICA",
            &inbound.fingerprint.to_hex(),
            &peer.remote_addr().to_string(),
            if ok { "OK" } else { "ERR" },
        );
        tracing::debug!(
            peer = %peer.remote_addr(),
            origin = %inbound.origin,
            fingerprint = %inbound.fingerprint,
            ok,
            "replica received"
        );
        let ack = Command::StoreAck {
            origin: self.id,
            fingerprint: inbound.fingerprint,
            ok,
        };
        peer.send_command(&ack).await?;
        written.map(|_| ())
    }

    /// GET originator receive path: write the winning stream through to
    /// the content path and wake the waiting caller.
    async fn receive_delivery(
        &self,
        peer: &Arc<Peer>,
        fingerprint: Fingerprint,
        len: u64,
    ) -> Result<()> {
        let written = {
            let mut socket = peer.reader_guard().await;
            self.store
                .write_stream_raw(&fingerprint, &mut *socket, len)
                .await
        };
        match written {
            Ok(_) => {
                self.audit.record(
                    "GET_RECV",
                    &fingerprint.to_hex(),
                    &peer.remote_addr().to_string(),
                    "OK",
                );
                self.pending.deliver(
                    &fingerprint,
                    PeerReply::Delivered {
                        from: peer.remote_addr(),
                        len,
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.audit.record(
                    "GET_RECV",
                    &fingerprint.to_hex(),
                    &peer.remote_addr().to_string(),
                    "ERR",
                );
                Err(err)
            }
        }
    }

    /// GET responder path: stream the stored ciphertext back, or say we
    /// don't have it. The bulk send runs on its own task so a large serve
    /// cannot stall dispatch.
    async fn serve_get(self: &Arc<Self>, from: SocketAddr, fingerprint: Fingerprint) {
        let Some(peer) = self.registry.get(&from) else {
            return;
        };
        if !self.store.has(&fingerprint).await {
            self.audit.record(
                "GET_SERVE",
                &fingerprint.to_hex(),
                &from.to_string(),
                "NOT_FOUND",
            );
            let reply = Command::GetFileNotFound {
                origin: self.id,
                fingerprint,
            };
            if peer.send_command(&reply).await.is_err() {
                self.drop_peer(&peer).await;
            }
            return;
        }

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let served = async {
                let (len, mut file) = server.store.read(&fingerprint).await?;
                peer.send_stream(len, &mut file).await
            }
            .await;
            match served {
                Ok(()) => {
                    server.audit.record(
                        "GET_SERVE",
                        &fingerprint.to_hex(),
                        &from.to_string(),
                        "OK",
                    );
                }
                Err(Error::NotFound(_)) => {
                    // Deleted between the existence check and the open.
                    let reply = Command::GetFileNotFound {
                        origin: server.id,
                        fingerprint,
                    };
                    let _ = peer.send_command(&reply).await;
                }
                Err(err) => {
                    tracing::warn!(peer = %from, error = %err, "serving get failed");
                    server.drop_peer(&peer).await;
                }
            }
        });
    }

    /// DELETE responder path: best-effort local removal, always acked.
    /// Deleting an absent object is a successful no-op.
    async fn serve_delete(self: &Arc<Self>, from: SocketAddr, fingerprint: Fingerprint) {
        let Some(peer) = self.registry.get(&from) else {
            return;
        };
        let ok = self.store.delete(&fingerprint).await.is_ok();
        self.audit.record(
            "DELETE_REPLICA",
            &fingerprint.to_hex(),
            &from.to_string(),
            if ok { "OK" } else { "ERR" },
        );
        let ack = Command::DeleteAck {
            origin: self.id,
            fingerprint,
            ok,
        };
        if peer.send_command(&ack).await.is_err() {
            self.drop_peer(&peer).await;
        }
    }

    async fn serve_duplicate_check(self: &Arc<Self>, from: SocketAddr, fingerprint: Fingerprint) {
        let Some(peer) = self.registry.get(&from) else {
            return;
        };
        let held = self.store.has(&fingerprint).await;
        let reply = Command::DuplicateResponse {
            origin: self.id,
            fingerprint,
            held,
        };
        if peer.send_command(&reply).await.is_err() {
            self.drop_peer(&peer).await;
        }
    }

    // ---- peer lifecycle ---------------------------------------------------

    fn on_peer(&self, peer: &Arc<Peer>) -> Result<()> {
        if let Some(displaced) = self.registry.insert(Arc::clone(peer)) {
            tokio::spawn(async move { displaced.close().await });
        }
        self.audit.record(
            "PEER_CONNECT",
            "-",
            &peer.remote_addr().to_string(),
            if peer.is_outbound() { "OUTBOUND" } else { "INBOUND" },
        );
        tracing::info!(
            peer = %peer.remote_addr(),
            outbound = peer.is_outbound(),
            "peer connected"
        );
        Ok(())
    }

    fn on_peer_disconnect(&self, peer: &Arc<Peer>) {
        let addr = peer.remote_addr();
        self.registry.remove(&addr);
        self.inbound_store.lock().expect("staging lock poisoned").remove(&addr);
        self.audit.record("PEER_DISCONNECT", "-", &addr.to_string(), "OK");
        tracing::info!(peer = %addr, "peer disconnected");
    }

    async fn drop_peer(&self, peer: &Arc<Peer>) {
        self.registry.remove(&peer.remote_addr());
        peer.close().await;
    }
}
