// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Framed TCP peer transport.
//!
//! Each peer runs its own read loop feeding the transport's single
//! inbound channel. Control frames are decoded before delivery; a bulk
//! stream frame is delivered as its declared length only, after which the
//! read loop parks on the peer's gate until the application has consumed
//! the payload from the socket and called [`Peer::resume_read`]. That
//! gate is what guarantees no control message overtakes a bulk stream
//! from the same peer.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, MutexGuard, Semaphore, mpsc},
    task::JoinHandle,
};

use crate::{
    config::{normalize_addr, normalize_listen_addr},
    error::{Error, Result},
    wire::{self, Command, Frame},
};

/// Connection admission policy, run on every connection (both directions)
/// before the peer's read loop starts. Stricter policies may exchange
/// bytes; the default exchanges none.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn shake(&self, stream: &mut TcpStream, outbound: bool) -> Result<()>;
}

/// Default policy: no bytes exchanged, every peer admitted. Peers are
/// trusted by presence in the bootstrap list.
pub struct DefensiveHandshake;

#[async_trait]
impl Handshake for DefensiveHandshake {
    async fn shake(&self, _stream: &mut TcpStream, _outbound: bool) -> Result<()> {
        Ok(())
    }
}

/// One inbound wire interaction, tagged with the peer it came from.
#[derive(Debug)]
pub struct RpcMessage {
    pub from: SocketAddr,
    pub frame: Frame,
}

/// A connected peer. Owned by the transport; the file server only holds
/// shared handles through its registry.
pub struct Peer {
    remote_addr: SocketAddr,
    dial_addr: Option<String>,
    outbound: bool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    gate: Semaphore,
}

impl Peer {
    pub(crate) fn new(
        stream: TcpStream,
        outbound: bool,
        dial_addr: Option<String>,
    ) -> Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Arc::new(Self {
            remote_addr,
            dial_addr,
            outbound,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            gate: Semaphore::new(0),
        }))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The address this node dialed, for outbound peers. Inbound peers
    /// are only known by their (ephemeral) remote address.
    pub fn dial_addr(&self) -> Option<&str> {
        self.dial_addr.as_deref()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub async fn send_command(&self, command: &Command) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_command(&mut *writer, command)
            .await
            .map_err(|err| self.map_gone(err))
    }

    /// Send a bulk frame: the stream header, then exactly `len` bytes
    /// copied from `src`.
    pub async fn send_stream<R>(&self, len: u64, src: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        let sent = async {
            wire::write_stream_header(&mut *writer, len).await?;
            let copied = tokio::io::copy(src, &mut *writer).await?;
            if copied != len {
                return Err(Error::protocol(format!(
                    "bulk source produced {copied} bytes, header declared {len}"
                )));
            }
            writer.flush().await?;
            Ok(())
        }
        .await;
        sent.map_err(|err| self.map_gone(err))
    }

    /// Reclassify write failures on a dead socket so callers can tell a
    /// vanished peer from a local fault.
    fn map_gone(&self, err: Error) -> Error {
        match err {
            Error::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                Error::PeerGone(self.remote_addr)
            }
            other => other,
        }
    }

    /// Send a control message and its bulk payload back to back under one
    /// writer lock, so no concurrently sent frame can land between them.
    /// The receiver relies on this pairing to attribute the payload.
    pub async fn send_command_and_stream<R>(
        &self,
        command: &Command,
        len: u64,
        src: &mut R,
    ) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        let sent = async {
            wire::write_command(&mut *writer, command).await?;
            wire::write_stream_header(&mut *writer, len).await?;
            let copied = tokio::io::copy(src, &mut *writer).await?;
            if copied != len {
                return Err(Error::protocol(format!(
                    "bulk source produced {copied} bytes, header declared {len}"
                )));
            }
            writer.flush().await?;
            Ok(())
        }
        .await;
        sent.map_err(|err| self.map_gone(err))
    }

    /// Exclusive access to the raw socket for consuming a bulk payload.
    /// Only valid while the read loop is parked on the gate, i.e. after
    /// this peer delivered a `Frame::Stream`.
    pub(crate) async fn reader_guard(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Unpark the read loop after a bulk payload has been consumed. Must
    /// be called exactly once per delivered stream frame, even when
    /// consumption failed (a failed consumer closes the peer as well, and
    /// the resumed loop then observes the dead socket).
    pub fn resume_read(&self) {
        self.gate.add_permits(1);
    }

    /// Consume and drop `len` payload bytes, for streams that lost the
    /// race or answer nothing.
    pub async fn discard_stream(&self, len: u64) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; 32 * 1024];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::protocol("stream ended while discarding payload"));
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

pub type PeerHook = Arc<dyn Fn(&Arc<Peer>) -> Result<()> + Send + Sync>;
pub type DisconnectHook = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

pub struct TcpTransportConfig {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub inbound_capacity: usize,
}

impl TcpTransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(DefensiveHandshake),
            inbound_capacity: 1024,
        }
    }
}

pub struct TcpTransport {
    config: TcpTransportConfig,
    inbound_tx: mpsc::Sender<RpcMessage>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<RpcMessage>>>,
    on_peer: StdMutex<Option<PeerHook>>,
    on_disconnect: StdMutex<Option<DisconnectHook>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    peers: StdMutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        Arc::new(Self {
            config,
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            on_peer: StdMutex::new(None),
            on_disconnect: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            accept_task: StdMutex::new(None),
            peers: StdMutex::new(HashMap::new()),
        })
    }

    /// Install the peer-admission hook. Wired after construction, the way
    /// the server and transport reference each other.
    pub fn set_on_peer(&self, hook: PeerHook) {
        *self.on_peer.lock().expect("hook lock poisoned") = Some(hook);
    }

    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.on_disconnect.lock().expect("hook lock poisoned") = Some(hook);
    }

    /// Take the inbound message stream. There is exactly one consumer.
    pub fn consume(&self) -> Result<mpsc::Receiver<RpcMessage>> {
        self.inbound_rx
            .lock()
            .expect("inbound lock poisoned")
            .take()
            .ok_or_else(|| Error::Config("inbound message stream already consumed".into()))
    }

    /// The bound listen address, available after `listen_and_serve`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }

    /// Bind the listener and start accepting in the background. Returns
    /// once the socket is live.
    pub async fn listen_and_serve(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(normalize_listen_addr(&self.config.listen_addr)).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(local);

        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(err) = transport.admit(stream, false, None).await {
                                tracing::warn!(peer = %remote, error = %err, "inbound peer rejected");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().expect("accept lock poisoned") = Some(task);

        tracing::info!(addr = %local, "transport listening");
        Ok(())
    }

    /// Connect out to `addr` (bare `":3000"` targets loopback) and admit
    /// the connection like any other peer.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<Arc<Peer>> {
        let target = normalize_addr(addr);
        let stream = TcpStream::connect(&target).await?;
        self.admit(stream, true, Some(target)).await
    }

    /// Abort the accept loop and close every live peer.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept lock poisoned").take() {
            task.abort();
        }
        let peers: Vec<Arc<Peer>> = self
            .peers
            .lock()
            .expect("peers lock poisoned")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.close().await;
        }
    }

    async fn admit(
        self: &Arc<Self>,
        mut stream: TcpStream,
        outbound: bool,
        dial_addr: Option<String>,
    ) -> Result<Arc<Peer>> {
        self.config.handshake.shake(&mut stream, outbound).await?;
        let peer = Peer::new(stream, outbound, dial_addr)?;

        let hook = self.on_peer.lock().expect("hook lock poisoned").clone();
        if let Some(hook) = hook
            && let Err(err) = hook(&peer)
        {
            peer.close().await;
            return Err(err);
        }

        self.peers
            .lock()
            .expect("peers lock poisoned")
            .insert(peer.remote_addr(), Arc::clone(&peer));

        let transport = Arc::clone(self);
        let reader_peer = Arc::clone(&peer);
        tokio::spawn(async move { transport.run_read_loop(reader_peer).await });
        Ok(peer)
    }

    async fn run_read_loop(self: Arc<Self>, peer: Arc<Peer>) {
        let from = peer.remote_addr();
        loop {
            let frame = {
                let mut reader = peer.reader.lock().await;
                wire::read_frame(&mut *reader).await
            };
            match frame {
                Ok(Frame::Control(command)) => {
                    tracing::trace!(peer = %from, command = command.label(), "control message");
                    let message = RpcMessage {
                        from,
                        frame: Frame::Control(command),
                    };
                    if self.inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Stream { len }) => {
                    tracing::trace!(peer = %from, len, "bulk stream announced");
                    let message = RpcMessage {
                        from,
                        frame: Frame::Stream { len },
                    };
                    if self.inbound_tx.send(message).await.is_err() {
                        break;
                    }
                    // Park here; dispatch for this peer is suspended until
                    // the payload is consumed and resume_read runs.
                    match peer.gate.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!(peer = %from, "peer closed connection");
                    break;
                }
                Err(err) => {
                    tracing::warn!(peer = %from, error = %err, "dropping peer after read error");
                    break;
                }
            }
        }
        self.teardown(&peer).await;
    }

    async fn teardown(&self, peer: &Arc<Peer>) {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .remove(&peer.remote_addr());
        peer.close().await;
        let hook = self.on_disconnect.lock().expect("hook lock poisoned").clone();
        if let Some(hook) = hook {
            hook(peer);
        }
    }
}
