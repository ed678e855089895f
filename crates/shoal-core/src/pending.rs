// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Originator-side table of in-flight broadcasts.
//!
//! One slot per fingerprint: opening a second request for the same key
//! fails until the first reaches a terminal state, which is what
//! serializes same-key operations from one origin. Slots move through
//! `Issued -> PartiallyAcked -> Completed | TimedOut`; terminal states
//! free the slot, so late replies find nothing and are only audited.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Mutex,
};

use tokio::sync::mpsc;

use crate::ids::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Issued,
    PartiallyAcked,
    Completed,
    TimedOut,
}

/// A single peer's answer to an in-flight broadcast.
#[derive(Debug, Clone)]
pub enum PeerReply {
    StoreAcked { from: SocketAddr, ok: bool },
    DeleteAcked { from: SocketAddr, ok: bool },
    NotFound { from: SocketAddr },
    /// A bulk stream from `from` was consumed into the local store.
    Delivered { from: SocketAddr, len: u64 },
    Duplicate { from: SocketAddr, held: bool },
}

impl PeerReply {
    pub fn from_addr(&self) -> SocketAddr {
        match self {
            PeerReply::StoreAcked { from, .. }
            | PeerReply::DeleteAcked { from, .. }
            | PeerReply::NotFound { from }
            | PeerReply::Delivered { from, .. }
            | PeerReply::Duplicate { from, .. } => *from,
        }
    }
}

struct Slot {
    tx: mpsc::UnboundedSender<PeerReply>,
    state: RequestState,
    expecting_stream: bool,
    stream_satisfied: bool,
    responded: HashSet<SocketAddr>,
    order: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<Fingerprint, Slot>,
    next_order: u64,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `fp`. Returns `None` while another request for the
    /// same fingerprint is still in flight.
    pub fn try_open(
        &self,
        fp: Fingerprint,
        expecting_stream: bool,
    ) -> Option<mpsc::UnboundedReceiver<PeerReply>> {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        if inner.slots.contains_key(&fp) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let order = inner.next_order;
        inner.next_order += 1;
        inner.slots.insert(
            fp,
            Slot {
                tx,
                state: RequestState::Issued,
                expecting_stream,
                stream_satisfied: false,
                responded: HashSet::new(),
                order,
            },
        );
        Some(rx)
    }

    /// Route one peer reply into its slot. Returns `false` when the slot
    /// is already gone (straggler) so the caller can audit it.
    pub fn deliver(&self, fp: &Fingerprint, reply: PeerReply) -> bool {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        let Some(slot) = inner.slots.get_mut(fp) else {
            return false;
        };
        slot.responded.insert(reply.from_addr());
        if matches!(reply, PeerReply::Delivered { .. }) {
            slot.stream_satisfied = true;
        }
        if slot.state == RequestState::Issued {
            slot.state = RequestState::PartiallyAcked;
        }
        slot.tx.send(reply).is_ok()
    }

    /// Resolve which in-flight request an unannotated bulk stream from
    /// `from` answers: the oldest slot that expects a stream, has not been
    /// satisfied, and has not already heard from this peer. The wire
    /// carries no fingerprint in stream frames, so arrival order per peer
    /// is the only correlation available.
    pub fn match_stream(&self, from: SocketAddr) -> Option<Fingerprint> {
        let inner = self.inner.lock().expect("pending lock poisoned");
        inner
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.expecting_stream
                    && !slot.stream_satisfied
                    && !slot.responded.contains(&from)
            })
            .min_by_key(|(_, slot)| slot.order)
            .map(|(fp, _)| *fp)
    }

    /// Terminal transition into `Completed`: the request finished and the
    /// slot is freed.
    pub fn complete(&self, fp: &Fingerprint) {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        inner.slots.remove(fp);
    }

    /// Terminal transition into `TimedOut`: the deadline fired and the
    /// slot is freed. Replies landing after this only reach the audit log.
    pub fn timed_out(&self, fp: &Fingerprint) {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        inner.slots.remove(fp);
    }

    pub fn state(&self, fp: &Fingerprint) -> Option<RequestState> {
        let inner = self.inner.lock().expect("pending lock poisoned");
        inner.slots.get(fp).map(|slot| slot.state)
    }
}
