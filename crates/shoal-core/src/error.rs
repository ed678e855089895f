// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Per-peer failures (`Protocol`, `PeerGone`) are fatal only to the peer
/// they occurred on; callers of multi-peer operations see `NotFound` or
/// `Timeout` once no viable peer remains.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Frame or message decode failure, or a peer violating the wire
    /// contract (short stream, length mismatch, unknown mode byte).
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer gone: {0}")]
    PeerGone(SocketAddr),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("crypto: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Protocol(format!("cbor encode: {err}"))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Protocol(format!("cbor decode: {err}"))
    }
}
