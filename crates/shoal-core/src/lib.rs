// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
pub mod audit;
pub mod cbor;
pub mod config;
pub mod content;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod pending;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use audit::AuditLog;
pub use config::{
    ServerConfig, load_config, normalize_addr, normalize_listen_addr, storage_root_for,
};
pub use content::{PATH_SEGMENT_LEN, PATH_SEGMENTS, content_path};
pub use crypto::{EncryptionKey, IV_LEN, KEY_LEN, copy_decrypt, copy_encrypt};
pub use error::{Error, Result};
pub use ids::{Fingerprint, NodeId};
pub use pending::{PeerReply, PendingRequests, RequestState};
pub use registry::PeerRegistry;
pub use server::{
    DEFAULT_REQUEST_TIMEOUT, DeleteOutcome, FileServer, FileServerConfig, GetOutcome, ServedFrom,
    StoreOutcome,
};
pub use store::DiskStore;
pub use transport::{
    DefensiveHandshake, Handshake, Peer, RpcMessage, TcpTransport, TcpTransportConfig,
};
pub use wire::{Command, Frame, INCOMING_MESSAGE, INCOMING_STREAM, MAX_MESSAGE_BYTES};

#[cfg(test)]
mod conformance;
