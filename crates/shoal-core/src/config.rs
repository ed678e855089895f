// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One launch entry. A config file is a JSON array of these:
///
/// ```json
/// [
///   { "port": ":3000", "peers": [] },
///   { "port": ":3001", "peers": [":3000"], "key_path": "cluster.key" }
/// ]
/// ```
///
/// `peers` is the bootstrap dial list; the peer set is static per launch.
/// `key_path` names a shared cluster key file so nodes can decrypt each
/// other's replicas; absent, the node generates a process-local key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: String,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

/// Load a JSON array of server configs.
pub fn load_config(path: impl AsRef<Path>) -> Result<Vec<ServerConfig>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|err| Error::Config(format!("open {}: {err}", path.display())))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|err| Error::Config(format!("parse {}: {err}", path.display())))
}

/// Derive the per-node storage root from its listen address, replacing
/// path-hostile characters so several nodes can share a filesystem.
pub fn storage_root_for(listen_addr: &str) -> PathBuf {
    let sanitized: String = listen_addr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    PathBuf::from(format!("{sanitized}_store"))
}

/// Expand a bare `":3000"`-style address into a dialable `host:port`.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{addr}")
    } else {
        addr.to_string()
    }
}

/// Expand a bare `":3000"`-style address into a bindable listen address
/// (all interfaces, matching the original's listener semantics).
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
