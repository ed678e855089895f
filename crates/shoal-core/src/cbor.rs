// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// Thin wrappers around `ciborium` used for all control-message payloads.
// CBOR's self-describing encoding is what lets the tagged `Command` union
// travel the wire without out-of-band schema negotiation.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialize `value` into a CBOR byte vector.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Deserialize `T` from a CBOR byte slice. The decoded value must account
/// for every byte of `bytes`; trailing bytes are a protocol violation.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut remaining = bytes;
    let value = ciborium::from_reader(&mut remaining)?;
    if !remaining.is_empty() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after cbor value",
            remaining.len()
        )));
    }
    Ok(value)
}
