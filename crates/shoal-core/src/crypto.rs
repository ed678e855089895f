// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Streaming AES-256-CTR for payloads of arbitrary size.
//!
//! Ciphertext layout is `16-byte IV || CTR keystream XOR plaintext`, so
//! ciphertext length is always plaintext length + [`IV_LEN`]. No MAC is
//! applied; callers needing integrity must hash plaintext themselves.

use std::{fmt, path::Path};

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Block size for the streaming copy loops.
const COPY_BUF_LEN: usize = 32 * 1024;

/// Symmetric key shared by every node in a cluster.
///
/// Distributed out of band: each config entry may name a `key_path`; the
/// first node to touch it generates and persists the key, later nodes read
/// it back. Without a `key_path` a fresh key lives only for the process.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|err| Error::Crypto(format!("invalid key hex: {err}")))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Crypto(format!("key must be {KEY_LEN} bytes")))?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Read the key from `path`, or generate one and persist it there.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_hex(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, key.to_hex())?;
                Ok(key)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt `src` into `dst`: a fresh random IV first, then the payload in
/// [`COPY_BUF_LEN`] blocks. Returns total bytes written to `dst`
/// (`IV_LEN + plaintext length`).
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut written = IV_LEN as u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

/// Decrypt exactly `declared_len` ciphertext bytes (IV included) from
/// `src` into `dst`. Returns the plaintext bytes written
/// (`declared_len - IV_LEN`).
pub async fn copy_decrypt<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    declared_len: u64,
    dst: &mut W,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if declared_len < IV_LEN as u64 {
        return Err(Error::protocol(format!(
            "ciphertext of {declared_len} bytes cannot hold a {IV_LEN}-byte iv"
        )));
    }

    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::protocol("short read while expecting stream iv")
        } else {
            Error::Io(err)
        }
    })?;

    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut remaining = declared_len - IV_LEN as u64;
    let mut written = 0u64;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_LEN as u64) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::protocol(format!(
                "stream truncated with {remaining} payload bytes outstanding"
            )));
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        remaining -= n as u64;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}
