// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Content-addressed filesystem storage.
//!
//! Files live at `root/<content path>` and hold ciphertext exactly as it
//! travels the wire (IV prefix included), so a replica can be replayed to
//! peers without re-encrypting. Writes to distinct fingerprints are
//! independent; same-fingerprint serialization is the file server's job
//! via its pending-request table.

use std::path::{Path, PathBuf};

use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::{
    content::content_path,
    crypto::{self, EncryptionKey},
    error::{Error, Result},
    ids::{Fingerprint, NodeId},
};

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location for a fingerprint.
    pub fn path_for(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(content_path(fp))
    }

    /// Location inside a per-origin subtree, for deployments that keep
    /// replicas namespaced by the node that produced them.
    pub fn path_for_id(&self, node_id: &NodeId, fp: &Fingerprint) -> PathBuf {
        self.root.join(node_id.to_hex()).join(content_path(fp))
    }

    /// Stream `src` through the encryptor into the content path. Returns
    /// size on disk (plaintext + IV).
    pub async fn write_stream<R>(
        &self,
        fp: &Fingerprint,
        key: &EncryptionKey,
        src: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path_for(fp);
        let mut sink = create_sink(&path).await?;
        match crypto::copy_encrypt(key, src, &mut sink).await {
            Ok(written) => Ok(written),
            Err(err) => {
                discard_partial(&path).await;
                Err(err)
            }
        }
    }

    /// Copy exactly `declared_len` bytes from `src` to the content path,
    /// byte for byte. This is the receive path: the wire already carries
    /// ciphertext, and we store it as received.
    pub async fn write_stream_raw<R>(
        &self,
        fp: &Fingerprint,
        src: &mut R,
        declared_len: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path_for(fp);
        let mut sink = create_sink(&path).await?;
        match copy_exact(src, declared_len, &mut sink).await {
            Ok(written) => Ok(written),
            Err(err) => {
                discard_partial(&path).await;
                Err(err)
            }
        }
    }

    /// Decrypting variant of the receive path, for the store-plaintext-
    /// locally policy. Returns plaintext bytes written.
    pub async fn write_stream_decrypt<R>(
        &self,
        fp: &Fingerprint,
        key: &EncryptionKey,
        src: &mut R,
        declared_len: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path_for(fp);
        let mut sink = create_sink(&path).await?;
        match crypto::copy_decrypt(key, src, declared_len, &mut sink).await {
            Ok(written) => Ok(written),
            Err(err) => {
                discard_partial(&path).await;
                Err(err)
            }
        }
    }

    /// Open the stored object, returning its size on disk and a reader
    /// positioned at byte 0.
    pub async fn read(&self, fp: &Fingerprint) -> Result<(u64, fs::File)> {
        let path = self.path_for(fp);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(fp.to_hex()));
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        Ok((len, file))
    }

    pub async fn has(&self, fp: &Fingerprint) -> bool {
        fs::metadata(self.path_for(fp)).await.is_ok()
    }

    /// Remove the stored object if present (absence is not an error) and
    /// prune now-empty ancestor directories up to the storage root.
    pub async fn delete(&self, fp: &Fingerprint) -> Result<()> {
        self.delete_at(self.path_for(fp)).await
    }

    /// Namespaced variant of [`delete`](Self::delete) for per-origin
    /// subtrees.
    pub async fn delete_by_id(&self, node_id: &NodeId, fp: &Fingerprint) -> Result<()> {
        self.delete_at(self.path_for_id(node_id, fp)).await
    }

    async fn delete_at(&self, path: PathBuf) -> Result<()> {
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.prune_empty_ancestors(&path).await;
        Ok(())
    }

    /// Best effort: walk from the leaf's parent toward the root, removing
    /// directories that became empty. Stops at the first non-empty level.
    async fn prune_empty_ancestors(&self, leaf: &Path) {
        let mut dir = leaf.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            match fs::read_dir(current).await {
                Ok(mut entries) => match entries.next_entry().await {
                    Ok(None) => {
                        if fs::remove_dir(current).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                },
                Err(_) => break,
            }
            dir = current.parent();
        }
    }
}

async fn create_sink(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(fs::File::create(path).await?)
}

async fn discard_partial(path: &Path) {
    let _ = fs::remove_file(path).await;
}

/// Copy exactly `len` bytes; a short source is a protocol violation.
async fn copy_exact<R, W>(src: &mut R, len: u64, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; 32 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::protocol(format!(
                "stream ended with {remaining} bytes outstanding"
            )));
        }
        dst.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    dst.flush().await?;
    Ok(len)
}
