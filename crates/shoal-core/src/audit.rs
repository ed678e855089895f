// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Append-only audit trail of externally observable server decisions.
//!
//! Distinct from `tracing` diagnostics: this is the durable, per-node
//! record format `RFC3339 | op | fingerprint | peer-addr | status`, one
//! line per decision. Handed to the file server as an injected handle.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::Result;

pub struct AuditLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    /// Open (append + create) the audit file and write the session banner.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        writeln!(
            file,
            "[{}] LOGGING STARTED....\n",
            chrono::Utc::now().to_rfc3339()
        )?;
        Ok(Arc::new(Self {
            file: Mutex::new(file),
            path,
        }))
    }

    /// Append one record. Failures are reported to diagnostics and
    /// swallowed: losing an audit line must not fail the operation it
    /// describes.
    pub fn record(&self, op: &str, fingerprint: &str, peer: &str, status: &str) {
        let line = format!(
            "{} | {} | {} | {} | {}",
            chrono::Utc::now().to_rfc3339(),
            op,
            fingerprint,
            peer,
            status
        );
        let mut file = self.file.lock().expect("audit lock poisoned");
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(error = %err, "failed to append audit record");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_pipe_separated_with_rfc3339_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let audit = AuditLog::open(&path).expect("open");

        audit.record("STORE_LOCAL", "abc123", "-", "OK");
        audit.record("GET_MISS", "abc123", "127.0.0.1:3001", "NOT_FOUND");

        let contents = std::fs::read_to_string(&path).expect("read");
        let records: Vec<&str> = contents
            .lines()
            .filter(|line| line.contains(" | "))
            .collect();
        assert_eq!(records.len(), 2);

        for record in records {
            let fields: Vec<&str> = record.split(" | ").collect();
            assert_eq!(fields.len(), 5);
            chrono::DateTime::parse_from_rfc3339(fields[0]).expect("valid timestamp");
        }
        assert!(contents.contains("LOGGING STARTED"));
    }

    #[test]
    fn reopen_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");

        AuditLog::open(&path).expect("first").record("A", "f", "-", "OK");
        AuditLog::open(&path).expect("second").record("B", "f", "-", "OK");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.contains("| A |"));
        assert!(contents.contains("| B |"));
    }
}
