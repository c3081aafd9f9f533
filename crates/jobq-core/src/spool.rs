// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-cluster side files in the spool directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Current on-disk layout version, stored as `SpoolVersion` in the header.
pub const SPOOL_VERSION: i64 = 1;

/// The spool directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Wrap a spool directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Template file of a cluster.
    pub fn digest_path(&self, cluster: i32) -> PathBuf {
        self.dir.join(format!("cluster{}.digest", cluster))
    }

    /// Item data file of a cluster.
    pub fn items_path(&self, cluster: i32) -> PathBuf {
        self.dir.join(format!("cluster{}.items", cluster))
    }

    /// True if `path` lies inside the spool directory.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
            && !path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
    }

    /// Write `bytes` to `path` through a synced temp file and a rename.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote spool file");
        Ok(())
    }

    /// Store a cluster's template. Returns the file path.
    pub fn write_digest(&self, cluster: i32, template: &str) -> std::io::Result<PathBuf> {
        let path = self.digest_path(cluster);
        self.write_atomic(&path, template.as_bytes())?;
        Ok(path)
    }

    /// Store a cluster's item rows, one per line. Returns the file path.
    pub fn write_items(&self, cluster: i32, rows: &[String]) -> std::io::Result<PathBuf> {
        let path = self.items_path(cluster);
        let mut text = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum());
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        self.write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }

    /// Remove a side file. A missing file is not an error.
    pub fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed spool file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Both side files of a cluster.
    pub fn cluster_files(&self, cluster: i32) -> [PathBuf; 2] {
        [self.digest_path(cluster), self.items_path(cluster)]
    }
}
