//! Directory snapshot for local consumers such as a name resolver.
//!
//! One JSON object per line:
//!
//! ```text
//! {"hostname":"alpha.mesh","ip":"fd00::1","origin":"3b6a…","signed_at":1700000000000}
//! ```
//!
//! The file is replaced atomically, so readers see either the previous or
//! the new snapshot, never a mix.  Signatures are not exported; consumers
//! trust the node that already verified them.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::ExportError;
use crate::types::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLine {
    pub hostname: String,
    pub ip: String,
    pub origin: String,
    pub signed_at: i64,
}

#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    path: PathBuf,
    namespace: String,
}

impl DirectoryExporter {
    pub fn new(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn render(&self, records: &[Record]) -> Vec<u8> {
        let mut out = Vec::new();
        for record in records {
            let line = ExportLine {
                hostname: format!("{}.{}", record.hostname, self.namespace),
                ip: record.address.clone(),
                origin: record.origin.clone(),
                signed_at: record.timestamp.timestamp_millis(),
            };
            // Writing into a Vec cannot fail.
            let _ = serde_json::to_writer(&mut out, &line);
            out.push(b'\n');
        }
        out
    }

    pub fn export(&self, records: &[Record]) -> Result<(), ExportError> {
        let io_err = |source: io::Error| ExportError {
            path: self.path.clone(),
            source,
        };
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&self.render(records)).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        debug!("Exported {} hostnames to {}", records.len(), self.path.display());
        Ok(())
    }
}

/// Parse an exported snapshot back into its lines.
pub fn parse(contents: &str) -> serde_json::Result<Vec<ExportLine>> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
