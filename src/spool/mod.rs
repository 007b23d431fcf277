use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::sender::{BatchRecord, EventUpload};

/// Errors surfaced by the durable retry spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("creating spool directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("writing spool unit {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("reading spool unit {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("listing spool directory {path}: {source}")]
    List {
        path: String,
        source: std::io::Error,
    },

    #[error("deleting spool unit {path}: {source}")]
    Delete {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing spool unit {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("spool unit {path} holds no event entry")]
    EmptyEventUnit { path: String },
}

/// Durable retry backlog on disk.
///
/// Failed value batches land under `values/`, failed events under
/// `events/`, one unit per file. Unit names embed a nanosecond stamp and
/// a sequence number, zero-padded so lexicographic directory order is
/// chronological. Units are only ever deleted by the caller, strictly
/// after a confirmed send.
pub struct Spool {
    dir: PathBuf,
    values_dir: PathBuf,
    events_dir: PathBuf,
    seq: u64,
}

impl Spool {
    /// Opens the spool, creating its directories when absent.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let dir = dir.into();
        let values_dir = dir.join("values");
        let events_dir = dir.join("events");

        for d in [&values_dir, &events_dir] {
            tokio::fs::create_dir_all(d)
                .await
                .map_err(|source| SpoolError::CreateDir {
                    path: d.display().to_string(),
                    source,
                })?;
        }

        Ok(Self {
            dir,
            values_dir,
            events_dir,
            seq: 0,
        })
    }

    /// Returns the spool base directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one value batch as a new spool unit.
    pub async fn push_batch(&mut self, records: &[BatchRecord]) -> Result<PathBuf, SpoolError> {
        let name = self.unit_name();
        let path = self.values_dir.join(name);
        let data = serde_json::to_vec(records).map_err(|source| SpoolError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        write_unit(&path, &data).await?;
        debug!(path = %path.display(), records = records.len(), "batch spilled");

        Ok(path)
    }

    /// Writes one event as a new spool unit, tagged by its tick id.
    pub async fn push_event(
        &mut self,
        tick_id: u64,
        event: &EventUpload,
    ) -> Result<PathBuf, SpoolError> {
        let name = self.unit_name();
        let path = self.events_dir.join(name);
        let unit: BTreeMap<String, &EventUpload> = [(tick_id.to_string(), event)].into();
        let data = serde_json::to_vec(&unit).map_err(|source| SpoolError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        write_unit(&path, &data).await?;
        debug!(path = %path.display(), tick_id, "event spilled");

        Ok(path)
    }

    /// Lists spilled batch units, oldest first.
    pub async fn batch_files(&self) -> Result<Vec<PathBuf>, SpoolError> {
        list_sorted(&self.values_dir).await
    }

    /// Lists spilled event units, oldest first.
    pub async fn event_files(&self) -> Result<Vec<PathBuf>, SpoolError> {
        list_sorted(&self.events_dir).await
    }

    /// Reads a batch unit back.
    pub async fn read_batch(&self, path: &Path) -> Result<Vec<BatchRecord>, SpoolError> {
        let data = read_unit(path).await?;
        serde_json::from_slice(&data).map_err(|source| SpoolError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reads an event unit back as `(tick_id, event)`.
    pub async fn read_event(&self, path: &Path) -> Result<(u64, EventUpload), SpoolError> {
        let data = read_unit(path).await?;
        let unit: BTreeMap<String, EventUpload> =
            serde_json::from_slice(&data).map_err(|source| SpoolError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let (tick, event) = unit
            .into_iter()
            .next()
            .ok_or_else(|| SpoolError::EmptyEventUnit {
                path: path.display().to_string(),
            })?;
        let tick_id = tick.parse::<u64>().map_err(|_| SpoolError::EmptyEventUnit {
            path: path.display().to_string(),
        })?;

        Ok((tick_id, event))
    }

    /// Deletes a delivered unit.
    pub async fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|source| SpoolError::Delete {
                path: path.display().to_string(),
                source,
            })
    }

    fn unit_name(&mut self) -> String {
        self.seq += 1;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        format!("{nanos:020}-{:06}.json", self.seq)
    }
}

async fn write_unit(path: &Path, data: &[u8]) -> Result<(), SpoolError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|source| SpoolError::Write {
            path: path.display().to_string(),
            source,
        })
}

async fn read_unit(path: &Path) -> Result<Vec<u8>, SpoolError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| SpoolError::Read {
            path: path.display().to_string(),
            source,
        })
}

async fn list_sorted(dir: &Path) -> Result<Vec<PathBuf>, SpoolError> {
    let mut entries =
        tokio::fs::read_dir(dir)
            .await
            .map_err(|source| SpoolError::List {
                path: dir.display().to_string(),
                source,
            })?;

    let mut files = Vec::new();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|source| SpoolError::List {
                path: dir.display().to_string(),
                source,
            })?;
        let Some(entry) = entry else { break };
        files.push(entry.path());
    }

    files.sort();

    Ok(files)
}
