use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Row, RowStore, Rows, StoreError};

/// On-disk table snapshot: column schema plus all rows.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TableSnapshot {
    #[serde(default)]
    columns: BTreeSet<String>,
    #[serde(default)]
    rows: Rows,
}

/// File-backed reference implementation of the row store contract.
///
/// The whole table lives in memory and is snapshotted to a single JSON
/// file after every mutation, so a crash between mutations loses at most
/// the in-flight write. Reopening against the same file restores both
/// schema and rows; re-ensuring an existing column is a no-op.
#[derive(Debug)]
pub struct JsonRowStore {
    path: PathBuf,
    table: TableSnapshot,
}

impl JsonRowStore {
    /// Opens the store, loading an existing snapshot when the file is
    /// present and non-empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let table = match tokio::fs::read(&path).await {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice(&data).map_err(|source| StoreError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            Ok(_) => TableSnapshot::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TableSnapshot::default(),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Ok(Self { path, table })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the column names currently in the schema.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.table.columns.iter().map(String::as_str)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&self.table).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        tokio::fs::write(&self.path, data)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }
}

impl RowStore for JsonRowStore {
    async fn ensure_column(&mut self, name: &str) -> Result<(), StoreError> {
        if self.table.columns.contains(name) {
            return Ok(());
        }

        self.table.columns.insert(name.to_string());
        self.persist().await
    }

    async fn insert_row(&mut self, tick_id: u64, values: Row) -> Result<(), StoreError> {
        self.table.rows.insert(tick_id, values);
        self.persist().await
    }

    async fn delete_rows(&mut self, tick_ids: &[u64]) -> Result<(), StoreError> {
        let mut changed = false;
        for tick in tick_ids {
            changed |= self.table.rows.remove(tick).is_some();
        }

        if changed {
            self.persist().await?;
        }

        Ok(())
    }

    async fn select_all(&self) -> Result<Rows, StoreError> {
        Ok(self.table.rows.clone())
    }

    async fn select_recent(&self, n: usize) -> Result<Rows, StoreError> {
        Ok(self
            .table
            .rows
            .iter()
            .rev()
            .take(n)
            .map(|(tick, row)| (*tick, row.clone()))
            .collect())
    }

    async fn delete_all(&mut self) -> Result<(), StoreError> {
        if self.table.rows.is_empty() {
            return Ok(());
        }

        self.table.rows.clear();
        self.persist().await
    }

    async fn tick_ids(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self.table.rows.keys().copied().collect())
    }
}
