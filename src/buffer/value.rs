use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{Row, RowStore};

use super::BufferError;

/// Rows keyed by tick id, with values keyed by external data-point id.
pub type SampleRows = BTreeMap<u64, BTreeMap<String, f64>>;

/// Construction parameters sufficient to reopen an equivalent buffer
/// against the same backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueBufferPayload {
    pub file_path: PathBuf,
    pub buffer_size: usize,
    #[serde(default)]
    pub data_point_ids: Vec<String>,
}

/// Bounded, column-oriented store of sampled values keyed by tick id.
///
/// Each registered data point maps to one column in the backing row
/// store; rows beyond `buffer_size` are evicted lowest-tick-first. Ticks
/// increase monotonically at the caller, so lowest tick is oldest row
/// regardless of insertion order.
pub struct ValueBuffer<S> {
    store: S,
    file_path: PathBuf,
    buffer_size: usize,
    /// External data-point id to column name.
    points: BTreeMap<String, String>,
}

impl<S: RowStore> ValueBuffer<S> {
    /// Creates an empty buffer over the given store.
    pub fn new(store: S, file_path: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            store,
            file_path: file_path.into(),
            buffer_size,
            points: BTreeMap::new(),
        }
    }

    /// Reconstructs a buffer from a payload, re-registering its data
    /// points. Columns that already exist in the backing store are
    /// reused, so reopening is idempotent.
    pub async fn open(store: S, payload: &ValueBufferPayload) -> Result<Self, BufferError> {
        let mut buffer = Self::new(store, payload.file_path.clone(), payload.buffer_size);

        for id in &payload.data_point_ids {
            buffer.add_data_point(id).await?;
        }

        Ok(buffer)
    }

    /// Registers a data point, creating its column when absent.
    pub async fn add_data_point(&mut self, id: &str) -> Result<(), BufferError> {
        if self.points.contains_key(id) {
            return Err(BufferError::AlreadyRegistered(id.to_string()));
        }

        let column = column_name(id);
        self.store.ensure_column(&column).await?;
        self.points.insert(id.to_string(), column);

        Ok(())
    }

    /// Unregisters a data point. The underlying column and its historical
    /// data stay in place for schema stability.
    pub fn remove_data_point(&mut self, id: &str) -> Result<(), BufferError> {
        if self.points.remove(id).is_none() {
            return Err(BufferError::NotRegistered(id.to_string()));
        }

        Ok(())
    }

    /// Writes one row for `tick_id` holding exactly the supplied values
    /// of registered data points, then evicts rows beyond the bound.
    ///
    /// An empty map is a success no-op. Unregistered ids are silently
    /// ignored; if none of the supplied ids are registered, no row is
    /// written.
    pub async fn insert_values(
        &mut self,
        tick_id: u64,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), BufferError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut row = Row::new();
        for (id, value) in values {
            if let Some(column) = self.points.get(id) {
                row.insert(column.clone(), *value);
            }
        }

        if row.is_empty() {
            debug!(tick_id, "no registered data points in insert, skipping row");
            return Ok(());
        }

        self.store.insert_row(tick_id, row).await?;
        self.evict().await
    }

    /// Deletes the rows for the given tick ids; missing ids are a no-op.
    pub async fn remove_values(&mut self, tick_ids: &[u64]) -> Result<(), BufferError> {
        self.store.delete_rows(tick_ids).await?;
        Ok(())
    }

    /// Returns all buffered rows keyed by tick id, with column names
    /// mapped back to external data-point ids.
    pub async fn data(&self) -> Result<SampleRows, BufferError> {
        let rows = self.store.select_all().await?;
        Ok(self.to_external(rows))
    }

    /// Returns the `n` most recent rows.
    pub async fn most_recent(&self, n: usize) -> Result<SampleRows, BufferError> {
        let rows = self.store.select_recent(n).await?;
        Ok(self.to_external(rows))
    }

    /// Deletes all rows, keeping the schema.
    pub async fn clear(&mut self) -> Result<(), BufferError> {
        self.store.delete_all().await?;
        Ok(())
    }

    /// Returns the registered data-point ids.
    pub fn data_point_ids(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }

    /// Returns the backing file path.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Returns the configured row bound.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Produces the construction parameters of this buffer.
    pub fn payload(&self) -> ValueBufferPayload {
        ValueBufferPayload {
            file_path: self.file_path.clone(),
            buffer_size: self.buffer_size,
            data_point_ids: self.points.keys().cloned().collect(),
        }
    }

    async fn evict(&mut self) -> Result<(), BufferError> {
        let ticks = self.store.tick_ids().await?;
        if ticks.len() <= self.buffer_size {
            return Ok(());
        }

        let excess = ticks.len() - self.buffer_size;
        let oldest: Vec<u64> = ticks.into_iter().take(excess).collect();
        debug!(evicted = oldest.len(), "value buffer bound reached");
        self.store.delete_rows(&oldest).await?;

        Ok(())
    }

    fn to_external(&self, rows: crate::store::Rows) -> SampleRows {
        let by_column: BTreeMap<&str, &str> = self
            .points
            .iter()
            .map(|(id, column)| (column.as_str(), id.as_str()))
            .collect();

        rows.into_iter()
            .map(|(tick, row)| {
                let values = row
                    .into_iter()
                    .filter_map(|(column, value)| {
                        by_column
                            .get(column.as_str())
                            .map(|id| (id.to_string(), value))
                    })
                    .collect();
                (tick, values)
            })
            .collect()
    }
}

/// Derives the internal column name for an external data-point id.
/// Non-alphanumeric characters are folded to underscores so ids survive
/// any identifier rules of the backing engine.
fn column_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("dp_{sanitized}")
}
