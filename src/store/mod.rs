pub mod json;

pub use json::JsonRowStore;

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;

/// A sparse row: column name to sampled value.
pub type Row = BTreeMap<String, f64>;

/// Rows keyed by their tick id primary key.
pub type Rows = BTreeMap<u64, Row>;

/// Errors surfaced by a row store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading row store {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("writing row store {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing row store {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Minimal table/column contract over the embedded storage engine.
///
/// Columns always hold 64-bit floats; the primary key is a 64-bit tick id.
/// The engine itself is an external collaborator: the buffer layer only
/// ever reaches it through this seam, so swapping the backing store does
/// not touch eviction or registration logic.
pub trait RowStore: Send {
    /// Ensures a column exists. Creating an existing column is a no-op.
    fn ensure_column(
        &mut self,
        name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Upserts one row by tick id with exactly the given column values.
    fn insert_row(
        &mut self,
        tick_id: u64,
        values: Row,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes the rows matching the given tick ids. Missing ids are not
    /// an error.
    fn delete_rows(
        &mut self,
        tick_ids: &[u64],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns all rows keyed by tick id.
    fn select_all(&self) -> impl Future<Output = Result<Rows, StoreError>> + Send;

    /// Returns the `n` rows with the highest tick ids.
    fn select_recent(
        &self,
        n: usize,
    ) -> impl Future<Output = Result<Rows, StoreError>> + Send;

    /// Deletes all rows, keeping the schema.
    fn delete_all(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns all tick ids in ascending order.
    fn tick_ids(&self) -> impl Future<Output = Result<Vec<u64>, StoreError>> + Send;
}
