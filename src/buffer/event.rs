use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::BufferError;

/// One accepted discrete event.
///
/// `event_id` is process-lifetime monotonic, assigned on acceptance and
/// never reused; it is the true insertion order even when tick ids arrive
/// out of step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: u64,
    pub tick_id: u64,
    pub value: f64,
}

/// One observation offered to the buffer during a refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventCandidate {
    pub tick_id: u64,
    pub value: f64,
}

/// On-disk snapshot of the full buffer content.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EventSnapshot {
    #[serde(default)]
    content: Vec<EventRecord>,
}

/// Bounded, deduplicating store of discrete events, persisted as a single
/// JSON snapshot.
///
/// All mutating operations take `&mut self`: one owner drives the buffer,
/// so overlapping mutation is a compile error rather than a runtime
/// condition.
#[derive(Debug)]
pub struct EventBuffer {
    path: PathBuf,
    buffer_size: usize,
    /// Records in ascending `event_id` order.
    content: Vec<EventRecord>,
    last_event_id: u64,
}

impl EventBuffer {
    /// Opens the buffer, loading an existing non-empty snapshot.
    ///
    /// Loaded content is trimmed to `buffer_size` keeping the highest
    /// event ids; `last_event_id` resumes from the maximum id found so
    /// ids stay monotonic across restarts. A snapshot that cannot be
    /// parsed is an error, not an empty start.
    pub async fn open(path: impl Into<PathBuf>, buffer_size: usize) -> Result<Self, BufferError> {
        let path = path.into();

        let mut snapshot = match tokio::fs::read(&path).await {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice::<EventSnapshot>(&data).map_err(|source| {
                    BufferError::SnapshotParse {
                        path: path.display().to_string(),
                        source,
                    }
                })?
            }
            Ok(_) => EventSnapshot::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EventSnapshot::default(),
            Err(source) => {
                return Err(BufferError::SnapshotRead {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        snapshot.content.sort_unstable_by_key(|r| r.event_id);
        let last_event_id = snapshot.content.last().map(|r| r.event_id).unwrap_or(0);

        let mut buffer = Self {
            path,
            buffer_size,
            content: snapshot.content,
            last_event_id,
        };

        if buffer.trim_to_bound() {
            buffer.persist().await?;
        }

        Ok(buffer)
    }

    /// Returns the configured record bound.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all records in ascending event-id order.
    pub fn content(&self) -> &[EventRecord] {
        &self.content
    }

    /// Returns the highest event id ever assigned (0 when none).
    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// Returns the value of the most recent record.
    pub fn last_event(&self) -> Option<f64> {
        self.content.last().map(|r| r.value)
    }

    /// Returns the tick of the most recent record.
    pub fn last_event_tick(&self) -> Option<u64> {
        self.content.last().map(|r| r.tick_id)
    }

    /// Resizes the buffer. Growing keeps all data; shrinking trims the
    /// lowest event ids and persists the result.
    pub async fn change_buffer_size(&mut self, new_size: usize) -> Result<(), BufferError> {
        self.buffer_size = new_size;

        if self.trim_to_bound() {
            self.persist().await?;
        }

        Ok(())
    }

    /// Merges a candidate window into the buffer.
    ///
    /// The window must hold exactly `buffer_size` observations ordered
    /// newest to oldest. A candidate is novel only when no existing
    /// record matches both its tick and value; novel candidates are
    /// inserted oldest first so event ids track chronological order.
    /// The snapshot is persisted only when something was added. Returns
    /// the newly created records in ascending order.
    pub async fn refresh_events(
        &mut self,
        window: &[EventCandidate],
    ) -> Result<Vec<EventRecord>, BufferError> {
        if window.len() != self.buffer_size {
            return Err(BufferError::InvalidWindowLength {
                expected: self.buffer_size,
                got: window.len(),
            });
        }

        let mut added = Vec::new();

        // The window arrives newest first; walk it backwards so the
        // oldest novel observation gets the lowest new id.
        for candidate in window.iter().rev() {
            let seen = self
                .content
                .iter()
                .any(|r| r.tick_id == candidate.tick_id && r.value == candidate.value);
            if seen {
                continue;
            }

            self.last_event_id += 1;
            let record = EventRecord {
                event_id: self.last_event_id,
                tick_id: candidate.tick_id,
                value: candidate.value,
            };
            self.content.push(record);
            added.push(record);
        }

        if added.is_empty() {
            return Ok(added);
        }

        if self.trim_to_bound() {
            debug!(retained = self.content.len(), "event buffer bound reached");
        }
        self.persist().await?;

        Ok(added)
    }

    /// Drops the lowest event ids until the bound holds. Returns whether
    /// anything was removed.
    fn trim_to_bound(&mut self) -> bool {
        if self.content.len() <= self.buffer_size {
            return false;
        }

        let excess = self.content.len() - self.buffer_size;
        self.content.drain(..excess);
        true
    }

    async fn persist(&self) -> Result<(), BufferError> {
        let snapshot = EventSnapshot {
            content: self.content.clone(),
        };
        let data = serde_json::to_vec(&snapshot).map_err(|source| BufferError::SnapshotParse {
            path: self.path.display().to_string(),
            source,
        })?;

        tokio::fs::write(&self.path, data)
            .await
            .map_err(|source| BufferError::SnapshotWrite {
                path: self.path.display().to_string(),
                source,
            })
    }
}
