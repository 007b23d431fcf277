use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::buffer::value::SampleRows;
use crate::buffer::{BufferError, EventBuffer, EventCandidate, ValueBuffer, ValueBufferPayload};
use crate::format::NumberFormatter;
use crate::sender::{BatchRecord, EventUpload, SendOutcome, SinkClient, Uplink};
use crate::spool::Spool;
use crate::store::RowStore;

/// Human-readable meaning of a discrete event value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescription {
    pub value: f64,
    pub description: String,
}

/// Pacing and drain limits for the refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderOptions {
    /// Send every `send_interval`-th tick.
    pub send_interval: u64,
    /// Max spilled batch units redelivered per cycle.
    pub send_file_limit: usize,
    /// Max spilled event units redelivered per cycle.
    pub send_event_limit: usize,
}

/// Construction parameters sufficient to reopen an equivalent forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderPayload {
    pub value_buffer: ValueBufferPayload,
    pub event_path: PathBuf,
    pub event_buffer_size: usize,
    pub spool_dir: PathBuf,
    #[serde(flatten)]
    pub options: ForwarderOptions,
}

/// Tick-driven delivery pipeline: drains the value and event buffers,
/// attempts immediate sends, spills to disk on failure, and redelivers
/// spilled units with per-cycle limits.
///
/// `refresh` never surfaces an error to the scheduler; every failure is
/// contained and logged. One owner drives the forwarder, so the whole
/// cycle runs without locks.
pub struct Forwarder<S, C> {
    values: ValueBuffer<S>,
    events: EventBuffer,
    spool: Spool,
    uplink: Uplink<C>,
    formatter: NumberFormatter,
    options: ForwarderOptions,
    event_descriptions: Vec<EventDescription>,
}

impl<S: RowStore, C: SinkClient> Forwarder<S, C> {
    /// Assembles a forwarder from its components.
    pub fn new(
        values: ValueBuffer<S>,
        events: EventBuffer,
        spool: Spool,
        uplink: Uplink<C>,
        formatter: NumberFormatter,
        options: ForwarderOptions,
        event_descriptions: Vec<EventDescription>,
    ) -> Self {
        Self {
            values,
            events,
            spool,
            uplink,
            formatter,
            options,
            event_descriptions,
        }
    }

    /// Reconstructs a forwarder from a payload. The buffers and spool
    /// reopen against their original files, so spilled backlog from a
    /// previous run is picked up by the next drain.
    pub async fn open(
        payload: &ForwarderPayload,
        store: S,
        uplink: Uplink<C>,
        formatter: NumberFormatter,
        event_descriptions: Vec<EventDescription>,
    ) -> Result<Self, anyhow::Error> {
        let values = ValueBuffer::open(store, &payload.value_buffer).await?;
        let events = EventBuffer::open(&payload.event_path, payload.event_buffer_size).await?;
        let spool = Spool::open(&payload.spool_dir).await?;

        Ok(Self::new(
            values,
            events,
            spool,
            uplink,
            formatter,
            payload.options,
            event_descriptions,
        ))
    }

    /// Runs one refresh cycle for the given tick.
    ///
    /// Ticks not aligned to the send interval return immediately. The
    /// value buffer is cleared as soon as its rows are collected: data
    /// either goes out now, lands in the spool, or (with sending
    /// disabled) is dropped.
    pub async fn refresh(&mut self, tick_id: u64) {
        if !self.is_send_tick(tick_id) {
            return;
        }

        let collected = match self.values.data().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(tick_id, error = %e, "collecting buffered values failed");
                return;
            }
        };

        if let Err(e) = self.values.clear().await {
            error!(tick_id, error = %e, "clearing value buffer failed");
        }

        if !self.uplink.sending_enabled() {
            if !collected.is_empty() {
                debug!(
                    tick_id,
                    rows = collected.len(),
                    "sending disabled, dropping collected rows",
                );
            }
            return;
        }

        let batch = self.build_batch(&collected);
        if !batch.is_empty() {
            match self.uplink.send_batch(&batch).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        tick_id,
                        records = batch.len(),
                        error = %e,
                        "immediate batch send failed, spilling",
                    );
                    if let Err(e) = self.spool.push_batch(&batch).await {
                        error!(tick_id, error = %e, "spilling batch failed, data lost");
                    }
                }
            }
        }

        self.drain_spools().await;
    }

    /// Merges a candidate window into the event buffer and forwards the
    /// novel events.
    ///
    /// Window validation errors propagate. A novel event whose value has
    /// no configured description is dropped with a warning, since it
    /// could never be resolved later either. Resolvable events that exhaust
    /// their send retries are spilled for redelivery.
    pub async fn refresh_events(&mut self, window: &[EventCandidate]) -> Result<(), BufferError> {
        let novel = self.events.refresh_events(window).await?;

        for record in novel {
            let Some(description) = self.describe(record.value) else {
                warn!(
                    tick_id = record.tick_id,
                    value = record.value,
                    "no description for event value, dropping",
                );
                continue;
            };

            let upload = EventUpload {
                event_id: record.event_id,
                tick_id: record.tick_id,
                value: record.value,
                description,
            };

            match self.uplink.send_event(&upload).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        tick_id = record.tick_id,
                        error = %e,
                        "event send failed, spilling",
                    );
                    if let Err(e) = self.spool.push_event(record.tick_id, &upload).await {
                        error!(
                            tick_id = record.tick_id,
                            error = %e,
                            "spilling event failed, data lost",
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Redelivers spilled units, values then events, each up to its
    /// per-cycle limit. Also used for a final drain on shutdown.
    pub async fn drain_spools(&mut self) {
        self.drain_value_spool().await;
        self.drain_event_spool().await;
    }

    /// Produces the construction parameters of this forwarder.
    pub fn payload(&self) -> ForwarderPayload {
        ForwarderPayload {
            value_buffer: self.values.payload(),
            event_path: self.events.path().to_path_buf(),
            event_buffer_size: self.events.buffer_size(),
            spool_dir: self.spool.dir().to_path_buf(),
            options: self.options,
        }
    }

    /// Returns the value buffer.
    pub fn values_mut(&mut self) -> &mut ValueBuffer<S> {
        &mut self.values
    }

    /// Returns the event buffer.
    pub fn events_mut(&mut self) -> &mut EventBuffer {
        &mut self.events
    }

    /// Returns the uplink.
    pub fn uplink_mut(&mut self) -> &mut Uplink<C> {
        &mut self.uplink
    }

    /// Returns the formatter.
    pub fn formatter_mut(&mut self) -> &mut NumberFormatter {
        &mut self.formatter
    }

    fn is_send_tick(&self, tick_id: u64) -> bool {
        self.options.send_interval != 0 && tick_id % self.options.send_interval == 0
    }

    fn build_batch(&self, collected: &SampleRows) -> Vec<BatchRecord> {
        collected
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(tick_id, values)| BatchRecord {
                tick_id: *tick_id,
                values: values
                    .iter()
                    .map(|(id, value)| (id.clone(), self.formatter.convert(id, *value)))
                    .collect(),
            })
            .collect()
    }

    fn describe(&self, value: f64) -> Option<String> {
        self.event_descriptions
            .iter()
            .find(|d| d.value == value)
            .map(|d| d.description.clone())
    }

    async fn drain_value_spool(&mut self) {
        let files = match self.spool.batch_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "listing spilled batches failed");
                return;
            }
        };

        let mut delivered = 0;
        for path in files {
            if delivered >= self.options.send_file_limit {
                break;
            }

            let records = match self.spool.read_batch(&path).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "reading spilled batch failed, drain aborted",
                    );
                    return;
                }
            };

            match self.uplink.send_batch(&records).await {
                Ok(SendOutcome::Sent) => {}
                // Not ready: nothing was transmitted, keep every unit.
                Ok(SendOutcome::Skipped) => return,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "redelivering spilled batch failed, drain aborted",
                    );
                    return;
                }
            }

            if let Err(e) = self.spool.remove(&path).await {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "deleting delivered batch unit failed, drain aborted",
                );
                return;
            }

            delivered += 1;
            debug!(path = %path.display(), "spilled batch redelivered");
        }
    }

    async fn drain_event_spool(&mut self) {
        let files = match self.spool.event_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "listing spilled events failed");
                return;
            }
        };

        let mut delivered = 0;
        for path in files {
            if delivered >= self.options.send_event_limit {
                break;
            }

            let (_, event) = match self.spool.read_event(&path).await {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "reading spilled event failed, drain aborted",
                    );
                    return;
                }
            };

            match self.uplink.send_event(&event).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::Skipped) => return,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "redelivering spilled event failed, drain aborted",
                    );
                    return;
                }
            }

            if let Err(e) = self.spool.remove(&path).await {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "deleting delivered event unit failed, drain aborted",
                );
                return;
            }

            delivered += 1;
            debug!(path = %path.display(), "spilled event redelivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use anyhow::{anyhow, Result};

    use crate::format::NumberFormat;
    use crate::sender::{Boarding, Credentials, SinkConfig};
    use crate::store::JsonRowStore;

    /// Scripted sink: fails sends while `failing` is set, records
    /// everything delivered.
    #[derive(Default)]
    struct ScriptedSink {
        failing: bool,
        batches: Vec<Vec<BatchRecord>>,
        events: Vec<EventUpload>,
        batch_attempts: u32,
        event_attempts: u32,
    }

    impl SinkClient for ScriptedSink {
        async fn onboard(&mut self, _credentials: &Credentials) -> Result<Boarding> {
            Ok(Boarding::default())
        }

        async fn fetch_config(&mut self) -> Result<SinkConfig> {
            Ok(SinkConfig::default())
        }

        async fn send_batch(&mut self, records: &[BatchRecord]) -> Result<()> {
            self.batch_attempts += 1;
            if self.failing {
                return Err(anyhow!("sink unavailable"));
            }
            self.batches.push(records.to_vec());
            Ok(())
        }

        async fn send_event(&mut self, event: &EventUpload) -> Result<()> {
            self.event_attempts += 1;
            if self.failing {
                return Err(anyhow!("sink unavailable"));
            }
            self.events.push(event.clone());
            Ok(())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            tenant: "plant-7".to_string(),
            client_id: "gw-1".to_string(),
            shared_secret: "secret".to_string(),
        }
    }

    async fn forwarder(
        dir: &Path,
        options: ForwarderOptions,
    ) -> Forwarder<JsonRowStore, ScriptedSink> {
        let store_path = dir.join("values.json");
        let store = JsonRowStore::open(&store_path).await.expect("store");
        let mut values = ValueBuffer::new(store, &store_path, 8);
        values.add_data_point("temp").await.expect("register");

        let events = EventBuffer::open(dir.join("events.json"), 2)
            .await
            .expect("events");
        let spool = Spool::open(dir.join("spool")).await.expect("spool");

        let mut uplink = Uplink::new(ScriptedSink::default(), 2);
        uplink.set_credentials(credentials());
        uplink.enable_sending().await.expect("enable");

        let mut formatter = NumberFormatter::new();
        formatter.set_format("temp", NumberFormat::Fixed(1));

        Forwarder::new(
            values,
            events,
            spool,
            uplink,
            formatter,
            options,
            vec![EventDescription {
                value: 3.0,
                description: "overpressure".to_string(),
            }],
        )
    }

    fn options() -> ForwarderOptions {
        ForwarderOptions {
            send_interval: 2,
            send_file_limit: 5,
            send_event_limit: 5,
        }
    }

    fn sample(value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("temp".to_string(), value)])
    }

    #[tokio::test]
    async fn test_unaligned_tick_does_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        fwd.values_mut()
            .insert_values(1, &sample(20.54))
            .await
            .expect("insert");

        fwd.refresh(3).await;

        // No send, and the buffer still holds the row.
        assert_eq!(fwd.uplink_mut().client().batch_attempts, 0);
        assert_eq!(fwd.values_mut().data().await.expect("data").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_sends_formatted_batch_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        fwd.values_mut()
            .insert_values(2, &sample(20.54))
            .await
            .expect("insert");

        fwd.refresh(2).await;

        let client = fwd.uplink_mut().client();
        assert_eq!(client.batches.len(), 1);
        assert_eq!(client.batches[0][0].tick_id, 2);
        assert_eq!(client.batches[0][0].values["temp"], "20.5");
        assert!(fwd.values_mut().data().await.expect("data").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_disabled_drops_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;
        fwd.uplink_mut().disable_sending();

        fwd.values_mut()
            .insert_values(2, &sample(20.5))
            .await
            .expect("insert");

        fwd.refresh(2).await;

        assert_eq!(fwd.uplink_mut().client().batch_attempts, 0);
        assert!(fwd.values_mut().data().await.expect("data").is_empty());
        // Nothing was spilled either: this is the deliberate loss path.
        assert!(fwd.payload().spool_dir.join("values").is_dir());
        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        assert!(spool.batch_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_failure_spills_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        fwd.values_mut()
            .insert_values(2, &sample(20.5))
            .await
            .expect("insert");

        fwd.uplink_mut().client_mut().failing = true;
        fwd.refresh(2).await;

        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        let files = spool.batch_files().await.expect("list");
        assert_eq!(files.len(), 1);

        let records = spool.read_batch(&files[0]).await.expect("read");
        assert_eq!(records[0].tick_id, 2);
    }

    #[tokio::test]
    async fn test_spilled_batch_redelivered_next_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        fwd.values_mut()
            .insert_values(2, &sample(20.5))
            .await
            .expect("insert");

        fwd.uplink_mut().client_mut().failing = true;
        fwd.refresh(2).await;

        fwd.uplink_mut().client_mut().failing = false;
        fwd.refresh(4).await;

        let client = fwd.uplink_mut().client();
        assert_eq!(client.batches.len(), 1);
        assert_eq!(client.batches[0][0].tick_id, 2);

        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        assert!(spool.batch_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_file_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options();
        opts.send_file_limit = 2;
        let mut fwd = forwarder(dir.path(), opts).await;

        fwd.uplink_mut().client_mut().failing = true;
        for tick in [2u64, 4, 6] {
            fwd.values_mut()
                .insert_values(tick, &sample(1.0))
                .await
                .expect("insert");
            fwd.refresh(tick).await;
        }

        fwd.uplink_mut().client_mut().failing = false;
        fwd.refresh(8).await;

        assert_eq!(fwd.uplink_mut().client().batches.len(), 2);
        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        assert_eq!(spool.batch_files().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_events_sends_described_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        let window = vec![
            EventCandidate {
                tick_id: 20,
                value: 3.0,
            },
            EventCandidate {
                tick_id: 10,
                value: 3.0,
            },
        ];
        fwd.refresh_events(&window).await.expect("refresh");

        let client = fwd.uplink_mut().client();
        assert_eq!(client.events.len(), 2);
        assert_eq!(client.events[0].tick_id, 10);
        assert_eq!(client.events[0].description, "overpressure");
    }

    #[tokio::test]
    async fn test_refresh_events_drops_unresolvable_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        let window = vec![
            EventCandidate {
                tick_id: 20,
                value: 99.0,
            },
            EventCandidate {
                tick_id: 10,
                value: 3.0,
            },
        ];
        fwd.refresh_events(&window).await.expect("refresh");

        // Only the described event went out, and the unresolvable one
        // was not spilled.
        let client = fwd.uplink_mut().client();
        assert_eq!(client.events.len(), 1);
        assert_eq!(client.events[0].value, 3.0);

        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        assert!(spool.event_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_events_spills_on_send_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        fwd.uplink_mut().client_mut().failing = true;
        let window = vec![
            EventCandidate {
                tick_id: 20,
                value: 3.0,
            },
            EventCandidate {
                tick_id: 10,
                value: 3.0,
            },
        ];
        fwd.refresh_events(&window).await.expect("refresh");

        // Two retries per event per the uplink bound.
        assert_eq!(fwd.uplink_mut().client().event_attempts, 4);

        let spool = Spool::open(dir.path().join("spool")).await.expect("spool");
        assert_eq!(spool.event_files().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_events_propagates_window_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fwd = forwarder(dir.path(), options()).await;

        let err = fwd
            .refresh_events(&[EventCandidate {
                tick_id: 1,
                value: 3.0,
            }])
            .await
            .expect_err("short window");
        assert!(matches!(err, BufferError::InvalidWindowLength { .. }));
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fwd = forwarder(dir.path(), options()).await;
        let payload = fwd.payload();

        let store = JsonRowStore::open(dir.path().join("values.json"))
            .await
            .expect("store");
        let uplink = Uplink::new(ScriptedSink::default(), 2);
        let reopened = Forwarder::open(
            &payload,
            store,
            uplink,
            NumberFormatter::new(),
            Vec::new(),
        )
        .await
        .expect("reopen");

        assert_eq!(reopened.payload(), payload);
    }
}
