pub mod http;

pub use http::HttpSinkClient;

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// One outgoing timeseries record: the tick it was sampled at and the
/// formatted values keyed by data-point id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub tick_id: u64,
    pub values: BTreeMap<String, String>,
}

/// One outgoing event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUpload {
    pub event_id: u64,
    pub tick_id: u64,
    pub value: f64,
    pub description: String,
}

/// Credential bundle used to register this gateway with the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub tenant: String,
    pub client_id: String,
    pub shared_secret: String,
}

/// Result of a successful onboarding handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boarding {
    pub access_token: String,
}

/// Remote-side data source configuration fetched after boarding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub configuration_id: String,
    pub revision: u64,
}

/// What a send attempt actually did.
///
/// `Skipped` lets callers that delete durable units after delivery tell a
/// confirmed send apart from the silent no-op of a not-ready uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Skipped,
}

/// Errors surfaced by the uplink state machine.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("no sink credentials configured")]
    MissingCredentials,

    #[error("onboarding with the sink failed: {0:#}")]
    Onboarding(anyhow::Error),

    #[error("fetching sink configuration failed: {0:#}")]
    ConfigFetch(anyhow::Error),

    #[error("sending to the sink failed after {attempts} attempts: {cause:#}")]
    SendExhausted { attempts: u32, cause: anyhow::Error },
}

/// Vendor seam to the remote telemetry sink.
///
/// Concrete adapters wrap one cloud client; nothing above this trait
/// depends on vendor specifics beyond these four calls.
pub trait SinkClient: Send {
    /// Registers this gateway instance using the credential bundle.
    fn onboard(
        &mut self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Boarding>> + Send;

    /// Fetches the remote-side data source configuration.
    fn fetch_config(&mut self) -> impl Future<Output = Result<SinkConfig>> + Send;

    /// Transmits one value batch.
    fn send_batch(&mut self, records: &[BatchRecord]) -> impl Future<Output = Result<()>> + Send;

    /// Transmits one event.
    fn send_event(&mut self, event: &EventUpload) -> impl Future<Output = Result<()>> + Send;
}

/// Connection state machine and bounded-retry send path over a sink
/// client.
///
/// Created disabled and unboarded. `enable_sending` runs the onboarding
/// sequence, skipping steps already satisfied, then flips enabled;
/// `disable_sending` flips disabled without unwinding onboarding. New
/// credentials reset the boarded/configured state and force
/// re-onboarding on the next enable.
pub struct Uplink<C> {
    client: C,
    credentials: Option<Credentials>,
    boarding: Option<Boarding>,
    sink_config: Option<SinkConfig>,
    sending_enabled: bool,
    sending_retries: u32,
}

impl<C: SinkClient> Uplink<C> {
    /// Creates a disabled, unboarded uplink.
    ///
    /// `sending_retries` is the total attempt count per send, at least 1.
    pub fn new(client: C, sending_retries: u32) -> Self {
        Self {
            client,
            credentials: None,
            boarding: None,
            sink_config: None,
            sending_enabled: false,
            sending_retries: sending_retries.max(1),
        }
    }

    /// Installs a new credential bundle, invalidating any previous
    /// boarding and sink configuration.
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
        self.boarding = None;
        self.sink_config = None;
    }

    /// True once credentials exist, boarding succeeded, and the sink
    /// configuration has been fetched.
    pub fn is_ready_to_send(&self) -> bool {
        self.credentials.is_some() && self.boarding.is_some() && self.sink_config.is_some()
    }

    /// Whether sending is currently enabled.
    pub fn sending_enabled(&self) -> bool {
        self.sending_enabled
    }

    /// Returns the fetched sink configuration, if any.
    pub fn sink_config(&self) -> Option<&SinkConfig> {
        self.sink_config.as_ref()
    }

    /// Runs the onboarding sequence and enables sending.
    ///
    /// Idempotent: steps already satisfied are skipped. On failure the
    /// prior state is kept and the error is surfaced.
    pub async fn enable_sending(&mut self) -> Result<(), UplinkError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(UplinkError::MissingCredentials)?;

        if self.boarding.is_none() {
            let boarding = self
                .client
                .onboard(credentials)
                .await
                .map_err(UplinkError::Onboarding)?;
            debug!("gateway boarded with sink");
            self.boarding = Some(boarding);
        }

        if self.sink_config.is_none() {
            let config = self
                .client
                .fetch_config()
                .await
                .map_err(UplinkError::ConfigFetch)?;
            debug!(
                configuration_id = %config.configuration_id,
                revision = config.revision,
                "sink configuration fetched",
            );
            self.sink_config = Some(config);
        }

        self.sending_enabled = true;

        Ok(())
    }

    /// Disables sending without unwinding onboarding.
    pub fn disable_sending(&mut self) {
        self.sending_enabled = false;
    }

    /// Sends a value batch with bounded retries.
    ///
    /// A not-ready uplink skips the attempt entirely; this is a success
    /// from the caller's perspective, distinguished only by the outcome.
    pub async fn send_batch(&mut self, records: &[BatchRecord]) -> Result<SendOutcome, UplinkError> {
        if !self.is_ready_to_send() {
            debug!(records = records.len(), "uplink not ready, skipping batch send");
            return Ok(SendOutcome::Skipped);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.send_batch(records).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(e) if attempt < self.sending_retries => {
                    warn!(attempt, error = %e, "batch send attempt failed, retrying");
                }
                Err(cause) => {
                    return Err(UplinkError::SendExhausted {
                        attempts: attempt,
                        cause,
                    })
                }
            }
        }
    }

    /// Sends one event with bounded retries. Same skip semantics as
    /// [`Uplink::send_batch`].
    pub async fn send_event(&mut self, event: &EventUpload) -> Result<SendOutcome, UplinkError> {
        if !self.is_ready_to_send() {
            debug!(tick_id = event.tick_id, "uplink not ready, skipping event send");
            return Ok(SendOutcome::Skipped);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.send_event(event).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(e) if attempt < self.sending_retries => {
                    warn!(attempt, error = %e, "event send attempt failed, retrying");
                }
                Err(cause) => {
                    return Err(UplinkError::SendExhausted {
                        attempts: attempt,
                        cause,
                    })
                }
            }
        }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the underlying client mutably.
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    /// Scripted sink client: counts calls, fails the first
    /// `fail_sends` send attempts.
    #[derive(Default)]
    struct ScriptedSink {
        onboard_calls: u32,
        config_calls: u32,
        batch_attempts: u32,
        event_attempts: u32,
        fail_sends: u32,
        fail_onboard: bool,
        batches: Vec<Vec<BatchRecord>>,
        events: Vec<EventUpload>,
    }

    impl SinkClient for ScriptedSink {
        async fn onboard(&mut self, _credentials: &Credentials) -> Result<Boarding> {
            self.onboard_calls += 1;
            if self.fail_onboard {
                return Err(anyhow!("registration rejected"));
            }
            Ok(Boarding {
                access_token: "token".to_string(),
            })
        }

        async fn fetch_config(&mut self) -> Result<SinkConfig> {
            self.config_calls += 1;
            Ok(SinkConfig {
                configuration_id: "cfg-1".to_string(),
                revision: 1,
            })
        }

        async fn send_batch(&mut self, records: &[BatchRecord]) -> Result<()> {
            self.batch_attempts += 1;
            if self.batch_attempts <= self.fail_sends {
                return Err(anyhow!("sink unavailable"));
            }
            self.batches.push(records.to_vec());
            Ok(())
        }

        async fn send_event(&mut self, event: &EventUpload) -> Result<()> {
            self.event_attempts += 1;
            if self.event_attempts <= self.fail_sends {
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

    fn batch() -> Vec<BatchRecord> {
        vec![BatchRecord {
            tick_id: 10,
            values: [("temp".to_string(), "20.5".to_string())].into(),
        }]
    }

    #[tokio::test]
    async fn test_enable_requires_credentials() {
        let mut uplink = Uplink::new(ScriptedSink::default(), 3);

        let err = uplink.enable_sending().await.expect_err("no credentials");
        assert!(matches!(err, UplinkError::MissingCredentials));
        assert!(!uplink.sending_enabled());
    }

    #[tokio::test]
    async fn test_enable_boards_and_fetches_config_once() {
        let mut uplink = Uplink::new(ScriptedSink::default(), 3);
        uplink.set_credentials(credentials());

        uplink.enable_sending().await.expect("enable");
        assert!(uplink.is_ready_to_send());
        assert!(uplink.sending_enabled());

        // Re-enabling skips both steps.
        uplink.disable_sending();
        uplink.enable_sending().await.expect("re-enable");
        assert_eq!(uplink.client().onboard_calls, 1);
        assert_eq!(uplink.client().config_calls, 1);
    }

    #[tokio::test]
    async fn test_enable_failure_keeps_prior_state() {
        let client = ScriptedSink {
            fail_onboard: true,
            ..Default::default()
        };
        let mut uplink = Uplink::new(client, 3);
        uplink.set_credentials(credentials());

        let err = uplink.enable_sending().await.expect_err("onboard fails");
        assert!(matches!(err, UplinkError::Onboarding(_)));
        assert!(!uplink.sending_enabled());
        assert!(!uplink.is_ready_to_send());
    }

    #[tokio::test]
    async fn test_new_credentials_force_reboarding() {
        let mut uplink = Uplink::new(ScriptedSink::default(), 3);
        uplink.set_credentials(credentials());
        uplink.enable_sending().await.expect("enable");
        assert!(uplink.is_ready_to_send());

        uplink.set_credentials(credentials());
        assert!(!uplink.is_ready_to_send());
        // Enabled state is untouched by a credential change.
        assert!(uplink.sending_enabled());

        uplink.enable_sending().await.expect("re-enable");
        assert_eq!(uplink.client().onboard_calls, 2);
        assert_eq!(uplink.client().config_calls, 2);
    }

    #[tokio::test]
    async fn test_send_skipped_when_not_ready() {
        let mut uplink = Uplink::new(ScriptedSink::default(), 3);

        let outcome = uplink.send_batch(&batch()).await.expect("skip");
        assert_eq!(outcome, SendOutcome::Skipped);
        assert_eq!(uplink.client().batch_attempts, 0);
    }

    #[tokio::test]
    async fn test_send_retries_up_to_bound() {
        let client = ScriptedSink {
            fail_sends: 2,
            ..Default::default()
        };
        let mut uplink = Uplink::new(client, 3);
        uplink.set_credentials(credentials());
        uplink.enable_sending().await.expect("enable");

        let outcome = uplink.send_batch(&batch()).await.expect("third attempt");
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(uplink.client().batch_attempts, 3);
        assert_eq!(uplink.client().batches.len(), 1);
    }

    #[tokio::test]
    async fn test_send_exhausts_after_fixed_attempts() {
        let client = ScriptedSink {
            fail_sends: u32::MAX,
            ..Default::default()
        };
        let mut uplink = Uplink::new(client, 3);
        uplink.set_credentials(credentials());
        uplink.enable_sending().await.expect("enable");

        let err = uplink.send_batch(&batch()).await.expect_err("exhausted");
        assert!(matches!(err, UplinkError::SendExhausted { attempts: 3, .. }));
        assert_eq!(uplink.client().batch_attempts, 3);
    }

    #[tokio::test]
    async fn test_send_event_retry_and_success() {
        let client = ScriptedSink {
            fail_sends: 1,
            ..Default::default()
        };
        let mut uplink = Uplink::new(client, 2);
        uplink.set_credentials(credentials());
        uplink.enable_sending().await.expect("enable");

        let event = EventUpload {
            event_id: 1,
            tick_id: 10,
            value: 3.0,
            description: "overpressure".to_string(),
        };
        let outcome = uplink.send_event(&event).await.expect("second attempt");
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(uplink.client().event_attempts, 2);
        assert_eq!(uplink.client().events.len(), 1);
    }
}
