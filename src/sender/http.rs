use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use super::{BatchRecord, Boarding, Credentials, EventUpload, SinkClient, SinkConfig};

/// Onboarding request body.
#[derive(Debug, Serialize)]
struct OnboardRequest<'a> {
    tenant: &'a str,
    client_id: &'a str,
    shared_secret: &'a str,
}

/// HTTP adapter for the remote telemetry sink.
///
/// Speaks JSON against a base URL; the bearer token obtained from
/// onboarding authorizes all later calls. Each request carries the
/// client-level timeout so a hanging sink turns into a transient error
/// the retry layer can count.
pub struct HttpSinkClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpSinkClient {
    /// Creates a client for the given sink endpoint.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            http,
            base_url,
            access_token: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl SinkClient for HttpSinkClient {
    async fn onboard(&mut self, credentials: &Credentials) -> Result<Boarding> {
        let body = OnboardRequest {
            tenant: &credentials.tenant,
            client_id: &credentials.client_id,
            shared_secret: &credentials.shared_secret,
        };

        let response = self
            .http
            .post(self.url("/api/agents/v1/onboard"))
            .json(&body)
            .send()
            .await
            .context("onboarding request")?
            .error_for_status()
            .context("onboarding rejected")?;

        let boarding: Boarding = response
            .json()
            .await
            .context("parsing onboarding response")?;

        self.access_token = Some(boarding.access_token.clone());

        Ok(boarding)
    }

    async fn fetch_config(&mut self) -> Result<SinkConfig> {
        let response = self
            .authorized(self.http.get(self.url("/api/agents/v1/configuration")))
            .send()
            .await
            .context("configuration request")?
            .error_for_status()
            .context("configuration rejected")?;

        let config: SinkConfig = response
            .json()
            .await
            .context("parsing configuration response")?;

        Ok(config)
    }

    async fn send_batch(&mut self, records: &[BatchRecord]) -> Result<()> {
        self.authorized(self.http.post(self.url("/api/timeseries/v1/batch")))
            .json(records)
            .send()
            .await
            .context("batch upload request")?
            .error_for_status()
            .context("batch upload rejected")?;

        Ok(())
    }

    async fn send_event(&mut self, event: &EventUpload) -> Result<()> {
        self.authorized(self.http.post(self.url("/api/events/v1/event")))
            .json(event)
            .send()
            .await
            .context("event upload request")?
            .error_for_status()
            .context("event upload rejected")?;

        Ok(())
    }
}
