//! Custom collector adapter.
//!
//! The phase travels in the path: `POST {url}/connections/open` and
//! `POST {url}/connections/close`, each with the JSON record as body.

use std::time::Duration;

use async_trait::async_trait;
use conntrail_common::record::EventRecord;
use conntrail_common::types::Phase;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;

use super::{classify_error, classify_status, http_client, json_body, parse_base_url};
use crate::error::{Result, SinkError};
use crate::sink::{DeliveryOutcome, Sink};

/// Posts records to a custom collector.
pub struct EndpointSink {
    name: String,
    client: reqwest::Client,
    open_url: Url,
    close_url: Url,
}

fn route(base: &Url, phase: Phase) -> Result<Url> {
    let raw = format!("{}/connections/{phase}", base.as_str().trim_end_matches('/'));
    Url::parse(&raw).map_err(|e| SinkError::InvalidUrl {
        url: raw.clone(),
        message: e.to_string(),
    })
}

impl EndpointSink {
    /// Prepares the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the HTTP client cannot
    /// be built.
    pub fn new(name: String, url: &str, request_timeout: Duration) -> Result<Self> {
        let base = parse_base_url(url)?;
        Ok(Self {
            name,
            client: http_client(request_timeout)?,
            open_url: route(&base, Phase::Open)?,
            close_url: route(&base, Phase::Close)?,
        })
    }
}

#[async_trait]
impl Sink for EndpointSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&mut self, record: &EventRecord) -> DeliveryOutcome {
        let body = match json_body(&self.name, record) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let url = match record.phase {
            Phase::Open => self.open_url.clone(),
            Phase::Close => self.close_url.clone(),
        };
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) => classify_status(&self.name, response.status(), |status| status.is_success()),
            Err(e) => classify_error(&self.name, &e),
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::queue::fixtures::record;

    fn sink(base: &str) -> EndpointSink {
        EndpointSink::new("custom-endpoint".into(), base, Duration::from_secs(2)).expect("sink")
    }

    #[tokio::test]
    async fn phase_selects_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connections/open"))
            .and(body_partial_json(serde_json::json!({"source_port": 10})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connections/close"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut sink = sink(&server.uri());
        assert_eq!(sink.deliver(&record(10, Phase::Open)).await, DeliveryOutcome::Delivered);
        assert_eq!(sink.deliver(&record(10, Phase::Close)).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn base_path_prefix_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/v1/connections/open"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let mut sink = sink(&format!("{}/ingest/v1/", server.uri()));
        assert_eq!(sink.deliver(&record(1, Phase::Open)).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connections/open"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connections/close"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let mut sink = sink(&server.uri());
        assert_eq!(sink.deliver(&record(1, Phase::Open)).await, DeliveryOutcome::RetryLater);
        assert_eq!(sink.deliver(&record(1, Phase::Close)).await, DeliveryOutcome::DropPermanent);
    }
}
