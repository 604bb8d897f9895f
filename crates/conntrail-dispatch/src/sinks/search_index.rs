//! Search/indexing backend adapter.
//!
//! Each record is indexed as its own document with `POST {url}/{index}/_doc`.

use std::time::Duration;

use async_trait::async_trait;
use conntrail_common::record::EventRecord;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};

use super::{classify_error, classify_status, http_client, json_body, parse_base_url};
use crate::error::{Result, SinkError};
use crate::sink::{DeliveryOutcome, Sink};

/// Indexes records into a search backend.
pub struct SearchIndexSink {
    name: String,
    client: reqwest::Client,
    document_url: Url,
}

impl SearchIndexSink {
    /// Prepares the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the HTTP client cannot
    /// be built.
    pub fn new(name: String, url: &str, index: &str, request_timeout: Duration) -> Result<Self> {
        let base = parse_base_url(url)?;
        let raw = format!("{}/{index}/_doc", base.as_str().trim_end_matches('/'));
        let document_url = Url::parse(&raw).map_err(|e| SinkError::InvalidUrl {
            url: raw.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name,
            client: http_client(request_timeout)?,
            document_url,
        })
    }
}

#[async_trait]
impl Sink for SearchIndexSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&mut self, record: &EventRecord) -> DeliveryOutcome {
        let body = match json_body(&self.name, record) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let response = self
            .client
            .post(self.document_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) => classify_status(&self.name, response.status(), |status| {
                status == StatusCode::OK || status == StatusCode::CREATED
            }),
            Err(e) => classify_error(&self.name, &e),
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use conntrail_common::types::Phase;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::queue::fixtures::record;

    fn sink(server: &MockServer) -> SearchIndexSink {
        SearchIndexSink::new(
            "search-index".into(),
            &format!("{}/", server.uri()),
            "connections",
            Duration::from_secs(2),
        )
        .expect("sink")
    }

    #[tokio::test]
    async fn posts_document_to_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connections/_doc"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({"protocol": "TCP", "source_port": 59325})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = sink(&server).deliver(&record(59325, Phase::Open)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn server_errors_and_throttling_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut sink = sink(&server);
        assert_eq!(sink.deliver(&record(1, Phase::Open)).await, DeliveryOutcome::RetryLater);
        assert_eq!(sink.deliver(&record(1, Phase::Open)).await, DeliveryOutcome::RetryLater);
    }

    #[tokio::test]
    async fn client_errors_drop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        assert_eq!(
            sink(&server).deliver(&record(1, Phase::Open)).await,
            DeliveryOutcome::DropPermanent
        );
    }

    #[tokio::test]
    async fn unreachable_backend_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        drop(listener);
        let mut sink = SearchIndexSink::new(
            "search-index".into(),
            &format!("http://{address}"),
            "connections",
            Duration::from_secs(2),
        )
        .expect("sink");
        assert_eq!(sink.deliver(&record(1, Phase::Open)).await, DeliveryOutcome::RetryLater);
    }
}
