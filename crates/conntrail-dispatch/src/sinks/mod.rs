//! Sink adapters and their construction from configuration.

pub mod endpoint;
pub mod search_index;
pub mod syslog;

use std::net::SocketAddr;
use std::time::Duration;

use conntrail_common::config::SinkTarget;
use reqwest::{StatusCode, Url};

use crate::error::{Result, SinkError};
use crate::sink::{DeliveryOutcome, Sink};

/// Builds the adapter for a configured sink.
///
/// # Errors
///
/// Returns a [`SinkError`] if the sink cannot be prepared, for example when
/// `/dev/log` is unreachable or a URL does not parse.
pub async fn connect(target: &SinkTarget, request_timeout: Duration) -> Result<Box<dyn Sink>> {
    let name = target.display_name();
    let sink: Box<dyn Sink> = match target {
        SinkTarget::SyslogLocal { path } => Box::new(syslog::SyslogSink::local(name, path)?),
        SinkTarget::SyslogTcp { address } => Box::new(syslog::SyslogSink::tcp(name, *address)),
        SinkTarget::SyslogUdp { address } => Box::new(syslog::SyslogSink::udp(name, *address).await?),
        SinkTarget::SearchIndex { url, index } => Box::new(search_index::SearchIndexSink::new(
            name,
            url,
            index,
            request_timeout,
        )?),
        SinkTarget::CustomEndpoint { url } => {
            Box::new(endpoint::EndpointSink::new(name, url, request_timeout)?)
        }
    };
    Ok(sink)
}

/// Resolves the remote addresses a network sink delivers to, so that traffic
/// towards them can be recognised as the agent's own. Local sinks and
/// unresolvable hosts yield nothing.
pub async fn remote_endpoints(target: &SinkTarget) -> Vec<SocketAddr> {
    match target {
        SinkTarget::SyslogLocal { .. } => Vec::new(),
        SinkTarget::SyslogTcp { address } | SinkTarget::SyslogUdp { address } => vec![*address],
        SinkTarget::SearchIndex { url, .. } | SinkTarget::CustomEndpoint { url } => {
            let Ok(url) = parse_base_url(url) else {
                return Vec::new();
            };
            let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
                return Vec::new();
            };
            let host = host.trim_start_matches('[').trim_end_matches(']');
            match tokio::net::lookup_host((host, port)).await {
                Ok(addresses) => addresses.collect(),
                Err(e) => {
                    tracing::warn!(%url, error = %e, "cannot resolve sink host for self-traffic filtering");
                    Vec::new()
                }
            }
        }
    }
}

/// Parses a base URL, normalising away a trailing slash.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim_end_matches('/');
    Url::parse(trimmed).map_err(|e| SinkError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

/// Builds the HTTP client shared by the HTTP adapters of one sink.
pub(crate) fn http_client(request_timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("conntrail/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Maps a network error to an outcome: every transport failure is transient.
pub(crate) fn classify_error(sink: &str, error: &reqwest::Error) -> DeliveryOutcome {
    tracing::debug!(sink, error = %error, "http delivery failed");
    DeliveryOutcome::RetryLater
}

/// Maps a response status: rate limiting and server errors are transient,
/// any other status not in `accepted` is a permanent rejection.
pub(crate) fn classify_status(
    sink: &str,
    status: StatusCode,
    accepted: impl Fn(StatusCode) -> bool,
) -> DeliveryOutcome {
    if accepted(status) {
        DeliveryOutcome::Delivered
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        tracing::debug!(sink, %status, "backend busy");
        DeliveryOutcome::RetryLater
    } else {
        tracing::debug!(sink, %status, "backend rejected event");
        DeliveryOutcome::DropPermanent
    }
}

/// Serializes a record for an HTTP body, dropping records that cannot be
/// encoded.
pub(crate) fn json_body(
    sink: &str,
    record: &conntrail_common::record::EventRecord,
) -> std::result::Result<String, DeliveryOutcome> {
    record.to_json().map_err(|e| {
        tracing::debug!(sink, error = %e, "cannot encode event");
        DeliveryOutcome::DropPermanent
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let accepted = |s: StatusCode| s.is_success();
        assert_eq!(classify_status("t", StatusCode::OK, accepted), DeliveryOutcome::Delivered);
        assert_eq!(classify_status("t", StatusCode::TOO_MANY_REQUESTS, accepted), DeliveryOutcome::RetryLater);
        assert_eq!(classify_status("t", StatusCode::BAD_GATEWAY, accepted), DeliveryOutcome::RetryLater);
        assert_eq!(classify_status("t", StatusCode::BAD_REQUEST, accepted), DeliveryOutcome::DropPermanent);
        assert_eq!(classify_status("t", StatusCode::NOT_FOUND, accepted), DeliveryOutcome::DropPermanent);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let url = parse_base_url("http://127.0.0.1:9200/").expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:9200/");
        assert!(parse_base_url("not a url").is_err());
    }

    #[tokio::test]
    async fn remote_endpoints_for_network_sinks() {
        let tcp = SinkTarget::SyslogTcp {
            address: "10.0.0.5:514".parse().unwrap(),
        };
        assert_eq!(remote_endpoints(&tcp).await, vec!["10.0.0.5:514".parse().unwrap()]);

        let http = SinkTarget::CustomEndpoint {
            url: "http://127.0.0.1:8080".into(),
        };
        assert_eq!(remote_endpoints(&http).await, vec!["127.0.0.1:8080".parse().unwrap()]);

        let https = SinkTarget::SearchIndex {
            url: "https://127.0.0.1".into(),
            index: "connections".into(),
        };
        assert_eq!(remote_endpoints(&https).await, vec!["127.0.0.1:443".parse().unwrap()]);

        let local = SinkTarget::SyslogLocal {
            path: "/dev/log".into(),
        };
        assert!(remote_endpoints(&local).await.is_empty());
    }
}
