use std::time::{Duration, Instant};

use tracing::{info, warn};

use taskgate_provider_core::{TransportError, UpstreamRequest, UpstreamResponse};

use crate::client::shared_client;

/// Send one upstream call bounded by `timeout`. A non-2xx answer is read in
/// full and returned as `TransportError::Status` so the body is not lost.
pub async fn send_with_logging(
    provider: &str,
    op: &str,
    request: UpstreamRequest,
    timeout: Duration,
) -> Result<UpstreamResponse, TransportError> {
    let client = shared_client()?;
    let started_at = Instant::now();
    info!(
        event = "upstream_request",
        provider = %provider,
        op = %op,
        method = %request.method,
        url = %request.url
    );

    let exchange = async {
        let response = client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone())
            .body(request.body.to_vec())
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok::<_, TransportError>(UpstreamResponse {
            status,
            headers,
            body,
        })
    };

    let response = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(
                event = "upstream_response",
                provider = %provider,
                op = %op,
                status = "error",
                elapsed_ms = started_at.elapsed().as_millis(),
                error = %err
            );
            return Err(err);
        }
        Err(_) => {
            warn!(
                event = "upstream_response",
                provider = %provider,
                op = %op,
                status = "timeout",
                elapsed_ms = started_at.elapsed().as_millis()
            );
            return Err(TransportError::Timeout(timeout));
        }
    };

    if !response.status.is_success() {
        warn!(
            event = "upstream_response",
            provider = %provider,
            op = %op,
            status = %response.status.as_u16(),
            elapsed_ms = started_at.elapsed().as_millis(),
            body = %String::from_utf8_lossy(&response.body)
        );
        return Err(TransportError::Status {
            status: response.status,
            body: response.body,
        });
    }

    info!(
        event = "upstream_response",
        provider = %provider,
        op = %op,
        status = %response.status.as_u16(),
        elapsed_ms = started_at.elapsed().as_millis()
    );
    Ok(response)
}

pub fn build_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get(url: String) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn build_url_joins_without_double_slash() {
        assert_eq!(build_url("https://ark.example/", "/api/v3"), "https://ark.example/api/v3");
        assert_eq!(build_url("https://ark.example", "api/v3"), "https://ark.example/api/v3");
    }

    #[tokio::test]
    async fn error_status_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = send_with_logging(
            "test",
            "test.get",
            get(format!("{}/boom", server.uri())),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert_matches!(err, TransportError::Status { status, body } => {
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(&body[..], b"overloaded");
        });
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = send_with_logging(
            "test",
            "test.get",
            get(format!("{}/slow", server.uri())),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert_matches!(err, TransportError::Timeout(_));
    }
}
