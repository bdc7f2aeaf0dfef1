//! HTTP Analyzer Implementation
//!
//! Integration with a document-analysis service that speaks JSON over HTTP.
//!
//! # Wire format
//!
//! `POST {endpoint}/analyze` with
//!
//! ```json
//! { "modelId": "prebuilt-layout", "base64Source": "JVBERi0xLjQK..." }
//! ```
//!
//! and a successful response of
//!
//! ```json
//! { "fields": { "InvoiceTotal": { "value": "12.00", "confidence": 0.97 } } }
//! ```
//!
//! # Status mapping
//!
//! | Response                     | Error                                  |
//! |------------------------------|----------------------------------------|
//! | 429                          | `RateLimited` (honours `Retry-After`)  |
//! | 404                          | `ModelNotAvailable`                    |
//! | 408, 5xx                     | `Unavailable` (transient)              |
//! | other 4xx                    | `Rejected` (permanent)                 |
//! | connect / timeout failures   | `Communication` / `Timeout`            |
//! | unparseable body             | `InvalidResponse`                      |
//!
//! # Examples
//!
//! ```no_run
//! use formflow_analysis::HttpAnalyzer;
//!
//! let analyzer = HttpAnalyzer::new("http://localhost:5050")
//!     .unwrap()
//!     .with_api_key("secret");
//! ```

use crate::AnalysisError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use formflow_domain::{DocumentAnalyzer, ExtractedFields};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default HTTP request timeout (120 seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Header carrying the API key, when one is configured
pub const API_KEY_HEADER: &str = "x-api-key";

/// Analysis provider backed by an HTTP service
pub struct HttpAnalyzer {
    endpoint: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

/// Request body for the analyze API
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    model_id: &'a str,
    base64_source: String,
}

/// Response from the analyze API
#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    fields: BTreeMap<String, AnalyzedField>,
}

#[derive(Deserialize)]
struct AnalyzedField {
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl HttpAnalyzer {
    /// Create a new HTTP analyzer
    ///
    /// # Parameters
    ///
    /// - `endpoint`: Base URL of the service (e.g., "http://localhost:5050")
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AnalysisError> {
        Self::with_timeout(endpoint, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a new HTTP analyzer with a custom request timeout
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::Communication(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            api_key: None,
        })
    }

    /// Send an API key with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn analyze_url(&self) -> String {
        format!("{}/analyze", self.endpoint)
    }

    async fn error_for_status(&self, response: reqwest::Response, model_id: &str) -> AnalysisError {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return AnalysisError::RateLimited { retry_after };
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return AnalysisError::ModelNotAvailable(model_id.to_string());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = format!("HTTP {}: {}", status, body);

        if status == reqwest::StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
            AnalysisError::Unavailable(message)
        } else {
            AnalysisError::Rejected(message)
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout(e.to_string())
        } else if e.is_decode() {
            AnalysisError::InvalidResponse(e.to_string())
        } else {
            AnalysisError::Communication(format!("Request failed: {}", e))
        }
    }
}

fn into_extracted(response: AnalyzeResponse) -> ExtractedFields {
    let mut extracted = ExtractedFields::new();
    for (name, field) in response.fields {
        let value = match field.value {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
        };
        extracted.insert(name, value, field.confidence.unwrap_or(0.0));
    }
    extracted
}

#[async_trait]
impl DocumentAnalyzer for HttpAnalyzer {
    type Error = AnalysisError;

    async fn analyze(&self, document: &[u8], model_id: &str) -> Result<ExtractedFields, Self::Error> {
        let body = AnalyzeRequest {
            model_id,
            base64_source: BASE64.encode(document),
        };

        let mut request = self.client.post(self.analyze_url()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        tracing::debug!(model_id, bytes = document.len(), "Sending document for analysis");

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.error_for_status(response, model_id).await);
        }

        let text = response.text().await?;
        let parsed: AnalyzeResponse = serde_json::from_str(&text).map_err(|e| {
            AnalysisError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        Ok(into_extracted(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formflow_domain::{Classify, FailureClass};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP response on a random local port
    async fn serve_once(status_line: &'static str, headers: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                headers,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    #[test]
    fn test_http_analyzer_creation() {
        let analyzer = HttpAnalyzer::new("http://localhost:5050/").unwrap();
        assert_eq!(analyzer.endpoint, "http://localhost:5050");
        assert_eq!(analyzer.analyze_url(), "http://localhost:5050/analyze");
        assert!(analyzer.api_key.is_none());
    }

    #[test]
    fn test_request_body_shape() {
        let body = AnalyzeRequest {
            model_id: "prebuilt-layout",
            base64_source: BASE64.encode(b"%PDF"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["modelId"], "prebuilt-layout");
        assert_eq!(json["base64Source"], "JVBERg==");
    }

    #[test]
    fn test_response_conversion_skips_nulls_and_stringifies() {
        let parsed: AnalyzeResponse = serde_json::from_str(
            r#"{"fields": {
                "name": {"value": "Ada", "confidence": 0.91},
                "amount": {"value": 12.5, "confidence": 1.4},
                "missing": {"value": null, "confidence": 0.2}
            }}"#,
        )
        .unwrap();
        let fields = into_extracted(parsed);

        assert_eq!(fields.len(), 2);
        assert_eq!(fields.fields["name"], "Ada");
        assert_eq!(fields.fields["amount"], "12.5");
        assert_eq!(fields.confidence["amount"].value(), 1.0);
    }

    #[tokio::test]
    async fn test_success_response() {
        let url = serve_once(
            "200 OK",
            "Content-Type: application/json\r\n",
            r#"{"fields":{"name":{"value":"Ada","confidence":0.9}}}"#,
        )
        .await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let fields = analyzer.analyze(b"%PDF-1.4", "prebuilt-layout").await.unwrap();
        assert_eq!(fields.fields["name"], "Ada");
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let url = serve_once("429 Too Many Requests", "Retry-After: 7\r\n", "slow down").await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let err = analyzer.analyze(b"%PDF-1.4", "m").await.unwrap_err();
        assert_eq!(err.class(), FailureClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = serve_once("503 Service Unavailable", "", "busy").await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let err = analyzer.analyze(b"%PDF-1.4", "m").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Unavailable(_)));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let url = serve_once("400 Bad Request", "", "not a pdf").await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let err = analyzer.analyze(b"garbage", "m").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Rejected(_)));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let url = serve_once("404 Not Found", "", "").await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let err = analyzer.analyze(b"%PDF-1.4", "no-such-model").await.unwrap_err();
        assert_eq!(err, AnalysisError::ModelNotAvailable("no-such-model".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let url = serve_once("200 OK", "", "{not json").await;
        let analyzer = HttpAnalyzer::new(url).unwrap();

        let err = analyzer.analyze(b"%PDF-1.4", "m").await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let analyzer = HttpAnalyzer::new(format!("http://{}", addr)).unwrap();
        let err = analyzer.analyze(b"%PDF-1.4", "m").await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Transient);
    }
}
