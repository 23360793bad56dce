//! HTTP transport seam
//!
//! The key service client only needs "send these bytes with these headers,
//! give me status and body back". Timeouts and connection reuse belong to the
//! transport; the default one is a blocking `ureq` agent.

use std::io::Read;
use std::time::Duration;

use cgpi_core::config::HttpConfig;
use cgpi_core::{CgpiError, CgpiResult};

use crate::signature::{Method, SignedHeaders};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL, e.g. `https://api.cryptograpi.com/api/v0/encryption/key`
    pub url: String,
    /// Path used in the `(request-target)` of the signature
    pub path: String,
    pub headers: SignedHeaders,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text for error messages, truncated.
    pub fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(200).collect()
    }
}

/// Sends a signed request. Any response, including 4xx/5xx, is `Ok`;
/// only failures to get a response at all map to `KeyServiceUnreachable`.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> CgpiResult<HttpResponse>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .timeout_write(Duration::from_secs(config.write_timeout_secs))
            .build();
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> CgpiResult<HttpResponse> {
        let mut req = self.agent.request(request.method.as_str(), &request.url);
        for (name, value) in request.headers.iter() {
            req = req.set(name, value);
        }

        let resp = match req.send_bytes(&request.body) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(_, resp)) => resp,
            Err(ureq::Error::Transport(e)) => {
                return Err(CgpiError::KeyServiceUnreachable(format!(
                    "{} {}: {e}",
                    request.method.as_str(),
                    request.url
                )));
            }
        };

        let status = resp.status();
        let mut body = Vec::new();
        resp.into_reader().read_to_end(&mut body).map_err(|e| {
            CgpiError::KeyServiceUnreachable(format!("reading response from {}: {e}", request.url))
        })?;

        tracing::debug!(
            method = request.method.as_str(),
            url = %request.url,
            status,
            "key service responded"
        );
        Ok(HttpResponse { status, body })
    }
}
