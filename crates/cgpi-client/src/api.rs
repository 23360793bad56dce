//! Key service endpoints
//!
//! | call                          | method | path                                   | success |
//! | ----------------------------- | ------ | -------------------------------------- | ------- |
//! | fresh data key                | POST   | `/encryption/key`                      | 201     |
//! | data key for a stored header  | POST   | `/decryption/key`                      | 200     |
//! | encryption usage report       | PATCH  | `/encryption/key/<fingerprint>/<sess>` | 2xx     |
//! | decryption usage report       | PATCH  | `/decryption/key/<fingerprint>/<sess>` | 2xx     |

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cgpi_core::{CgpiError, CgpiResult, ClientConfig, Credentials};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::signature::{Method, RequestSigner};
use crate::transport::{HttpRequest, HttpResponse, Transport, UreqTransport};

pub const STATUS_OK: u16 = 200;
pub const STATUS_CREATED: u16 = 201;

#[derive(Debug, Serialize)]
struct EncryptionKeyRequest {
    uses: u32,
}

#[derive(Debug, Serialize)]
struct DecryptionKeyRequest<'a> {
    encrypted_data_key: &'a str,
}

#[derive(Debug, Serialize)]
struct EncryptionUsageReport {
    actual: u32,
    requested: u32,
}

#[derive(Debug, Serialize)]
struct DecryptionUsageReport {
    uses: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityModel {
    pub algorithm: String,
}

/// Response to `POST /encryption/key`.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionKeyResponse {
    pub key_fingerprint: String,
    pub encryption_session: String,
    pub security_model: SecurityModel,
    pub max_uses: u32,
    /// Base64 data key encrypted by the service; embedded in every header.
    pub encrypted_data_key: String,
    /// PEM private key, encrypted with the caller's secret access key.
    pub encrypted_private_key: String,
    /// Base64 data key wrapped to the caller's public key.
    pub wrapped_data_key: String,
}

/// Response to `POST /decryption/key`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecryptionKeyResponse {
    pub key_fingerprint: String,
    pub encryption_session: String,
    pub encrypted_private_key: String,
    pub wrapped_data_key: String,
}

/// Signed client for the key service. Cheap to clone.
#[derive(Clone)]
pub struct KeyServiceClient {
    transport: Arc<dyn Transport>,
    signer: Arc<RequestSigner>,
    credentials: Credentials,
    config: ClientConfig,
}

impl KeyServiceClient {
    /// Client over the default blocking HTTP transport.
    pub fn new(config: &ClientConfig, credentials: &Credentials) -> CgpiResult<Self> {
        let transport = Arc::new(UreqTransport::new(&config.http));
        Self::with_transport(config, credentials, transport)
    }

    pub fn with_transport(
        config: &ClientConfig,
        credentials: &Credentials,
        transport: Arc<dyn Transport>,
    ) -> CgpiResult<Self> {
        credentials.validate()?;
        let signer = RequestSigner::new(
            credentials.access_key_id(),
            credentials.signing_key(),
            &config.service.user_agent,
        )?;
        Ok(Self {
            transport,
            signer: Arc::new(signer),
            credentials: credentials.clone(),
            config: config.clone(),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask for a fresh data key good for `uses` encryptions.
    pub fn request_encryption_key(&self, uses: u32) -> CgpiResult<EncryptionKeyResponse> {
        let resp = self.call(
            Method::Post,
            "encryption/key",
            &EncryptionKeyRequest { uses },
        )?;
        expect_status(&resp, STATUS_CREATED)?;
        let key: EncryptionKeyResponse = decode(&resp)?;
        tracing::debug!(
            fingerprint = %key.key_fingerprint,
            max_uses = key.max_uses,
            algorithm = %key.security_model.algorithm,
            "obtained encryption key"
        );
        Ok(key)
    }

    /// Ask the service to release the data key behind a stored header.
    pub fn request_decryption_key(&self, encrypted_data_key: &[u8]) -> CgpiResult<DecryptionKeyResponse> {
        let encoded = BASE64.encode(encrypted_data_key);
        let resp = self.call(
            Method::Post,
            "decryption/key",
            &DecryptionKeyRequest {
                encrypted_data_key: &encoded,
            },
        )?;
        expect_status(&resp, STATUS_OK)?;
        let key: DecryptionKeyResponse = decode(&resp)?;
        tracing::debug!(fingerprint = %key.key_fingerprint, "obtained decryption key");
        Ok(key)
    }

    pub fn report_encryption_usage(
        &self,
        fingerprint: &str,
        session: &str,
        requested: u32,
        actual: u32,
    ) -> CgpiResult<()> {
        let resp = self.call(
            Method::Patch,
            &format!("encryption/key/{fingerprint}/{session}"),
            &EncryptionUsageReport { actual, requested },
        )?;
        expect_success(&resp)?;
        tracing::debug!(fingerprint, requested, actual, "reported encryption key usage");
        Ok(())
    }

    pub fn report_decryption_usage(&self, fingerprint: &str, session: &str, uses: u32) -> CgpiResult<()> {
        let resp = self.call(
            Method::Patch,
            &format!("decryption/key/{fingerprint}/{session}"),
            &DecryptionUsageReport { uses },
        )?;
        expect_success(&resp)?;
        tracing::debug!(fingerprint, uses, "reported decryption key usage");
        Ok(())
    }

    fn call<B: Serialize>(&self, method: Method, endpoint: &str, body: &B) -> CgpiResult<HttpResponse> {
        let path = self.config.endpoint(endpoint);
        let body = serde_json::to_vec(body)
            .map_err(|e| CgpiError::Crypto(format!("encoding request body: {e}")))?;
        let headers = self
            .signer
            .sign(method, &path, self.credentials.host(), &body)?;

        let request = HttpRequest {
            method,
            url: format!("{}{}", self.credentials.host(), path),
            path,
            headers,
            body,
        };
        self.transport.send(&request)
    }
}

fn expect_status(resp: &HttpResponse, expected: u16) -> CgpiResult<()> {
    if resp.status == expected {
        Ok(())
    } else {
        Err(CgpiError::KeyServiceError {
            status: resp.status,
            message: format!("expected {expected}: {}", resp.body_excerpt()),
        })
    }
}

fn expect_success(resp: &HttpResponse) -> CgpiResult<()> {
    if resp.is_success() {
        Ok(())
    } else {
        Err(CgpiError::KeyServiceError {
            status: resp.status,
            message: resp.body_excerpt(),
        })
    }
}

fn decode<T: DeserializeOwned>(resp: &HttpResponse) -> CgpiResult<T> {
    serde_json::from_slice(&resp.body).map_err(|e| CgpiError::KeyServiceError {
        status: resp.status,
        message: format!("malformed response body: {e}"),
    })
}
