//! HMAC-SHA512 HTTP request signing for the key service
//!
//! Canonical signing string (one line per header present, fixed order):
//! ```text
//! content-type: application/json
//! date: Tue, 14 Nov 2023 22:13:20 GMT
//! host: api.cryptograpi.com
//! (created): 1700000000
//! (request-target): post /api/v0/encryption/key
//! digest: SHA-512=<base64(sha512(body))>
//! ```
//!
//! The pseudo-headers `(created)` and `(request-target)` take part in the
//! HMAC but are never sent on the wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cgpi_core::{CgpiError, CgpiResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};

type HmacSha512 = Hmac<Sha512>;

pub const CONTENT_TYPE: &str = "application/json";

/// Headers covered by the signature, in signing order.
pub const SIGNED_HEADERS: [&str; 6] = [
    "content-type",
    "date",
    "host",
    "(created)",
    "(request-target)",
    "digest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Patch => "PATCH",
        }
    }

    fn target_verb(&self) -> &'static str {
        match self {
            Method::Post => "post",
            Method::Patch => "patch",
        }
    }
}

/// Headers to transmit, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedHeaders {
    entries: Vec<(&'static str, String)>,
}

impl SignedHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (*n, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Signs key service requests with the caller's signing key.
pub struct RequestSigner {
    access_key_id: String,
    signing_key: SecretString,
    user_agent: String,
}

impl RequestSigner {
    pub fn new(access_key_id: &str, signing_key: &SecretString, user_agent: &str) -> CgpiResult<Self> {
        if access_key_id.is_empty() {
            return Err(CgpiError::InvalidCredentials("empty access key id".into()));
        }
        if signing_key.expose_secret().is_empty() {
            return Err(CgpiError::InvalidCredentials("empty signing key".into()));
        }
        Ok(Self {
            access_key_id: access_key_id.to_string(),
            signing_key: SecretString::from(signing_key.expose_secret().to_owned()),
            user_agent: user_agent.to_string(),
        })
    }

    pub fn sign(&self, method: Method, path: &str, host: &str, body: &[u8]) -> CgpiResult<SignedHeaders> {
        self.sign_at(method, path, host, body, Utc::now())
    }

    /// Sign with an explicit clock. Output is fully determined by the inputs.
    pub fn sign_at(
        &self,
        method: Method,
        path: &str,
        host: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> CgpiResult<SignedHeaders> {
        let created = now.timestamp().to_string();
        let date = format_date(now);
        let host = host_header(host);
        let digest = body_digest(body);
        let request_target = format!("{} {}", method.target_verb(), path);

        let fields: [(&str, &str); 6] = [
            ("content-type", CONTENT_TYPE),
            ("date", &date),
            ("host", &host),
            ("(created)", &created),
            ("(request-target)", &request_target),
            ("digest", &digest),
        ];

        let mut mac = HmacSha512::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .map_err(|e| CgpiError::InvalidCredentials(format!("signing key rejected: {e}")))?;
        mac.update(canonical_string(&fields).as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let signature_header = format!(
            "keyId=\"{}\", algorithm=\"hmac-sha512\", created={}, headers=\"{}\", signature={}",
            self.access_key_id,
            created,
            SIGNED_HEADERS.join(" "),
            signature
        );

        tracing::trace!(method = method.as_str(), path, "signed key service request");

        Ok(SignedHeaders {
            entries: vec![
                ("user-agent", self.user_agent.clone()),
                ("content-type", CONTENT_TYPE.to_string()),
                ("date", date),
                ("host", host),
                ("digest", digest),
                ("signature", signature_header),
            ],
        })
    }
}

/// `"<name>: <value>\n"` for each signed header present, in [`SIGNED_HEADERS`] order.
pub fn canonical_string(fields: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for name in SIGNED_HEADERS {
        if let Some((_, value)) = fields.iter().find(|(n, _)| *n == name) {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}

/// `SHA-512=<base64(sha512(body))>`
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-512={}", BASE64.encode(Sha512::digest(body)))
}

/// RFC 7231 date in GMT, e.g. `Tue, 14 Nov 2023 22:13:20 GMT`.
pub fn format_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Host header value: the hostname, plus `:port` only when the configured
/// host spells one out.
pub fn host_header(host: &str) -> String {
    let rest = host.split_once("://").map(|(_, r)| r).unwrap_or(host);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority
        .rsplit_once('@')
        .map(|(_, a)| a)
        .unwrap_or(authority);
    authority.to_ascii_lowercase()
}
