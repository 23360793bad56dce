//! In-process stand-in for the cryptograpi key service.
//!
//! Speaks the same JSON contract as the real service, checks every request
//! signature, and records usage reports so tests can assert on them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cgpi_client::signature::{body_digest, canonical_string, CONTENT_TYPE};
use cgpi_client::{HttpRequest, HttpResponse, KeyServiceClient, Method, Transport};
use cgpi_core::{CgpiError, CgpiResult, ClientConfig, Credentials};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::{EncodePrivateKey, LineEnding, PrivateKeyInfo};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha1::Sha1;
use sha2::Sha512;

pub const ACCESS_KEY_ID: &str = "AKIDTEST";
pub const SECRET_ACCESS_KEY: &str = "secret-access-key";
pub const SIGNING_KEY: &str = "signing-key";
pub const HOST: &str = "https://keys.test";

const API_PREFIX: &str = "/api/v0/";

pub fn credentials() -> Credentials {
    Credentials::new(ACCESS_KEY_ID, SECRET_ACCESS_KEY, SIGNING_KEY, HOST)
}

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct RsaFixture {
    public: RsaPublicKey,
    encrypted_pem: String,
}

fn rsa_fixture() -> &'static RsaFixture {
    static FIXTURE: OnceLock<RsaFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate RSA key");
        let der = key.to_pkcs8_der().expect("encode private key");
        let info = PrivateKeyInfo::try_from(der.as_bytes()).expect("parse private key info");
        let params = pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(
            1_000,
            &[0x24; 16],
            &[0x42; 16],
        )
        .expect("pbes2 parameters");
        let doc = info
            .encrypt_with_params(params, SECRET_ACCESS_KEY)
            .expect("encrypt private key");
        let encrypted_pem = doc
            .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
            .expect("PEM encode")
            .to_string();
        RsaFixture {
            public: RsaPublicKey::from(&key),
            encrypted_pem,
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageReport {
    Encryption {
        fingerprint: String,
        session: String,
        requested: u32,
        actual: u32,
    },
    Decryption {
        fingerprint: String,
        session: String,
        uses: u32,
    },
}

struct IssuedKey {
    fingerprint: String,
    session: String,
    data_key: Vec<u8>,
}

#[derive(Default)]
struct ServiceState {
    issued: HashMap<String, IssuedKey>,
    reports: Vec<UsageReport>,
    calls: Vec<(Method, String)>,
    forced_status: Option<u16>,
    unreachable: bool,
    issued_count: u32,
}

pub struct FakeKeyService {
    algorithm: &'static str,
    key_length: usize,
    state: Mutex<ServiceState>,
}

impl FakeKeyService {
    /// `algorithm` is what the service reports, e.g. `"aes-256-gcm"`.
    pub fn new(algorithm: &'static str, key_length: usize) -> Arc<Self> {
        Arc::new(Self {
            algorithm,
            key_length,
            state: Mutex::new(ServiceState::default()),
        })
    }

    pub fn aes128() -> Arc<Self> {
        Self::new("aes-128-gcm", 16)
    }

    pub fn aes256() -> Arc<Self> {
        Self::new("AES-256-GCM", 32)
    }

    pub fn client(self: &Arc<Self>) -> KeyServiceClient {
        KeyServiceClient::with_transport(
            &ClientConfig::default(),
            &credentials(),
            Arc::clone(self) as Arc<dyn Transport>,
        )
        .expect("client with valid credentials")
    }

    /// Answer every following request with this status.
    pub fn force_status(&self, status: Option<u16>) {
        self.state.lock().unwrap().forced_status = status;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Drop every issued key so decryption requests are refused.
    pub fn forget_keys(&self) {
        self.state.lock().unwrap().issued.clear();
    }

    pub fn reports(&self) -> Vec<UsageReport> {
        self.state.lock().unwrap().reports.clone()
    }

    /// `(method, path below /api/v0/)` for every request received.
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, method: Method, endpoint: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(m, p)| *m == method && p == endpoint)
            .count()
    }

    fn verify_signature(&self, request: &HttpRequest) -> Result<(), String> {
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .map(str::to_owned)
                .ok_or_else(|| format!("missing header {name}"))
        };

        if header("content-type")? != CONTENT_TYPE {
            return Err("wrong content-type".into());
        }
        let digest = header("digest")?;
        if digest != body_digest(&request.body) {
            return Err("digest does not match body".into());
        }
        for pseudo in ["(created)", "(request-target)"] {
            if request.headers.get(pseudo).is_some() {
                return Err(format!("pseudo-header {pseudo} transmitted"));
            }
        }

        let signature = header("signature")?;
        let params = parse_signature_params(&signature);
        if params.get("keyId").map(String::as_str) != Some(ACCESS_KEY_ID) {
            return Err("unknown keyId".into());
        }
        if params.get("algorithm").map(String::as_str) != Some("hmac-sha512") {
            return Err("unexpected algorithm".into());
        }
        let created = params.get("created").ok_or("missing created")?;
        let claimed = params.get("signature").ok_or("missing signature")?;

        let date = header("date")?;
        let host = header("host")?;
        let target = format!("{} {}", request.method.as_str().to_lowercase(), request.path);
        let fields: [(&str, &str); 6] = [
            ("content-type", CONTENT_TYPE),
            ("date", &date),
            ("host", &host),
            ("(created)", created),
            ("(request-target)", &target),
            ("digest", &digest),
        ];
        let canonical = canonical_string(&fields);

        let mut mac = Hmac::<Sha512>::new_from_slice(SIGNING_KEY.as_bytes()).unwrap();
        mac.update(canonical.as_bytes());
        let expected = BASE64.encode(mac.finalize().into_bytes());
        if &expected != claimed {
            return Err("signature mismatch".into());
        }
        Ok(())
    }

    fn issue_key(&self, state: &mut ServiceState, body: &Value) -> HttpResponse {
        let Some(uses) = body.get("uses").and_then(Value::as_u64) else {
            return respond(400, json!({ "error": "uses required" }));
        };

        let mut rng = rand::thread_rng();
        let mut data_key = vec![0u8; self.key_length];
        rng.fill_bytes(&mut data_key);
        let mut encrypted = vec![0u8; 48];
        rng.fill_bytes(&mut encrypted);
        let encrypted_data_key = BASE64.encode(&encrypted);

        state.issued_count += 1;
        let fingerprint = format!("fp{:04}", state.issued_count);
        let session = format!("session{:04}", state.issued_count);

        let response = json!({
            "key_fingerprint": fingerprint,
            "encryption_session": session,
            "security_model": { "algorithm": self.algorithm },
            "max_uses": uses,
            "encrypted_data_key": encrypted_data_key,
            "encrypted_private_key": rsa_fixture().encrypted_pem,
            "wrapped_data_key": wrap(&data_key),
        });
        state.issued.insert(
            encrypted_data_key,
            IssuedKey {
                fingerprint,
                session,
                data_key,
            },
        );
        respond(201, response)
    }

    fn release_key(&self, state: &mut ServiceState, body: &Value) -> HttpResponse {
        let Some(encrypted) = body.get("encrypted_data_key").and_then(Value::as_str) else {
            return respond(400, json!({ "error": "encrypted_data_key required" }));
        };
        match state.issued.get(encrypted) {
            Some(key) => respond(
                200,
                json!({
                    "key_fingerprint": key.fingerprint,
                    "encryption_session": key.session,
                    "encrypted_private_key": rsa_fixture().encrypted_pem,
                    "wrapped_data_key": wrap(&key.data_key),
                }),
            ),
            None => respond(404, json!({ "error": "unknown data key" })),
        }
    }

    fn record_report(&self, state: &mut ServiceState, endpoint: &str, body: &Value) -> HttpResponse {
        let parts: Vec<&str> = endpoint.split('/').collect();
        let field = |name: &str| body.get(name).and_then(Value::as_u64).map(|v| v as u32);
        let report = match parts.as_slice() {
            ["encryption", "key", fp, session] => match (field("requested"), field("actual")) {
                (Some(requested), Some(actual)) => UsageReport::Encryption {
                    fingerprint: fp.to_string(),
                    session: session.to_string(),
                    requested,
                    actual,
                },
                _ => return respond(400, json!({ "error": "requested and actual required" })),
            },
            ["decryption", "key", fp, session] => match field("uses") {
                Some(uses) => UsageReport::Decryption {
                    fingerprint: fp.to_string(),
                    session: session.to_string(),
                    uses,
                },
                None => return respond(400, json!({ "error": "uses required" })),
            },
            _ => return respond(404, json!({ "error": "no such endpoint" })),
        };
        state.reports.push(report);
        respond(204, Value::Null)
    }
}

impl Transport for FakeKeyService {
    fn send(&self, request: &HttpRequest) -> CgpiResult<HttpResponse> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(CgpiError::KeyServiceUnreachable("connection refused".into()));
        }

        let endpoint = request
            .path
            .strip_prefix(API_PREFIX)
            .unwrap_or(&request.path)
            .to_string();
        state.calls.push((request.method, endpoint.clone()));

        assert_eq!(request.url, format!("{HOST}{}", request.path));
        if let Err(reason) = self.verify_signature(request) {
            return Ok(respond(401, json!({ "error": reason })));
        }
        if let Some(status) = state.forced_status {
            return Ok(respond(status, json!({ "error": "forced" })));
        }

        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let response = match (request.method, endpoint.as_str()) {
            (Method::Post, "encryption/key") => self.issue_key(&mut state, &body),
            (Method::Post, "decryption/key") => self.release_key(&mut state, &body),
            (Method::Patch, _) => self.record_report(&mut state, &endpoint, &body),
            _ => respond(404, json!({ "error": "no such endpoint" })),
        };
        Ok(response)
    }
}

fn wrap(data_key: &[u8]) -> String {
    let wrapped = rsa_fixture()
        .public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), data_key)
        .expect("OAEP wrap");
    BASE64.encode(wrapped)
}

fn respond(status: u16, body: Value) -> HttpResponse {
    let body = if body.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(&body).unwrap()
    };
    HttpResponse { status, body }
}

/// Split `keyId="a", created=1, ...` into its parameters, unquoting values.
fn parse_signature_params(header: &str) -> HashMap<String, String> {
    header
        .split(", ")
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| {
            // Only the base64 signature value is sent bare.
            let v = if k == "signature" { v } else { v.trim_matches('"') };
            (k.to_string(), v.to_string())
        })
        .collect()
}

/// Feed `data` to `update` in pieces of the given sizes (cycled), collecting output.
pub fn feed<F>(data: &[u8], sizes: &[usize], mut update: F) -> CgpiResult<Vec<u8>>
where
    F: FnMut(&[u8]) -> CgpiResult<Vec<u8>>,
{
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    let mut sizes = sizes.iter().copied().cycle();
    while !rest.is_empty() {
        let n = sizes.next().unwrap_or(rest.len()).clamp(1, rest.len());
        let (chunk, tail) = rest.split_at(n);
        out.extend(update(chunk)?);
        rest = tail;
    }
    Ok(out)
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 7)) as u8).collect()
}
