//! Streaming encryption engine
//!
//! ```text
//! open ─► Idle ─begin─► Started ─finish─► Finished ─begin─► Started ...
//!           │                                 │
//!           └──────────── close ──────────────┴─► Closed
//! ```
//! Output of one stream: `header || update()* || finish()`.

use cgpi_client::KeyServiceClient;
use cgpi_core::{CgpiError, CgpiResult, ClientConfig, Credentials};

use crate::cipher::{self, resolve_by_name};
use crate::header::FrameHeader;
use crate::session::KeySession;
use crate::unwrap::{decode_encrypted_key, unwrap_data_key};
use crate::EngineState;

pub struct Encryption {
    client: KeyServiceClient,
    session: Option<KeySession>,
    state: EngineState,
}

impl Encryption {
    /// Obtain a data key good for `uses` streams over the default transport.
    pub fn open(config: &ClientConfig, credentials: &Credentials, uses: u32) -> CgpiResult<Self> {
        let client = KeyServiceClient::new(config, credentials)?;
        Self::with_client(client, uses)
    }

    pub fn with_client(client: KeyServiceClient, uses: u32) -> CgpiResult<Self> {
        client.credentials().validate()?;

        let resp = client.request_encryption_key(uses)?;
        let algorithm = resolve_by_name(&resp.security_model.algorithm)?;
        let encrypted_key = decode_encrypted_key(&resp.encrypted_data_key)?;
        let raw_key = unwrap_data_key(
            &resp.encrypted_private_key,
            &resp.wrapped_data_key,
            client.credentials().secret_access_key(),
        )?;
        if raw_key.len() != algorithm.key_length {
            return Err(CgpiError::InvalidKeyLength {
                expected: algorithm.key_length,
                actual: raw_key.len(),
            });
        }

        tracing::info!(
            fingerprint = %resp.key_fingerprint,
            algorithm = algorithm.name,
            max_uses = resp.max_uses,
            "encryption session opened"
        );

        let session = KeySession::new(
            resp.key_fingerprint,
            resp.encryption_session,
            algorithm,
            raw_key,
            encrypted_key,
            resp.max_uses,
        );

        Ok(Self {
            client,
            session: Some(session),
            state: EngineState::Idle,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> Option<&KeySession> {
        self.session.as_ref()
    }

    /// Start a stream and return the header to emit before any ciphertext.
    pub fn begin(&mut self) -> CgpiResult<Vec<u8>> {
        match self.state {
            EngineState::Closed => return Err(CgpiError::NotReady),
            EngineState::Started => return Err(CgpiError::AlreadyStarted),
            EngineState::Idle | EngineState::Finished => {}
        }
        let session = self.session.as_mut().ok_or(CgpiError::NotReady)?;
        if session.is_exhausted() {
            return Err(CgpiError::UsageExceeded {
                uses: session.uses(),
                max_uses: session.max_uses(),
            });
        }

        let algorithm = *session.algorithm();
        let (mut ctx, iv) = cipher::make_encryptor(&algorithm, session.raw_key(), None)?;
        let header = FrameHeader::new(algorithm.id, iv, session.encrypted_key().to_vec());
        let bytes = header.encode()?;
        if header.has_aead_auth() {
            ctx.set_aad(&bytes)?;
        }

        session.record_use()?;
        session.activate(ctx);
        self.state = EngineState::Started;
        tracing::debug!(uses = session.uses(), max_uses = session.max_uses(), "encryption started");
        Ok(bytes)
    }

    pub fn update(&mut self, plaintext: &[u8]) -> CgpiResult<Vec<u8>> {
        if self.state != EngineState::Started {
            return Err(CgpiError::NotStarted);
        }
        let ctx = self
            .session
            .as_mut()
            .and_then(KeySession::active_mut)
            .ok_or(CgpiError::NotStarted)?;
        let result = ctx.update(plaintext);
        result.map_err(|e| self.abort(e))
    }

    /// End the stream; returns the authentication tag.
    pub fn finish(&mut self) -> CgpiResult<Vec<u8>> {
        if self.state != EngineState::Started {
            return Err(CgpiError::NotStarted);
        }
        let ctx = self
            .session
            .as_mut()
            .and_then(KeySession::take_active)
            .ok_or(CgpiError::NotStarted)?;

        match ctx.finalize_tag() {
            Ok(tag) => {
                self.state = EngineState::Finished;
                Ok(tag)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Report unused key capacity and drop the key. Closing twice is a no-op.
    pub fn close(&mut self) -> CgpiResult<()> {
        match self.state {
            EngineState::Started => return Err(CgpiError::EngineBusy),
            EngineState::Closed => return Ok(()),
            EngineState::Idle | EngineState::Finished => {}
        }
        self.release_session();
        self.state = EngineState::Closed;
        Ok(())
    }

    fn release_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.uses() < session.max_uses() {
            if let Err(e) = self.client.report_encryption_usage(
                session.fingerprint(),
                session.session(),
                session.max_uses(),
                session.uses(),
            ) {
                tracing::warn!(
                    fingerprint = session.fingerprint(),
                    "encryption usage report failed (continuing): {e}"
                );
            }
        }
        tracing::debug!(fingerprint = session.fingerprint(), uses = session.uses(), "encryption session closed");
    }

    /// Tear the engine down after a mid-stream failure and hand back the error.
    fn abort(&mut self, err: CgpiError) -> CgpiError {
        if let Some(session) = self.session.as_mut() {
            session.take_active();
        }
        self.state = EngineState::Idle;
        if let Err(close_err) = self.close() {
            tracing::warn!("close after failed encryption also failed: {close_err}");
        }
        err
    }
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption")
            .field("state", &self.state)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
