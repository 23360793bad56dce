//! Streaming decryption engine
//!
//! Ciphertext arrives in arbitrary chunks. Bytes are buffered until the whole
//! frame header is present; the header names the algorithm and carries the
//! encrypted data key, which is exchanged with the key service (or matched
//! against the key already held). After that every `update` releases
//! plaintext for all buffered bytes except the last `tag_length`, which may
//! turn out to be the tag once `finish` says no more data follows.

use cgpi_client::KeyServiceClient;
use cgpi_core::{CgpiError, CgpiResult, ClientConfig, Credentials};

use crate::buffer::StreamBuffer;
use crate::cipher::{self, resolve_by_id, AlgorithmSpec};
use crate::header::{parse_header, HeaderParse};
use crate::session::{key_identity, KeySession};
use crate::unwrap::unwrap_data_key;
use crate::EngineState;

pub struct Decryption {
    client: KeyServiceClient,
    session: Option<KeySession>,
    buffer: StreamBuffer,
    state: EngineState,
}

impl Decryption {
    /// Validates credentials; the key service is first contacted when a header arrives.
    pub fn open(config: &ClientConfig, credentials: &Credentials) -> CgpiResult<Self> {
        let client = KeyServiceClient::new(config, credentials)?;
        Self::with_client(client)
    }

    pub fn with_client(client: KeyServiceClient) -> CgpiResult<Self> {
        client.credentials().validate()?;
        Ok(Self {
            client,
            session: None,
            buffer: StreamBuffer::new(),
            state: EngineState::Idle,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> Option<&KeySession> {
        self.session.as_ref()
    }

    pub fn begin(&mut self) -> CgpiResult<()> {
        match self.state {
            EngineState::Closed => return Err(CgpiError::NotReady),
            EngineState::Started => return Err(CgpiError::AlreadyStarted),
            EngineState::Idle | EngineState::Finished => {}
        }
        if self.has_active_cipher() {
            return Err(CgpiError::DecryptionInProgress);
        }
        self.buffer.clear();
        self.state = EngineState::Started;
        Ok(())
    }

    /// Feed ciphertext; returns whatever plaintext can be released so far.
    ///
    /// An empty result only means more input is needed. A malformed header or
    /// a key service failure aborts the engine and is returned as an error.
    pub fn update(&mut self, ciphertext: &[u8]) -> CgpiResult<Vec<u8>> {
        if self.state != EngineState::Started {
            return Err(CgpiError::NotStarted);
        }
        self.buffer.extend(ciphertext);

        if !self.has_active_cipher() {
            match self.start_cipher() {
                Ok(true) => {}
                Ok(false) => return Ok(Vec::new()),
                Err(e) => return Err(self.abort(e)),
            }
        }

        let ctx = self
            .session
            .as_mut()
            .and_then(KeySession::active_mut)
            .ok_or(CgpiError::NotStarted)?;
        let n = self.buffer.releasable(ctx.tag_length());
        match ctx.update(&self.buffer.as_slice()[..n]) {
            Ok(plaintext) => {
                self.buffer.consume(n);
                Ok(plaintext)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Verify the tag held back from the stream. Plaintext is fully released by
    /// `update`, so a successful finish returns no further bytes.
    pub fn finish(&mut self) -> CgpiResult<Vec<u8>> {
        if self.state != EngineState::Started {
            return Err(CgpiError::NotStarted);
        }

        let ctx = self.session.as_mut().and_then(KeySession::take_active);
        let Some(ctx) = ctx else {
            tracing::debug!(buffered = self.buffer.len(), "stream ended inside the header");
            return Err(self.abort(CgpiError::InvalidTag));
        };
        if self.buffer.len() != ctx.tag_length() {
            tracing::debug!(
                buffered = self.buffer.len(),
                tag_length = ctx.tag_length(),
                "stream ended before the tag"
            );
            return Err(self.abort(CgpiError::InvalidTag));
        }

        let tag = self.buffer.as_slice().to_vec();
        self.buffer.clear();
        if let Err(e) = ctx.verify_tag(&tag) {
            tracing::warn!("ciphertext failed authentication");
            return Err(self.abort(e));
        }

        self.state = EngineState::Finished;
        Ok(Vec::new())
    }

    /// Report key usage and drop the key and any buffered bytes. Closing twice is a no-op.
    pub fn close(&mut self) -> CgpiResult<()> {
        match self.state {
            EngineState::Started => return Err(CgpiError::DecryptionInProgress),
            EngineState::Closed => return Ok(()),
            EngineState::Idle | EngineState::Finished => {}
        }
        self.retire_session();
        self.buffer.clear();
        self.state = EngineState::Closed;
        Ok(())
    }

    fn has_active_cipher(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(KeySession::has_active_cipher)
    }

    /// Try to take a header off the front of the buffer and set up a cipher
    /// for it. `Ok(false)` while the header is still incomplete.
    fn start_cipher(&mut self) -> CgpiResult<bool> {
        let (header, raw) = match parse_header(self.buffer.as_slice())? {
            HeaderParse::Incomplete => return Ok(false),
            HeaderParse::Complete { header, raw } => (header, raw),
        };
        self.buffer.consume(raw.len());

        let algorithm = resolve_by_id(header.algorithm_id).ok_or_else(|| {
            CgpiError::InvalidHeader(format!("unknown algorithm id {}", header.algorithm_id))
        })?;

        let identity = key_identity(&header.wrapped_key);
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.identity() != identity.as_slice())
        {
            tracing::debug!("stream uses a different data key, retiring current session");
            self.retire_session();
        }

        let session = match self.session.take() {
            Some(session) => session,
            None => self.fetch_session(algorithm, header.wrapped_key.clone())?,
        };
        let session = self.session.insert(session);

        if session.algorithm().id != algorithm.id {
            return Err(CgpiError::InvalidHeader(format!(
                "algorithm id {} does not match the data key's {}",
                algorithm.id,
                session.algorithm().name
            )));
        }

        let mut ctx = cipher::make_decryptor(&algorithm, session.raw_key(), &header.iv)?;
        if header.has_aead_auth() {
            ctx.set_aad(&raw)?;
        }
        session.record_use()?;
        session.activate(ctx);

        tracing::debug!(
            fingerprint = session.fingerprint(),
            algorithm = algorithm.name,
            uses = session.uses(),
            "decryption header accepted"
        );
        Ok(true)
    }

    fn fetch_session(&self, algorithm: AlgorithmSpec, encrypted_key: Vec<u8>) -> CgpiResult<KeySession> {
        let resp = self.client.request_decryption_key(&encrypted_key)?;
        let raw_key = unwrap_data_key(
            &resp.encrypted_private_key,
            &resp.wrapped_data_key,
            self.client.credentials().secret_access_key(),
        )?;

        tracing::info!(fingerprint = %resp.key_fingerprint, "decryption session opened");

        // The service puts no limit on how often a released key may be used.
        Ok(KeySession::new(
            resp.key_fingerprint,
            resp.encryption_session,
            algorithm,
            raw_key,
            encrypted_key,
            u32::MAX,
        ))
    }

    fn retire_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.uses() > 0 {
            if let Err(e) = self.client.report_decryption_usage(
                session.fingerprint(),
                session.session(),
                session.uses(),
            ) {
                tracing::warn!(
                    fingerprint = session.fingerprint(),
                    "decryption usage report failed (continuing): {e}"
                );
            }
        }
        tracing::debug!(fingerprint = session.fingerprint(), uses = session.uses(), "decryption session closed");
    }

    fn abort(&mut self, err: CgpiError) -> CgpiError {
        if let Some(session) = self.session.as_mut() {
            session.take_active();
        }
        self.buffer.clear();
        self.state = EngineState::Idle;
        if let Err(close_err) = self.close() {
            tracing::warn!("close after failed decryption also failed: {close_err}");
        }
        err
    }
}

impl std::fmt::Debug for Decryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryption")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
