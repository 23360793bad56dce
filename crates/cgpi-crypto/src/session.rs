//! Negotiated data keys and their usage accounting

use cgpi_core::{CgpiError, CgpiResult};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::cipher::{AeadContext, AlgorithmSpec};

/// A raw data encryption key. Zeroized on drop.
pub struct DataKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl DataKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Identity of an encrypted data key as seen in a header: SHA-512 of its bytes.
pub fn key_identity(encrypted_key: &[u8]) -> Vec<u8> {
    Sha512::digest(encrypted_key).to_vec()
}

/// One data key obtained from the key service, owned by a single engine.
///
/// Invariant: `uses <= max_uses`. At most one cipher context is active.
#[derive(Debug)]
pub struct KeySession {
    fingerprint: String,
    session: String,
    algorithm: AlgorithmSpec,
    raw_key: DataKey,
    encrypted_key: Vec<u8>,
    identity: Vec<u8>,
    max_uses: u32,
    uses: u32,
    active: Option<AeadContext>,
}

impl KeySession {
    pub fn new(
        fingerprint: String,
        session: String,
        algorithm: AlgorithmSpec,
        raw_key: DataKey,
        encrypted_key: Vec<u8>,
        max_uses: u32,
    ) -> Self {
        let identity = key_identity(&encrypted_key);
        Self {
            fingerprint,
            session,
            algorithm,
            raw_key,
            encrypted_key,
            identity,
            max_uses,
            uses: 0,
            active: None,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn algorithm(&self) -> &AlgorithmSpec {
        &self.algorithm
    }

    pub fn raw_key(&self) -> &[u8] {
        self.raw_key.as_bytes()
    }

    pub fn encrypted_key(&self) -> &[u8] {
        &self.encrypted_key
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn max_uses(&self) -> u32 {
        self.max_uses
    }

    pub fn is_exhausted(&self) -> bool {
        self.uses >= self.max_uses
    }

    /// Count one use of the key.
    pub fn record_use(&mut self) -> CgpiResult<()> {
        if self.is_exhausted() {
            return Err(CgpiError::UsageExceeded {
                uses: self.uses,
                max_uses: self.max_uses,
            });
        }
        self.uses += 1;
        Ok(())
    }

    pub fn has_active_cipher(&self) -> bool {
        self.active.is_some()
    }

    pub fn activate(&mut self, ctx: AeadContext) {
        debug_assert!(self.active.is_none(), "cipher context already active");
        self.active = Some(ctx);
    }

    pub fn active_mut(&mut self) -> Option<&mut AeadContext> {
        self.active.as_mut()
    }

    pub fn take_active(&mut self) -> Option<AeadContext> {
        self.active.take()
    }
}
