//! cgpi-crypto: streaming envelope encryption against the cryptograpi key service
//!
//! Architecture: one remote data key per engine, AES-GCM per stream
//!
//! Stream layout:
//! ```text
//! Frame Header (version, flags, algorithm id, IV, encrypted data key)
//!   ├── Ciphertext: AES-GCM (key=data key, nonce=random 96-bit, AAD=frame header)
//!   └── Tag: 16 bytes
//! ```
//!
//! Key flow:
//! ```text
//! POST /encryption/key ──► encrypted PKCS#8 private key + RSA-OAEP wrapped data key
//!   └── unwrap locally (passphrase = secret access key) ──► raw data key (zeroized on drop)
//! POST /decryption/key ◄── encrypted data key read back from a header
//! PATCH .../<fingerprint>/<session> ◄── usage report on close
//! ```

pub mod buffer;
pub mod cipher;
pub mod decrypt;
pub mod encrypt;
pub mod header;
pub mod session;
pub mod unwrap;

pub use cipher::{resolve_by_id, resolve_by_name, AeadContext, AlgorithmSpec, AES_128_GCM, AES_256_GCM};
pub use decrypt::Decryption;
pub use encrypt::Encryption;
pub use header::{FrameHeader, FLAG_AEAD_AUTH, HEADER_VERSION};
pub use session::{DataKey, KeySession};

use cgpi_client::KeyServiceClient;
use cgpi_core::{CgpiResult, ClientConfig, Credentials};

/// Lifecycle shared by both engines. `Closed` is terminal and only reachable
/// when no stream is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Started,
    Finished,
    Closed,
}

/// Encrypt `data` as a single stream with a freshly requested data key.
pub fn encrypt(config: &ClientConfig, credentials: &Credentials, data: &[u8]) -> CgpiResult<Vec<u8>> {
    let client = KeyServiceClient::new(config, credentials)?;
    encrypt_with(client, data)
}

pub fn encrypt_with(client: KeyServiceClient, data: &[u8]) -> CgpiResult<Vec<u8>> {
    let uses = client.config().encryption.default_uses;
    let mut engine = Encryption::with_client(client, uses)?;

    let result = (|| -> CgpiResult<Vec<u8>> {
        let mut out = engine.begin()?;
        out.extend(engine.update(data)?);
        out.extend(engine.finish()?);
        Ok(out)
    })();

    close_after(result, || engine.close())
}

/// Decrypt one complete framed stream.
pub fn decrypt(config: &ClientConfig, credentials: &Credentials, data: &[u8]) -> CgpiResult<Vec<u8>> {
    let client = KeyServiceClient::new(config, credentials)?;
    decrypt_with(client, data)
}

pub fn decrypt_with(client: KeyServiceClient, data: &[u8]) -> CgpiResult<Vec<u8>> {
    let mut engine = Decryption::with_client(client)?;

    let result = (|| -> CgpiResult<Vec<u8>> {
        engine.begin()?;
        let mut out = engine.update(data)?;
        out.extend(engine.finish()?);
        Ok(out)
    })();

    close_after(result, || engine.close())
}

/// Close the engine whatever happened. A close failure only surfaces when
/// the work itself succeeded.
fn close_after<T>(result: CgpiResult<T>, close: impl FnOnce() -> CgpiResult<()>) -> CgpiResult<T> {
    match (result, close()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            tracing::warn!("close after failure also failed: {close_err}");
            Err(e)
        }
    }
}
