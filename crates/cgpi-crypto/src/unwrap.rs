//! Local unwrap of a data key handed out by the key service
//!
//! The service returns the caller's RSA private key as an encrypted PKCS#8
//! PEM (passphrase: the secret access key) together with the data key
//! RSA-OAEP(SHA-1)-encrypted to that key pair, base64 encoded. Encryption and
//! decryption responses are unwrapped the same way.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cgpi_core::{CgpiError, CgpiResult};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::session::DataKey;

pub fn unwrap_data_key(
    encrypted_private_key: &str,
    wrapped_data_key: &str,
    passphrase: &SecretString,
) -> CgpiResult<DataKey> {
    let private_key = RsaPrivateKey::from_pkcs8_encrypted_pem(
        encrypted_private_key,
        passphrase.expose_secret().as_bytes(),
    )
    .map_err(|e| CgpiError::KeyUnwrap(format!("decrypting private key: {e}")))?;

    let wrapped = BASE64
        .decode(wrapped_data_key.trim())
        .map_err(|e| CgpiError::KeyUnwrap(format!("wrapped data key is not base64: {e}")))?;

    let raw = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha1>(), &wrapped)
            .map_err(|e| CgpiError::KeyUnwrap(format!("RSA-OAEP unwrap: {e}")))?,
    );

    Ok(DataKey::from_bytes(raw.to_vec()))
}

/// Decode the base64 `encrypted_data_key` that goes into every header.
pub fn decode_encrypted_key(encrypted_data_key: &str) -> CgpiResult<Vec<u8>> {
    BASE64
        .decode(encrypted_data_key.trim())
        .map_err(|e| CgpiError::KeyUnwrap(format!("encrypted_data_key is not base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding, PrivateKeyInfo};
    use rsa::RsaPublicKey;

    fn encrypted_pem(key: &RsaPrivateKey, passphrase: &str) -> String {
        let der = key.to_pkcs8_der().unwrap();
        let info = PrivateKeyInfo::try_from(der.as_bytes()).unwrap();
        let params =
            pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(1_000, &[7u8; 16], &[9u8; 16])
                .unwrap();
        let doc = info.encrypt_with_params(params, passphrase).unwrap();
        doc.to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
            .unwrap()
            .to_string()
    }

    fn fixture() -> (String, String) {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = RsaPublicKey::from(&key);
        let wrapped = public
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &[0x5A; 32])
            .unwrap();
        (encrypted_pem(&key, "passphrase"), BASE64.encode(wrapped))
    }

    #[test]
    fn test_unwrap_roundtrip_and_failures() {
        let (pem, wrapped) = fixture();

        let key = unwrap_data_key(&pem, &wrapped, &SecretString::from("passphrase".to_string()))
            .unwrap();
        assert_eq!(key.as_bytes(), &[0x5A; 32]);

        let wrong_pass =
            unwrap_data_key(&pem, &wrapped, &SecretString::from("nope".to_string())).unwrap_err();
        assert!(matches!(wrong_pass, CgpiError::KeyUnwrap(_)));

        let bad_b64 = unwrap_data_key(&pem, "%%%", &SecretString::from("passphrase".to_string()))
            .unwrap_err();
        assert!(matches!(bad_b64, CgpiError::KeyUnwrap(_)));

        let garbage = BASE64.encode([1u8; 128]);
        let bad_ct = unwrap_data_key(&pem, &garbage, &SecretString::from("passphrase".to_string()))
            .unwrap_err();
        assert!(matches!(bad_ct, CgpiError::KeyUnwrap(_)));
    }

    #[test]
    fn test_decode_encrypted_key() {
        assert_eq!(decode_encrypted_key("AAEC").unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            decode_encrypted_key("not base64!"),
            Err(CgpiError::KeyUnwrap(_))
        ));
    }
}
