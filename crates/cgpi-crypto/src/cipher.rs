//! Cipher registry and streaming AES-GCM contexts
//!
//! GCM is assembled from its parts so that ciphertext can be produced (and
//! consumed) incrementally:
//! ```text
//! H    = AES_K(0^128)
//! J0   = IV || 0x00000001                      (96-bit IV)
//! C    = P xor CTR32_K(inc32(J0))
//! tag  = GHASH_H(pad(A) || pad(C) || len64(A) || len64(C)) xor AES_K(J0)
//! ```
//! Output of `update` has exactly the length of its input; the only buffering
//! is the partial GHASH block, which never holds back ciphertext.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256, Block};
use cgpi_core::{CgpiError, CgpiResult};
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const BLOCK_SIZE: usize = 16;
/// Longest stream one key and IV may cover: counters `inc32(J0)..=2^32-1`.
const MAX_STREAM_LEN: u64 = ((1u64 << 32) - 2) * BLOCK_SIZE as u64;

/// Underlying AEAD construction of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSpec {
    pub id: u8,
    pub name: &'static str,
    pub key_length: usize,
    pub iv_length: usize,
    pub tag_length: usize,
    pub construction: Construction,
}

pub const AES_128_GCM: AlgorithmSpec = AlgorithmSpec {
    id: 0,
    name: "aes-128-gcm",
    key_length: 16,
    iv_length: 12,
    tag_length: 16,
    construction: Construction::Aes128Gcm,
};

pub const AES_256_GCM: AlgorithmSpec = AlgorithmSpec {
    id: 1,
    name: "aes-256-gcm",
    key_length: 32,
    iv_length: 12,
    tag_length: 16,
    construction: Construction::Aes256Gcm,
};

/// Every supported algorithm. `id` and `name` are both unique.
pub const REGISTRY: [AlgorithmSpec; 2] = [AES_128_GCM, AES_256_GCM];

pub fn resolve_by_id(id: u8) -> Option<AlgorithmSpec> {
    REGISTRY.iter().copied().find(|spec| spec.id == id)
}

/// Look up by name, ignoring case (the service reports `AES-256-GCM`).
pub fn resolve_by_name(name: &str) -> CgpiResult<AlgorithmSpec> {
    REGISTRY
        .iter()
        .copied()
        .find(|spec| spec.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| CgpiError::AlgorithmNotFound(name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

enum Keystream {
    Aes128(ctr::Ctr32BE<Aes128>),
    Aes256(ctr::Ctr32BE<Aes256>),
}

impl Keystream {
    /// Fails without touching `buf` once the 32-bit block counter would wrap.
    fn apply(&mut self, buf: &mut [u8]) -> CgpiResult<()> {
        match self {
            Keystream::Aes128(c) => c.try_apply_keystream(buf),
            Keystream::Aes256(c) => c.try_apply_keystream(buf),
        }
        .map_err(|_| CgpiError::Crypto("AES-CTR keystream exhausted".into()))
    }
}

/// A live AES-GCM context bound to one key and IV.
pub struct AeadContext {
    direction: Direction,
    tag_length: usize,
    keystream: Keystream,
    ghash: GHash,
    /// `AES_K(J0)`, key-derived.
    tag_mask: Zeroizing<[u8; BLOCK_SIZE]>,
    /// Ciphertext bytes not yet forming a whole GHASH block.
    partial: Vec<u8>,
    aad_len: u64,
    ct_len: u64,
    aad_locked: bool,
}

impl AeadContext {
    fn new(spec: &AlgorithmSpec, key: &[u8], iv: &[u8], direction: Direction) -> CgpiResult<Self> {
        check_lengths(spec, key, iv)?;

        let mut j0 = Zeroizing::new([0u8; BLOCK_SIZE]);
        j0[..iv.len()].copy_from_slice(iv);
        j0[BLOCK_SIZE - 1] = 1;
        let mut counter = Zeroizing::new(*j0);
        counter[BLOCK_SIZE - 1] = 2;

        let mut hash_key = Zeroizing::new([0u8; BLOCK_SIZE]);
        let mut tag_mask = Zeroizing::new(*j0);
        let bad_key = |_| CgpiError::InvalidKeyLength {
            expected: spec.key_length,
            actual: key.len(),
        };

        let keystream = match spec.construction {
            Construction::Aes128Gcm => {
                let block = Aes128::new_from_slice(key).map_err(bad_key)?;
                block.encrypt_block(Block::from_mut_slice(&mut hash_key[..]));
                block.encrypt_block(Block::from_mut_slice(&mut tag_mask[..]));
                Keystream::Aes128(
                    ctr::Ctr32BE::<Aes128>::new_from_slices(key, &counter[..]).map_err(bad_key)?,
                )
            }
            Construction::Aes256Gcm => {
                let block = Aes256::new_from_slice(key).map_err(bad_key)?;
                block.encrypt_block(Block::from_mut_slice(&mut hash_key[..]));
                block.encrypt_block(Block::from_mut_slice(&mut tag_mask[..]));
                Keystream::Aes256(
                    ctr::Ctr32BE::<Aes256>::new_from_slices(key, &counter[..]).map_err(bad_key)?,
                )
            }
        };

        Ok(Self {
            direction,
            tag_length: spec.tag_length,
            keystream,
            ghash: GHash::new(Block::from_slice(&hash_key[..])),
            tag_mask,
            partial: Vec::with_capacity(BLOCK_SIZE),
            aad_len: 0,
            ct_len: 0,
            aad_locked: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn tag_length(&self) -> usize {
        self.tag_length
    }

    /// Bind additional authenticated data. Allowed once, before any `update`.
    pub fn set_aad(&mut self, aad: &[u8]) -> CgpiResult<()> {
        if self.aad_locked {
            return Err(CgpiError::Crypto(
                "additional authenticated data must be set once, before any data".into(),
            ));
        }
        self.ghash.update_padded(aad);
        self.aad_len = aad.len() as u64;
        self.aad_locked = true;
        Ok(())
    }

    /// Encrypt or decrypt the next slice of the stream.
    pub fn update(&mut self, input: &[u8]) -> CgpiResult<Vec<u8>> {
        if self.ct_len.saturating_add(input.len() as u64) > MAX_STREAM_LEN {
            return Err(CgpiError::Crypto(
                "stream exceeds the AES-GCM limit for one key and IV".into(),
            ));
        }
        self.aad_locked = true;
        let mut out = input.to_vec();
        self.keystream.apply(&mut out)?;
        match self.direction {
            Direction::Encrypt => self.absorb(&out),
            Direction::Decrypt => self.absorb(input),
        }
        Ok(out)
    }

    /// Finish an encryption and return the authentication tag.
    pub fn finalize_tag(self) -> CgpiResult<Vec<u8>> {
        if self.direction != Direction::Encrypt {
            return Err(CgpiError::Crypto("finalize_tag on a decrypting context".into()));
        }
        let tag_length = self.tag_length;
        let tag = self.compute_tag();
        Ok(tag[..tag_length].to_vec())
    }

    /// Finish a decryption by checking the received tag in constant time.
    pub fn verify_tag(self, tag: &[u8]) -> CgpiResult<()> {
        if self.direction != Direction::Decrypt {
            return Err(CgpiError::Crypto("verify_tag on an encrypting context".into()));
        }
        if tag.len() != self.tag_length {
            return Err(CgpiError::InvalidTag);
        }
        let tag_length = self.tag_length;
        let expected = self.compute_tag();
        if bool::from(expected[..tag_length].ct_eq(tag)) {
            Ok(())
        } else {
            Err(CgpiError::AuthenticationFailed)
        }
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.ct_len += data.len() as u64;

        if !self.partial.is_empty() {
            let take = (BLOCK_SIZE - self.partial.len()).min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() < BLOCK_SIZE {
                return;
            }
            self.ghash.update_padded(&self.partial);
            self.partial.clear();
        }

        let whole = data.len() - data.len() % BLOCK_SIZE;
        self.ghash.update_padded(&data[..whole]);
        self.partial.extend_from_slice(&data[whole..]);
    }

    fn compute_tag(mut self) -> Block {
        if !self.partial.is_empty() {
            self.ghash.update_padded(&self.partial);
        }

        let mut lengths = ghash::Block::default();
        lengths[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update(&[lengths]);

        let mut tag = self.ghash.finalize();
        for (t, m) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *t ^= m;
        }
        tag
    }
}

impl std::fmt::Debug for AeadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadContext")
            .field("direction", &self.direction)
            .field("tag_length", &self.tag_length)
            .field("processed", &self.ct_len)
            .finish_non_exhaustive()
    }
}

fn check_lengths(spec: &AlgorithmSpec, key: &[u8], iv: &[u8]) -> CgpiResult<()> {
    if key.len() != spec.key_length {
        return Err(CgpiError::InvalidKeyLength {
            expected: spec.key_length,
            actual: key.len(),
        });
    }
    if iv.len() != spec.iv_length {
        return Err(CgpiError::InvalidIvLength {
            expected: spec.iv_length,
            actual: iv.len(),
        });
    }
    Ok(())
}

/// Encrypting context. Without an `iv`, a random one of `spec.iv_length`
/// bytes is generated. Returns the context and the IV actually used.
pub fn make_encryptor(
    spec: &AlgorithmSpec,
    key: &[u8],
    iv: Option<&[u8]>,
) -> CgpiResult<(AeadContext, Vec<u8>)> {
    if key.len() != spec.key_length {
        return Err(CgpiError::InvalidKeyLength {
            expected: spec.key_length,
            actual: key.len(),
        });
    }

    let iv = match iv {
        Some(iv) => iv.to_vec(),
        None => {
            let mut iv = vec![0u8; spec.iv_length];
            rand::thread_rng().fill_bytes(&mut iv);
            iv
        }
    };

    let ctx = AeadContext::new(spec, key, &iv, Direction::Encrypt)?;
    Ok((ctx, iv))
}

pub fn make_decryptor(spec: &AlgorithmSpec, key: &[u8], iv: &[u8]) -> CgpiResult<AeadContext> {
    AeadContext::new(spec, key, iv, Direction::Decrypt)
}
