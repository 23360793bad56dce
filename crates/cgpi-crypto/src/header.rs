//! Frame header prepended to every ciphertext stream
//!
//! ```text
//! [1 byte: version = 0]
//! [1 byte: flags (bit 0 = header is AEAD additional data)]
//! [1 byte: algorithm id]
//! [1 byte: iv_length]
//! [2 bytes: key_length, big-endian]
//! [iv_length bytes: initialization vector]
//! [key_length bytes: encrypted data key]
//! ```
//! followed by the ciphertext and `tag_length` bytes of authentication tag.

use cgpi_core::{CgpiError, CgpiResult};

pub const HEADER_VERSION: u8 = 0;

/// The whole header (prefix, IV, encrypted key) is bound as AEAD additional data.
pub const FLAG_AEAD_AUTH: u8 = 0x01;

/// Fixed-size part: version, flags, algorithm id, iv length, key length.
pub const PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub algorithm_id: u8,
    pub iv: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

impl FrameHeader {
    pub fn new(algorithm_id: u8, iv: Vec<u8>, wrapped_key: Vec<u8>) -> Self {
        Self {
            version: HEADER_VERSION,
            flags: FLAG_AEAD_AUTH,
            algorithm_id,
            iv,
            wrapped_key,
        }
    }

    pub fn has_aead_auth(&self) -> bool {
        self.flags & FLAG_AEAD_AUTH != 0
    }

    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.iv.len() + self.wrapped_key.len()
    }

    pub fn encode(&self) -> CgpiResult<Vec<u8>> {
        let iv_len = u8::try_from(self.iv.len()).map_err(|_| {
            CgpiError::InvalidHeader(format!("IV too long: {} bytes", self.iv.len()))
        })?;
        let key_len = u16::try_from(self.wrapped_key.len()).map_err(|_| {
            CgpiError::InvalidHeader(format!(
                "wrapped key too long: {} bytes",
                self.wrapped_key.len()
            ))
        })?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.version);
        out.push(self.flags);
        out.push(self.algorithm_id);
        out.push(iv_len);
        out.extend_from_slice(&key_len.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.wrapped_key);
        Ok(out)
    }
}

/// The decoded fixed prefix; tells how many more header bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPrefix {
    pub version: u8,
    pub flags: u8,
    pub algorithm_id: u8,
    pub iv_length: u8,
    pub key_length: u16,
}

impl HeaderPrefix {
    /// `None` until [`PREFIX_LEN`] bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let prefix = buf.get(..PREFIX_LEN)?;
        Some(Self {
            version: prefix[0],
            flags: prefix[1],
            algorithm_id: prefix[2],
            iv_length: prefix[3],
            key_length: u16::from_be_bytes([prefix[4], prefix[5]]),
        })
    }

    pub fn validate(&self) -> CgpiResult<()> {
        if self.version != HEADER_VERSION {
            return Err(CgpiError::InvalidHeader(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.flags & !FLAG_AEAD_AUTH != 0 {
            return Err(CgpiError::InvalidHeader(format!(
                "unknown flags 0x{:02x}",
                self.flags
            )));
        }
        Ok(())
    }

    pub fn header_len(&self) -> usize {
        PREFIX_LEN + self.iv_length as usize + self.key_length as usize
    }
}

/// Outcome of looking for a header at the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse {
    /// More bytes are needed; nothing is wrong yet.
    Incomplete,
    /// The header and the exact bytes it was decoded from.
    Complete { header: FrameHeader, raw: Vec<u8> },
}

/// Parse a header from the front of `buf`.
///
/// Version and flags are checked as soon as the prefix is present, so a bad
/// stream fails without waiting for the rest of the header.
pub fn parse_header(buf: &[u8]) -> CgpiResult<HeaderParse> {
    let Some(prefix) = HeaderPrefix::decode(buf) else {
        return Ok(HeaderParse::Incomplete);
    };
    prefix.validate()?;

    let total = prefix.header_len();
    if buf.len() < total {
        return Ok(HeaderParse::Incomplete);
    }

    let iv_end = PREFIX_LEN + prefix.iv_length as usize;
    Ok(HeaderParse::Complete {
        header: FrameHeader {
            version: prefix.version,
            flags: prefix.flags,
            algorithm_id: prefix.algorithm_id,
            iv: buf[PREFIX_LEN..iv_end].to_vec(),
            wrapped_key: buf[iv_end..total].to_vec(),
        },
        raw: buf[..total].to_vec(),
    })
}
