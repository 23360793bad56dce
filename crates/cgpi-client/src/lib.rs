//! cgpi-client: signed access to the cryptograpi key service
//!
//! Every call is a JSON body, signed with HMAC-SHA512 over a canonical header
//! string (see [`signature`]), sent over a [`Transport`]. The core never
//! retries; a failed call is surfaced as `KeyServiceUnreachable` or
//! `KeyServiceError` and retry policy is left to the caller.

pub mod api;
pub mod signature;
pub mod transport;

pub use api::{DecryptionKeyResponse, EncryptionKeyResponse, KeyServiceClient};
pub use signature::{Method, RequestSigner, SignedHeaders};
pub use transport::{HttpRequest, HttpResponse, Transport, UreqTransport};
