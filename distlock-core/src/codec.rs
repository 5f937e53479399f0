//! Archive codec for structured data carried in string message content.
//!
//! Envelope content is UTF-8 text, but two protocol elements are
//! structured values: the Suzuki-Kasami `(resource, token)` transfer and
//! the envelope embedded in a transport `Failure`. Both travel as
//! *archives*: postcard bytes rendered with base58. Postcard gives a
//! deterministic, self-delimiting binary form; base58 keeps it a single
//! line, so archives compose with the newline-separated content grammars.
//!
//! All peers of a deployment must share this framing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ArchiveError;

/// Serialize `value` into a single-line text archive.
///
/// # Errors
/// Returns [`ArchiveError::Serialize`] if postcard cannot encode the
/// value.
pub fn encode_archive<T: Serialize>(value: &T) -> Result<String, ArchiveError> {
    let bytes = postcard::to_allocvec(value).map_err(ArchiveError::Serialize)?;
    Ok(bs58::encode(bytes).into_string())
}

/// Restore a value from a text archive produced by [`encode_archive`].
///
/// # Errors
/// Returns [`ArchiveError::Encoding`] for text that is not base58 and
/// [`ArchiveError::Deserialize`] for bytes that do not decode to `T`.
pub fn decode_archive<T: DeserializeOwned>(archive: &str) -> Result<T, ArchiveError> {
    let bytes = bs58::decode(archive)
        .into_vec()
        .map_err(ArchiveError::Encoding)?;
    postcard::from_bytes(&bytes).map_err(ArchiveError::Deserialize)
}
