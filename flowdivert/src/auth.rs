//! Token authentication.
//!
//! Tokens and other provider-signed buffers carry an HMAC-SHA-256 record
//! appended last. Signing hashes every byte before that record; verifying
//! strips the record and recomputes over what is left, comparing in
//! constant time.

use bytes::{Buf, BytesMut};
use flowdivert_wire::tlv::{self, types};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Digest size in bytes.
pub const HMAC_LEN: usize = 32;

/// Authentication outcomes other than success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No secret is configured, so nothing can be verified.
    #[error("no key configured")]
    NotSupported,

    /// The buffer carries no HMAC record.
    #[error("missing HMAC record")]
    Missing,

    /// The HMAC record is truncated or has the wrong size.
    #[error("malformed HMAC record")]
    Malformed,

    /// The digest does not match.
    #[error("HMAC mismatch")]
    Mismatch,
}

/// Compute the digest of every remaining byte of `buf` under `key`.
///
/// Works over any [`Buf`], so chained or segmented buffers are hashed as one
/// message without first being copied together.
pub fn compute<B: Buf>(mut buf: B, key: &[u8]) -> Result<[u8; HMAC_LEN], AuthError> {
    if key.is_empty() {
        return Err(AuthError::NotSupported);
    }
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::NotSupported)?;
    while buf.has_remaining() {
        let chunk = buf.chunk();
        let n = chunk.len();
        mac.update(chunk);
        buf.advance(n);
    }
    let mut digest = [0u8; HMAC_LEN];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/// Append an HMAC record over the current contents of `buf`.
pub fn sign(buf: &mut BytesMut, key: &[u8]) -> Result<(), AuthError> {
    let digest = compute(&buf[..], key)?;
    tlv::append(buf, types::HMAC, &digest).map_err(|_| AuthError::Malformed)
}

/// Verify and strip the HMAC record of `buf`.
///
/// On return `buf` no longer contains the HMAC record, whatever the outcome
/// of the comparison. A buffer without a key is `NotSupported`, never
/// accepted.
pub fn verify(buf: &mut BytesMut, key: Option<&[u8]>) -> Result<(), AuthError> {
    let at = tlv::find(&buf[..], 0, types::HMAC, false).ok_or(AuthError::Missing)?;
    let (_, value) = tlv::value_at(&buf[..], at).map_err(|_| AuthError::Malformed)?;
    let declared: [u8; HMAC_LEN] = value.try_into().map_err(|_| AuthError::Malformed)?;

    let mut tail = buf.split_off(at);
    tail.advance(tlv::TLV_HEADER_LEN + HMAC_LEN);
    buf.unsplit(tail);

    let key = key.ok_or(AuthError::NotSupported)?;
    let computed = compute(&buf[..], key)?;
    if bool::from(computed.ct_eq(&declared)) {
        Ok(())
    } else {
        Err(AuthError::Mismatch)
    }
}
