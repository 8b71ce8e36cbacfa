//! Wire format for envelopes.
//!
//! An envelope is written as its attributes in order, each one as a key
//! string followed by a value string. Every string is terminated by a single
//! [`TERMINATOR`] byte. An empty key (a lone terminator) marks the end of the
//! envelope:
//!
//! ```text
//! command\0checkIn\0from\0localhost:8082\0 ... \0
//! ```
//!
//! When the envelope carries a [`content-length`](crate::envelope::attr::CONTENT_LENGTH)
//! attribute, exactly that many raw bytes follow the end marker with no
//! further framing. The next envelope on the same stream starts right after
//! them.

use crate::envelope::Envelope;
use thiserror::Error as ThisError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// The byte that ends every string on the wire.
pub const TERMINATOR: u8 = b'\0';

/// Longest string accepted from a peer, terminator excluded.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Serializes an envelope, including its end marker.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    for (key, value) in envelope.iter() {
        if key.is_empty() || key.as_bytes().contains(&TERMINATOR) {
            return Err(WireError::Unencodable(key.to_string()));
        }
        if value.as_bytes().contains(&TERMINATOR) {
            return Err(WireError::Unencodable(key.to_string()));
        }
        buf.extend_from_slice(key.as_bytes());
        buf.push(TERMINATOR);
        buf.extend_from_slice(value.as_bytes());
        buf.push(TERMINATOR);
    }
    buf.push(TERMINATOR);
    Ok(buf)
}

/// Reads one terminated string, with the terminator stripped.
///
/// Returns `Ok(None)` if the stream is already at its end. A stream that ends
/// after some bytes but before the terminator is an error, and so is a string
/// longer than [`MAX_STRING_LEN`].
pub async fn read_terminated<R>(reader: &mut R, terminator: u8) -> Result<Option<String>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_STRING_LEN as u64 + 1)
        .read_until(terminator, &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&terminator) {
        return Err(if buf.len() > MAX_STRING_LEN {
            WireError::TooLong(MAX_STRING_LEN)
        } else {
            WireError::UnexpectedEof
        });
    }
    buf.pop();
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| WireError::InvalidUtf8)
}

/// Reads one envelope.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// envelopes.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut envelope = Envelope::new();
    let mut first = true;
    loop {
        let key = match read_terminated(reader, TERMINATOR).await? {
            Some(key) => key,
            None if first => return Ok(None),
            None => return Err(WireError::UnexpectedEof),
        };
        first = false;
        if key.is_empty() {
            return Ok(Some(envelope));
        }
        let value = read_terminated(reader, TERMINATOR)
            .await?
            .ok_or(WireError::UnexpectedEof)?;
        envelope.insert(key, value);
    }
}

#[derive(Debug, ThisError)]
pub enum WireError {
    #[error("Stream ended in the middle of an envelope or payload")]
    UnexpectedEof,
    #[error("Received text was not valid UTF-8")]
    InvalidUtf8,
    #[error("Attribute `{0}` cannot be encoded")]
    Unencodable(String),
    #[error("String exceeds {0} bytes without a terminator")]
    TooLong(usize),
    #[error("Invalid content-length `{0}`")]
    InvalidLength(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
