//! Connection header wire codec (spec §3 "Connection header", §4.D, §6).
//!
//! Wire format:
//! ```text
//! [4-byte little-endian total_length]
//!   repeated until total_length consumed:
//!     [4-byte little-endian field_length]
//!     [field_length bytes of "key=value"]
//! ```
//!
//! Grounded on `roslibrust/src/ros1/publisher.rs`'s `ConnectionHeader` and
//! `tcpros::receive_header`, generalized into a plain `BTreeMap<String, String>` so that
//! publisher, subscriber, service-server and service-client headers all share one codec instead
//! of four near-identical structs.

use std::collections::BTreeMap;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use axon_common::{Error, Result};

/// An unordered string -> string connection header, as exchanged during the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header(BTreeMap<String, String>);

impl Header {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new().with("error", reason)
    }

    pub fn is_error(&self) -> bool {
        self.0.contains_key("error")
    }

    /// Serializes this header to the wire format described above.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut fields = Vec::with_capacity(self.0.len());
        for (k, v) in &self.0 {
            fields.push(format!("{k}={v}"));
        }
        let mut body = Vec::new();
        for field in &fields {
            body.write_u32::<LittleEndian>(field.len() as u32).unwrap();
            body.extend_from_slice(field.as_bytes());
        }
        let mut out = Vec::with_capacity(body.len() + 4);
        out.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Parses a header from an already-read, already-length-delimited byte block (i.e. the
    /// bytes *after* the outer `total_length` prefix has been stripped).
    pub fn from_body_bytes(mut body: &[u8]) -> Result<Self> {
        let mut map = BTreeMap::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(Error::HeaderError(
                    "truncated field length in connection header".to_string(),
                ));
            }
            let field_len = (&body[..4])
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::HeaderError(e.to_string()))? as usize;
            body = &body[4..];
            if body.len() < field_len {
                return Err(Error::HeaderError(
                    "field length exceeds remaining header bytes".to_string(),
                ));
            }
            let field = std::str::from_utf8(&body[..field_len])
                .map_err(|e| Error::HeaderError(e.to_string()))?;
            body = &body[field_len..];
            match field.split_once('=') {
                Some((k, v)) => {
                    map.insert(k.to_string(), v.to_string());
                }
                None => {
                    return Err(Error::HeaderError(format!(
                        "header field {field:?} is missing '='"
                    )))
                }
            }
        }
        Ok(Self(map))
    }

    /// Parses a header from a complete, self-length-prefixed buffer (the form [`Header::to_bytes`]
    /// produces) rather than an async stream -- used for the datagram path, where a connection
    /// header rides embedded in a reassembled UDP fragment instead of a TCP handshake.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::HeaderError("header buffer shorter than its own length prefix".to_string()));
        }
        let total_len = (&buf[..4])
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::HeaderError(e.to_string()))? as usize;
        if buf.len() < 4 + total_len {
            return Err(Error::HeaderError("header buffer shorter than its declared length".to_string()));
        }
        Self::from_body_bytes(&buf[4..4 + total_len])
    }

    /// Writes this header to an async writer, total-length-prefixed.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }

    /// Reads and parses a header from an async reader.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let total_len = reader.read_u32_le().await? as usize;
        // A malformed or adversarial peer could claim an enormous length; cap it well above any
        // legitimate header (a few hundred keys) to bound the allocation.
        const MAX_HEADER_BYTES: usize = 1 << 20;
        if total_len > MAX_HEADER_BYTES {
            return Err(Error::HeaderError(format!(
                "header claims {total_len} bytes, exceeding the {MAX_HEADER_BYTES} byte cap"
            )));
        }
        let mut body = vec![0u8; total_len];
        reader.read_exact(&mut body).await?;
        Self::from_body_bytes(&body)
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Checks a peer-supplied md5sum against our own, honoring the `"*"` wildcard either side may
/// declare (spec §3 "two descriptors are compatible iff...").
pub fn md5_compatible(ours: &str, theirs: &str) -> bool {
    ours == theirs || ours == "*" || theirs == "*"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut h = Header::new();
        h.insert("topic", "/chat").insert("md5sum", "abc123");
        let bytes = h.to_bytes();
        // Strip the outer total_length the same way read_from would.
        let total_len = (&bytes[..4]).read_u32::<LittleEndian>().unwrap() as usize;
        let parsed = Header::from_body_bytes(&bytes[4..4 + total_len]).unwrap();
        assert_eq!(parsed.get("topic"), Some("/chat"));
        assert_eq!(parsed.get("md5sum"), Some("abc123"));
    }

    #[tokio::test]
    async fn async_round_trip() {
        let h = Header::new().with("service", "/svc").with("persistent", "1");
        let mut buf = Vec::new();
        h.write_to(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = Header::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn wildcard_md5_matches_anything() {
        assert!(md5_compatible("*", "deadbeef"));
        assert!(md5_compatible("deadbeef", "*"));
        assert!(md5_compatible("deadbeef", "deadbeef"));
        assert!(!md5_compatible("deadbeef", "feedface"));
    }

    #[test]
    fn truncated_body_is_header_error() {
        let err = Header::from_body_bytes(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::HeaderError(_)));
    }
}
