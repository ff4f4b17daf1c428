//! Attachment codec: TLV framing + gzip, one blob per attachment set.
//!
//! A single attachment is written as three tagged fields:
//!
//! ```text
//! [0x01][u32 LE len][name bytes]
//! [0x02][u32 LE len][mime type bytes]
//! [0x03][u32 LE len][content bytes]
//! ```
//!
//! and the whole TLV stream is gzip-compressed. A set of attachments is the
//! concatenation of `[u32 LE len][compressed attachment]` records. The empty
//! set is stored as NULL, never as a zero-length blob.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;

const TAG_NAME: u8 = 0x01;
const TAG_MIME_TYPE: u8 = 0x02;
const TAG_CONTENT: u8 = 0x03;

/// Size of every length prefix (TLV field lengths and set record lengths).
const LEN_PREFIX: usize = 4;

/// A named binary attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            content: content.into(),
        }
    }

    /// Encode this attachment as a compressed TLV blob.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut tlv = Vec::with_capacity(
            3 * (1 + LEN_PREFIX) + self.name.len() + self.mime_type.len() + self.content.len(),
        );
        put_field(&mut tlv, TAG_NAME, self.name.as_bytes())?;
        put_field(&mut tlv, TAG_MIME_TYPE, self.mime_type.as_bytes())?;
        put_field(&mut tlv, TAG_CONTENT, &self.content)?;

        let mut encoder = GzEncoder::new(Vec::with_capacity(tlv.len()), Compression::default());
        encoder
            .write_all(&tlv)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    /// Decode a compressed TLV blob produced by [`Attachment::encode`].
    ///
    /// Fields missing from the stream are left empty; a repeated tag
    /// overwrites the earlier value.
    pub fn decode(blob: &[u8]) -> Result<Self, CodecError> {
        let mut tlv = Vec::new();
        let mut decoder = GzDecoder::new(blob);
        decoder
            .read_to_end(&mut tlv)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        // The decoder stops after one gzip member; anything left is corrupt.
        let rest = decoder.into_inner();
        if !rest.is_empty() {
            return Err(CodecError::TrailingBytes(rest.len()));
        }

        let mut attachment = Attachment::default();
        let mut offset = 0;
        while offset < tlv.len() {
            let tag = tlv[offset];
            offset += 1;
            let len = read_len(&tlv, offset)?;
            offset += LEN_PREFIX;
            let value = take(&tlv, offset, len)?;
            offset += len;

            match tag {
                TAG_NAME => {
                    attachment.name = utf8(value, "name")?;
                }
                TAG_MIME_TYPE => {
                    attachment.mime_type = utf8(value, "mime_type")?;
                }
                TAG_CONTENT => {
                    attachment.content = value.to_vec();
                }
                other => return Err(CodecError::UnknownTag(other)),
            }
        }

        Ok(attachment)
    }
}

/// Encode an attachment set for storage. The empty set encodes to `None`.
pub fn encode_set(attachments: &[Attachment]) -> Result<Option<Vec<u8>>, CodecError> {
    if attachments.is_empty() {
        return Ok(None);
    }

    let mut out = Vec::new();
    for attachment in attachments {
        let blob = attachment.encode()?;
        out.extend_from_slice(&len_prefix(blob.len())?);
        out.extend_from_slice(&blob);
    }
    Ok(Some(out))
}

/// Decode a stored attachment set. `None` (SQL NULL) is the empty set.
pub fn decode_set(blob: Option<&[u8]>) -> Result<Vec<Attachment>, CodecError> {
    let Some(blob) = blob else {
        return Ok(Vec::new());
    };

    let mut attachments = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        let len = read_len(blob, offset)?;
        offset += LEN_PREFIX;
        let record = take(blob, offset, len)?;
        offset += len;
        attachments.push(Attachment::decode(record)?);
    }
    Ok(attachments)
}

fn put_field(buf: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<(), CodecError> {
    buf.push(tag);
    buf.extend_from_slice(&len_prefix(value.len())?);
    buf.extend_from_slice(value);
    Ok(())
}

fn len_prefix(len: usize) -> Result<[u8; LEN_PREFIX], CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    Ok(len.to_le_bytes())
}

fn read_len(buf: &[u8], offset: usize) -> Result<usize, CodecError> {
    let bytes = take(buf, offset, LEN_PREFIX)?;
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(prefix) as usize)
}

fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let remaining = buf.len().saturating_sub(offset);
    if len > remaining {
        return Err(CodecError::Truncated {
            offset,
            needed: len,
            remaining,
        });
    }
    Ok(&buf[offset..offset + len])
}

fn utf8(value: &[u8], field: &'static str) -> Result<String, CodecError> {
    String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

// ── JSON wire form ──────────────────────────────────────────────────
//
// On the wire each attachment is the base64 of its compressed TLV blob.

impl Serialize for Attachment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let blob = self.encode().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&BASE64.encode(blob))
    }
}

impl<'de> Deserialize<'de> for Attachment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let blob = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| serde::de::Error::custom(CodecError::Base64(e.to_string())))?;
        Attachment::decode(&blob).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    fn gunzip(blob: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(blob).read_to_end(&mut out).unwrap();
        out
    }

    fn sample_set() -> Vec<Attachment> {
        vec![
            Attachment::new("content.txt", "text/plain", "new content to write in"),
            Attachment::new(
                "json.txt",
                "application/javascript",
                "{\"first_past\": \"the post\"",
            ),
            Attachment::new("greeting.txt", "text/text", "well hi there"),
        ]
    }

    #[test]
    fn single_attachment_roundtrip() {
        let a = Attachment::new("content.txt", "text/plain", "new content to write in");
        let blob = a.encode().unwrap();
        assert_eq!(Attachment::decode(&blob).unwrap(), a);
    }

    #[test]
    fn tlv_layout_is_tag_le_length_value() {
        let a = Attachment::new("a", "t/x", vec![0xff, 0x00]);
        let tlv = gunzip(&a.encode().unwrap());
        assert_eq!(
            tlv,
            vec![
                0x01, 1, 0, 0, 0, b'a', //
                0x02, 3, 0, 0, 0, b't', b'/', b'x', //
                0x03, 2, 0, 0, 0, 0xff, 0x00,
            ]
        );
    }

    #[test]
    fn set_roundtrip_preserves_order() {
        let set = sample_set();
        let blob = encode_set(&set).unwrap().unwrap();
        assert_eq!(decode_set(Some(&blob)).unwrap(), set);
    }

    #[test]
    fn set_records_are_length_prefixed() {
        let set = sample_set();
        let blob = encode_set(&set).unwrap().unwrap();
        let first_len = u32::from_le_bytes(blob[0..4].try_into().unwrap()) as usize;
        let first = Attachment::decode(&blob[4..4 + first_len]).unwrap();
        assert_eq!(first, set[0]);
    }

    #[test]
    fn empty_set_is_null() {
        assert_eq!(encode_set(&[]).unwrap(), None);
        assert!(decode_set(None).unwrap().is_empty());
    }

    #[test]
    fn zero_length_content_roundtrips() {
        let set = vec![
            Attachment::new("empty.bin", "application/octet-stream", Vec::new()),
            Attachment::new("", "", Vec::new()),
        ];
        let blob = encode_set(&set).unwrap().unwrap();
        assert_eq!(decode_set(Some(&blob)).unwrap(), set);
    }

    #[test]
    fn binary_content_roundtrips() {
        let content: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let set = vec![Attachment::new("blob.bin", "application/octet-stream", content)];
        let blob = encode_set(&set).unwrap().unwrap();
        assert_eq!(decode_set(Some(&blob)).unwrap(), set);
    }

    #[test]
    fn declared_length_past_end_is_error() {
        let set = sample_set();
        let mut blob = encode_set(&set).unwrap().unwrap();
        blob.truncate(blob.len() - 3);
        assert!(matches!(
            decode_set(Some(&blob)),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn truncated_length_prefix_is_error() {
        let err = decode_set(Some(&[0x05, 0x00])).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                offset: 0,
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn truncated_tlv_field_is_error() {
        // Name field claims 10 bytes but carries 2.
        let blob = gzip(&[0x01, 10, 0, 0, 0, b'h', b'i']);
        assert!(matches!(
            Attachment::decode(&blob),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_error() {
        let blob = gzip(&[0x01, 1, 0, 0, 0, b'a', 0x09, 0, 0, 0, 0]);
        assert_eq!(Attachment::decode(&blob), Err(CodecError::UnknownTag(0x09)));
    }

    #[test]
    fn garbage_is_compression_error() {
        assert!(matches!(
            Attachment::decode(b"definitely not gzip"),
            Err(CodecError::Compression(_))
        ));
    }

    #[test]
    fn bytes_after_gzip_member_are_rejected() {
        let a = Attachment::new("a.txt", "text/plain", "hi");
        let mut blob = a.encode().unwrap();
        blob.extend_from_slice(b"GARBAGE-AFTER-GZIP");
        assert_eq!(Attachment::decode(&blob), Err(CodecError::TrailingBytes(18)));

        // Same record inside a set: the length prefix covers the garbage.
        let mut set = Vec::new();
        set.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        set.extend_from_slice(&blob);
        assert_eq!(decode_set(Some(&set)), Err(CodecError::TrailingBytes(18)));
    }

    #[test]
    fn json_roundtrip() {
        let set = sample_set();
        let json = serde_json::to_string(&set).unwrap();
        let back: Vec<Attachment> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn json_rejects_bad_base64() {
        let result: Result<Attachment, _> = serde_json::from_str("\"!!not base64!!\"");
        assert!(result.is_err());
    }
}
