//! S/MIME detection and MIME plumbing around the CMS blob

use super::cms::EnvelopedMessage;
use crate::envelope::{split_message, HeaderBlock};
use base64::Engine;
use thiserror::Error;

/// Outer headers that describe the encrypted part and go away with it
const SMIME_CONTENT_HEADERS: &[&str] = &[
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-Disposition",
    "Content-Description",
];

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("S/MIME body is empty")]
    Empty,
}

/// How an encrypted body was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// `application/(x-)pkcs7-mime` with an enveloped-data smime-type
    ContentType,
    /// No S/MIME header, but the body is a DER enveloped-data ContentInfo
    RawDer,
}

impl Detection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Detection::ContentType => "content-type",
            Detection::RawDer => "raw-der",
        }
    }
}

/// Parsed `Content-Type` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(';');
        let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let params = parts
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| {
                (
                    k.trim().to_ascii_lowercase(),
                    v.trim().trim_matches('"').to_string(),
                )
            })
            .collect();
        Self { media_type, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_pkcs7_mime(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            "application/pkcs7-mime" | "application/x-pkcs7-mime"
        )
    }
}

/// Find an encrypted payload in a message.
///
/// `Ok(None)` means the message is not S/MIME enveloped-data and must be
/// left alone. Signed or compressed S/MIME is not ours either.
pub fn detect(headers: &HeaderBlock, body: &[u8]) -> Result<Option<(Vec<u8>, Detection)>, MimeError> {
    if let Some(value) = headers.get("Content-Type") {
        let content_type = ContentType::parse(&value);
        if content_type.is_pkcs7_mime() {
            let enveloped = content_type
                .param("smime-type")
                .map_or(true, |t| t.eq_ignore_ascii_case("enveloped-data"));
            if !enveloped {
                return Ok(None);
            }
            let der = decode_body(headers, body)?;
            if der.is_empty() {
                return Err(MimeError::Empty);
            }
            return Ok(Some((der, Detection::ContentType)));
        }
    }

    if EnvelopedMessage::sniff(body) {
        return Ok(Some((body.to_vec(), Detection::RawDer)));
    }

    Ok(None)
}

/// Undo the transfer encoding. Only base64 is decoded; anything else is
/// taken as raw bytes.
fn decode_body(headers: &HeaderBlock, body: &[u8]) -> Result<Vec<u8>, MimeError> {
    let encoding = headers
        .get("Content-Transfer-Encoding")
        .map(|e| e.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        Some("base64") => {
            let compact: Vec<u8> = body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
        }
        _ => Ok(body.to_vec()),
    }
}

/// Whether the first line of `data` is a header field
fn starts_with_header(data: &[u8]) -> bool {
    let line_end = data.iter().position(|b| *b == b'\n').unwrap_or(data.len());
    let line = &data[..line_end];
    match line.iter().position(|b| *b == b':') {
        Some(colon) if colon > 0 => line[..colon]
            .iter()
            .all(|b| (33..=126).contains(b)),
        _ => false,
    }
}

/// Build the decrypted message's header block and body.
///
/// The outer S/MIME content headers are dropped. When the plaintext starts
/// with its own MIME header block, those fields replace any outer field of
/// the same name and the body is what follows them.
pub fn hoist(outer: &HeaderBlock, plaintext: Vec<u8>) -> (HeaderBlock, Vec<u8>) {
    let mut headers = outer.clone();
    for name in SMIME_CONTENT_HEADERS {
        headers.remove(name);
    }

    if !starts_with_header(&plaintext) {
        return (headers, plaintext);
    }
    let Some((head, body)) = split_message(&plaintext) else {
        return (headers, plaintext);
    };

    let inner = HeaderBlock::parse(head);
    if inner.is_empty() {
        return (headers, plaintext);
    }

    let names: Vec<String> = inner.names().map(str::to_string).collect();
    for name in &names {
        headers.remove(name);
    }
    let body = body.to_vec();
    headers.extend(inner);

    (headers, body)
}
