//! Envelope model
//!
//! One mail transaction as it travels through the pipeline: the SMTP
//! envelope, the raw header block, the body buffer and per-stage metadata.

use serde_json::Value;
use smimegw_common::EmailAddress;
use std::collections::HashMap;

/// A single header field, kept as the raw bytes it arrived as
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: String,
    /// Complete field including name, folded lines and line terminator
    raw: Vec<u8>,
}

impl HeaderField {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            raw: format!("{}: {}\r\n", name, value).into_bytes(),
        }
    }

    /// Unfolded value with surrounding whitespace removed
    fn value(&self) -> String {
        let text = String::from_utf8_lossy(&self.raw);
        let value = text
            .split_once(':')
            .map(|(_, v)| v)
            .unwrap_or_default();
        value
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered RFC 5322 header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<HeaderField>,
}

impl HeaderBlock {
    /// Parse a header block. Lines that are neither fields nor
    /// continuations are dropped.
    pub fn parse(raw: &[u8]) -> Self {
        let mut fields: Vec<HeaderField> = Vec::new();

        for line in split_lines(raw) {
            if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
                if let Some(last) = fields.last_mut() {
                    last.raw.extend_from_slice(line);
                }
                continue;
            }

            let Some(colon) = line.iter().position(|b| *b == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            if name.is_empty() || !name.bytes().all(is_field_name_byte) {
                continue;
            }
            fields.push(HeaderField {
                name,
                raw: line.to_vec(),
            });
        }

        // Normalise a missing terminator on the last line
        if let Some(last) = fields.last_mut() {
            if !last.raw.ends_with(b"\n") {
                last.raw.extend_from_slice(b"\r\n");
            }
        }

        Self { fields }
    }

    /// First value of a header, case-insensitive
    pub fn get(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(HeaderField::value)
    }

    /// All values of a header in order
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .map(HeaderField::value)
            .collect()
    }

    /// Remove every occurrence of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    /// Insert a header at the top of the block (trace headers)
    pub fn prepend(&mut self, name: &str, value: &str) {
        self.fields.insert(0, HeaderField::new(name, value));
    }

    /// Append a header at the end of the block
    pub fn append(&mut self, name: &str, value: &str) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// Move every field of `other` to the end of this block
    pub fn extend(&mut self, other: HeaderBlock) {
        self.fields.extend(other.fields);
    }

    /// Header names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialised header block, without the separating blank line
    pub fn to_bytes(&self) -> Vec<u8> {
        self.fields.iter().flat_map(|f| f.raw.iter().copied()).collect()
    }
}

/// Bytes allowed in a field name (RFC 5322 ftext)
fn is_field_name_byte(b: u8) -> bool {
    (33..=126).contains(&b) && b != b':'
}

/// Split into lines, keeping terminators
fn split_lines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split_inclusive(|b| *b == b'\n').filter(|l| !l.is_empty())
}

/// Split a message at the first blank line into (header block, body).
///
/// Returns `None` when the data has no header/body separator.
pub fn split_message(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(data, b"\r\n\r\n").map(|i| (i + 2, i + 4));
    let lf = find(data, b"\n\n").map(|i| (i + 1, i + 2));

    let (header_end, body_start) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    Some((&data[..header_end], &data[body_start..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// One mail transaction
#[derive(Debug, Clone)]
pub struct Envelope {
    id: u64,
    from: Option<EmailAddress>,
    rcpt_to: Vec<EmailAddress>,
    remote_ip: Option<String>,
    helo: Option<String>,
    headers: HeaderBlock,
    body: Vec<u8>,
    metadata: HashMap<String, Value>,
}

impl Envelope {
    /// Create an empty envelope for a new transaction
    pub fn new(id: u64) -> Self {
        Self {
            id,
            from: None,
            rcpt_to: Vec::new(),
            remote_ip: None,
            helo: None,
            headers: HeaderBlock::default(),
            body: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Build an envelope from raw message data and the SMTP envelope.
    ///
    /// Data without a header/body separator is treated as all body.
    pub fn from_message(
        id: u64,
        from: Option<EmailAddress>,
        rcpt_to: impl IntoIterator<Item = EmailAddress>,
        data: &[u8],
    ) -> Self {
        let mut envelope = Self::new(id);
        envelope.from = from;
        for rcpt in rcpt_to {
            envelope.add_recipient(rcpt);
        }
        envelope.set_data(data);
        envelope
    }

    /// Replace headers and body from raw message data
    pub fn set_data(&mut self, data: &[u8]) {
        match split_message(data) {
            Some((headers, body)) => {
                self.headers = HeaderBlock::parse(headers);
                self.body = body.to_vec();
            }
            None => {
                self.headers = HeaderBlock::default();
                self.body = data.to_vec();
            }
        }
    }

    /// Monotonic transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn from(&self) -> Option<&EmailAddress> {
        self.from.as_ref()
    }

    pub fn set_from(&mut self, from: Option<EmailAddress>) {
        self.from = from;
    }

    /// Recipients in the order they were first given
    pub fn recipients(&self) -> &[EmailAddress] {
        &self.rcpt_to
    }

    /// Add a recipient; returns false if it was already present
    pub fn add_recipient(&mut self, rcpt: EmailAddress) -> bool {
        let identity = rcpt.identity();
        if self.rcpt_to.iter().any(|r| r.identity() == identity) {
            return false;
        }
        self.rcpt_to.push(rcpt);
        true
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    pub fn set_remote_ip(&mut self, ip: impl Into<String>) {
        self.remote_ip = Some(ip.into());
    }

    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub fn set_helo(&mut self, helo: impl Into<String>) {
        self.helo = Some(helo.into());
    }

    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderBlock {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Swap in a new body, returning the previous one
    pub fn replace_body(&mut self, body: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.body, body)
    }

    /// Swap header block and body together, returning the previous pair
    pub fn replace_content(&mut self, headers: HeaderBlock, body: Vec<u8>) -> (HeaderBlock, Vec<u8>) {
        (
            std::mem::replace(&mut self.headers, headers),
            std::mem::replace(&mut self.body, body),
        )
    }

    /// Metadata recorded by a stage
    pub fn metadata(&self, stage: &str) -> Option<&Value> {
        self.metadata.get(stage)
    }

    pub fn set_metadata(&mut self, stage: &str, value: Value) {
        self.metadata.insert(stage.to_string(), value);
    }

    /// Full message: header block, blank line, body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.headers.to_bytes();
        if !self.headers.is_empty() {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(&self.body);
        out
    }
}
