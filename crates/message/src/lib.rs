/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod body;
pub mod headers;
pub mod uri;

use std::fmt::Display;

use ahash::AHashMap;
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders, PartType};

// Regex backtracking on pathological lines is bounded by chunking every body
// line at this length.
pub const MAX_BODY_LINE: usize = 4096;

#[derive(Debug, Clone)]
pub struct MailAddr {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct HeaderRecord {
    pub name: String,
    pub text: String,
    pub raw: String,
    pub addresses: Vec<MailAddr>,
}

/// One parsed message, in every view the rule engine needs. Parsed once,
/// accessed many times; header lookups are cached by request key.
#[derive(Debug)]
pub struct Message {
    raw: Vec<u8>,
    headers: Vec<HeaderRecord>,
    body_offset: usize,
    body_lines: Vec<String>,
    raw_body_lines: Vec<String>,
    uris: Vec<String>,
    part_types: Vec<String>,
    header_cache: AHashMap<String, Option<String>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Empty,
    Unparsable,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Empty => f.write_str("empty message"),
            Error::Unparsable => f.write_str("message could not be parsed"),
        }
    }
}

impl std::error::Error for Error {}

impl Message {
    pub fn parse(raw: Vec<u8>) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::Empty);
        }
        let parsed = MessageParser::default()
            .parse(raw.as_slice())
            .ok_or(Error::Unparsable)?;

        let mut headers = Vec::with_capacity(parsed.headers().len());
        for header in parsed.headers() {
            let raw_value = raw
                .get(header.offset_start..header.offset_end)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            headers.push(HeaderRecord {
                name: header.name.as_str().to_string(),
                text: headers::header_value_text(&header.value, &raw_value),
                raw: raw_value,
                addresses: header_addresses(&header.value),
            });
        }

        let body_offset = parsed
            .parts
            .first()
            .map(|p| p.offset_body)
            .unwrap_or(raw.len());

        let mut body_lines = Vec::new();
        let mut raw_body_lines = Vec::new();
        let mut part_types = Vec::new();
        for (idx, part) in parsed.parts.iter().enumerate() {
            let ctype = part.content_type().map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype).to_lowercase(),
                None => ct.ctype().to_lowercase(),
            });
            match &part.body {
                PartType::Text(text) => {
                    part_types.push(ctype.unwrap_or_else(|| "text/plain".to_string()));
                    body::push_lines(&mut body_lines, text);
                    body::push_lines(&mut raw_body_lines, text);
                }
                PartType::Html(html) => {
                    part_types.push(ctype.unwrap_or_else(|| "text/html".to_string()));
                    body::push_lines(
                        &mut body_lines,
                        &mail_parser::decoders::html::html_to_text(html),
                    );
                    body::push_lines(&mut raw_body_lines, html);
                }
                PartType::Binary(_) | PartType::InlineBinary(_) | PartType::Message(_) => {
                    let ctype =
                        ctype.unwrap_or_else(|| "application/octet-stream".to_string());
                    body_lines.push(format!("[skipped {ctype} attachment]"));
                    part_types.push(ctype);
                }
                PartType::Multipart(_) => {
                    if let Some(ctype) = ctype {
                        part_types.push(ctype);
                    }
                }
            }
            // Unparsable MIME yields a single part covering the raw body.
            if idx == 0 && parsed.parts.len() == 1 && part.is_encoding_problem {
                body_lines.clear();
                raw_body_lines.clear();
                let fallback = String::from_utf8_lossy(&raw[body_offset.min(raw.len())..]);
                body::push_lines(&mut body_lines, &fallback);
                body::push_lines(&mut raw_body_lines, &fallback);
            }
        }

        let uris = uri::extract_uris(&body_lines);

        Ok(Message {
            raw,
            headers,
            body_offset,
            body_lines,
            raw_body_lines,
            uris,
            part_types,
            header_cache: AHashMap::new(),
        })
    }

    /// Lowercased content types of every MIME part, outermost first.
    pub fn part_content_types(&self) -> &[String] {
        &self.part_types
    }

    /// Decoded body, one entry per line, text parts only.
    pub fn body_lines(&self) -> &[String] {
        &self.body_lines
    }

    /// Transfer-decoded body lines with markup preserved.
    pub fn raw_body_lines(&self) -> &[String] {
        &self.raw_body_lines
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// The whole message as received: headers, blank line, raw body.
    pub fn full_text(&self) -> &[u8] {
        &self.raw
    }

    pub fn headers(&self) -> &[HeaderRecord] {
        &self.headers
    }

    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    pub fn raw_body(&self) -> &[u8] {
        self.raw.get(self.body_offset..).unwrap_or_default()
    }

    pub(crate) fn cache_get(&self, key: &str) -> Option<Option<String>> {
        self.header_cache.get(key).cloned()
    }

    pub(crate) fn cache_put(&mut self, key: String, value: Option<String>) {
        self.header_cache.insert(key, value);
    }

    /// Append a header at the end of the header block.
    pub fn put_header(&mut self, name: &str, value: &str) {
        self.headers.push(HeaderRecord {
            name: name.to_string(),
            text: value.to_string(),
            raw: format!(" {value}\n"),
            addresses: Vec::new(),
        });
        self.header_cache.clear();
    }

    /// Replace the first occurrence, or append when absent.
    pub fn replace_header(&mut self, name: &str, value: &str) {
        if let Some(header) = self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            header.text = value.to_string();
            header.raw = format!(" {value}\n");
            header.addresses = Vec::new();
        } else {
            self.headers.push(HeaderRecord {
                name: name.to_string(),
                text: value.to_string(),
                raw: format!(" {value}\n"),
                addresses: Vec::new(),
            });
        }
        self.header_cache.clear();
    }

    /// Delete every occurrence of a header.
    pub fn delete_header(&mut self, name: &str) {
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        if self.headers.len() != before {
            self.header_cache.clear();
        }
    }

    /// Delete every header whose name satisfies the predicate.
    pub fn delete_headers_matching(&mut self, mut pred: impl FnMut(&str) -> bool) {
        let before = self.headers.len();
        self.headers.retain(|h| !pred(&h.name));
        if self.headers.len() != before {
            self.header_cache.clear();
        }
    }

    /// Render the (possibly mutated) message back to bytes: headers as kept
    /// in insertion order, a blank line, then the original raw body.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + 256);
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.push(b':');
            out.extend_from_slice(header.raw.as_bytes());
            if !header.raw.ends_with('\n') {
                out.push(b'\n');
            }
        }
        out.push(b'\n');
        out.extend_from_slice(self.raw_body());
        out
    }
}

fn header_addresses(value: &HeaderValue<'_>) -> Vec<MailAddr> {
    let mut result = Vec::new();
    if let HeaderValue::Address(address) = value {
        match address {
            Address::List(list) => collect_addrs(list, &mut result),
            Address::Group(groups) => {
                for group in groups {
                    collect_addrs(&group.addresses, &mut result);
                }
            }
        }
    }
    result
}

fn collect_addrs(list: &[mail_parser::Addr<'_>], result: &mut Vec<MailAddr>) {
    for addr in list {
        if let Some(address) = &addr.address {
            result.push(MailAddr {
                name: addr.name.as_ref().map(|n| n.to_string()),
                address: address.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Alice Example <alice@example.com>\n\
To: bob@example.org\n\
Subject: You can WIN today\n\
Message-ID: <abc123@example.com>\n\
\n\
Win a prize at http://example.com/prize now.\n\
Write to claims@example.net for details.\n";

    #[test]
    fn parse_basic() {
        let msg = Message::parse(SAMPLE.to_vec()).unwrap();
        assert_eq!(msg.headers().len(), 4);
        assert_eq!(msg.headers()[0].name, "From");
        assert_eq!(msg.headers()[0].addresses[0].address, "alice@example.com");
        assert!(msg.body_lines()[0].contains("Win a prize"));
    }

    #[test]
    fn parse_empty_is_an_error() {
        assert_eq!(Message::parse(Vec::new()).unwrap_err(), Error::Empty);
    }

    #[test]
    fn uris_include_mailto_sweep() {
        let msg = Message::parse(SAMPLE.to_vec()).unwrap();
        assert!(msg
            .uris()
            .iter()
            .any(|u| u == "http://example.com/prize"));
        assert!(msg.uris().iter().any(|u| u == "mailto:claims@example.net"));
    }

    #[test]
    fn mutation_invalidates_cache() {
        let mut msg = Message::parse(SAMPLE.to_vec()).unwrap();
        assert_eq!(
            msg.get_header("Subject", None).as_deref(),
            Some("You can WIN today")
        );
        msg.replace_header("Subject", "rewritten");
        assert_eq!(msg.get_header("Subject", None).as_deref(), Some("rewritten"));
    }

    #[test]
    fn render_round_trips_untouched_message() {
        let msg = Message::parse(SAMPLE.to_vec()).unwrap();
        assert_eq!(msg.render(), SAMPLE.to_vec());
    }
}
