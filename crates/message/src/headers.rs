/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::LazyLock;

use fancy_regex::Regex;
use mail_parser::{Address, HeaderValue};

use crate::Message;

static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>\s]+@[^<>\s]+)>").unwrap());
static BARE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^<>\s,;]+@[^<>\s,;]+)").unwrap());
static QUOTED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*"?([^"<]*[^"<\s])"?\s*<"#).unwrap());
static COMMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)").unwrap());

/// Render a parsed header value back to text. Structured values the parser
/// recognised (addresses, content types) are rendered; everything else falls
/// back to the unfolded raw value.
pub(crate) fn header_value_text(value: &HeaderValue<'_>, raw: &str) -> String {
    match value {
        HeaderValue::Text(text) => text.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(address) => {
            let mut out = String::new();
            let mut push = |name: &Option<std::borrow::Cow<'_, str>>,
                            addr: &Option<std::borrow::Cow<'_, str>>| {
                if !out.is_empty() {
                    out.push_str(", ");
                }
                match (name, addr) {
                    (Some(name), Some(addr)) => {
                        out.push('"');
                        out.push_str(name);
                        out.push_str("\" <");
                        out.push_str(addr);
                        out.push('>');
                    }
                    (None, Some(addr)) => out.push_str(addr),
                    (Some(name), None) => out.push_str(name),
                    (None, None) => (),
                }
            };
            match address {
                Address::List(list) => {
                    for addr in list {
                        push(&addr.name, &addr.address);
                    }
                }
                Address::Group(groups) => {
                    for group in groups {
                        for addr in &group.addresses {
                            push(&addr.name, &addr.address);
                        }
                    }
                }
            }
            out
        }
        HeaderValue::ContentType(ct) => match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        },
        _ => unfold(raw),
    }
}

fn unfold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (idx, line) in raw.lines().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(line.trim_matches(['\r', ' ', '\t']));
    }
    out.trim().to_string()
}

fn strip_comments(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut depth = 0usize;
    for ch in value.chars() {
        match ch {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => (),
        }
    }
    out
}

/// Extract the first email address from a header value: strip parenthesised
/// comments, then prefer `"Name" <addr>` over a bare address.
pub fn extract_address(value: &str) -> Option<String> {
    let stripped = strip_comments(value);
    if let Ok(Some(found)) = ANGLE_ADDR.captures(&stripped) {
        return found.get(1).map(|m| m.as_str().to_string());
    }
    if let Ok(Some(found)) = BARE_ADDR.captures(&stripped) {
        return found.get(1).map(|m| m.as_str().to_string());
    }
    None
}

/// Extract the display name: `"Name" <addr>` first, `addr (Name)` second.
pub fn extract_name(value: &str) -> Option<String> {
    if let Ok(Some(found)) = QUOTED_NAME.captures(value) {
        return found.get(1).map(|m| m.as_str().trim().to_string());
    }
    if let Ok(Some(found)) = COMMENT_NAME.captures(value) {
        return found.get(1).map(|m| m.as_str().trim().to_string());
    }
    None
}

enum Part {
    Default,
    Addr,
    Name,
    Raw,
}

impl Message {
    /// Header accessor DSL: `Name`, `Name:addr`, `Name:name`, `Name:raw`,
    /// `ALL`, `ToCc`. Multi-valued headers join with newline. Every result is
    /// cached under the raw request key until a header mutation.
    pub fn get_header(&mut self, request: &str, default: Option<&str>) -> Option<String> {
        if let Some(cached) = self.cache_get(request) {
            return cached.or_else(|| default.map(|d| d.to_string()));
        }
        let value = self.lookup_header(request);
        self.cache_put(request.to_string(), value.clone());
        value.or_else(|| default.map(|d| d.to_string()))
    }

    fn lookup_header(&self, request: &str) -> Option<String> {
        let (name, part) = match request.rsplit_once(':') {
            Some((name, "addr")) => (name, Part::Addr),
            Some((name, "name")) => (name, Part::Name),
            Some((name, "raw")) => (name, Part::Raw),
            _ => (request, Part::Default),
        };

        match name {
            "ALL" => {
                let mut out = String::new();
                for header in self.headers() {
                    out.push_str(&header.name);
                    out.push_str(": ");
                    out.push_str(&header.text);
                    out.push('\n');
                }
                if out.is_empty() {
                    None
                } else {
                    Some(out)
                }
            }
            "ToCc" => {
                let to = self.lookup_header("To");
                let cc = self.lookup_header("Cc");
                match (to, cc) {
                    (Some(to), Some(cc)) => Some(format!("{to}\n{cc}")),
                    (Some(v), None) | (None, Some(v)) => Some(v),
                    (None, None) => None,
                }
            }
            _ => {
                let matching = self
                    .headers()
                    .iter()
                    .filter(|h| h.name.eq_ignore_ascii_case(name));
                match part {
                    Part::Default => {
                        let values: Vec<&str> = matching.map(|h| h.text.as_str()).collect();
                        if values.is_empty() {
                            None
                        } else {
                            Some(values.join("\n"))
                        }
                    }
                    Part::Raw => {
                        let values: Vec<String> = matching
                            .map(|h| h.raw.trim_end_matches(['\r', '\n']).to_string())
                            .collect();
                        if values.is_empty() {
                            None
                        } else {
                            Some(values.join("\n"))
                        }
                    }
                    Part::Addr => matching
                        .filter_map(|h| {
                            h.addresses
                                .first()
                                .map(|a| a.address.clone())
                                .or_else(|| extract_address(&h.text))
                        })
                        .next(),
                    Part::Name => matching
                        .filter_map(|h| {
                            h.addresses
                                .first()
                                .and_then(|a| a.name.clone())
                                .or_else(|| extract_name(&h.text))
                        })
                        .next(),
                }
            }
        }
    }

    pub fn header_exists(&self, name: &str) -> bool {
        self.headers()
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use crate::Message;

    use super::{extract_address, extract_name};

    #[test]
    fn address_forms() {
        assert_eq!(
            extract_address("\"Alice\" <alice@example.com>").as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            extract_address("bob@example.org (Bob)").as_deref(),
            Some("bob@example.org")
        );
        assert_eq!(extract_address("no address here"), None);
    }

    #[test]
    fn name_forms() {
        assert_eq!(
            extract_name("\"Alice A.\" <alice@example.com>").as_deref(),
            Some("Alice A.")
        );
        assert_eq!(
            extract_name("bob@example.org (Bob B.)").as_deref(),
            Some("Bob B.")
        );
    }

    #[test]
    fn dsl_requests() {
        let raw = b"From: \"Alice\" <alice@example.com>\n\
To: bob@example.org\n\
Cc: carol@example.net\n\
Subject: hello\n\
\n\
body\n";
        let mut msg = Message::parse(raw.to_vec()).unwrap();
        assert_eq!(
            msg.get_header("From:addr", None).as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(msg.get_header("From:name", None).as_deref(), Some("Alice"));
        assert_eq!(
            msg.get_header("ToCc", None).as_deref(),
            Some("bob@example.org\ncarol@example.net")
        );
        assert!(msg.get_header("ALL", None).unwrap().contains("Subject: hello"));
        assert_eq!(msg.get_header("Missing", Some("dflt")).as_deref(), Some("dflt"));
        assert_eq!(
            msg.get_header("Subject:raw", None).as_deref(),
            Some(" hello")
        );
    }
}
