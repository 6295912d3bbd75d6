/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The corpus tokenizer. Deterministic by construction: the same message
//! always yields the same token multiset, and the per-message set is
//! deduplicated before counting.

use ahash::AHashSet;
use message::Message;

const MIN_TOKEN_LEN: usize = 3;
const MAX_TOKEN_LEN: usize = 15;

/// Lowercase the leading capital of Title Case words before counting.
const FOLD_TITLE_CASE: bool = true;

/// Very common short English words that carry no signal.
static STOPLIST: &[&str] = &[
    "able", "all", "already", "and", "any", "are", "because", "both", "can", "come", "do",
    "does", "each", "email", "even", "few", "first", "for", "from", "give", "has", "have",
    "http", "information", "into", "it's", "just", "know", "like", "long", "look", "made",
    "mail", "mailing", "mailto", "make", "many", "more", "most", "much", "need", "not",
    "now", "number", "off", "one", "only", "out", "own", "people", "place", "right",
    "same", "see", "such", "that", "the", "this", "through", "time", "up", "use", "user",
    "users", "using", "web", "where", "why", "with", "without", "work", "world", "year",
    "years", "you", "you're", "your",
];

/// Digit-shadow tokens that are just received-line noise.
static NUMERIC_FINGERPRINTS: &[&str] = &["NN", "NNN", "NNNN", "NNNNN", "NNNNNN", "N.N.N.N"];

/// Headers never tokenized. Entries ending in `-` match as a prefix.
static IGNORED_HEADERS: &[&str] = &[
    "date",
    "delivery-date",
    "envelope-to",
    "errors-to",
    "lines",
    "content-length",
    "list-",
    "precedence",
    "resent-date",
    "status",
    "x-loop",
    "x-mailing-list",
    "x-spam-",
    "x-status",
    "x-uidl",
];

/// Common header names compress to two-character codes so that tokens stay
/// short and stable across header-name case variants.
fn compress_header_name(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "message-id" => "*m".to_string(),
        "received" => "*r".to_string(),
        "to" => "*to".to_string(),
        "cc" => "*c".to_string(),
        "from" => "*F".to_string(),
        "reply-to" => "*R".to_string(),
        "return-path" => "*rp".to_string(),
        "content-type" => "*ct".to_string(),
        "mime-version" => "*mv".to_string(),
        "delivered-to" => "*d".to_string(),
        other => other.to_string(),
    }
}

fn is_ignored_header(name: &str, user_ignored: &[String]) -> bool {
    let name = name.to_ascii_lowercase();
    IGNORED_HEADERS.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('-') {
            name.starts_with(prefix) && name[prefix.len()..].starts_with('-')
                || name.starts_with(entry)
        } else {
            name == *entry
        }
    }) || user_ignored.iter().any(|h| h.eq_ignore_ascii_case(&name))
}

fn token_keep_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(ch, '-' | ',' | '@' | '*' | '!' | '_' | '\'' | '"' | '$' | '.')
        || ('\u{A1}'..='\u{FF}').contains(&ch)
}

/// Expand runs of 3-6 dots or 2-6 dashes between words into tokens of their
/// own by spacing them out.
fn expand_runs(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 8);
    let chars: Vec<char> = line.chars().collect();
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '.' || ch == '-' {
            let mut run = 1;
            while idx + run < chars.len() && chars[idx + run] == ch {
                run += 1;
            }
            let (min, max) = if ch == '.' { (3, 6) } else { (2, 6) };
            let bounded_by_words = idx > 0
                && chars[idx - 1].is_alphanumeric()
                && idx + run < chars.len()
                && chars[idx + run].is_alphanumeric();
            if bounded_by_words && (min..=max).contains(&run) {
                out.push(' ');
                for _ in 0..run {
                    out.push(ch);
                }
                out.push(' ');
            } else {
                for _ in 0..run {
                    out.push(ch);
                }
            }
            idx += run;
        } else {
            out.push(ch);
            idx += 1;
        }
    }
    out
}

fn fold_title_case(token: &str) -> String {
    if FOLD_TITLE_CASE {
        let mut chars = token.chars();
        if let Some(first) = chars.next() {
            let rest = chars.as_str();
            if first.is_ascii_uppercase()
                && !rest.is_empty()
                && rest.chars().all(|c| c.is_ascii_lowercase())
            {
                let mut folded = String::with_capacity(token.len());
                folded.push(first.to_ascii_lowercase());
                folded.push_str(rest);
                return folded;
            }
        }
    }
    token.to_string()
}

/// Fold one over-long token: runs of high bytes become two-byte `8:`
/// fingerprints, anything else keeps a `sk:` stub of its first 7 characters.
fn push_long_token(token: &str, out: &mut Vec<String>) {
    let bytes = token.as_bytes();
    let has_high_pair = bytes.windows(2).any(|w| w[0] >= 0xA0 && w[1] >= 0xA0);
    if has_high_pair {
        for chunk in bytes.chunks(2) {
            if chunk.len() == 2 {
                out.push(format!("8:{:02x}{:02x}", chunk[0], chunk[1]));
            }
        }
    } else {
        let mut cut = 7.min(token.len());
        while !token.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push(format!("sk:{}", &token[..cut]));
    }
}

fn push_token(candidate: &str, out: &mut Vec<String>) {
    let token = candidate.trim_matches(['-', '\'', '"', '.', ',']);
    if token.len() < MIN_TOKEN_LEN {
        return;
    }
    let token = fold_title_case(token);
    if STOPLIST.contains(&token.to_ascii_lowercase().as_str()) {
        return;
    }
    if token.len() > MAX_TOKEN_LEN {
        push_long_token(&token, out);
        return;
    }
    let has_digits = token.chars().any(|c| c.is_ascii_digit());
    out.push(token.clone());
    if has_digits {
        let shadow: String = token
            .chars()
            .map(|c| if c.is_ascii_digit() { 'N' } else { c })
            .collect();
        if !NUMERIC_FINGERPRINTS.contains(&shadow.as_str()) {
            out.push(shadow);
        }
    }
}

/// Tokenize one line of body text.
pub fn tokenize_line(line: &str, out: &mut Vec<String>) {
    let kept: String = line
        .chars()
        .map(|ch| if token_keep_char(ch) { ch } else { ' ' })
        .collect();
    for candidate in expand_runs(&kept).split_ascii_whitespace() {
        push_token(candidate, out);
    }
}

/// Reduce a Message-ID to its shape: hex runs and digit runs collapse so
/// that one MTA's id format maps to one token.
fn reduce_message_id(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_hexdigit() {
            let mut run = String::new();
            run.push(ch);
            while let Some(next) = chars.peek() {
                if next.is_ascii_hexdigit() {
                    run.push(*next);
                    chars.next();
                } else {
                    break;
                }
            }
            if run.len() >= 4 {
                out.push(if run.chars().all(|c| c.is_ascii_digit()) {
                    'N'
                } else {
                    'H'
                });
            } else {
                out.push_str(&run);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reduce a Received line: drop transfer ids, approximate IPv4 addresses to
/// their /24 network, lowercase the routing keywords.
fn reduce_received(value: &str) -> String {
    let mut out = Vec::new();
    let mut skip_next = false;
    for word in value.split_whitespace() {
        if skip_next {
            skip_next = false;
            continue;
        }
        match word {
            "id" | "ID" => {
                skip_next = true;
                continue;
            }
            "with" | "With" | "WITH" => out.push("with".to_string()),
            "from" | "From" | "FROM" => out.push("from".to_string()),
            "for" | "For" | "FOR" => out.push("for".to_string()),
            "by" | "By" | "BY" => out.push("by".to_string()),
            _ => {
                let trimmed = word.trim_matches(['(', ')', '[', ']', ';']);
                let octets: Vec<&str> = trimmed.split('.').collect();
                if octets.len() == 4
                    && octets.iter().all(|o| o.parse::<u8>().is_ok())
                {
                    out.push(format!("{}.{}.{}", octets[0], octets[1], octets[2]));
                } else {
                    out.push(word.to_string());
                }
            }
        }
    }
    out.join(" ")
}

/// Reduce a Content-Type: keep the boundary tokens, drop the words every
/// mail has.
fn reduce_content_type(value: &str) -> String {
    value
        .split(|c: char| c == ';' || c.is_whitespace())
        .filter(|word| {
            let word = word.to_ascii_lowercase();
            !word.is_empty() && !word.starts_with("text") && !word.starts_with("charset")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokenize a whole message: body lines plus eligible headers, each header
/// token prefixed `H<code>:`. The result is deduplicated.
pub fn tokenize_message(msg: &Message, user_ignored: &[String]) -> Vec<String> {
    let mut tokens = Vec::new();

    for line in msg.body_lines() {
        tokenize_line(line, &mut tokens);
    }

    // All Received headers except the last two are upstream history and
    // mostly noise.
    let received_total = msg
        .headers()
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Received"))
        .count();
    let mut received_seen = 0;

    for header in msg.headers() {
        let is_received = header.name.eq_ignore_ascii_case("Received");
        if is_received {
            received_seen += 1;
            if received_seen + 2 <= received_total {
                continue;
            }
        } else if is_ignored_header(&header.name, user_ignored) {
            continue;
        }

        let value = if is_received {
            reduce_received(&header.text)
        } else if header.name.eq_ignore_ascii_case("Message-ID") {
            reduce_message_id(&header.text)
        } else if header.name.eq_ignore_ascii_case("Content-Type") {
            reduce_content_type(header.raw.trim())
        } else {
            header.text.clone()
        };

        let mut header_tokens = Vec::new();
        tokenize_line(&value, &mut header_tokens);
        let code = compress_header_name(&header.name);
        for token in header_tokens {
            tokens.push(format!("H{code}:{token}"));
        }
    }

    // Dedup per message; counting a token once per message keeps learn and
    // forget exact inverses.
    let mut seen = AHashSet::with_capacity(tokens.len());
    tokens.retain(|token| seen.insert(token.clone()));
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_stoplisted_tokens_are_dropped() {
        let mut out = Vec::new();
        tokenize_line("at the world of hq spam", &mut out);
        assert!(!out.contains(&"the".to_string()));
        assert!(!out.contains(&"world".to_string()));
        assert!(!out.contains(&"at".to_string()));
        assert!(out.contains(&"spam".to_string()));
    }

    #[test]
    fn title_case_is_folded() {
        let mut out = Vec::new();
        tokenize_line("Hello WORLD2 miXed", &mut out);
        assert!(out.contains(&"hello".to_string()));
        assert!(out.contains(&"WORLD2".to_string()));
        assert!(out.contains(&"miXed".to_string()));
    }

    #[test]
    fn dot_and_dash_runs_split() {
        let mut out = Vec::new();
        tokenize_line("money...fast and cash--now", &mut out);
        assert!(out.contains(&"money".to_string()));
        assert!(out.contains(&"fast".to_string()));
        assert!(out.contains(&"cash".to_string()));
        assert!(!out.contains(&"money...fast".to_string()));
    }

    #[test]
    fn long_tokens_are_folded() {
        let mut out = Vec::new();
        tokenize_line("abcdefghijklmnopqrstuvwxyz", &mut out);
        assert_eq!(out, vec!["sk:abcdefg".to_string()]);

        let mut out = Vec::new();
        let high: String = std::iter::repeat('\u{E9}').take(10).collect();
        tokenize_line(&high, &mut out);
        assert!(out.iter().all(|t| t.starts_with("8:")));
    }

    #[test]
    fn digit_tokens_emit_shadow() {
        let mut out = Vec::new();
        tokenize_line("call 1-800-555-0100x", &mut out);
        assert!(out.iter().any(|t| t.contains('N')));
    }

    #[test]
    fn message_id_reduction() {
        assert_eq!(
            reduce_message_id("<20030214093110.5a1b@mx.example.com>"),
            "<N.H@mx.example.com>"
        );
    }

    #[test]
    fn received_reduction() {
        let reduced = reduce_received(
            "from mail.example.com [192.168.10.25] by mx.example.org with ESMTP id h1DF3x",
        );
        assert!(reduced.contains("192.168.10"));
        assert!(!reduced.contains("192.168.10.25"));
        assert!(!reduced.contains("h1DF3x"));
    }

    #[test]
    fn tokenized_message_is_deduplicated() {
        let msg = message::Message::parse(
            b"From: a@example.com\nSubject: spam spam spam\n\nspam spam spam\n".to_vec(),
        )
        .unwrap();
        let tokens = tokenize_message(&msg, &[]);
        let spam_count = tokens.iter().filter(|t| *t == "spam").count();
        assert_eq!(spam_count, 1);
    }

    #[test]
    fn ignored_headers_do_not_tokenize() {
        let msg = message::Message::parse(
            b"From: a@example.com\nDate: Mon, 03 Feb 2003 10:00:00 +0000\nX-Spam-Status: old\n\nhello body\n".to_vec(),
        )
        .unwrap();
        let tokens = tokenize_message(&msg, &[]);
        assert!(!tokens.iter().any(|t| t.starts_with("Hdate:")));
        assert!(!tokens.iter().any(|t| t.starts_with("Hx-spam")));
    }
}
