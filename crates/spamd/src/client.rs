/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The client side of the wire protocol: frame a message, parse the verdict,
//! and fall back safely. Oversized input and unreachable daemons both pass
//! the message through untouched when safe fallback is on.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{Verb, CLIENT_VERSION, EX_IOERR, EX_OK, EX_PROTOCOL, EX_UNAVAILABLE};

/// Messages over this size are passed through unexamined.
pub const DEFAULT_MAX_SIZE: usize = 250 * 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub addr: String,
    pub user: Option<String>,
    pub max_size: usize,
    pub safe_fallback: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            addr: "127.0.0.1:783".to_string(),
            user: None,
            max_size: DEFAULT_MAX_SIZE,
            safe_fallback: true,
        }
    }
}

/// What one exchange produced. `output` is what should be emitted: the
/// response body where the verb carries one, otherwise the original message.
#[derive(Debug)]
pub struct ClientOutcome {
    pub is_spam: Option<bool>,
    pub score: f64,
    pub threshold: f64,
    pub output: Vec<u8>,
    pub code: u16,
}

impl ClientOutcome {
    fn fallback(message: &[u8], code: u16, safe: bool) -> Self {
        ClientOutcome {
            is_spam: None,
            score: 0.0,
            threshold: 0.0,
            output: message.to_vec(),
            code: if safe { EX_OK } else { code },
        }
    }
}

/// Run one message through the daemon.
pub async fn filter(verb: Verb, message: &[u8], opts: &ClientOptions) -> ClientOutcome {
    if message.len() > opts.max_size {
        return ClientOutcome::fallback(message, EX_OK, true);
    }
    match exchange(verb, message, opts).await {
        Ok(outcome) => outcome,
        Err(code) => ClientOutcome::fallback(message, code, opts.safe_fallback),
    }
}

async fn exchange(verb: Verb, message: &[u8], opts: &ClientOptions) -> Result<ClientOutcome, u16> {
    let mut conn = TcpStream::connect(&opts.addr)
        .await
        .map_err(|_| EX_UNAVAILABLE)?;

    let mut request = format!("{} {CLIENT_VERSION}\r\n", verb.as_str());
    if let Some(user) = &opts.user {
        request.push_str(&format!("User: {user}\r\n"));
    }
    request.push_str(&format!("Content-length: {}\r\n\r\n", message.len()));

    conn.write_all(request.as_bytes()).await.map_err(|_| EX_IOERR)?;
    conn.write_all(message).await.map_err(|_| EX_IOERR)?;
    conn.shutdown().await.map_err(|_| EX_IOERR)?;

    let mut response = Vec::new();
    conn.read_to_end(&mut response).await.map_err(|_| EX_IOERR)?;
    parse_response(&response, message)
}

/// A locale-independent float parser; the wire always uses `.`-separated
/// decimals.
fn parse_float(value: &str) -> Option<f64> {
    let value = value.trim();
    if value
        .strip_prefix(['-', '+'])
        .unwrap_or(value)
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.')
    {
        value.parse().ok()
    } else {
        None
    }
}

fn parse_response(response: &[u8], original: &[u8]) -> Result<ClientOutcome, u16> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(EX_PROTOCOL)?;
    let head = std::str::from_utf8(&response[..header_end]).map_err(|_| EX_PROTOCOL)?;
    let body = &response[header_end + 4..];

    let mut lines = head.split("\r\n");
    let status = lines.next().ok_or(EX_PROTOCOL)?;
    let mut status_fields = status.split_whitespace();
    let version = status_fields.next().ok_or(EX_PROTOCOL)?;
    if !version.starts_with("SPAMD/") {
        return Err(EX_PROTOCOL);
    }
    let code: u16 = status_fields
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or(EX_PROTOCOL)?;
    if code != EX_OK {
        return Err(code);
    }

    let mut is_spam = None;
    let mut score = 0.0;
    let mut threshold = 0.0;
    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("Spam") {
            // `Spam: True ; 6.3 / 5.0`
            let (flag, rest) = value.split_once(';').ok_or(EX_PROTOCOL)?;
            is_spam = Some(flag.trim().eq_ignore_ascii_case("true"));
            let (s, t) = rest.split_once('/').ok_or(EX_PROTOCOL)?;
            score = parse_float(s).ok_or(EX_PROTOCOL)?;
            threshold = parse_float(t).ok_or(EX_PROTOCOL)?;
        } else if name.eq_ignore_ascii_case("Content-length") {
            content_length = Some(value.trim().parse::<usize>().map_err(|_| EX_PROTOCOL)?);
        }
    }

    if let Some(expected) = content_length {
        if body.len() != expected {
            return Err(EX_PROTOCOL);
        }
    }

    Ok(ClientOutcome {
        is_spam,
        score,
        threshold,
        output: if content_length.is_some() {
            body.to_vec()
        } else {
            original.to_vec()
        },
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_float, parse_response};
    use crate::protocol::EX_PROTOCOL;

    #[test]
    fn parses_a_check_response() {
        let response = b"SPAMD/1.1 0 EX_OK\r\nSpam: True ; 6.3 / 5.0\r\n\r\n";
        let outcome = parse_response(response, b"orig").unwrap();
        assert_eq!(outcome.is_spam, Some(true));
        assert!((outcome.score - 6.3).abs() < 1e-9);
        assert!((outcome.threshold - 5.0).abs() < 1e-9);
        assert_eq!(outcome.output, b"orig");
    }

    #[test]
    fn parses_a_process_response_body() {
        let response =
            b"SPAMD/1.1 0 EX_OK\r\nSpam: False ; 0.0 / 5.0\r\nContent-length: 7\r\n\r\nmessage";
        let outcome = parse_response(response, b"orig").unwrap();
        assert_eq!(outcome.output, b"message");
    }

    #[test]
    fn length_mismatch_is_a_protocol_error() {
        let response =
            b"SPAMD/1.1 0 EX_OK\r\nSpam: False ; 0.0 / 5.0\r\nContent-length: 99\r\n\r\nshort";
        assert_eq!(parse_response(response, b"").unwrap_err(), EX_PROTOCOL);
    }

    #[test]
    fn error_status_propagates() {
        let response = b"SPAMD/1.1 65 EX_DATAERR\r\n\r\n";
        assert_eq!(parse_response(response, b"").unwrap_err(), 65);
    }

    #[test]
    fn float_parsing_is_locale_independent() {
        assert_eq!(parse_float(" 6.3 "), Some(6.3));
        assert_eq!(parse_float("-0.5"), Some(-0.5));
        assert_eq!(parse_float("6,3"), None);
    }
}
