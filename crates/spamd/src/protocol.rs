/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The SPAMC/SPAMD line protocol: CRLF-terminated ASCII headers framed by
//! `Content-length`. Floats on the wire always use a `.` decimal separator.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SERVER_VERSION: &str = "SPAMD/1.1";
pub const CLIENT_VERSION: &str = "SPAMC/1.3";

pub const EX_OK: u16 = 0;
pub const EX_DATAERR: u16 = 65;
pub const EX_UNAVAILABLE: u16 = 69;
pub const EX_IOERR: u16 = 74;
pub const EX_PROTOCOL: u16 = 76;

const MAX_LINE: usize = 1024;
const MAX_BODY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Check,
    Symbols,
    Report,
    ReportIfspam,
    Process,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Check => "CHECK",
            Verb::Symbols => "SYMBOLS",
            Verb::Report => "REPORT",
            Verb::ReportIfspam => "REPORT_IFSPAM",
            Verb::Process => "PROCESS",
        }
    }

    fn parse(value: &str) -> Option<Verb> {
        Some(match value {
            "CHECK" => Verb::Check,
            "SYMBOLS" => Verb::Symbols,
            "REPORT" => Verb::Report,
            "REPORT_IFSPAM" => Verb::ReportIfspam,
            "PROCESS" => Verb::Process,
            _ => return None,
        })
    }
}

#[derive(Debug)]
pub struct Request {
    pub verb: Verb,
    pub version: String,
    pub user: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    BadRequestLine(String),
    BadHeader(String),
    MissingContentLength,
    BodyTooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(err) => write!(f, "connection failed: {err}"),
            ProtocolError::BadRequestLine(line) => write!(f, "bad request line {line:?}"),
            ProtocolError::BadHeader(line) => write!(f, "bad header line {line:?}"),
            ProtocolError::MissingContentLength => f.write_str("missing Content-length header"),
            ProtocolError::BodyTooLarge(n) => write!(f, "declared body of {n} bytes is too large"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

/// Read one CRLF-terminated line (the terminator is stripped).
async fn read_line<S>(stream: &mut S) -> Result<String, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte);
        if line.len() > MAX_LINE {
            return Err(ProtocolError::BadHeader("line too long".to_string()));
        }
    }
}

/// Parse one request: verb line, headers, then exactly `Content-length`
/// bytes of message. Reading stops at the body boundary so a following
/// request on the same stream stays intact.
pub async fn read_request<S>(stream: &mut S) -> Result<Request, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let request_line = read_line(stream).await?;
    let (verb, version) = request_line
        .split_once(' ')
        .and_then(|(verb, version)| {
            let version = version.trim().strip_prefix("SPAMC/")?;
            Some((Verb::parse(verb.trim())?, version.to_string()))
        })
        .ok_or(ProtocolError::BadRequestLine(request_line.clone()))?;

    let mut user = None;
    let mut content_length: Option<usize> = None;
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::BadHeader(line));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("User") {
            user = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Content-length") {
            content_length = Some(
                value
                    .parse()
                    .map_err(|_| ProtocolError::BadHeader(line.clone()))?,
            );
        }
        // Unknown headers are tolerated for forward compatibility.
    }

    let length = content_length.ok_or(ProtocolError::MissingContentLength)?;
    if length > MAX_BODY {
        return Err(ProtocolError::BodyTooLarge(length));
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    Ok(Request {
        verb,
        version,
        user,
        body,
    })
}

/// The verdict header: floats rendered with `.` regardless of locale.
pub fn spam_header(is_spam: bool, score: f64, required: f64) -> String {
    format!(
        "Spam: {} ; {:.1} / {:.1}",
        if is_spam { "True" } else { "False" },
        score,
        required
    )
}

pub async fn write_response<S>(
    stream: &mut S,
    code: u16,
    code_name: &str,
    headers: &[String],
    body: Option<&[u8]>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(256 + body.map_or(0, <[u8]>::len));
    out.extend_from_slice(format!("{SERVER_VERSION} {code} {code_name}\r\n").as_bytes());
    for header in headers {
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(body) = body {
        out.extend_from_slice(format!("Content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    stream.write_all(&out).await?;
    stream.flush().await
}

pub async fn write_error<S>(stream: &mut S, code: u16, code_name: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, code, code_name, &[], None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_a_check_request() {
        let raw = b"CHECK SPAMC/1.3\r\nContent-length: 5\r\n\r\nhellonext";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let request = read_request(&mut cursor).await.unwrap();
        assert_eq!(request.verb, Verb::Check);
        assert_eq!(request.version, "1.3");
        assert_eq!(request.body, b"hello");
        // The next request's bytes are untouched.
        assert_eq!(cursor.position(), (raw.len() - 4) as u64);
    }

    #[tokio::test]
    async fn parses_user_header() {
        let raw = b"PROCESS SPAMC/1.3\r\nUser: alice\r\nContent-length: 0\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let request = read_request(&mut cursor).await.unwrap();
        assert_eq!(request.verb, Verb::Process);
        assert_eq!(request.user.as_deref(), Some("alice"));
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_request_line() {
        let raw = b"FROBNICATE SPAMC/1.3\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        assert!(matches!(
            read_request(&mut cursor).await,
            Err(ProtocolError::BadRequestLine(_))
        ));
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected() {
        let raw = b"CHECK SPAMC/1.3\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        assert!(matches!(
            read_request(&mut cursor).await,
            Err(ProtocolError::MissingContentLength)
        ));
    }

    #[test]
    fn spam_header_format() {
        assert_eq!(spam_header(true, 6.04, 5.0), "Spam: True ; 6.0 / 5.0");
        assert_eq!(spam_header(false, 2.5, 5.0), "Spam: False ; 2.5 / 5.0");
    }

    #[tokio::test]
    async fn response_framing() {
        let mut out = Vec::new();
        write_response(
            &mut out,
            EX_OK,
            "EX_OK",
            &[spam_header(false, 0.0, 5.0)],
            Some(b"BODY"),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            b"SPAMD/1.1 0 EX_OK\r\nSpam: False ; 0.0 / 5.0\r\nContent-length: 4\r\n\r\nBODY"
        );
    }
}
