/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The reporter/rewriter: given a verdict, produce the outbound message with
//! its result headers, optional subject tag, and (for spam) the report body
//! or wrapped original. `remove_markup` is the inverse.

use fancy_regex::Regex;
use message::Message;
use ruleset::commands::Settings;

use crate::{PerMsgStatus, CHECKER_VERSION};

const HOME_URL: &str = "https://stalw.art/spam-classifier";
const FOLD_COLUMN: usize = 74;
const MAX_LEVEL_STARS: usize = 40;

const REPORT_START: &str =
    "--------------------- Start of classifier results ---------------------";
const REPORT_END: &str =
    "---------------------- End of classifier results ----------------------";

const DEFAULT_REPORT: &str = "\
This mail is probably spam.  The original message has been annotated
so you can recognise or block similar unwanted mail in future.

Content analysis details:  (_HITS_ hits, _REQD_ required)
_SUMMARY_";

/// A message being re-scored must not see results from a previous pass.
pub fn strip_result_headers(msg: &mut Message) {
    msg.delete_headers_matching(|name| {
        let name = name.to_ascii_lowercase();
        name.starts_with("x-spam-") && !name.starts_with("x-spam-prev-")
    });
}

fn status_line(pms: &PerMsgStatus<'_>) -> String {
    format!(
        "{}, hits={:.1} required={:.1} tests={}",
        if pms.is_spam() { "Yes" } else { "No" },
        pms.score,
        pms.required_score(),
        pms.tests_hit.join(",")
    )
}

/// Fold a header value at 74 columns on comma boundaries.
fn fold_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut column = 0;
    for (idx, piece) in value.split(',').enumerate() {
        if idx > 0 {
            out.push(',');
            column += 1;
            if column + piece.len() > FOLD_COLUMN {
                out.push_str("\n\t");
                column = 1;
            }
        }
        out.push_str(piece);
        column += piece.len();
    }
    out
}

fn substitute(template: &str, pms: &PerMsgStatus<'_>) -> String {
    template
        .replace("_HITS_", &format!("{:.1}", pms.score))
        .replace("_REQD_", &format!("{:.1}", pms.required_score()))
        .replace("_SUMMARY_", &pms.test_log.join("\n"))
        .replace("_VER_", CHECKER_VERSION)
        .replace("_HOME_", HOME_URL)
}

/// The human-readable analysis report for this classification.
pub fn build_report(pms: &PerMsgStatus<'_>) -> String {
    let settings = &pms.conf().settings;
    let templates = &pms.conf().templates;
    let template = if settings.use_terse_report && !templates.terse_report.is_empty() {
        templates.terse_report.as_str()
    } else if !templates.report.is_empty() {
        templates.report.as_str()
    } else {
        DEFAULT_REPORT
    };
    substitute(template.trim_end_matches('\n'), pms)
}

fn subject_tag_pattern(settings: &Settings) -> Option<Regex> {
    let mut pattern = String::from("^");
    for ch in settings.subject_tag.chars() {
        match ch {
            c if c.is_ascii_alphanumeric() => pattern.push(c),
            c => {
                pattern.push('\\');
                pattern.push(c);
            }
        }
    }
    let pattern = pattern
        .replace("\\_HITS\\_", r"\d+\.?\d*")
        .replace("\\_REQD\\_", r"\d+\.?\d*");
    Regex::new(&format!(r"{pattern}\s*")).ok()
}

fn message_boundary(msg: &mut Message) -> Option<String> {
    let raw = msg.get_header("Content-Type:raw", None)?;
    let (_, rest) = raw.split_once("boundary")?;
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let boundary = if let Some(rest) = rest.strip_prefix('"') {
        rest.split('"').next()?
    } else {
        rest.split([';', ' ', '\t']).next()?
    };
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

/// A stable MIME boundary derived from the message content.
fn container_boundary(original: &[u8]) -> String {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in original {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("----------=_{hash:016X}")
}

/// Rewrite the classified message for delivery. The verdict headers always
/// go on; spam additionally gets the flag, the subject tag, and the report
/// in whichever form `report_safe` selects.
pub fn rewrite(msg: &mut Message, pms: &PerMsgStatus<'_>) -> Vec<u8> {
    let settings = pms.conf().settings.clone();
    let original = msg.render();

    msg.put_header("X-Spam-Status", &if settings.fold_headers {
        fold_value(&status_line(pms))
    } else {
        status_line(pms)
    });
    msg.put_header("X-Spam-Checker-Version", CHECKER_VERSION);
    if settings.spam_level_stars {
        let stars = (pms.score.max(0.0) as usize).min(MAX_LEVEL_STARS);
        if stars > 0 {
            msg.put_header(
                "X-Spam-Level",
                &settings.spam_level_char.to_string().repeat(stars),
            );
        }
    }

    if !pms.is_spam() {
        return msg.render();
    }

    msg.put_header("X-Spam-Flag", "YES");

    if settings.rewrite_subject {
        let subject = msg.get_header("Subject", None).unwrap_or_default();
        let tag = substitute(&settings.subject_tag, pms);
        let already_tagged = subject_tag_pattern(&settings)
            .map(|re| re.is_match(&subject).unwrap_or(false))
            .unwrap_or(false);
        if !already_tagged {
            msg.replace_header("Subject", &format!("{tag} {subject}"));
        }
    }

    let report = build_report(pms);
    match settings.report_safe {
        0 => {
            // Defang: spam keeps its body but renders as plain text.
            if settings.defang_mime {
                if let Some(prev) = msg.get_header("Content-Type:raw", None) {
                    msg.put_header("X-Spam-Prev-Content-Type", prev.trim());
                    msg.replace_header("Content-Type", "text/plain");
                }
            }
            if settings.report_header {
                msg.put_header("X-Spam-Report", &report.replace('\n', "\n\t"));
                msg.render()
            } else {
                splice_report(msg, &report)
            }
        }
        mode => {
            let mut report = report;
            if !pms.conf().templates.unsafe_report.is_empty() {
                report.push_str("\n\n");
                report.push_str(
                    substitute(pms.conf().templates.unsafe_report.trim_end_matches('\n'), pms)
                        .as_str(),
                );
            }
            wrap_original(msg, &original, &report, mode)
        }
    }
}

/// report_safe 0: the report goes into the body, after the first MIME
/// boundary when there is one, prepended otherwise.
fn splice_report(msg: &mut Message, report: &str) -> Vec<u8> {
    let boundary = message_boundary(msg);
    let rendered = msg.render();
    let split = rendered
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|p| p + 2)
        .unwrap_or(rendered.len());
    let (head, body) = rendered.split_at(split);

    let mut block = String::new();
    block.push_str(&format!("SPAM: {REPORT_START}\n"));
    for line in report.lines() {
        block.push_str("SPAM: ");
        block.push_str(line);
        block.push('\n');
    }
    block.push_str(&format!("SPAM: {REPORT_END}\n\n"));

    let mut out = Vec::with_capacity(rendered.len() + block.len());
    out.extend_from_slice(head);
    if let Some(boundary) = boundary {
        let marker = format!("--{boundary}\n");
        if let Some(pos) = find_subsequence(body, marker.as_bytes()) {
            let insert_at = pos + marker.len();
            out.extend_from_slice(&body[..insert_at]);
            out.extend_from_slice(block.as_bytes());
            out.extend_from_slice(&body[insert_at..]);
            return out;
        }
    }
    out.extend_from_slice(block.as_bytes());
    out.extend_from_slice(body);
    out
}

/// report_safe 1/2: a fresh container whose first part is the report and
/// whose second part is the untouched original, as `message/rfc822` (1) or
/// `text/plain` (2).
fn wrap_original(msg: &mut Message, original: &[u8], report: &str, mode: u8) -> Vec<u8> {
    let prev_ct = msg.get_header("Content-Type:raw", None);
    let prev_cte = msg.get_header("Content-Transfer-Encoding:raw", None);
    msg.delete_header("Content-Type");
    msg.delete_header("Content-Transfer-Encoding");
    msg.delete_header("MIME-Version");
    if let Some(prev) = prev_ct {
        msg.put_header("X-Spam-Prev-Content-Type", prev.trim());
    }
    if let Some(prev) = prev_cte {
        msg.put_header("X-Spam-Prev-Content-Transfer-Encoding", prev.trim());
    }

    let boundary = container_boundary(original);
    msg.put_header("MIME-Version", "1.0");
    msg.put_header(
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{boundary}\""),
    );

    let attachment_type = if mode == 1 {
        "message/rfc822; x-spam-type=original"
    } else {
        "text/plain; x-spam-type=original"
    };

    let mut out = Vec::with_capacity(original.len() + report.len() + 1024);
    for header in msg.headers() {
        out.extend_from_slice(header.name.as_bytes());
        out.push(b':');
        out.extend_from_slice(header.raw.as_bytes());
        if !header.raw.ends_with('\n') {
            out.push(b'\n');
        }
    }
    out.push(b'\n');
    out.extend_from_slice(b"This is a multi-part message in MIME format.\n\n");
    out.extend_from_slice(format!("--{boundary}\n").as_bytes());
    out.extend_from_slice(b"Content-Type: text/plain\n\n");
    out.extend_from_slice(report.as_bytes());
    out.extend_from_slice(b"\n\n");
    out.extend_from_slice(format!("--{boundary}\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {attachment_type}\n").as_bytes());
    out.extend_from_slice(b"Content-Description: original message before the classifier\n");
    out.extend_from_slice(b"Content-Disposition: inline\n");
    out.extend_from_slice(b"Content-Transfer-Encoding: 8bit\n\n");
    out.extend_from_slice(original);
    if !original.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(format!("--{boundary}--\n").as_bytes());
    out
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Undo everything `rewrite` did: recover a wrapped original, drop the added
/// headers, restore the defanged content type, untag the subject, and excise
/// a spliced report.
pub fn remove_markup(raw: &[u8], settings: &Settings) -> Vec<u8> {
    let Ok(mut msg) = Message::parse(raw.to_vec()) else {
        return raw.to_vec();
    };

    // A report_safe container carries the untouched original as its second
    // part; extracting it undoes everything at once.
    if let Some(original) = extract_wrapped_original(&mut msg) {
        return original;
    }

    let prev_ct = msg.get_header("X-Spam-Prev-Content-Type:raw", None);
    let prev_cte = msg.get_header("X-Spam-Prev-Content-Transfer-Encoding:raw", None);
    msg.delete_headers_matching(|name| name.to_ascii_lowercase().starts_with("x-spam-"));
    if let Some(prev) = prev_ct {
        msg.replace_header("Content-Type", prev.trim());
    }
    if let Some(prev) = prev_cte {
        msg.replace_header("Content-Transfer-Encoding", prev.trim());
    }

    if let Some(subject) = msg.get_header("Subject", None) {
        if let Some(re) = subject_tag_pattern(settings) {
            if let Ok(Some(found)) = re.find(&subject) {
                let untagged = subject[found.end()..].to_string();
                msg.replace_header("Subject", &untagged);
            }
        }
    }

    let rendered = msg.render();
    excise_spliced_report(&rendered)
}

fn extract_wrapped_original(msg: &mut Message) -> Option<Vec<u8>> {
    if !msg.header_exists("X-Spam-Flag") {
        return None;
    }
    let boundary = message_boundary(msg)?;
    let raw = msg.full_text();
    let marker = b"x-spam-type=original";
    let marker_pos = find_subsequence(raw, marker)?;
    let start = marker_pos + find_subsequence(&raw[marker_pos..], b"\n\n")? + 2;
    let closing = format!("\n--{boundary}--");
    let end = start + find_subsequence(&raw[start..], closing.as_bytes())?;
    Some(raw[start..end + 1].to_vec())
}

/// Remove the `SPAM: ` sentinel block plus the blank line that follows it.
fn excise_spliced_report(rendered: &[u8]) -> Vec<u8> {
    let split = rendered
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|p| p + 2)
        .unwrap_or(rendered.len());
    let (head, body) = rendered.split_at(split);
    let body_text = String::from_utf8_lossy(body);
    if !body_text.contains("SPAM: ----") {
        return rendered.to_vec();
    }

    let mut out_body = String::with_capacity(body_text.len());
    let mut in_report = false;
    let mut just_left_report = false;
    for line in body_text.split_inclusive('\n') {
        if line.starts_with("SPAM: ") {
            in_report = true;
            just_left_report = true;
            continue;
        }
        if in_report && just_left_report {
            just_left_report = false;
            // One blank line trails the report block.
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                continue;
            }
        }
        out_body.push_str(line);
    }

    let mut out = Vec::with_capacity(head.len() + out_body.len());
    out.extend_from_slice(head);
    out.extend_from_slice(out_body.as_bytes());
    out
}
