/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The eval callback registry: named evaluator functions with a fixed
//! argument convention, dispatched by rule tables. An unknown name or a
//! failing evaluator counts as a rule error and the rule does not hit.

use std::sync::LazyLock;

use fancy_regex::Regex;
use message::{headers::extract_address, Message};

use crate::PerMsgStatus;

pub type EvalFn = fn(&mut PerMsgStatus<'_>, &mut Message, &[String]) -> Result<bool, String>;

pub fn lookup(name: &str) -> Option<EvalFn> {
    Some(match name {
        "check_bayes" => check_bayes,
        "check_for_missing_to_header" => check_for_missing_to_header,
        "check_for_to_in_subject" => check_for_to_in_subject,
        "check_from_in_whitelist" => check_from_in_whitelist,
        "check_from_in_blacklist" => check_from_in_blacklist,
        "check_to_in_whitelist" => check_to_in_whitelist,
        "check_to_in_more_spam" => check_to_in_more_spam,
        "check_to_in_all_spam" => check_to_in_all_spam,
        "check_for_unique_subject_id" => check_for_unique_subject_id,
        "check_for_shifted_date" => check_for_shifted_date,
        "check_for_forged_received_trail" => check_for_forged_received_trail,
        "check_for_mime_html" => check_for_mime_html,
        "check_for_mime_html_only" => check_for_mime_html_only,
        "check_for_uppercase" => check_for_uppercase,
        "check_language" => check_language,
        _ => return None,
    })
}

fn arg_f64(args: &[String], idx: usize) -> Result<f64, String> {
    args.get(idx)
        .ok_or_else(|| format!("missing argument {idx}"))?
        .parse::<f64>()
        .map_err(|_| format!("argument {idx} is not a number: {:?}", args[idx]))
}

/// `check_bayes(min, max)`: the posterior falls inside [min, max).
fn check_bayes(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    args: &[String],
) -> Result<bool, String> {
    if !pms.runtime().bayes_available() {
        return Ok(false);
    }
    let min = arg_f64(args, 0)?;
    let max = arg_f64(args, 1)?;
    let prob = pms.bayes_probability(msg);
    Ok(prob >= min && prob < max)
}

fn check_for_missing_to_header(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(!msg.header_exists("To") && !msg.header_exists("Apparently-To"))
}

fn check_for_to_in_subject(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    let Some(to) = msg.get_header("To:addr", None) else {
        return Ok(false);
    };
    let Some(subject) = msg.get_header("Subject", None) else {
        return Ok(false);
    };
    Ok(subject.to_lowercase().contains(&to.to_lowercase()))
}

fn from_address(msg: &mut Message) -> Option<String> {
    msg.get_header("From:addr", None)
        .or_else(|| msg.get_header("Resent-From:addr", None))
}

fn received_lines(msg: &Message) -> Vec<&str> {
    msg.headers()
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Received"))
        .map(|h| h.text.as_str())
        .collect()
}

fn check_from_in_whitelist(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    let Some(from) = from_address(msg) else {
        return Ok(false);
    };
    let lists = &pms.conf().addrlists;
    Ok(lists.whitelist_from.matches(&from)
        || lists.matches_whitelist_rcvd(&from, &received_lines(msg)))
}

fn check_from_in_blacklist(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    let Some(from) = from_address(msg) else {
        return Ok(false);
    };
    Ok(pms.conf().addrlists.blacklist_from.matches(&from))
}

fn recipient_addresses(msg: &mut Message) -> Vec<String> {
    let mut addrs = Vec::new();
    for request in ["To", "Cc", "Apparently-To"] {
        if let Some(value) = msg.get_header(request, None) {
            for part in value.split([',', '\n']) {
                if let Some(addr) = extract_address(part) {
                    addrs.push(addr);
                }
            }
        }
    }
    addrs
}

fn any_recipient_matches(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    list: fn(&ruleset::addrlist::AddrLists) -> &ruleset::addrlist::AddrList,
) -> bool {
    let addrs = recipient_addresses(msg);
    let lists = &pms.conf().addrlists;
    addrs.iter().any(|addr| list(lists).matches(addr))
}

fn check_to_in_whitelist(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(any_recipient_matches(pms, msg, |l| &l.whitelist_to))
}

fn check_to_in_more_spam(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(any_recipient_matches(pms, msg, |l| &l.more_spam_to))
}

fn check_to_in_all_spam(
    pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(any_recipient_matches(pms, msg, |l| &l.all_spam_to))
}

static UNIQUE_SUBJECT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[-_:#(\[\s][a-z0-9]*\d{4,}[a-z0-9]*[)\]]?\s*$").unwrap()
});

/// Trailing tracking ids ratware appends to subjects.
fn check_for_unique_subject_id(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    let Some(subject) = msg.get_header("Subject", None) else {
        return Ok(false);
    };
    UNIQUE_SUBJECT_ID
        .is_match(&subject)
        .map_err(|err| err.to_string())
}

/// `check_for_shifted_date(min, max)`: the Date header is between min and
/// max hours away from the time of the check.
fn check_for_shifted_date(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    args: &[String],
) -> Result<bool, String> {
    let min = arg_f64(args, 0)?;
    let max = arg_f64(args, 1)?;
    let Some(date) = msg.get_header("Date", None) else {
        return Ok(false);
    };
    let Some(sent) = parse_rfc2822_date(&date) else {
        return Ok(false);
    };
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let shift_hours = (sent - now) as f64 / 3600.0;
    Ok(shift_hours >= min && shift_hours < max)
}

/// Every relay should name the previous hop: a `by` host that never shows up
/// in the next `from` clause points at a fabricated chain.
fn check_for_forged_received_trail(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    static FROM_HOST: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\bfrom\s+([A-Za-z0-9._-]+)").unwrap());
    static BY_HOST: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\bby\s+([A-Za-z0-9._-]+)").unwrap());

    let mut hops = Vec::new();
    for line in received_lines(msg) {
        let from = FROM_HOST
            .captures(line)
            .ok()
            .flatten()
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase());
        let by = BY_HOST
            .captures(line)
            .ok()
            .flatten()
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase());
        hops.push((from, by));
    }
    // Received headers are newest-first: hop N was appended by the host that
    // hop N-1 claims to have come from.
    for pair in hops.windows(2) {
        if let ((Some(from), _), (_, Some(by))) = (&pair[0], &pair[1]) {
            if !from.contains(by.as_str()) && !by.contains(from.as_str()) {
                let from_tail = from.splitn(2, '.').nth(1).unwrap_or(from.as_str());
                let by_tail = by.splitn(2, '.').nth(1).unwrap_or(by.as_str());
                if from_tail != by_tail {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn check_for_mime_html(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(msg
        .part_content_types()
        .iter()
        .any(|ct| ct == "text/html"))
}

fn check_for_mime_html_only(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    let types = msg.part_content_types();
    Ok(types.iter().any(|ct| ct == "text/html")
        && !types.iter().any(|ct| ct == "text/plain"))
}

/// `check_for_uppercase(min, max)`: percentage of uppercase among the
/// alphabetic body characters falls inside [min, max).
fn check_for_uppercase(
    _pms: &mut PerMsgStatus<'_>,
    msg: &mut Message,
    args: &[String],
) -> Result<bool, String> {
    let min = arg_f64(args, 0)?;
    let max = arg_f64(args, 1)?;
    let mut upper = 0usize;
    let mut alpha = 0usize;
    for line in msg.body_lines() {
        for ch in line.chars() {
            if ch.is_ascii_alphabetic() {
                alpha += 1;
                if ch.is_ascii_uppercase() {
                    upper += 1;
                }
            }
        }
    }
    if alpha < 50 {
        return Ok(false);
    }
    let ratio = upper as f64 * 100.0 / alpha as f64;
    Ok(ratio >= min && ratio < max)
}

/// Language classification is an external collaborator; without it loaded,
/// nothing is ever flagged.
fn check_language(
    _pms: &mut PerMsgStatus<'_>,
    _msg: &mut Message,
    _args: &[String],
) -> Result<bool, String> {
    Ok(false)
}

const SECONDS_PER_DAY: i64 = 86_400;

/// Minimal RFC 2822 date parser: `[Day, ]DD Mon YYYY HH:MM[:SS] zone`.
/// Returns seconds since the epoch.
pub(crate) fn parse_rfc2822_date(value: &str) -> Option<i64> {
    let mut fields: Vec<&str> = value.split_whitespace().collect();
    // An optional leading weekday; the day-of-month is always numeric.
    if fields
        .first()
        .and_then(|f| f.chars().next())
        .is_some_and(char::is_alphabetic)
    {
        fields.remove(0);
    }
    if fields.len() < 5 {
        return None;
    }

    let day: i64 = fields[0].parse().ok()?;
    let month = match fields[1].to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    let year: i64 = fields[2].parse().ok()?;
    let year = if year < 100 { year + 2000 } else { year };

    let mut clock = fields[3].split(':');
    let hour: i64 = clock.next()?.parse().ok()?;
    let minute: i64 = clock.next()?.parse().ok()?;
    let second: i64 = clock.next().unwrap_or("0").parse().ok()?;

    let zone = fields[4];
    let offset = if let Some(rest) = zone.strip_prefix(['+', '-']) {
        let sign = if zone.starts_with('-') { -1 } else { 1 };
        let hours: i64 = rest.get(0..2)?.parse().ok()?;
        let minutes: i64 = rest.get(2..4)?.parse().ok()?;
        sign * (hours * 3600 + minutes * 60)
    } else {
        match zone {
            "UT" | "GMT" | "Z" | "UTC" => 0,
            "EST" => -5 * 3600,
            "EDT" => -4 * 3600,
            "CST" => -6 * 3600,
            "CDT" => -5 * 3600,
            "MST" => -7 * 3600,
            "MDT" => -6 * 3600,
            "PST" => -8 * 3600,
            "PDT" => -7 * 3600,
            _ => 0,
        }
    };

    // Days since the epoch, via the civil-from-days inverse.
    let years_since = year - 1970;
    let mut days = years_since * 365 + leap_days_between(1970, year);
    const CUMULATIVE: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    days += CUMULATIVE[month - 1];
    if month > 2 && is_leap(year) {
        days += 1;
    }
    days += day - 1;

    Some(days * SECONDS_PER_DAY + hour * 3600 + minute * 60 + second - offset)
}

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn leap_days_between(from: i64, to: i64) -> i64 {
    let count = |y: i64| y / 4 - y / 100 + y / 400;
    count(to - 1) - count(from - 1)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use message::Message;
    use ruleset::Conf;

    use crate::dns::NullResolver;
    use crate::{check, Runtime};

    use super::parse_rfc2822_date;

    fn runtime(config: &str) -> Runtime {
        let mut conf = Conf::new();
        conf.parse(config, false);
        assert_eq!(conf.errors, 0, "{:?}", conf.lint_messages);
        Runtime::new(conf.finish_parsing(), None, Arc::new(NullResolver))
    }

    #[test]
    fn date_parsing() {
        assert_eq!(
            parse_rfc2822_date("Thu, 1 Jan 1970 00:00:00 +0000"),
            Some(0)
        );
        assert_eq!(
            parse_rfc2822_date("1 Jan 1970 01:00:00 +0100"),
            Some(0)
        );
        assert_eq!(
            parse_rfc2822_date("Tue, 10 Feb 2004 10:30:00 -0500"),
            Some(1_076_427_000)
        );
        assert_eq!(parse_rfc2822_date("not a date"), None);
    }

    #[test]
    fn missing_to_eval() {
        let runtime = runtime(
            "header MISSING_TO eval:check_for_missing_to_header()\n\
             score MISSING_TO 1.2\n",
        );
        let mut msg = Message::parse(b"From: a@b.c\nSubject: s\n\nbody\n".to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert_eq!(pms.tests_hit, vec!["MISSING_TO"]);

        let mut msg =
            Message::parse(b"From: a@b.c\nTo: d@e.f\nSubject: s\n\nbody\n".to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert!(pms.tests_hit.is_empty());
    }

    #[test]
    fn whitelist_evals() {
        let runtime = runtime(
            "whitelist_from *@friends.example\n\
             header USER_IN_WHITELIST eval:check_from_in_whitelist()\n\
             score USER_IN_WHITELIST -100.0\n\
             tflags USER_IN_WHITELIST nice userconf\n",
        );
        let mut msg =
            Message::parse(b"From: pal@friends.example\nTo: me@x.y\n\nhello\n".to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert_eq!(pms.tests_hit, vec!["USER_IN_WHITELIST"]);
        assert!(pms.score < -99.0);
    }

    #[test]
    fn mime_html_only_eval() {
        let runtime = runtime(
            "header HTML_ONLY eval:check_for_mime_html_only()\n\
             score HTML_ONLY 0.5\n",
        );
        let raw = b"From: a@b.c\nContent-Type: text/html\n\n<html><b>hi there</b></html>\n";
        let mut msg = Message::parse(raw.to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert_eq!(pms.tests_hit, vec!["HTML_ONLY"]);
    }

    #[test]
    fn unique_subject_id_eval() {
        let runtime = runtime(
            "header UNIQUE_ID eval:check_for_unique_subject_id()\n\
             score UNIQUE_ID 1.0\n",
        );
        let mut msg =
            Message::parse(b"Subject: make money fast (id 48201937)\n\nbody\n".to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert_eq!(pms.tests_hit, vec!["UNIQUE_ID"]);

        let mut msg = Message::parse(b"Subject: quarterly report\n\nbody\n".to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert!(pms.tests_hit.is_empty());
    }
}
