/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The per-kind rule drivers. Within a priority group, negative-scoring
//! rules run before positive ones (so early-exit behaves sanely) and
//! positive rules run in descending score order.

use message::Message;
use ruleset::{CompiledRule, HeaderPart, Matcher};

use crate::{evals, Area, PerMsgStatus};

fn ordered<'a>(table: &'a [CompiledRule], scoreset: usize) -> Vec<&'a CompiledRule> {
    let mut out = Vec::with_capacity(table.len());
    let mut start = 0;
    while start < table.len() {
        let priority = table[start].priority;
        let mut end = start;
        while end < table.len() && table[end].priority == priority {
            end += 1;
        }
        let group = &table[start..end];
        out.extend(group.iter().filter(|r| r.score(scoreset) < 0.0));
        let mut positives: Vec<&CompiledRule> = group
            .iter()
            .filter(|r| r.score(scoreset) >= 0.0)
            .collect();
        positives.sort_by(|a, b| {
            b.score(scoreset)
                .partial_cmp(&a.score(scoreset))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.append(&mut positives);
        start = end;
    }
    out
}

fn header_request(header: &str, part: HeaderPart) -> String {
    match part {
        HeaderPart::Default => header.to_string(),
        HeaderPart::Addr => format!("{header}:addr"),
        HeaderPart::Name => format!("{header}:name"),
        HeaderPart::Raw => format!("{header}:raw"),
    }
}

pub(crate) fn run_header_rules(pms: &mut PerMsgStatus<'_>, msg: &mut Message) {
    for rule in ordered(&pms.conf().head, pms.scoreset) {
        if pms.skip_positive(rule) {
            continue;
        }
        match &rule.matcher {
            Matcher::Header {
                header,
                part,
                negated,
                pattern,
                if_unset,
            } => {
                let value = msg
                    .get_header(&header_request(header, *part), if_unset.as_deref())
                    .unwrap_or_default();
                match pattern.is_match(&value) {
                    Ok(matched) => {
                        if matched != *negated {
                            pms.got_hit(rule, Area::Header);
                        }
                    }
                    Err(err) => pms.rule_failed(&rule.name, &err),
                }
            }
            Matcher::HeaderExists { header } => {
                if msg.header_exists(header) {
                    pms.got_hit(rule, Area::Header);
                }
            }
            _ => (),
        }
    }
}

fn run_line_rules(
    pms: &mut PerMsgStatus<'_>,
    table: &[CompiledRule],
    lines: &[String],
    area: Area,
) {
    for rule in ordered(table, pms.scoreset) {
        if pms.skip_positive(rule) {
            continue;
        }
        let pattern = match &rule.matcher {
            Matcher::Body(p) | Matcher::Rawbody(p) | Matcher::Uri(p) => p,
            _ => continue,
        };
        for line in lines {
            match pattern.is_match(line) {
                Ok(true) => {
                    pms.got_hit(rule, area);
                    break;
                }
                Ok(false) => (),
                Err(err) => {
                    pms.rule_failed(&rule.name, &err);
                    break;
                }
            }
        }
    }
}

pub(crate) fn run_body_rules(pms: &mut PerMsgStatus<'_>, msg: &Message) {
    let table = &pms.conf().body;
    run_line_rules(pms, table, msg.body_lines(), Area::Body);
}

pub(crate) fn run_rawbody_rules(pms: &mut PerMsgStatus<'_>, msg: &Message) {
    let table = &pms.conf().rawbody;
    run_line_rules(pms, table, msg.raw_body_lines(), Area::Rawbody);
}

pub(crate) fn run_uri_rules(pms: &mut PerMsgStatus<'_>, msg: &Message) {
    let table = &pms.conf().uri;
    run_line_rules(pms, table, msg.uris(), Area::Uri);
}

pub(crate) fn run_full_rules(pms: &mut PerMsgStatus<'_>, msg: &Message) {
    let full = String::from_utf8_lossy(msg.full_text());
    for rule in ordered(&pms.conf().full, pms.scoreset) {
        if pms.skip_positive(rule) {
            continue;
        }
        let Matcher::Full(pattern) = &rule.matcher else {
            continue;
        };
        match pattern.is_match(&full) {
            Ok(true) => pms.got_hit(rule, Area::Full),
            Ok(false) => (),
            Err(err) => pms.rule_failed(&rule.name, &err),
        }
    }
}

pub(crate) fn run_eval_rules(pms: &mut PerMsgStatus<'_>, msg: &mut Message) {
    for table in [
        &pms.conf().head_eval,
        &pms.conf().body_eval,
        &pms.conf().rawbody_eval,
        &pms.conf().full_eval,
    ] {
        for rule in ordered(table, pms.scoreset) {
            if pms.skip_positive(rule) {
                continue;
            }
            let call = match &rule.matcher {
                Matcher::HeaderEval(call)
                | Matcher::BodyEval(call)
                | Matcher::RawbodyEval(call)
                | Matcher::FullEval(call) => call,
                _ => continue,
            };
            match evals::lookup(&call.function) {
                Some(eval) => match eval(pms, msg, &call.args) {
                    Ok(true) => pms.got_hit(rule, Area::Eval),
                    Ok(false) => (),
                    Err(err) => pms.rule_failed(&rule.name, &err),
                },
                None => {
                    pms.rule_failed(
                        &rule.name,
                        &format!("unknown eval function {:?}", call.function),
                    );
                }
            }
        }
    }
}

pub(crate) fn run_rbl_result_rules(pms: &mut PerMsgStatus<'_>, _msg: &Message) {
    for rule in ordered(&pms.conf().rbl_result_eval, pms.scoreset) {
        if pms.skip_positive(rule) {
            continue;
        }
        let Matcher::RblResultEval(call) = &rule.matcher else {
            continue;
        };
        if crate::rbl::check_result(pms, &call.args) {
            pms.got_hit(rule, Area::Rbl);
        }
    }
}

pub(crate) fn run_meta_rules(pms: &mut PerMsgStatus<'_>) {
    for rule in &pms.conf().meta {
        let Matcher::Meta(expr) = &rule.matcher else {
            continue;
        };
        let value = {
            let hits = |name: &str| f64::from(pms.hit_count(name));
            expr.evaluate(&hits)
        };
        match value {
            Ok(value) => {
                if value != 0.0 {
                    pms.got_hit(rule, Area::Meta);
                }
            }
            Err(err) => pms.rule_failed(&rule.name, &err),
        }
    }
}
