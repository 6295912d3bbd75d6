/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Reputation-list plumbing. Queries are recorded ("launched") before the
//! local tests run and resolved ("harvested") afterwards; result rules then
//! match on what the harvest recorded per set.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use ahash::AHashMap;
use fancy_regex::Regex;
use message::Message;
use ruleset::Matcher;

use crate::{Area, PerMsgStatus};

static RECEIVED_IP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[\(](\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})[\]\)]").unwrap());

#[derive(Debug, Default)]
pub(crate) struct RblState {
    pending: Vec<PendingQuery>,
    /// Set name to the addresses the lookups returned.
    hits: AHashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct PendingQuery {
    rule: usize,
    set: String,
    queries: Vec<String>,
}

fn is_reserved(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || octets[0] == 0
        || octets[0] >= 224
}

/// Relay addresses from the Received chain, first appearance order.
fn relay_ips(msg: &Message) -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    for header in msg.headers() {
        if !header.name.eq_ignore_ascii_case("Received") {
            continue;
        }
        for found in RECEIVED_IP.captures_iter(&header.text).flatten() {
            if let Some(ip) = found.get(1).and_then(|m| m.as_str().parse::<Ipv4Addr>().ok()) {
                if !is_reserved(ip) && !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
    }
    ips
}

fn reverse_query(ip: Ipv4Addr, zone: &str) -> String {
    let octets = ip.octets();
    format!(
        "{}.{}.{}.{}.{}",
        octets[3],
        octets[2],
        octets[1],
        octets[0],
        zone.trim_end_matches('.')
    )
}

/// Record the queries each reputation rule wants. No network traffic happens
/// here; the resolver is only consulted at harvest time.
pub(crate) fn launch_queries(pms: &mut PerMsgStatus<'_>, msg: &Message) {
    if !pms.runtime().net_available() {
        return;
    }
    let ips = relay_ips(msg);
    if ips.is_empty() {
        return;
    }
    for (idx, rule) in pms.conf().rbl_eval.iter().enumerate() {
        let Matcher::RblEval(call) = &rule.matcher else {
            continue;
        };
        let (Some(set), Some(zone)) = (call.args.first(), call.args.get(1)) else {
            continue;
        };
        pms.rbl.pending.push(PendingQuery {
            rule: idx,
            set: set.clone(),
            queries: ips.iter().map(|ip| reverse_query(*ip, zone)).collect(),
        });
    }
}

/// Resolve the recorded queries. A rule whose set collected any address is a
/// hit; a timeout simply leaves its set empty.
pub(crate) fn harvest_queries(pms: &mut PerMsgStatus<'_>, _msg: &Message) {
    let pending = std::mem::take(&mut pms.rbl.pending);
    let resolver = pms.runtime().dns.clone();
    for query in pending {
        let mut listed = false;
        for name in &query.queries {
            if let Some(addrs) = resolver.lookup_a(name) {
                if !addrs.is_empty() {
                    listed = true;
                    pms.rbl
                        .hits
                        .entry(query.set.clone())
                        .or_default()
                        .extend(addrs.iter().map(|a| a.to_string()));
                }
            }
        }
        if listed {
            if let Some(rule) = pms.conf().rbl_eval.get(query.rule) {
                pms.got_hit(rule, Area::Rbl);
            }
        }
    }
}

/// `check_rbl_sub(set, address)`: did the named set collect the given
/// address (or anything at all, when no address is given)?
pub(crate) fn check_result(pms: &PerMsgStatus<'_>, args: &[String]) -> bool {
    let Some(set) = args.first() else {
        return false;
    };
    match pms.rbl.hits.get(set) {
        Some(addrs) => match args.get(1) {
            Some(wanted) => addrs.iter().any(|a| a == wanted),
            None => !addrs.is_empty(),
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use message::Message;
    use ruleset::Conf;

    use crate::dns::DnsResolver;
    use crate::{check, Runtime};

    /// A scripted resolver: one listed name, everything else misses.
    struct ScriptedResolver {
        listed: String,
    }

    impl DnsResolver for ScriptedResolver {
        fn lookup_a(&self, name: &str) -> Option<Vec<Ipv4Addr>> {
            (name == self.listed).then(|| vec![Ipv4Addr::new(127, 0, 0, 2)])
        }
    }

    fn runtime(resolver: Arc<dyn DnsResolver>) -> Runtime {
        let mut conf = Conf::new();
        conf.parse(
            "header RBL_TEST eval:check_rbl('testset', 'rbl.example.')\n\
             score RBL_TEST 2.0\n\
             tflags RBL_TEST net\n\
             header RBL_SUB eval:check_rbl_sub('testset', '127.0.0.2')\n\
             score RBL_SUB 1.5\n\
             tflags RBL_SUB net\n",
            false,
        );
        assert_eq!(conf.errors, 0, "{:?}", conf.lint_messages);
        Runtime::new(conf.finish_parsing(), None, resolver)
    }

    const RAW: &str = "Received: from mail.example.net (mail.example.net [203.0.113.5])\n\
\tby mx.example.org with ESMTP\n\
Subject: hello\n\
\n\
body\n";

    #[test]
    fn listed_relay_hits_rbl_and_sub_rules() {
        let runtime = runtime(Arc::new(ScriptedResolver {
            listed: "5.113.0.203.rbl.example".to_string(),
        }));
        let mut msg = Message::parse(RAW.as_bytes().to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert!(pms.tests_hit.iter().any(|t| t == "RBL_TEST"));
        assert!(pms.tests_hit.iter().any(|t| t == "RBL_SUB"));
        assert!((pms.score - 3.5).abs() < 1e-9);
    }

    #[test]
    fn unlisted_relay_hits_nothing() {
        let runtime = runtime(Arc::new(ScriptedResolver {
            listed: "nowhere".to_string(),
        }));
        let mut msg = Message::parse(RAW.as_bytes().to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert!(pms.tests_hit.is_empty());
    }

    #[test]
    fn skip_rbl_checks_disables_queries() {
        let mut conf = Conf::new();
        conf.parse(
            "header RBL_TEST eval:check_rbl('testset', 'rbl.example.')\n\
             skip_rbl_checks 1\n",
            false,
        );
        let runtime = Runtime::new(
            conf.finish_parsing(),
            None,
            Arc::new(ScriptedResolver {
                listed: "5.113.0.203.rbl.example".to_string(),
            }),
        );
        let mut msg = Message::parse(RAW.as_bytes().to_vec()).unwrap();
        let pms = check(&runtime, &mut msg, false);
        assert!(pms.tests_hit.is_empty());
    }
}
