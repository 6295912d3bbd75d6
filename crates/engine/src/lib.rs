/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod dns;
mod drivers;
pub mod evals;
pub mod report;
pub mod rbl;

use std::sync::Arc;

use ahash::AHashMap;
use bayes::BayesDb;
use message::Message;
use ruleset::{CompiledRule, CompiledRuleset};

use dns::DnsResolver;
use rbl::RblState;

pub const CHECKER_VERSION: &str = concat!("spam-classifier ", env!("CARGO_PKG_VERSION"));

/// Regression of the total score towards the sender's long-term average.
/// The store behind it lives outside the engine; this is only the seam the
/// final classification step calls through.
pub trait AutoWhitelist: Send + Sync {
    fn adjust(&self, sender: &str, score: f64) -> f64;
}

/// Process-wide context, constructed once at startup and shared read-only by
/// every classification.
pub struct Runtime {
    pub rules: CompiledRuleset,
    pub bayes: Option<BayesDb>,
    pub dns: Arc<dyn DnsResolver>,
    pub awl: Option<Box<dyn AutoWhitelist>>,
}

impl Runtime {
    pub fn new(rules: CompiledRuleset, bayes: Option<BayesDb>, dns: Arc<dyn DnsResolver>) -> Self {
        Runtime {
            rules,
            bayes,
            dns,
            awl: None,
        }
    }

    pub fn with_auto_whitelist(mut self, awl: Box<dyn AutoWhitelist>) -> Self {
        self.awl = Some(awl);
        self
    }

    /// Build the runtime a compiled ruleset asks for: a Bayes store when
    /// `use_bayes` is on, and a real resolver unless network tests are off.
    pub fn from_ruleset(rules: CompiledRuleset) -> Self {
        let settings = &rules.settings;
        let bayes = settings.use_bayes.then(|| {
            BayesDb::new(bayes::BayesConfig {
                path: expand_home(&settings.bayes_path),
                use_hapaxes: settings.bayes_use_hapaxes,
                use_chi2_combining: settings.bayes_use_chi2_combining,
                expiry_min_db_size: settings.bayes_expiry_min_db_size,
                expiry_scan_count: settings.bayes_expiry_scan_count,
                file_mode: settings.bayes_file_mode,
                ignore_headers: settings.bayes_ignore_headers.clone(),
                ..bayes::BayesConfig::default()
            })
        });
        let dns: Arc<dyn DnsResolver> =
            if !settings.skip_rbl_checks && settings.dns_available != "no" {
                Arc::new(dns::SystemResolver {
                    timeout: std::time::Duration::from_secs(settings.rbl_timeout),
                })
            } else {
                Arc::new(dns::NullResolver)
            };
        Runtime::new(rules, bayes, dns)
    }

    pub fn bayes_available(&self) -> bool {
        self.rules.settings.use_bayes && self.bayes.is_some()
    }

    pub fn net_available(&self) -> bool {
        !self.rules.settings.skip_rbl_checks && self.rules.settings.dns_available != "no"
    }
}

/// `~` at the start of a configured path means the home directory.
pub fn expand_home(path: &std::path::Path) -> std::path::PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::Path::new(&home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Which driver produced a hit; used in the test log and for auto-learn
/// point accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Header,
    Body,
    Rawbody,
    Uri,
    Full,
    Eval,
    Rbl,
    Meta,
}

impl Area {
    fn as_str(&self) -> &'static str {
        match self {
            Area::Header => "header",
            Area::Body => "body",
            Area::Rawbody => "rawbody",
            Area::Uri => "uri",
            Area::Full => "full",
            Area::Eval => "eval",
            Area::Rbl => "rbl",
            Area::Meta => "meta",
        }
    }
}

/// Everything accumulated over one classification. Created by `check`,
/// disposed when the caller is done with the verdict; never outlives the
/// runtime it borrows.
pub struct PerMsgStatus<'r> {
    runtime: &'r Runtime,
    pub score: f64,
    pub tests_hit: Vec<String>,
    pub test_log: Vec<String>,
    pub rule_errors: u32,
    pub scoreset: usize,
    hits: AHashMap<String, u32>,
    stop_at_threshold: bool,
    early_exited: bool,
    bayes_prob: Option<f64>,
    pub(crate) rbl: RblState,
    /// Score sums in the non-Bayes scoreset, used by auto-learn gating.
    autolearn_points: f64,
    autolearn_head_points: f64,
    autolearn_body_points: f64,
}

impl<'r> PerMsgStatus<'r> {
    fn new(runtime: &'r Runtime, stop_at_threshold: bool) -> Self {
        let scoreset = CompiledRuleset::scoreset_index(
            runtime.bayes_available(),
            runtime.net_available(),
        );
        PerMsgStatus {
            runtime,
            score: 0.0,
            tests_hit: Vec::new(),
            test_log: Vec::new(),
            rule_errors: 0,
            scoreset,
            hits: AHashMap::new(),
            stop_at_threshold,
            early_exited: false,
            bayes_prob: None,
            rbl: RblState::default(),
            autolearn_points: 0.0,
            autolearn_head_points: 0.0,
            autolearn_body_points: 0.0,
        }
    }

    pub fn runtime(&self) -> &'r Runtime {
        self.runtime
    }

    pub fn conf(&self) -> &'r CompiledRuleset {
        &self.runtime.rules
    }

    pub fn required_score(&self) -> f64 {
        self.runtime.rules.settings.required_score
    }

    pub fn is_spam(&self) -> bool {
        self.score >= self.required_score()
    }

    pub fn hit_count(&self, rule: &str) -> u32 {
        self.hits.get(rule).copied().unwrap_or(0)
    }

    /// The Bayes posterior for this message, computed once and cached.
    pub fn bayes_probability(&mut self, msg: &Message) -> f64 {
        if let Some(prob) = self.bayes_prob {
            return prob;
        }
        let prob = match &self.runtime.bayes {
            Some(db) if self.runtime.rules.settings.use_bayes => db.scan(msg),
            _ => 0.5,
        };
        self.bayes_prob = Some(prob);
        prob
    }

    /// Record a hit: accumulate the active scoreset's value, remember the
    /// rule, and append a log line. Sub-rules only become meta inputs.
    pub(crate) fn got_hit(&mut self, rule: &CompiledRule, area: Area) {
        *self.hits.entry(rule.name.clone()).or_insert(0) += 1;
        if rule.is_subrule() {
            return;
        }
        let score = rule.score(self.scoreset);
        self.score += score;
        self.tests_hit.push(rule.name.clone());
        self.test_log.push(format!(
            "{score:>5.1} {:<8} {}{}{}",
            area.as_str(),
            rule.name,
            if rule.description.is_empty() { "" } else { ": " },
            rule.description
        ));

        if !rule.tflags.learn {
            // Auto-learn decisions use the non-Bayes variant of the active
            // scoreset so a drifting classifier cannot feed itself.
            let autolearn_score = rule.score(self.scoreset & !1);
            self.autolearn_points += autolearn_score;
            match area {
                Area::Header => self.autolearn_head_points += autolearn_score,
                Area::Body | Area::Rawbody | Area::Uri => {
                    self.autolearn_body_points += autolearn_score
                }
                _ => (),
            }
        }
    }

    pub(crate) fn rule_failed(&mut self, rule: &str, err: &str) {
        self.rule_errors += 1;
        tracing::warn!(
            context = "rules",
            rule = rule,
            "rule failed to execute: {err}"
        );
    }

    /// True when the early-exit mode may skip a positive-scoring rule.
    pub(crate) fn skip_positive(&mut self, rule: &CompiledRule) -> bool {
        if self.stop_at_threshold
            && rule.score(self.scoreset) > 0.0
            && self.score >= self.required_score()
        {
            self.early_exited = true;
            true
        } else {
            false
        }
    }

    pub fn early_exited(&self) -> bool {
        self.early_exited
    }
}

/// Classify one message: run every rule class in the documented order and
/// return the accumulated status. The message is only mutated to shed any
/// pre-existing result headers.
pub fn check<'r>(
    runtime: &'r Runtime,
    msg: &mut Message,
    stop_at_threshold: bool,
) -> PerMsgStatus<'r> {
    let mut pms = PerMsgStatus::new(runtime, stop_at_threshold);

    // 1. A message being re-scored must not see its previous results.
    report::strip_result_headers(msg);

    // 2. Reputation queries go out first so the network can work while the
    //    local tests run.
    rbl::launch_queries(&mut pms, msg);

    // 3-6. Pattern tests, cheapest view first.
    drivers::run_header_rules(&mut pms, msg);
    drivers::run_body_rules(&mut pms, msg);
    drivers::run_rawbody_rules(&mut pms, msg);
    drivers::run_uri_rules(&mut pms, msg);
    drivers::run_full_rules(&mut pms, msg);

    // 7. Eval callbacks.
    drivers::run_eval_rules(&mut pms, msg);

    // 8. Harvest outstanding reputation queries.
    rbl::harvest_queries(&mut pms, msg);
    drivers::run_rbl_result_rules(&mut pms, msg);

    // 9. Meta rules see the complete non-meta results.
    if !pms.early_exited() {
        drivers::run_meta_rules(&mut pms);
    }

    // 10. Auto-whitelist score regression, when a store is configured.
    if let Some(awl) = &runtime.awl {
        if let Some(sender) = msg.get_header("From:addr", None) {
            pms.score = awl.adjust(&sender, pms.score);
        }
    }

    pms
}

/// The auto-learn hand-off: feed clear-cut verdicts back into the Bayes
/// corpus. Spam learning additionally requires points from both the header
/// and the body rule groups so one lucky pattern cannot poison the corpus.
pub fn auto_learn(runtime: &Runtime, msg: &Message, pms: &PerMsgStatus<'_>) {
    let settings = &runtime.rules.settings;
    if !settings.auto_learn || !runtime.bayes_available() {
        return;
    }
    let Some(db) = &runtime.bayes else { return };

    let learn_spam = pms.autolearn_points >= settings.auto_learn_threshold_spam
        && pms.autolearn_head_points >= 3.0
        && pms.autolearn_body_points >= 3.0;
    let learn_ham = pms.autolearn_points <= settings.auto_learn_threshold_nonspam;
    if learn_spam == learn_ham {
        return;
    }

    match db.learn(learn_spam, msg) {
        Ok(true) => {
            tracing::debug!(
                context = "autolearn",
                spam = learn_spam,
                points = pms.autolearn_points,
                "message learned"
            );
        }
        Ok(false) => (),
        Err(err) => {
            tracing::warn!(context = "autolearn", "learning failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dns::NullResolver;
    use ruleset::Conf;

    pub(crate) fn runtime_for(config: &str) -> Runtime {
        let mut conf = Conf::new();
        conf.parse(config, false);
        assert_eq!(conf.errors, 0, "{:?}", conf.lint_messages);
        Runtime::new(conf.finish_parsing(), None, Arc::new(NullResolver))
    }

    fn msg(raw: &str) -> Message {
        Message::parse(raw.as_bytes().to_vec()).unwrap()
    }

    const SCENARIO_CONFIG: &str = "header FOO Subject =~ /\\bwin\\b/i\n\
score FOO 2.5\n\
required_hits 5.0\n";

    #[test]
    fn single_rule_scenario() {
        let runtime = runtime_for(SCENARIO_CONFIG);
        let mut m = msg("Subject: You can WIN today\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        assert_eq!(pms.tests_hit, vec!["FOO"]);
        assert!((pms.score - 2.5).abs() < 1e-9);
        assert!(!pms.is_spam());
    }

    #[test]
    fn meta_rule_scenario() {
        let runtime = runtime_for(
            "header FOO Subject =~ /\\bwin\\b/i\n\
             score FOO 2.5\n\
             header BAR From =~ /@example\\.com/\n\
             score BAR 3.0\n\
             meta BAZ FOO && BAR\n\
             score BAZ 4.0\n\
             required_hits 5.0\n",
        );
        let mut m = msg("Subject: You can WIN today\nFrom: a@example.com\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        // Positive header rules run in descending score order, the meta
        // rule after every non-meta result is known.
        assert_eq!(pms.tests_hit, vec!["BAR", "FOO", "BAZ"]);
        assert!((pms.score - 9.5).abs() < 1e-9);
        assert!(pms.is_spam());
    }

    #[test]
    fn subrule_suppression_scenario() {
        let runtime = runtime_for(
            "header __FOO Subject =~ /win/i\n\
             meta BAZ __FOO\n\
             score BAZ 6.0\n\
             required_hits 5.0\n",
        );
        let mut m = msg("Subject: win big\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        assert_eq!(pms.tests_hit, vec!["BAZ"]);
        assert!((pms.score - 6.0).abs() < 1e-9);
        assert!(pms.is_spam());
        assert!(!pms.tests_hit.iter().any(|t| t == "__FOO"));
    }

    #[test]
    fn classification_is_deterministic() {
        let runtime = runtime_for(
            "header A Subject =~ /x/\n\
             body B /y/\n\
             uri C /example/\n\
             meta D A && B\n",
        );
        let raw = "Subject: x marks\n\ny y http://example.com/\n";
        let first = {
            let mut m = msg(raw);
            let pms = check(&runtime, &mut m, false);
            (pms.score, pms.tests_hit.clone())
        };
        for _ in 0..3 {
            let mut m = msg(raw);
            let pms = check(&runtime, &mut m, false);
            assert_eq!((pms.score, pms.tests_hit.clone()), first);
        }
    }

    #[test]
    fn early_exit_skips_positive_rules_only() {
        let runtime = runtime_for(
            "header BIG Subject =~ /spam/\n\
             score BIG 10.0\n\
             body POS /content/\n\
             score POS 1.0\n\
             body NEG /legit/\n\
             score NEG -5.0\n\
             required_hits 5.0\n",
        );
        let mut m = msg("Subject: spam here\n\ncontent legit\n");
        let pms = check(&runtime, &mut m, true);
        assert!(pms.early_exited());
        // The positive body rule was skipped, the negative one still ran.
        assert!(pms.tests_hit.iter().any(|t| t == "NEG"));
        assert!(!pms.tests_hit.iter().any(|t| t == "POS"));
        assert!((pms.score - 5.0).abs() < 1e-9);
    }

    #[test]
    fn rule_error_does_not_abort_classification() {
        // An eval rule naming an unknown function fails; the header rule
        // still runs.
        let runtime = runtime_for(
            "header BROKEN eval:no_such_function()\n\
             header OK Subject =~ /hello/\n",
        );
        let mut m = msg("Subject: hello\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        assert_eq!(pms.rule_errors, 1);
        assert_eq!(pms.tests_hit, vec!["OK"]);
    }

    #[test]
    fn score_is_sum_over_scoreset() {
        let runtime = runtime_for(
            "header A Subject =~ /x/\n\
             score A 1.0 2.0 3.0 4.0\n",
        );
        let mut m = msg("Subject: x\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        // No Bayes handle, network enabled by default: scoreset 2.
        assert_eq!(pms.scoreset, 2);
        assert!((pms.score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn old_result_headers_are_stripped_before_scoring() {
        let runtime = runtime_for("header TRAP X-Spam-Status =~ /Yes/\n");
        let mut m = msg("Subject: s\nX-Spam-Status: Yes, hits=9.0\n\nbody\n");
        let pms = check(&runtime, &mut m, false);
        assert!(pms.tests_hit.is_empty());
        assert!(!m.header_exists("X-Spam-Status"));
    }
}
