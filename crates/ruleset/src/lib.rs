/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod addrlist;
pub mod commands;
pub mod compile;
pub mod meta;
pub mod parse;
pub mod regexp;

use ahash::AHashMap;

use addrlist::AddrLists;
use commands::Settings;
use meta::MetaExpression;
use regexp::Pattern;

pub const VERSION: f64 = 4.0;

/// Rules prefixed `T_` are in-test and score 0.01 unless given a score.
pub const TEST_RULE_SCORE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPart {
    Default,
    Addr,
    Name,
    Raw,
}

#[derive(Debug, Clone)]
pub struct EvalCall {
    pub function: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestFlags {
    pub net: bool,
    pub nice: bool,
    pub learn: bool,
    pub userconf: bool,
}

/// What a rule matches on. Eval variants dispatch into the engine's
/// registered callback table.
#[derive(Debug, Clone, Default)]
pub enum Matcher {
    #[default]
    None,
    Header {
        header: String,
        part: HeaderPart,
        negated: bool,
        pattern: Pattern,
        if_unset: Option<String>,
    },
    HeaderExists {
        header: String,
    },
    HeaderEval(EvalCall),
    Body(Pattern),
    BodyEval(EvalCall),
    Rawbody(Pattern),
    RawbodyEval(EvalCall),
    Uri(Pattern),
    Full(Pattern),
    FullEval(EvalCall),
    Meta(MetaExpression),
    RblEval(EvalCall),
    RblResultEval(EvalCall),
}

impl Matcher {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Matcher::None => "undefined",
            Matcher::Header { .. } | Matcher::HeaderExists { .. } => "header",
            Matcher::HeaderEval(_) => "header eval",
            Matcher::Body(_) => "body",
            Matcher::BodyEval(_) => "body eval",
            Matcher::Rawbody(_) => "rawbody",
            Matcher::RawbodyEval(_) => "rawbody eval",
            Matcher::Uri(_) => "uri",
            Matcher::Full(_) => "full",
            Matcher::FullEval(_) => "full eval",
            Matcher::Meta(_) => "meta",
            Matcher::RblEval(_) => "rbl eval",
            Matcher::RblResultEval(_) => "rbl result eval",
        }
    }
}

/// Accumulated per-name state while the configuration is being parsed.
/// Commands may arrive in any order, so everything is optional until
/// `finish_parsing` reconciles it.
#[derive(Debug, Clone, Default)]
pub struct PendingRule {
    pub matcher: Matcher,
    pub scores: Option<Vec<f64>>,
    pub description: Option<String>,
    pub tflags: TestFlags,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub matcher: Matcher,
    pub tflags: TestFlags,
    pub priority: i32,
    pub description: String,
    pub scores: [f64; 4],
}

impl CompiledRule {
    pub fn is_subrule(&self) -> bool {
        self.name.starts_with("__")
    }

    pub fn score(&self, scoreset: usize) -> f64 {
        self.scores[scoreset & 3]
    }
}

/// Report templates accumulate line by line; placeholders are substituted
/// literally at rewrite time.
#[derive(Debug, Clone, Default)]
pub struct Templates {
    pub report: String,
    pub unsafe_report: String,
    pub terse_report: String,
    pub spamtrap: String,
}

#[derive(Debug, Default, Clone)]
pub struct Conf {
    pub rules: AHashMap<String, PendingRule>,
    pub settings: Settings,
    pub addrlists: AddrLists,
    pub templates: Templates,
    pub loaded_plugins: Vec<String>,
    pub locale: String,
    /// Total parse failures; lint mode surfaces this to the caller.
    pub errors: u32,
    pub lint: bool,
    pub lint_messages: Vec<String>,
}

impl Conf {
    pub fn new() -> Self {
        Conf {
            locale: std::env::var("LANG").unwrap_or_default(),
            ..Default::default()
        }
    }

    pub(crate) fn warn(&mut self, message: String) {
        self.errors += 1;
        if self.lint {
            self.lint_messages.push(message.clone());
        }
        tracing::warn!(context = "config", "{message}");
    }
}

/// The immutable product of `finish_parsing`: typed rule tables grouped by
/// ascending priority, four scoresets, lists and templates. Shared read-only
/// by every classification.
#[derive(Debug, Default)]
pub struct CompiledRuleset {
    pub settings: Settings,
    pub addrlists: AddrLists,
    pub templates: Templates,

    pub head: Vec<CompiledRule>,
    pub body: Vec<CompiledRule>,
    pub rawbody: Vec<CompiledRule>,
    pub uri: Vec<CompiledRule>,
    pub full: Vec<CompiledRule>,
    pub head_eval: Vec<CompiledRule>,
    pub body_eval: Vec<CompiledRule>,
    pub rawbody_eval: Vec<CompiledRule>,
    pub full_eval: Vec<CompiledRule>,
    pub rbl_eval: Vec<CompiledRule>,
    pub rbl_result_eval: Vec<CompiledRule>,
    /// Topologically ordered: a meta rule appears after every meta it
    /// references.
    pub meta: Vec<CompiledRule>,

    /// Rule name to four-slot score vector, sub-rules excluded.
    pub scores: AHashMap<String, [f64; 4]>,
    pub descriptions: AHashMap<String, String>,

    /// Problems found across parse and compile; lint mode reports these and
    /// exits non-zero.
    pub parse_errors: u32,
    pub lint_messages: Vec<String>,
}

impl CompiledRuleset {
    /// The active scoreset index for one classification:
    /// bit 0 = Bayes available, bit 1 = network tests enabled.
    pub fn scoreset_index(bayes: bool, net: bool) -> usize {
        (bayes as usize) | ((net as usize) << 1)
    }

    pub fn score_for(&self, name: &str, scoreset: usize) -> f64 {
        self.scores
            .get(name)
            .map(|s| s[scoreset & 3])
            .unwrap_or_default()
    }
}
