/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

/// Every tunable a configuration file can set, with the defaults the
/// documentation promises.
#[derive(Debug, Clone)]
pub struct Settings {
    pub required_score: f64,
    pub rewrite_subject: bool,
    pub subject_tag: String,
    pub report_safe: u8,
    pub report_header: bool,
    pub use_terse_report: bool,
    pub report_contact: String,
    pub fold_headers: bool,
    pub spam_level_stars: bool,
    pub spam_level_char: char,
    pub defang_mime: bool,

    pub use_bayes: bool,
    pub bayes_path: PathBuf,
    pub bayes_file_mode: u32,
    pub bayes_use_hapaxes: bool,
    pub bayes_use_chi2_combining: bool,
    pub bayes_expiry_min_db_size: u64,
    pub bayes_expiry_scan_count: u64,
    pub bayes_ignore_headers: Vec<String>,
    pub auto_learn: bool,
    pub auto_learn_threshold_spam: f64,
    pub auto_learn_threshold_nonspam: f64,

    pub allow_user_rules: bool,
    pub skip_rbl_checks: bool,
    pub rbl_timeout: u64,
    pub dns_available: String,

    pub auto_whitelist_path: PathBuf,
    pub auto_whitelist_factor: f64,

    pub ok_locales: Vec<String>,
    pub ok_languages: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            required_score: 5.0,
            rewrite_subject: false,
            subject_tag: "*****SPAM*****".to_string(),
            report_safe: 1,
            report_header: false,
            use_terse_report: false,
            report_contact: "the administrator of that system".to_string(),
            fold_headers: true,
            spam_level_stars: true,
            spam_level_char: '*',
            defang_mime: false,
            use_bayes: true,
            bayes_path: PathBuf::from("~/.spamassassin/bayes"),
            bayes_file_mode: 0o700,
            bayes_use_hapaxes: true,
            bayes_use_chi2_combining: true,
            bayes_expiry_min_db_size: 100_000,
            bayes_expiry_scan_count: 5_000,
            bayes_ignore_headers: Vec::new(),
            auto_learn: true,
            auto_learn_threshold_spam: 12.0,
            auto_learn_threshold_nonspam: 0.1,
            allow_user_rules: false,
            skip_rbl_checks: false,
            rbl_timeout: 30,
            dns_available: "test".to_string(),
            auto_whitelist_path: PathBuf::from("~/.spamassassin/auto-whitelist"),
            auto_whitelist_factor: 0.5,
            ok_locales: vec!["all".to_string()],
            ok_languages: vec!["all".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateId {
    Report,
    UnsafeReport,
    TerseReport,
    Spamtrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListId {
    WhitelistFrom,
    BlacklistFrom,
    WhitelistTo,
    MoreSpamTo,
    AllSpamTo,
}

/// The typed value grammar of a setting, dispatched by the parser.
pub enum Value {
    Numeric(fn(&mut Settings, f64)),
    Boolean(fn(&mut Settings, bool)),
    Text(fn(&mut Settings, &str)),
    /// Whitespace-separated items appended to a list setting.
    Append(fn(&mut Settings, &str)),
    /// Whitespace-separated items replacing a list setting.
    Replace(fn(&mut Settings, &str)),
    Template(TemplateId),
    TemplateClear(TemplateId),
    Addrlist(ListId),
    AddrlistRemove(ListId),
}

pub struct CommandDef {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub value: Value,
    /// Requires user-rule permission when found in a per-user file.
    pub is_priv: bool,
    /// Forbidden in per-user configuration.
    pub is_admin: bool,
}

fn set_list(target: &mut Vec<String>, items: &str) {
    target.clear();
    target.extend(items.split_ascii_whitespace().map(str::to_string));
}

pub static COMMANDS: &[CommandDef] = &[
    CommandDef {
        name: "required_score",
        aliases: &["required_hits"],
        value: Value::Numeric(|s, v| s.required_score = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "rewrite_subject",
        aliases: &[],
        value: Value::Boolean(|s, v| s.rewrite_subject = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "subject_tag",
        aliases: &[],
        value: Value::Text(|s, v| s.subject_tag = v.to_string()),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "report_safe",
        aliases: &[],
        value: Value::Numeric(|s, v| s.report_safe = (v as u8).min(2)),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "report_header",
        aliases: &[],
        value: Value::Boolean(|s, v| s.report_header = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "use_terse_report",
        aliases: &[],
        value: Value::Boolean(|s, v| s.use_terse_report = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "report_contact",
        aliases: &[],
        value: Value::Text(|s, v| s.report_contact = v.to_string()),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "fold_headers",
        aliases: &[],
        value: Value::Boolean(|s, v| s.fold_headers = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "spam_level_stars",
        aliases: &[],
        value: Value::Boolean(|s, v| s.spam_level_stars = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "spam_level_char",
        aliases: &[],
        value: Value::Text(|s, v| s.spam_level_char = v.chars().next().unwrap_or('*')),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "defang_mime",
        aliases: &[],
        value: Value::Boolean(|s, v| s.defang_mime = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "report",
        aliases: &[],
        value: Value::Template(TemplateId::Report),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "clear_report_template",
        aliases: &[],
        value: Value::TemplateClear(TemplateId::Report),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "unsafe_report",
        aliases: &[],
        value: Value::Template(TemplateId::UnsafeReport),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "clear_unsafe_report_template",
        aliases: &[],
        value: Value::TemplateClear(TemplateId::UnsafeReport),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "terse_report",
        aliases: &[],
        value: Value::Template(TemplateId::TerseReport),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "clear_terse_report_template",
        aliases: &[],
        value: Value::TemplateClear(TemplateId::TerseReport),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "spamtrap",
        aliases: &[],
        value: Value::Template(TemplateId::Spamtrap),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "clear_spamtrap_template",
        aliases: &[],
        value: Value::TemplateClear(TemplateId::Spamtrap),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "whitelist_from",
        aliases: &[],
        value: Value::Addrlist(ListId::WhitelistFrom),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "unwhitelist_from",
        aliases: &[],
        value: Value::AddrlistRemove(ListId::WhitelistFrom),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "blacklist_from",
        aliases: &[],
        value: Value::Addrlist(ListId::BlacklistFrom),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "whitelist_to",
        aliases: &[],
        value: Value::Addrlist(ListId::WhitelistTo),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "more_spam_to",
        aliases: &[],
        value: Value::Addrlist(ListId::MoreSpamTo),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "all_spam_to",
        aliases: &[],
        value: Value::Addrlist(ListId::AllSpamTo),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "use_bayes",
        aliases: &[],
        value: Value::Boolean(|s, v| s.use_bayes = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_use_hapaxes",
        aliases: &[],
        value: Value::Boolean(|s, v| s.bayes_use_hapaxes = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_use_chi2_combining",
        aliases: &[],
        value: Value::Boolean(|s, v| s.bayes_use_chi2_combining = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_expiry_min_db_size",
        aliases: &[],
        value: Value::Numeric(|s, v| s.bayes_expiry_min_db_size = v as u64),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_expiry_scan_count",
        aliases: &[],
        value: Value::Numeric(|s, v| s.bayes_expiry_scan_count = v as u64),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_ignore_header",
        aliases: &[],
        value: Value::Append(|s, v| {
            s.bayes_ignore_headers
                .extend(v.split_ascii_whitespace().map(str::to_string))
        }),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "bayes_path",
        aliases: &[],
        value: Value::Text(|s, v| s.bayes_path = PathBuf::from(v)),
        is_priv: false,
        is_admin: true,
    },
    CommandDef {
        name: "bayes_file_mode",
        aliases: &[],
        value: Value::Text(|s, v| {
            if let Ok(mode) = u32::from_str_radix(v, 8) {
                s.bayes_file_mode = mode;
            }
        }),
        is_priv: false,
        is_admin: true,
    },
    CommandDef {
        name: "auto_learn",
        aliases: &[],
        value: Value::Boolean(|s, v| s.auto_learn = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "auto_learn_threshold_spam",
        aliases: &[],
        value: Value::Numeric(|s, v| s.auto_learn_threshold_spam = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "auto_learn_threshold_nonspam",
        aliases: &[],
        value: Value::Numeric(|s, v| s.auto_learn_threshold_nonspam = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "allow_user_rules",
        aliases: &[],
        value: Value::Boolean(|s, v| s.allow_user_rules = v),
        is_priv: false,
        is_admin: true,
    },
    CommandDef {
        name: "skip_rbl_checks",
        aliases: &[],
        value: Value::Boolean(|s, v| s.skip_rbl_checks = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "rbl_timeout",
        aliases: &[],
        value: Value::Numeric(|s, v| s.rbl_timeout = v as u64),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "dns_available",
        aliases: &[],
        value: Value::Text(|s, v| s.dns_available = v.to_string()),
        is_priv: false,
        is_admin: true,
    },
    CommandDef {
        name: "auto_whitelist_path",
        aliases: &[],
        value: Value::Text(|s, v| s.auto_whitelist_path = PathBuf::from(v)),
        is_priv: false,
        is_admin: true,
    },
    CommandDef {
        name: "auto_whitelist_factor",
        aliases: &[],
        value: Value::Numeric(|s, v| s.auto_whitelist_factor = v),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "ok_locales",
        aliases: &[],
        value: Value::Replace(|s, v| set_list(&mut s.ok_locales, v)),
        is_priv: false,
        is_admin: false,
    },
    CommandDef {
        name: "ok_languages",
        aliases: &[],
        value: Value::Replace(|s, v| set_list(&mut s.ok_languages, v)),
        is_priv: false,
        is_admin: false,
    },
];

pub fn lookup(name: &str) -> Option<&'static CommandDef> {
    COMMANDS
        .iter()
        .find(|def| def.name == name || def.aliases.contains(&name))
}
