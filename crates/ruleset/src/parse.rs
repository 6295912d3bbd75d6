/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::{Path, PathBuf};

use crate::{
    commands::{self, ListId, TemplateId, Value},
    meta::MetaExpression,
    regexp, Conf, EvalCall, HeaderPart, Matcher, VERSION,
};

const MAX_INCLUDE_DEPTH: usize = 10;

struct ParseState {
    scores_only: bool,
    base_dir: PathBuf,
    depth: usize,
    current_file: String,
    /// `require_version` mismatch skips the remainder of the current file.
    skip_file: bool,
    if_stack: Vec<bool>,
}

impl ParseState {
    fn active(&self) -> bool {
        !self.skip_file && self.if_stack.iter().all(|v| *v)
    }
}

impl Conf {
    /// Parse a configuration text. In scores-only mode (per-user preference
    /// files) privileged and admin commands are rejected; only scores, rule
    /// definitions when user rules are permitted, and address lists are
    /// accepted.
    pub fn parse(&mut self, text: &str, scores_only: bool) {
        let mut state = ParseState {
            scores_only,
            base_dir: PathBuf::from("."),
            depth: 0,
            current_file: "(config)".to_string(),
            skip_file: false,
            if_stack: Vec::new(),
        };
        self.parse_block(text, &mut state);
        if !state.if_stack.is_empty() {
            self.warn(format!("unmatched if in {}", state.current_file));
        }
    }

    pub fn parse_file(&mut self, path: &Path, scores_only: bool) -> std::io::Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut state = ParseState {
            scores_only,
            base_dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            depth: 0,
            current_file: path.display().to_string(),
            skip_file: false,
            if_stack: Vec::new(),
        };
        self.parse_block(&text, &mut state);
        if !state.if_stack.is_empty() {
            self.warn(format!("unmatched if in {}", state.current_file));
        }
        Ok(())
    }

    fn parse_block(&mut self, text: &str, state: &mut ParseState) {
        for line in text.lines() {
            let line = strip_comment(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.parse_line(line, state);
        }
    }

    fn parse_line(&mut self, line: &str, state: &mut ParseState) {
        let (cmd, params) = line
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((line, ""));

        // Conditional block directives are tracked even inside a false block.
        match cmd {
            "if" => {
                let parent_active = state.active();
                let value = if parent_active {
                    match self.eval_condition(params) {
                        Ok(value) => value,
                        Err(err) => {
                            self.warn(format!("{}: {err}", state.current_file));
                            false
                        }
                    }
                } else {
                    false
                };
                state.if_stack.push(value);
                return;
            }
            "ifplugin" => {
                state
                    .if_stack
                    .push(state.active() && self.loaded_plugins.iter().any(|p| p == params));
                return;
            }
            "else" => {
                match state.if_stack.last_mut() {
                    Some(top) => *top = !*top,
                    None => self.warn(format!("unmatched else in {}", state.current_file)),
                }
                return;
            }
            "endif" => {
                if state.if_stack.pop().is_none() {
                    self.warn(format!("unmatched endif in {}", state.current_file));
                }
                return;
            }
            _ => (),
        }

        if !state.active() {
            return;
        }

        match cmd {
            "lang" => {
                // `lang XX <line>` applies only when the current locale
                // begins with XX.
                if let Some((lang, rest)) = params.split_once(char::is_whitespace) {
                    if self
                        .locale
                        .to_ascii_lowercase()
                        .starts_with(&lang.to_ascii_lowercase())
                    {
                        self.parse_line(rest.trim(), state);
                    }
                } else {
                    self.warn(format!("invalid lang command: {line}"));
                }
            }
            "file" => match params.split_once(char::is_whitespace) {
                Some(("start", path)) => {
                    state.current_file = path.trim().to_string();
                    state.skip_file = false;
                }
                _ if params == "end" || params.starts_with("end") => {
                    state.current_file = "(config)".to_string();
                    state.skip_file = false;
                }
                _ => self.warn(format!("invalid file command: {line}")),
            },
            "include" => {
                if state.depth >= MAX_INCLUDE_DEPTH {
                    self.warn(format!("include nesting too deep at {params}"));
                    return;
                }
                let path = state.base_dir.join(params);
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        state.depth += 1;
                        let saved = std::mem::replace(
                            &mut state.current_file,
                            path.display().to_string(),
                        );
                        self.parse_block(&text, state);
                        state.current_file = saved;
                        state.depth -= 1;
                    }
                    Err(err) => {
                        self.warn(format!("cannot include {}: {err}", path.display()))
                    }
                }
            }
            "require_version" => {
                let wanted = params.trim().parse::<f64>().unwrap_or(0.0);
                if wanted != VERSION {
                    tracing::warn!(
                        context = "config",
                        file = state.current_file,
                        "configuration requires version {params}, skipping remainder of file"
                    );
                    state.skip_file = true;
                }
            }
            "whitelist_from_rcvd" | "def_whitelist_from_rcvd" => {
                let mut items = params.split_ascii_whitespace();
                match (items.next(), items.next()) {
                    (Some(addr), Some(domain)) => {
                        if let Err(err) = self.addrlists.add_whitelist_from_rcvd(addr, domain) {
                            self.warn(err);
                        }
                    }
                    _ => self.warn(format!("invalid {cmd} command: {line}")),
                }
            }
            "loadplugin" => {
                if state.scores_only {
                    self.warn("loadplugin not allowed in user configuration".to_string());
                } else {
                    let name = params
                        .split_once(char::is_whitespace)
                        .map_or(params, |(n, _)| n);
                    self.loaded_plugins.push(name.to_string());
                }
            }
            "header" | "body" | "rawbody" | "uri" | "full" | "meta" => {
                if state.scores_only && !self.settings.allow_user_rules {
                    self.warn(format!("rule definition not allowed here: {line}"));
                    return;
                }
                self.parse_rule(cmd, params, state);
            }
            "describe" => match params.split_once(char::is_whitespace) {
                Some((name, text)) if !text.trim().is_empty() => {
                    self.rules.entry(name.to_string()).or_default().description =
                        Some(text.trim().to_string());
                }
                _ => self.warn(format!("invalid describe command: {line}")),
            },
            "tflags" => {
                let mut items = params.split_ascii_whitespace();
                match items.next() {
                    Some(name) => {
                        let mut unknown = Vec::new();
                        {
                            let flags = &mut self.rules.entry(name.to_string()).or_default().tflags;
                            for flag in items {
                                match flag {
                                    "net" => flags.net = true,
                                    "nice" => flags.nice = true,
                                    "learn" => flags.learn = true,
                                    "userconf" => flags.userconf = true,
                                    other => unknown.push(other.to_string()),
                                }
                            }
                        }
                        for other in unknown {
                            self.warn(format!("unknown tflags value {other:?} for {name}"))
                        }
                    }
                    None => self.warn(format!("invalid tflags command: {line}")),
                }
            }
            "priority" => {
                let mut items = params.split_ascii_whitespace();
                match (items.next(), items.next().and_then(|v| v.parse().ok())) {
                    (Some(name), Some(priority)) => {
                        self.rules.entry(name.to_string()).or_default().priority = priority;
                    }
                    _ => self.warn(format!("invalid priority command: {line}")),
                }
            }
            "score" => {
                let mut items = params.split_ascii_whitespace();
                let Some(name) = items.next() else {
                    self.warn(format!("invalid score command: {line}"));
                    return;
                };
                let mut scores = Vec::with_capacity(4);
                for item in items {
                    match item.parse::<f64>() {
                        Ok(score) => scores.push(score),
                        Err(_) => {
                            self.warn(format!("unparsable score {item:?} for {name}"));
                            return;
                        }
                    }
                }
                if scores.is_empty() || scores.len() > 4 {
                    self.warn(format!(
                        "score for {name} needs one or four values, got {}",
                        scores.len()
                    ));
                    return;
                }
                self.rules.entry(name.to_string()).or_default().scores = Some(scores);
            }
            _ => {
                if let Some(def) = commands::lookup(cmd) {
                    if state.scores_only && (def.is_admin || def.is_priv) {
                        self.warn(format!("{cmd} not allowed in user configuration"));
                        return;
                    }
                    self.apply_command(&def.value, cmd, params);
                } else {
                    // A plugin dispatch hook would get a chance here first.
                    self.warn(format!(
                        "unrecognised setting {cmd:?} in {}",
                        state.current_file
                    ));
                }
            }
        }
    }

    fn apply_command(&mut self, value: &Value, cmd: &str, params: &str) {
        match value {
            Value::Numeric(set) => match params.split_ascii_whitespace().next() {
                Some(v) => match v.parse::<f64>() {
                    Ok(v) => set(&mut self.settings, v),
                    Err(_) => self.warn(format!("invalid numeric value for {cmd}: {params:?}")),
                },
                None => self.warn(format!("missing value for {cmd}")),
            },
            Value::Boolean(set) => match params.trim() {
                "1" | "yes" | "true" => set(&mut self.settings, true),
                "0" | "no" | "false" => set(&mut self.settings, false),
                other => self.warn(format!("invalid boolean value for {cmd}: {other:?}")),
            },
            Value::Text(set) => set(&mut self.settings, params),
            Value::Append(set) | Value::Replace(set) => set(&mut self.settings, params),
            Value::Template(id) => {
                let target = self.template_mut(*id);
                target.push_str(params);
                target.push('\n');
            }
            Value::TemplateClear(id) => self.template_mut(*id).clear(),
            Value::Addrlist(id) => {
                for item in params.split_ascii_whitespace() {
                    if let Err(err) = self.list_mut(*id).add(item) {
                        self.warn(err);
                    }
                }
            }
            Value::AddrlistRemove(id) => {
                for item in params.split_ascii_whitespace() {
                    self.list_mut(*id).remove(item);
                }
            }
        }
    }

    fn template_mut(&mut self, id: TemplateId) -> &mut String {
        match id {
            TemplateId::Report => &mut self.templates.report,
            TemplateId::UnsafeReport => &mut self.templates.unsafe_report,
            TemplateId::TerseReport => &mut self.templates.terse_report,
            TemplateId::Spamtrap => &mut self.templates.spamtrap,
        }
    }

    fn list_mut(&mut self, id: ListId) -> &mut crate::addrlist::AddrList {
        match id {
            ListId::WhitelistFrom => &mut self.addrlists.whitelist_from,
            ListId::BlacklistFrom => &mut self.addrlists.blacklist_from,
            ListId::WhitelistTo => &mut self.addrlists.whitelist_to,
            ListId::MoreSpamTo => &mut self.addrlists.more_spam_to,
            ListId::AllSpamTo => &mut self.addrlists.all_spam_to,
        }
    }

    fn parse_rule(&mut self, cmd: &str, params: &str, state: &ParseState) {
        let Some((name, value)) = params
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k.trim(), v.trim()))
        else {
            self.warn(format!("invalid {cmd} command: {params}"));
            return;
        };

        let matcher = if let Some(call) = value.strip_prefix("eval:") {
            match parse_eval(call) {
                Ok(call) => match cmd {
                    "header" => {
                        if call.function.starts_with("check_rbl_sub")
                            || call.function.starts_with("check_rbl_results")
                        {
                            Matcher::RblResultEval(call)
                        } else if call.function.starts_with("check_rbl") {
                            Matcher::RblEval(call)
                        } else {
                            Matcher::HeaderEval(call)
                        }
                    }
                    "body" => Matcher::BodyEval(call),
                    "rawbody" => Matcher::RawbodyEval(call),
                    "full" => Matcher::FullEval(call),
                    _ => {
                        self.warn(format!("eval not supported for {cmd} rule {name}"));
                        return;
                    }
                },
                Err(err) => {
                    self.warn(format!("{} rule {name}: {err}", state.current_file));
                    return;
                }
            }
        } else {
            match cmd {
                "header" => match self.parse_header_rule(name, value) {
                    Some(matcher) => matcher,
                    None => return,
                },
                "meta" => match MetaExpression::parse(value) {
                    Ok(expr) => Matcher::Meta(expr),
                    Err(err) => {
                        self.warn(format!("meta rule {name}: {err}"));
                        return;
                    }
                },
                _ => match regexp::compile(value) {
                    Ok(pattern) => match cmd {
                        "body" => Matcher::Body(pattern),
                        "rawbody" => Matcher::Rawbody(pattern),
                        "uri" => Matcher::Uri(pattern),
                        "full" => Matcher::Full(pattern),
                        _ => unreachable!(),
                    },
                    Err(err) => {
                        self.warn(format!("{cmd} rule {name}: {err}"));
                        return;
                    }
                },
            }
        };

        self.rules.entry(name.to_string()).or_default().matcher = matcher;
    }

    fn parse_header_rule(&mut self, name: &str, value: &str) -> Option<Matcher> {
        if let Some(header) = value.strip_prefix("exists:") {
            return Some(Matcher::HeaderExists {
                header: header.trim().to_string(),
            });
        }

        let (header, rest) = value.split_once(char::is_whitespace).or_else(|| {
            self.warn(format!("invalid header rule {name}: {value}"));
            None
        })?;
        let (op, mut pattern) = rest
            .trim()
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k.trim(), v.trim()))
            .or_else(|| {
                self.warn(format!("invalid header rule {name}: {value}"));
                None
            })?;

        let negated = match op {
            "=~" => false,
            "!~" => true,
            _ => {
                self.warn(format!("invalid header operator {op:?} for rule {name}"));
                return None;
            }
        };

        let mut if_unset = None;
        if let Some((new_pattern, unset)) = pattern.rsplit_once("[if-unset:") {
            match unset.trim().strip_suffix(']') {
                Some(unset) => {
                    if_unset = Some(unset.trim().to_string());
                    pattern = new_pattern.trim();
                }
                None => {
                    self.warn(format!("unterminated if-unset for rule {name}"));
                    return None;
                }
            }
        }

        let (header, part) = match header.split_once(':') {
            Some((header, "addr")) => (header, HeaderPart::Addr),
            Some((header, "name")) => (header, HeaderPart::Name),
            Some((header, "raw")) => (header, HeaderPart::Raw),
            Some((_, other)) => {
                self.warn(format!("invalid header part {other:?} for rule {name}"));
                return None;
            }
            None => (header, HeaderPart::Default),
        };

        match regexp::compile(pattern) {
            Ok(pattern) => Some(Matcher::Header {
                header: header.to_string(),
                part,
                negated,
                pattern,
                if_unset,
            }),
            Err(err) => {
                self.warn(format!("header rule {name}: {err}"));
                None
            }
        }
    }

    /// The tiny calculator behind `if`: `plugin(Name)` and `version`
    /// predicates over the meta-expression grammar.
    fn eval_condition(&self, expr: &str) -> Result<bool, String> {
        let mut rewritten = String::with_capacity(expr.len());
        let mut rest = expr;
        while let Some(start) = rest.find("plugin(").or_else(|| rest.find("can(")) {
            let open = rest[start..].find('(').unwrap() + start;
            rewritten.push_str(&rest[..start]);
            let close = rest[open..]
                .find(')')
                .ok_or_else(|| format!("unterminated plugin() in if {expr:?}"))?
                + open;
            let plugin = rest[open + 1..close].trim();
            rewritten.push_str(if self.loaded_plugins.iter().any(|p| p == plugin) {
                "1"
            } else {
                "0"
            });
            rest = &rest[close + 1..];
        }
        rewritten.push_str(rest);
        let rewritten = rewritten.replace("version", &format!("{VERSION:.3}"));

        let expr = MetaExpression::parse(&rewritten)?;
        Ok(expr.evaluate(&|_| 0.0)? != 0.0)
    }
}

/// Remove an unescaped `#` comment; `\#` stays as a literal hash.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut escaped = false;
    for ch in line.chars() {
        match ch {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '#' if !escaped => break,
            _ => (),
        }
        if escaped {
            if ch != '#' {
                out.push('\\');
            }
            escaped = false;
        }
        out.push(ch);
    }
    if escaped {
        out.push('\\');
    }
    out
}

/// Parse `fn_name(arg, 'arg', "arg")`; a bare `fn_name` takes no arguments.
fn parse_eval(call: &str) -> Result<EvalCall, String> {
    let call = call.trim();
    let Some((function, args)) = call.split_once('(') else {
        if call.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !call.is_empty() {
            return Ok(EvalCall {
                function: call.to_string(),
                args: Vec::new(),
            });
        }
        return Err(format!("invalid eval call {call:?}"));
    };
    let args = args
        .trim()
        .strip_suffix(')')
        .ok_or_else(|| format!("unterminated eval call {call:?}"))?;

    let mut parsed = Vec::new();
    let mut buf = String::new();
    let mut quote = None::<char>;
    for ch in args.chars() {
        match ch {
            '\'' | '"' if quote.is_none() => {
                buf.clear();
                quote = Some(ch);
            }
            ch if quote == Some(ch) => {
                quote = None;
                parsed.push(std::mem::take(&mut buf));
            }
            ',' if quote.is_none() => {
                let arg = buf.trim().to_string();
                if !arg.is_empty() {
                    parsed.push(arg);
                }
                buf.clear();
            }
            _ => buf.push(ch),
        }
    }
    if quote.is_some() {
        return Err(format!("unterminated quote in eval call {call:?}"));
    }
    let arg = buf.trim().to_string();
    if !arg.is_empty() {
        parsed.push(arg);
    }

    Ok(EvalCall {
        function: function.trim().to_string(),
        args: parsed,
    })
}

#[cfg(test)]
mod tests {
    use crate::{Conf, Matcher};

    use super::{parse_eval, strip_comment};

    #[test]
    fn comments_and_escapes() {
        assert_eq!(strip_comment("score FOO 1.0 # why"), "score FOO 1.0 ");
        assert_eq!(strip_comment("body RE /a\\#b/"), "body RE /a#b/");
        assert_eq!(strip_comment("plain"), "plain");
    }

    #[test]
    fn eval_call_forms() {
        let call = parse_eval("check_rbl('set', 'zone.example.')").unwrap();
        assert_eq!(call.function, "check_rbl");
        assert_eq!(call.args, vec!["set", "zone.example."]);

        let call = parse_eval("check_for_missing_to_header").unwrap();
        assert!(call.args.is_empty());

        assert!(parse_eval("broken(").is_err());
    }

    #[test]
    fn basic_config() {
        let mut conf = Conf::new();
        conf.parse(
            "header FOO Subject =~ /\\bwin\\b/i\n\
             score FOO 2.5\n\
             describe FOO Subject mentions winning\n\
             required_hits 5.0\n",
            false,
        );
        assert_eq!(conf.errors, 0);
        assert_eq!(conf.settings.required_score, 5.0);
        let rule = &conf.rules["FOO"];
        assert!(matches!(rule.matcher, Matcher::Header { .. }));
        assert_eq!(rule.scores.as_deref(), Some(&[2.5][..]));
    }

    #[test]
    fn if_blocks_and_plugins() {
        let mut conf = Conf::new();
        conf.parse(
            "loadplugin MyPlugin\n\
             ifplugin MyPlugin\n\
             score INSIDE 1.0\n\
             endif\n\
             ifplugin OtherPlugin\n\
             score SKIPPED 1.0\n\
             else\n\
             score ELSEWHERE 1.0\n\
             endif\n\
             if version >= 4.0\n\
             score VERSIONED 1.0\n\
             endif\n",
            false,
        );
        assert!(conf.rules.contains_key("INSIDE"));
        assert!(!conf.rules.contains_key("SKIPPED"));
        assert!(conf.rules.contains_key("ELSEWHERE"));
        assert!(conf.rules.contains_key("VERSIONED"));
    }

    #[test]
    fn scores_only_rejects_rules_and_admin() {
        let mut conf = Conf::new();
        conf.parse(
            "header FOO Subject =~ /x/\n\
             bayes_path /tmp/elsewhere\n\
             score BAR 1.0\n\
             whitelist_from friend@example.com\n",
            true,
        );
        assert_eq!(conf.errors, 2);
        assert!(!conf.rules.contains_key("FOO"));
        assert!(conf.rules.contains_key("BAR"));
        assert!(!conf.addrlists.whitelist_from.is_empty());
    }

    #[test]
    fn header_rule_with_if_unset() {
        let mut conf = Conf::new();
        conf.parse(
            "header NOHDR X-Precedence =~ /bulk/ [if-unset: none]\n",
            false,
        );
        match &conf.rules["NOHDR"].matcher {
            Matcher::Header { if_unset, .. } => {
                assert_eq!(if_unset.as_deref(), Some("none"));
            }
            other => panic!("unexpected matcher {other:?}"),
        }
    }

    #[test]
    fn unknown_setting_counts_as_error() {
        let mut conf = Conf::new();
        conf.lint = true;
        conf.parse("no_such_setting 1\n", false);
        assert_eq!(conf.errors, 1);
        assert_eq!(conf.lint_messages.len(), 1);
    }
}
