/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt;

use fancy_regex::Regex;

/// A rule pattern: the source text as written in the configuration plus the
/// compiled form. Compilation happens exactly once, at parse time, from the
/// pattern data alone.
#[derive(Clone)]
pub struct Pattern {
    pub source: String,
    regex: Regex,
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern").field("source", &self.source).finish()
    }
}

impl Pattern {
    pub fn is_match(&self, haystack: &str) -> Result<bool, String> {
        self.regex
            .is_match(haystack)
            .map_err(|err| format!("regex execution failed for /{}/: {err}", self.source))
    }
}

fn closing_delimiter(open: char) -> char {
    match open {
        '{' => '}',
        '(' => ')',
        '<' => '>',
        '[' => ']',
        other => other,
    }
}

/// Split a delimited regex (`/…/mods`, `m{…}mods`, `m(…)`, `m<…>`, `m!…!`,
/// …) into pattern text and modifier letters.
pub fn split_delimited(value: &str) -> Result<(&str, &str), String> {
    let value = value.trim();
    let (open, rest) = if let Some(rest) = value.strip_prefix('m') {
        let mut chars = rest.chars();
        let open = chars
            .next()
            .ok_or_else(|| format!("missing regex delimiter in {value:?}"))?;
        (open, chars.as_str())
    } else if let Some(rest) = value.strip_prefix('/') {
        ('/', rest)
    } else {
        return Err(format!("not a delimited regex: {value:?}"));
    };

    let close = closing_delimiter(open);
    let mut end = None;
    let mut prev = '\0';
    for (idx, ch) in rest.char_indices() {
        if ch == close && prev != '\\' {
            end = Some(idx);
        }
        // An escaped backslash does not escape the delimiter after it.
        prev = if prev == '\\' && ch == '\\' { '\0' } else { ch };
    }
    let end = end.ok_or_else(|| format!("unterminated regex: {value:?}"))?;
    let mods = rest[end + close.len_utf8()..].trim();
    if !mods.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("trailing garbage after regex: {value:?}"));
    }
    Ok((&rest[..end], mods))
}

/// Compile a delimited configuration regex. Perl modifier letters that map to
/// inline flags (`i`, `m`, `s`, `x`) are carried over; `g` and `o` have no
/// compile-time meaning and are dropped.
pub fn compile(value: &str) -> Result<Pattern, String> {
    let (pattern, mods) = split_delimited(value)?;
    let flags: String = mods.chars().filter(|c| "imsx".contains(*c)).collect();
    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    let regex =
        Regex::new(&source).map_err(|err| format!("invalid regex {value:?}: {err}"))?;
    Ok(Pattern {
        source: pattern.to_string(),
        regex,
    })
}

/// Compile a bare (undelimited) pattern, used for globs and internal tests.
pub fn compile_raw(source: &str) -> Result<Pattern, String> {
    let regex =
        Regex::new(source).map_err(|err| format!("invalid regex {source:?}: {err}"))?;
    Ok(Pattern {
        source: source.to_string(),
        regex,
    })
}

#[cfg(test)]
mod tests {
    use super::{compile, split_delimited};

    #[test]
    fn delimiter_forms() {
        assert_eq!(split_delimited("/foo/i").unwrap(), ("foo", "i"));
        assert_eq!(split_delimited("m{fo/o}").unwrap(), ("fo/o", ""));
        assert_eq!(split_delimited("m(a(b)c)is").unwrap(), ("a(b)c", "is"));
        assert_eq!(split_delimited("m<a>").unwrap(), ("a", ""));
        assert_eq!(split_delimited("m!a/b!x").unwrap(), ("a/b", "x"));
        assert!(split_delimited("plain").is_err());
        assert!(split_delimited("/unterminated").is_err());
    }

    #[test]
    fn escaped_delimiter() {
        assert_eq!(split_delimited(r"/a\/b/").unwrap(), (r"a\/b", ""));
    }

    #[test]
    fn modifiers_become_inline_flags() {
        let p = compile("/\\bwin\\b/i").unwrap();
        assert!(p.is_match("you WIN today").unwrap());
        assert!(!p.is_match("winner").unwrap());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(compile("/a(/").is_err());
    }
}
