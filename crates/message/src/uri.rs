/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::LazyLock;

use fancy_regex::Regex;

static URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:(?:https?|ftp|gopher|nntp|telnet|file)://|mailto:)[^\s"'<>\[\]{}()]+"#)
        .unwrap()
});
static BARE_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:www|ftp)\.[A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,}(?:/[^\s"'<>]*)?"#).unwrap()
});
static MAILTO_SWEEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.+=-]+@[\w-]+(?:\.[\w-]+)+\b").unwrap());

/// Extract every URI from the decoded body: scheme-prefixed URIs, bare
/// `www.`/`ftp.` hostnames with a synthesised scheme, and a `mailto:` sweep
/// over RFC-822-style addresses. Order of first appearance, deduplicated.
pub(crate) fn extract_uris(body_lines: &[String]) -> Vec<String> {
    let mut uris = Vec::new();
    let mut push = |uri: String| {
        if !uris.contains(&uri) {
            uris.push(uri);
        }
    };

    for line in body_lines {
        for found in URI.find_iter(line).flatten() {
            push(trim_uri(found.as_str()).to_string());
        }
        for found in BARE_HOST.find_iter(line).flatten() {
            let host = trim_uri(found.as_str());
            if host.starts_with("ftp.") {
                push(format!("ftp://{host}"));
            } else {
                push(format!("http://{host}"));
            }
        }
        for found in MAILTO_SWEEP.find_iter(line).flatten() {
            push(format!("mailto:{}", found.as_str()));
        }
    }
    uris
}

fn trim_uri(uri: &str) -> &str {
    uri.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

#[cfg(test)]
mod tests {
    use super::extract_uris;

    #[test]
    fn scheme_and_bare_hosts() {
        let lines = vec![
            "visit http://spam.example/buy now.".to_string(),
            "or www.example.org/deal today".to_string(),
            "mirror at ftp.example.net.".to_string(),
        ];
        let uris = extract_uris(&lines);
        assert_eq!(
            uris,
            vec![
                "http://spam.example/buy",
                "http://www.example.org/deal",
                "ftp://ftp.example.net",
            ]
        );
    }

    #[test]
    fn mailto_sweep_and_dedup() {
        let lines = vec!["mail a@b.example or a@b.example".to_string()];
        assert_eq!(extract_uris(&lines), vec!["mailto:a@b.example"]);
    }
}
