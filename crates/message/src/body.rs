/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::MAX_BODY_LINE;

/// Split a text block into newline-terminated lines, chunking any line longer
/// than `MAX_BODY_LINE` bytes into consecutive full-size pieces.
pub(crate) fn push_lines(out: &mut Vec<String>, text: &str) {
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.len() <= MAX_BODY_LINE {
            out.push(line.to_string());
        } else {
            let mut rest = line;
            while !rest.is_empty() {
                let mut cut = rest.len().min(MAX_BODY_LINE);
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                out.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::push_lines;
    use crate::MAX_BODY_LINE;

    #[test]
    fn short_lines_pass_through() {
        let mut out = Vec::new();
        push_lines(&mut out, "one\r\ntwo\nthree");
        assert_eq!(out, vec!["one", "two", "three"]);
    }

    #[test]
    fn long_lines_are_chunked() {
        let mut out = Vec::new();
        push_lines(&mut out, &"x".repeat(MAX_BODY_LINE * 2 + 10));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), MAX_BODY_LINE);
        assert_eq!(out[1].len(), MAX_BODY_LINE);
        assert_eq!(out[2].len(), 10);
    }
}
