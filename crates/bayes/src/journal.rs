/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The append-only side log. Scans never take the write lock and record
//! their access-time touches here; a learn or forget that finds the store
//! locked by another process defers its token deltas, corpus-counter deltas,
//! and seen-map updates the same way. The next write handle folds the whole
//! log into the main store.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Error;

#[derive(Debug, PartialEq, Eq)]
pub enum Entry {
    Atime {
        atime: u64,
        token: String,
    },
    Delta {
        dspam: i32,
        dham: i32,
        atime: u64,
        token: String,
    },
    /// Pending change to the global (nspam, nham) counters.
    Global {
        dspam: i32,
        dham: i32,
    },
    /// Pending seen-map update; `None` removes the entry.
    Seen {
        id: String,
        label: Option<char>,
    },
}

fn journal_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push("_journal");
    PathBuf::from(path)
}

fn render_entry(out: &mut String, entry: &Entry) {
    match entry {
        Entry::Atime { atime, token } => {
            out.push_str(&format!("a {atime} {token}\n"));
        }
        Entry::Delta {
            dspam,
            dham,
            atime,
            token,
        } => {
            out.push_str(&format!("c {dspam} {dham} {atime} {token}\n"));
        }
        Entry::Global { dspam, dham } => {
            out.push_str(&format!("g {dspam} {dham}\n"));
        }
        Entry::Seen { id, label } => {
            out.push_str(&format!("s {} {id}\n", label.unwrap_or('-')));
        }
    }
}

/// Append a batch of entries in one write.
pub fn append(base: &Path, entries: &[Entry]) -> Result<(), Error> {
    if entries.is_empty() {
        return Ok(());
    }
    if let Some(parent) = base.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut buf = String::new();
    for entry in entries {
        render_entry(&mut buf, entry);
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path(base))?;
    file.write_all(buf.as_bytes())?;
    Ok(())
}

pub fn append_atimes<'x>(
    base: &Path,
    atime: u64,
    tokens: impl Iterator<Item = &'x str>,
) -> Result<(), Error> {
    let entries: Vec<Entry> = tokens
        .map(|token| Entry::Atime {
            atime,
            token: token.to_string(),
        })
        .collect();
    append(base, &entries)
}

/// Read every well-formed entry; truncated or garbled lines (a crashed
/// appender) are skipped.
pub fn read_entries(base: &Path) -> Result<Vec<Entry>, Error> {
    let text = match std::fs::read_to_string(journal_path(base)) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut fields = line.splitn(2, ' ');
        match fields.next() {
            Some("a") => {
                let rest = fields.next().unwrap_or_default();
                if let Some((atime, token)) = rest.split_once(' ') {
                    if let Ok(atime) = atime.parse() {
                        if !token.is_empty() {
                            entries.push(Entry::Atime {
                                atime,
                                token: token.to_string(),
                            });
                        }
                    }
                }
            }
            Some("c") => {
                let rest = fields.next().unwrap_or_default();
                let mut parts = rest.splitn(4, ' ');
                if let (Some(Ok(dspam)), Some(Ok(dham)), Some(Ok(atime)), Some(token)) = (
                    parts.next().map(str::parse),
                    parts.next().map(str::parse),
                    parts.next().map(str::parse),
                    parts.next(),
                ) {
                    if !token.is_empty() {
                        entries.push(Entry::Delta {
                            dspam,
                            dham,
                            atime,
                            token: token.to_string(),
                        });
                    }
                }
            }
            Some("g") => {
                let rest = fields.next().unwrap_or_default();
                if let Some((dspam, dham)) = rest.split_once(' ') {
                    if let (Ok(dspam), Ok(dham)) = (dspam.parse(), dham.parse()) {
                        entries.push(Entry::Global { dspam, dham });
                    }
                }
            }
            Some("s") => {
                let rest = fields.next().unwrap_or_default();
                if let Some((label, id)) = rest.split_once(' ') {
                    let label = match label {
                        "s" => Some('s'),
                        "h" => Some('h'),
                        "-" => None,
                        _ => continue,
                    };
                    if !id.is_empty() {
                        entries.push(Entry::Seen {
                            id: id.to_string(),
                            label,
                        });
                    }
                }
            }
            _ => (),
        }
    }
    Ok(entries)
}

pub fn truncate(base: &Path) -> Result<(), Error> {
    match std::fs::remove_file(journal_path(base)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempbase(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("bayes-journal-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("bayes")
    }

    #[test]
    fn append_and_read_back() {
        let base = tempbase("rw");
        append_atimes(&base, 7, ["alpha", "beta"].into_iter()).unwrap();
        append(
            &base,
            &[
                Entry::Delta {
                    dspam: 1,
                    dham: 0,
                    atime: 8,
                    token: "gamma".to_string(),
                },
                Entry::Global { dspam: 1, dham: 0 },
                Entry::Seen {
                    id: "<id@example>".to_string(),
                    label: Some('s'),
                },
                Entry::Seen {
                    id: "<id@example>".to_string(),
                    label: None,
                },
            ],
        )
        .unwrap();
        let entries = read_entries(&base).unwrap();
        assert_eq!(
            entries,
            vec![
                Entry::Atime {
                    atime: 7,
                    token: "alpha".to_string()
                },
                Entry::Atime {
                    atime: 7,
                    token: "beta".to_string()
                },
                Entry::Delta {
                    dspam: 1,
                    dham: 0,
                    atime: 8,
                    token: "gamma".to_string()
                },
                Entry::Global { dspam: 1, dham: 0 },
                Entry::Seen {
                    id: "<id@example>".to_string(),
                    label: Some('s')
                },
                Entry::Seen {
                    id: "<id@example>".to_string(),
                    label: None
                },
            ]
        );
    }

    #[test]
    fn garbled_lines_are_skipped() {
        let base = tempbase("garbled");
        append_atimes(&base, 7, ["good"].into_iter()).unwrap();
        let mut path = base.as_os_str().to_owned();
        path.push("_journal");
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(PathBuf::from(path))
            .unwrap();
        std::io::Write::write_all(&mut file, b"x broken\na notanumber tok\ng one\ns q <id>\na 5")
            .unwrap();
        let entries = read_entries(&base).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn truncate_is_idempotent() {
        let base = tempbase("trunc");
        truncate(&base).unwrap();
        append_atimes(&base, 1, ["tok"].into_iter()).unwrap();
        truncate(&base).unwrap();
        assert!(read_entries(&base).unwrap().is_empty());
    }
}
