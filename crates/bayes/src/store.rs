/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{journal, Error};

const LOCK_RETRIES: u32 = 20;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct TokenCounts {
    pub spam: u32,
    pub ham: u32,
    pub atime: u64,
}

/// Everything the classifier persists: per-token counts, the global corpus
/// counters, and the `seen` map guarding against double-learning.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub nspam: u32,
    pub nham: u32,
    pub last_expire: u64,
    pub last_journal_sync: u64,
    pub tokens: HashMap<String, TokenCounts>,
    pub seen: HashMap<String, char>,
}

/// A handle on the on-disk store. Read handles never lock; write handles
/// hold the advisory lock file until dropped and fold the pending journal in
/// on open.
pub struct TokenStore {
    base: PathBuf,
    pub data: StoreData,
    locked: bool,
}

pub(crate) fn db_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push("_db");
    PathBuf::from(path)
}

fn lock_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn load(base: &Path) -> Result<StoreData, Error> {
    match std::fs::read(db_path(base)) {
        Ok(bytes) => {
            bincode::deserialize(&bytes).map_err(|err| Error::Corrupt(err.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreData::default()),
        Err(err) => Err(err.into()),
    }
}

impl TokenStore {
    pub fn open_read(base: &Path) -> Result<Self, Error> {
        Ok(TokenStore {
            base: base.to_path_buf(),
            data: load(base)?,
            locked: false,
        })
    }

    pub fn open_write(base: &Path) -> Result<Self, Error> {
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock = lock_path(base);
        let mut acquired = false;
        for attempt in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    acquired = true;
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt + 1 < LOCK_RETRIES {
                        std::thread::sleep(LOCK_RETRY_SLEEP);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        if !acquired {
            return Err(Error::Locked);
        }

        let mut store = TokenStore {
            base: base.to_path_buf(),
            data: load(base)?,
            locked: true,
        };
        store.replay_journal()?;
        Ok(store)
    }

    fn replay_journal(&mut self) -> Result<(), Error> {
        for entry in journal::read_entries(&self.base)? {
            match entry {
                journal::Entry::Atime { atime, token } => {
                    if let Some(counts) = self.data.tokens.get_mut(&token) {
                        if counts.atime < atime {
                            counts.atime = atime;
                        }
                    }
                }
                journal::Entry::Delta {
                    dspam,
                    dham,
                    atime,
                    token,
                } => {
                    let counts = self.data.tokens.entry(token.clone()).or_default();
                    counts.spam = counts.spam.saturating_add_signed(dspam);
                    counts.ham = counts.ham.saturating_add_signed(dham);
                    if counts.atime < atime {
                        counts.atime = atime;
                    }
                    if counts.spam == 0 && counts.ham == 0 {
                        self.data.tokens.remove(&token);
                    }
                }
                journal::Entry::Global { dspam, dham } => {
                    self.data.nspam = self.data.nspam.saturating_add_signed(dspam);
                    self.data.nham = self.data.nham.saturating_add_signed(dham);
                }
                journal::Entry::Seen { id, label } => match label {
                    Some(label) => {
                        self.data.seen.insert(id, label);
                    }
                    None => {
                        self.data.seen.remove(&id);
                    }
                },
            }
        }
        Ok(())
    }

    /// Write the snapshot atomically and truncate the merged journal.
    pub fn save(&mut self) -> Result<(), Error> {
        self.save_with_mode(0o600)
    }

    pub fn save_with_mode(&mut self, mode: u32) -> Result<(), Error> {
        debug_assert!(self.locked);
        let bytes =
            bincode::serialize(&self.data).map_err(|err| Error::Corrupt(err.to_string()))?;
        let target = db_path(&self.base);
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode));
        }
        #[cfg(not(unix))]
        let _ = mode;
        std::fs::rename(&tmp, &target)?;
        journal::truncate(&self.base)?;
        Ok(())
    }

    /// Drop the oldest tokens whose atime fell out of the rolling window,
    /// never letting the store shrink below `min_db_size` and never removing
    /// more than `scan_count` tokens in one pass. Oldest-first with a
    /// bytewise tie-break, so two stores with the same contents expire the
    /// same tokens. Returns how many were removed.
    pub fn expire(&mut self, now: u64, min_db_size: u64, period: u64, scan_count: u64) -> u64 {
        let total = self.data.tokens.len() as u64;
        if total <= min_db_size {
            return 0;
        }
        let cutoff = now.saturating_sub(period);
        let mut candidates: Vec<(u64, String)> = self
            .data
            .tokens
            .iter()
            .filter(|(_, c)| c.atime < cutoff)
            .map(|(token, c)| (c.atime, token.clone()))
            .collect();
        candidates.sort();
        let max_removals = (total - min_db_size).min(scan_count) as usize;
        candidates.truncate(max_removals);
        for (_, token) in &candidates {
            self.data.tokens.remove(token);
        }
        candidates.len() as u64
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        if self.locked {
            let _ = std::fs::remove_file(lock_path(&self.base));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempbase(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bayes-store-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("bayes")
    }

    #[test]
    fn snapshot_round_trip() {
        let base = tempbase("roundtrip");
        {
            let mut store = TokenStore::open_write(&base).unwrap();
            store.data.nspam = 3;
            store.data.tokens.insert(
                "token".to_string(),
                TokenCounts {
                    spam: 2,
                    ham: 1,
                    atime: 42,
                },
            );
            store.data.seen.insert("<id>".to_string(), 's');
            store.save().unwrap();
        }
        let store = TokenStore::open_read(&base).unwrap();
        assert_eq!(store.data.nspam, 3);
        assert_eq!(store.data.tokens["token"].spam, 2);
        assert_eq!(store.data.seen["<id>"], 's');
    }

    #[test]
    fn write_lock_excludes_second_writer() {
        let base = tempbase("lock");
        let first = TokenStore::open_write(&base).unwrap();
        // The second open gives up after its retries while the first handle
        // still holds the lock file.
        let started = std::time::Instant::now();
        let second = TokenStore::open_write(&base);
        assert!(matches!(second, Err(Error::Locked)));
        assert!(started.elapsed() >= Duration::from_millis(500));
        drop(first);
        assert!(TokenStore::open_write(&base).is_ok());
    }

    #[test]
    fn journal_entries_merge_on_write_open() {
        let base = tempbase("journal");
        {
            let mut store = TokenStore::open_write(&base).unwrap();
            store.data.tokens.insert(
                "old".to_string(),
                TokenCounts {
                    spam: 1,
                    ham: 0,
                    atime: 10,
                },
            );
            store.save().unwrap();
        }
        journal::append_atimes(&base, 99, ["old"].into_iter()).unwrap();
        journal::append(
            &base,
            &[
                journal::Entry::Delta {
                    dspam: 2,
                    dham: 0,
                    atime: 100,
                    token: "fresh".to_string(),
                },
                journal::Entry::Global { dspam: 1, dham: 0 },
                journal::Entry::Seen {
                    id: "<m1>".to_string(),
                    label: Some('s'),
                },
            ],
        )
        .unwrap();
        let mut store = TokenStore::open_write(&base).unwrap();
        assert_eq!(store.data.tokens["old"].atime, 99);
        assert_eq!(store.data.tokens["fresh"].spam, 2);
        assert_eq!(store.data.nspam, 1);
        assert_eq!(store.data.seen["<m1>"], 's');
        store.save().unwrap();
        assert!(journal::read_entries(&base).unwrap().is_empty());
    }

    #[test]
    fn delta_replay_drops_emptied_tokens() {
        let base = tempbase("delta-drop");
        {
            let mut store = TokenStore::open_write(&base).unwrap();
            store.data.tokens.insert(
                "fading".to_string(),
                TokenCounts {
                    spam: 1,
                    ham: 0,
                    atime: 10,
                },
            );
            store.save().unwrap();
        }
        journal::append(
            &base,
            &[journal::Entry::Delta {
                dspam: -1,
                dham: 0,
                atime: 20,
                token: "fading".to_string(),
            }],
        )
        .unwrap();
        let store = TokenStore::open_write(&base).unwrap();
        assert!(!store.data.tokens.contains_key("fading"));
    }

    #[test]
    fn expiry_respects_minimum_size() {
        let base = tempbase("expire");
        let mut store = TokenStore::open_write(&base).unwrap();
        for i in 0..100u32 {
            store.data.tokens.insert(
                format!("t{i}"),
                TokenCounts {
                    spam: 1,
                    ham: 0,
                    atime: u64::from(i),
                },
            );
        }
        // A floor above the current size expires nothing.
        assert_eq!(store.expire(1_000, 200, 10, 10_000), 0);
        // The batch cap bounds one pass.
        assert_eq!(store.expire(1_000, 50, 10, 10), 10);
        // The size floor holds regardless of how stale the rest is.
        let removed = store.expire(1_000, 50, 10, 10_000);
        assert_eq!(removed, 40);
        assert_eq!(store.data.tokens.len(), 50);
    }
}
