/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod combine;
pub mod journal;
pub mod store;
pub mod tokenize;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use message::Message;
use parking_lot::Mutex;

use combine::Combiner;
use store::TokenStore;

/// Scans return a neutral probability until both corpora reach this size.
pub const MIN_CORPUS_SIZE: u32 = 200;

/// Only the most significant tokens participate in the combined probability.
pub const MAX_SIGNIFICANT_TOKENS: usize = 150;

pub const PROB_FLOOR: f64 = 0.001;
pub const PROB_CEILING: f64 = 0.999;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Corrupt(String),
    Locked,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "bayes I/O failure: {err}"),
            Error::Corrupt(detail) => write!(f, "bayes store is corrupt: {detail}"),
            Error::Locked => f.write_str("bayes store is locked by another process"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[derive(Debug, Clone)]
pub struct BayesConfig {
    pub path: PathBuf,
    pub use_hapaxes: bool,
    pub use_chi2_combining: bool,
    pub expiry_min_db_size: u64,
    /// Largest number of tokens one expiry pass may remove.
    pub expiry_scan_count: u64,
    pub expiry_period: u64,
    pub file_mode: u32,
    pub ignore_headers: Vec<String>,
}

impl Default for BayesConfig {
    fn default() -> Self {
        BayesConfig {
            path: PathBuf::from("bayes"),
            use_hapaxes: true,
            use_chi2_combining: true,
            expiry_min_db_size: 100_000,
            expiry_scan_count: 5_000,
            expiry_period: 43_200,
            file_mode: 0o700,
            ignore_headers: Vec::new(),
        }
    }
}

/// The adaptive classifier: a persistent token corpus plus the probability
/// combiner. Scans are lock-free and write only through the journal.
/// Learn/forget serialize on the in-process mutex, then take the advisory
/// lock file; when another process holds that, the update is deferred
/// through the journal instead.
pub struct BayesDb {
    config: BayesConfig,
    write_lock: Mutex<()>,
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn message_id(msg: &Message) -> String {
    msg.headers()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Message-ID"))
        .map(|h| h.text.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| {
            // No Message-ID: derive a stable one from the content so repeated
            // learns of the same text still deduplicate.
            let mut hash = 0xcbf2_9ce4_8422_2325u64;
            for byte in msg.full_text() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            format!("<generated.{hash:016x}>")
        })
}

impl BayesDb {
    pub fn new(config: BayesConfig) -> Self {
        BayesDb {
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BayesConfig {
        &self.config
    }

    /// Compute the spam probability of a message. Never fails: any store or
    /// tokenizer problem unlocks and yields a neutral 0.5.
    pub fn scan(&self, msg: &Message) -> f64 {
        match self.scan_inner(msg) {
            Ok(prob) => prob,
            Err(err) => {
                tracing::warn!(context = "bayes", event = "scan-error", "{err}");
                0.5
            }
        }
    }

    fn scan_inner(&self, msg: &Message) -> Result<f64, Error> {
        let store = TokenStore::open_read(&self.config.path)?;
        if store.data.nspam < MIN_CORPUS_SIZE || store.data.nham < MIN_CORPUS_SIZE {
            return Ok(0.5);
        }

        let tokens = tokenize::tokenize_message(msg, &self.config.ignore_headers);
        let nspam = f64::from(store.data.nspam);
        let nham = f64::from(store.data.nham);
        let combiner = Combiner::new(self.config.use_chi2_combining);

        let mut significant: Vec<(f64, &str)> = Vec::new();
        for token in &tokens {
            let Some(counts) = store.data.tokens.get(token.as_str()) else {
                continue;
            };
            if !self.config.use_hapaxes && counts.spam + counts.ham < 2 {
                continue;
            }
            let ratio_spam = f64::from(counts.spam) / nspam;
            let ratio_ham = f64::from(counts.ham) / nham;
            if ratio_spam + ratio_ham <= 0.0 {
                continue;
            }
            let prob = ratio_spam / (ratio_spam + ratio_ham);
            let n = f64::from(counts.spam + counts.ham);
            let smoothed = combiner.smooth(prob, n);
            significant.push((
                smoothed.clamp(PROB_FLOOR, PROB_CEILING),
                token.as_str(),
            ));
        }

        // Keep the tokens farthest from neutral; ties resolve bytewise so
        // two scans of one message always pick the same set.
        significant.sort_by(|a, b| {
            let da = (a.0 - 0.5).abs();
            let db = (b.0 - 0.5).abs();
            db.partial_cmp(&da)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        significant.truncate(MAX_SIGNIFICANT_TOKENS);

        if significant.is_empty() {
            return Ok(0.5);
        }

        let prob = combiner.combine(significant.iter().map(|(p, _)| *p));

        // Touch access times through the journal; the next writer merges.
        let atime = now();
        journal::append_atimes(
            &self.config.path,
            atime,
            significant.iter().map(|(_, token)| *token),
        )?;
        self.maybe_expire(&store)?;

        Ok(prob)
    }

    /// Learn one message. Returns false when it was already learned with the
    /// same label. Learning with the opposite label forgets first. When
    /// another process holds the store lock, the whole update is appended to
    /// the journal instead and merged by the next writer.
    pub fn learn(&self, is_spam: bool, msg: &Message) -> Result<bool, Error> {
        let id = message_id(msg);
        let _guard = self.write_lock.lock();
        let mut store = match TokenStore::open_write(&self.config.path) {
            Ok(store) => store,
            Err(Error::Locked) => return self.learn_deferred(is_spam, msg, id),
            Err(err) => return Err(err),
        };
        match store.data.seen.get(&id).copied() {
            Some('s') if is_spam => return Ok(false),
            Some('h') if !is_spam => return Ok(false),
            Some(label) => {
                Self::forget_tokens(&mut store, msg, label == 's', &self.config);
            }
            None => (),
        }

        let atime = now();
        if is_spam {
            store.data.nspam += 1;
        } else {
            store.data.nham += 1;
        }
        for token in tokenize::tokenize_message(msg, &self.config.ignore_headers) {
            let counts = store.data.tokens.entry(token).or_default();
            if is_spam {
                counts.spam += 1;
            } else {
                counts.ham += 1;
            }
            counts.atime = atime;
        }
        store
            .data
            .seen
            .insert(id, if is_spam { 's' } else { 'h' });
        store.save_with_mode(self.config.file_mode)?;
        Ok(true)
    }

    /// The exact inverse of `learn`. Returns false when the message was
    /// never learned. Defers through the journal like `learn` when the store
    /// lock is held elsewhere.
    pub fn forget(&self, msg: &Message) -> Result<bool, Error> {
        let id = message_id(msg);
        let _guard = self.write_lock.lock();
        let mut store = match TokenStore::open_write(&self.config.path) {
            Ok(store) => store,
            Err(Error::Locked) => return self.forget_deferred(msg, id),
            Err(err) => return Err(err),
        };
        let Some(label) = store.data.seen.get(&id).copied() else {
            return Ok(false);
        };
        Self::forget_tokens(&mut store, msg, label == 's', &self.config);
        store.data.seen.remove(&id);
        store.save_with_mode(self.config.file_mode)?;
        Ok(true)
    }

    /// The label a message currently carries, counting both the snapshot and
    /// any pending journal updates (later entries win).
    fn effective_seen(path: &Path, id: &str) -> Result<Option<char>, Error> {
        let store = TokenStore::open_read(path)?;
        let mut label = store.data.seen.get(id).copied();
        for entry in journal::read_entries(path)? {
            if let journal::Entry::Seen { id: seen_id, label: seen_label } = entry {
                if seen_id == id {
                    label = seen_label;
                }
            }
        }
        Ok(label)
    }

    /// Journal entries that add (`direction` +1) or remove (-1) one counted
    /// occurrence of every token in the message.
    fn count_entries(
        &self,
        msg: &Message,
        is_spam: bool,
        direction: i32,
        atime: u64,
        entries: &mut Vec<journal::Entry>,
    ) {
        let (dspam, dham) = if is_spam { (direction, 0) } else { (0, direction) };
        entries.push(journal::Entry::Global { dspam, dham });
        for token in tokenize::tokenize_message(msg, &self.config.ignore_headers) {
            entries.push(journal::Entry::Delta {
                dspam,
                dham,
                atime,
                token,
            });
        }
    }

    fn learn_deferred(&self, is_spam: bool, msg: &Message, id: String) -> Result<bool, Error> {
        match Self::effective_seen(&self.config.path, &id)? {
            Some('s') if is_spam => return Ok(false),
            Some('h') if !is_spam => return Ok(false),
            prior => {
                let atime = now();
                let mut entries = Vec::new();
                if let Some(label) = prior {
                    self.count_entries(msg, label == 's', -1, atime, &mut entries);
                }
                self.count_entries(msg, is_spam, 1, atime, &mut entries);
                entries.push(journal::Entry::Seen {
                    id,
                    label: Some(if is_spam { 's' } else { 'h' }),
                });
                journal::append(&self.config.path, &entries)?;
                Ok(true)
            }
        }
    }

    fn forget_deferred(&self, msg: &Message, id: String) -> Result<bool, Error> {
        let Some(label) = Self::effective_seen(&self.config.path, &id)? else {
            return Ok(false);
        };
        let mut entries = Vec::new();
        self.count_entries(msg, label == 's', -1, now(), &mut entries);
        entries.push(journal::Entry::Seen { id, label: None });
        journal::append(&self.config.path, &entries)?;
        Ok(true)
    }

    fn forget_tokens(
        store: &mut TokenStore,
        msg: &Message,
        was_spam: bool,
        config: &BayesConfig,
    ) {
        if was_spam {
            store.data.nspam = store.data.nspam.saturating_sub(1);
        } else {
            store.data.nham = store.data.nham.saturating_sub(1);
        }
        for token in tokenize::tokenize_message(msg, &config.ignore_headers) {
            if let Some(counts) = store.data.tokens.get_mut(&token) {
                if was_spam {
                    counts.spam = counts.spam.saturating_sub(1);
                } else {
                    counts.ham = counts.ham.saturating_sub(1);
                }
                if counts.spam == 0 && counts.ham == 0 {
                    store.data.tokens.remove(&token);
                }
            }
        }
    }

    /// Merge pending journal entries into the main store.
    pub fn sync_journal(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let mut store = TokenStore::open_write(&self.config.path)?;
        store.data.last_journal_sync = now();
        store.save_with_mode(self.config.file_mode)
    }

    /// Remove tokens whose access time fell out of the rolling window,
    /// keeping the store above the configured minimum size. Opportunistic:
    /// returns without touching anything when another writer holds either
    /// lock.
    pub fn expire(&self, force: bool) -> Result<u64, Error> {
        let _guard = if force {
            self.write_lock.lock()
        } else {
            match self.write_lock.try_lock() {
                Some(guard) => guard,
                None => return Ok(0),
            }
        };
        let mut store = match TokenStore::open_write(&self.config.path) {
            Ok(store) => store,
            Err(Error::Locked) if !force => return Ok(0),
            Err(err) => return Err(err),
        };
        let removed = store.expire(
            now(),
            self.config.expiry_min_db_size,
            self.config.expiry_period,
            self.config.expiry_scan_count,
        );
        store.data.last_expire = now();
        store.save_with_mode(self.config.file_mode)?;
        Ok(removed)
    }

    fn maybe_expire(&self, store: &TokenStore) -> Result<(), Error> {
        if store.data.last_expire + self.config.expiry_period < now()
            && store.data.tokens.len() as u64 > self.config.expiry_min_db_size
        {
            // Best effort; a held lock means someone else is on it.
            let _ = self.expire(false)?;
        }
        Ok(())
    }

    /// (nspam, nham) as learned so far.
    pub fn corpus_counts(&self) -> Result<(u32, u32), Error> {
        let store = TokenStore::open_read(&self.config.path)?;
        Ok((store.data.nspam, store.data.nham))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> BayesConfig {
        BayesConfig {
            path: dir.join("bayes"),
            ..Default::default()
        }
    }

    fn sample(subject: &str, body: &str, id: &str) -> Message {
        Message::parse(
            format!(
                "From: sender@example.com\nSubject: {subject}\nMessage-ID: <{id}>\n\n{body}\n"
            )
            .into_bytes(),
        )
        .unwrap()
    }

    fn tempdir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("bayes-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn learn_is_idempotent() {
        let dir = tempdir("idem");
        let db = BayesDb::new(test_config(&dir));
        let msg = sample("cheap pills", "buy cheap replica pills online today", "m1");
        assert!(db.learn(true, &msg).unwrap());
        let (nspam, _) = db.corpus_counts().unwrap();
        assert!(!db.learn(true, &msg).unwrap());
        assert_eq!(db.corpus_counts().unwrap().0, nspam);
    }

    #[test]
    fn forget_restores_counts() {
        let dir = tempdir("forget");
        let db = BayesDb::new(test_config(&dir));
        let msg = sample("offer", "unique spammy wording nowhere else", "m2");
        db.learn(true, &msg).unwrap();
        assert!(db.forget(&msg).unwrap());
        assert_eq!(db.corpus_counts().unwrap(), (0, 0));
        let store = store::TokenStore::open_read(&db.config.path).unwrap();
        assert!(store.data.tokens.is_empty());
    }

    #[test]
    fn relearn_with_opposite_label_flips() {
        let dir = tempdir("flip");
        let db = BayesDb::new(test_config(&dir));
        let msg = sample("news", "weekly newsletter content here", "m3");
        db.learn(true, &msg).unwrap();
        assert!(db.learn(false, &msg).unwrap());
        assert_eq!(db.corpus_counts().unwrap(), (0, 1));
    }

    #[test]
    fn scan_is_neutral_below_corpus_minimum() {
        let dir = tempdir("neutral");
        let db = BayesDb::new(test_config(&dir));
        let msg = sample("anything", "anything at all", "m4");
        db.learn(true, &msg).unwrap();
        assert_eq!(db.scan(&msg), 0.5);
    }

    #[test]
    fn scan_separates_corpora() {
        let dir = tempdir("separates");
        let db = BayesDb::new(test_config(&dir));
        for i in 0..MIN_CORPUS_SIZE {
            let spam = sample(
                "viagra pills",
                "buy cheap viagra pills casino winnings guaranteed",
                &format!("s{i}"),
            );
            db.learn(true, &spam).unwrap();
            let ham = sample(
                "meeting notes",
                "attached are the meeting notes from thursday standup",
                &format!("h{i}"),
            );
            db.learn(false, &ham).unwrap();
        }
        let spammy = sample("viagra", "cheap viagra casino guaranteed", "t1");
        let hammy = sample("notes", "thursday meeting standup notes attached", "t2");
        assert!(db.scan(&spammy) > 0.9);
        assert!(db.scan(&hammy) < 0.1);
    }

    #[test]
    fn locked_store_defers_learn_through_journal() {
        let dir = tempdir("deferred");
        let db = BayesDb::new(test_config(&dir));
        let msg = sample("offer", "unrepeatable spammy verbiage", "d1");
        // Another process holding the advisory lock file.
        let holder = store::TokenStore::open_write(&db.config.path).unwrap();
        assert!(db.learn(true, &msg).unwrap());
        // The snapshot is untouched; the update sits in the journal.
        let snapshot = store::TokenStore::open_read(&db.config.path).unwrap();
        assert_eq!(snapshot.data.nspam, 0);
        assert!(!journal::read_entries(&db.config.path).unwrap().is_empty());
        // Deferred learns still deduplicate against the journal.
        assert!(!db.learn(true, &msg).unwrap());
        drop(holder);
        // The next writer folds the journal into the store.
        db.sync_journal().unwrap();
        assert_eq!(db.corpus_counts().unwrap(), (1, 0));
        assert!(journal::read_entries(&db.config.path).unwrap().is_empty());
    }

    #[test]
    fn scan_never_panics_on_missing_store() {
        let dir = tempdir("missing");
        let mut config = test_config(&dir);
        config.path = dir.join("nonexistent").join("bayes");
        let db = BayesDb::new(config);
        let msg = sample("x", "y", "m5");
        assert_eq!(db.scan(&msg), 0.5);
    }
}
