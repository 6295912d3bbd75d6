/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod client;
pub mod frame;
pub mod pool;
pub mod protocol;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use engine::Runtime;
use ruleset::Conf;

/// Parent broadcasts a ping when the select loop has been idle this long.
pub const PING_INTERVAL_SECS: u64 = 150;

/// A command-channel read that makes no progress for this long marks the
/// peer dead.
pub const READ_MAX_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub min_children: usize,
    pub max_children: usize,
    pub min_idle: usize,
    pub max_idle: usize,
    /// Per-user preference files, `<dir>/<user>.cf`, applied scores-only.
    pub user_prefs_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            min_children: 1,
            max_children: 5,
            min_idle: 1,
            max_idle: 2,
            user_prefs_dir: None,
        }
    }
}

/// Everything a worker needs to serve requests: the compiled base runtime,
/// the parse-time configuration for per-user overlays, and the daemon knobs.
pub struct ServerContext {
    pub runtime: Runtime,
    pub base_conf: Conf,
    pub config: DaemonConfig,
}

pub type SharedContext = Arc<ServerContext>;
