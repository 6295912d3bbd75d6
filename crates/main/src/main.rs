/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use engine::Runtime;
use ruleset::Conf;
use spamd::pool::Pool;
use spamd::{DaemonConfig, ServerContext};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spamd", about = "Content-based mail classification daemon")]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:783")]
    listen: String,

    /// Rule configuration files, parsed in order.
    #[arg(short, long, required = true)]
    config: Vec<PathBuf>,

    /// Directory with per-user preference files (<user>.cf).
    #[arg(long)]
    user_prefs_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    min_children: usize,

    #[arg(long, default_value_t = 5)]
    max_children: usize,

    /// Spawn a worker when fewer than this many sit idle.
    #[arg(long, default_value_t = 1)]
    min_spare: usize,

    /// Retire a worker when more than this many sit idle.
    #[arg(long, default_value_t = 2)]
    max_spare: usize,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut conf = Conf::new();
    for path in &args.config {
        if let Err(err) = conf.parse_file(path, false) {
            eprintln!("cannot read configuration {}: {err}", path.display());
            std::process::exit(1);
        }
    }
    if conf.errors > 0 {
        tracing::warn!(
            context = "boot",
            errors = conf.errors,
            "configuration parsed with errors"
        );
    }

    let base_conf = conf.clone();
    let runtime = Runtime::from_ruleset(conf.finish_parsing());
    tracing::info!(
        context = "boot",
        bayes = runtime.bayes_available(),
        net = runtime.net_available(),
        "rules compiled"
    );

    let ctx = Arc::new(ServerContext {
        runtime,
        base_conf,
        config: DaemonConfig {
            min_children: args.min_children,
            max_children: args.max_children,
            min_idle: args.min_spare,
            max_idle: args.max_spare,
            user_prefs_dir: args.user_prefs_dir,
        },
    });

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(context = "boot", listen = args.listen, "daemon started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(Pool::new(ctx, listener, shutdown_rx).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!(context = "boot", "shutdown requested");
    let _ = shutdown_tx.send(true);

    // Give in-flight requests a moment to complete.
    let _ = tokio::time::timeout(Duration::from_secs(1), pool).await;

    Ok(())
}
