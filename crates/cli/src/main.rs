/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use engine::Runtime;
use message::Message;
use ruleset::Conf;
use spamd::client::{self, ClientOptions};
use spamd::protocol::Verb;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

#[derive(Parser, Debug)]
#[command(name = "spamc", about = "Mail classification client and corpus tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Rule configuration files for the local modes.
    #[arg(short, long)]
    config: Vec<PathBuf>,

    /// Daemon address for the network modes.
    #[arg(short, long, default_value = "127.0.0.1:783")]
    dest: String,

    /// Classify on behalf of this user.
    #[arg(short, long)]
    user: Option<String>,

    /// Largest message to submit; anything bigger passes through untouched.
    #[arg(long, default_value_t = client::DEFAULT_MAX_SIZE)]
    max_size: usize,

    /// Exit with an error instead of passing the message through when the
    /// daemon is unreachable.
    #[arg(long)]
    no_safe_fallback: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the daemon for a verdict; prints `score/threshold`.
    Check,
    /// Ask the daemon for the matched rule names.
    Symbols,
    /// Ask the daemon for the full analysis report.
    Report,
    /// Like report, but the body only comes back for spam.
    ReportIfspam,
    /// Ask the daemon for the rewritten message.
    Process,
    /// Classify stdin locally and print the rewritten message.
    Scan,
    /// Learn stdin into the Bayes corpus.
    Learn {
        #[arg(long, conflicts_with = "ham")]
        spam: bool,
        #[arg(long)]
        ham: bool,
    },
    /// Remove stdin from the Bayes corpus.
    Forget,
    /// Check the configuration and report every problem found.
    Lint,
}

async fn read_stdin() -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    Ok(buf)
}

fn load_conf(cli: &Cli, lint: bool) -> Result<Conf, u8> {
    let mut conf = Conf::new();
    conf.lint = lint;
    if cli.config.is_empty() {
        eprintln!("this mode needs at least one --config file");
        return Err(EX_SOFTWARE);
    }
    for path in &cli.config {
        if let Err(err) = conf.parse_file(path, false) {
            eprintln!("cannot read configuration {}: {err}", path.display());
            return Err(EX_SOFTWARE);
        }
    }
    Ok(conf)
}

async fn network_mode(cli: &Cli, verb: Verb) -> u8 {
    let message = match read_stdin().await {
        Ok(message) => message,
        Err(err) => {
            eprintln!("cannot read message: {err}");
            return EX_DATAERR;
        }
    };
    let opts = ClientOptions {
        addr: cli.dest.clone(),
        user: cli.user.clone(),
        max_size: cli.max_size,
        safe_fallback: !cli.no_safe_fallback,
    };
    let outcome = client::filter(verb, &message, &opts).await;
    if outcome.code != 0 {
        eprintln!("daemon exchange failed with code {}", outcome.code);
        return outcome.code.min(255) as u8;
    }
    let mut stdout = tokio::io::stdout();
    match verb {
        Verb::Check => {
            let line = format!("{:.1}/{:.1}\n", outcome.score, outcome.threshold);
            let _ = stdout.write_all(line.as_bytes()).await;
            u8::from(outcome.is_spam == Some(true))
        }
        _ => {
            let _ = stdout.write_all(&outcome.output).await;
            let _ = stdout.flush().await;
            0
        }
    }
}

async fn scan_mode(cli: &Cli) -> u8 {
    let conf = match load_conf(cli, false) {
        Ok(conf) => conf,
        Err(code) => return code,
    };
    let runtime = Runtime::from_ruleset(conf.finish_parsing());
    let raw = match read_stdin().await {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("cannot read message: {err}");
            return EX_DATAERR;
        }
    };
    let mut msg = match Message::parse(raw) {
        Ok(msg) => msg,
        Err(err) => {
            eprintln!("cannot parse message: {err}");
            return EX_DATAERR;
        }
    };
    let pms = engine::check(&runtime, &mut msg, false);
    engine::auto_learn(&runtime, &msg, &pms);
    let rewritten = engine::report::rewrite(&mut msg, &pms);
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(&rewritten).await;
    let _ = stdout.flush().await;
    0
}

async fn corpus_mode(cli: &Cli, learn_spam: Option<bool>) -> u8 {
    let conf = match load_conf(cli, false) {
        Ok(conf) => conf,
        Err(code) => return code,
    };
    let runtime = Runtime::from_ruleset(conf.finish_parsing());
    let Some(db) = &runtime.bayes else {
        eprintln!("bayes is disabled in this configuration");
        return EX_SOFTWARE;
    };
    let raw = match read_stdin().await {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("cannot read message: {err}");
            return EX_DATAERR;
        }
    };
    let msg = match Message::parse(raw) {
        Ok(msg) => msg,
        Err(err) => {
            eprintln!("cannot parse message: {err}");
            return EX_DATAERR;
        }
    };
    let result = match learn_spam {
        Some(is_spam) => db.learn(is_spam, &msg),
        None => db.forget(&msg),
    };
    match result {
        Ok(changed) => {
            if !changed {
                eprintln!("no change: message was already in that state");
            }
            0
        }
        Err(err) => {
            eprintln!("corpus update failed: {err}");
            EX_SOFTWARE
        }
    }
}

fn lint_mode(cli: &Cli) -> u8 {
    let conf = match load_conf(cli, true) {
        Ok(conf) => conf,
        Err(code) => return code,
    };
    // finish_parsing performs the cross-rule checks lint exists for; its
    // findings come back on the compiled ruleset.
    let compiled = conf.finish_parsing();
    for message in &compiled.lint_messages {
        eprintln!("lint: {message}");
    }
    if compiled.parse_errors > 0 {
        eprintln!("lint: {} issue(s) found", compiled.parse_errors);
        compiled.parse_errors.min(255) as u8
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Check => network_mode(&cli, Verb::Check).await,
        Commands::Symbols => network_mode(&cli, Verb::Symbols).await,
        Commands::Report => network_mode(&cli, Verb::Report).await,
        Commands::ReportIfspam => network_mode(&cli, Verb::ReportIfspam).await,
        Commands::Process => network_mode(&cli, Verb::Process).await,
        Commands::Scan => scan_mode(&cli).await,
        Commands::Learn { spam, ham } => {
            if !spam && !ham {
                eprintln!("learn needs --spam or --ham");
                EX_SOFTWARE
            } else {
                corpus_mode(&cli, Some(spam)).await
            }
        }
        Commands::Forget => corpus_mode(&cli, None).await,
        Commands::Lint => lint_mode(&cli),
    };
    ExitCode::from(code)
}
