/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! One worker: announce idle, wait for commands, serve exactly one
//! connection per `A`, report busy before the first client byte and idle
//! after the connection closes. EOF on the command channel ends the worker.

use std::sync::Arc;

use engine::Runtime;
use message::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;

use crate::frame::{self, Command, Report};
use crate::protocol::{self, ProtocolError, Verb, EX_DATAERR, EX_OK, EX_PROTOCOL};
use crate::SharedContext;

pub async fn worker_main(
    id: u32,
    mut channel: UnixStream,
    mut connections: mpsc::Receiver<TcpStream>,
    ctx: SharedContext,
) {
    if frame::write_frame(&mut channel, &frame::encode_report(Report::Idle(id)))
        .await
        .is_err()
    {
        return;
    }

    loop {
        let bytes = match frame::read_frame(&mut channel).await {
            Ok(bytes) => bytes,
            Err(_) => {
                // Parent gone; exit cleanly.
                return;
            }
        };
        match frame::decode_command(&bytes) {
            Ok(Command::Ping) => continue,
            Ok(Command::Accept) => {
                let Some(conn) = connections.recv().await else {
                    return;
                };
                if frame::write_frame(&mut channel, &frame::encode_report(Report::Busy(id)))
                    .await
                    .is_err()
                {
                    return;
                }
                serve_connection(conn, &ctx).await;
                if frame::write_frame(&mut channel, &frame::encode_report(Report::Idle(id)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(context = "worker", id = id, "bad command frame: {err}");
                return;
            }
        }
    }
}

async fn serve_connection(mut conn: TcpStream, ctx: &SharedContext) {
    if let Err(err) = handle_request(&mut conn, ctx).await {
        tracing::debug!(context = "worker", "request failed: {err}");
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut conn).await;
}

/// Serve one classification request on an open stream.
pub async fn handle_request<S>(stream: &mut S, ctx: &SharedContext) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match protocol::read_request(stream).await {
        Ok(request) => request,
        Err(ProtocolError::Io(err)) => return Err(ProtocolError::Io(err)),
        Err(err) => {
            protocol::write_error(stream, EX_PROTOCOL, "EX_PROTOCOL").await?;
            return Err(err);
        }
    };

    // A per-user preference file overlays the base configuration.
    let user_runtime = request.user.as_deref().and_then(|user| {
        build_user_runtime(ctx, user)
    });
    let runtime = user_runtime.as_ref().unwrap_or(&ctx.runtime);

    let mut msg = match Message::parse(request.body) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::debug!(context = "worker", "unparsable message: {err}");
            protocol::write_error(stream, EX_DATAERR, "EX_DATAERR").await?;
            return Ok(());
        }
    };

    let pms = engine::check(runtime, &mut msg, false);
    engine::auto_learn(runtime, &msg, &pms);

    let verdict = protocol::spam_header(pms.is_spam(), pms.score, pms.required_score());
    match request.verb {
        Verb::Check => {
            protocol::write_response(stream, EX_OK, "EX_OK", &[verdict], None).await?;
        }
        Verb::Symbols => {
            let symbols = pms.tests_hit.join(",");
            protocol::write_response(stream, EX_OK, "EX_OK", &[verdict], Some(symbols.as_bytes()))
                .await?;
        }
        Verb::Report => {
            let report = engine::report::build_report(&pms);
            protocol::write_response(stream, EX_OK, "EX_OK", &[verdict], Some(report.as_bytes()))
                .await?;
        }
        Verb::ReportIfspam => {
            let body = pms.is_spam().then(|| engine::report::build_report(&pms));
            protocol::write_response(
                stream,
                EX_OK,
                "EX_OK",
                &[verdict],
                body.as_deref().map(str::as_bytes),
            )
            .await?;
        }
        Verb::Process => {
            let rewritten = engine::report::rewrite(&mut msg, &pms);
            protocol::write_response(stream, EX_OK, "EX_OK", &[verdict], Some(&rewritten))
                .await?;
        }
    }
    Ok(())
}

/// Parse `<user_prefs_dir>/<user>.cf` scores-only on top of a copy of the
/// base configuration. Any problem falls back to the shared runtime.
fn build_user_runtime(ctx: &SharedContext, user: &str) -> Option<Runtime> {
    let dir = ctx.config.user_prefs_dir.as_ref()?;
    if user.is_empty() || user.contains(['/', '\\', '.']) {
        tracing::warn!(context = "worker", user = user, "suspicious user name ignored");
        return None;
    }
    let path = dir.join(format!("{user}.cf"));
    if !path.is_file() {
        return None;
    }
    let mut conf = ctx.base_conf.clone();
    if conf.parse_file(&path, true).is_err() {
        tracing::warn!(
            context = "worker",
            user = user,
            "could not read user preferences"
        );
        return None;
    }
    let rules = conf.finish_parsing();
    let bayes = ctx
        .runtime
        .bayes
        .as_ref()
        .map(|db| bayes::BayesDb::new(db.config().clone()));
    Some(Runtime::new(rules, bayes, Arc::clone(&ctx.runtime.dns)))
}
