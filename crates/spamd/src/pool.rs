/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The worker-pool scheduler. The parent owns the listen socket and a
//! six-byte command channel per worker; workers serve one connection at a
//! time. Dispatch always picks the lowest-id idle worker, a pending
//! connection with no idle worker flips the pool into the overloaded state,
//! and pool size adjusts by at most one worker per pass.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::frame::{self, Command, Report};
use crate::worker;
use crate::{SharedContext, PING_INTERVAL_SECS, READ_MAX_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Idle,
    Busy,
    Killed,
    Error,
}

enum ChildEvent {
    Report(u32, Report),
    Gone(u32),
}

struct Child {
    state: ChildState,
    writer: Option<OwnedWriteHalf>,
    conn_tx: mpsc::Sender<TcpStream>,
    worker: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub struct Pool {
    ctx: SharedContext,
    listener: TcpListener,
    children: BTreeMap<u32, Child>,
    next_id: u32,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
    events_rx: mpsc::UnboundedReceiver<ChildEvent>,
    /// The connection waiting for a worker while the pool is overloaded.
    pending: Option<TcpStream>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pool {
    pub fn new(ctx: SharedContext, listener: TcpListener, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Pool {
            ctx,
            listener,
            children: BTreeMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
            pending: None,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        for _ in 0..self.ctx.config.min_children.max(1) {
            self.spawn_child();
        }

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(PING_INTERVAL_SECS),
            Duration::from_secs(PING_INTERVAL_SECS),
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    tracing::debug!(context = "pool", "shutting down");
                    break;
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                accepted = self.listener.accept(), if self.pending.is_none() => {
                    match accepted {
                        Ok((conn, remote)) => {
                            tracing::trace!(context = "pool", remote = %remote, "accepted");
                            self.place_connection(conn).await;
                        }
                        Err(err) => {
                            // Transient accept faults must not take the
                            // parent down; rebuild state and retry.
                            tracing::warn!(context = "pool", "accept failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = ping.tick() => {
                    self.broadcast_ping().await;
                }
            }
            self.adjust_pool();
        }

        // Closing every command channel lets the workers observe EOF and
        // exit on their own; in-flight requests run to completion.
        for (_, child) in self.children.iter_mut() {
            child.writer = None;
        }
    }

    fn spawn_child(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let (parent_side, child_side) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(context = "pool", "cannot create command channel: {err}");
                return;
            }
        };
        let (mut read_half, write_half) = parent_side.into_split();
        let (conn_tx, conn_rx) = mpsc::channel(1);

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match frame::read_frame(&mut read_half).await {
                    Ok(bytes) => match frame::decode_report(&bytes) {
                        Ok(report) => {
                            if events.send(ChildEvent::Report(id, report)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(context = "pool", id = id, "bad report frame: {err}");
                            let _ = events.send(ChildEvent::Gone(id));
                            return;
                        }
                    },
                    Err(_) => {
                        let _ = events.send(ChildEvent::Gone(id));
                        return;
                    }
                }
            }
        });

        let ctx = self.ctx.clone();
        let worker = tokio::spawn(worker::worker_main(id, child_side, conn_rx, ctx));

        tracing::debug!(context = "pool", id = id, "worker started");
        self.children.insert(
            id,
            Child {
                state: ChildState::Starting,
                writer: Some(write_half),
                conn_tx,
                worker,
                reader,
            },
        );
    }

    fn lowest_idle(&self) -> Option<u32> {
        self.children
            .iter()
            .find(|(_, child)| child.state == ChildState::Idle)
            .map(|(id, _)| *id)
    }

    async fn place_connection(&mut self, conn: TcpStream) {
        match self.lowest_idle() {
            Some(id) => self.dispatch(id, conn).await,
            None => {
                tracing::debug!(context = "pool", "overloaded, connection queued");
                self.pending = Some(conn);
            }
        }
    }

    /// Hand a connection to one worker: `A` on the command channel, the
    /// stream, then a mandatory `B` confirmation within the read deadline.
    async fn dispatch(&mut self, id: u32, conn: TcpStream) {
        let frame_bytes = frame::encode_command(Command::Accept);
        let sent = match self.children.get_mut(&id) {
            Some(child) => match child.writer.as_mut() {
                Some(writer) => frame::write_frame(writer, &frame_bytes).await.is_ok(),
                None => {
                    self.pending = Some(conn);
                    return;
                }
            },
            None => {
                self.pending = Some(conn);
                return;
            }
        };
        if !sent {
            self.mark_error(id);
            self.pending = Some(conn);
            return;
        }
        let conn_tx = match self.children.get(&id) {
            Some(child) => child.conn_tx.clone(),
            None => {
                self.pending = Some(conn);
                return;
            }
        };
        if conn_tx.send(conn).await.is_err() {
            self.mark_error(id);
            return;
        }

        // Require the busy confirmation; reports from other workers keep
        // flowing while we wait.
        let deadline = Duration::from_secs(READ_MAX_SECS);
        let confirmed = tokio::time::timeout(deadline, async {
            loop {
                match self.events_rx.recv().await {
                    Some(ChildEvent::Report(from, Report::Busy(_))) if from == id => {
                        return true;
                    }
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if confirmed {
            if let Some(child) = self.children.get_mut(&id) {
                child.state = ChildState::Busy;
            }
        } else {
            tracing::warn!(context = "pool", id = id, "no busy confirmation, reaping worker");
            self.mark_error(id);
        }
    }

    async fn handle_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Report(id, Report::Idle(_)) => {
                let newly_idle = match self.children.get_mut(&id) {
                    Some(child)
                        if !matches!(child.state, ChildState::Killed | ChildState::Error) =>
                    {
                        child.state = ChildState::Idle;
                        true
                    }
                    _ => false,
                };
                // Leaving the overloaded state: the queued connection goes
                // straight to the worker that just freed up.
                if newly_idle {
                    if let Some(conn) = self.pending.take() {
                        Box::pin(self.dispatch(id, conn)).await;
                    }
                }
            }
            ChildEvent::Report(id, Report::Busy(_)) => {
                if let Some(child) = self.children.get_mut(&id) {
                    if !matches!(child.state, ChildState::Killed | ChildState::Error) {
                        child.state = ChildState::Busy;
                    }
                }
            }
            ChildEvent::Gone(id) => {
                if let Some(child) = self.children.remove(&id) {
                    if !matches!(child.state, ChildState::Killed | ChildState::Error) {
                        tracing::warn!(context = "pool", id = id, "worker exited unexpectedly");
                    }
                    child.reader.abort();
                    child.worker.abort();
                }
            }
        }
    }

    async fn broadcast_ping(&mut self) {
        let ping = frame::encode_command(Command::Ping);
        let mut failed = Vec::new();
        for (id, child) in self.children.iter_mut() {
            if let Some(writer) = child.writer.as_mut() {
                if frame::write_frame(writer, &ping).await.is_err() {
                    failed.push(*id);
                }
            }
        }
        for id in failed {
            tracing::warn!(context = "pool", id = id, "ping failed, reaping worker");
            self.mark_error(id);
        }
    }

    fn mark_error(&mut self, id: u32) {
        if let Some(child) = self.children.get_mut(&id) {
            child.state = ChildState::Error;
            // Dropping the write half closes the channel; the worker exits
            // on EOF and the reader task reports it gone.
            child.writer = None;
        }
    }

    /// One worker added or removed per pass, never both.
    fn adjust_pool(&mut self) {
        let config = &self.ctx.config;
        let live = self
            .children
            .values()
            .filter(|c| !matches!(c.state, ChildState::Killed | ChildState::Error))
            .count();
        let num_idle = self
            .children
            .values()
            .filter(|c| c.state == ChildState::Idle)
            .count();

        if num_idle < config.min_idle && live < config.max_children {
            self.spawn_child();
        } else if num_idle > config.max_idle && live > config.min_children {
            let highest_idle = self
                .children
                .iter()
                .rev()
                .find(|(_, child)| child.state == ChildState::Idle)
                .map(|(id, _)| *id);
            if let Some(id) = highest_idle {
                tracing::debug!(context = "pool", id = id, "retiring idle worker");
                if let Some(child) = self.children.get_mut(&id) {
                    child.state = ChildState::Killed;
                    child.writer = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engine::dns::NullResolver;
    use engine::Runtime;
    use ruleset::Conf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::watch;

    use crate::{DaemonConfig, ServerContext};

    use super::Pool;

    fn context(min_children: usize, max_children: usize) -> crate::SharedContext {
        let mut conf = Conf::new();
        conf.parse(
            "header FOO Subject =~ /\\bwin\\b/i\n\
             score FOO 2.5\n\
             required_hits 5.0\n",
            false,
        );
        assert_eq!(conf.errors, 0);
        let runtime = Runtime::new(conf.clone().finish_parsing(), None, Arc::new(NullResolver));
        Arc::new(ServerContext {
            runtime,
            base_conf: conf,
            config: DaemonConfig {
                min_children,
                max_children,
                min_idle: 1,
                max_idle: max_children,
                user_prefs_dir: None,
            },
        })
    }

    async fn start_pool(
        min_children: usize,
        max_children: usize,
    ) -> (std::net::SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Pool::new(context(min_children, max_children), listener, shutdown_rx);
        tokio::spawn(pool.run());
        (addr, shutdown_tx)
    }

    async fn roundtrip(addr: std::net::SocketAddr, message: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CHECK SPAMC/1.3\r\nContent-length: {}\r\n\r\n{message}",
            message.len()
        );
        conn.write_all(request.as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn daemon_single_request() {
        let (addr, _shutdown) = start_pool(1, 1).await;
        let response = roundtrip(addr, "Subject: hello\n\nnothing wrong here\n").await;
        assert!(response.starts_with("SPAMD/1.1 0 EX_OK\r\n"), "{response}");
        assert!(response.contains("Spam: False ; 0.0 / 5.0"), "{response}");
    }

    #[tokio::test]
    async fn daemon_reports_matched_rule_score() {
        let (addr, _shutdown) = start_pool(1, 2).await;
        let response = roundtrip(addr, "Subject: you win\n\nprize inside\n").await;
        assert!(response.contains("Spam: False ; 2.5 / 5.0"), "{response}");
    }

    #[tokio::test]
    async fn sequential_requests_reuse_the_single_worker() {
        let (addr, _shutdown) = start_pool(1, 1).await;
        for _ in 0..3 {
            let response = roundtrip(addr, "Subject: hi\n\nbody\n").await;
            assert!(response.contains("Spam: False"), "{response}");
        }
    }

    #[tokio::test]
    async fn concurrent_requests_are_all_served() {
        let (addr, _shutdown) = start_pool(2, 4).await;
        let mut tasks = Vec::new();
        for i in 0..6 {
            tasks.push(tokio::spawn(async move {
                roundtrip(addr, &format!("Subject: msg {i}\n\nbody {i}\n")).await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap();
            assert!(response.contains("Spam: False"), "{response}");
        }
    }

    #[tokio::test]
    async fn unparsable_request_gets_protocol_error() {
        let (addr, _shutdown) = start_pool(1, 1).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("SPAMD/1.1 76 EX_PROTOCOL"), "{response}");
    }
}
