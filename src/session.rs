//! Per-connection MPD session
//!
//! Owns the socket for one client: greeting, line framing, command-list
//! buffering and the blocking `idle` wait. Everything protocol-visible
//! flows through here; command semantics live in `command`.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{run_list, Bridge, Command, CommandList, SessionCtx};
use crate::protocol::{Ack, AckCode, GREETING};
use crate::state::Subsystem;

enum Flow {
    Continue,
    Close,
}

pub struct Session {
    /// `next_line` is cancellation safe, so a partial line survives
    /// losing the `idle` race to a notification.
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    bridge: Arc<Bridge>,
    ctx: SessionCtx,
    /// Subscribed at connect time so changes queue up between `idle`s.
    notifications: broadcast::Receiver<Subsystem>,
    /// Changes seen but not yet reported to the client.
    pending: Vec<Subsystem>,
    list: Option<CommandList>,
    shutdown: CancellationToken,
    peer: String,
}

/// Drive one client connection to completion. Errors are connection
/// failures; they end the session, never the server.
pub async fn run_session(stream: TcpStream, bridge: Arc<Bridge>, shutdown: CancellationToken) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(peer, "client connected");

    let (read_half, write_half) = stream.into_split();
    let session = Session {
        lines: BufReader::new(read_half).lines(),
        writer: write_half,
        notifications: bridge.cache.subscribe(),
        bridge,
        ctx: SessionCtx::default(),
        pending: Vec::new(),
        list: None,
        shutdown,
        peer: peer.clone(),
    };

    match session.run().await {
        Ok(()) => debug!(peer, "client disconnected"),
        Err(e) => debug!(peer, "session ended: {}", e),
    }
}

impl Session {
    async fn run(mut self) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", GREETING).as_bytes())
            .await?;

        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.lines.next_line() => match next? {
                    Some(line) => line,
                    None => break,
                },
            };
            match self.handle_line(line.trim_end_matches('\r')).await? {
                Flow::Continue => {}
                Flow::Close => break,
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        debug!(peer = %self.peer, line, "request");

        // An open command list swallows raw lines until its terminator;
        // the terminator tolerates whitespace like any tokenized command
        if self.list.is_some() {
            if line.trim() != "command_list_end" {
                if let Some(list) = self.list.as_mut() {
                    list.push(line.to_string());
                }
                return Ok(Flow::Continue);
            }
            if let Some(list) = self.list.take() {
                let outcome = run_list(&self.bridge, &mut self.ctx, &list).await;
                self.writer.write_all(outcome.body.as_bytes()).await?;
                if outcome.close {
                    return Ok(Flow::Close);
                }
                match outcome.ack {
                    Some(ack) => self.write_line(&ack.to_string()).await?,
                    None => self.write_line("OK").await?,
                }
            }
            return Ok(Flow::Continue);
        }

        match line.split_whitespace().next().unwrap_or("") {
            // close sends no farewell line
            "close" => Ok(Flow::Close),
            "command_list_begin" => {
                self.list = Some(CommandList::new(false));
                Ok(Flow::Continue)
            }
            "command_list_ok_begin" => {
                self.list = Some(CommandList::new(true));
                Ok(Flow::Continue)
            }
            "command_list_end" => {
                let ack = Ack::new(AckCode::NotList, "command_list_end", "not in command list");
                self.write_line(&ack.to_string()).await?;
                Ok(Flow::Continue)
            }
            "noidle" => {
                // Not idling, so there is nothing to report
                self.write_line("OK").await?;
                Ok(Flow::Continue)
            }
            "idle" => self.idle(line).await,
            _ => self.dispatch_single(line).await,
        }
    }

    async fn dispatch_single(&mut self, line: &str) -> Result<Flow> {
        let result = match Command::parse(line) {
            Ok(cmd) => self.bridge.dispatch(&mut self.ctx, &cmd).await,
            Err(ack) => Err(ack),
        };
        match result {
            Ok(response) => {
                let mut out = response.into_inner();
                out.push_str("OK\n");
                self.writer.write_all(out.as_bytes()).await?;
            }
            Err(ack) => self.write_line(&ack.to_string()).await?,
        }
        Ok(Flow::Continue)
    }

    /// Block until a subscribed subsystem changes, the client sends
    /// `noidle`, or the connection goes away.
    async fn idle(&mut self, line: &str) -> Result<Flow> {
        let subjects = match parse_idle_args(line) {
            Ok(subjects) => subjects,
            Err(ack) => {
                self.write_line(&ack.to_string()).await?;
                return Ok(Flow::Continue);
            }
        };

        self.drain_notifications();
        if !self.pending.iter().any(|sub| subjects.contains(sub)) {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(Flow::Close),
                    result = self.notifications.recv() => match result {
                        Ok(sub) => {
                            if !self.pending.contains(&sub) {
                                self.pending.push(sub);
                            }
                            if subjects.contains(&sub) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.overflow_pending();
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    next = self.lines.next_line() => match next? {
                        Some(line) => {
                            let request = line.trim();
                            if request == "noidle" {
                                break;
                            }
                            // Anything else during idle is ignored
                            debug!(peer = %self.peer, request, "ignored while idling");
                        }
                        None => return Ok(Flow::Close),
                    },
                }
            }
        }

        let changed = take_matching(&mut self.pending, &subjects);
        let mut out = String::new();
        for sub in &changed {
            out.push_str("changed: ");
            out.push_str(sub.name());
            out.push('\n');
        }
        out.push_str("OK\n");
        self.writer.write_all(out.as_bytes()).await?;
        Ok(Flow::Continue)
    }

    /// Pull everything already sitting on the channel into `pending`.
    fn drain_notifications(&mut self) {
        loop {
            match self.notifications.try_recv() {
                Ok(sub) => {
                    if !self.pending.contains(&sub) {
                        self.pending.push(sub);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.overflow_pending(),
                Err(_) => break,
            }
        }
    }

    /// A lagged receiver lost notifications; over-report rather than
    /// miss a change.
    fn overflow_pending(&mut self) {
        self.pending = Subsystem::ALL.to_vec();
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await?;
        Ok(())
    }
}

fn parse_idle_args(line: &str) -> Result<Vec<Subsystem>, Ack> {
    let cmd = Command::parse(line)?;
    if cmd.args.is_empty() {
        return Ok(Subsystem::ALL.to_vec());
    }
    let mut subjects = Vec::new();
    for arg in &cmd.args {
        match Subsystem::parse(arg) {
            Some(sub) => {
                if !subjects.contains(&sub) {
                    subjects.push(sub);
                }
            }
            None => {
                return Err(Ack::new(
                    AckCode::Argument,
                    "idle",
                    format!("Unrecognized idle event: {}", arg),
                ))
            }
        }
    }
    Ok(subjects)
}

/// Remove and return the pending subsystems the client asked about, in
/// protocol order. Unsubscribed ones stay pending for a later `idle`.
fn take_matching(pending: &mut Vec<Subsystem>, wanted: &[Subsystem]) -> Vec<Subsystem> {
    let mut matched = Vec::new();
    for sub in Subsystem::ALL {
        if wanted.contains(&sub) && pending.contains(&sub) {
            matched.push(sub);
        }
    }
    pending.retain(|sub| !matched.contains(sub));
    matched
}
