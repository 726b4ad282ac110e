//! Follower-backed streams: a long-running subprocess whose output lines
//! become stream chunks (`docker logs -f`, `tail -F`).
//!
//! The process is spawned when the action runs, so spawn failures become the
//! action's error, but its output is only read once the stream is started.
//! When the process ends on its own a final `exit` chunk explains why.
//! Cleanup sends SIGTERM and returns; the pump reaps the child and SIGKILL
//! follows after the grace period if it is still around.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HostResult, ResourceError};
use crate::host::{spawn_follower, CommandSpec, Follower, ManagedChild};
use crate::lifecycle::Resource;
use crate::protocol::StreamEmitter;

pub const LINE_KIND: &str = "line";
pub const EXIT_KIND: &str = "exit";

/// Stderr text kept for the exit message
const STDERR_TAIL_CHARS: usize = 512;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Turns an output line into a chunk `(kind, body)`; `None` drops it.
pub type LineMapper = Arc<dyn Fn(OutputStream, &str) -> Option<(&'static str, JsonValue)> + Send + Sync>;

/// A running follower owned by one request id.
#[derive(Debug)]
pub struct FollowerStream {
    handle: ManagedChild,
    gate: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    grace: Duration,
    released: bool,
}

impl FollowerStream {
    pub fn spawn(spec: &CommandSpec, emitter: StreamEmitter, grace: Duration, mapper: LineMapper) -> HostResult<Self> {
        let Follower { child, handle } = spawn_follower(spec)?;
        let (gate_tx, gate_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        tokio::spawn(pump(
            child,
            handle.clone(),
            emitter,
            mapper,
            gate_rx,
            cancel.clone(),
            grace,
        ));

        Ok(Self {
            handle,
            gate: Some(gate_tx),
            cancel,
            grace,
            released: false,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.handle.pid()
    }
}

impl Resource for FollowerStream {
    fn kind(&self) -> &'static str {
        "follower"
    }

    fn start(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    fn cleanup(&mut self) -> Result<(), ResourceError> {
        self.gate = None;
        self.cancel.cancel();
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.handle.terminate(self.grace)
    }
}

impl Drop for FollowerStream {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn keep_tail(buffer: &mut String, line: &str) {
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(line);
    if buffer.len() > STDERR_TAIL_CHARS {
        let mut cut = buffer.len() - STDERR_TAIL_CHARS;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

/// Why the pump stopped
enum Ending {
    /// Both pipes closed: the process is done by itself
    Finished,
    /// Cleanup ran or the connection went away
    Released,
}

async fn pump(
    mut child: Child,
    handle: ManagedChild,
    emitter: StreamEmitter,
    mapper: LineMapper,
    gate: oneshot::Receiver<()>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stderr_tail = String::new();

    let opened = tokio::select! {
        opened = gate => opened.is_ok(),
        _ = cancel.cancelled() => false,
    };

    let ending = if !opened {
        Ending::Released
    } else {
        loop {
            if stdout.is_none() && stderr.is_none() {
                break Ending::Finished;
            }
            let (stream, line) = tokio::select! {
                _ = cancel.cancelled() => break Ending::Released,
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => (OutputStream::Stdout, line),
                    None => {
                        stdout = None;
                        continue;
                    }
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => (OutputStream::Stderr, line),
                    None => {
                        stderr = None;
                        continue;
                    }
                },
            };

            if stream == OutputStream::Stderr {
                keep_tail(&mut stderr_tail, &line);
            }
            if let Some((kind, body)) = mapper(stream, &line) {
                if !emitter.emit(kind, body).await {
                    break Ending::Released;
                }
            }
        }
    };

    match ending {
        Ending::Finished => {
            let status = child.wait().await;
            handle.mark_exited();
            let code = status.as_ref().ok().and_then(|s| s.code());
            let message = match (&status, code) {
                (Ok(s), _) if s.success() => format!("{} exited", handle.program()),
                (Ok(_), Some(code)) => format!("{} exited with code {}", handle.program(), code),
                (Ok(_), None) => format!("{} was terminated by a signal", handle.program()),
                (Err(e), _) => format!("{} could not be reaped: {}", handle.program(), e),
            };
            let message = if stderr_tail.is_empty() {
                message
            } else {
                format!("{}: {}", message, stderr_tail)
            };
            debug!(target: "hostd::actions", id = %emitter.id(), code = ?code, "Follower finished");
            emitter
                .emit(EXIT_KIND, json!({ "code": code, "message": message }))
                .await;
        }
        Ending::Released => {
            // Idempotent: the resource may already have signalled.
            let _ = handle.terminate(grace);
            let reaped = tokio::time::timeout(grace * 2, child.wait()).await;
            handle.mark_exited();
            debug!(target: "hostd::actions", id = %emitter.id(), reaped = reaped.is_ok(), "Follower released");
        }
    }
}
