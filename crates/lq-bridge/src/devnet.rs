//! Supervisor for the local devnet node.
//!
//! At most one devnet runs at a time. Its stdout and stderr are streamed to
//! the sink of the `start-devnet` request that launched it, followed by a
//! single `exit` event.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lq_core::config::DevnetConfig;
use lq_core::protocol::Event;
use lq_core::sink::EventSink;
use lq_session::Utf8Carry;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DevnetError {
    #[error("failed to start devnet: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("devnet is not running")]
    NotRunning,
}

struct Running {
    generation: u64,
    pid: Option<u32>,
    stdin: flume::Sender<Vec<u8>>,
    kill: Option<oneshot::Sender<()>>,
}

pub struct DevnetSupervisor {
    program: PathBuf,
    args: Vec<String>,
    slot: Arc<Mutex<Option<Running>>>,
    generation: AtomicU64,
}

impl DevnetSupervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &DevnetConfig) -> Self {
        Self::new(config.program(), config.args.clone())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().as_ref().and_then(|r| r.pid)
    }

    /// Launch the devnet unless one is already running.
    pub fn start(&self, sink: &EventSink) -> Result<(), DevnetError> {
        let mut slot = self.lock();
        if let Some(running) = slot.as_ref() {
            sink.emit(Event::Log(format!(
                "devnet already running (pid {})",
                pid_label(running.pid)
            )));
            return Ok(());
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DevnetError::Spawn)?;

        let pid = child.id();
        info!(program = %self.program.display(), pid = ?pid, "devnet started");
        sink.emit(Event::Log(format!("devnet started (pid {})", pid_label(pid))));

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (stdin_tx, stdin_rx) = flume::unbounded::<Vec<u8>>();

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Ok(bytes) = stdin_rx.recv_async().await {
                    if stdin.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(stream_output(out, sink.clone(), Event::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(stream_output(err, sink.clone(), Event::Stderr)));

        *slot = Some(Running {
            generation,
            pid,
            stdin: stdin_tx,
            kill: Some(kill_tx),
        });
        drop(slot);

        let slot = self.slot.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let code = wait_or_kill(&mut child, kill_rx).await;
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            info!(?code, "devnet exited");
            sink.emit(Event::Exit { code });

            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|r| r.generation == generation) {
                *slot = None;
            }
        });
        Ok(())
    }

    /// Kill the running devnet.
    pub fn stop(&self, sink: &EventSink) -> Result<(), DevnetError> {
        let mut running = self.lock().take().ok_or(DevnetError::NotRunning)?;
        if let Some(kill) = running.kill.take() {
            let _ = kill.send(());
        }
        info!(pid = ?running.pid, "devnet stop requested");
        sink.emit(Event::Success(json!("devnet stopped")));
        Ok(())
    }

    /// Forward `input` to the devnet's stdin. Dropped when nothing runs.
    pub fn write_stdin(&self, input: &str) {
        match self.lock().as_ref() {
            Some(running) => {
                let _ = running.stdin.send(input.as_bytes().to_vec());
            }
            None => debug!("stdin ignored, devnet is not running"),
        }
    }

    /// Kill any running devnet (daemon teardown).
    pub fn shutdown(&self) {
        if let Some(mut running) = self.lock().take() {
            if let Some(kill) = running.kill.take() {
                let _ = kill.send(());
            }
            info!(pid = ?running.pid, "devnet killed on shutdown");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.slot.lock().unwrap_or_else(|e| {
            warn!("devnet lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl std::fmt::Debug for DevnetSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevnetSupervisor")
            .field("program", &self.program)
            .field("pid", &self.pid())
            .finish()
    }
}

fn pid_label(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
}

async fn wait_or_kill(child: &mut Child, kill_rx: oneshot::Receiver<()>) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("devnet kill failed: {e}");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("devnet wait failed: {e}");
            None
        }
    }
}

async fn stream_output<R>(mut reader: R, sink: EventSink, wrap: fn(String) -> Event)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    let mut carry = Utf8Carry::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = carry.decode(&buf[..n]);
                if !text.is_empty() {
                    sink.emit(wrap(text));
                }
            }
            Err(e) => {
                debug!("devnet output closed: {e}");
                break;
            }
        }
    }
    let tail = carry.finish();
    if !tail.is_empty() {
        sink.emit(wrap(tail));
    }
}
