use std::collections::HashSet;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lq_core::config::TerminalConfig;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// ETX, what a terminal sends for ctrl-c.
pub const INTERRUPT_BYTE: u8 = 0x03;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty pool is at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty process has exited")]
    Closed,

    #[error("pty signal failed: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// ShellSpec
// ---------------------------------------------------------------------------

/// What to launch inside a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 30,
        }
    }

    /// The interactive login shell described by `[terminal]`. The child
    /// inherits the daemon's environment with `TERM` overridden.
    pub fn from_config(config: &TerminalConfig) -> Self {
        Self {
            program: config.resolved_shell(),
            args: Vec::new(),
            cwd: config.resolved_cwd(),
            env: vec![("TERM".to_string(), config.term_name.clone())],
            cols: config.cols,
            rows: config.rows,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command(&self) -> CommandBuilder {
        let mut command = CommandBuilder::new(&self.program);
        for arg in &self.args {
            command.arg(arg);
        }
        for (k, v) in &self.env {
            command.env(k, v);
        }
        if let Some(cwd) = &self.cwd {
            command.cwd(cwd);
        }
        command
    }
}

// ---------------------------------------------------------------------------
// PtyHandle
// ---------------------------------------------------------------------------

/// One process running inside a pseudo-terminal.
///
/// Three OS threads back a handle: a reader forwarding master output into
/// [`PtyHandle::output`], a writer draining the input channel into the
/// master, and a waiter that owns the child and reports its exit code on
/// [`PtyHandle::exit_signal`]. Every write is one channel message, so
/// concurrent writers never interleave inside a single command line.
pub struct PtyHandle {
    pub id: Uuid,
    pid: Option<u32>,
    output: flume::Receiver<Vec<u8>>,
    exit: flume::Receiver<Option<i32>>,
    writer: flume::Sender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Held so the pty stays open for as long as the handle lives.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    alive: Arc<AtomicBool>,
}

impl PtyHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Raw output chunks, in the order the process produced them.
    pub fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.output.clone()
    }

    /// Yields the exit code once (`None` when it could not be determined).
    pub fn exit_signal(&self) -> flume::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Write bytes to the process input.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|_| PtyError::Closed)
    }

    /// Write `line` followed by a carriage return, as if typed and entered.
    pub fn send_line(&self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\r');
        self.send(&data)
    }

    /// Send ctrl-c through the line discipline. The process may ignore it.
    pub fn interrupt(&self) -> Result<()> {
        self.send(&[INTERRUPT_BYTE])
    }

    /// Send SIGTERM, then hang up the line. Interactive shells ignore
    /// SIGTERM, the hangup is what actually ends them.
    pub fn terminate(&self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            // SAFETY: plain kill(2) on a pid we spawned.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
            }
        }
        self.kill()
    }

    /// Hang up / kill the child through portable-pty.
    pub fn kill(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let mut killer = self.killer.lock().unwrap_or_else(|e| {
            warn!("pty killer lock was poisoned, recovering");
            e.into_inner()
        });
        killer.kill().map_err(|e| PtyError::Signal(e.to_string()))
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PtyPool
// ---------------------------------------------------------------------------

/// Spawns pty processes up to a fixed number of live slots.
pub struct PtyPool {
    max_ptys: usize,
    slots: Mutex<HashSet<Uuid>>,
}

impl PtyPool {
    pub fn new(max_ptys: usize) -> Self {
        info!(max_ptys, "creating PtyPool");
        Self {
            max_ptys,
            slots: Mutex::new(HashSet::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn max_ptys(&self) -> usize {
        self.max_ptys
    }

    /// Spawn `spec` inside a new pseudo-terminal. The slot is held until
    /// [`PtyPool::release`] is called with the handle id.
    pub fn spawn(&self, spec: &ShellSpec) -> Result<PtyHandle> {
        let handle_id = Uuid::new_v4();
        {
            let mut slots = self.lock_slots();
            if slots.len() >= self.max_ptys {
                return Err(PtyError::AtCapacity { max: self.max_ptys });
            }
            slots.insert(handle_id);
        }

        match spawn_handle(handle_id, spec) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.release(handle_id);
                Err(e)
            }
        }
    }

    /// Give back the slot held by `handle_id`. Releasing twice is harmless.
    pub fn release(&self, handle_id: Uuid) {
        if self.lock_slots().remove(&handle_id) {
            debug!(%handle_id, "released pty slot");
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.slots.lock().unwrap_or_else(|e| {
            warn!("PtyPool lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl std::fmt::Debug for PtyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyPool")
            .field("max_ptys", &self.max_ptys)
            .field("active_count", &self.active_count())
            .finish()
    }
}

fn spawn_handle(handle_id: Uuid, spec: &ShellSpec) -> Result<PtyHandle> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

    let mut child = pair
        .slave
        .spawn_command(spec.command())
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    // Only the child keeps the slave side open, so the reader sees EOF on exit.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    debug!(program = %spec.program, ?pid, %handle_id, "spawned pty process");

    // -- output reader thread --
    let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if read_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the child side closes is the normal end of stream.
                    debug!("pty reader finished: {e}");
                    break;
                }
            }
        }
    });

    // -- input writer thread --
    let (write_tx, write_rx) = flume::unbounded::<Vec<u8>>();
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    std::thread::spawn(move || {
        while let Ok(data) = write_rx.recv() {
            if writer.write_all(&data).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    // -- exit waiter thread --
    let (exit_tx, exit_rx) = flume::bounded::<Option<i32>>(1);
    let alive = Arc::new(AtomicBool::new(true));
    let waiter_alive = alive.clone();
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).ok(),
            Err(e) => {
                debug!("pty wait failed: {e}");
                None
            }
        };
        waiter_alive.store(false, Ordering::SeqCst);
        let _ = exit_tx.send(code);
    });

    Ok(PtyHandle {
        id: handle_id,
        pid,
        output: read_rx,
        exit: exit_rx,
        writer: write_tx,
        killer: Mutex::new(killer),
        _master: Mutex::new(pair.master),
        alive,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
