use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lq_core::protocol::Event;
use lq_core::sink::EventSink;
use lq_telemetry::tracing_setup::session_span;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::pty::{PtyHandle, PtyPool, Result, ShellSpec};
use crate::utf8::Utf8Carry;

/// How long to keep forwarding output after the process has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One live shell, keyed by a client-chosen id.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    handle: PtyHandle,
}

impl Session {
    pub fn handle(&self) -> &PtyHandle {
        &self.handle
    }

    pub fn handle_id(&self) -> Uuid {
        self.handle.id
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Owns every live terminal process.
///
/// Clones share the same map. Creation happens under the map lock, so two
/// concurrent requests for an unknown id spawn exactly one process.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    pool: Arc<PtyPool>,
    shell: Arc<ShellSpec>,
}

impl SessionRegistry {
    pub fn new(pool: PtyPool, shell: ShellSpec) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(pool),
            shell: Arc::new(shell),
        }
    }

    pub fn pool(&self) -> &PtyPool {
        &self.pool
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Return the session for `id`, spawning the configured shell if there is
    /// none. The `bool` is `true` when this call created it.
    pub fn get_or_create(&self, id: &str, sink: &EventSink) -> Result<(Arc<Session>, bool)> {
        let shell = self.shell.clone();
        self.get_or_create_with(id, sink, move |pool| pool.spawn(&shell))
    }

    /// Like [`SessionRegistry::get_or_create`] with a caller-supplied spawn.
    ///
    /// On creation `terminal.started` is emitted on `sink`, then a pump task
    /// starts forwarding output as `terminal.stdout` and finally
    /// `terminal.exit`. Every later event of the session goes to this sink.
    pub fn get_or_create_with<F>(
        &self,
        id: &str,
        sink: &EventSink,
        spawn: F,
    ) -> Result<(Arc<Session>, bool)>
    where
        F: FnOnce(&PtyPool) -> Result<PtyHandle>,
    {
        let session = {
            let mut sessions = self.lock();
            if let Some(existing) = sessions.get(id) {
                return Ok((existing.clone(), false));
            }
            // The blocking openpty/fork runs with the map locked, so lookups
            // for every id wait on it. An id is never spawned twice.
            let handle = spawn(&self.pool)?;
            let session = Arc::new(Session {
                id: id.to_string(),
                created_at: Utc::now(),
                handle,
            });
            sessions.insert(id.to_string(), session.clone());
            session
        };

        info!(session_id = %id, pid = ?session.handle.pid(), "terminal session started");
        sink.emit(Event::TerminalStarted { id: id.to_string() });
        self.spawn_pump(session.clone(), sink.clone());
        Ok((session, true))
    }

    /// Drop the mapping for `id` and free its pool slot. The process itself
    /// is not signalled.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.lock().remove(id);
        if let Some(session) = &removed {
            self.pool.release(session.handle.id);
            debug!(session_id = %id, "session removed");
        }
        removed
    }

    /// Remove `id` only if it still maps to the process `handle_id`. A late
    /// exit from a replaced or terminated process is ignored.
    pub fn remove_if_current(&self, id: &str, handle_id: Uuid) -> bool {
        let mut sessions = self.lock();
        let current = sessions
            .get(id)
            .is_some_and(|session| session.handle.id == handle_id);
        if current {
            sessions.remove(id);
        }
        drop(sessions);
        self.pool.release(handle_id);
        current
    }

    /// Kill every process and clear the map (daemon teardown).
    pub fn kill_all(&self) {
        let drained: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            if let Err(e) = session.handle.kill() {
                warn!(session_id = %session.id, "kill failed: {e}");
            }
            self.pool.release(session.handle.id);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "killed all terminal sessions");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Live session ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| {
            warn!("session registry lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn spawn_pump(&self, session: Arc<Session>, sink: EventSink) {
        let registry = self.clone();
        let output = session.handle.output();
        let exit = session.handle.exit_signal();
        let span = session_span(&session.id);

        tokio::spawn(
            async move {
                let mut decoder = Utf8Carry::default();
                let mut forward = |bytes: &[u8]| {
                    let text = decoder.decode(bytes);
                    // Output keeps being drained after the transport goes away
                    // so the shell never blocks on a full pty buffer.
                    if !text.is_empty() && !sink.emit(Event::TerminalStdout(text)) {
                        debug!("transport gone, discarding terminal output");
                    }
                };

                let code = loop {
                    tokio::select! {
                        biased;
                        chunk = output.recv_async() => match chunk {
                            Ok(bytes) => forward(&bytes),
                            Err(_) => break exit.recv_async().await.ok().flatten(),
                        },
                        code = exit.recv_async() => {
                            while let Ok(Ok(bytes)) =
                                tokio::time::timeout(EXIT_DRAIN, output.recv_async()).await
                            {
                                forward(&bytes);
                            }
                            break code.ok().flatten();
                        }
                    }
                };

                let tail = decoder.finish();
                if !tail.is_empty() {
                    sink.emit(Event::TerminalStdout(tail));
                }
                info!(?code, "terminal process exited");
                sink.emit(Event::TerminalExit { code });
                if !registry.remove_if_current(&session.id, session.handle.id) {
                    debug!("exit for a session that was already removed");
                }
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.ids())
            .field("pool", &self.pool)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lq_core::protocol::EventFrame;

    fn registry(max: usize) -> SessionRegistry {
        SessionRegistry::new(PtyPool::new(max), ShellSpec::new("/bin/cat"))
    }

    async fn next_exit(rx: &flume::Receiver<EventFrame>) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frame = tokio::time::timeout_at(deadline, rx.recv_async())
                .await
                .expect("no exit event")
                .expect("sink closed");
            if let Event::TerminalExit { code } = frame.event {
                return code;
            }
        }
    }

    #[tokio::test]
    async fn second_create_reuses_process() {
        let reg = registry(4);
        let (sink, rx) = EventSink::channel(None);

        let (first, created) = reg.get_or_create("a", &sink).unwrap();
        assert!(created);
        let (second, created) = reg.get_or_create("a", &sink).unwrap();
        assert!(!created);
        assert_eq!(first.handle_id(), second.handle_id());
        assert_eq!(reg.pool().active_count(), 1);

        let started: Vec<_> = rx
            .try_iter()
            .filter(|f| matches!(f.event, Event::TerminalStarted { .. }))
            .collect();
        assert_eq!(started.len(), 1);
        reg.kill_all();
    }

    #[tokio::test]
    async fn distinct_ids_get_distinct_processes() {
        let reg = registry(4);
        let (sink, _rx) = EventSink::channel(None);
        let (a, _) = reg.get_or_create("a", &sink).unwrap();
        let (b, _) = reg.get_or_create("b", &sink).unwrap();
        assert_ne!(a.handle_id(), b.handle_id());
        assert_eq!(reg.ids(), vec!["a".to_string(), "b".to_string()]);
        reg.kill_all();
        assert!(reg.is_empty());
        assert_eq!(reg.pool().active_count(), 0);
    }

    #[tokio::test]
    async fn natural_exit_emits_and_removes() {
        let reg = registry(2);
        let (sink, rx) = EventSink::channel(None);
        reg.get_or_create_with("x", &sink, |pool| {
            pool.spawn(&ShellSpec::new("/bin/sh").arg("-c").arg("exit 3"))
        })
        .unwrap();

        assert_eq!(next_exit(&rx).await, Some(3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reg.contains("x"));
        assert_eq!(reg.pool().active_count(), 0);
    }

    #[tokio::test]
    async fn stale_exit_does_not_remove_replacement() {
        let reg = registry(4);
        let (sink, _rx) = EventSink::channel(None);
        let (old, _) = reg.get_or_create("t", &sink).unwrap();
        reg.remove("t");
        let (fresh, created) = reg.get_or_create("t", &sink).unwrap();
        assert!(created);

        assert!(!reg.remove_if_current("t", old.handle_id()));
        assert!(reg.contains("t"));
        assert!(reg.remove_if_current("t", fresh.handle_id()));
        old.handle().kill().unwrap();
        fresh.handle().kill().unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let reg = registry(1);
        let (sink, rx) = EventSink::channel(None);
        let result = reg.get_or_create_with("bad", &sink, |pool| {
            pool.spawn(&ShellSpec::new("/no/such/shell"))
        });
        assert!(result.is_err());
        assert!(!reg.contains("bad"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_creation_spawns_once() {
        let reg = registry(8);
        let (sink, _rx) = EventSink::channel(None);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                reg.get_or_create("same", &sink).map(|(s, _)| s.handle_id()).unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(reg.pool().active_count(), 1);
        reg.kill_all();
    }
}
