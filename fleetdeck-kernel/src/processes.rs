//! Local background processes: lookup by command pattern, termination,
//! detached spawn with log redirection, and listening-port probes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::net::TcpStream;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    pub pid: u32,
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub id: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub port: Option<u16>,
    pub log_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("cannot parse command `{command}`: {message}")]
    InvalidCommand { command: String, message: String },
    #[error("empty command")]
    EmptyCommand,
    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Processes whose command line (or name) contains `pattern`.
    async fn find(&self, pattern: &str) -> Vec<ProcessMatch>;
    /// Sends a termination signal; false when the pid is gone or refused.
    async fn terminate(&self, pid: u32) -> bool;
    /// Starts a child that outlives the request; returns its pid.
    async fn spawn_detached(&self, req: &SpawnRequest) -> Result<u32, ProcessError>;
    async fn port_open(&self, port: u16) -> bool;
}

/// Polls until nothing matches `pattern` any more. Returns false on timeout.
pub async fn wait_for_exit(table: &dyn ProcessTable, pattern: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if table.find(pattern).await.is_empty() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// `ProcessTable` backed by the OS process list. Process scans are blocking
/// syscalls and run on the blocking pool.
pub struct SysinfoTable {
    system: Arc<Mutex<System>>,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(system: &Mutex<System>, pattern: &str) -> Vec<ProcessMatch> {
    let own_pid = std::process::id();
    let mut sys = system.lock();
    sys.refresh_processes();

    let mut matches: Vec<ProcessMatch> = sys
        .processes()
        .values()
        .filter(|p| p.pid().as_u32() != own_pid)
        .filter_map(|p| {
            let command = p.cmd().join(" ");
            let hit = if command.is_empty() {
                p.name().contains(pattern)
            } else {
                command.contains(pattern)
            };
            hit.then(|| ProcessMatch {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                command,
            })
        })
        .collect();
    matches.sort_by_key(|m| m.pid);
    matches
}

fn kill(system: &Mutex<System>, pid: u32) -> bool {
    let mut sys = system.lock();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        Some(process) => {
            info!(pid, name = process.name(), "terminating process");
            process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill())
        }
        None => false,
    }
}

#[async_trait]
impl ProcessTable for SysinfoTable {
    async fn find(&self, pattern: &str) -> Vec<ProcessMatch> {
        let system = Arc::clone(&self.system);
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || scan(&system, &pattern))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "process scan aborted");
                Vec::new()
            })
    }

    async fn terminate(&self, pid: u32) -> bool {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || kill(&system, pid))
            .await
            .unwrap_or_else(|e| {
                warn!(pid, error = %e, "terminate aborted");
                false
            })
    }

    async fn spawn_detached(&self, req: &SpawnRequest) -> Result<u32, ProcessError> {
        let words = shell_words::split(&req.command).map_err(|e| ProcessError::InvalidCommand {
            command: req.command.clone(),
            message: e.to_string(),
        })?;
        let (program, args) = words.split_first().ok_or(ProcessError::EmptyCommand)?;

        if let Some(dir) = req.log_file.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ProcessError::LogFile {
                path: req.log_file.clone(),
                source,
            })?;
        }
        let open_log = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&req.log_file)
                .map_err(|source| ProcessError::LogFile {
                    path: req.log_file.clone(),
                    source,
                })
        };
        let stdout = open_log()?;
        let stderr = open_log()?;

        let mut command = AsyncCommand::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &req.cwd {
            command.current_dir(cwd);
        }
        if let Some(port) = req.port {
            command.env("PORT", port.to_string());
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: req.command.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(id = %req.id, pid, log = %req.log_file.display(), "spawned background process");
        // dropping the handle leaves the child running; tokio reaps it on exit
        drop(child);
        Ok(pid)
    }

    async fn port_open(&self, port: u16) -> bool {
        match tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(port, error = %e, "port closed");
                false
            }
            Err(_) => {
                warn!(port, "port probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashSet;

    /// In-memory process list. Spawned commands appear immediately; terminated
    /// ones disappear unless marked stubborn.
    #[derive(Default)]
    pub struct FakeProcessTable {
        processes: Mutex<Vec<ProcessMatch>>,
        open_ports: Mutex<HashSet<u16>>,
        stubborn: Mutex<HashSet<u32>>,
        spawned: Mutex<Vec<SpawnRequest>>,
        next_pid: Mutex<u32>,
    }

    impl FakeProcessTable {
        pub fn new() -> Self {
            Self {
                next_pid: Mutex::new(1000),
                ..Self::default()
            }
        }

        pub fn add(&self, command: &str) -> u32 {
            let mut next = self.next_pid.lock();
            *next += 1;
            let pid = *next;
            self.processes.lock().push(ProcessMatch {
                pid,
                name: command.split(' ').next().unwrap_or_default().to_string(),
                command: command.to_string(),
            });
            pid
        }

        pub fn open_port(&self, port: u16) {
            self.open_ports.lock().insert(port);
        }

        pub fn make_stubborn(&self, pid: u32) {
            self.stubborn.lock().insert(pid);
        }

        pub fn spawned(&self) -> Vec<SpawnRequest> {
            self.spawned.lock().clone()
        }

        pub fn running(&self) -> Vec<ProcessMatch> {
            self.processes.lock().clone()
        }
    }

    #[async_trait]
    impl ProcessTable for FakeProcessTable {
        async fn find(&self, pattern: &str) -> Vec<ProcessMatch> {
            self.processes
                .lock()
                .iter()
                .filter(|p| p.command.contains(pattern))
                .cloned()
                .collect()
        }

        async fn terminate(&self, pid: u32) -> bool {
            if self.stubborn.lock().contains(&pid) {
                return true;
            }
            let mut processes = self.processes.lock();
            let before = processes.len();
            processes.retain(|p| p.pid != pid);
            processes.len() != before
        }

        async fn spawn_detached(&self, req: &SpawnRequest) -> Result<u32, ProcessError> {
            if req.command.trim().is_empty() {
                return Err(ProcessError::EmptyCommand);
            }
            self.spawned.lock().push(req.clone());
            Ok(self.add(&req.command))
        }

        async fn port_open(&self, port: u16) -> bool {
            self.open_ports.lock().contains(&port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProcessTable;
    use super::*;

    #[tokio::test]
    async fn spawned_process_logs_to_file_with_port() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("logs").join("echo.log");
        let table = SysinfoTable::new();

        let pid = table
            .spawn_detached(&SpawnRequest {
                id: "echo".into(),
                command: "sh -c 'echo listening on $PORT'".into(),
                cwd: Some(dir.path().to_path_buf()),
                port: Some(4321),
                log_file: log_file.clone(),
            })
            .await
            .unwrap();
        assert!(pid > 0);

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&log_file).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(contents.trim(), "listening on 4321");
    }

    #[tokio::test]
    async fn finds_and_terminates_by_command_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let table = SysinfoTable::new();
        let pid = table
            .spawn_detached(&SpawnRequest {
                id: "sleeper".into(),
                command: "sh -c 'sleep 30; echo fleetdeck-sleeper-marker'".into(),
                cwd: None,
                port: None,
                log_file: dir.path().join("sleeper.log"),
            })
            .await
            .unwrap();

        let mut found = Vec::new();
        for _ in 0..50 {
            found = table.find("fleetdeck-sleeper-marker").await;
            if !found.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(found.iter().any(|m| m.pid == pid));
        assert!(table.terminate(pid).await);
    }

    #[tokio::test]
    async fn unbalanced_quotes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SysinfoTable::new()
            .spawn_detached(&SpawnRequest {
                id: "bad".into(),
                command: "npm run 'dev".into(),
                cwd: None,
                port: None,
                log_file: dir.path().join("bad.log"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn port_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SysinfoTable::new().port_open(port).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_exit_is_bounded() {
        let table = FakeProcessTable::new();
        let pid = table.add("node server.js");
        table.make_stubborn(pid);
        assert!(!wait_for_exit(&table, "server.js", Duration::from_secs(3)).await);

        table.terminate(pid).await;
        let gone = FakeProcessTable::new();
        assert!(wait_for_exit(&gone, "server.js", Duration::from_secs(3)).await);
    }
}
