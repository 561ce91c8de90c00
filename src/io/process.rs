//! Child process lifecycle
//!
//! Spawns language server processes with piped stdio, drains their stderr
//! into the log, tracks exit, and stops them gracefully (SIGTERM) or
//! forcefully (SIGKILL). Transport concerns live in the transport module;
//! this one only hands out the stdio pair wrapped as a `StreamTransport`.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::io::transport::StreamTransport;

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask nicely first (SIGTERM); the caller escalates if needed
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has been stopped or has exited
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdio pipe not available")]
    StdioNotAvailable,
}

/// Manages one child process spawned via `Command`
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Extra environment variables for the child
    env: HashMap<String, String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when the process starts, taken once)
    stdio_transport: Option<StreamTransport>,

    /// Stderr drain task handle
    stderr_task: Option<JoinHandle<()>>,

    /// Wait task handle (observes child exit)
    wait_task: Option<JoinHandle<()>>,
}

impl ChildProcessManager {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            working_directory: working_dir,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_task: None,
            wait_task: None,
        }
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    /// Start the process with piped stdio
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn()?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        match pid {
            Some(pid) => {
                // Intentional .unwrap() - poisoned mutex indicates serious bug
                *self.state.lock().unwrap() = ProcessState::Running { pid };
            }
            None => {
                return Err(ProcessError::Io(io::Error::other(
                    "Failed to get process ID",
                )));
            }
        }

        // Extract stdio streams before the child moves into the wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdioNotAvailable)?;
        let stdout = child.stdout.take().ok_or(ProcessError::StdioNotAvailable)?;
        let stderr = child.stderr.take().ok_or(ProcessError::StdioNotAvailable)?;

        self.stdio_transport = Some(StreamTransport::from_child_stdio(stdin, stdout));

        // Always drain stderr so the child never blocks on a full pipe
        self.stderr_task = Some(Self::spawn_stderr_drain(self.command.clone(), stderr));
        self.wait_task = Some(self.spawn_wait_task(child));

        Ok(())
    }

    /// Drain stderr lines into the log, tagged with the command name
    fn spawn_stderr_drain(
        command: String,
        stderr: tokio::process::ChildStderr,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF for {command}");
                        break;
                    }
                    Ok(_) => {
                        let content = line.trim_end();
                        if !content.is_empty() {
                            debug!(server = %command, "stderr: {content}");
                        }
                    }
                    Err(e) => {
                        error!("Failed to read stderr of {command}: {e}");
                        break;
                    }
                }
            }
        })
    }

    /// Observe child exit and flip the state to Stopped
    fn spawn_wait_task(&self, mut child: Child) -> JoinHandle<()> {
        let pid = self.get_state().pid();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            match child.wait().await {
                Ok(exit_status) => {
                    info!("Process PID {:?} exited with status: {}", pid, exit_status);
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                }
            }

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }
        })
    }

    /// Stop the process.
    ///
    /// Graceful mode sends SIGTERM and returns; the wait task observes the
    /// actual exit. Callers escalate with `StopMode::Force` if the process
    /// lingers.
    pub async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        // Close stdio first; for well-behaved servers stdin EOF alone ends them
        if let Some(mut transport) = self.stdio_transport.take() {
            use crate::io::transport::Transport as _;
            let _ = transport.close().await;
        }

        #[cfg(unix)]
        {
            unsafe {
                match mode {
                    StopMode::Graceful => {
                        if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                            info!("Sent SIGTERM to process {}", pid);
                        }
                    }
                    StopMode::Force => {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        info!("Sent SIGKILL to process {}", pid);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("Non-Unix process termination not fully implemented");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // The wait task also updates state when it observes the real exit
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        *self.state.lock().unwrap() = ProcessState::Stopped;

        Ok(())
    }

    /// Stop gracefully, escalating to SIGKILL if the process outlives the
    /// grace period. Unlike `stop`, this observes the real exit via the
    /// wait task before deciding to escalate.
    pub async fn stop_graceful(&mut self, grace: std::time::Duration) -> Result<(), ProcessError> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        info!("Gracefully stopping process {pid} (grace period {grace:?})");

        if let Some(mut transport) = self.stdio_transport.take() {
            use crate::io::transport::Transport as _;
            let _ = transport.close().await;
        }

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        let exited = match self.wait_task.take() {
            Some(task) => tokio::time::timeout(grace, task).await.is_ok(),
            None => true,
        };

        if !exited {
            info!("Process {pid} did not exit within grace period, sending SIGKILL");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug
        *self.state.lock().unwrap() = ProcessState::Stopped;

        Ok(())
    }

    /// Take the stdio transport. Available once per start.
    pub fn take_transport(&mut self) -> Result<StreamTransport, ProcessError> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    /// Synchronous force kill for Drop paths. Skips async transport
    /// cleanup and kills the process directly.
    pub fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return,
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            tracing::warn!("Non-Unix sync process kill not implemented - process may remain");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(command: &str, args: &[&str]) -> ChildProcessManager {
        ChildProcessManager::new(
            command.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut manager = manager("echo", &["hello"]);

        assert!(!manager.is_running());

        manager.start().await.unwrap();
        assert!(manager.is_running());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mut manager = manager("echo", &["hello"]);

        assert_eq!(manager.get_state(), ProcessState::NotStarted);

        manager.start().await.unwrap();
        assert!(matches!(manager.get_state(), ProcessState::Running { .. }));

        manager.stop(StopMode::Force).await.unwrap();
        assert_eq!(manager.get_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_env_is_passed_to_child() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), "printf '%s' \"$MARKER\"".to_string()],
            HashMap::from([("MARKER".to_string(), "from-env".to_string())]),
            None,
        );

        manager.start().await.unwrap();
        let mut transport = manager.take_transport().unwrap();

        use crate::io::transport::Transport as _;
        let output = transport.receive().await.unwrap();
        assert_eq!(output, "from-env");
    }

    #[tokio::test]
    async fn test_stop_graceful_escalates_to_kill() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
            HashMap::new(),
            None,
        );

        manager.start().await.unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        manager
            .stop_graceful(std::time::Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager = manager("echo", &["hello"]);

        assert!(matches!(
            manager.stop(StopMode::Graceful).await,
            Err(ProcessError::NotStarted)
        ));

        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(ProcessError::AlreadyStarted)
        ));

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(matches!(
            manager.stop(StopMode::Graceful).await,
            Err(ProcessError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_transport_is_taken_once() {
        let mut manager = manager("echo", &["hello"]);

        assert!(matches!(
            manager.take_transport(),
            Err(ProcessError::NotStarted)
        ));

        manager.start().await.unwrap();
        let _transport = manager.take_transport().unwrap();
        assert!(matches!(
            manager.take_transport(),
            Err(ProcessError::NotStarted)
        ));
    }

    #[test]
    fn test_process_state_accessors() {
        assert!(!ProcessState::NotStarted.is_running());
        assert!(ProcessState::NotStarted.pid().is_none());

        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        assert!(!ProcessState::Stopped.is_running());
    }
}
