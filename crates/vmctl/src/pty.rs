//! PTY-backed local VM runtime.
//!
//! Each local VM is an interpreter process on its own pseudo-terminal. A
//! reader thread copies PTY output into a bounded buffer, which the
//! interactive loop drains through [`RuntimeChannel::read_available`].

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use vmcore::{LocalLauncher, RuntimeChannel, RuntimeError, RuntimeHandle};

use crate::config::RuntimeConfig;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Unread output chunks kept per VM; the oldest are dropped beyond this.
const OUTPUT_CAPACITY: usize = 256;

/// Time a worker gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs the interpreter with terminal echo off: `$0` is the interpreter,
/// `$@` its arguments.
const ECHO_OFF_WRAPPER: &str = r#"stty -echo 2>/dev/null; exec "$0" "$@""#;

const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 40;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    dropped: usize,
}

impl OutputBuffer {
    fn push(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() == OUTPUT_CAPACITY {
            self.chunks.pop_front();
            self.dropped += 1;
        }
        self.chunks.push_back(chunk);
    }

    fn drain(&mut self) -> Vec<u8> {
        self.chunks.drain(..).flatten().collect()
    }
}

/// Converts PTY line endings (`\r\n`) to `\n`.
fn normalize_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().peekable();
    while let Some(&byte) = bytes.next() {
        if byte == b'\r' && bytes.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}

/// An interpreter process on a pseudo-terminal.
pub struct PtyRuntime {
    vm_id: String,

    /// Keeps the PTY open for the lifetime of the runtime.
    _master: Mutex<Box<dyn MasterPty + Send>>,

    writer: Mutex<Box<dyn Write + Send>>,

    child: Box<dyn Child + Send + Sync>,

    output: Arc<Mutex<OutputBuffer>>,

    exited: bool,
    exit_code: Option<i32>,
    pid: Option<u32>,
}

impl PtyRuntime {
    /// Spawns `command` on a new PTY and starts its reader thread.
    pub fn spawn(vm_id: &str, command: CommandBuilder, size: PtySize) -> Result<Self, RuntimeError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size)
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        // Only the child holds the slave side, so its exit closes the PTY.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        let output = Arc::new(Mutex::new(OutputBuffer::default()));
        start_read_loop(vm_id, reader, Arc::clone(&output))?;

        tracing::info!(vm_id = %vm_id, pid = ?pid, "Spawned VM worker");

        Ok(Self {
            vm_id: vm_id.to_string(),
            _master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child,
            output,
            exited: false,
            exit_code: None,
            pid,
        })
    }

    /// Returns the process ID of the worker, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of output chunks dropped because nobody drained them.
    pub fn dropped_chunks(&self) -> usize {
        lock(&self.output).dropped
    }

    fn refresh(&mut self) {
        if self.exited {
            return;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                self.exit_code = Some(status.exit_code() as i32);
                tracing::info!(vm_id = %self.vm_id, exit_code = ?self.exit_code, "VM worker exited");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(vm_id = %self.vm_id, error = %e, "Failed to poll VM worker");
            }
        }
    }
}

impl RuntimeChannel for PtyRuntime {
    fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        self.refresh();
        if self.exited {
            return Err(RuntimeError::Exited);
        }

        let writer = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(data)
            .map_err(|e| RuntimeError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| RuntimeError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, RuntimeError> {
        let data = lock(&self.output).drain();
        Ok(normalize_newlines(&data))
    }

    fn is_alive(&mut self) -> bool {
        self.refresh();
        !self.exited
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.refresh();
        self.exit_code
    }

    fn terminate(&mut self) -> Result<Option<i32>, RuntimeError> {
        self.refresh();
        if self.exited {
            return Ok(self.exit_code);
        }

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(vm_id = %self.vm_id, pid = pid, error = %e, "SIGTERM failed");
            }

            let deadline = Instant::now() + TERMINATE_GRACE;
            while Instant::now() < deadline {
                self.refresh();
                if self.exited {
                    return Ok(self.exit_code);
                }
                std::thread::sleep(EXIT_POLL_INTERVAL);
            }
        }

        self.child
            .kill()
            .map_err(|e| RuntimeError::KillFailed(e.to_string()))?;
        let status = self
            .child
            .wait()
            .map_err(|e| RuntimeError::KillFailed(e.to_string()))?;

        self.exited = true;
        self.exit_code = Some(status.exit_code() as i32);
        tracing::info!(vm_id = %self.vm_id, exit_code = ?self.exit_code, "VM worker killed");
        Ok(self.exit_code)
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {pid}"),
            None => "pty".to_string(),
        }
    }
}

impl Drop for PtyRuntime {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Copies PTY output into `output` until EOF.
fn start_read_loop(
    vm_id: &str,
    mut reader: Box<dyn Read + Send>,
    output: Arc<Mutex<OutputBuffer>>,
) -> Result<(), RuntimeError> {
    let vm_id = vm_id.to_string();

    std::thread::Builder::new()
        .name(format!("pty-reader-{vm_id}"))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(vm_id = %vm_id, "PTY EOF");
                        break;
                    }
                    Ok(n) => lock(&output).push(buffer[..n].to_vec()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the child side is closed.
                        tracing::debug!(vm_id = %vm_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(RuntimeError::Io)
}

/// Launches local VMs as interpreter processes on PTYs.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    interpreter: String,
    args: Vec<String>,
    disable_echo: bool,
    size: PtySize,
}

impl PtyLauncher {
    pub fn new(interpreter: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args,
            disable_echo: false,
            size: PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.interpreter.clone(), config.args.clone())
            .with_echo_disabled(config.disable_echo)
    }

    pub fn with_echo_disabled(mut self, disable_echo: bool) -> Self {
        self.disable_echo = disable_echo;
        self
    }

    fn resolve_interpreter(&self) -> Result<PathBuf, RuntimeError> {
        which::which(&self.interpreter).map_err(|e| {
            RuntimeError::SpawnFailed(format!("interpreter '{}' not found: {e}", self.interpreter))
        })
    }

    fn command(&self, vm_id: &str) -> Result<CommandBuilder, RuntimeError> {
        let program = self.resolve_interpreter()?;

        let mut cmd = if self.disable_echo {
            let mut cmd = CommandBuilder::new("/bin/sh");
            cmd.arg("-c");
            cmd.arg(ECHO_OFF_WRAPPER);
            cmd.arg(&program);
            cmd
        } else {
            CommandBuilder::new(&program)
        };
        cmd.args(&self.args);

        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("VMCTL_VM_ID", vm_id);

        Ok(cmd)
    }
}

impl LocalLauncher for PtyLauncher {
    fn launch(&self, vm_id: &str) -> Result<RuntimeHandle, RuntimeError> {
        let command = self.command(vm_id)?;
        let runtime = PtyRuntime::spawn(vm_id, command, self.size)?;
        Ok(Box::new(runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh(vm_id: &str) -> PtyRuntime {
        let launcher = PtyLauncher::new("/bin/sh", vec![]).with_echo_disabled(true);
        let command = launcher.command(vm_id).unwrap();
        PtyRuntime::spawn(vm_id, command, launcher.size).unwrap()
    }

    /// Polls until the accumulated output contains `needle`.
    fn read_until(runtime: &mut PtyRuntime, needle: &str) -> String {
        let mut seen = String::new();
        for _ in 0..100 {
            seen.push_str(&String::from_utf8_lossy(&runtime.read_available().unwrap()));
            if seen.contains(needle) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        seen
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines(b"a\r\nb\r\n"), b"a\nb\n");
        assert_eq!(normalize_newlines(b"a\rb"), b"a\rb");
        assert_eq!(normalize_newlines(b"\r"), b"\r");
        assert!(normalize_newlines(b"").is_empty());
    }

    #[test]
    fn test_output_buffer_drops_oldest() {
        let mut buffer = OutputBuffer::default();
        for i in 0..OUTPUT_CAPACITY + 2 {
            buffer.push(vec![(i % 256) as u8]);
        }

        assert_eq!(buffer.dropped, 2);
        let data = buffer.drain();
        assert_eq!(data.len(), OUTPUT_CAPACITY);
        assert_eq!(data[0], 2);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_missing_interpreter() {
        let launcher = PtyLauncher::new("surely-not-an-interpreter-on-path", vec![]);
        let err = launcher.launch("vmA").err().unwrap();
        assert!(matches!(err, RuntimeError::SpawnFailed(_)));
    }

    #[test]
    fn test_command_wraps_for_echo_off() {
        let launcher = PtyLauncher::new("/bin/sh", vec!["-i".to_string()]).with_echo_disabled(true);
        let command = launcher.command("vmA").unwrap();
        let argv: Vec<String> = command
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(argv[0], "/bin/sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], ECHO_OFF_WRAPPER);
        assert!(argv[3].ends_with("sh"));
        assert_eq!(argv[4], "-i");
    }

    #[test]
    fn test_spawn_write_and_read() {
        let mut runtime = spawn_sh("vmA");
        assert!(runtime.is_alive());
        assert!(runtime.pid().is_some());
        assert!(runtime.describe().starts_with("pid "));
        assert_eq!(runtime.dropped_chunks(), 0);

        runtime.write(b"echo vm_output_marker\n").unwrap();
        let output = read_until(&mut runtime, "vm_output_marker");
        assert!(output.contains("vm_output_marker"), "output was {output:?}");
        assert!(!output.contains("\r\n"));

        runtime.terminate().unwrap();
        assert!(!runtime.is_alive());
    }

    #[test]
    fn test_process_exit_is_observed() {
        let mut runtime = spawn_sh("vmA");
        runtime.write(b"exit 42\n").unwrap();

        let mut alive = true;
        for _ in 0..100 {
            if !runtime.is_alive() {
                alive = false;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(!alive, "worker did not exit");
        assert_eq!(runtime.exit_code(), Some(42));
        assert!(matches!(runtime.write(b"echo\n"), Err(RuntimeError::Exited)));
        // Terminating an exited worker just reports its code.
        assert_eq!(runtime.terminate().unwrap(), Some(42));
    }

    #[test]
    fn test_terminate_running_worker() {
        let mut runtime = spawn_sh("vmA");
        runtime.terminate().unwrap();

        assert!(!runtime.is_alive());
        assert!(runtime.exit_code().is_some());
        assert!(runtime.write(b"echo\n").is_err());
    }

    #[test]
    fn test_env_carries_vm_id() {
        let mut runtime = spawn_sh("vm-env");
        runtime.write(b"echo id=$VMCTL_VM_ID\n").unwrap();

        let output = read_until(&mut runtime, "id=vm-env");
        assert!(output.contains("id=vm-env"), "output was {output:?}");
        runtime.terminate().unwrap();
    }
}
