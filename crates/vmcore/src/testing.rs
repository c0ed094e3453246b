//! Scripted doubles for the runtime, launcher, provisioner and console seams.
//!
//! Available to this crate's tests and, behind the `test-util` feature, to
//! downstream crates.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ProvisionError, RuntimeError};
use crate::interactive::{Console, ConsoleInput};
use crate::provision::{Credentials, RemoteProvisioning, RemoteVmRef, SessionToken, VmParams};
use crate::runtime::{LocalLauncher, RuntimeChannel, RuntimeHandle};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct ScriptState {
    written: Vec<u8>,
    output: Vec<u8>,
    exited: bool,
    exit_code: Option<i32>,
    terminated: bool,
    fail_writes: bool,
    exit_on_write: Option<Option<i32>>,
    responder: Option<Responder>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory runtime channel driven by a [`ScriptProbe`].
pub struct ScriptedRuntime {
    state: Arc<Mutex<ScriptState>>,
}

/// Test-side handle onto a [`ScriptedRuntime`].
#[derive(Clone)]
pub struct ScriptProbe {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRuntime {
    pub fn new() -> (Self, ScriptProbe) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ScriptProbe { state },
        )
    }

    /// A runtime that answers every write with `respond(input)`.
    pub fn with_responder(
        respond: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> (Self, ScriptProbe) {
        let (runtime, probe) = Self::new();
        lock(&runtime.state).responder = Some(Box::new(respond));
        (runtime, probe)
    }

    /// A runtime that echoes each line back as `=> line`.
    pub fn echo() -> (Self, ScriptProbe) {
        Self::with_responder(|input| {
            let line = String::from_utf8_lossy(input);
            format!("=> {}\n", line.trim_end()).into_bytes()
        })
    }
}

impl RuntimeChannel for ScriptedRuntime {
    fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state);
        if state.exited || state.terminated {
            return Err(RuntimeError::Exited);
        }
        if state.fail_writes {
            return Err(RuntimeError::WriteFailed("scripted write failure".into()));
        }

        state.written.extend_from_slice(data);
        if let Some(exit_code) = state.exit_on_write.take() {
            state.exited = true;
            state.exit_code = exit_code;
            return Ok(());
        }
        let reply = state.responder.as_mut().map(|respond| respond(data));
        if let Some(reply) = reply {
            state.output.extend_from_slice(&reply);
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, RuntimeError> {
        Ok(std::mem::take(&mut lock(&self.state).output))
    }

    fn is_alive(&mut self) -> bool {
        let state = lock(&self.state);
        !state.exited && !state.terminated
    }

    fn exit_code(&mut self) -> Option<i32> {
        lock(&self.state).exit_code
    }

    fn terminate(&mut self) -> Result<Option<i32>, RuntimeError> {
        let mut state = lock(&self.state);
        state.terminated = true;
        Ok(state.exit_code)
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

impl ScriptProbe {
    /// Everything written to the runtime so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Makes `text` available to the next read.
    pub fn push_output(&self, text: &str) {
        lock(&self.state).output.extend_from_slice(text.as_bytes());
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, exit_code: Option<i32>) {
        let mut state = lock(&self.state);
        state.exited = true;
        state.exit_code = exit_code;
    }

    /// Makes the process exit with `exit_code` as soon as the next write
    /// lands, before it produces any reply.
    pub fn exit_on_write(&self, exit_code: Option<i32>) {
        lock(&self.state).exit_on_write = Some(exit_code);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Whether the owner called `terminate`.
    pub fn is_terminated(&self) -> bool {
        lock(&self.state).terminated
    }
}

/// Launcher handing out [`ScriptedRuntime::echo`] channels.
#[derive(Default)]
pub struct ScriptedLauncher {
    launched: Mutex<Vec<(String, ScriptProbe)>>,
    fail: bool,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        Self {
            launched: Mutex::default(),
            fail: true,
        }
    }

    /// Ids launched so far, in order.
    pub fn launched(&self) -> Vec<String> {
        lock(&self.launched).iter().map(|(id, _)| id.clone()).collect()
    }

    /// Probe of the most recent runtime launched for `vm_id`.
    pub fn probe(&self, vm_id: &str) -> Option<ScriptProbe> {
        lock(&self.launched)
            .iter()
            .rev()
            .find(|(id, _)| id == vm_id)
            .map(|(_, probe)| probe.clone())
    }
}

impl LocalLauncher for ScriptedLauncher {
    fn launch(&self, vm_id: &str) -> Result<RuntimeHandle, RuntimeError> {
        if self.fail {
            return Err(RuntimeError::SpawnFailed("scripted launch failure".into()));
        }
        let (runtime, probe) = ScriptedRuntime::echo();
        lock(&self.launched).push((vm_id.to_string(), probe));
        Ok(Box::new(runtime))
    }
}

/// Remote provisioner that records the collaborator calls it receives.
#[derive(Default)]
pub struct ScriptedProvisioner {
    calls: Mutex<Vec<&'static str>>,
    reject_login: bool,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_login() -> Self {
        Self {
            calls: Mutex::default(),
            reject_login: true,
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }
}

impl RemoteProvisioning for ScriptedProvisioner {
    async fn login(
        &self,
        host: &str,
        _credentials: &Credentials,
    ) -> Result<SessionToken, ProvisionError> {
        lock(&self.calls).push("login");
        if self.reject_login {
            return Err(ProvisionError::Auth {
                host: host.to_string(),
                message: "invalid credentials".into(),
            });
        }
        Ok(SessionToken(format!("token-{host}")))
    }

    async fn create_vm(
        &self,
        _token: &SessionToken,
        template: &str,
        params: &VmParams,
    ) -> Result<RemoteVmRef, ProvisionError> {
        lock(&self.calls).push("create_vm");
        Ok(RemoteVmRef(format!("{template}/{}", params.name)))
    }

    async fn open_command_channel(
        &self,
        _token: &SessionToken,
        _vm: &RemoteVmRef,
    ) -> Result<RuntimeHandle, ProvisionError> {
        lock(&self.calls).push("open_command_channel");
        let (runtime, _probe) = ScriptedRuntime::echo();
        Ok(Box::new(runtime))
    }
}

/// Console fed from a fixed script of inputs.
///
/// Once the script runs out every read returns [`ConsoleInput::Eof`].
#[derive(Default)]
pub struct ScriptedConsole {
    inputs: VecDeque<io::Result<ConsoleInput>>,
    /// Rendered VM output, one entry per render call.
    pub rendered: Vec<String>,
    /// Notices shown to the operator.
    pub notices: Vec<String>,
    /// Prompts passed to each read.
    pub prompts: Vec<String>,
}

impl ScriptedConsole {
    /// A console that types each of `lines` in order.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut console = Self::default();
        for line in lines {
            console.push_line(line);
        }
        console
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.inputs.push_back(Ok(ConsoleInput::Line(line.into())));
    }

    pub fn push_interrupt(&mut self) {
        self.inputs.push_back(Ok(ConsoleInput::Interrupted));
    }

    pub fn push_error(&mut self, message: &str) {
        self.inputs
            .push_back(Err(io::Error::other(message.to_string())));
    }

    /// All rendered output joined with newlines.
    pub fn output(&self) -> String {
        self.rendered.join("\n")
    }
}

impl Console for ScriptedConsole {
    async fn read_line(&mut self, prompt: &str) -> io::Result<ConsoleInput> {
        self.prompts.push(prompt.to_string());
        self.inputs.pop_front().unwrap_or(Ok(ConsoleInput::Eof))
    }

    fn render(&mut self, text: &str) {
        self.rendered.push(text.to_string());
    }

    fn notice(&mut self, text: &str) {
        self.notices.push(text.to_string());
    }
}
