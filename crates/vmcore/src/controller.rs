//! Attach/detach controller.
//!
//! The controller owns the process-wide console: at most one VM is bound to
//! it at any instant. Binding is a scoped resource. [`AttachController::attach`]
//! returns a [`ControllerSession`] guard and the binding is released when the
//! guard is detached or dropped, whichever happens first.
//!
//! Lock order: the console mutex is always taken before any registry record
//! lock, and neither is held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{RuntimeError, VmError};
use crate::registry::{release_runtime, SessionRegistry, VmId, VmSnapshot};
use crate::runtime::RuntimeChannel;
use crate::state::{StopReason, Transition, VmState};

/// Channel capacity for controller events.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle events emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Attached { id: VmId },
    Detached { id: VmId },
    Stopped { id: VmId },
    Crashed { id: VmId, exit_code: Option<i32> },
}

/// Liveness of the process behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive,
    Exited { exit_code: Option<i32> },
}

#[derive(Debug, Clone)]
struct Binding {
    id: VmId,
    generation: u64,
}

#[derive(Debug, Default)]
struct ConsoleState {
    binding: Option<Binding>,
    next_generation: u64,
}

/// Guarantees the single-console invariant and performs console handoff.
pub struct AttachController {
    registry: Arc<SessionRegistry>,
    console: Mutex<ConsoleState>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl AttachController {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            console: Mutex::new(ConsoleState::default()),
            event_tx,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    /// Id of the VM that currently owns the console.
    pub fn console_owner(&self) -> Option<VmId> {
        self.lock_console().binding.as_ref().map(|b| b.id.clone())
    }

    fn lock_console(&self) -> MutexGuard<'_, ConsoleState> {
        self.console.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Binds the console to `id`.
    ///
    /// Fails with `NotFound`, `NotRunning`, `AlreadyAttached` or
    /// `AlreadyBoundElsewhere`, in that order of precedence. A failed attach
    /// changes nothing, except that a VM whose process is found dead is
    /// retired as crashed and reported `NotRunning`.
    pub fn attach(&self, id: &str) -> Result<ControllerSession<'_>, VmError> {
        let mut console = self.lock_console();

        let snapshot = self.registry.get(id)?;
        if !snapshot.state.is_live() {
            return Err(VmError::NotRunning {
                id: id.to_string(),
                state: snapshot.state,
            });
        }

        // A worker that died since the last health check is retired here.
        let exited = self.registry.with_runtime(id, |runtime| {
            if runtime.is_alive() {
                None
            } else {
                Some(runtime.exit_code())
            }
        })?;
        if let Some(exit_code) = exited {
            drop(console);
            if let Err(err) = self.handle_process_exit(id, exit_code) {
                tracing::debug!(vm_id = %id, error = %err, "VM retired concurrently");
            }
            return Err(VmError::NotRunning {
                id: id.to_string(),
                state: VmState::Stopped,
            });
        }

        if let Some(binding) = &console.binding {
            return Err(if binding.id == id {
                VmError::AlreadyAttached(id.to_string())
            } else {
                VmError::AlreadyBoundElsewhere {
                    id: id.to_string(),
                    owner: binding.id.clone(),
                }
            });
        }

        self.registry.transition(id, Transition::Attach)?;

        console.next_generation += 1;
        let generation = console.next_generation;
        console.binding = Some(Binding {
            id: id.to_string(),
            generation,
        });
        drop(console);

        tracing::info!(vm_id = %id, "Console attached");
        self.emit(ControllerEvent::Attached { id: id.to_string() });

        Ok(ControllerSession {
            controller: self,
            id: id.to_string(),
            generation,
            finished: false,
        })
    }

    /// Detaches the console from `id`.
    pub fn detach(&self, id: &str) -> Result<(), VmError> {
        let mut console = self.lock_console();
        match &console.binding {
            Some(binding) if binding.id == id => {
                self.unbind(&mut console, id);
                Ok(())
            }
            _ => {
                // Distinguish a missing VM from one that is simply not bound.
                self.registry.get(id)?;
                Err(VmError::NotAttached(id.to_string()))
            }
        }
    }

    /// Detaches whichever VM owns the console.
    pub fn detach_current(&self) -> Result<VmId, VmError> {
        let mut console = self.lock_console();
        let id = match &console.binding {
            Some(binding) => binding.id.clone(),
            None => return Err(VmError::NothingAttached),
        };
        self.unbind(&mut console, &id);
        Ok(id)
    }

    /// Releases the binding held by a session guard. A stale guard (its
    /// binding was already released or replaced) is a no-op.
    fn release(&self, id: &str, generation: u64) -> bool {
        let mut console = self.lock_console();
        match &console.binding {
            Some(binding) if binding.id == id && binding.generation == generation => {
                self.unbind(&mut console, id);
                true
            }
            _ => false,
        }
    }

    fn unbind(&self, console: &mut ConsoleState, id: &str) {
        console.binding = None;

        match self.registry.transition(id, Transition::Detach) {
            Ok(_) => {
                tracing::info!(vm_id = %id, "Console detached");
                self.emit(ControllerEvent::Detached { id: id.to_string() });
            }
            Err(VmError::NotRunning { .. }) | Err(VmError::NotFound(_)) => {
                tracing::debug!(vm_id = %id, "Console released from a VM that is no longer live");
            }
            Err(err) => {
                tracing::warn!(vm_id = %id, error = %err, "Unexpected state while detaching");
            }
        }
    }

    /// Stops `id` on operator request, force-detaching it first if bound.
    pub fn stop(&self, id: &str) -> Result<VmSnapshot, VmError> {
        let snapshot = self.retire(id, StopReason::Operator)?;
        tracing::info!(vm_id = %id, "VM stopped");
        self.emit(ControllerEvent::Stopped { id: id.to_string() });
        Ok(snapshot)
    }

    /// Handles a process that exited without operator action: the console is
    /// force-detached before the VM is reported `Stopped`.
    pub fn handle_process_exit(
        &self,
        id: &str,
        exit_code: Option<i32>,
    ) -> Result<VmSnapshot, VmError> {
        let snapshot = self.retire(id, StopReason::Crashed { exit_code })?;
        tracing::warn!(vm_id = %id, exit_code = ?exit_code, "VM process exited unexpectedly");
        self.emit(ControllerEvent::Crashed {
            id: id.to_string(),
            exit_code,
        });
        Ok(snapshot)
    }

    fn retire(&self, id: &str, reason: StopReason) -> Result<VmSnapshot, VmError> {
        let mut console = self.lock_console();
        let (snapshot, runtime) = self.registry.retire(id, reason)?;

        if console.binding.as_ref().is_some_and(|b| b.id == id) {
            console.binding = None;
            tracing::info!(vm_id = %id, "Console force-detached");
        }
        drop(console);

        if let Some(runtime) = runtime {
            release_runtime(id, runtime);
        }
        Ok(snapshot)
    }

    /// Polls every live runtime and retires those whose process has exited.
    /// Returns the ids found dead with their exit codes.
    pub fn check_health(&self) -> Vec<(VmId, Option<i32>)> {
        let mut exited = Vec::new();

        for id in self.registry.live_ids() {
            let status = self.registry.with_runtime(&id, |runtime| {
                if runtime.is_alive() {
                    None
                } else {
                    Some(runtime.exit_code())
                }
            });

            if let Ok(Some(exit_code)) = status {
                match self.handle_process_exit(&id, exit_code) {
                    Ok(_) => exited.push((id, exit_code)),
                    Err(err) => {
                        tracing::debug!(vm_id = %id, error = %err, "VM retired concurrently")
                    }
                }
            }
        }

        exited
    }

    /// Starts a background task that periodically runs [`check_health`].
    ///
    /// [`check_health`]: Self::check_health
    pub fn start_health_check_task(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let exited = controller.check_health();
                if !exited.is_empty() {
                    tracing::debug!(count = exited.len(), "Health check retired exited VMs");
                }
            }
        })
    }

    /// Releases the console and stops every live VM.
    pub fn shutdown(&self) -> usize {
        let mut console = self.lock_console();
        console.binding = None;
        drop(console);
        self.registry.shutdown()
    }
}

/// A live console binding.
///
/// Dropping the guard without calling [`detach`](Self::detach) releases the
/// binding all the same, so every exit path (error, panic, forced
/// termination) leaves the console unbound.
pub struct ControllerSession<'a> {
    controller: &'a AttachController,
    id: VmId,
    generation: u64,
    finished: bool,
}

impl ControllerSession<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Writes `data` to the VM. Fails with `ProcessDied` once the worker
    /// has exited.
    pub fn forward(&self, data: &[u8]) -> Result<(), VmError> {
        self.controller.registry.with_runtime(&self.id, |runtime| {
            runtime
                .write(data)
                .map_err(|source| self.runtime_error(runtime, source))
        })?
    }

    /// Drains output buffered by the VM since the previous poll.
    pub fn poll(&self) -> Result<Vec<u8>, VmError> {
        self.controller.registry.with_runtime(&self.id, |runtime| {
            runtime
                .read_available()
                .map_err(|source| self.runtime_error(runtime, source))
        })?
    }

    fn runtime_error(&self, runtime: &mut dyn RuntimeChannel, source: RuntimeError) -> VmError {
        match source {
            RuntimeError::Exited => VmError::ProcessDied {
                id: self.id.clone(),
                exit_code: runtime.exit_code(),
            },
            source => VmError::Runtime {
                id: self.id.clone(),
                source,
            },
        }
    }

    /// Checks whether the process behind the session is still alive.
    pub fn process_status(&self) -> ProcessStatus {
        let registry = &self.controller.registry;
        match registry.with_runtime(&self.id, |runtime| {
            if runtime.is_alive() {
                ProcessStatus::Alive
            } else {
                ProcessStatus::Exited {
                    exit_code: runtime.exit_code(),
                }
            }
        }) {
            Ok(status) => status,
            // Retired underneath us, e.g. by the health check task.
            Err(_) => {
                let exit_code = registry.get(&self.id).ok().and_then(|s| match s.stop {
                    Some(stop) => match stop.reason {
                        StopReason::Crashed { exit_code } => exit_code,
                        StopReason::Operator => None,
                    },
                    None => None,
                });
                ProcessStatus::Exited { exit_code }
            }
        }
    }

    /// Ends the session normally; the VM goes back to `Running`.
    pub fn detach(mut self) -> VmId {
        self.finished = true;
        self.controller.release(&self.id, self.generation);
        std::mem::take(&mut self.id)
    }

    /// Ends the session because the process died: force-detach, then
    /// `Stopped`.
    pub fn mark_process_died(mut self, exit_code: Option<i32>) -> Result<VmSnapshot, VmError> {
        self.finished = true;
        let result = self.controller.handle_process_exit(&self.id, exit_code);
        // Binding is gone if the exit was handled; this only matters when the
        // VM had already been retired elsewhere.
        self.controller.release(&self.id, self.generation);
        result
    }
}

impl Drop for ControllerSession<'_> {
    fn drop(&mut self) {
        if !self.finished && self.controller.release(&self.id, self.generation) {
            tracing::debug!(vm_id = %self.id, "Console binding released on drop");
        }
    }
}
