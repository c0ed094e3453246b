//! Error types for VM lifecycle operations.
//!
//! Every variant names the VM it concerns so the console can report which
//! precondition was violated for which VM.

use thiserror::Error;

use crate::registry::VmId;
use crate::state::{TransitionError, VmState};

/// Errors raised by a VM runtime channel (local process or remote command
/// channel).
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Input could not be written to the worker.
    #[error("failed to write to worker: {0}")]
    WriteFailed(String),

    /// The worker could not be terminated.
    #[error("failed to terminate worker: {0}")]
    KillFailed(String),

    /// The worker process has exited.
    #[error("worker process has exited")]
    Exited,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a provisioning strategy.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The virtualization host rejected the credentials.
    #[error("authentication to {host} failed: {message}")]
    Auth { host: String, message: String },

    /// The virtualization host could not provision the VM.
    #[error("provisioning failed: {message}")]
    Provisioning { message: String },

    /// The local worker could not be launched.
    #[error(transparent)]
    Launch(#[from] RuntimeError),
}

/// Errors returned by registry, controller and state machine operations.
#[derive(Error, Debug)]
pub enum VmError {
    /// The identifier is empty, too long, or contains illegal characters.
    #[error("invalid VM id {0:?}: use 1-64 characters from [A-Za-z0-9_.-]")]
    InvalidId(String),

    /// The creation request is inconsistent (e.g. a remote VM without host config).
    #[error("invalid request for VM '{id}': {message}")]
    InvalidSpec { id: VmId, message: String },

    /// A VM with this id already exists (live or tombstoned).
    #[error("VM '{0}' already exists")]
    DuplicateId(VmId),

    /// No VM with this id is known.
    #[error("no such VM: '{0}'")]
    NotFound(VmId),

    /// The VM is not in a live state.
    #[error("VM '{id}' is not running (state: {state})")]
    NotRunning { id: VmId, state: VmState },

    /// The VM already owns the console.
    #[error("VM '{0}' is already attached")]
    AlreadyAttached(VmId),

    /// The console is bound to another VM.
    #[error("cannot attach VM '{id}': console is already bound to VM '{owner}'")]
    AlreadyBoundElsewhere { id: VmId, owner: VmId },

    /// Detach was requested but the VM does not own the console.
    #[error("VM '{0}' is not attached")]
    NotAttached(VmId),

    /// Detach was requested while no VM owns the console.
    #[error("no VM is attached")]
    NothingAttached,

    /// The live VM limit has been reached.
    #[error("cannot create VM '{id}': limit of {limit} live VMs reached")]
    LimitReached { id: VmId, limit: usize },

    /// The worker process died underneath an attached session.
    #[error("VM '{id}' process died{}", exit_code_suffix(.exit_code))]
    ProcessDied { id: VmId, exit_code: Option<i32> },

    /// Provisioning the VM failed.
    #[error("failed to provision VM '{id}': {source}")]
    Provisioning {
        id: VmId,
        #[source]
        source: ProvisionError,
    },

    /// Runtime I/O with the VM failed.
    #[error("VM '{id}': {source}")]
    Runtime {
        id: VmId,
        #[source]
        source: RuntimeError,
    },
}

impl VmError {
    /// Maps a rejected state-machine transition onto the public taxonomy.
    pub fn from_transition(id: &str, state: VmState, err: TransitionError) -> Self {
        match err {
            TransitionError::AlreadyAttached => VmError::AlreadyAttached(id.to_string()),
            TransitionError::NotAttached => VmError::NotAttached(id.to_string()),
            TransitionError::NotRunning => VmError::NotRunning {
                id: id.to_string(),
                state,
            },
        }
    }

    /// Returns the id of the VM the error concerns, if any.
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            VmError::InvalidId(id)
            | VmError::DuplicateId(id)
            | VmError::NotFound(id)
            | VmError::AlreadyAttached(id)
            | VmError::NotAttached(id) => Some(id),
            VmError::InvalidSpec { id, .. }
            | VmError::NotRunning { id, .. }
            | VmError::AlreadyBoundElsewhere { id, .. }
            | VmError::LimitReached { id, .. }
            | VmError::ProcessDied { id, .. }
            | VmError::Provisioning { id, .. }
            | VmError::Runtime { id, .. } => Some(id),
            VmError::NothingAttached => None,
        }
    }
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}
