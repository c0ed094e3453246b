//! # vmcore
//!
//! Core of the VM session controller: an in-memory registry of Lua VMs,
//! the lifecycle state machine each VM follows, and the protocol that binds
//! the operator's single console to at most one VM at a time.
//!
//! ## Overview
//!
//! - **Session Registry**: map from VM id to VM record, the single source
//!   of truth for which VMs exist and their state
//! - **State Machine**: `Running`, `Attached` and `Stopped`, with every
//!   transition checked against one table
//! - **Attach Controller**: console handoff as a scoped guard
//! - **Interactive Loop**: read, forward, poll and render while attached
//! - **Provisioning**: local worker process or VM on a virtualization host
//!
//! ```text
//! operator command
//!   -> SessionRegistry lookup / mutation
//!   -> VmState transition check
//!   -> AttachController binds console (attach)
//!   -> run_interactive until exit
//!   -> guard released, VM back to Running
//! ```
//!
//! Process spawning and the hypervisor RPC live behind the
//! [`LocalLauncher`], [`RuntimeChannel`] and [`RemoteProvisioning`] traits.

pub mod controller;
pub mod error;
pub mod interactive;
pub mod provision;
pub mod registry;
pub mod runtime;
pub mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use controller::{AttachController, ControllerEvent, ControllerSession, ProcessStatus};
pub use error::{ProvisionError, RuntimeError, VmError};
pub use interactive::{run_interactive, Console, ConsoleInput, LoopExit, LoopOptions};
pub use provision::{
    provision, Credentials, ProvisioningStrategy, RemoteConfig, RemoteProvisioning, RemoteVmRef,
    SessionToken, VmKind, VmParams, VmSpec,
};
pub use registry::{format_uptime, validate_id, SessionRegistry, VmId, VmSnapshot};
pub use runtime::{LocalLauncher, RuntimeChannel, RuntimeHandle};
pub use state::{StopInfo, StopReason, Transition, VmState};
