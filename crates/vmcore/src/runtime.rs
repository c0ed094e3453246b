//! The VM runtime seam.
//!
//! A [`RuntimeChannel`] is the I/O channel of one live VM, regardless of
//! whether it is a local interpreter process or a command channel to a VM
//! on a virtualization host. The registry owns exactly one handle per live
//! VM and releases it when the VM stops.

use crate::error::RuntimeError;

/// I/O channel to a running VM.
///
/// All methods are non-blocking or bounded: `read_available` returns
/// whatever output was buffered since the previous call (possibly empty).
pub trait RuntimeChannel: Send + Sync {
    /// Writes raw input to the VM.
    fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError>;

    /// Drains output buffered since the last read.
    fn read_available(&mut self) -> Result<Vec<u8>, RuntimeError>;

    /// Returns whether the underlying process is still alive.
    fn is_alive(&mut self) -> bool;

    /// Exit code of the process, once it has exited and the code is known.
    fn exit_code(&mut self) -> Option<i32>;

    /// Terminates the process and reaps it; returns its exit code if known.
    fn terminate(&mut self) -> Result<Option<i32>, RuntimeError>;

    /// Short human-readable description (e.g. `pid 4242`).
    fn describe(&self) -> String;
}

/// Opaque owning handle to a VM's runtime channel.
pub type RuntimeHandle = Box<dyn RuntimeChannel>;

/// Starts local worker processes.
pub trait LocalLauncher: Send + Sync {
    /// Starts a worker for `vm_id` and returns its channel.
    fn launch(&self, vm_id: &str) -> Result<RuntimeHandle, RuntimeError>;
}
