//! # vmctl
//!
//! Operator shell for interactive Lua VMs. Wires the [`vmcore`] registry
//! and attach controller to a terminal console, PTY-backed interpreter
//! processes, TOML configuration and file logging.

pub mod config;
pub mod console;
pub mod logging;
pub mod profiles;
pub mod pty;
pub mod remote;
pub mod shell;

pub use config::Config;
pub use console::TerminalConsole;
pub use pty::{PtyLauncher, PtyRuntime};
pub use remote::UnavailableProvisioner;
pub use shell::{parse_command, Flow, Shell, ShellCommand};
