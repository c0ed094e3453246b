//! The read/forward/poll/render loop run while a VM is attached.

use std::io;
use std::time::Duration;

use crate::controller::{ControllerSession, ProcessStatus};
use crate::error::VmError;

/// Default pause between forwarding input and polling for output.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(100);

/// Shown when the operator interrupts while attached.
pub const DETACH_HINT: &str = "Use 'exit' to detach from VM";

const EXIT_TOKENS: [&str; 2] = ["exit", "quit"];

/// One read from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Line(String),
    /// Ctrl-C while waiting for input.
    Interrupted,
    /// End of input (Ctrl-D or closed stdin).
    Eof,
}

/// The operator's terminal.
#[allow(async_fn_in_trait)]
pub trait Console {
    /// Shows `prompt` and reads one line.
    async fn read_line(&mut self, prompt: &str) -> io::Result<ConsoleInput>;

    /// Renders VM output.
    fn render(&mut self, text: &str);

    /// Shows a message from the tool itself.
    fn notice(&mut self, text: &str);
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Prompt prefix; the VM id is appended as `prefix[id]> `.
    pub prompt: String,
    pub poll_delay: Duration,
    /// Forwarded once before the first prompt.
    pub greeting: Option<String>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            prompt: "lua".to_string(),
            poll_delay: DEFAULT_POLL_DELAY,
            greeting: None,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The operator typed an exit token.
    Detached,
    /// Input ended.
    EndOfInput,
    /// The VM process is gone. The caller must retire the VM.
    ProcessDied { exit_code: Option<i32> },
}

/// Whether `line` is an exit token: exact, case-sensitive, after trimming.
pub fn is_exit_token(line: &str) -> bool {
    EXIT_TOKENS.contains(&line.trim())
}

/// Runs the interactive loop until the operator exits or the process dies.
///
/// Forward and poll errors are reported to the console and the loop keeps
/// going. Output that arrives after the last poll is not drained; it stays
/// buffered in the runtime and is shown when the VM is next attached.
pub async fn run_interactive<C>(
    session: &ControllerSession<'_>,
    console: &mut C,
    options: &LoopOptions,
) -> LoopExit
where
    C: Console + ?Sized,
{
    let prompt = format!("{}[{}]> ", options.prompt, session.id());

    // Output buffered while detached.
    let initial = poll_and_render(session, console);
    if let Some(exit) = process_died(session) {
        return exit;
    }
    if let Err(err) = initial {
        console.notice(&format!("Error: {err}"));
    }

    if let Some(greeting) = &options.greeting {
        if let Some(exit) = exchange(session, console, greeting, options.poll_delay).await {
            return exit;
        }
    }

    loop {
        let line = match console.read_line(&prompt).await {
            Ok(ConsoleInput::Line(line)) => line,
            Ok(ConsoleInput::Interrupted) => {
                console.notice(DETACH_HINT);
                continue;
            }
            Ok(ConsoleInput::Eof) => return LoopExit::EndOfInput,
            Err(err) => {
                tracing::warn!(vm_id = %session.id(), error = %err, "Console read failed");
                console.notice(&format!("Input error: {err}"));
                return LoopExit::EndOfInput;
            }
        };

        if is_exit_token(&line) {
            return LoopExit::Detached;
        }
        if line.trim().is_empty() {
            continue;
        }

        let mut payload = line.trim_end_matches(['\r', '\n']).to_string();
        payload.push('\n');

        if let Some(exit) = exchange(session, console, &payload, options.poll_delay).await {
            return exit;
        }
    }
}

/// Forwards one payload, waits, and renders whatever came back. Returns
/// `Some` only when the process has died.
async fn exchange<C>(
    session: &ControllerSession<'_>,
    console: &mut C,
    payload: &str,
    poll_delay: Duration,
) -> Option<LoopExit>
where
    C: Console + ?Sized,
{
    if let Err(err) = session.forward(payload.as_bytes()) {
        if let VmError::ProcessDied { exit_code, .. } = err {
            return Some(LoopExit::ProcessDied { exit_code });
        }
        if let Some(exit) = process_died(session) {
            return Some(exit);
        }
        tracing::debug!(vm_id = %session.id(), error = %err, "Forward failed");
        console.notice(&format!("Error: {err}"));
        return None;
    }

    tokio::time::sleep(poll_delay).await;

    if let Err(err) = poll_and_render(session, console) {
        if let Some(exit) = process_died(session) {
            return Some(exit);
        }
        tracing::debug!(vm_id = %session.id(), error = %err, "Poll failed");
        console.notice(&format!("Error: {err}"));
    }

    process_died(session)
}

fn poll_and_render<C>(session: &ControllerSession<'_>, console: &mut C) -> Result<(), VmError>
where
    C: Console + ?Sized,
{
    let output = session.poll()?;
    let text = String::from_utf8_lossy(&output);
    let text = text.trim_end();
    if !text.is_empty() {
        console.render(text);
    }
    Ok(())
}

fn process_died(session: &ControllerSession<'_>) -> Option<LoopExit> {
    match session.process_status() {
        ProcessStatus::Alive => None,
        ProcessStatus::Exited { exit_code } => Some(LoopExit::ProcessDied { exit_code }),
    }
}
