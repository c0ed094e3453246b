//! The operator shell.
//!
//! Reads commands from the console, applies them to the registry through
//! the attach controller, and hands the console to the interactive loop
//! while a VM is attached.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use vmcore::{
    provision, run_interactive, AttachController, Console, ConsoleInput, ControllerEvent,
    LocalLauncher, LoopExit, LoopOptions, RemoteProvisioning, SessionRegistry, VmError, VmKind,
    VmSnapshot, VmSpec,
};

use crate::config::Config;
use crate::profiles;

/// Prompt shown while no VM is attached.
pub const SHELL_PROMPT: &str = "vmctl> ";

const HELP_TEXT: &str = "\
Commands:
  create <ID> [--kind local|remote] [--profile NAME] [--attach]
              [--host H] [--username U] [--password-env VAR] [--template T]
                          Create a VM (remote options apply to --kind remote)
  attach <ID>             Bind the console to a VM; type 'exit' to detach
  detach                  Release the console
  stop <ID> [--yes]       Stop a VM
  list [--json]           List VMs
  status [ID]             Show a summary, or one VM's details
  purge                   Forget stopped VMs
  profiles                List environment profiles
  help                    Show this help
  quit | exit             Stop all VMs and leave";

/// One line typed at the shell prompt.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_subcommand = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

/// Shell commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Create a VM
    Create {
        /// VM id
        id: String,

        /// Provisioning strategy
        #[arg(long, value_parser = parse_kind)]
        kind: Option<VmKind>,

        /// Environment profile label
        #[arg(long)]
        profile: Option<String>,

        /// Virtualization host (remote)
        #[arg(long)]
        host: Option<String>,

        /// Login user on the host (remote)
        #[arg(long)]
        username: Option<String>,

        /// Environment variable holding the host password (remote)
        #[arg(long)]
        password_env: Option<String>,

        /// Template to clone (remote)
        #[arg(long)]
        template: Option<String>,

        /// Attach right after creation
        #[arg(long)]
        attach: bool,
    },

    /// Attach the console to a VM
    Attach { id: String },

    /// Detach the console
    Detach,

    /// Stop a VM
    Stop {
        id: String,

        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },

    /// List VMs
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show status
    Status { id: Option<String> },

    /// Forget stopped VMs
    Purge,

    /// List environment profiles
    Profiles,

    /// Show help
    Help,

    /// Stop all VMs and leave
    #[command(alias = "exit")]
    Quit,
}

fn parse_kind(s: &str) -> Result<VmKind, String> {
    s.parse()
}

/// Parses one shell line. The error is ready to show to the operator.
pub fn parse_command(line: &str) -> Result<ShellCommand, String> {
    ShellLine::try_parse_from(line.split_whitespace())
        .map(|parsed| parsed.command)
        .map_err(|e| e.render().to_string().trim_end().to_string())
}

/// Whether the shell keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The operator shell over a launcher and a remote provisioner.
pub struct Shell<L, R> {
    controller: Arc<AttachController>,
    launcher: L,
    remote: R,
    config: Config,
    events: broadcast::Receiver<ControllerEvent>,
    health_task: Option<JoinHandle<()>>,
}

impl<L, R> Shell<L, R>
where
    L: LocalLauncher,
    R: RemoteProvisioning,
{
    /// Creates a shell with an empty registry. Starts the background health
    /// check when the config enables it, so this must run inside a Tokio
    /// runtime.
    pub fn new(config: Config, launcher: L, remote: R) -> Self {
        let registry = Arc::new(SessionRegistry::with_limit(config.registry.max_vms));
        let controller = Arc::new(AttachController::new(registry));
        let events = controller.subscribe();

        let health_task = config
            .registry
            .health_check_interval()
            .map(|interval| controller.start_health_check_task(interval));

        Self {
            controller,
            launcher,
            remote,
            config,
            events,
            health_task,
        }
    }

    pub fn controller(&self) -> &Arc<AttachController> {
        &self.controller
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs the shell until `quit` or end of input, then stops every VM.
    pub async fn run<C: Console>(&mut self, console: &mut C) {
        console.notice("vmctl: Lua VM session controller. Type 'help' for commands.");

        loop {
            self.housekeeping(console);

            let line = match console.read_line(SHELL_PROMPT).await {
                Ok(ConsoleInput::Line(line)) => line,
                Ok(ConsoleInput::Interrupted) => {
                    console.notice("Use 'quit' to leave vmctl");
                    continue;
                }
                Ok(ConsoleInput::Eof) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Console read failed");
                    console.notice(&format!("Input error: {e}"));
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(message) => {
                    console.notice(&message);
                    continue;
                }
            };

            if self.execute(command, console).await == Flow::Quit {
                break;
            }
        }

        self.shutdown(console);
    }

    /// Executes one command.
    pub async fn execute<C: Console>(&mut self, command: ShellCommand, console: &mut C) -> Flow {
        tracing::debug!(command = ?command, "Executing shell command");

        match command {
            ShellCommand::Create {
                id,
                kind,
                profile,
                host,
                username,
                password_env,
                template,
                attach,
            } => {
                let kind = kind.unwrap_or(self.config.defaults.kind);
                let profile = profile.unwrap_or_else(|| self.config.defaults.profile.clone());

                let spec = match kind {
                    VmKind::Local => {
                        if host.is_some()
                            || username.is_some()
                            || password_env.is_some()
                            || template.is_some()
                        {
                            console.notice(
                                "Error: --host, --username, --password-env and --template only apply to remote VMs",
                            );
                            return Flow::Continue;
                        }
                        VmSpec::local(id.clone(), profile.clone())
                    }
                    VmKind::Remote => {
                        let remote = self.config.remote.to_remote_config(
                            host.as_deref(),
                            username.as_deref(),
                            password_env.as_deref(),
                            template.as_deref(),
                        );
                        VmSpec::remote(id.clone(), profile.clone(), remote)
                    }
                };

                if !profiles::is_known(&profile) {
                    console.notice(&format!(
                        "Note: '{profile}' is not a known profile; recording it as a label"
                    ));
                }

                match provision(self.controller.registry(), spec, &self.launcher, &self.remote)
                    .await
                {
                    Ok(snapshot) => {
                        console.notice(&format!(
                            "Created VM '{}' ({}, profile {})",
                            snapshot.id, snapshot.kind, snapshot.profile
                        ));
                        if attach {
                            let greeting = greeting_chunk(&snapshot);
                            self.attach_session(&id, Some(greeting), console).await;
                        }
                    }
                    Err(e) => report_error(console, &e),
                }
            }

            ShellCommand::Attach { id } => self.attach_session(&id, None, console).await,

            ShellCommand::Detach => match self.controller.detach_current() {
                Ok(id) => console.notice(&format!("Detached from VM '{id}'")),
                Err(e) => report_error(console, &e),
            },

            ShellCommand::Stop { id, yes } => self.stop(&id, yes, console).await,

            ShellCommand::List { json } => {
                let vms = self.sorted_snapshots();
                if json {
                    match serde_json::to_string_pretty(&vms) {
                        Ok(text) => console.render(&text),
                        Err(e) => console.notice(&format!("Error: {e}")),
                    }
                } else {
                    console.render(render_table(&vms).trim_end());
                }
            }

            ShellCommand::Status { id: Some(id) } => match self.controller.registry().get(&id) {
                Ok(snapshot) => console.render(&render_details(&snapshot)),
                Err(e) => report_error(console, &e),
            },

            ShellCommand::Status { id: None } => console.render(&self.render_summary()),

            ShellCommand::Purge => {
                let purged = self.controller.registry().purge_stopped(Duration::ZERO);
                console.notice(&format!("Purged {} stopped VM(s)", purged.len()));
            }

            ShellCommand::Profiles => console.render(profiles::render_catalog().trim_end()),

            ShellCommand::Help => console.render(HELP_TEXT),

            ShellCommand::Quit => return Flow::Quit,
        }

        Flow::Continue
    }

    async fn attach_session<C: Console>(
        &mut self,
        id: &str,
        greeting: Option<String>,
        console: &mut C,
    ) {
        let controller = Arc::clone(&self.controller);
        let session = match controller.attach(id) {
            Ok(session) => session,
            Err(e) => {
                report_error(console, &e);
                // Attach may have found the process dead and retired it.
                self.report_events(console);
                return;
            }
        };

        let options = LoopOptions {
            prompt: self.config.runtime.prompt.clone(),
            poll_delay: self.config.runtime.poll_delay(),
            greeting,
        };

        console.notice(&format!("Attached to VM '{id}'. Type 'exit' to detach."));

        let exit = run_interactive(&session, console, &options).await;
        match exit {
            LoopExit::Detached | LoopExit::EndOfInput => {
                let id = session.detach();
                console.notice(&format!("Detached from VM '{id}' (still running)"));
            }
            LoopExit::ProcessDied { exit_code } => {
                // Reported through the controller's Crashed event.
                if let Err(e) = session.mark_process_died(exit_code) {
                    tracing::debug!(vm_id = %id, error = %e, "VM already retired");
                }
            }
        }

        self.report_events(console);
    }

    async fn stop<C: Console>(&mut self, id: &str, yes: bool, console: &mut C) {
        let snapshot = match self.controller.registry().get(id) {
            Ok(snapshot) => snapshot,
            Err(e) => return report_error(console, &e),
        };
        if !snapshot.state.is_live() {
            return report_error(
                console,
                &VmError::NotRunning {
                    id: id.to_string(),
                    state: snapshot.state,
                },
            );
        }

        if !yes {
            let answer = console.read_line(&format!("Stop VM '{id}'? [y/N] ")).await;
            let confirmed = matches!(
                answer,
                Ok(ConsoleInput::Line(ref line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
            );
            if !confirmed {
                console.notice("Cancelled");
                return;
            }
        }

        match self.controller.stop(id) {
            Ok(_) => console.notice(&format!("VM '{id}' stopped")),
            Err(e) => report_error(console, &e),
        }
    }

    /// Detects dead workers, reports crashes and drops expired tombstones.
    fn housekeeping<C: Console>(&mut self, console: &mut C) {
        self.controller.check_health();
        self.report_events(console);

        if let Some(grace) = self.config.registry.tombstone_grace() {
            let purged = self.controller.registry().purge_stopped(grace);
            for id in purged {
                tracing::debug!(vm_id = %id, "Tombstone expired");
            }
        }
    }

    fn report_events<C: Console>(&mut self, console: &mut C) {
        loop {
            match self.events.try_recv() {
                Ok(ControllerEvent::Crashed { id, exit_code }) => {
                    console.notice(&crash_message(&id, exit_code));
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Missed controller events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn sorted_snapshots(&self) -> Vec<VmSnapshot> {
        let mut vms = self.controller.registry().list();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        vms
    }

    fn render_summary(&self) -> String {
        let registry = self.controller.registry();
        let attached = self.controller.console_owner();
        let health = match self.config.registry.health_check_interval() {
            Some(interval) => format!("every {}s", interval.as_secs()),
            None => "before each command".to_string(),
        };

        format!(
            "VMs:          {} total, {} live\n\
             Console:      {}\n\
             Interpreter:  {} {}\n\
             Live limit:   {}\n\
             Health check: {}\n\
             Remote host:  {}",
            registry.len(),
            registry.live_count(),
            attached
                .map(|id| format!("attached to '{id}'"))
                .unwrap_or_else(|| "free".to_string()),
            self.config.runtime.interpreter,
            self.config.runtime.args.join(" "),
            self.config.registry.max_vms,
            health,
            self.config.remote.host,
        )
    }

    /// Stops every live VM.
    pub fn shutdown<C: Console>(&mut self, console: &mut C) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }

        let stopped = self.controller.shutdown();
        if stopped > 0 {
            console.notice(&format!("Stopped {stopped} VM(s)"));
        }
        tracing::info!(stopped = stopped, "Shell exited");
    }
}

impl<L, R> Drop for Shell<L, R> {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }
}

fn report_error<C: Console + ?Sized>(console: &mut C, error: &VmError) {
    tracing::debug!(vm_id = ?error.vm_id(), error = %error, "Command rejected");
    console.notice(&format!("Error: {error}"));
}

/// Operator-facing crash report.
pub fn crash_message(id: &str, exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("VM '{id}' crashed (exit code {code})"),
        None => format!("VM '{id}' crashed"),
    }
}

/// Lua chunk sent to a freshly created VM when attaching right away.
fn greeting_chunk(snapshot: &VmSnapshot) -> String {
    format!(
        "print(\"VM '{}' ready (profile {}, \" .. _VERSION .. \")\")\n",
        snapshot.id,
        snapshot.profile.replace(['"', '\\'], ""),
    )
}

/// Truncate a string to a maximum number of characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

const MAX_PROFILE_WIDTH: usize = 20;

/// Render VMs as an ASCII table.
pub fn render_table(vms: &[VmSnapshot]) -> String {
    if vms.is_empty() {
        return "No VMs.".to_string();
    }

    let id_width = vms.iter().map(|v| v.id.len()).max().unwrap_or(2).max(2);
    let profile_width = vms
        .iter()
        .map(|v| v.profile.chars().count())
        .max()
        .unwrap_or(7)
        .clamp(7, MAX_PROFILE_WIDTH);

    let mut out = format!(
        "{:<id_width$}  {:<6}  {:<profile_width$}  {:<8}  {:<19}  {:>10}\n",
        "ID", "KIND", "PROFILE", "STATE", "CREATED", "UPTIME"
    );
    out.push_str(&"-".repeat(id_width + profile_width + 6 + 8 + 19 + 10 + 10));
    out.push('\n');

    for vm in vms {
        out.push_str(&format!(
            "{:<id_width$}  {:<6}  {:<profile_width$}  {:<8}  {:<19}  {:>10}\n",
            vm.id,
            vm.kind.as_str(),
            truncate_str(&vm.profile, profile_width),
            vm.state.as_str(),
            vm.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            vm.uptime_display(),
        ));
    }

    out.push('\n');
    out.push_str(&format!("Total: {} VM(s)\n", vms.len()));
    out
}

/// Render one VM's details.
pub fn render_details(vm: &VmSnapshot) -> String {
    let mut lines = vec![
        format!("VM:       {}", vm.id),
        format!("Kind:     {}", vm.kind),
        format!("Profile:  {}", vm.profile),
        format!("State:    {}", vm.state),
        format!("Created:  {}", vm.created_at.format("%Y-%m-%d %H:%M:%S")),
        format!("Uptime:   {}", vm.uptime_display()),
    ];

    if let Some(runtime) = &vm.runtime {
        lines.push(format!("Runtime:  {runtime}"));
    }
    if let Some(host) = &vm.remote_host {
        lines.push(format!("Host:     {host}"));
    }
    if let Some(stop) = &vm.stop {
        lines.push(format!(
            "Stopped:  {} at {}",
            stop.reason,
            stop.at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    if let Some(profile) = profiles::find(&vm.profile) {
        lines.push(format!("Packages: {}", profile.packages.join(", ")));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_shell_line_debug_assert() {
        ShellLine::command().debug_assert();
    }

    #[test]
    fn test_parse_create_defaults() {
        let command = parse_command("create vmA").unwrap();
        assert_eq!(
            command,
            ShellCommand::Create {
                id: "vmA".to_string(),
                kind: None,
                profile: None,
                host: None,
                username: None,
                password_env: None,
                template: None,
                attach: false,
            }
        );
    }

    #[test]
    fn test_parse_create_remote() {
        let command =
            parse_command("create remote1 --kind xcpng --profile bioxen-ai --host 10.0.0.5 --attach")
                .unwrap();
        match command {
            ShellCommand::Create {
                id,
                kind,
                profile,
                host,
                attach,
                ..
            } => {
                assert_eq!(id, "remote1");
                assert_eq!(kind, Some(VmKind::Remote));
                assert_eq!(profile.as_deref(), Some("bioxen-ai"));
                assert_eq!(host.as_deref(), Some("10.0.0.5"));
                assert!(attach);
            }
            other => panic!("Expected Create command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalid_kind() {
        let err = parse_command("create vmA --kind xen").unwrap_err();
        assert!(err.contains("unknown VM kind"));
    }

    #[test]
    fn test_parse_stop() {
        assert_eq!(
            parse_command("stop vmA").unwrap(),
            ShellCommand::Stop {
                id: "vmA".to_string(),
                yes: false
            }
        );
        assert_eq!(
            parse_command("stop vmA -y").unwrap(),
            ShellCommand::Stop {
                id: "vmA".to_string(),
                yes: true
            }
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("detach").unwrap(), ShellCommand::Detach);
        assert_eq!(parse_command("list").unwrap(), ShellCommand::List { json: false });
        assert_eq!(parse_command("list --json").unwrap(), ShellCommand::List { json: true });
        assert_eq!(parse_command("status").unwrap(), ShellCommand::Status { id: None });
        assert_eq!(
            parse_command("  status   vmA ").unwrap(),
            ShellCommand::Status {
                id: Some("vmA".to_string())
            }
        );
        assert_eq!(parse_command("purge").unwrap(), ShellCommand::Purge);
        assert_eq!(parse_command("profiles").unwrap(), ShellCommand::Profiles);
        assert_eq!(parse_command("help").unwrap(), ShellCommand::Help);
        assert_eq!(parse_command("quit").unwrap(), ShellCommand::Quit);
        assert_eq!(parse_command("exit").unwrap(), ShellCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("frobnicate").is_err());
        assert!(parse_command("attach").is_err());
        assert!(parse_command("stop").is_err());
    }

    #[test]
    fn test_crash_message() {
        assert_eq!(crash_message("vmA", Some(3)), "VM 'vmA' crashed (exit code 3)");
        assert_eq!(crash_message("vmA", None), "VM 'vmA' crashed");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-profile-name", 10), "a-very-...");
        assert_eq!(truncate_str("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_render_table_empty() {
        assert_eq!(render_table(&[]), "No VMs.");
    }
}
