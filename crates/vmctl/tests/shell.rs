//! Shell integration tests over scripted runtimes and consoles.

use vmcore::testing::{ScriptedConsole, ScriptedLauncher, ScriptedProvisioner};
use vmcore::{StopReason, VmKind, VmState};
use vmctl::config::Config;
use vmctl::{parse_command, Flow, Shell, UnavailableProvisioner};

fn test_config() -> Config {
    let mut config = Config::default();
    config.runtime.poll_delay_ms = 1;
    config
}

fn shell() -> Shell<ScriptedLauncher, ScriptedProvisioner> {
    Shell::new(test_config(), ScriptedLauncher::new(), ScriptedProvisioner::new())
}

async fn exec<L, R>(shell: &mut Shell<L, R>, line: &str, console: &mut ScriptedConsole) -> Flow
where
    L: vmcore::LocalLauncher,
    R: vmcore::RemoteProvisioning,
{
    let command = parse_command(line).unwrap();
    shell.execute(command, console).await
}

fn notices(console: &ScriptedConsole) -> String {
    console.notices.join("\n")
}

#[tokio::test]
async fn test_create_attach_forward_exit() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["x=1", "exit"]);

    exec(&mut shell, "create vmA --profile standard", &mut console).await;
    exec(&mut shell, "attach vmA", &mut console).await;

    let registry = shell.controller().registry();
    let vm = registry.get("vmA").unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.kind, VmKind::Local);
    assert_eq!(shell.controller().console_owner(), None);

    let probe = shell.launcher().probe("vmA").unwrap();
    assert_eq!(probe.written_text(), "x=1\n");
    assert_eq!(console.rendered, vec!["=> x=1".to_string()]);
    assert!(notices(&console).contains("Created VM 'vmA' (local, profile standard)"));
    assert!(notices(&console).contains("Detached from VM 'vmA' (still running)"));
    assert!(console.prompts.contains(&"lua[vmA]> ".to_string()));
}

#[tokio::test]
async fn test_duplicate_create_rejected() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "create vmA --profile minimal", &mut console).await;

    assert!(notices(&console).contains("Error: VM 'vmA' already exists"));
    assert_eq!(shell.launcher().launched(), vec!["vmA".to_string()]);
    assert_eq!(shell.controller().registry().len(), 1);
    assert_eq!(shell.controller().registry().get("vmA").unwrap().profile, "standard");
}

#[tokio::test]
async fn test_attach_missing_vm() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "attach ghost", &mut console).await;

    assert_eq!(console.notices, vec!["Error: no such VM: 'ghost'".to_string()]);
    assert!(shell.controller().registry().is_empty());
}

#[tokio::test]
async fn test_invalid_id_rejected() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create bad;id", &mut console).await;

    assert!(notices(&console).contains("invalid VM id"));
    assert!(shell.launcher().launched().is_empty());
}

#[tokio::test]
async fn test_detach_at_prompt_is_error() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "detach", &mut console).await;

    assert!(notices(&console).contains("Error: no VM is attached"));
    assert_eq!(
        shell.controller().registry().get("vmA").unwrap().state,
        VmState::Running
    );
}

#[tokio::test]
async fn test_stop_asks_for_confirmation() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["n", "y"]);

    exec(&mut shell, "create vmA", &mut console).await;

    exec(&mut shell, "stop vmA", &mut console).await;
    assert!(console.prompts.contains(&"Stop VM 'vmA'? [y/N] ".to_string()));
    assert!(notices(&console).contains("Cancelled"));
    assert_eq!(
        shell.controller().registry().get("vmA").unwrap().state,
        VmState::Running
    );

    exec(&mut shell, "stop vmA", &mut console).await;
    assert!(notices(&console).contains("VM 'vmA' stopped"));

    let vm = shell.controller().registry().get("vmA").unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vm.stop.map(|s| s.reason), Some(StopReason::Operator));
    assert!(shell.launcher().probe("vmA").unwrap().is_terminated());
}

#[tokio::test]
async fn test_stopped_vm_cannot_be_attached_or_recreated() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "stop vmA --yes", &mut console).await;
    exec(&mut shell, "attach vmA", &mut console).await;
    exec(&mut shell, "stop vmA --yes", &mut console).await;
    exec(&mut shell, "create vmA", &mut console).await;

    let text = notices(&console);
    assert_eq!(text.matches("VM 'vmA' is not running (state: Stopped)").count(), 2);
    assert!(text.contains("Error: VM 'vmA' already exists"));

    exec(&mut shell, "purge", &mut console).await;
    assert!(notices(&console).contains("Purged 1 stopped VM(s)"));
    exec(&mut shell, "create vmA", &mut console).await;
    assert_eq!(
        shell.controller().registry().get("vmA").unwrap().state,
        VmState::Running
    );
}

#[tokio::test]
async fn test_process_death_while_attached() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["os.exit(3)", "never forwarded"]);

    exec(&mut shell, "create vmA", &mut console).await;
    let probe = shell.launcher().probe("vmA").unwrap();
    probe.exit_on_write(Some(3));

    exec(&mut shell, "attach vmA", &mut console).await;

    assert!(notices(&console).contains("Attached to VM 'vmA'"));
    assert!(notices(&console).contains("VM 'vmA' crashed (exit code 3)"));
    assert!(!notices(&console).contains("still running"));
    assert_eq!(probe.written_text(), "os.exit(3)\n");
    assert_eq!(shell.controller().console_owner(), None);

    let vm = shell.controller().registry().get("vmA").unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(
        vm.stop.map(|s| s.reason),
        Some(StopReason::Crashed { exit_code: Some(3) })
    );
}

#[tokio::test]
async fn test_attach_to_dead_worker_is_refused() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["never read"]);

    exec(&mut shell, "create vmA", &mut console).await;
    shell.launcher().probe("vmA").unwrap().exit(Some(9));

    exec(&mut shell, "attach vmA", &mut console).await;

    let text = notices(&console);
    assert!(text.contains("Error: VM 'vmA' is not running (state: Stopped)"));
    assert!(text.contains("VM 'vmA' crashed (exit code 9)"));
    assert!(!text.contains("Attached to VM 'vmA'"));
    assert!(console.prompts.is_empty());
    assert_eq!(shell.controller().console_owner(), None);
}

#[tokio::test]
async fn test_local_launch_failure() {
    let mut shell = Shell::new(test_config(), ScriptedLauncher::failing(), ScriptedProvisioner::new());
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA", &mut console).await;

    let text = notices(&console);
    assert!(text.contains("Error: failed to provision VM 'vmA'"));
    assert!(text.contains("failed to spawn worker"));
    assert!(shell.controller().registry().is_empty());
}

#[tokio::test]
async fn test_crash_detected_between_commands() {
    let mut shell = shell();
    let mut setup = ScriptedConsole::default();
    exec(&mut shell, "create vmA", &mut setup).await;
    exec(&mut shell, "create vmB", &mut setup).await;

    shell.launcher().probe("vmA").unwrap().exit(None);

    let mut console = ScriptedConsole::with_lines(["list", "quit"]);
    shell.run(&mut console).await;

    assert!(notices(&console).contains("VM 'vmA' crashed"));
    assert!(notices(&console).contains("Stopped 1 VM(s)"));
    assert!(shell.launcher().probe("vmB").unwrap().is_terminated());
}

#[tokio::test]
async fn test_attach_other_while_attached_is_not_reachable_from_prompt() {
    // The interactive loop owns the console, so a second attach can only be
    // typed after the first session ends.
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["attach vmB", "exit", "exit"]);

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "create vmB", &mut console).await;
    exec(&mut shell, "attach vmA", &mut console).await;

    // "attach vmB" was forwarded to vmA as input.
    let probe_a = shell.launcher().probe("vmA").unwrap();
    assert_eq!(probe_a.written_text(), "attach vmB\n");
    assert_eq!(
        shell.controller().registry().get("vmB").unwrap().state,
        VmState::Running
    );
}

#[tokio::test]
async fn test_create_with_attach_sends_greeting() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["exit"]);

    exec(&mut shell, "create vmA --attach", &mut console).await;

    let probe = shell.launcher().probe("vmA").unwrap();
    assert!(probe.written_text().starts_with("print(\"VM 'vmA' ready"));
    assert!(notices(&console).contains("Attached to VM 'vmA'"));
    assert_eq!(
        shell.controller().registry().get("vmA").unwrap().state,
        VmState::Running
    );
}

#[tokio::test]
async fn test_unknown_profile_is_accepted_with_note() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA --profile my-lab", &mut console).await;

    assert!(notices(&console).contains("'my-lab' is not a known profile"));
    assert_eq!(shell.controller().registry().get("vmA").unwrap().profile, "my-lab");
}

#[tokio::test]
async fn test_live_limit() {
    let mut config = test_config();
    config.registry.max_vms = 1;
    let mut shell = Shell::new(config, ScriptedLauncher::new(), ScriptedProvisioner::new());
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "create vmB", &mut console).await;

    assert!(notices(&console).contains("limit of 1 live VMs reached"));
    assert_eq!(shell.launcher().launched(), vec!["vmA".to_string()]);
}

#[tokio::test]
async fn test_remote_create_uses_collaborator() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(
        &mut shell,
        "create remote1 --kind remote --host 10.0.0.5 --password-env VMCTL_TEST_UNSET_PASSWORD_VAR",
        &mut console,
    )
    .await;
    // The credentials variable is not set.
    assert!(notices(&console).contains("authentication to 10.0.0.5 failed"));
    assert!(shell.controller().registry().is_empty());

    exec(
        &mut shell,
        "create remote1 --kind remote --host 10.0.0.5 --password-env=",
        &mut console,
    )
    .await;
    let vm = shell.controller().registry().get("remote1").unwrap();
    assert_eq!(vm.kind, VmKind::Remote);
    assert_eq!(vm.remote_host.as_deref(), Some("10.0.0.5"));
    assert!(shell.launcher().launched().is_empty());
}

#[tokio::test]
async fn test_remote_create_without_hypervisor_client() {
    let mut config = test_config();
    config.remote.password_env.clear();
    let mut shell = Shell::new(config, ScriptedLauncher::new(), UnavailableProvisioner);
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create remote1 --kind remote", &mut console).await;

    let text = notices(&console);
    assert!(text.contains("failed to provision VM 'remote1'"));
    assert!(text.contains("192.168.1.100"));
    assert!(shell.controller().registry().is_empty());
}

#[tokio::test]
async fn test_remote_flags_rejected_for_local() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA --host 10.0.0.5", &mut console).await;

    assert!(notices(&console).contains("only apply to remote VMs"));
    assert!(shell.controller().registry().is_empty());
}

#[tokio::test]
async fn test_list_table_and_json() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "list", &mut console).await;
    assert_eq!(console.rendered.last().map(String::as_str), Some("No VMs."));

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "create vmB --profile bioxen-ai", &mut console).await;
    exec(&mut shell, "stop vmB --yes", &mut console).await;

    exec(&mut shell, "list", &mut console).await;
    let table = console.rendered.last().unwrap().clone();
    assert!(table.starts_with("ID"));
    assert!(table.contains("vmA"));
    assert!(table.contains("bioxen-ai"));
    assert!(table.contains("Stopped"));
    assert!(table.contains("Total: 2 VM(s)"));

    exec(&mut shell, "list --json", &mut console).await;
    let json: serde_json::Value = serde_json::from_str(console.rendered.last().unwrap()).unwrap();
    let vms = json.as_array().unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0]["id"], "vmA");
    assert_eq!(vms[0]["state"], "Running");
    assert_eq!(vms[1]["stop"]["reason"], "operator");
}

#[tokio::test]
async fn test_status() {
    let mut shell = shell();
    let mut console = ScriptedConsole::default();

    exec(&mut shell, "create vmA --profile standard", &mut console).await;

    exec(&mut shell, "status", &mut console).await;
    let summary = console.rendered.last().unwrap().clone();
    assert!(summary.contains("1 total, 1 live"));
    assert!(summary.contains("free"));

    exec(&mut shell, "status vmA", &mut console).await;
    let details = console.rendered.last().unwrap().clone();
    assert!(details.contains("VM:       vmA"));
    assert!(details.contains("State:    Running"));
    assert!(details.contains("Packages: lua-cjson"));

    exec(&mut shell, "status ghost", &mut console).await;
    assert!(notices(&console).contains("no such VM: 'ghost'"));
}

#[tokio::test]
async fn test_run_handles_bad_input_and_interrupts() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["", "frobnicate"]);
    console.push_interrupt();
    console.push_line("help");
    console.push_line("exit");

    shell.run(&mut console).await;

    let text = notices(&console);
    assert!(text.contains("frobnicate"));
    assert!(text.contains("Use 'quit' to leave vmctl"));
    assert!(console.rendered.iter().any(|r| r.starts_with("Commands:")));
}

#[tokio::test]
async fn test_quit_stops_every_vm() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["create vmA", "create vmB", "quit"]);

    shell.run(&mut console).await;

    assert_eq!(shell.controller().registry().live_count(), 0);
    for id in ["vmA", "vmB"] {
        assert!(shell.launcher().probe(id).unwrap().is_terminated());
    }
    assert!(notices(&console).contains("Stopped 2 VM(s)"));
}

#[tokio::test]
async fn test_late_output_shown_on_reattach() {
    let mut shell = shell();
    let mut console = ScriptedConsole::with_lines(["exit", "exit"]);

    exec(&mut shell, "create vmA", &mut console).await;
    exec(&mut shell, "attach vmA", &mut console).await;
    shell.launcher().probe("vmA").unwrap().push_output("done\r\n");
    exec(&mut shell, "attach vmA", &mut console).await;

    assert_eq!(console.rendered, vec!["done".to_string()]);
}
