use anyhow::Result;
use std::io::Write;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

const BIN: &str = env!("CARGO_BIN_EXE_lockdb");

/// Test that the CLI can be launched with basic info command
#[test]
fn test_cli_info_command() -> Result<()> {
    let output = Command::new(BIN).args(["info"]).output()?;

    assert!(output.status.success(), "CLI info command failed");

    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("LockDB Information:"), "Expected info output not found");
    assert!(output_str.contains("ACCESS EXCLUSIVE"), "Lock modes not listed");
    assert!(output_str.contains("lost-update"), "Scenarios not listed");

    Ok(())
}

/// Test that flags override the configuration shown by info
#[test]
fn test_cli_config_file_and_flags() -> Result<()> {
    let mut config_file = NamedTempFile::new()?;
    writeln!(
        config_file,
        r#"{{"lock_table": {{"lock_timeout_ms": 250, "deadlock_detection": {{"mode": "periodic", "interval_ms": 20}}}}}}"#
    )?;
    config_file.flush()?;

    let output = Command::new(BIN)
        .args(["--config", &config_file.path().to_string_lossy(), "info"])
        .output()?;
    assert!(output.status.success(), "CLI rejected a valid config file");
    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("Lock timeout: 250 ms"));
    assert!(output_str.contains("every 20 ms"));

    let output = Command::new(BIN)
        .args(["--config", &config_file.path().to_string_lossy(), "--lock-timeout-ms", "75", "info"])
        .output()?;
    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("Lock timeout: 75 ms"));

    Ok(())
}

/// Test running canned scenarios
#[test]
fn test_cli_scenarios() -> Result<()> {
    let output = Command::new(BIN).args(["scenario", "lost-update"]).output()?;
    assert!(output.status.success(), "lost-update scenario failed");
    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("final balance 35, 2 purchases recorded"));
    assert!(output_str.contains("lost update"));

    let output = Command::new(BIN).args(["scenario", "all"]).output()?;
    assert!(output.status.success(), "running all scenarios failed");
    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("deadlock victim"));
    assert!(output_str.contains("no update was lost"));

    let output = Command::new(BIN).args(["scenario", "phantom-read"]).output()?;
    assert!(!output.status.success(), "unknown scenario should fail");

    Ok(())
}

/// Test the CLI shell functionality with input redirection
#[test]
fn test_cli_shell_interaction() -> Result<()> {
    let mut input_file = NamedTempFile::new()?;
    writeln!(input_file, "begin")?;
    writeln!(input_file, "write accounts/alice 100")?;
    writeln!(input_file, "commit")?;
    writeln!(input_file, "begin")?;
    writeln!(input_file, "read accounts/alice for-update")?;
    writeln!(input_file, "locks")?;
    writeln!(input_file, "lock accounts bogus mode")?;
    writeln!(input_file, "rollback")?;
    writeln!(input_file, "show")?;
    writeln!(input_file, "help")?;
    writeln!(input_file, "exit")?;
    input_file.flush()?;

    let output = Command::new(BIN)
        .args(["shell"])
        .stdin(Stdio::from(input_file.reopen()?))
        .output()?;

    assert!(output.status.success(), "CLI shell interaction failed");

    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("Welcome to LockDB CLI"), "Welcome message not found");
    assert!(output_str.contains("COMMIT (txn 1)"));
    assert!(output_str.contains("accounts/alice = 100"));
    assert!(output_str.contains("FOR UPDATE row accounts/alice"));
    assert!(output_str.contains("Error: Unknown lock mode"));
    assert!(output_str.contains("ROLLBACK (txn 2)"));
    assert!(output_str.contains("(1 rows)"));
    assert!(output_str.contains("Available commands:"), "Help message not found");
    assert!(output_str.contains("Goodbye!"), "Exit message not found");

    Ok(())
}

/// Test CLI help output
#[test]
fn test_cli_help_output() -> Result<()> {
    let output = Command::new(BIN).args(["--help"]).output()?;

    assert!(output.status.success(), "CLI help command failed");

    let output_str = String::from_utf8(output.stdout)?;
    assert!(output_str.contains("Usage:"), "Help usage section not found");
    assert!(output_str.contains("Options:"), "Help options section not found");
    assert!(output_str.contains("Commands:"), "Help commands section not found");

    Ok(())
}
