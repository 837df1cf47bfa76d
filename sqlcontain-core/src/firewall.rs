//! Outbound firewall block for the database server binary.
//!
//! Windows only. Adding the rule needs an elevated process. An elevated run
//! applies it directly; otherwise the run relaunches its own executable
//! through `Start-Process -Verb RunAs` with `--internal-firewall-only`, and
//! the elevated child applies the rule.

use std::ffi::OsString;
use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ContainError;
use crate::Result;

/// Name of the outbound block rule.
pub const FIREWALL_RULE_NAME: &str = "SQLServer_Block_All_Outbound";

/// Flag the elevated child is started with.
pub const INTERNAL_FIREWALL_FLAG: &str = "--internal-firewall-only";

/// Flag carrying the server binary path to the elevated child.
pub const SQLSERVR_PATH_FLAG: &str = "--sqlservr-path";

/// Fails unless running on Windows.
///
/// # Errors
/// [`ContainError::Platform`] on any other OS.
pub fn ensure_windows() -> Result<()> {
    if cfg!(windows) {
        Ok(())
    } else {
        Err(ContainError::platform("Firewall configuration requires Windows."))
    }
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ContainError {
    let context = context.into();
    move |source| ContainError::Io { context, source }
}

/// Whether the current process is elevated (`net session` succeeds).
///
/// # Errors
/// Platform error off Windows.
pub async fn is_elevated() -> Result<bool> {
    ensure_windows()?;
    let output = Command::new("net")
        .arg("session")
        .output()
        .await
        .map_err(io_error("Failed to run 'net session'"))?;
    Ok(output.status.success())
}

/// Arguments for `netsh` that remove any existing rule.
pub fn delete_rule_args() -> Vec<OsString> {
    ["advfirewall", "firewall", "delete", "rule"]
        .iter()
        .map(OsString::from)
        .chain(std::iter::once(OsString::from(format!("name={}", FIREWALL_RULE_NAME))))
        .collect()
}

/// Arguments for `netsh` that add the outbound block rule for `program`.
pub fn add_rule_args(program: &Path) -> Vec<OsString> {
    let mut program_arg = OsString::from("program=");
    program_arg.push(program.as_os_str());

    vec![
        OsString::from("advfirewall"),
        OsString::from("firewall"),
        OsString::from("add"),
        OsString::from("rule"),
        OsString::from(format!("name={}", FIREWALL_RULE_NAME)),
        OsString::from("dir=out"),
        OsString::from("action=block"),
        program_arg,
        OsString::from("enable=yes"),
        OsString::from("profile=any"),
    ]
}

/// Replaces the outbound block rule for `sqlservr_path`.
///
/// Must run elevated.
///
/// # Errors
/// Platform error off Windows or when not elevated; I/O or platform error
/// when `netsh` cannot add the rule.
pub async fn apply_outbound_block(sqlservr_path: &Path) -> Result<()> {
    ensure_windows()?;
    if !is_elevated().await? {
        return Err(ContainError::platform("Firewall configuration requires an elevated process."));
    }

    // Deleting a rule that does not exist fails; that is expected.
    let deleted = Command::new("netsh")
        .args(delete_rule_args())
        .output()
        .await
        .map_err(io_error("Failed to run netsh"))?;
    debug!(status = %deleted.status, "Removed previous firewall rule");

    let added = Command::new("netsh")
        .args(add_rule_args(sqlservr_path))
        .output()
        .await
        .map_err(io_error("Failed to run netsh"))?;
    if !added.status.success() {
        return Err(ContainError::platform(format!(
            "netsh could not add firewall rule '{}': {}",
            FIREWALL_RULE_NAME,
            String::from_utf8_lossy(&added.stdout).trim()
        )));
    }

    info!(rule = FIREWALL_RULE_NAME, program = %sqlservr_path.display(), "Outbound firewall block applied");
    Ok(())
}

fn escape_powershell(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// PowerShell command that re-runs `exe` elevated for `sqlservr_path` and
/// exits with the child's exit code.
pub fn relaunch_command(exe: &Path, sqlservr_path: &Path) -> String {
    let child_args = format!(
        "{} {} \"{}\"",
        INTERNAL_FIREWALL_FLAG,
        SQLSERVR_PATH_FLAG,
        sqlservr_path.display()
    );
    format!(
        "$p = Start-Process -FilePath {} -ArgumentList {} -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
        escape_powershell(&exe.display().to_string()),
        escape_powershell(&child_args)
    )
}

/// Relaunches the current executable elevated to apply the firewall rule.
///
/// Returns whether the elevated child reported success.
///
/// # Errors
/// Platform error off Windows; I/O error when the executable path or
/// PowerShell is unavailable.
pub async fn relaunch_elevated(sqlservr_path: &Path) -> Result<bool> {
    ensure_windows()?;
    let exe = std::env::current_exe().map_err(io_error("Failed to locate current executable"))?;

    let status = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-ExecutionPolicy")
        .arg("Bypass")
        .arg("-Command")
        .arg(relaunch_command(&exe, sqlservr_path))
        .status()
        .await
        .map_err(io_error("Failed to start PowerShell"))?;

    Ok(status.success())
}

/// Applies the outbound block, relaunching elevated only when needed.
///
/// Returns whether the rule was applied.
///
/// # Errors
/// Platform error off Windows; errors from [`apply_outbound_block`] when
/// already elevated; errors from [`relaunch_elevated`] otherwise.
pub async fn ensure_outbound_block(sqlservr_path: &Path) -> Result<bool> {
    ensure_windows()?;
    if is_elevated().await? {
        debug!("Process is elevated; applying firewall rule directly");
        apply_outbound_block(sqlservr_path).await?;
        return Ok(true);
    }
    relaunch_elevated(sqlservr_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_add_rule_args() {
        let path = PathBuf::from(r"C:\Program Files\MSSQL\Binn\sqlservr.exe");
        let args = add_rule_args(&path);
        assert!(args.contains(&OsString::from("name=SQLServer_Block_All_Outbound")));
        assert!(args.contains(&OsString::from("dir=out")));
        assert!(args.contains(&OsString::from("action=block")));
        assert!(args.contains(&OsString::from(r"program=C:\Program Files\MSSQL\Binn\sqlservr.exe")));
    }

    #[test]
    fn test_delete_rule_args() {
        let args = delete_rule_args();
        assert_eq!(args.last(), Some(&OsString::from("name=SQLServer_Block_All_Outbound")));
        assert_eq!(args[2], OsString::from("delete"));
    }

    #[test]
    fn test_relaunch_command_quotes() {
        let command = relaunch_command(Path::new(r"C:\it's\sqlcontain.exe"), Path::new(r"C:\sql\sqlservr.exe"));
        assert!(command.contains(r"-FilePath 'C:\it''s\sqlcontain.exe'"));
        assert!(command.contains(r#"'--internal-firewall-only --sqlservr-path "C:\sql\sqlservr.exe"'"#));
        assert!(command.contains("-Verb RunAs -Wait -PassThru"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_requires_windows() {
        assert!(matches!(ensure_windows(), Err(ContainError::Platform { .. })));
        assert!(apply_outbound_block(Path::new("sqlservr.exe")).await.is_err());
        assert!(relaunch_elevated(Path::new("sqlservr.exe")).await.is_err());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_ensure_outbound_block_requires_windows() {
        let err = ensure_outbound_block(Path::new("sqlservr.exe")).await.unwrap_err();
        assert!(matches!(err, ContainError::Platform { .. }));
    }
}
