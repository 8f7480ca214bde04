//! One-shot shell commands and the host summary

use std::process::{Output, Stdio};

use tokio::process::Command;

/// Run `command` through the platform shell and return its combined output.
///
/// A non-zero exit is reported inline as `Error: <status>\nOutput: <output>`
/// so the listener always gets a printable response.
pub async fn execute(command: &str) -> String {
    tracing::debug!("Executing shell command: {}", command);

    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C");
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c");
        cmd
    };
    cmd.arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match cmd.output().await {
        Ok(output) => format_output(&output),
        Err(e) => {
            tracing::warn!("Failed to start shell for {:?}: {}", command, e);
            format!("Error: {}", e)
        }
    }
}

fn format_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        combined
    } else {
        format!("Error: {}\nOutput: {}", output.status, combined)
    }
}

/// Host summary answered to `INFO`
pub fn host_info() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    format!(
        "Hostname: {}\nOS: {}\nArch: {}\nUser: {}\nDirectory: {}\n",
        hostname,
        std::env::consts::OS,
        std::env::consts::ARCH,
        user,
        cwd
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_combines_output() {
        let output = execute("echo out; echo err 1>&2").await;
        assert_eq!(output, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_execute_reports_failure() {
        let output = execute("echo partial; exit 3").await;
        assert!(output.starts_with("Error: exit status: 3\nOutput: "));
        assert!(output.contains("partial"));
    }

    #[test]
    fn test_host_info_fields() {
        let info = host_info();
        assert!(info.contains(&format!("OS: {}", std::env::consts::OS)));
        assert!(info.contains("Hostname: "));
        assert!(info.contains("Directory: "));
    }
}
