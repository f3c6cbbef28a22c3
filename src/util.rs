use std::env;
use std::io;
use std::process::Command as ProcessCommand;

use chrono::Utc;

pub(crate) fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub(crate) fn now_ts_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env_optional(name) {
        Some(value) => Ok(value
            .parse::<u64>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid {name}")))?),
        None => Ok(default),
    }
}

pub(crate) fn build_shell_command(command: &str) -> ProcessCommand {
    let mut cmd = if cfg!(windows) {
        let mut c = ProcessCommand::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = ProcessCommand::new("sh");
        c.arg("-c").arg(command);
        c
    };

    // Process group isolation: the child becomes its own process group leader
    // so a timeout can kill the entire tree without affecting the parent.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Kill a child process and its entire process group.
/// On Unix, sends SIGTERM first for graceful shutdown, then SIGKILL after 2 seconds.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_secs(2));
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => unsafe {
            libc::killpg(pid, libc::SIGKILL);
        },
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Combine captured stdout/stderr into one detail string, surfacing stderr
/// when the command failed.
pub(crate) fn subprocess_output_text(stdout: &str, stderr: &str, is_error: bool) -> String {
    if is_error {
        let mut out = String::new();
        if !stdout.is_empty() {
            out.push_str(stdout);
        }
        if !stderr.is_empty() {
            if !out.is_empty() {
                out.push_str("\n--- stderr ---\n");
            }
            out.push_str(stderr);
        }
        if out.is_empty() {
            "Command failed with no output.".to_string()
        } else {
            out
        }
    } else if stdout.is_empty() && !stderr.is_empty() {
        // Some tools write informational output to stderr even on success
        stderr.to_string()
    } else if stdout.is_empty() {
        "Command executed.".to_string()
    } else {
        stdout.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprocess_output_text_failure_combines_streams() {
        let text = subprocess_output_text("partial", "boom", true);
        assert!(text.contains("partial"));
        assert!(text.contains("boom"));
        assert!(text.contains("--- stderr ---"));
    }

    #[test]
    fn test_subprocess_output_text_success_prefers_stdout() {
        assert_eq!(subprocess_output_text("ok", "noise", false), "ok");
        assert_eq!(subprocess_output_text("", "note", false), "note");
        assert_eq!(subprocess_output_text("", "", false), "Command executed.");
    }
}
