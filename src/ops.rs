//! Host command execution.
//!
//! Every external tool (podman, ostree, systemctl, recert, butane,
//! coreos-installer) goes through [`CommandRunner`] so stage handlers and the
//! restorer can be tested without touching the host.

use async_trait::async_trait;
use tracing::debug;

use crate::error::IbuError;

/// Runs a command and returns its trimmed stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, IbuError>;
}

/// Runs commands on the host, optionally through `nsenter` into PID 1's namespaces.
#[derive(Debug, Clone, Default)]
pub struct HostCommandRunner {
    nsenter: bool,
}

impl HostCommandRunner {
    /// Run commands directly in the current namespaces.
    pub const fn local() -> Self {
        Self { nsenter: false }
    }

    /// Run commands in the host namespaces from inside a privileged container.
    pub const fn host() -> Self {
        Self { nsenter: true }
    }

    fn command(&self, program: &str, args: &[&str]) -> tokio::process::Command {
        if self.nsenter {
            let mut cmd = tokio::process::Command::new("nsenter");
            cmd.args(["--target", "1", "--cgroup", "--mount", "--ipc", "--pid", "--"]);
            cmd.arg(program).args(args);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, IbuError> {
        debug!("Running: {} {}", program, args.join(" "));

        let output = self
            .command(program, args)
            .output()
            .await
            .map_err(|e| IbuError::tool(program, format!("failed to execute: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IbuError::tool(
                program,
                format!("{} failed ({}): {}", args.join(" "), output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted `CommandRunner` that records every invocation.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::CommandRunner;
    use crate::error::IbuError;

    type Responder = Box<dyn Fn(&str) -> Option<Result<String, String>> + Send + Sync>;

    /// Replies with the first matching responder; unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        responders: Vec<Responder>,
    }

    impl RecordingRunner {
        /// Reply to commands whose rendered line starts with `prefix`.
        pub fn respond(mut self, prefix: &str, reply: Result<&str, &str>) -> Self {
            let prefix = prefix.to_string();
            let reply = reply.map(str::to_string).map_err(str::to_string);
            self.responders.push(Box::new(move |line| {
                line.starts_with(&prefix).then(|| reply.clone())
            }));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn ran(&self, prefix: &str) -> bool {
            self.calls().iter().any(|c| c.starts_with(prefix))
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String, IbuError> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().unwrap().push(line.clone());
            match self.responders.iter().find_map(|r| r(&line)) {
                Some(Ok(out)) => Ok(out),
                Some(Err(msg)) => Err(IbuError::tool(program, msg)),
                None => Ok(String::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[tokio::test]
    async fn test_local_runner_captures_stdout() {
        let out = HostCommandRunner::local()
            .run("echo", &["hello", "world"])
            .await
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_local_runner_reports_failure() {
        let err = HostCommandRunner::local()
            .run("false", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, IbuError::ExternalTool { ref tool, .. } if tool == "false"));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_error() {
        let err = HostCommandRunner::local()
            .run("definitely-not-a-real-binary-ibu", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to execute"));
    }

    #[test]
    fn test_host_runner_wraps_nsenter() {
        let cmd = HostCommandRunner::host().command("ostree", &["admin", "status"]);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "nsenter");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args.last().map(String::as_str), Some("status"));
        assert!(args.contains(&"ostree".to_string()));
    }

    #[tokio::test]
    async fn test_recording_runner_scripts_replies() {
        let runner = RecordingRunner::default()
            .respond("ostree admin status", Ok("* rhcos 1234.0"))
            .respond("systemctl", Err("reboot refused"));
        assert_eq!(
            runner.run("ostree", &["admin", "status"]).await.unwrap(),
            "* rhcos 1234.0"
        );
        assert!(runner.run("systemctl", &["reboot"]).await.is_err());
        assert_eq!(runner.run("podman", &["ps"]).await.unwrap(), "");
        assert_eq!(runner.calls().len(), 3);
        assert!(runner.ran("podman ps"));
    }
}
