//! The remote exec channel contract (spec §4.1): run a shell command on a
//! physical host or container and return its exit status and captured
//! output. The channel does no quoting — callers join sub-commands with
//! `;` themselves, exactly as `ovn_utils.py::PhysCtl`/`Node.build_cmd`
//! build one opaque command string per call.
//!
//! The concrete SSH/exec mechanics are an external collaborator per the
//! system's scope (spec §1); `ShellTransport` is a working reference
//! implementation so the rest of the harness has something real to run
//! against, and `RecordingTransport` is a test double used throughout the
//! workspace's unit tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use oh_util::error::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct RunOpts {
    /// When set, stdout is also written to this path (mirrors the
    /// Python API's `stdout=` file handle parameter).
    pub stdout_path: Option<PathBuf>,
    pub timeout: Duration,
    /// When true, a non-zero exit status is reported as an error rather
    /// than returned in `RunOutput::exit` for the caller to inspect.
    pub check: bool,
}

impl Default for RunOpts {
    fn default() -> RunOpts {
        RunOpts { stdout_path: None, timeout: Duration::from_secs(60), check: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command on a named host. Implementations must be reusable and
/// safe for concurrent calls to *different* hosts; serializing mutating
/// calls to the same host is the caller's responsibility (spec §4.1).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run(&self, host: &str, cmd: &str, opts: RunOpts) -> Result<RunOutput, Error>;
}

/// Shells out over SSH to remote hosts, and directly to a local shell for
/// `"localhost"`. No per-host state is kept, so concurrent calls to
/// different hosts never contend.
#[derive(Debug, Default)]
pub struct ShellTransport;

#[async_trait]
impl Transport for ShellTransport {
    async fn run(&self, host: &str, cmd: &str, opts: RunOpts) -> Result<RunOutput, Error> {
        let mut command = if host == "localhost" {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        } else {
            let mut c = Command::new("ssh");
            c.arg(host).arg(cmd);
            c
        };
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command.spawn().map_err(|e| Error::Transport {
            host: host.to_string(),
            cmd: cmd.to_string(),
            source: e.into(),
        })?;

        let output = tokio::time::timeout(opts.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(opts.timeout))?
            .map_err(|e| Error::Transport {
                host: host.to_string(),
                cmd: cmd.to_string(),
                source: e.into(),
            })?;

        let exit = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if let Some(path) = &opts.stdout_path {
            let mut file = tokio::fs::File::create(path).await.map_err(|e| Error::Transport {
                host: host.to_string(),
                cmd: cmd.to_string(),
                source: e.into(),
            })?;
            file.write_all(stdout.as_bytes()).await.map_err(|e| Error::Transport {
                host: host.to_string(),
                cmd: cmd.to_string(),
                source: e.into(),
            })?;
        }

        if opts.check && exit != 0 {
            return Err(Error::Transport {
                host: host.to_string(),
                cmd: cmd.to_string(),
                source: anyhow::anyhow!("command exited {exit}: {stderr}"),
            });
        }

        Ok(RunOutput { exit, stdout, stderr })
    }
}

/// A `PhysicalNode` is the shared handle both `CentralNode` and
/// `WorkerNode` hold in `oh-workload`: a host name paired with the
/// transport used to reach it, plus the `global.log_cmds` flag that
/// governs whether every invocation is logged at `info` (matching
/// `ovn_sandbox.PhysicalNode(worker, global_cfg.log_cmds)`).
#[derive(Clone)]
pub struct PhysicalNode {
    pub host: String,
    pub log_cmds: bool,
    /// `Arc` rather than `Box` so worker/cluster state can be cheaply
    /// cloned into the concurrent tasks a rate-governed test phase spawns.
    transport: std::sync::Arc<dyn Transport>,
}

impl PhysicalNode {
    pub fn new(host: impl Into<String>, log_cmds: bool, transport: std::sync::Arc<dyn Transport>) -> PhysicalNode {
        PhysicalNode { host: host.into(), log_cmds, transport }
    }

    pub async fn run(&self, cmd: &str, opts: RunOpts) -> Result<RunOutput, Error> {
        if self.log_cmds {
            tracing::info!(host = %self.host, cmd, "running command");
        }
        self.transport.run(&self.host, cmd, opts).await
    }
}

/// Test doubles, kept un-cfg-gated so downstream crates can use them in
/// their own `#[cfg(test)]` modules.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation instead of touching the network; used by
    /// unit tests throughout the workspace.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<(String, String)>>,
        pub response: RunOutput,
    }

    impl RecordingTransport {
        pub fn new(response: RunOutput) -> RecordingTransport {
            RecordingTransport { calls: Mutex::new(Vec::new()), response }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn run(&self, host: &str, cmd: &str, _opts: RunOpts) -> Result<RunOutput, Error> {
            self.calls.lock().unwrap().push((host.to_string(), cmd.to_string()));
            Ok(self.response.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    #[tokio::test]
    async fn records_exact_command_string_without_quoting() {
        let transport = RecordingTransport::new(RunOutput::default());
        let node = PhysicalNode::new("worker-1", false, std::sync::Arc::new(transport));
        node.run("echo a; echo b", RunOpts::default()).await.unwrap();
    }

    #[tokio::test]
    async fn local_shell_runs_and_captures_stdout() {
        let node = PhysicalNode::new("localhost", false, std::sync::Arc::new(ShellTransport));
        let out = node.run("echo hello", RunOpts::default()).await.unwrap();
        assert_eq!(out.exit, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let node = PhysicalNode::new("localhost", false, std::sync::Arc::new(ShellTransport));
        let opts = RunOpts { timeout: Duration::from_millis(20), ..Default::default() };
        let err = node.run("sleep 1", opts).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
