use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::peer::PeerChannel;
use crate::protocol::JobRequest;

const COPY_BUFFER: usize = 8 * 1024;

/// Set in every job's environment so nested submissions find their parent.
pub const JOB_ID_ENV: &str = "WAVA_JOB_ID";

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: u64,
    /// Process exit code, or `128 + signal` when killed by a signal.
    pub exit_code: i32,
    pub signal: Option<i32>,
}

impl ExecutionResult {
    pub fn from_status(job_id: u64, status: ExitStatus) -> Self {
        let signal = status.signal();
        let exit_code = status
            .code()
            .or_else(|| signal.map(|s| 128 + s))
            .unwrap_or(-1);
        Self {
            job_id,
            exit_code,
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Launches job processes and pipes their output to the submitting peer.
///
/// Jobs run directly from their argv (no shell) in their own process group
/// so the whole tree can be signalled at once. The environment is exactly
/// the one carried by the request.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor;

impl JobExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn spawn(&self, job_id: u64, request: &JobRequest) -> io::Result<Child> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        Command::new(program)
            .args(args)
            .current_dir(&request.working_directory)
            .env_clear()
            .envs(&request.environment)
            .env(JOB_ID_ENV, job_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
    }

    /// Stream the child's output to `peer` until it exits.
    ///
    /// Both copy tasks are joined before returning, so every byte the job
    /// wrote has been forwarded by the time the result is available.
    pub async fn supervise(&self, job_id: u64, mut child: Child, peer: Arc<PeerChannel>) -> ExecutionResult {
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(copy_output(out, peer.clone(), OutputStream::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(copy_output(err, peer.clone(), OutputStream::Stderr)));

        let status = child.wait().await;

        for handle in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = handle.await {
                tracing::warn!(job_id, error = %e, "output copy task failed");
            }
        }

        match status {
            Ok(status) => {
                let result = ExecutionResult::from_status(job_id, status);
                tracing::info!(
                    job_id,
                    exit_code = result.exit_code,
                    signal = ?result.signal,
                    "Job process exited"
                );
                result
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to wait for job process");
                ExecutionResult {
                    job_id,
                    exit_code: -1,
                    signal: None,
                }
            }
        }
    }
}

async fn copy_output<R>(mut reader: R, peer: Arc<PeerChannel>, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut forwarding = true;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(request_id = peer.id(), error = %e, "job output read failed");
                break;
            }
        };
        // Keep draining after the peer is gone so the job never blocks on a full pipe.
        if forwarding {
            forwarding = match stream {
                OutputStream::Stdout => peer.write_stdout(&buf[..n]).await,
                OutputStream::Stderr => peer.write_stderr(&buf[..n]).await,
            };
        }
    }
}
