//! Child process execution with a timeout, bounded capture and an optional
//! stdout tee file.
//!
//! On Unix the child leads its own process group and a timeout kills the
//! whole group, so wrapper scripts cannot leave a grandchild holding the pipes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::errors::SpawnError;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Run `cmd` with stdin closed, killing it after `timeout`.
///
/// Both pipes are drained on reader threads so a chatty child cannot block.
/// At most `output_limit_bytes` of each stream is kept in memory. When `tee`
/// is set, every stdout line is also written (and flushed) to that file as it
/// arrives, untruncated.
///
/// A command that cannot be started at all yields [`SpawnError`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, tee = tee.is_some()))]
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee_writer = match tee {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create output file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(program = %program, err = %err, "failed to spawn command");
            return Err(SpawnError {
                command: program,
                reason: err.to_string(),
            }
            .into());
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        thread::spawn(move || read_lines_with_tee(stdout, output_limit_bytes, tee_writer));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let elapsed = started.elapsed();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// SIGKILL the child's process group.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Group already gone; reap the leader normally.
        Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            warn!(pgid, err = %err, "killpg failed, killing child only");
            child.kill().context("kill command")
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn keep_within(collected: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let remaining = limit.saturating_sub(collected.len());
    let keep = chunk.len().min(remaining);
    collected.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
}

fn read_lines_with_tee<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = tee.as_mut()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            // Capture keeps going; losing the tee only costs observability.
            warn!(err = %err, "failed to write output file");
            tee = None;
        }
        truncated += keep_within(&mut collected, &line, limit);
    }

    Ok((collected, truncated))
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        truncated += keep_within(&mut collected, &chunk[..n], limit);
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = run_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            1024,
            None,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_with_timeout(sh("exec sleep 5"), Duration::from_millis(100), 1024, None)
            .expect("run");
        assert!(output.timed_out);
        assert!(output.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        // `sh` forks `sleep` instead of exec'ing it, so the sleeper inherits stdout.
        let started = Instant::now();
        let output = run_with_timeout(
            sh("sleep 5; true"),
            Duration::from_millis(200),
            1024,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert!(output.elapsed >= Duration::from_millis(200));
    }

    #[test]
    fn truncates_capture_but_tees_everything() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("nested").join("001.log");
        let output = run_with_timeout(
            sh("printf 'abcdef\\nghij\\n'"),
            Duration::from_secs(10),
            4,
            Some(&tee),
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 7);
        assert_eq!(std::fs::read_to_string(&tee).expect("tee"), "abcdef\nghij\n");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = run_with_timeout(
            Command::new("autopilot-definitely-not-a-real-binary"),
            Duration::from_secs(1),
            1024,
            None,
        )
        .unwrap_err();
        let spawn = err.downcast_ref::<SpawnError>().expect("spawn error");
        assert_eq!(spawn.command, "autopilot-definitely-not-a-real-binary");
    }
}
