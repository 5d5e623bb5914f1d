//! Runs a task's command via `sh -c`, streaming its output line by line.

use std::io::BufRead;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::Context;

use crate::logger::Logger;

/// Spawns `sh -c <command>` and forwards each line of stdout and stderr to
/// the logger under the task's prefix.  Returns an error if the process
/// can't be spawned, its output can't be read, or it exits non-zero.
pub fn run_command(
    task_id: &str,
    command: &str,
    dir: Option<&Path>,
    logger: &Logger,
) -> anyhow::Result<()> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("start task {}", task_id))?;
    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();

    // Both pipes must be drained while the child runs, or a chatty command
    // blocks on a full pipe.
    let (out_res, err_res) = std::thread::scope(|s| {
        let out = s.spawn(|| stream_lines(task_id, stdout, logger));
        let err = s.spawn(|| stream_lines(task_id, stderr, logger));
        (out.join().unwrap(), err.join().unwrap())
    });

    let status = child
        .wait()
        .with_context(|| format!("wait for task {}", task_id))?;

    out_res.with_context(|| format!("read output for task {}", task_id))?;
    err_res.with_context(|| format!("read output for task {}", task_id))?;

    if !status.success() {
        anyhow::bail!("execute task {}: {}", task_id, status);
    }
    Ok(())
}

/// Reads `r` to EOF, logging each line (one trailing `\n`/`\r\n` stripped).
fn stream_lines(task_id: &str, r: impl std::io::Read, logger: &Logger) -> std::io::Result<()> {
    let reader = std::io::BufReader::new(r);
    for line in reader.lines() {
        logger.task_line(task_id, &line?);
    }
    Ok(())
}
