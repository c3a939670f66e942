//! Toolchain invocation with a time limit. The child is always reaped,
//! including when the limit is hit.

use crate::error::BuildError;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a finished toolchain run
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    /// stdout followed by stderr, as produced
    pub output: String,
}

/// Printable form of a command line
pub fn render(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(command.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run `command` to completion or until `limit` elapses
pub fn run_bounded(command: &mut Command, limit: Duration) -> Result<Finished, BuildError> {
    let rendered = render(command);
    debug!(command = %rendered, "running");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BuildError::MissingToolchain(command.get_program().to_string_lossy().into_owned()),
            _ => BuildError::io(command.get_program(), e),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= limit => {
                warn!(command = %rendered, ?limit, "toolchain timed out, killing it");
                kill(&mut child);
                return Err(BuildError::Timeout {
                    command: rendered,
                    limit,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill(&mut child);
                return Err(BuildError::io(command.get_program(), e));
            }
        }
    };

    let mut output = stdout.join().unwrap_or_default();
    output.push_str(&stderr.join().unwrap_or_default());
    debug!(command = %rendered, %status, elapsed = ?started.elapsed(), "finished");
    Ok(Finished { status, output })
}

/// Read a pipe on its own thread so a chatty child cannot block on it
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                text = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        text
    })
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn output_of_both_streams_is_captured() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let finished = run_bounded(&mut command, Duration::from_secs(10)).unwrap();
        assert_eq!(finished.status.code(), Some(3));
        assert!(finished.output.contains("out"));
        assert!(finished.output.contains("err"));
    }

    #[test]
    fn slow_commands_are_killed() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let started = Instant::now();
        let error = run_bounded(&mut command, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(error, BuildError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_executables_are_reported_by_name() {
        let mut command = Command::new("pyaot-no-such-compiler");
        let error = run_bounded(&mut command, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(error, BuildError::MissingToolchain(name) if name == "pyaot-no-such-compiler"));
    }
}
