// Run the external decoder with a timeout and safe handling of the communication.
//
// The decoder is a black box: we give it an activity file and an activity selector and get text
// back.  Everything about the pipeline that needs a decoder goes through the `Decoder` trait so
// that tests can substitute canned output.

use crate::{Error, MetricDef};

use log::debug;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use subprocess::{Exec, ExitStatus, Redirection};

pub trait Decoder: Sync {
    /// Decode the activity selected by `metric` from `file` and return the decoder's textual
    /// output.  Fails with DecodeTimeout or Decode.
    fn decode(&self, file: &str, metric: &MetricDef) -> Result<String, Error>;
}

/// The sysstat `sadf` decoder, producing semicolon-separated output (`sadf -d`).

pub struct Sadf {
    program: String,
    timeout: Duration,
}

impl Sadf {
    pub fn new(program: &str, timeout: Duration) -> Sadf {
        Sadf {
            program: program.to_string(),
            timeout,
        }
    }
}

impl Decoder for Sadf {
    fn decode(&self, file: &str, metric: &MetricDef) -> Result<String, Error> {
        let mut args = vec!["-d", file, "--"];
        args.extend_from_slice(metric.selector);
        debug!("Running {} {}", self.program, args.join(" "));
        match run_with_timeout(&self.program, &args, self.timeout) {
            Ok(output) => Ok(output),
            Err(RunError::TimedOut) => Err(Error::DecodeTimeout {
                file: file.to_string(),
                metric: metric.name.to_string(),
                seconds: self.timeout.as_secs(),
            }),
            Err(RunError::Failed(reason)) => Err(Error::Decode {
                file: file.to_string(),
                metric: metric.name.to_string(),
                reason,
            }),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum RunError {
    TimedOut,
    Failed(String),
}

/// Run `program` with `args`, without a shell, and return its stdout if it exits with status 0
/// within `timeout`.  Output on stderr does not by itself signal failure (sadf warns about
/// things) but is returned as the failure reason if the program fails.

pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, RunError> {
    let mut p = match Exec::cmd(program)
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .popen()
    {
        Ok(p) => p,
        Err(e) => {
            return Err(RunError::Failed(format!("Could not start {program}: {e}")));
        }
    };

    // There is a limited capacity in the pipe.  When the pipe fills up the child stops, which
    // means that we'll time out if we wait for termination before reading; sadf produces a lot of
    // output for a day's worth of samples.  So drain both pipes while waiting, and bound the time
    // we're willing to spend doing that.  See
    //
    //   https://github.com/rust-lang/rust/issues/45572

    let mut comm = p.communicate_start(None).limit_time(timeout);
    match comm.read_string() {
        Ok((stdout, stderr)) => match p.wait() {
            Ok(ExitStatus::Exited(0)) => Ok(stdout.unwrap_or_default()),
            Ok(status) => {
                let stderr = stderr.unwrap_or_default();
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Err(RunError::Failed(format!("{:?}", status)))
                } else {
                    Err(RunError::Failed(format!("{:?}: {}", status, stderr)))
                }
            }
            Err(e) => Err(RunError::Failed(e.to_string())),
        },
        Err(e) => {
            // Whatever happened, the child must not outlive us.
            let _ = p.kill();
            let _ = p.wait();
            if e.error.kind() == io::ErrorKind::TimedOut {
                Err(RunError::TimedOut)
            } else {
                Err(RunError::Failed(e.error.to_string()))
            }
        }
    }
}

/// Locate the decoder program: a name containing a `/` is taken as a path, anything else is looked
/// up in PATH.

pub fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let p = Path::new(name);
        return if p.is_file() {
            Some(p.to_path_buf())
        } else {
            None
        };
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[test]
fn test_run_ok() {
    let out = run_with_timeout("echo", &["hello", "world"], Duration::from_secs(10)).unwrap();
    assert!(out == "hello world\n");
}

#[test]
fn test_run_nonzero_exit() {
    match run_with_timeout("false", &[], Duration::from_secs(10)) {
        Err(RunError::Failed(_)) => {}
        _ => assert!(false),
    }
}

#[test]
fn test_run_stderr_is_reason() {
    match run_with_timeout("sh", &["-c", "echo broken >&2; exit 3"], Duration::from_secs(10)) {
        Err(RunError::Failed(reason)) => assert!(reason.contains("broken")),
        _ => assert!(false),
    }
}

#[test]
fn test_run_timeout() {
    let r = run_with_timeout("sleep", &["10"], Duration::from_millis(300));
    assert!(r == Err(RunError::TimedOut));
}

#[test]
fn test_run_missing_program() {
    match run_with_timeout("/nonexistent/sadf", &[], Duration::from_secs(1)) {
        Err(RunError::Failed(_)) => {}
        _ => assert!(false),
    }
}

#[test]
fn test_find_program() {
    assert!(find_program("sh").is_some());
    assert!(find_program("/bin/sh").is_some());
    assert!(find_program("no-such-program-anywhere").is_none());
    assert!(find_program("/nonexistent/sadf").is_none());
}

#[test]
fn test_sadf_invocation() {
    // Stand in for sadf with programs that don't know its arguments.
    let metric = crate::catalog::lookup("memory").unwrap();

    let bad = Sadf::new("sleep", Duration::from_secs(10));
    // `sleep -d` is a usage error.
    match bad.decode("sa01", metric) {
        Err(Error::Decode { file, metric, .. }) => {
            assert!(file == "sa01");
            assert!(metric == "memory");
        }
        _ => assert!(false),
    }

    let ok = Sadf::new("echo", Duration::from_secs(10));
    let out = ok.decode("sa01", metric).unwrap();
    assert!(out == "-d sa01 -- -r ALL\n");
}
