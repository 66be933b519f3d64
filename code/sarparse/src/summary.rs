/// The end-of-run report: for every metric, whether it was written completely, written with some
/// problems, or not written at all, and what went wrong.
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    /// Every file decoded and every artifact written.
    Complete,

    /// At least one artifact written, but some file failed to decode or some artifact failed.
    Degraded,

    /// Nothing written.
    Failed,
}

impl Status {
    fn name(&self) -> &'static str {
        match self {
            Status::Complete => "complete",
            Status::Degraded => "degraded",
            Status::Failed => "failed",
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricReport {
    pub metric: String,
    pub rows: usize,

    /// Paths of the artifacts written.
    pub written: Vec<String>,

    /// Failed pairs and artifacts, and the reason for having nothing to write.
    pub problems: Vec<String>,
}

impl MetricReport {
    pub fn new(metric: &str, rows: usize) -> MetricReport {
        MetricReport {
            metric: metric.to_string(),
            rows,
            ..Default::default()
        }
    }

    pub fn status(&self) -> Status {
        if self.written.is_empty() {
            Status::Failed
        } else if self.problems.is_empty() {
            Status::Complete
        } else {
            Status::Degraded
        }
    }
}

pub fn print_summary(output: &mut dyn io::Write, reports: &[MetricReport]) -> io::Result<()> {
    let count = |s: Status| reports.iter().filter(|r| r.status() == s).count();
    writeln!(
        output,
        "Summary: {} complete, {} degraded, {} failed",
        count(Status::Complete),
        count(Status::Degraded),
        count(Status::Failed)
    )?;
    for r in reports {
        writeln!(
            output,
            "  {}: {} ({} rows, {} files)",
            r.metric,
            r.status().name(),
            r.rows,
            r.written.len()
        )?;
        for p in &r.problems {
            writeln!(output, "    {p}")?;
        }
    }
    Ok(())
}

/// The run succeeds if anything at all was written.
pub fn exit_ok(reports: &[MetricReport]) -> bool {
    reports.iter().any(|r| !r.written.is_empty())
}

#[cfg(test)]
fn report(metric: &str, written: &[&str], problems: &[&str]) -> MetricReport {
    let mut r = MetricReport::new(metric, 10);
    r.written = written.iter().map(|s| s.to_string()).collect();
    r.problems = problems.iter().map(|s| s.to_string()).collect();
    r
}

#[test]
fn test_status() {
    assert!(report("io", &["io.csv"], &[]).status() == Status::Complete);
    let timeout = "sa02: memory: decoder timed out after 60s";
    assert!(report("memory", &["memory.csv"], &[timeout]).status() == Status::Degraded);
    assert!(report("tty", &[], &["no data"]).status() == Status::Failed);
    assert!(report("tty", &[], &[]).status() == Status::Failed);
}

#[test]
fn test_exit_ok() {
    assert!(!exit_ok(&[]));
    assert!(!exit_ok(&[report("tty", &[], &["no data"])]));
    assert!(exit_ok(&[
        report("tty", &[], &["no data"]),
        report("memory", &["memory.csv"], &["x"])
    ]));
}

#[test]
fn test_print_summary() {
    let reports = vec![
        report("io", &["io.csv"], &[]),
        report("memory", &["memory.csv"], &["sa02: memory: decoder timed out after 60s"]),
        report("tty", &[], &["no data in any file"]),
    ];
    let mut out = Vec::new();
    print_summary(&mut out, &reports).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines[0] == "Summary: 1 complete, 1 degraded, 1 failed");
    assert!(lines[1] == "  io: complete (10 rows, 1 files)");
    assert!(lines[2] == "  memory: degraded (10 rows, 1 files)");
    assert!(lines[3] == "    sa02: memory: decoder timed out after 60s");
    assert!(lines[4] == "  tty: failed (10 rows, 0 files)");
    assert!(lines[5] == "    no data in any file");
}
