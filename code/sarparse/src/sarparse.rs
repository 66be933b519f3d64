/// `sarparse` -- Convert sysstat activity files to per-metric csv and json tables
///
/// Run with --help for brief help.
///
/// Every metric in the catalog (or the subset selected with --metric) is extracted from every
/// activity file with `sadf`, the rows for a metric are merged across the files, and the result is
/// written as one table per metric plus one wide table per declared pivot field.
///
/// Quirks
///
/// The order of the activity files on the command line matters: where two files cover the same
/// instant, the data from the file given later is used.  Normally that is what you want when you
/// list the files oldest first, as `sa*` globs in a day-numbered directory tend to do.
///
/// --from and --to are in local time, as is decoder output without a zone.  "Local" is the
/// machine's zone unless --utc-offset says otherwise, which is what you want when processing
/// files from another machine.  A bare date for --to means the end of that day.
///
/// A metric that is not recorded in any of the files produces no output and is reported as
/// failed, even though nothing is wrong.  Use --metric to ask for what is actually recorded.
mod format;
mod summary;

use anyhow::{bail, Result};
use clap::Parser;
use format::Format;
use log::warn;
use rustutils::{parse_local_time, parse_utc_offset, read_run_config, LocalZone, RunConfig};
use sarlog::{Extraction, MetricDef, Options, Sadf};
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use summary::MetricReport;

const EXIT_HELP: &str = "\
Exit status:
  0 if at least one output file was written, even if some metrics or files failed
  1 if nothing was written, or if the arguments or configuration are invalid

A summary of what was written and what failed is printed on stderr.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = EXIT_HELP)]
pub struct Cli {
    /// Activity files to process, oldest first; where files overlap in time the later file wins
    #[arg(required_unless_present = "list_metrics")]
    source_files: Vec<String>,

    /// Output format (repeatable) [default: from config file]
    #[arg(long, short, value_enum)]
    format: Vec<Format>,

    /// Directory for the output files, created if absent [default: named after the first format]
    #[arg(long, short)]
    output_dir: Option<String>,

    /// Seconds to wait for one decoder invocation [default: 60]
    #[arg(long, short)]
    timeout: Option<u64>,

    /// Keep samples at this time and later.  Local time, YYYY-MM-DD or YYYY-MM-DD HH:MM[:SS]
    /// [default: no limit]
    #[arg(long)]
    from: Option<String>,

    /// Keep samples at this time and earlier.  Local time, YYYY-MM-DD or YYYY-MM-DD HH:MM[:SS]
    /// [default: no limit]
    #[arg(long)]
    to: Option<String>,

    /// Offset of local time from UTC, eg +01:00 [default: this machine's time zone]
    #[arg(long)]
    utc_offset: Option<String>,

    /// Extract this metric (repeatable) [default: all, see --list-metrics]
    #[arg(long, short)]
    metric: Vec<String>,

    /// Number of decoder invocations to run concurrently [default: 1]
    #[arg(long, short)]
    jobs: Option<usize>,

    /// The decoder program [default: $SARPARSE_DECODER, or sadf]
    #[arg(long)]
    decoder: Option<String>,

    /// File containing JSON data with settings; command line switches override it [default: none]
    #[arg(long)]
    config_file: Option<String>,

    /// Print the metrics that can be extracted, and exit
    #[arg(long, default_value_t = false)]
    list_metrics: bool,

    /// Report progress on stderr
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

/// The validated settings for a run.

#[derive(Debug)]
struct Settings {
    files: Vec<String>,
    formats: Vec<Format>,
    output_dir: PathBuf,
    decoder: String,
    timeout: u64,
    metrics: Vec<&'static MetricDef>,
    options: Options,
}

const DEFAULT_DECODER: &str = "sadf";
const DEFAULT_TIMEOUT: u64 = 60;
const DEFAULT_JOBS: usize = 1;

fn main() {
    match sarparse() {
        Ok(true) => {}
        Ok(false) => {
            process::exit(1);
        }
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

// Returns Ok(false) if the run completed but nothing was written.
fn sarparse() -> Result<bool> {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli.list_metrics {
        list_metrics();
        return Ok(true);
    }

    let config = if let Some(ref filename) = cli.config_file {
        match read_run_config(filename) {
            Ok(c) => c,
            Err(e) => bail!("Could not read config file {filename}: {e}"),
        }
    } else {
        RunConfig::default()
    };
    let settings = make_settings(&cli, &config, env::var("SARPARSE_DECODER").ok())?;

    let decoder = Sadf::new(&settings.decoder, Duration::from_secs(settings.timeout));
    let extractions = sarlog::extract(
        &decoder,
        &settings.files,
        &settings.metrics,
        &settings.options,
    )?;

    let reports = extractions
        .iter()
        .map(|ex| write_extraction(ex, &settings))
        .collect::<Vec<MetricReport>>();

    summary::print_summary(&mut io::stderr(), &reports)?;
    Ok(summary::exit_ok(&reports))
}

fn list_metrics() {
    for m in sarlog::all_metrics() {
        let mut line = format!("{:16} {}", m.name, m.selector.join(" "));
        if let Some(entity) = m.entity() {
            line += &format!("  (per {entity})");
        }
        if !m.pivots().is_empty() {
            line += &format!("  pivots: {}", m.pivots().join(", "));
        }
        println!("{line}");
    }
}

/// Merge the command line and the config file (the command line wins), apply defaults, and check
/// everything that can be checked before any decoding starts.

fn make_settings(cli: &Cli, config: &RunConfig, env_decoder: Option<String>) -> Result<Settings> {
    let formats = if !cli.format.is_empty() {
        cli.format.clone()
    } else {
        let mut formats = vec![];
        for name in &config.formats {
            match Format::from_name(name) {
                Some(f) => formats.push(f),
                None => bail!("Unknown format '{name}'"),
            }
        }
        formats
    };
    if formats.is_empty() {
        bail!("No output format selected");
    }

    for file in &cli.source_files {
        if !PathBuf::from(file).is_file() {
            bail!("File {file} does not exist or is not a file");
        }
    }

    let decoder = cli
        .decoder
        .clone()
        .or_else(|| config.decoder.clone())
        .or(env_decoder)
        .unwrap_or_else(|| DEFAULT_DECODER.to_string());
    if sarlog::find_program(&decoder).is_none() {
        bail!("Decoder {decoder} not found");
    }

    let timeout = cli.timeout.or(config.timeout).unwrap_or(DEFAULT_TIMEOUT);
    if timeout == 0 {
        bail!("Timeout must be at least 1 second");
    }
    let jobs = cli.jobs.or(config.jobs).unwrap_or(DEFAULT_JOBS);
    if jobs == 0 {
        bail!("Jobs must be at least 1");
    }

    let zone = match cli.utc_offset.as_ref().or(config.utc_offset.as_ref()) {
        Some(s) => match parse_utc_offset(s) {
            Ok(off) => LocalZone::Fixed(off),
            Err(e) => bail!("Bad UTC offset '{s}': {e}"),
        },
        None => LocalZone::System,
    };
    let from = match cli.from {
        Some(ref s) => match parse_local_time(s, &zone, false) {
            Ok(t) => Some(t),
            Err(e) => bail!("Bad --from time '{s}': {e}"),
        },
        None => None,
    };
    let to = match cli.to {
        Some(ref s) => match parse_local_time(s, &zone, true) {
            Ok(t) => Some(t),
            Err(e) => bail!("Bad --to time '{s}': {e}"),
        },
        None => None,
    };

    let include = if !cli.metric.is_empty() {
        &cli.metric
    } else {
        &config.metrics
    };
    let metrics = sarlog::select(include, &config.exclude_metrics)?;
    if metrics.is_empty() {
        bail!("No metrics selected");
    }

    let output_dir = PathBuf::from(
        cli.output_dir
            .clone()
            .or_else(|| config.output_dir.clone())
            .unwrap_or_else(|| formats[0].extension().to_string()),
    );
    if let Err(e) = fs::create_dir_all(&output_dir) {
        bail!(
            "Unable to create output directory {}: {e}",
            output_dir.display()
        );
    }

    Ok(Settings {
        files: cli.source_files.clone(),
        formats,
        output_dir,
        decoder,
        timeout,
        metrics,
        options: Options {
            jobs,
            zone,
            from,
            to,
        },
    })
}

/// Write the table and the pivots of one metric in every format.  Failures are recorded in the
/// report, not returned.

fn write_extraction(ex: &Extraction, settings: &Settings) -> MetricReport {
    let mut report = MetricReport::new(ex.metric.name, ex.table.len());
    for f in &ex.failures {
        report.problems.push(f.error.to_string());
    }
    if !ex.has_data() {
        if ex.failures.is_empty() {
            report.problems.push("no data in any file".to_string());
        }
        return report;
    }

    let mut grids = vec![(None, format::long_grid(&ex.table))];
    for p in &ex.pivots {
        grids.push((Some(p.field.as_str()), format::pivot_grid(p)));
    }

    for fmt in &settings.formats {
        for (field, grid) in &grids {
            let name = format::artifact_name(ex.metric.name, *field, *fmt);
            match format::write_grid(grid, &settings.output_dir, &name, *fmt) {
                Ok(path) => report.written.push(path.display().to_string()),
                Err(e) => {
                    warn!("{e}");
                    report.problems.push(e.to_string());
                }
            }
        }
    }
    report
}

#[cfg(test)]
fn scratch_file(dir: &tempfile::TempDir, name: &str) -> String {
    let p = dir.path().join(name);
    fs::write(&p, "").unwrap();
    p.display().to_string()
}

#[test]
fn test_settings_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let sa01 = scratch_file(&dir, "sa01");
    let out = dir.path().join("out").display().to_string();
    let cli = Cli::try_parse_from([
        "sarparse",
        "-f",
        "json",
        "-o",
        out.as_str(),
        "--decoder",
        "sh",
        sa01.as_str(),
    ])
    .unwrap();
    let s = make_settings(&cli, &RunConfig::default(), None).unwrap();
    assert!(s.files == vec![sa01]);
    assert!(s.formats == vec![Format::Json]);
    assert!(s.timeout == 60);
    assert!(s.options.jobs == 1);
    assert!(s.options.zone == LocalZone::System);
    assert!(s.options.from.is_none() && s.options.to.is_none());
    assert!(s.metrics.len() == sarlog::all_metrics().len());
    assert!(PathBuf::from(&out).is_dir());
}

#[test]
fn test_settings_cli_overrides_config() {
    let dir = tempfile::tempdir().unwrap();
    let sa01 = scratch_file(&dir, "sa01");
    let out = dir.path().join("out").display().to_string();
    let config = RunConfig {
        decoder: Some("/nonexistent/sadf".to_string()),
        timeout: Some(5),
        jobs: Some(8),
        utc_offset: Some("+02:00".to_string()),
        metrics: vec!["memory".to_string(), "disk".to_string(), "tty".to_string()],
        exclude_metrics: vec!["tty".to_string()],
        formats: vec!["json".to_string()],
        output_dir: Some(out.clone()),
    };
    let cli = Cli::try_parse_from([
        "sarparse",
        "--decoder",
        "sh",
        "-t",
        "10",
        "--utc-offset",
        "+01:00",
        "--from",
        "2024-01-01 06:00",
        "--to",
        "2024-01-01",
        sa01.as_str(),
    ])
    .unwrap();
    let s = make_settings(&cli, &config, Some("/also/nonexistent".to_string())).unwrap();
    assert!(s.decoder == "sh");
    assert!(s.timeout == 10);
    assert!(s.options.jobs == 8);
    assert!(s.formats == vec![Format::Json]);
    assert!(s.metrics.iter().map(|m| m.name).collect::<Vec<&str>>() == vec!["disk", "memory"]);
    assert!(s.output_dir == PathBuf::from(&out));
    assert!(s.options.from == Some(rustutils::timestamp_from_ymdhms(2024, 1, 1, 5, 0, 0)));
    assert!(s.options.to == Some(rustutils::timestamp_from_ymdhms(2024, 1, 1, 22, 59, 59)));
}

#[test]
fn test_settings_errors() {
    let dir = tempfile::tempdir().unwrap();
    let sa01 = scratch_file(&dir, "sa01");
    let missing = dir.path().join("sa02").display().to_string();
    let out = dir.path().join("out").display().to_string();
    let none = RunConfig::default();
    let check_with = |decoder: &str, args: &[&str]| {
        let mut argv = vec!["sarparse", "-o", out.as_str(), "--decoder", decoder];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        make_settings(&cli, &none, None).is_err()
    };
    let check = |args: &[&str]| check_with("sh", args);

    // No format
    assert!(check(&[sa01.as_str()]));
    // Missing file
    assert!(check(&["-f", "csv", missing.as_str()]));
    // Unknown metric
    assert!(check(&["-f", "csv", "-m", "cpu_util", sa01.as_str()]));
    // Bad window bound
    assert!(check(&["-f", "csv", "--from", "yesterday", sa01.as_str()]));
    // Bad offset
    assert!(check(&["-f", "csv", "--utc-offset", "CET", sa01.as_str()]));
    // Zero jobs
    assert!(check(&["-f", "csv", "-j", "0", sa01.as_str()]));
    // Decoder not found
    assert!(check_with("/nonexistent/sadf", &["-f", "csv", sa01.as_str()]));
    assert!(check_with("no-such-decoder-anywhere", &["-f", "csv", sa01.as_str()]));
    // And finally something that works
    assert!(!check(&["-f", "csv", sa01.as_str()]));
}

#[test]
fn test_cli_rejects_repeated_decoder() {
    let argv = ["sarparse", "--decoder", "sh", "--decoder", "sadf", "sa01"];
    assert!(Cli::try_parse_from(argv).is_err());
}

#[test]
fn test_cli_requires_files() {
    assert!(Cli::try_parse_from(["sarparse", "-f", "csv"]).is_err());
    assert!(Cli::try_parse_from(["sarparse", "--list-metrics"]).is_ok());
    assert!(Cli::try_parse_from(["sarparse", "-f", "xml", "sa01"]).is_err());
}
