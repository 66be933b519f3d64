/// The extraction pipeline: decode and parse every (file, metric) pair, merge the rows per metric,
/// then normalize, filter and pivot each metric's table.
///
/// Pairs are independent and are run on a thread pool of `jobs` threads.  Each pair carries the
/// index of its file on the command line as its sequence number, and the aggregator resolves
/// overlaps by that number only, so the order in which pairs complete is irrelevant.
///
/// Failures of a pair (timeout, decoder failure, unintelligible output) are logged and recorded
/// with the metric; they never stop the other pairs.
use crate::parser::parse_records;
use crate::pivot::{build_pivot, PivotedTable};
use crate::window::{filter_window, normalize};
use crate::{Aggregator, Decoder, Error, MetricDef, MetricTable, Row};

use log::{info, warn};
use rayon::prelude::*;
use rustutils::{LocalZone, Timestamp};

#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of concurrent decoder invocations, at least 1.
    pub jobs: usize,

    /// The zone for decoder timestamps that carry no zone.
    pub zone: LocalZone,

    /// Inclusive window bounds.
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

#[derive(Debug)]
pub struct PairFailure {
    pub file: String,
    pub error: Error,
}

/// The outcome for one metric.

pub struct Extraction {
    pub metric: &'static MetricDef,

    /// Finalized, normalized and filtered.
    pub table: MetricTable,

    /// One per pivot field declared for the metric, in declaration order.
    pub pivots: Vec<PivotedTable>,

    /// The files that contributed rows, in command line order.
    pub sources: Vec<String>,

    pub failures: Vec<PairFailure>,

    /// Lines dropped by the parser across all files.
    pub dropped: usize,
}

impl Extraction {
    /// True if some file produced data for the metric.  A metric without data is not written.

    pub fn has_data(&self) -> bool {
        !self.sources.is_empty()
    }

    /// True if some (file, metric) pair failed.

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct Decoded {
    rows: Vec<Row>,
    dropped: usize,
}

/// Run the pipeline for `files` (in command line order) and `metrics`, returning one Extraction
/// per metric in the order of `metrics`.  Fails only if the thread pool can't be created.

pub fn extract<D: Decoder>(
    decoder: &D,
    files: &[String],
    metrics: &[&'static MetricDef],
    opts: &Options,
) -> Result<Vec<Extraction>, Error> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs)
        .build()
        .map_err(|e| Error::Config(format!("Could not create worker pool: {e}")))?;

    let tasks = files
        .iter()
        .enumerate()
        .flat_map(|(seq, file)| metrics.iter().map(move |m| (seq, file.as_str(), *m)))
        .collect::<Vec<(usize, &str, &'static MetricDef)>>();

    let zone = opts.zone;
    let results = pool.install(|| {
        tasks
            .par_iter()
            .map(|&(seq, file, metric)| {
                let result = decode_pair(decoder, file, metric, zone);
                (seq, file, metric, result)
            })
            .collect::<Vec<_>>()
    });

    let mut aggregator = Aggregator::new();
    let mut extractions = metrics
        .iter()
        .map(|&m| Extraction {
            metric: m,
            table: MetricTable::new(m),
            pivots: vec![],
            sources: vec![],
            failures: vec![],
            dropped: 0,
        })
        .collect::<Vec<Extraction>>();

    for (seq, file, metric, result) in results {
        // Invariant: every task's metric is in `metrics`.
        let Some(ex) = extractions.iter_mut().find(|ex| ex.metric.name == metric.name) else {
            continue;
        };
        match result {
            Ok(decoded) => {
                ex.dropped += decoded.dropped;
                if !decoded.rows.is_empty() {
                    ex.sources.push(file.to_string());
                    aggregator.merge(metric, seq, decoded.rows);
                }
            }
            Err(error) => {
                warn!("{error}");
                ex.failures.push(PairFailure {
                    file: file.to_string(),
                    error,
                });
            }
        }
    }

    for ex in extractions.iter_mut() {
        let mut table = aggregator.take(ex.metric);
        normalize(&mut table);
        filter_window(&mut table, opts.from, opts.to);
        ex.pivots = ex
            .metric
            .pivots()
            .iter()
            .map(|field| build_pivot(&table, field))
            .collect();
        info!(
            "{}: {} rows from {} file(s), {} failure(s)",
            ex.metric.name,
            table.len(),
            ex.sources.len(),
            ex.failures.len()
        );
        ex.table = table;
    }

    Ok(extractions)
}

fn decode_pair<D: Decoder>(
    decoder: &D,
    file: &str,
    metric: &'static MetricDef,
    zone: LocalZone,
) -> Result<Decoded, Error> {
    info!("Decoding {} from {}", metric.name, file);
    let text = decoder.decode(file, metric)?;
    let mut records = parse_records(&text, file, metric, zone);
    let rows = (&mut records).collect::<Result<Vec<Row>, Error>>()?;
    Ok(Decoded {
        rows,
        dropped: records.dropped(),
    })
}

#[cfg(test)]
use crate::catalog::lookup;
#[cfg(test)]
use chrono::FixedOffset;
#[cfg(test)]
use rustutils::timestamp_from_ymdhms;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
enum Canned {
    Text(String),
    Slow(u64, String),
    Timeout,
    Fail,
}

// Canned decoder output keyed by (file, metric name); a missing key decodes to nothing.
#[cfg(test)]
struct FakeDecoder {
    outputs: HashMap<(String, String), Canned>,
}

#[cfg(test)]
impl FakeDecoder {
    fn new() -> FakeDecoder {
        FakeDecoder {
            outputs: HashMap::new(),
        }
    }

    fn with(mut self, file: &str, metric: &str, c: Canned) -> FakeDecoder {
        self.outputs.insert((file.to_string(), metric.to_string()), c);
        self
    }
}

#[cfg(test)]
impl Decoder for FakeDecoder {
    fn decode(&self, file: &str, metric: &MetricDef) -> Result<String, Error> {
        match self.outputs.get(&(file.to_string(), metric.name.to_string())) {
            None => Ok(String::new()),
            Some(Canned::Text(s)) => Ok(s.clone()),
            Some(Canned::Slow(ms, s)) => {
                std::thread::sleep(Duration::from_millis(*ms));
                Ok(s.clone())
            }
            Some(Canned::Timeout) => Err(Error::DecodeTimeout {
                file: file.to_string(),
                metric: metric.name.to_string(),
                seconds: 60,
            }),
            Some(Canned::Fail) => Err(Error::Decode {
                file: file.to_string(),
                metric: metric.name.to_string(),
                reason: "exit status 1".to_string(),
            }),
        }
    }
}

#[cfg(test)]
fn memory_output(times_and_values: &[(&str, u32)]) -> String {
    let mut s = "# hostname;interval;timestamp;kbmemfree;kbavail\n".to_string();
    for (t, v) in times_and_values {
        s += &format!("node1;600;2024-01-01 {t} UTC;{v};{v}\n");
    }
    s
}

#[cfg(test)]
fn options(jobs: usize) -> Options {
    Options {
        jobs,
        zone: LocalZone::Fixed(FixedOffset::east_opt(0).unwrap()),
        from: None,
        to: None,
    }
}

#[cfg(test)]
fn files(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_timeout_degrades_metric() {
    let memory = lookup("memory").unwrap();
    let disk = lookup("disk").unwrap();
    let fake = FakeDecoder::new()
        .with("sa01", "memory", Canned::Text(memory_output(&[("00:10:01", 1), ("00:20:01", 2)])))
        .with("sa02", "memory", Canned::Timeout)
        .with("sa01", "disk", Canned::Fail);
    let result = extract(&fake, &files(&["sa01", "sa02"]), &[disk, memory], &options(2)).unwrap();
    assert!(result.len() == 2);

    let d = &result[0];
    assert!(d.metric.name == "disk");
    assert!(!d.has_data());
    assert!(d.failures.len() == 1);
    assert!(d.pivots.len() == 2);

    let m = &result[1];
    assert!(m.metric.name == "memory");
    assert!(m.has_data());
    assert!(m.is_degraded());
    assert!(m.sources == vec!["sa01".to_string()]);
    assert!(m.table.len() == 2);
    match &m.failures[0] {
        PairFailure {
            file,
            error: Error::DecodeTimeout { .. },
        } => assert!(file == "sa02"),
        _ => assert!(false),
    }
}

#[test]
fn test_completion_order_is_irrelevant() {
    let memory = lookup("memory").unwrap();
    for (slow_first, slow_second) in [(300, 0), (0, 300)] {
        let fake = FakeDecoder::new()
            .with(
                "sa01",
                "memory",
                Canned::Slow(slow_first, memory_output(&[("00:10:01", 1), ("00:20:01", 1)])),
            )
            .with(
                "sa02",
                "memory",
                Canned::Slow(slow_second, memory_output(&[("00:20:01", 2), ("00:30:01", 2)])),
            );
        let result = extract(&fake, &files(&["sa01", "sa02"]), &[memory], &options(2)).unwrap();
        let vals = result[0]
            .table
            .rows()
            .map(|r| r.get("kbmemfree").unwrap())
            .collect::<Vec<f64>>();
        assert!(vals == vec![1.0, 2.0, 2.0]);
        assert!(!result[0].is_degraded());
    }
}

#[test]
fn test_parse_failure_is_isolated() {
    let memory = lookup("memory").unwrap();
    let fake = FakeDecoder::new()
        .with("sa01", "memory", Canned::Text("node1;600;2024-01-01 00:10:01 UTC;1;1\n".to_string()))
        .with("sa02", "memory", Canned::Text(memory_output(&[("00:10:01", 7)])));
    let result = extract(&fake, &files(&["sa01", "sa02"]), &[memory], &options(1)).unwrap();
    let m = &result[0];
    assert!(m.table.len() == 1);
    assert!(m.failures.len() == 1);
    match m.failures[0].error {
        Error::Parse { .. } => {}
        _ => assert!(false),
    }
}

#[test]
fn test_window_and_normalization() {
    let memory = lookup("memory").unwrap();
    let fake = FakeDecoder::new().with(
        "sa01",
        "memory",
        Canned::Text(
            "# hostname;interval;timestamp;kbmemfree\n\
             node1;600;2024-01-01 06:00:00 +0100;1\n\
             node1;600;2024-01-01 06:00:00 UTC;2\n\
             node1;600;2024-01-01 07:00:00;3\n"
                .to_string(),
        ),
    );
    let mut opts = options(1);
    let t = timestamp_from_ymdhms(2024, 1, 1, 6, 0, 0);
    opts.from = Some(t);
    opts.to = Some(t);
    let result = extract(&fake, &files(&["sa01"]), &[memory], &opts).unwrap();
    let m = &result[0];
    assert!(m.table.len() == 1);
    let r = m.table.rows().next().unwrap();
    assert!(r.get("kbmemfree") == Some(2.0));
    assert!(r.timestamp.offset().local_minus_utc() == 0);
}

#[test]
fn test_pivots_built() {
    let disk = lookup("disk").unwrap();
    let fake = FakeDecoder::new().with(
        "sa01",
        "disk",
        Canned::Text(
            "# hostname;interval;timestamp;DEV;tps;%util\n\
             node1;600;2024-01-01 00:10:01 UTC;sda;1.0;2.0\n\
             node1;600;2024-01-01 00:10:01 UTC;sdb;3.0;4.0\n"
                .to_string(),
        ),
    );
    let result = extract(&fake, &files(&["sa01"]), &[disk], &options(1)).unwrap();
    let d = &result[0];
    assert!(d.pivots.len() == 2);
    assert!(d.pivots[0].field.as_str() == "tps");
    assert!(d.pivots[1].field.as_str() == "%util");
    assert!(d.pivots[1].rows[0].1 == vec![Some(2.0), Some(4.0)]);
}
