/// Parser for the semicolon-separated output of `sadf -d`.
///
/// The output looks like this (one activity group shown):
///
///   # hostname;interval;timestamp;CPU;%user;%nice;%system;%iowait;%steal;%idle
///   node1;600;2024-01-01 00:10:01 UTC;-1;1.23;0.00;0.45;0.10;0.00;98.22
///   node1;600;2024-01-01 00:10:01 UTC;0;1.50;0.00;0.40;0.12;0.00;97.98
///
/// NOTE:
///
/// - A header line starts with `#` and names the fields of the lines that follow it, up to the
///   next header.  Some selectors produce several groups with different headers.
///
/// - The timestamp is a local time optionally followed by a zone.  sadf prints UTC unless told
///   otherwise; without a zone we apply the configured local zone.
///
/// - Restart markers (the system was rebooted) and comment records are not data and are skipped.
///
/// - A line with a bad timestamp or the wrong number of fields is dropped with a warning, it does
///   not invalidate the output.  A data line that is not governed by a usable header does: that
///   means we don't understand the output at all.
///
/// - Values that are not numbers are missing, not zero.
///
/// Parsing is lazy: `Records` yields rows as it walks the text, once.  After a parse error it
/// yields nothing more.
use crate::{Error, MetricDef, Row};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use log::warn;
use rustutils::{parse_utc_offset, LocalZone};
use std::str::{FromStr, Lines};
use ustr::Ustr;

const FIELD_SEPARATOR: char = ';';

struct Header {
    hostname_ix: usize,
    timestamp_ix: usize,
    entity_ix: Option<usize>,
    num_fields: usize,
    /// (index, name) for every other field.
    values: Vec<(usize, Ustr)>,
}

pub struct Records<'a> {
    lines: Lines<'a>,
    lineno: usize,
    file: &'a str,
    metric: &'a MetricDef,
    zone: LocalZone,
    header: Option<Header>,
    dropped: usize,
    done: bool,
}

/// Parse decoder output `text` for `metric` from activity file `file`.  The file name is used for
/// messages only.

pub fn parse_records<'a>(
    text: &'a str,
    file: &'a str,
    metric: &'a MetricDef,
    zone: LocalZone,
) -> Records<'a> {
    Records {
        lines: text.lines(),
        lineno: 0,
        file,
        metric,
        zone,
        header: None,
        dropped: 0,
        done: false,
    }
}

impl<'a> Records<'a> {
    /// The number of lines dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn parse_error(&mut self, reason: String) -> Option<Result<Row, Error>> {
        self.done = true;
        Some(Err(Error::Parse {
            file: self.file.to_string(),
            metric: self.metric.name.to_string(),
            reason: format!("line {}: {}", self.lineno, reason),
        }))
    }

    fn drop_line(&mut self, reason: &str) {
        self.dropped += 1;
        warn!(
            "{}: {}: line {}: {}, row dropped",
            self.file, self.metric.name, self.lineno, reason
        );
    }

    fn parse_header(&self, line: &str) -> Result<Header, String> {
        let names = line
            .trim_start_matches('#')
            .trim()
            .split(FIELD_SEPARATOR)
            .map(|s| s.trim())
            .collect::<Vec<&str>>();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(format!("empty field name in header at position {i}"));
            }
            if names[..i].contains(name) {
                return Err(format!("duplicate field '{name}' in header"));
            }
        }
        let find = |name: &str| names.iter().position(|n| *n == name);
        let hostname_ix = find("hostname").ok_or("no 'hostname' field in header")?;
        let timestamp_ix = find("timestamp").ok_or("no 'timestamp' field in header")?;
        let entity_ix = match self.metric.entity() {
            Some(entity) => match find(entity) {
                Some(ix) => Some(ix),
                None => return Err(format!("no '{entity}' field in header")),
            },
            None => None,
        };
        let values = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != hostname_ix && *i != timestamp_ix && Some(*i) != entity_ix)
            .map(|(i, name)| (i, Ustr::from(name)))
            .collect::<Vec<(usize, Ustr)>>();
        Ok(Header {
            hostname_ix,
            timestamp_ix,
            entity_ix,
            num_fields: names.len(),
            values,
        })
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                Some(l) => l,
                None => {
                    self.done = true;
                    return None;
                }
            };
            self.lineno += 1;

            if line.trim().is_empty() {
                continue;
            }

            if line.starts_with('#') {
                match self.parse_header(line) {
                    Ok(h) => self.header = Some(h),
                    Err(reason) => return self.parse_error(reason),
                }
                continue;
            }

            if is_marker(line) {
                continue;
            }

            let fields = line.split(FIELD_SEPARATOR).collect::<Vec<&str>>();
            let header = match self.header {
                Some(ref h) => h,
                None => return self.parse_error("data before header".to_string()),
            };

            if fields.len() != header.num_fields {
                let reason = format!(
                    "{} fields where the header has {}",
                    fields.len(),
                    header.num_fields
                );
                self.drop_line(&reason);
                continue;
            }

            let timestamp = match parse_decoder_time(fields[header.timestamp_ix], &self.zone) {
                Some(t) => t,
                None => {
                    let reason = format!("bad timestamp {:?}", fields[header.timestamp_ix]);
                    self.drop_line(&reason);
                    continue;
                }
            };

            let entity = header
                .entity_ix
                .map(|ix| Ustr::from(self.metric.rename_entity(fields[ix].trim())));

            let values = header
                .values
                .iter()
                .map(|(ix, name)| (*name, get_f64(fields[*ix])))
                .collect::<Vec<(Ustr, Option<f64>)>>();

            return Some(Ok(Row {
                timestamp,
                hostname: Ustr::from(fields[header.hostname_ix].trim()),
                entity,
                values,
            }));
        }
    }
}

// sadf marks reboots with a LINUX-RESTART record and comments (sar -C) with a COM record, in the
// position of the first data field.
fn is_marker(line: &str) -> bool {
    line.split(FIELD_SEPARATOR)
        .nth(3)
        .map(|f| f.starts_with("LINUX-RESTART") || f.starts_with("COM "))
        .unwrap_or(false)
}

/// Parse "YYYY-MM-DD HH:MM:SS", optionally followed by a zone, into a zoned time.  A zone that is
/// absent or not an offset we understand is taken to be `zone`.

pub fn parse_decoder_time(s: &str, zone: &LocalZone) -> Option<DateTime<FixedOffset>> {
    let mut parts = s.split_whitespace();
    let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(parts.next()?, "%H:%M:%S").ok()?;
    let naive = date.and_time(time);
    let offset = match parts.next() {
        Some(z) => match parse_utc_offset(z) {
            Ok(off) => off,
            Err(_) => zone.offset_at(&naive)?,
        },
        None => zone.offset_at(&naive)?,
    };
    if parts.next().is_some() {
        return None;
    }
    offset.from_local_datetime(&naive).single()
}

fn get_f64(s: &str) -> Option<f64> {
    match f64::from_str(s.trim()) {
        Ok(n) if n.is_finite() => Some(n),
        _ => None,
    }
}

#[cfg(test)]
use crate::catalog::lookup;

#[cfg(test)]
fn utc() -> LocalZone {
    LocalZone::Fixed(FixedOffset::east_opt(0).unwrap())
}

#[test]
fn test_parse_decoder_time() {
    let cet = LocalZone::Fixed(FixedOffset::east_opt(3600).unwrap());

    let t = parse_decoder_time("2024-01-01 00:10:01 UTC", &cet).unwrap();
    assert!(t.offset().local_minus_utc() == 0);
    assert!(t.to_rfc3339() == "2024-01-01T00:10:01+00:00");

    let t = parse_decoder_time("2024-01-01 01:10:01", &cet).unwrap();
    assert!(t.offset().local_minus_utc() == 3600);
    assert!(t == parse_decoder_time("2024-01-01 00:10:01 UTC", &cet).unwrap());

    let t = parse_decoder_time("2024-01-01 01:10:01 +0100", &utc()).unwrap();
    assert!(t.offset().local_minus_utc() == 3600);

    // Zone abbreviations are not offsets, fall back to the configured zone
    let t = parse_decoder_time("2024-01-01 01:10:01 CET", &cet).unwrap();
    assert!(t.offset().local_minus_utc() == 3600);

    assert!(parse_decoder_time("2024-01-01", &cet).is_none());
    assert!(parse_decoder_time("2024-01-01 25:00:00", &cet).is_none());
    assert!(parse_decoder_time("01/01/24 10:00:00", &cet).is_none());
    assert!(parse_decoder_time("2024-01-01 01:10:01 UTC extra", &cet).is_none());
}

#[test]
fn test_parse_scalar() {
    let text = "\
# hostname;interval;timestamp;kbmemfree;kbavail;%memused
node1;600;2024-01-01 00:10:01 UTC;1000;2000;12.25
node1;600;2024-01-01 00:20:01 UTC;1100;;12.5
";
    let metric = lookup("memory").unwrap();
    let rows = parse_records(text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .unwrap();
    assert!(rows.len() == 2);
    assert!(rows[0].entity.is_none());
    assert!(rows[0].hostname.as_str() == "node1");
    assert!(rows[0].get("interval") == Some(600.0));
    assert!(rows[0].get("kbmemfree") == Some(1000.0));
    assert!(rows[0].get("%memused") == Some(12.25));
    assert!(rows[0].values.len() == 4);
    // Empty is missing, not zero
    assert!(rows[1].get("kbavail").is_none());
    assert!(rows[1].values.iter().any(|(n, v)| n.as_str() == "kbavail" && v.is_none()));
}

#[test]
fn test_parse_keyed_with_rename() {
    let text = std::fs::read_to_string("../tests/sarlog/per_cpu.txt").unwrap();
    let metric = lookup("per_cpu").unwrap();
    let rows = parse_records(&text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .unwrap();
    assert!(rows.len() == 9);
    assert!(rows[0].entity.unwrap().as_str() == "all");
    assert!(rows[1].entity.unwrap().as_str() == "0");
    assert!(rows[1].get("%idle") == Some(97.98));
    assert!(rows[0].get("CPU").is_none());
}

#[test]
fn test_parse_skips_markers_and_bad_lines() {
    let text = std::fs::read_to_string("../tests/sarlog/memory-restart.txt").unwrap();
    let metric = lookup("memory").unwrap();
    let mut records = parse_records(&text, "sa01", metric, utc());
    let rows = (&mut records)
        .collect::<Result<Vec<Row>, Error>>()
        .unwrap();
    // Three good rows; one restart marker skipped; one bad timestamp and one short line dropped.
    assert!(rows.len() == 3);
    assert!(records.dropped() == 2);
    assert!(rows[2].get("kbmemfree") == Some(1300.0));
}

#[test]
fn test_parse_multiple_groups() {
    let text = "\
# hostname;interval;timestamp;runq-sz;plist-sz;ldavg-1
node1;600;2024-01-01 00:10:01 UTC;1;200;0.5
# hostname;interval;timestamp;%scpu-10;%scpu-60
node1;600;2024-01-01 00:10:01 UTC;0.1;0.2
";
    let metric = lookup("queue").unwrap();
    let rows = parse_records(text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .unwrap();
    assert!(rows.len() == 2);
    assert!(rows[0].get("ldavg-1") == Some(0.5));
    assert!(rows[1].get("%scpu-60") == Some(0.2));
    assert!(rows[1].get("ldavg-1").is_none());
}

#[test]
fn test_parse_errors() {
    let metric = lookup("memory").unwrap();

    // Data before header
    let text = "node1;600;2024-01-01 00:10:01 UTC;1000\n";
    let mut records = parse_records(text, "sa01", metric, utc());
    match records.next() {
        Some(Err(Error::Parse { file, metric, .. })) => {
            assert!(file == "sa01");
            assert!(metric == "memory");
        }
        _ => assert!(false),
    }
    assert!(records.next().is_none());

    // No timestamp in header
    let text = "# hostname;interval;kbmemfree\nnode1;600;1000\n";
    assert!(parse_records(text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .is_err());

    // Duplicate field name
    let text = "# hostname;interval;timestamp;x;x\n";
    assert!(parse_records(text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .is_err());

    // Keyed metric without its entity column
    let disk = lookup("disk").unwrap();
    let text = "# hostname;interval;timestamp;tps\nnode1;600;2024-01-01 00:10:01 UTC;3.5\n";
    assert!(parse_records(text, "sa01", disk, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .is_err());

    // Empty output is not an error, just no data
    assert!(parse_records("", "sa01", metric, utc()).next().is_none());
}

#[test]
fn test_parse_preserves_precision() {
    let text = "\
# hostname;interval;timestamp;a;b;c
node1;600;2024-01-01 00:10:01 UTC;0.1;123456789.987654321;1e-7
";
    let metric = lookup("memory").unwrap();
    let rows = parse_records(text, "sa01", metric, utc())
        .collect::<Result<Vec<Row>, Error>>()
        .unwrap();
    for (name, src) in [("a", "0.1"), ("b", "123456789.987654321"), ("c", "1e-7")] {
        let v = rows[0].get(name).unwrap();
        // Printing and re-reading gives back the identical value.
        assert!(f64::from_str(&v.to_string()).unwrap() == f64::from_str(src).unwrap());
    }
}
