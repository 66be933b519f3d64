/// Output of merged and pivoted tables as csv or json files.
///
/// A table is first laid out as a `Grid`: named columns and rows of cells, where a cell is text, a
/// number, or empty.  The grid is then serialized in the requested format:
///
/// - csv: a header row with the column names, then one record per row; empty cells are empty
///   fields
///
/// - json: an array of objects, one per row, with the column names as keys in column order; empty
///   cells are null
///
/// Numbers are printed with the shortest representation that reads back as the same value, so no
/// precision is lost or invented.
///
/// Every artifact is written to a temporary file in the output directory and then renamed into
/// place, so a file with the artifact's name is always complete, and an existing file is replaced,
/// never appended to.
use anyhow::Result;
use chrono::Utc;
use clap::ValueEnum;
use sarlog::{Error, MetricTable, PivotedTable};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Csv,
    Json,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
        }
    }

    /// The format named `s`, as in a config file.
    pub fn from_name(s: &str) -> Option<Format> {
        match s {
            "csv" => Some(Format::Csv),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

pub struct Grid {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

fn timestamp_cell<Tz: chrono::TimeZone>(t: &chrono::DateTime<Tz>) -> Cell {
    Cell::Text(
        t.with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string(),
    )
}

fn number_cell(v: Option<f64>) -> Cell {
    match v {
        Some(n) => Cell::Number(n),
        None => Cell::Empty,
    }
}

/// Lay out a merged table: timestamp, hostname, the entity column for keyed metrics, and then the
/// union of the table's value fields in the order they were first seen.  The fields of rows that a
/// time window removed still get their column.

pub fn long_grid(table: &MetricTable) -> Grid {
    let entity = table.metric().entity();
    let fields = table.fields();

    let mut columns = vec!["timestamp".to_string(), "hostname".to_string()];
    if let Some(e) = entity {
        columns.push(e.to_string());
    }
    columns.extend(fields.iter().map(|f| f.to_string()));

    let rows = table
        .rows()
        .map(|r| {
            let mut cells = vec![timestamp_cell(&r.timestamp), Cell::Text(r.hostname.to_string())];
            if entity.is_some() {
                cells.push(match r.entity {
                    Some(e) => Cell::Text(e.to_string()),
                    None => Cell::Empty,
                });
            }
            cells.extend(fields.iter().map(|f| number_cell(r.get(f.as_str()))));
            cells
        })
        .collect::<Vec<Vec<Cell>>>();

    Grid { columns, rows }
}

/// Lay out a pivoted table: timestamp, then one column per entity.

pub fn pivot_grid(p: &PivotedTable) -> Grid {
    let mut columns = vec!["timestamp".to_string()];
    columns.extend(p.entities.iter().map(|e| e.to_string()));
    let rows = p
        .rows
        .iter()
        .map(|(t, vals)| {
            let mut cells = vec![timestamp_cell(t)];
            cells.extend(vals.iter().map(|v| number_cell(*v)));
            cells
        })
        .collect::<Vec<Vec<Cell>>>();
    Grid { columns, rows }
}

/// The file name for a metric's table, or for one of its pivots if `field` is present.  Field
/// names are things like "%util" and "rxkB/s" and are made safe for file systems.

pub fn artifact_name(metric: &str, field: Option<&str>, format: Format) -> String {
    match field {
        None => format!("{}.{}", metric, format.extension()),
        Some(f) => format!("{}-{}.{}", metric, safe_name(f), format.extension()),
    }
}

fn safe_name(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        match c {
            '%' => result += "pct_",
            '/' => result += "_per_",
            c if c.is_ascii_alphanumeric() => result.push(c),
            _ => result.push('_'),
        }
    }
    result
}

/// Write `grid` as `name` in `dir`, creating `dir` if necessary, and return the path written.

pub fn write_grid(grid: &Grid, dir: &Path, name: &str, format: Format) -> Result<PathBuf, Error> {
    let path = dir.join(name);
    let write_error = |reason: String| Error::Write {
        path: path.display().to_string(),
        reason,
    };

    fs::create_dir_all(dir).map_err(|e| write_error(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| write_error(e.to_string()))?;
    {
        let mut output = io::BufWriter::new(tmp.as_file_mut());
        let r = match format {
            Format::Csv => format_csv(&mut output, grid),
            Format::Json => format_json(&mut output, grid),
        };
        r.and_then(|_| Ok(output.flush()?))
            .map_err(|e| write_error(e.to_string()))?;
    }
    tmp.persist(&path)
        .map_err(|e| write_error(e.error.to_string()))?;
    Ok(path)
}

fn format_csv(output: &mut dyn io::Write, grid: &Grid) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().from_writer(output);
    writer.write_record(&grid.columns)?;
    for row in &grid.rows {
        let fields = row
            .iter()
            .map(|c| match c {
                Cell::Text(s) => s.clone(),
                Cell::Number(n) => n.to_string(),
                Cell::Empty => String::new(),
            })
            .collect::<Vec<String>>();
        writer.write_record(fields)?;
    }
    writer.flush()?;
    Ok(())
}

fn format_json(output: &mut dyn io::Write, grid: &Grid) -> Result<()> {
    let mut objects = vec![];
    for row in &grid.rows {
        let mut obj = serde_json::Map::new();
        for (name, c) in grid.columns.iter().zip(row.iter()) {
            let v = match c {
                Cell::Text(s) => Value::String(s.clone()),
                Cell::Number(n) => match serde_json::Number::from_f64(*n) {
                    Some(n) => Value::Number(n),
                    None => Value::Null,
                },
                Cell::Empty => Value::Null,
            };
            obj.insert(name.clone(), v);
        }
        objects.push(Value::Object(obj));
    }
    serde_json::to_writer(output, &Value::Array(objects))?;
    Ok(())
}

#[cfg(test)]
use chrono::{DateTime, FixedOffset};
#[cfg(test)]
use chrono::TimeZone;
#[cfg(test)]
use sarlog::{build_pivot, filter_window, lookup, normalize, Row};
#[cfg(test)]
use std::str::FromStr;
#[cfg(test)]
use ustr::Ustr;

#[cfg(test)]
fn disk_table() -> MetricTable {
    let mut table = MetricTable::new(lookup("disk").unwrap());
    let t = |s: &str| DateTime::<FixedOffset>::parse_from_rfc3339(s).unwrap();
    let row = |ts: &str, dev: &str, vals: Vec<(&str, Option<f64>)>| Row {
        timestamp: t(ts),
        hostname: Ustr::from("node1"),
        entity: Some(Ustr::from(dev)),
        values: vals
            .into_iter()
            .map(|(n, v)| (Ustr::from(n), v))
            .collect(),
    };
    table.merge(
        0,
        vec![
            row("2024-01-01T01:10:01+01:00", "sda", vec![("tps", Some(1.5)), ("%util", Some(0.1))]),
            row("2024-01-01T01:10:01+01:00", "sdb", vec![("tps", Some(0.0))]),
            row("2024-01-01T01:20:01+01:00", "sda", vec![("tps", None), ("await", Some(2.25))]),
        ],
    );
    table.finalize();
    normalize(&mut table);
    table
}

#[test]
fn test_artifact_name() {
    assert!(artifact_name("memory", None, Format::Csv) == "memory.csv");
    assert!(artifact_name("disk", Some("%util"), Format::Json) == "disk-pct_util.json");
    assert!(
        artifact_name("network_dev", Some("rxkB/s"), Format::Csv) == "network_dev-rxkB_per_s.csv"
    );
    assert!(artifact_name("queue", Some("ldavg-1"), Format::Csv) == "queue-ldavg_1.csv");
}

#[test]
fn test_long_grid() {
    let g = long_grid(&disk_table());
    assert!(g.columns == vec!["timestamp", "hostname", "DEV", "tps", "%util", "await"]);
    assert!(g.rows.len() == 3);
    assert!(g.rows[0][0] == Cell::Text("2024-01-01T00:10:01Z".to_string()));
    assert!(g.rows[0][2] == Cell::Text("sda".to_string()));
    assert!(g.rows[0][3] == Cell::Number(1.5));
    // sdb has no %util, the second sda row has a missing tps
    assert!(g.rows[1][4] == Cell::Empty);
    assert!(g.rows[2][3] == Cell::Empty);
    assert!(g.rows[2][5] == Cell::Number(2.25));
}

#[test]
fn test_write_csv() {
    let dir = tempfile::tempdir().unwrap();
    let table = disk_table();
    let path = write_grid(&long_grid(&table), dir.path(), "disk.csv", Format::Csv).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 4);
    assert!(lines[0] == "timestamp,hostname,DEV,tps,%util,await");
    assert!(lines[1] == "2024-01-01T00:10:01Z,node1,sda,1.5,0.1,");
    assert!(lines[2] == "2024-01-01T00:10:01Z,node1,sdb,0,,");
    assert!(lines[3] == "2024-01-01T00:20:01Z,node1,sda,,,2.25");
}

#[test]
fn test_write_json_pivot() {
    let dir = tempfile::tempdir().unwrap();
    let table = disk_table();
    let p = build_pivot(&table, "tps");
    let name = artifact_name("disk", Some("tps"), Format::Json);
    let path = write_grid(&pivot_grid(&p), dir.path(), &name, Format::Json).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let v = serde_json::from_str::<Value>(&text).unwrap();
    assert!(v.as_array().unwrap().len() == 2);
    assert!(v[0]["timestamp"] == "2024-01-01T00:10:01Z");
    assert!(v[0]["sda"].as_f64() == Some(1.5));
    assert!(v[0]["sdb"].as_f64() == Some(0.0));
    // Missing is null, not zero
    assert!(v[1]["sda"].is_null());
    assert!(v[1]["sdb"].is_null());
    assert!(v[1].as_object().unwrap().contains_key("sdb"));
    // Keys are in column order
    assert!(text.starts_with(r#"[{"timestamp":"2024-01-01T00:10:01Z","sda":1.5,"sdb":0.0}"#));
}

#[test]
fn test_write_overwrites_and_creates_dir() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a").join("b");
    let grid = Grid {
        columns: vec!["x".to_string()],
        rows: vec![vec![Cell::Number(1.0)], vec![Cell::Number(2.0)]],
    };
    write_grid(&grid, &out, "t.csv", Format::Csv).unwrap();
    let grid = Grid {
        columns: vec!["x".to_string()],
        rows: vec![vec![Cell::Number(3.0)]],
    };
    let path = write_grid(&grid, &out, "t.csv", Format::Csv).unwrap();
    assert!(fs::read_to_string(&path).unwrap() == "x\n3\n");
    // No temporary files left behind
    assert!(fs::read_dir(&out).unwrap().count() == 1);
}

#[test]
fn test_write_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "").unwrap();
    let grid = Grid {
        columns: vec!["x".to_string()],
        rows: vec![],
    };
    match write_grid(&grid, &blocker, "t.csv", Format::Csv) {
        Err(Error::Write { path, .. }) => assert!(path.ends_with("t.csv")),
        _ => assert!(false),
    }
}

#[test]
fn test_numbers_round_trip() {
    let grid = Grid {
        columns: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        rows: vec![vec![
            Cell::Number(0.1),
            Cell::Number(123456789.987654321),
            Cell::Number(1e-7),
        ]],
    };
    let dir = tempfile::tempdir().unwrap();
    let path = write_grid(&grid, dir.path(), "n.csv", Format::Csv).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let values = text.lines().nth(1).unwrap().split(',').collect::<Vec<&str>>();
    for (printed, expected) in values.iter().zip([0.1, 123456789.987654321, 1e-7]) {
        assert!(f64::from_str(printed).unwrap() == expected);
    }
}

#[test]
fn test_json_numbers_round_trip() {
    let expected = [0.1, 123456789.987654321, 1e-7, 0.30000000000000004];
    let grid = Grid {
        columns: vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
        rows: vec![expected.iter().map(|n| Cell::Number(*n)).collect()],
    };
    let dir = tempfile::tempdir().unwrap();
    let path = write_grid(&grid, dir.path(), "n.json", Format::Json).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let v = serde_json::from_str::<Value>(&text).unwrap();
    for (name, n) in ["a", "b", "c", "d"].iter().zip(expected) {
        assert!(v[0][*name].as_f64() == Some(n));
    }
    assert!(text.contains("0.30000000000000004"));
}

#[test]
fn test_emptied_window_keeps_columns() {
    let mut table = disk_table();
    let from = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    filter_window(&mut table, Some(from), None);
    assert!(table.is_empty());
    let g = long_grid(&table);
    assert!(g.columns == vec!["timestamp", "hostname", "DEV", "tps", "%util", "await"]);
    assert!(g.rows.is_empty());
    let p = pivot_grid(&build_pivot(&table, "tps"));
    assert!(p.columns == vec!["timestamp", "sda", "sdb"]);
}
