/// Merging of rows for one metric across activity files.
///
/// Rows arrive per (file, metric) pair, possibly out of order when pairs are decoded concurrently.
/// Each batch is tagged with the arrival sequence number of its file (its position on the command
/// line), and that number, not the order in which batches were merged, decides which file wins
/// when two files cover the same instant.  This happens at day boundaries and when activity files
/// are rotated.
///
/// The invariants on a finalized table:
///
/// - rows are sorted ascending by timestamp, then by entity
/// - no two rows have the same (timestamp, entity)
/// - every row comes from the highest-numbered file that had data for its (timestamp, entity)
///
/// Within one file, rows for the same (timestamp, entity) come from different header groups of a
/// multi-group activity; they are folded into one row.
use crate::record::{compare_entities, compare_optional_entities};
use crate::{MetricDef, Row};

use itertools::Itertools;
use std::collections::HashMap;
use ustr::Ustr;

pub struct MetricTable {
    metric: &'static MetricDef,
    rows: Vec<(usize, Row)>,
    finalized: bool,

    // Every value field and entity ever finalized into the table.  These survive the removal of
    // rows by a time window so that the table's shape does not depend on the window.
    fields: Vec<Ustr>,
    entities: Vec<Ustr>,
}

impl MetricTable {
    pub fn new(metric: &'static MetricDef) -> MetricTable {
        MetricTable {
            metric,
            rows: vec![],
            finalized: true,
            fields: vec![],
            entities: vec![],
        }
    }

    pub fn metric(&self) -> &'static MetricDef {
        self.metric
    }

    /// Append the rows of source number `seq`.

    pub fn merge<I>(&mut self, seq: usize, rows: I)
    where
        I: IntoIterator<Item = Row>,
    {
        let before = self.rows.len();
        self.rows.extend(rows.into_iter().map(|r| (seq, r)));
        if self.rows.len() > before {
            self.finalized = false;
        }
    }

    /// Sort and resolve duplicates.  Idempotent.

    pub fn finalize(&mut self) {
        // sort_by is stable, so rows from the same source keep their arrival order within a key.
        self.rows.sort_by(|(sa, a), (sb, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| compare_optional_entities(&a.entity, &b.entity))
                .then(sa.cmp(sb))
        });

        let rows = std::mem::take(&mut self.rows);
        let mut result: Vec<(usize, Row)> = Vec::with_capacity(rows.len());
        let groups = rows
            .into_iter()
            .group_by(|(_, r)| (r.timestamp, r.entity));
        for (_, group) in &groups {
            let mut group = group.collect::<Vec<(usize, Row)>>();
            // Invariant: groups are nonempty and sorted by seq, so the last one is the winner.
            let latest = group[group.len() - 1].0;
            let mut winners = group.drain(0..).filter(|(seq, _)| *seq == latest);
            if let Some((_, mut row)) = winners.next() {
                for (_, r) in winners {
                    row.absorb(r);
                }
                result.push((latest, row));
            }
        }
        self.rows = result;
        self.finalized = true;

        for (_, r) in &self.rows {
            for (name, _) in &r.values {
                if !self.fields.contains(name) {
                    self.fields.push(*name);
                }
            }
            if let Some(e) = r.entity {
                if !self.entities.contains(&e) {
                    self.entities.push(e);
                }
            }
        }
        self.entities
            .sort_by(|a, b| compare_entities(a.as_str(), b.as_str()));
    }

    /// The value fields of the table in the order they were first seen, including fields of rows
    /// that have since been filtered out.
    pub fn fields(&self) -> &[Ustr] {
        &self.fields
    }

    /// The entities of the table in output order, including entities of rows that have since been
    /// filtered out.
    pub fn entities(&self) -> &[Ustr] {
        &self.entities
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter().map(|(_, r)| r)
    }

    pub(crate) fn rows_mut(&mut self) -> impl Iterator<Item = &mut Row> {
        self.rows.iter_mut().map(|(_, r)| r)
    }

    pub(crate) fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&Row) -> bool,
    {
        self.rows.retain(|(_, r)| f(r))
    }
}

/// The running tables for all metrics of a run.  Each metric's table is independent of the
/// others.

#[derive(Default)]
pub struct Aggregator {
    tables: HashMap<&'static str, MetricTable>,
}

impl Aggregator {
    pub fn new() -> Aggregator {
        Default::default()
    }

    pub fn merge<I>(&mut self, metric: &'static MetricDef, seq: usize, rows: I)
    where
        I: IntoIterator<Item = Row>,
    {
        self.tables
            .entry(metric.name)
            .or_insert_with(|| MetricTable::new(metric))
            .merge(seq, rows)
    }

    /// Finalize the table for `metric` and return it, creating an empty table if nothing was ever
    /// merged for it.

    pub fn finalize(&mut self, metric: &'static MetricDef) -> &mut MetricTable {
        let table = self
            .tables
            .entry(metric.name)
            .or_insert_with(|| MetricTable::new(metric));
        table.finalize();
        table
    }

    /// Remove the table for `metric`, finalized.

    pub fn take(&mut self, metric: &'static MetricDef) -> MetricTable {
        let mut table = self
            .tables
            .remove(metric.name)
            .unwrap_or_else(|| MetricTable::new(metric));
        table.finalize();
        table
    }
}

#[cfg(test)]
use crate::catalog::{lookup, Shape};
#[cfg(test)]
use chrono::{DateTime, FixedOffset};

#[cfg(test)]
static CPU_IDLE: MetricDef = MetricDef {
    name: "cpu_idle",
    selector: &["-u"],
    shape: Shape::Scalar,
};

#[cfg(test)]
fn hour(h: u32, offset_hours: i32) -> DateTime<FixedOffset> {
    let s = format!("2024-01-01T{:02}:00:00{:+03}:00", h, offset_hours);
    DateTime::parse_from_rfc3339(&s).unwrap()
}

#[cfg(test)]
fn row(t: DateTime<FixedOffset>, entity: Option<&str>, field: &str, v: f64) -> Row {
    Row {
        timestamp: t,
        hostname: Ustr::from("node1"),
        entity: entity.map(Ustr::from),
        values: vec![(Ustr::from(field), Some(v))],
    }
}

#[cfg(test)]
fn idle_series(from: u32, to: u32, base: f64) -> Vec<Row> {
    (from..=to)
        .map(|h| row(hour(h, 0), None, "%idle", base + h as f64))
        .collect()
}

#[test]
fn test_overlap_later_file_wins() {
    // file1 covers 00-12, file2 covers 06-18.
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(0, idle_series(0, 12, 100.0));
    table.merge(1, idle_series(6, 18, 200.0));
    table.finalize();
    assert!(table.len() == 19);
    let rows = table.rows().collect::<Vec<&Row>>();
    for (h, r) in rows.iter().enumerate() {
        assert!(r.timestamp == hour(h as u32, 0));
        let expected = if h < 6 { 100.0 + h as f64 } else { 200.0 + h as f64 };
        assert!(r.get("%idle") == Some(expected));
    }
}

#[test]
fn test_arrival_order_not_merge_order() {
    // The same as above but the later file's batch is merged first.
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(1, idle_series(6, 18, 200.0));
    table.merge(0, idle_series(0, 12, 100.0));
    table.finalize();
    assert!(table.len() == 19);
    assert!(table.rows().all(|r| {
        let v = r.get("%idle").unwrap();
        v >= 200.0 || v < 106.0
    }));
}

#[test]
fn test_three_way_overlap() {
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(2, vec![row(hour(5, 0), None, "%idle", 3.0)]);
    table.merge(0, vec![row(hour(5, 0), None, "%idle", 1.0)]);
    table.merge(1, vec![row(hour(5, 0), None, "%idle", 2.0)]);
    table.finalize();
    assert!(table.len() == 1);
    assert!(table.rows().next().unwrap().get("%idle") == Some(3.0));
}

#[test]
fn test_same_instant_different_offsets() {
    // 06:00+01:00 is 05:00Z; the two are the same instant and must collapse.
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(0, vec![row(hour(6, 1), None, "%idle", 1.0)]);
    table.merge(1, vec![row(hour(5, 0), None, "%idle", 2.0)]);
    table.finalize();
    assert!(table.len() == 1);
    assert!(table.rows().next().unwrap().get("%idle") == Some(2.0));
}

#[test]
fn test_keyed_rows_distinct_by_entity() {
    let disk = lookup("disk").unwrap();
    let mut table = MetricTable::new(disk);
    table.merge(
        0,
        vec![
            row(hour(1, 0), Some("sdb"), "tps", 1.0),
            row(hour(1, 0), Some("sda"), "tps", 2.0),
            row(hour(0, 0), Some("sda"), "tps", 3.0),
        ],
    );
    table.merge(1, vec![row(hour(1, 0), Some("sdb"), "tps", 4.0)]);
    table.finalize();
    let got = table
        .rows()
        .map(|r| (r.timestamp, r.entity.unwrap().to_string(), r.get("tps").unwrap()))
        .collect::<Vec<_>>();
    assert!(
        got == vec![
            (hour(0, 0), "sda".to_string(), 3.0),
            (hour(1, 0), "sda".to_string(), 2.0),
            (hour(1, 0), "sdb".to_string(), 4.0),
        ]
    );
}

#[test]
fn test_groups_within_a_file_are_folded() {
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(
        0,
        vec![
            row(hour(1, 0), None, "ldavg-1", 0.5),
            row(hour(1, 0), None, "%scpu-10", 0.1),
        ],
    );
    table.finalize();
    assert!(table.len() == 1);
    let r = table.rows().next().unwrap();
    assert!(r.get("ldavg-1") == Some(0.5));
    assert!(r.get("%scpu-10") == Some(0.1));
}

#[test]
fn test_finalize_idempotent() {
    let mut table = MetricTable::new(&CPU_IDLE);
    table.merge(1, idle_series(3, 9, 10.0));
    table.merge(0, idle_series(0, 5, 20.0));
    table.finalize();
    let once = table.rows().cloned().collect::<Vec<Row>>();
    assert!(table.is_finalized());
    table.finalize();
    let twice = table.rows().cloned().collect::<Vec<Row>>();
    assert!(once == twice);
}

#[test]
fn test_aggregator_tables_independent() {
    let memory = lookup("memory").unwrap();
    let mut agg = Aggregator::new();
    agg.merge(&CPU_IDLE, 0, idle_series(0, 2, 0.0));
    agg.merge(memory, 0, vec![row(hour(0, 0), None, "kbmemfree", 5.0)]);
    assert!(agg.finalize(&CPU_IDLE).len() == 3);
    assert!(agg.take(memory).len() == 1);
    assert!(agg.take(lookup("disk").unwrap()).is_empty());
}

#[test]
fn test_numerically_equal_entities_stay_distinct() {
    // "1" and "01" are different entities even though they are the same number.
    let cpu = lookup("per_cpu").unwrap();
    let mut table = MetricTable::new(cpu);
    table.merge(
        0,
        vec![
            row(hour(1, 0), Some("1"), "%idle", 1.0),
            row(hour(1, 0), Some("01"), "%idle", 2.0),
        ],
    );
    table.merge(1, vec![row(hour(1, 0), Some("1"), "%idle", 3.0)]);
    table.finalize();
    let got = table
        .rows()
        .map(|r| (r.entity.unwrap().to_string(), r.get("%idle").unwrap()))
        .collect::<Vec<_>>();
    assert!(got == vec![("01".to_string(), 2.0), ("1".to_string(), 3.0)]);
}

#[test]
fn test_shape_survives_filtering() {
    let disk = lookup("disk").unwrap();
    let mut table = MetricTable::new(disk);
    table.merge(
        0,
        vec![
            row(hour(1, 0), Some("sdb"), "tps", 1.0),
            row(hour(1, 0), Some("sda"), "%util", 2.0),
        ],
    );
    table.finalize();
    table.retain(|_| false);
    assert!(table.is_empty());
    let names = |xs: &[Ustr]| xs.iter().map(|x| x.to_string()).collect::<Vec<String>>();
    assert!(names(table.fields()) == vec!["%util", "tps"]);
    assert!(names(table.entities()) == vec!["sda", "sdb"]);
    // Finalizing the emptied table keeps what was known.
    table.finalize();
    assert!(table.fields().len() == 2);
    assert!(table.entities().len() == 2);
}
