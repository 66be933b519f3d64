/// Reshape an entity-keyed table into a wide table for one value field: one row per timestamp, one
/// column per entity.
///
/// The column set is every entity seen anywhere in the table, also in rows a time window has
/// removed, in output order (see
/// `compare_entities`), so a column exists even for an entity that has a gap.  A cell with no
/// observation, or whose observation has no value for the field, is None and is written as an
/// empty cell, never as zero.
use crate::record::compare_entities;
use crate::MetricTable;

use chrono::{DateTime, FixedOffset};
use itertools::Itertools;
use std::collections::HashMap;
use ustr::Ustr;

pub struct PivotedTable {
    pub metric: &'static str,
    pub field: Ustr,
    pub entities: Vec<Ustr>,

    /// Ascending by timestamp; every cell vector has `entities.len()` elements.
    pub rows: Vec<(DateTime<FixedOffset>, Vec<Option<f64>>)>,
}

impl PivotedTable {
    /// The (timestamp, entity, value) triples of the cells that have a value.

    pub fn unpivot(&self) -> Vec<(DateTime<FixedOffset>, Ustr, f64)> {
        let mut result = vec![];
        for (t, cells) in &self.rows {
            for (entity, cell) in self.entities.iter().zip(cells.iter()) {
                if let Some(v) = cell {
                    result.push((*t, *entity, *v));
                }
            }
        }
        result
    }
}

/// Build the pivot of `table` for `field`.  `table` should be finalized.  Panics if the table's
/// metric is not entity-keyed; the catalog only declares pivots on keyed metrics.

pub fn build_pivot(table: &MetricTable, field: &str) -> PivotedTable {
    let metric = table.metric();
    assert!(
        metric.is_keyed(),
        "pivot of non-keyed metric {}",
        metric.name
    );

    // Entities known from finalization, including those whose rows the window removed.
    let mut entities = table
        .entities()
        .iter()
        .copied()
        .chain(table.rows().filter_map(|r| r.entity))
        .unique()
        .collect::<Vec<Ustr>>();
    entities.sort_by(|a, b| compare_entities(a.as_str(), b.as_str()));
    let column = entities
        .iter()
        .enumerate()
        .map(|(i, e)| (*e, i))
        .collect::<HashMap<Ustr, usize>>();

    let mut rows = vec![];
    for (t, group) in &table.rows().group_by(|r| r.timestamp) {
        let mut cells = vec![None; entities.len()];
        for r in group {
            if let Some(ix) = r.entity.and_then(|e| column.get(&e)) {
                cells[*ix] = r.get(field);
            }
        }
        rows.push((t, cells));
    }

    PivotedTable {
        metric: metric.name,
        field: Ustr::from(field),
        entities,
        rows,
    }
}

#[cfg(test)]
use crate::catalog::lookup;
#[cfg(test)]
use crate::Row;

#[cfg(test)]
fn at(hm: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(&format!("2024-01-01T{hm}:00+00:00")).unwrap()
}

#[cfg(test)]
fn disk_row(hm: &str, dev: &str, tps: Option<f64>) -> Row {
    Row {
        timestamp: at(hm),
        hostname: Ustr::from("node1"),
        entity: Some(Ustr::from(dev)),
        values: vec![(Ustr::from("tps"), tps), (Ustr::from("%util"), Some(1.5))],
    }
}

#[cfg(test)]
fn disk_table() -> MetricTable {
    let mut table = MetricTable::new(lookup("disk").unwrap());
    table.merge(
        0,
        vec![
            disk_row("00:10", "sda", Some(10.0)),
            disk_row("00:10", "sdb", Some(0.0)),
            // sdb has no observation at 00:20
            disk_row("00:20", "sda", Some(11.5)),
            disk_row("00:30", "sdb", Some(3.25)),
            disk_row("00:30", "sda", None),
        ],
    );
    table.finalize();
    table
}

#[test]
fn test_pivot_missing_is_empty() {
    let p = build_pivot(&disk_table(), "tps");
    assert!(p.metric == "disk");
    assert!(p.field.as_str() == "tps");
    assert!(p.entities.iter().map(|e| e.as_str()).collect::<Vec<&str>>() == vec!["sda", "sdb"]);
    assert!(p.rows.len() == 3);
    assert!(p.rows[0].0 == at("00:10"));
    assert!(p.rows[0].1 == vec![Some(10.0), Some(0.0)]);
    // The gap is empty, not zero, and the zero is a real zero.
    assert!(p.rows[1].1 == vec![Some(11.5), None]);
    assert!(p.rows[2].1 == vec![None, Some(3.25)]);
}

#[test]
fn test_pivot_entity_order() {
    let mut table = MetricTable::new(lookup("per_cpu").unwrap());
    let rows = ["10", "all", "2", "0"]
        .iter()
        .map(|cpu| Row {
            timestamp: at("00:10"),
            hostname: Ustr::from("node1"),
            entity: Some(Ustr::from(cpu)),
            values: vec![(Ustr::from("%idle"), Some(50.0))],
        })
        .collect::<Vec<Row>>();
    table.merge(0, rows);
    table.finalize();
    let p = build_pivot(&table, "%idle");
    assert!(
        p.entities.iter().map(|e| e.as_str()).collect::<Vec<&str>>()
            == vec!["all", "0", "2", "10"]
    );
    assert!(p.rows.len() == 1);
}

#[test]
fn test_unpivot_recovers_triples() {
    let table = disk_table();
    let p = build_pivot(&table, "tps");
    let mut expected = table
        .rows()
        .filter_map(|r| r.get("tps").map(|v| (r.timestamp, r.entity.unwrap(), v)))
        .collect::<Vec<_>>();
    let mut got = p.unpivot();
    let key = |x: &(DateTime<FixedOffset>, Ustr, f64)| (x.0, x.1.to_string());
    expected.sort_by_key(key);
    got.sort_by_key(key);
    assert!(got == expected);
    assert!(got.len() == 4);
}

#[test]
fn test_pivot_empty_table() {
    let table = MetricTable::new(lookup("network_dev").unwrap());
    let p = build_pivot(&table, "rxkB/s");
    assert!(p.entities.is_empty());
    assert!(p.rows.is_empty());
}

#[test]
#[should_panic]
fn test_pivot_scalar_panics() {
    let table = MetricTable::new(lookup("memory").unwrap());
    build_pivot(&table, "kbmemfree");
}

#[test]
fn test_pivot_columns_survive_window() {
    let mut table = disk_table();
    table.retain(|r| r.timestamp > at("00:20"));
    let p = build_pivot(&table, "tps");
    assert!(p.entities.iter().map(|e| e.as_str()).collect::<Vec<&str>>() == vec!["sda", "sdb"]);
    assert!(p.rows.len() == 1);

    table.retain(|_| false);
    let p = build_pivot(&table, "tps");
    assert!(p.entities.len() == 2);
    assert!(p.rows.is_empty());
}
