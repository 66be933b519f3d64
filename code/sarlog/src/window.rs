/// Time zone normalization and time window filtering of a finalized table.
///
/// Both operate in place.  Normalization must come first: the window bounds are UTC instants, and
/// although comparisons are of instants anyway, the output wants every timestamp in UTC.
use crate::MetricTable;

use chrono::{Offset, Utc};
use rustutils::Timestamp;

/// Convert every row's timestamp to UTC.  This does not change any instant, so the table's
/// ordering is unaffected.

pub fn normalize(table: &mut MetricTable) {
    let utc = Utc.fix();
    for r in table.rows_mut() {
        r.timestamp = r.timestamp.with_timezone(&utc);
    }
}

/// Keep only the rows with `from <= timestamp <= to`.  An absent bound does not restrict its
/// side.  If `from` is after `to` the result is empty.

pub fn filter_window(table: &mut MetricTable, from: Option<Timestamp>, to: Option<Timestamp>) {
    if from.is_none() && to.is_none() {
        return;
    }
    table.retain(|r| {
        let t = r.timestamp.with_timezone(&Utc);
        from.map_or(true, |f| f <= t) && to.map_or(true, |e| t <= e)
    })
}

#[cfg(test)]
use crate::catalog::lookup;
#[cfg(test)]
use crate::Row;
#[cfg(test)]
use chrono::{DateTime, FixedOffset};
#[cfg(test)]
use rustutils::timestamp_from_ymdhms;
#[cfg(test)]
use ustr::Ustr;

// Rows every half hour from 05:00 to 07:00 UTC, recorded at +01:00.
#[cfg(test)]
fn cet_table() -> MetricTable {
    let memory = lookup("memory").unwrap();
    let mut table = MetricTable::new(memory);
    let rows = ["06:00", "06:30", "07:00", "07:30", "08:00"]
        .iter()
        .enumerate()
        .map(|(i, hm)| Row {
            timestamp: DateTime::parse_from_rfc3339(&format!("2024-01-01T{hm}:00+01:00"))
                .unwrap(),
            hostname: Ustr::from("node1"),
            entity: None,
            values: vec![(Ustr::from("kbmemfree"), Some(i as f64))],
        })
        .collect::<Vec<Row>>();
    table.merge(0, rows);
    table.finalize();
    table
}

#[test]
fn test_normalize() {
    let mut table = cet_table();
    let before = table.rows().cloned().collect::<Vec<Row>>();
    normalize(&mut table);
    let after = table.rows().cloned().collect::<Vec<Row>>();
    assert!(before.len() == after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert!(a.timestamp.offset().local_minus_utc() == 0);
        // Same instant
        assert!(a.timestamp == b.timestamp);
    }
    assert!(after[0].timestamp.to_rfc3339() == "2024-01-01T05:00:00+00:00");
    let utc: FixedOffset = Utc.fix();
    assert!(*after[4].timestamp.offset() == utc);
}

#[test]
fn test_window_inclusive() {
    let mut table = cet_table();
    normalize(&mut table);
    filter_window(
        &mut table,
        Some(timestamp_from_ymdhms(2024, 1, 1, 5, 30, 0)),
        Some(timestamp_from_ymdhms(2024, 1, 1, 6, 30, 0)),
    );
    let vals = table
        .rows()
        .map(|r| r.get("kbmemfree").unwrap())
        .collect::<Vec<f64>>();
    assert!(vals == vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_window_single_instant() {
    let mut table = cet_table();
    normalize(&mut table);
    let t = timestamp_from_ymdhms(2024, 1, 1, 6, 0, 0);
    filter_window(&mut table, Some(t), Some(t));
    assert!(table.len() == 1);
    assert!(table.rows().next().unwrap().get("kbmemfree") == Some(2.0));
}

#[test]
fn test_window_open_ended() {
    let mut table = cet_table();
    normalize(&mut table);
    filter_window(&mut table, Some(timestamp_from_ymdhms(2024, 1, 1, 6, 15, 0)), None);
    assert!(table.len() == 2);

    let mut table = cet_table();
    normalize(&mut table);
    filter_window(&mut table, None, Some(timestamp_from_ymdhms(2024, 1, 1, 5, 0, 0)));
    assert!(table.len() == 1);

    let mut table = cet_table();
    filter_window(&mut table, None, None);
    assert!(table.len() == 5);
}

#[test]
fn test_window_start_after_end_is_empty() {
    let mut table = cet_table();
    normalize(&mut table);
    filter_window(
        &mut table,
        Some(timestamp_from_ymdhms(2024, 1, 1, 7, 0, 0)),
        Some(timestamp_from_ymdhms(2024, 1, 1, 5, 0, 0)),
    );
    assert!(table.is_empty());
}
