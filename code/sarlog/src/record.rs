use chrono::{DateTime, FixedOffset};
use std::cmp::Ordering;
use std::str::FromStr;
use ustr::Ustr;

/// One observation: the values of one decoder output line.
///
/// The timestamp carries the offset of the source it was read from until the table is normalized
/// to UTC.  Comparisons of timestamps are always comparisons of instants.
///
/// A value is None when the decoder produced something that is not a number (or nothing at all);
/// this is "missing", not zero.  Value names are unique within a row.

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: DateTime<FixedOffset>,

    /// The host that recorded the activity file.
    pub hostname: Ustr,

    /// The CPU, device, interface, ... for keyed metrics; None for scalar metrics.
    pub entity: Option<Ustr>,

    /// Field values in header order.
    pub values: Vec<(Ustr, Option<f64>)>,
}

impl Row {
    /// The value of `field`, None if the field is absent or its value is missing.

    pub fn get(&self, field: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name.as_str() == field)
            .and_then(|(_, v)| *v)
    }

    /// Fold the values of `other` into this row; values in `other` replace values for the same
    /// field here, new fields are appended.

    pub fn absorb(&mut self, other: Row) {
        for (name, v) in other.values {
            if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = v;
            } else {
                self.values.push((name, v));
            }
        }
        self.hostname = other.hostname;
    }
}

/// Order entity names for output: "all" first, then numeric names numerically, then everything
/// else lexicographically.  sadf reports CPUs as plain numbers.

pub fn compare_entities(a: &str, b: &str) -> Ordering {
    match (a == "all", b == "all") {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (i64::from_str(a), i64::from_str(b)) {
        // Distinct names must not compare equal, "1" and "01" are different entities.
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

pub fn compare_optional_entities(a: &Option<Ustr>, b: &Option<Ustr>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_entities(x.as_str(), y.as_str()),
    }
}

#[test]
fn test_compare_entities() {
    let mut xs = vec!["sdb", "10", "all", "2", "eth0", "sda", "-1"];
    xs.sort_by(|a, b| compare_entities(a, b));
    assert!(xs == vec!["all", "-1", "2", "10", "eth0", "sda", "sdb"]);

    assert!(compare_entities("1", "01") != Ordering::Equal);
    assert!(compare_entities("+1", "1") != Ordering::Equal);
    assert!(compare_entities("01", "1") == compare_entities("1", "01").reverse());
    assert!(compare_entities("1", "1") == Ordering::Equal);
}

#[test]
fn test_absorb() {
    let t = DateTime::parse_from_rfc3339("2024-01-01T00:10:00+00:00").unwrap();
    let mut a = Row {
        timestamp: t,
        hostname: Ustr::from("h1"),
        entity: None,
        values: vec![(Ustr::from("x"), Some(1.0)), (Ustr::from("y"), None)],
    };
    let b = Row {
        timestamp: t,
        hostname: Ustr::from("h2"),
        entity: None,
        values: vec![(Ustr::from("y"), Some(2.5)), (Ustr::from("z"), Some(3.0))],
    };
    a.absorb(b);
    assert!(a.hostname.as_str() == "h2");
    assert!(a.get("x") == Some(1.0));
    assert!(a.get("y") == Some(2.5));
    assert!(a.get("z") == Some(3.0));
    assert!(a.values.len() == 3);
    assert!(a.get("w").is_none());
}
