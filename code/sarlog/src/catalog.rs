/// The static catalog of metrics we know how to extract.
///
/// Each metric corresponds to one `sadf` activity selector.  A metric is either scalar (one row
/// per sample time) or keyed by an entity (one row per sample time per CPU, device, interface,
/// and so on), and keyed metrics carry their entity renames and their pivot fields with them.
///
/// Some activities are deliberately absent:
///
/// - "-n ALL" produces a single table with many unrelated metrics that is hard to use downstream;
///   the network activities are listed one by one instead.
/// - "-n SOFT" does not decode reliably.
/// - "-u ALL" and "-C" are covered by per_cpu, which includes the "all" pseudo-CPU.
/// - "-m ALL" mixes several sub-activities with different entity columns, so power is split by
///   sub-activity.
use crate::Error;

#[derive(Debug, PartialEq)]
pub struct MetricDef {
    /// The catalog name, also the stem of the output file names.
    pub name: &'static str,

    /// The decoder arguments (after `--`) that select the activity.
    pub selector: &'static [&'static str],

    pub shape: Shape,
}

#[derive(Debug, PartialEq)]
pub enum Shape {
    Scalar,
    Keyed {
        /// The name of the header field that holds the entity key.
        entity: &'static str,

        /// (raw, renamed) pairs applied to entity values as they are parsed.
        renames: &'static [(&'static str, &'static str)],

        /// Value fields for which a pivoted (one column per entity) table is produced.
        pivots: &'static [&'static str],
    },
}

impl MetricDef {
    pub fn entity(&self) -> Option<&'static str> {
        match self.shape {
            Shape::Scalar => None,
            Shape::Keyed { entity, .. } => Some(entity),
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.entity().is_some()
    }

    pub fn pivots(&self) -> &'static [&'static str] {
        match self.shape {
            Shape::Scalar => &[],
            Shape::Keyed { pivots, .. } => pivots,
        }
    }

    pub fn rename_entity<'a>(&self, raw: &'a str) -> &'a str {
        if let Shape::Keyed { renames, .. } = self.shape {
            for (from, to) in renames {
                if *from == raw {
                    return *to;
                }
            }
        }
        raw
    }
}

const fn scalar(name: &'static str, selector: &'static [&'static str]) -> MetricDef {
    MetricDef {
        name,
        selector,
        shape: Shape::Scalar,
    }
}

const fn keyed(
    name: &'static str,
    selector: &'static [&'static str],
    entity: &'static str,
    pivots: &'static [&'static str],
) -> MetricDef {
    MetricDef {
        name,
        selector,
        shape: Shape::Keyed {
            entity,
            renames: &[],
            pivots,
        },
    }
}

static CATALOG: [MetricDef; 38] = [
    scalar("io", &["-b"]),
    scalar("paging", &["-B"]),
    keyed("disk", &["-d"], "DEV", &["tps", "%util"]),
    keyed("filesystem", &["-F"], "FILESYSTEM", &[]),
    scalar("hugepages", &["-H"]),
    keyed("interrupts", &["-I", "ALL"], "INTR", &[]),
    keyed("power_cpu", &["-m", "CPU"], "CPU", &[]),
    keyed("power_fan", &["-m", "FAN"], "FAN", &[]),
    keyed("power_freq", &["-m", "FREQ"], "CPU", &[]),
    keyed("power_temp", &["-m", "TEMP"], "TEMP", &[]),
    keyed("power_usb", &["-m", "USB"], "BUS", &[]),
    keyed("network_dev", &["-n", "DEV"], "IFACE", &["rxkB/s", "txkB/s"]),
    keyed("network_edev", &["-n", "EDEV"], "IFACE", &[]),
    keyed("network_fc", &["-n", "FC"], "FCHOST", &[]),
    scalar("network_icmp", &["-n", "ICMP"]),
    scalar("network_eicmp", &["-n", "EICMP"]),
    scalar("network_icmp6", &["-n", "ICMP6"]),
    scalar("network_eicmp6", &["-n", "EICMP6"]),
    scalar("network_ip", &["-n", "IP"]),
    scalar("network_eip", &["-n", "EIP"]),
    scalar("network_ip6", &["-n", "IP6"]),
    scalar("network_eip6", &["-n", "EIP6"]),
    scalar("network_nfs", &["-n", "NFS"]),
    scalar("network_nfsd", &["-n", "NFSD"]),
    scalar("network_sock", &["-n", "SOCK"]),
    scalar("network_sock6", &["-n", "SOCK6"]),
    scalar("network_tcp", &["-n", "TCP"]),
    scalar("network_etcp", &["-n", "ETCP"]),
    scalar("network_udp", &["-n", "UDP"]),
    scalar("network_udp6", &["-n", "UDP6"]),
    MetricDef {
        name: "per_cpu",
        selector: &["-P", "ALL"],
        shape: Shape::Keyed {
            entity: "CPU",
            // sadf reports the all-CPU aggregate as CPU -1.
            renames: &[("-1", "all")],
            pivots: &["%user", "%system", "%iowait", "%idle"],
        },
    },
    scalar("queue", &["-q", "ALL"]),
    scalar("memory", &["-r", "ALL"]),
    scalar("swap_util", &["-S"]),
    scalar("inode", &["-v"]),
    scalar("swap", &["-W"]),
    scalar("task", &["-w"]),
    keyed("tty", &["-y"], "TTY", &[]),
];

/// The metrics to process for a run, in catalog order.  The order only affects scheduling.

pub fn all_metrics() -> &'static [MetricDef] {
    &CATALOG
}

pub fn lookup(name: &str) -> Option<&'static MetricDef> {
    CATALOG.iter().find(|m| m.name == name)
}

/// Select metrics by name.  An empty `include` means the whole catalog.  Unknown names in either
/// list are configuration errors.

pub fn select(include: &[String], exclude: &[String]) -> Result<Vec<&'static MetricDef>, Error> {
    for name in include.iter().chain(exclude.iter()) {
        if lookup(name).is_none() {
            return Err(Error::Config(format!("Unknown metric '{name}'")));
        }
    }
    Ok(CATALOG
        .iter()
        .filter(|m| include.is_empty() || include.iter().any(|n| n == m.name))
        .filter(|m| !exclude.iter().any(|n| n == m.name))
        .collect::<Vec<&'static MetricDef>>())
}

#[test]
fn test_catalog_names_unique() {
    let mut names = all_metrics().iter().map(|m| m.name).collect::<Vec<&str>>();
    names.sort();
    let n = names.len();
    names.dedup();
    assert!(names.len() == n);
}

#[test]
fn test_catalog_pivots_only_on_keyed() {
    for m in all_metrics() {
        if !m.pivots().is_empty() {
            assert!(m.is_keyed());
        }
    }
}

#[test]
fn test_lookup_and_rename() {
    let cpu = lookup("per_cpu").unwrap();
    assert!(cpu.entity() == Some("CPU"));
    assert!(cpu.rename_entity("-1") == "all");
    assert!(cpu.rename_entity("3") == "3");
    assert!(lookup("memory").unwrap().entity().is_none());
    assert!(lookup("network_soft").is_none());
}

#[test]
fn test_select() {
    let all = select(&[], &[]).unwrap();
    assert!(all.len() == all_metrics().len());

    let some = select(&["memory".to_string(), "disk".to_string()], &[]).unwrap();
    // Catalog order, not argument order
    assert!(some.iter().map(|m| m.name).collect::<Vec<&str>>() == vec!["disk", "memory"]);

    let fewer = select(&[], &["tty".to_string()]).unwrap();
    assert!(fewer.len() == all.len() - 1);
    assert!(fewer.iter().all(|m| m.name != "tty"));

    match select(&["cpu_util".to_string()], &[]) {
        Err(Error::Config(msg)) => assert!(msg.contains("cpu_util")),
        _ => assert!(false),
    }
    assert!(select(&[], &["nope".to_string()]).is_err());
}
