/// Read run configuration data for sarparse from a json file.
///
/// File format:
///
/// An object { ... } with the following named fields and value types, all optional:
///
///   decoder - string, the decoder program (a path, or a name to look up in PATH)
///   timeout - integer, seconds to wait for one decoder invocation
///   jobs - integer, the number of decoder invocations to run concurrently
///   utc-offset - string, the offset of local time from UTC, eg "+01:00"; this applies to
///      --from and --to and to decoder times without a zone
///   metrics - array of strings, the metrics to extract (default: the whole catalog)
///   exclude-metrics - array of strings, metrics to leave out
///   formats - array of strings, the output formats ("csv", "json")
///   output-dir - string, the directory for the output files
///
/// Any field name starting with '#' is reserved for arbitrary comments.  Any other field name is
/// an error, as it is most likely a misspelling.
///
/// Command line switches override values from the file.
use anyhow::{bail, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path;

// See above comment block for field documentation.

#[derive(Debug, Default, Clone)]
pub struct RunConfig {
    pub decoder: Option<String>,
    pub timeout: Option<u64>,
    pub jobs: Option<usize>,
    pub utc_offset: Option<String>,
    pub metrics: Vec<String>,
    pub exclude_metrics: Vec<String>,
    pub formats: Vec<String>,
    pub output_dir: Option<String>,
}

const KNOWN_FIELDS: [&str; 8] = [
    "decoder",
    "timeout",
    "jobs",
    "utc-offset",
    "metrics",
    "exclude-metrics",
    "formats",
    "output-dir",
];

/// The input is human-generated and every field is optional, so I've opted to use the generic JSON
/// parser followed by explicit decoding of the fields, rather than a (derived) strongly-typed
/// parser.

pub fn read_run_config(filename: &str) -> Result<RunConfig> {
    let file = File::open(path::Path::new(filename))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    decode_run_config(&v)
}

fn decode_run_config(v: &Value) -> Result<RunConfig> {
    let fields = if let Value::Object(fields) = v {
        fields
    } else {
        bail!("Expected an object value")
    };
    for name in fields.keys() {
        if !name.starts_with('#') && !KNOWN_FIELDS.contains(&name.as_str()) {
            bail!("Unknown field '{name}'");
        }
    }
    let mut cfg: RunConfig = Default::default();
    cfg.decoder = grab_string_opt(fields, "decoder")?;
    cfg.timeout = grab_u64_opt(fields, "timeout")?;
    cfg.jobs = grab_u64_opt(fields, "jobs")?.map(|n| n as usize);
    if cfg.jobs == Some(0) {
        bail!("Field 'jobs' must be at least 1");
    }
    cfg.utc_offset = grab_string_opt(fields, "utc-offset")?;
    cfg.metrics = grab_strings_opt(fields, "metrics")?;
    cfg.exclude_metrics = grab_strings_opt(fields, "exclude-metrics")?;
    cfg.formats = grab_strings_opt(fields, "formats")?;
    cfg.output_dir = grab_string_opt(fields, "output-dir")?;
    Ok(cfg)
}

fn grab_string_opt(
    fields: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<String>> {
    if let Some(val) = fields.get(name) {
        if let Value::String(s) = val {
            Ok(Some(s.to_string()))
        } else {
            bail!("Field '{name}' must have a string value");
        }
    } else {
        Ok(None)
    }
}

fn grab_strings_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Vec<String>> {
    let mut result = vec![];
    if let Some(val) = fields.get(name) {
        if let Value::Array(vals) = val {
            for v in vals {
                if let Value::String(s) = v {
                    result.push(s.to_string());
                } else {
                    bail!("Field '{name}' must have string values");
                }
            }
        } else {
            bail!("Field '{name}' must have an array value");
        }
    }
    Ok(result)
}

fn grab_u64_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    if let Some(val) = fields.get(name) {
        if let Some(n) = val.as_u64() {
            Ok(Some(n))
        } else {
            bail!("Field '{name}' must have unsigned integer value")
        }
    } else {
        Ok(None)
    }
}

// Basic whitebox test that the reading of configs works.

#[test]
fn test_config() {
    let conf = read_run_config("../tests/rustutils/whitebox-config.json").unwrap();
    assert!(conf.decoder.as_deref() == Some("/usr/bin/sadf"));
    assert!(conf.timeout == Some(30));
    assert!(conf.jobs == Some(4));
    assert!(conf.utc_offset.as_deref() == Some("+01:00"));
    assert!(conf.metrics == vec!["per_cpu".to_string(), "memory".to_string()]);
    assert!(conf.exclude_metrics.is_empty());
    assert!(conf.formats == vec!["csv".to_string()]);
    assert!(conf.output_dir.is_none());
}

#[test]
fn test_config_errors() {
    let v: Value = serde_json::from_str(r#"{"timeout": "soon"}"#).unwrap();
    assert!(decode_run_config(&v).is_err());

    let v: Value = serde_json::from_str(r#"{"metric": ["disk"]}"#).unwrap();
    assert!(decode_run_config(&v).is_err());

    let v: Value = serde_json::from_str(r#"{"jobs": 0}"#).unwrap();
    assert!(decode_run_config(&v).is_err());

    let v: Value = serde_json::from_str(r#"["disk"]"#).unwrap();
    assert!(decode_run_config(&v).is_err());

    let v: Value = serde_json::from_str(r##"{"#": "comment", "formats": ["json"]}"##).unwrap();
    let conf = decode_run_config(&v).unwrap();
    assert!(conf.formats == vec!["json".to_string()]);
}

#[test]
fn test_config_missing_file() {
    assert!(read_run_config("../tests/rustutils/no-such-config.json").is_err());
}
