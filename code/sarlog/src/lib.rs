/// Extraction of system activity data from sysstat activity files ("sa files").
///
/// The binary activity files are decoded by an external program, `sadf`, one activity at a time.
/// This library drives that program for every (file, metric) pair, parses the semicolon-separated
/// text it produces into rows, and merges the rows for each metric across all the files into one
/// table, ordered by time and free of duplicates.
///
/// There is an important invariant on a merged table:
///
/// - no two rows have the same (timestamp, entity), and where the files overlap in time the row
///   comes from the file that was given last
///
/// The merged tables are then normalized to UTC, restricted to a time window, and, for the metrics
/// whose rows are keyed by CPU, device or interface, reshaped into wide per-entity tables.
///
/// Writing the tables is the client's business.
mod aggregate;
mod catalog;
mod decoder;
mod error;
mod parser;
mod pipeline;
mod pivot;
mod record;
mod window;

// The failure taxonomy.

pub use error::Error;

// A metric's definition and its shape (scalar or keyed by an entity).

pub use catalog::MetricDef;
pub use catalog::Shape;

// The whole catalog, in scheduling order.

pub use catalog::all_metrics;

// Find a metric by name.

pub use catalog::lookup;

// Select metrics by inclusion and exclusion lists, checking the names.

pub use catalog::select;

// One observation, and the output order of entity names.

pub use record::Row;
pub use record::compare_entities;

// The decoder abstraction and the sysstat implementation of it.

pub use decoder::Decoder;
pub use decoder::Sadf;

// Find the decoder program.

pub use decoder::find_program;

// Parse decoder output into a lazy sequence of rows.

pub use parser::parse_records;

// A per-metric table of rows, and the set of such tables for a run.

pub use aggregate::MetricTable;
pub use aggregate::Aggregator;

// Convert timestamps to UTC; filter by an inclusive time window.

pub use window::normalize;
pub use window::filter_window;

// One row per timestamp, one column per entity.

pub use pivot::PivotedTable;
pub use pivot::build_pivot;

// Run the pipeline over a set of files and metrics.

pub use pipeline::extract;
pub use pipeline::Extraction;
pub use pipeline::Options;
pub use pipeline::PairFailure;
