// Misc utilities useful to both sarlog and sarparse.

mod configs;
mod dates;

// The run configuration read from a json file.

pub use configs::RunConfig;

// Read a run configuration from a file.

pub use configs::read_run_config;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// The zone that applies to local times without an explicit zone.

pub use dates::LocalZone;

// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymdhms;

// Parse "+HH:MM" and friends into an offset.

pub use dates::parse_utc_offset;

// Parse a user-supplied local time into a Timestamp.

pub use dates::parse_local_time;
