//! Various small helper functions

use std::num::ParseIntError;
use std::time::Duration;

/// Parses a Duration from a string containing milliseconds.
/// Useful for command line parsing
pub fn parse_millis(src: &str) -> Result<Duration, ParseIntError> {
    let millis = src.trim().parse::<u64>()?;
    Ok(Duration::from_millis(millis))
}

/// Parses a Duration from a string containing seconds.
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.trim().parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}
