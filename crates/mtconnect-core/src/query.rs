//! Query parameters and one-shot `current` / `sample` queries.
//!
//! The HTTP layer is out of scope; it hands the decoded query string to
//! [`QueryParams::parse`] as key/value pairs.

use crate::buffer::{BufferError, Current, ObservationBuffer, ObservationFilter, Sample};
use std::time::Duration;

/// Default maximum number of observations per response.
pub const DEFAULT_COUNT: usize = 100;

/// Default idle interval before a heartbeat frame.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(10_000);

/// Parsed query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    /// Snapshot at this sequence (`current` only)
    pub at: Option<u64>,
    /// First sequence of a range or stream
    pub from: Option<u64>,
    /// Last sequence of a range (inclusive)
    pub to: Option<u64>,
    /// Maximum observations per response
    pub count: usize,
    /// Idle interval before a heartbeat frame
    pub heartbeat: Duration,
    /// Minimum delay between stream frames
    pub interval: Option<Duration>,
    /// Device / data item restriction
    pub filter: ObservationFilter,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            at: None,
            from: None,
            to: None,
            count: DEFAULT_COUNT,
            heartbeat: DEFAULT_HEARTBEAT,
            interval: None,
            filter: ObservationFilter::all(),
        }
    }
}

impl QueryParams {
    /// Parse query string pairs.
    ///
    /// Recognized keys: `at`, `from`, `to`, `count`, `heartbeat` (ms),
    /// `interval` (ms), `deviceUuid`, `dataItemId` (comma separated).
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] for malformed numbers, a zero `count` or
    /// `heartbeat`, or `at` combined with `from`, `to`, or `interval`.
    pub fn parse<'a, I>(pairs: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = Self::default();

        for (name, value) in pairs {
            match name {
                "at" => params.at = Some(parse_number(name, value)?),
                "from" => params.from = Some(parse_number(name, value)?),
                "to" => params.to = Some(parse_number(name, value)?),
                "count" => {
                    params.count = usize::try_from(parse_number(name, value)?)
                        .map_err(|_| invalid(name, value))?;
                }
                "heartbeat" => {
                    params.heartbeat = Duration::from_millis(parse_number(name, value)?);
                }
                "interval" => {
                    params.interval = Some(Duration::from_millis(parse_number(name, value)?));
                }
                "deviceUuid" => {
                    if value.is_empty() {
                        return Err(invalid(name, value));
                    }
                    params.filter.device_uuid = Some(value.to_string());
                }
                "dataItemId" => {
                    let ids: Vec<&str> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .collect();
                    if ids.is_empty() {
                        return Err(invalid(name, value));
                    }
                    params.filter = params.filter.with_data_items(ids);
                }
                _ => tracing::trace!(name, "Ignoring unknown query parameter"),
            }
        }

        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), QueryError> {
        if self.count == 0 {
            return Err(QueryError::ZeroCount);
        }
        if self.heartbeat.is_zero() {
            return Err(QueryError::ZeroHeartbeat);
        }
        if self.at.is_some() {
            if self.from.is_some() {
                return Err(QueryError::Conflict("at", "from"));
            }
            if self.to.is_some() {
                return Err(QueryError::Conflict("at", "to"));
            }
            if self.interval.is_some() {
                return Err(QueryError::Conflict("at", "interval"));
            }
        }
        Ok(())
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, QueryError> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn invalid(name: &str, value: &str) -> QueryError {
    QueryError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Errors returned to query callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// A parameter value could not be parsed
    #[error("invalid value for '{name}': {value}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Rejected value
        value: String,
    },
    /// Two parameters that exclude each other were both given
    #[error("'{0}' cannot be combined with '{1}'")]
    Conflict(&'static str, &'static str),
    /// `count` was zero
    #[error("count must be greater than zero")]
    ZeroCount,
    /// `heartbeat` was zero
    #[error("heartbeat must be greater than zero")]
    ZeroHeartbeat,
    /// The buffer rejected the requested range
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Snapshot of the latest observation per data item.
///
/// # Errors
///
/// Returns [`QueryError::Buffer`] if `at` is outside the buffer window.
pub fn current(buffer: &ObservationBuffer, params: &QueryParams) -> Result<Current, QueryError> {
    Ok(buffer.current(&params.filter, params.at)?)
}

/// Range of observations starting at `from` (default: the first retained
/// sequence).
///
/// # Errors
///
/// Returns [`QueryError::Buffer`] if `from` is outside the buffer window or
/// `to < from`.
pub fn sample(buffer: &ObservationBuffer, params: &QueryParams) -> Result<Sample, QueryError> {
    let from = params.from.unwrap_or_else(|| buffer.window().first);
    Ok(buffer.sample(from, params.count, params.to, &params.filter)?)
}
