//! Pipeline configuration from environment variables

use super::decimal::FixedDecimal;
use super::types::CoordinateTolerance;
use chrono::Duration as ChronoDuration;
use std::env;
use std::time::Instant;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Local time offsets beyond a day are rejected
pub const MAX_LOCAL_OFFSET_HOURS: i64 = 24;

/// Configuration for one pipeline cycle
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    /// Root of the downloaded feed tree (one subdirectory per satellite)
    pub download_dir: PathBuf,

    /// Advisory lock file guarding against overlapping runs
    pub lock_path: PathBuf,

    /// Detections older than (latest live acquisition - retention) are archived
    pub retention_hours: i64,

    /// Offset applied to the acquisition timestamp to derive local time
    pub local_time_offset_hours: i64,

    /// Coordinate tolerance for identity lookups (0 = exact match)
    pub coordinate_tolerance: CoordinateTolerance,

    /// Stop starting new files/candidates after this long
    pub run_deadline: Option<Duration>,

    /// Load all geometry once per run instead of querying per point
    pub preload_geometry: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/firmsflow/firms.db"),
            download_dir: PathBuf::from("/var/lib/firmsflow/downloads"),
            lock_path: PathBuf::from("/var/lib/firmsflow/pipeline.lock"),
            retention_hours: 24,
            local_time_offset_hours: 5,
            coordinate_tolerance: CoordinateTolerance::EXACT,
            run_deadline: None,
            preload_geometry: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `FIRMS_DB_PATH` (default: /var/lib/firmsflow/firms.db)
    /// - `FIRMS_DOWNLOAD_DIR` (default: /var/lib/firmsflow/downloads)
    /// - `FIRMS_LOCK_PATH` (default: /var/lib/firmsflow/pipeline.lock)
    /// - `ARCHIVE_RETENTION_HOURS` (default: 24)
    /// - `LOCAL_TIME_OFFSET_HOURS` (default: 5)
    /// - `COORDINATE_TOLERANCE` (default: 0, exact match)
    /// - `RUN_DEADLINE_SECS` (default: unset, no deadline)
    /// - `PRELOAD_GEOMETRY` (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let tolerance = parse_or(
            &lookup,
            "COORDINATE_TOLERANCE",
            FixedDecimal::ZERO,
        );
        let tolerance = if tolerance < FixedDecimal::ZERO {
            log::warn!("Negative COORDINATE_TOLERANCE ignored, using exact match");
            CoordinateTolerance::EXACT
        } else {
            CoordinateTolerance(tolerance)
        };

        let retention_hours = parse_or(&lookup, "ARCHIVE_RETENTION_HOURS", defaults.retention_hours);
        let retention_hours = if retention_hours < 0 {
            log::warn!("Negative ARCHIVE_RETENTION_HOURS ignored, using {}", defaults.retention_hours);
            defaults.retention_hours
        } else if ChronoDuration::try_hours(retention_hours).is_none() {
            log::warn!(
                "ARCHIVE_RETENTION_HOURS {} out of range, using {}",
                retention_hours,
                defaults.retention_hours
            );
            defaults.retention_hours
        } else {
            retention_hours
        };

        let local_time_offset_hours = parse_or(
            &lookup,
            "LOCAL_TIME_OFFSET_HOURS",
            defaults.local_time_offset_hours,
        );
        let local_time_offset_hours = if local_time_offset_hours.abs() > MAX_LOCAL_OFFSET_HOURS {
            log::warn!(
                "LOCAL_TIME_OFFSET_HOURS {} outside ±{}h, using {}",
                local_time_offset_hours,
                MAX_LOCAL_OFFSET_HOURS,
                defaults.local_time_offset_hours
            );
            defaults.local_time_offset_hours
        } else {
            local_time_offset_hours
        };

        let run_deadline = match lookup("RUN_DEADLINE_SECS") {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => {
                    let limit = Duration::from_secs(secs);
                    if Instant::now().checked_add(limit).is_some() {
                        Some(limit)
                    } else {
                        log::warn!("RUN_DEADLINE_SECS {} out of range, running without a deadline", secs);
                        None
                    }
                }
                Err(_) => {
                    log::warn!("Invalid RUN_DEADLINE_SECS '{}', running without a deadline", raw);
                    None
                }
            },
        };

        Self {
            db_path: lookup("FIRMS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),

            download_dir: lookup("FIRMS_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),

            lock_path: lookup("FIRMS_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.lock_path),

            retention_hours,

            local_time_offset_hours,

            coordinate_tolerance: tolerance,

            run_deadline,

            preload_geometry: parse_or(&lookup, "PRELOAD_GEOMETRY", defaults.preload_geometry),
        }
    }

    /// Retention window; out-of-range hours fall back to one day
    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::try_hours(self.retention_hours).unwrap_or_else(|| {
            log::warn!("Retention of {}h out of range, using 24h", self.retention_hours);
            ChronoDuration::hours(24)
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {}", name, raw, default);
                default
            }
        },
    }
}
