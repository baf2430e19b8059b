//! Feed reader for downloaded FIRMS CSV batches
//!
//! Layout on disk:
//!
//! ```text
//! <download_dir>/
//!   MODIS_C6/              <- satellite source id
//!     .../*.csv
//!   NOAA_20_VIIRS_C2/
//!     .../*.csv
//! ```
//!
//! Each file is read lazily, one candidate per row. A malformed row ends the
//! file: the iterator yields the error once and then stops.

use super::decimal::FixedDecimal;
use super::error::ParseError;
use super::types::{DayNight, DetectionKey, FireCandidate, SatelliteId};
use chrono::{Duration, NaiveDate, NaiveTime};
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Column positions in the FIRMS active-fire CSV
mod col {
    pub const LATITUDE: usize = 0;
    pub const LONGITUDE: usize = 1;
    pub const BRIGHTNESS: usize = 2;
    pub const SCAN: usize = 3;
    pub const TRACK: usize = 4;
    pub const ACQ_DATE: usize = 5;
    pub const ACQ_TIME: usize = 6;
    // 7: the feed's own satellite code; provenance comes from the directory
    pub const CONFIDENCE: usize = 8;
    pub const VERSION: usize = 9;
    pub const BRIGHT_T31: usize = 10;
    pub const FRP: usize = 11;
    pub const DAYNIGHT: usize = 12;
    pub const COUNT: usize = 13;
}

/// One CSV batch belonging to a satellite source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFile {
    pub satellite: SatelliteId,
    pub path: PathBuf,
}

/// Result of walking the download directory
#[derive(Debug, Default)]
pub struct FeedDiscovery {
    pub files: Vec<FeedFile>,
    /// Directory entries that could not be read
    pub errors: Vec<ParseError>,
}

pub struct FeedReader {
    root: PathBuf,
    local_offset: Duration,
}

impl FeedReader {
    pub fn new(root: impl Into<PathBuf>, local_offset_hours: i64) -> Self {
        let local_offset = Duration::try_hours(local_offset_hours).unwrap_or_else(|| {
            log::warn!("Local time offset of {}h out of range, using UTC", local_offset_hours);
            Duration::zero()
        });
        Self {
            root: root.into(),
            local_offset,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists every `*.csv` under each satellite subdirectory, sorted by path
    pub fn discover(&self) -> FeedDiscovery {
        let mut discovery = FeedDiscovery::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(source) => {
                discovery.errors.push(ParseError::Io {
                    path: self.root.clone(),
                    source,
                });
                return discovery;
            }
        };

        let dirs = satellite_dirs(
            &self.root,
            entries.map(|entry| entry.map(|e| e.path())),
            &mut discovery.errors,
        );

        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                log::warn!("Skipping satellite directory with non-UTF-8 name: {}", dir.display());
                continue;
            };
            let satellite = SatelliteId::new(name);

            for entry in WalkDir::new(&dir).sort_by_file_name() {
                match entry {
                    Ok(entry) => {
                        let path = entry.path();
                        if entry.file_type().is_file()
                            && path.extension().and_then(|e| e.to_str()) == Some("csv")
                        {
                            log::debug!("Found file: {}", path.display());
                            discovery.files.push(FeedFile {
                                satellite: satellite.clone(),
                                path: path.to_path_buf(),
                            });
                        }
                    }
                    Err(err) => {
                        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
                        let source = err.into_io_error().unwrap_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop")
                        });
                        discovery.errors.push(ParseError::Io { path, source });
                    }
                }
            }
        }

        discovery
    }

    /// Opens a file for row iteration. Fails on unreadable or empty files.
    pub fn open(&self, file: &FeedFile) -> Result<FeedRows, ParseError> {
        let handle = File::open(&file.path).map_err(|source| ParseError::Io {
            path: file.path.clone(),
            source,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(handle);

        let headers = reader.headers().map_err(|source| ParseError::Csv {
            path: file.path.clone(),
            source,
        })?;
        if headers.is_empty() {
            return Err(ParseError::EmptyFile(file.path.clone()));
        }

        Ok(FeedRows {
            records: reader.into_records(),
            path: file.path.clone(),
            local_offset: self.local_offset,
            finished: false,
        })
    }
}

/// Subdirectories of the download root, sorted; unreadable entries are
/// recorded against the root
fn satellite_dirs<I>(root: &Path, entries: I, errors: &mut Vec<ParseError>) -> Vec<PathBuf>
where
    I: Iterator<Item = std::io::Result<PathBuf>>,
{
    let mut dirs = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_dir() => dirs.push(path),
            Ok(_) => {}
            Err(source) => errors.push(ParseError::Io {
                path: root.to_path_buf(),
                source,
            }),
        }
    }
    dirs.sort();
    dirs
}

/// Lazy, non-restartable row iterator over one feed file
pub struct FeedRows {
    records: csv::StringRecordsIntoIter<File>,
    path: PathBuf,
    local_offset: Duration,
    finished: bool,
}

impl Iterator for FeedRows {
    type Item = Result<FireCandidate, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let record = match self.records.next()? {
            Ok(record) => record,
            Err(source) => {
                self.finished = true;
                return Some(Err(ParseError::Csv {
                    path: self.path.clone(),
                    source,
                }));
            }
        };

        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let fields: Vec<&str> = record.iter().collect();
        let parsed = parse_row(&fields, self.local_offset).map_err(|reason| ParseError::Row {
            path: self.path.clone(),
            line,
            reason,
        });
        if parsed.is_err() {
            self.finished = true;
        }
        Some(parsed)
    }
}

/// Parses one FIRMS row. Returns a human-readable reason on failure.
pub fn parse_row(fields: &[&str], local_offset: Duration) -> Result<FireCandidate, String> {
    if fields.len() < col::COUNT {
        return Err(format!(
            "expected {} columns, found {}",
            col::COUNT,
            fields.len()
        ));
    }

    let decimal = |idx: usize, name: &str| -> Result<FixedDecimal, String> {
        fields[idx]
            .parse::<FixedDecimal>()
            .map_err(|e| format!("{}: {}", name, e))
    };
    let optional_decimal = |idx: usize, name: &str| -> Result<Option<FixedDecimal>, String> {
        if fields[idx].trim().is_empty() {
            Ok(None)
        } else {
            decimal(idx, name).map(Some)
        }
    };

    let latitude = decimal(col::LATITUDE, "latitude")?;
    let longitude = decimal(col::LONGITUDE, "longitude")?;
    let brightness = decimal(col::BRIGHTNESS, "brightness")?;
    let scan = decimal(col::SCAN, "scan")?;
    let track = decimal(col::TRACK, "track")?;

    let acq_date = NaiveDate::parse_from_str(fields[col::ACQ_DATE], "%Y-%m-%d")
        .map_err(|e| format!("acq_date '{}': {}", fields[col::ACQ_DATE], e))?;
    let acq_time = parse_acq_time(fields[col::ACQ_TIME])?;

    let daynight = DayNight::parse(fields[col::DAYNIGHT])
        .ok_or_else(|| format!("daynight '{}': expected D or N", fields[col::DAYNIGHT]))?;

    let key = DetectionKey::new(latitude, longitude, acq_date, acq_time);
    let local_time = key
        .acquired_at()
        .checked_add_signed(local_offset)
        .map(|at| at.time())
        .ok_or_else(|| format!("local time offset {} overflows {}", local_offset, key.acquired_at()))?;

    Ok(FireCandidate {
        key,
        brightness,
        scan,
        track,
        local_time,
        confidence: fields[col::CONFIDENCE].to_string(),
        version: fields[col::VERSION].to_string(),
        bright_t31: optional_decimal(col::BRIGHT_T31, "bright_t31")?,
        frp: optional_decimal(col::FRP, "frp")?,
        daynight,
    })
}

/// `HHMM`; shorter values are zero-padded (`45` is 00:45)
fn parse_acq_time(raw: &str) -> Result<NaiveTime, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("acq_time '{}': expected HHMM", raw));
    }
    let padded = format!("{:0>4}", raw);
    NaiveTime::parse_from_str(&padded, "%H%M").map_err(|e| format!("acq_time '{}': {}", raw, e))
}
