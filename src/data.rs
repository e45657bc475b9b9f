//! Data loading
//!
//! Loads OHLCV bars from CSV files laid out as
//! `datetime,open,high,low,close,volume[,bid,ask]`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::Bar;

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Load bars from a CSV file. Rows with inconsistent prices are skipped.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let file = std::fs::File::open(path.as_ref())
        .with_context(|| format!("Failed to open CSV file {}", path.as_ref().display()))?;
    let bars = read_csv(file)?;
    info!("Loaded {} bars from {}", bars.len(), path.as_ref().display());
    Ok(bars)
}

/// Read bars from any CSV source with a header row
pub fn read_csv<R: Read>(source: R) -> Result<Vec<Bar>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(source);

    let mut bars = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let time = parse_datetime(dt_str)
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .context(format!("Missing {} column", name))?
                .parse::<f64>()
                .context(format!("Failed to parse {} on row {}", name, row_idx + 1))
        };

        let mut bar = Bar::new_unchecked(
            time,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        );

        let has_quote = record.get(6).is_some_and(|s| !s.is_empty())
            && record.get(7).is_some_and(|s| !s.is_empty());
        if has_quote {
            bar = bar.with_quote(field(6, "bid")?, field(7, "ask")?);
        }

        if let Err(e) = bar.validate() {
            warn!(row = row_idx + 1, time = %time, "Skipping bar: {}", e);
            continue;
        }
        bars.push(bar);
    }

    Ok(bars)
}

/// RFC 3339, `%Y-%m-%d %H:%M:%S`, `%Y-%m-%dT%H:%M:%S` or a bare date (midnight UTC)
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").context("Unrecognized datetime format")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap_or_default(),
        Utc,
    ))
}

/// Write bars in the format `read_csv` accepts
pub fn write_csv<W: Write>(bars: &[Bar], sink: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record(["datetime", "open", "high", "low", "close", "volume", "bid", "ask"])?;

    for bar in bars {
        let quote = |v: Option<f64>| v.map(|p| p.to_string()).unwrap_or_default();
        writer.write_record([
            bar.time.format("%Y-%m-%d %H:%M:%S").to_string(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
            quote(bar.bid),
            quote(bar.ask),
        ])?;
    }

    writer.flush().context("Failed to flush CSV output")?;
    Ok(())
}

// =============================================================================
// Data Validation
// =============================================================================

/// Check bar ordering. Bars are assumed time-ordered without gaps.
pub fn validate_bars(bars: &[Bar]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if bars.is_empty() {
        errors.push("No bars provided".to_string());
        return ValidationResult { errors, warnings };
    }

    for (i, pair) in bars.windows(2).enumerate() {
        if pair[1].time < pair[0].time {
            errors.push(format!("Bar {}: earlier than the previous bar", i + 1));
        } else if pair[1].time == pair[0].time {
            warnings.push(format!("Bar {}: duplicate timestamp {}", i + 1, pair[1].time));
        }
    }

    ValidationResult { errors, warnings }
}

/// Result of data validation
#[derive(Debug)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
