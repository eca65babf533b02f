//! Line oriented filters computing the same monthly means without the pipeline: `map` turns
//! `date,value` lines into `month<TAB>value` pairs, `reduce` averages the pairs of each key of a
//! sorted stream.

use std::fmt::{Display, Formatter};
use std::io::{BufRead, Read, Write};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::aggregate::Accumulator;
use crate::profiler::ResourceUsage;
use crate::record::{Month, SampleSource};

/// Date of the first generated sample line.
const FIRST_DAY: (i32, u32, u32) = (2024, 1, 1);

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0} days after the first day is out of the calendar")]
    DateOutOfRange(usize),
}

/// Why a line was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedLine {
    #[error("expected 2 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid date {0:?}")]
    Date(String),
    #[error("invalid value {0:?}")]
    Value(String),
    #[error("field {0} is not valid UTF-8")]
    Encoding(usize),
}

/// What a filter did, reported on stderr at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStats {
    pub name: &'static str,
    pub processed: usize,
    pub malformed: usize,
    /// Number of distinct keys written, only for the reducer.
    pub keys: Option<usize>,
    pub elapsed: Duration,
    pub memory_start: f64,
    pub memory_end: f64,
}

impl FilterStats {
    fn start(name: &'static str) -> (Self, Instant) {
        let stats = Self {
            name,
            processed: 0,
            malformed: 0,
            keys: None,
            elapsed: Duration::ZERO,
            memory_start: megabytes(ResourceUsage::now().resident_bytes),
            memory_end: 0.0,
        };
        (stats, Instant::now())
    }

    fn finish(mut self, start: Instant) -> Self {
        self.elapsed = start.elapsed();
        self.memory_end = megabytes(ResourceUsage::now().resident_bytes);
        self
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl Display for FilterStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} PERFORMANCE:", self.name.to_uppercase())?;
        writeln!(f, "Total lines processed: {}", self.processed)?;
        writeln!(f, "Lines with errors: {}", self.malformed)?;
        if let Some(keys) = self.keys {
            writeln!(f, "Unique months processed: {}", keys)?;
        }
        writeln!(f, "Execution time: {:.4} seconds", self.elapsed.as_secs_f64())?;
        write!(
            f,
            "Memory usage - Start: {:.2} MB, End: {:.2} MB",
            self.memory_start, self.memory_end
        )
    }
}

/// Parse the month and the value of a `YYYY-MM-DD,value` line.
fn parse_reading(record: &csv::ByteRecord) -> Result<(Month, f64), MalformedLine> {
    if record.len() != 2 {
        return Err(MalformedLine::FieldCount(record.len()));
    }
    let field = move |i: usize| {
        std::str::from_utf8(&record[i]).map_err(|_| MalformedLine::Encoding(i))
    };
    let (date, value) = (field(0)?, field(1)?);
    let month = date
        .split('-')
        .nth(1)
        .and_then(|m| m.parse::<u8>().ok())
        .and_then(|m| Month::new(m).ok())
        .ok_or_else(|| MalformedLine::Date(date.to_string()))?;
    let value = value
        .parse::<f64>()
        .map_err(|_| MalformedLine::Value(value.to_string()))?;
    Ok((month, value))
}

/// Read `date,value` lines and write `month<TAB>value` lines.
///
/// Every line is split on its own: quotes are plain characters. Malformed lines, including the
/// ones that are not valid UTF-8, are skipped and counted. Empty lines are ignored.
pub fn map<R: Read, W: Write>(reader: R, mut writer: W) -> Result<FilterStats, FilterError> {
    let (mut stats, start) = FilterStats::start("mapper");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .quoting(false)
        .from_reader(reader);

    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        match parse_reading(&record) {
            Ok((month, value)) => {
                writeln!(writer, "{month}\t{value}")?;
                stats.processed += 1;
            }
            Err(e) => {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                warn!("skipping line {}: {}", line, e);
                stats.malformed += 1;
            }
        }
    }
    writer.flush()?;
    Ok(stats.finish(start))
}

/// Read `key<TAB>value` lines sorted by key and write `key<TAB>mean` for every run of equal keys.
///
/// Only the group being read is kept in memory. Malformed lines are skipped and counted, empty
/// lines are ignored.
pub fn reduce<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
) -> Result<FilterStats, FilterError> {
    let (mut stats, start) = FilterStats::start("reducer");
    let mut keys = 0;
    let mut current: Option<(String, Accumulator)> = None;

    let mut buf = Vec::new();
    let mut index = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        index += 1;
        let parsed = match std::str::from_utf8(&buf).map(str::trim) {
            Ok("") => continue,
            Ok(line) => parse_pair(line),
            Err(_) => Err(MalformedLine::Encoding(0)),
        };
        let (key, value) = match parsed {
            Ok(pair) => pair,
            Err(e) => {
                warn!("skipping line {}: {}", index, e);
                stats.malformed += 1;
                continue;
            }
        };
        match current.as_mut() {
            Some((current_key, acc)) if current_key.as_str() == key => acc.push(value),
            _ => {
                if let Some((done, acc)) = current.replace((key.to_string(), Accumulator::new(value)))
                {
                    writeln!(writer, "{}\t{:.2}", done, acc.mean())?;
                    keys += 1;
                }
            }
        }
        stats.processed += 1;
    }
    if let Some((done, acc)) = current {
        writeln!(writer, "{}\t{:.2}", done, acc.mean())?;
        keys += 1;
    }
    writer.flush()?;
    stats.keys = Some(keys);
    Ok(stats.finish(start))
}

/// Split a `key<TAB>value` line.
fn parse_pair(line: &str) -> Result<(&str, f64), MalformedLine> {
    match line.split('\t').collect::<Vec<_>>()[..] {
        [key, value] => value
            .trim()
            .parse::<f64>()
            .map(|v| (key, v))
            .map_err(|_| MalformedLine::Value(value.to_string())),
        ref fields => Err(MalformedLine::FieldCount(fields.len())),
    }
}

/// Write `records` lines of sample data: one day per line starting from 2024-01-01, with a normally
/// distributed temperature rounded to two decimals.
pub fn write_samples<W: Write>(
    records: usize,
    seed: Option<u64>,
    mut writer: W,
) -> Result<(), FilterError> {
    let (year, month, day) = FIRST_DAY;
    let first = NaiveDate::from_ymd_opt(year, month, day).ok_or(FilterError::DateOutOfRange(0))?;
    let mut source = SampleSource::new(seed);
    for i in 0..records {
        let date = first
            .checked_add_days(Days::new(i as u64))
            .ok_or(FilterError::DateOutOfRange(i))?;
        writeln!(writer, "{},{:.2}", date.format("%Y-%m-%d"), source.temperature())?;
    }
    writer.flush()?;
    info!("generated {} sample lines", records);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn run_map(input: &str) -> (String, FilterStats) {
        let mut out = Vec::new();
        let stats = map(input.as_bytes(), &mut out).unwrap();
        (String::from_utf8(out).unwrap(), stats)
    }

    fn run_reduce(input: &str) -> (String, FilterStats) {
        let mut out = Vec::new();
        let stats = reduce(Cursor::new(input), &mut out).unwrap();
        (String::from_utf8(out).unwrap(), stats)
    }

    #[test]
    fn mapper_extracts_the_month() {
        let (out, stats) = run_map("2024-01-01,23.5\n2024-02-10,-4\n\n2024-12-31, 7.25\n");
        assert_eq!(out, "01\t23.5\n02\t-4\n12\t7.25\n");
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.malformed, 0);
    }

    #[test]
    fn mapper_skips_malformed_lines() {
        let (out, stats) =
            run_map("2024-01-01,1.0\nnot a line\n2024-13-01,2.0\n2024-03-01,warm\n2024-03-02,1,2\n");
        assert_eq!(out, "01\t1\n");
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.malformed, 4);
    }

    #[test]
    fn mapper_treats_quotes_as_plain_characters() {
        let (out, stats) = run_map("2024-01-01,\"1.0\n2024-01-02,2.0\n2024-01-03,3.0\n");
        assert_eq!(out, "01\t2\n01\t3\n");
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn mapper_skips_invalid_utf8() {
        let mut out = Vec::new();
        let stats = map(
            &b"2024-01-01,1.0\n2024-01-02,\xff\n2024-01-03,3.0\n"[..],
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"01\t1\n01\t3\n");
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(
            parse_reading(&csv::ByteRecord::from(vec![&b"2024-01-02"[..], &b"\xff"[..]])),
            Err(MalformedLine::Encoding(1))
        );
    }

    #[test]
    fn reducer_averages_runs() {
        let (out, stats) = run_reduce("01\t10\n01\t20\n02\t5\n\n03\t1\n03\t2\n");
        assert_eq!(out, "01\t15.00\n02\t5.00\n03\t1.50\n");
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.keys, Some(3));
    }

    #[test]
    fn reducer_skips_malformed_lines() {
        let (out, stats) = run_reduce("01\t10\n01 missing tab\n01\tcold\n01\t20\n");
        assert_eq!(out, "01\t15.00\n");
        assert_eq!(stats.malformed, 2);
    }

    #[test]
    fn reducer_skips_invalid_utf8() {
        let mut out = Vec::new();
        let stats = reduce(&b"01\t10\n01\t\xfe\xff\n01\t20\n02\t4"[..], &mut out).unwrap();
        assert_eq!(out, b"01\t15.00\n02\t4.00\n");
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.keys, Some(2));
    }

    #[test]
    fn reducer_of_nothing() {
        let (out, stats) = run_reduce("");
        assert!(out.is_empty());
        assert_eq!(stats.keys, Some(0));
    }

    #[test]
    fn samples_through_the_filters() {
        let mut data = Vec::new();
        write_samples(70, Some(11), &mut data).unwrap();
        let text = String::from_utf8(data.clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 70);
        assert!(lines[0].starts_with("2024-01-01,"));
        assert!(lines[31].starts_with("2024-02-01,"));
        let decimals = lines[0].split('.').nth(1).unwrap();
        assert_eq!(decimals.len(), 2);

        let mut mapped = Vec::new();
        map(&data[..], &mut mapped).unwrap();
        let mut reduced = Vec::new();
        reduce(&mapped[..], &mut reduced).unwrap();
        let reduced = String::from_utf8(reduced).unwrap();
        let keys: Vec<_> = reduced.lines().map(|l| &l[..2]).collect();
        assert_eq!(keys, vec!["01", "02", "03"]);
    }

    #[test]
    fn stats_display() {
        let stats = FilterStats {
            name: "reducer",
            processed: 4,
            malformed: 1,
            keys: Some(2),
            elapsed: Duration::from_millis(1500),
            memory_start: 1.0,
            memory_end: 2.5,
        };
        assert_eq!(
            stats.to_string(),
            "REDUCER PERFORMANCE:\nTotal lines processed: 4\nLines with errors: 1\n\
             Unique months processed: 2\nExecution time: 1.5000 seconds\n\
             Memory usage - Start: 1.00 MB, End: 2.50 MB"
        );
    }
}
