//! CSV trace sink
//!
//! One row per attribution sample, with a column group per socket. At most
//! one row is buffered; every append is flushed so a partial run still
//! leaves a usable trace on disk.

use crate::attribution::SocketAttribution;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Append-only CSV writer for sample rows
#[derive(Debug)]
pub struct TraceSink {
    writer: BufWriter<File>,
    num_sockets: usize,
    last_timestamp: Option<DateTime<Utc>>,
    rows_written: u64,
}

impl TraceSink {
    /// Create the trace file and write the header row
    pub fn create(path: &Path, num_sockets: usize) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut sink = Self {
            writer: BufWriter::new(file),
            num_sockets,
            last_timestamp: None,
            rows_written: 0,
        };
        let header = sink.header();
        sink.writer.write_all(header.as_bytes())?;
        sink.writer.write_all(b"\n")?;
        sink.writer.flush()?;
        Ok(sink)
    }

    fn header(&self) -> String {
        let mut columns = vec!["timestamp_iso8601".to_string(), "interval_s".to_string()];
        for s in 0..self.num_sockets {
            for name in [
                "host_cpu_j",
                "host_dram_j",
                "target_cpu_j",
                "target_dram_j",
                "cpu_share",
                "dram_share",
                "n_threads",
            ] {
                columns.push(format!("{}_s{}", name, s));
            }
        }
        columns.push("note".to_string());
        columns.join(",")
    }

    /// Append one sample row and flush it to disk. Rows whose timestamp
    /// does not advance are dropped to keep the trace strictly ordered.
    /// Returns whether the row was written.
    pub fn append(
        &mut self,
        timestamp: DateTime<Utc>,
        interval_s: f64,
        rows: &[SocketAttribution],
    ) -> Result<bool> {
        debug_assert_eq!(rows.len(), self.num_sockets);

        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                warn!(%timestamp, %last, "non-increasing timestamp, row dropped");
                return Ok(false);
            }
        }

        let mut fields = vec![
            timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            fmt_value(interval_s),
        ];
        let mut clamped = false;
        for row in rows {
            fields.push(fmt_value(row.host_cpu_j));
            fields.push(fmt_value(row.host_dram_j));
            fields.push(fmt_value(row.target_cpu_j));
            fields.push(fmt_value(row.target_dram_j));
            fields.push(fmt_value(row.cpu_share));
            fields.push(fmt_value(row.dram_share));
            fields.push(row.n_threads.to_string());
            clamped |= row.share_clamped;
        }
        fields.push(if clamped {
            "share_clamped".to_string()
        } else {
            String::new()
        });

        self.writer.write_all(fields.join(",").as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        self.last_timestamp = Some(timestamp);
        self.rows_written += 1;
        Ok(true)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Final flush on the way out of any loop state
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Plain decimal with at least six significant digits; NaN stays the
/// literal `NaN`
fn fmt_value(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value == 0.0 {
        return "0.000000".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).max(0) as usize;
    format!("{:.*}", decimals, value)
}
