//! Delimited trial log: one row per stimulation start and frequency update

use crate::controller::ControllerUpdate;
use chrono::{DateTime, Utc};
use cls_core::{ClsError, ClsResult};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const HEADER: [&str; 7] = ["trial", "block", "timestamp", "old_frequency", "new_frequency", "block_type", "result"];

#[derive(Debug, Clone, Serialize)]
pub struct TrialLogRow {
    pub trial: u32,
    pub block: u64,
    pub timestamp: DateTime<Utc>,
    pub old_frequency: f64,
    pub new_frequency: f64,
    pub block_type: String,
    pub result: String,
}

impl TrialLogRow {
    pub fn from_update(trial: u32, block: u64, update: &ControllerUpdate) -> Self {
        Self {
            trial,
            block,
            timestamp: Utc::now(),
            old_frequency: update.old_frequency,
            new_frequency: update.new_frequency,
            block_type: update.block_type.to_string(),
            result: update.tag.to_string(),
        }
    }
}

fn log_error(e: impl std::fmt::Display) -> ClsError {
    ClsError::LogError { reason: e.to_string() }
}

pub struct TrialLog<W: Write> {
    writer: csv::Writer<W>,
    rows: usize,
}

impl TrialLog<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> ClsResult<Self> {
        let file = File::create(path.as_ref()).map_err(log_error)?;
        tracing::info!(path = %path.as_ref().display(), "trial log opened");
        Self::from_writer(file)
    }
}

impl<W: Write> TrialLog<W> {
    /// Writes the header right away, so a run without updates still leaves one
    pub fn from_writer(writer: W) -> ClsResult<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
        writer.write_record(HEADER).map_err(log_error)?;
        writer.flush().map_err(log_error)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn record(&mut self, row: &TrialLogRow) -> ClsResult<()> {
        self.writer.serialize(row).map_err(log_error)?;
        self.writer.flush().map_err(log_error)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> ClsResult<W> {
        self.writer.into_inner().map_err(log_error)
    }
}

/// Trial log held by the protocol, whatever it writes into
pub trait TrialSink: Send {
    fn record(&mut self, row: &TrialLogRow) -> ClsResult<()>;
}

impl<W: Write + Send> TrialSink for TrialLog<W> {
    fn record(&mut self, row: &TrialLogRow) -> ClsResult<()> {
        TrialLog::record(self, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{BlockType, ResultTag};

    #[test]
    fn test_header_and_rows() {
        let mut log = TrialLog::from_writer(Vec::new()).unwrap();
        let update = ControllerUpdate {
            old_frequency: 30.0,
            new_frequency: 32.0,
            block_type: BlockType::ExploreHigh,
            tag: ResultTag::Explore,
        };
        log.record(&TrialLogRow::from_update(1, 4, &update)).unwrap();
        log.record(&TrialLogRow::from_update(1, 8, &update)).unwrap();
        assert_eq!(log.rows(), 2);

        let text = String::from_utf8(log.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "trial,block,timestamp,old_frequency,new_frequency,block_type,result");
        assert!(lines[1].starts_with("1,4,"));
        assert!(lines[1].ends_with(",30.0,32.0,explore_high,explore"));
    }

    #[test]
    fn test_header_written_at_creation() {
        let path = std::env::temp_dir().join(format!("trial_log_header_{}.csv", std::process::id()));
        let log = TrialLog::create(&path).unwrap();
        assert_eq!(log.rows(), 0);

        let text = std::fs::read_to_string(&path).unwrap();
        drop(log);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(text, "trial,block,timestamp,old_frequency,new_frequency,block_type,result\n");
    }
}
