//! CSV export of sweep reports, behind the `storage_csv` feature.
//!
//! Each report becomes one file named `sweep_<timestamp>_<direction>.csv`.
//! The file starts with the report metadata as pretty JSON, one `# `-prefixed
//! line per JSON line, followed by a header row and one row per sample:
//!
//! ```text
//! # {
//! #   "direction": "forward",
//! #   ...
//! # }
//! index,voltage_V,current_A,saturated
//! 0,-1,-0.001,false
//! ```
use super::SweepReport;
use crate::error::AppResult;
use std::path::{Path, PathBuf};

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::data::FitResult;
    use crate::measurement::Direction;
    use crate::plan::SourceVariable;
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::fs::File;
    use std::io::{self, Write};
    use tracing::info;

    #[derive(Serialize)]
    struct ReportMetadata<'a> {
        direction: Direction,
        acquired_at: DateTime<Utc>,
        source: SourceVariable,
        compliance: f64,
        points: usize,
        saturated: usize,
        fit: &'a FitResult,
    }

    /// Writes each [`SweepReport`] to its own CSV file.
    #[derive(Debug, Clone)]
    pub struct CsvRecorder {
        directory: PathBuf,
    }

    impl CsvRecorder {
        /// Record into `directory`, created on first write if missing.
        pub fn new(directory: impl Into<PathBuf>) -> Self {
            Self {
                directory: directory.into(),
            }
        }

        /// Output directory.
        pub fn directory(&self) -> &Path {
            &self.directory
        }

        /// Write `report` and return the path of the new file.
        ///
        /// # Errors
        /// [`crate::error::SweepError::Io`] if the directory or file cannot be written.
        pub fn write_report(&self, report: &SweepReport) -> AppResult<PathBuf> {
            if !self.directory.exists() {
                std::fs::create_dir_all(&self.directory)?;
            }
            let file_name = format!(
                "sweep_{}_{}.csv",
                report.acquired_at.format("%Y%m%d_%H%M%S%.3f"),
                report.direction
            );
            let path = self.directory.join(file_name);
            let mut file = File::create(&path)?;

            let metadata = ReportMetadata {
                direction: report.direction,
                acquired_at: report.acquired_at,
                source: report.data.source(),
                compliance: report.data.compliance(),
                points: report.data.len(),
                saturated: report.data.saturated_count(),
                fit: &report.fit,
            };
            let json_string = serde_json::to_string_pretty(&metadata).map_err(io::Error::from)?;
            for line in json_string.lines() {
                file.write_all(b"# ")?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(["index", "voltage_V", "current_A", "saturated"])
                .map_err(io::Error::from)?;
            let voltages = report.data.voltages();
            let currents = report.data.currents();
            for (index, sample) in report.data.samples().iter().enumerate() {
                writer
                    .write_record(&[
                        index.to_string(),
                        voltages[index].to_string(),
                        currents[index].to_string(),
                        sample.saturated.to_string(),
                    ])
                    .map_err(io::Error::from)?;
            }
            writer.flush()?;

            info!("Wrote {} sweep to '{}'", report.direction, path.display());
            Ok(path)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::SweepError;

    /// Placeholder used when the `storage_csv` feature is off.
    #[derive(Debug, Clone)]
    pub struct CsvRecorder {
        directory: PathBuf,
    }

    impl CsvRecorder {
        /// Record into `directory`.
        pub fn new(directory: impl Into<PathBuf>) -> Self {
            Self {
                directory: directory.into(),
            }
        }

        /// Output directory.
        pub fn directory(&self) -> &Path {
            &self.directory
        }

        /// Always fails: CSV support was not compiled in.
        pub fn write_report(&self, _report: &SweepReport) -> AppResult<PathBuf> {
            Err(SweepError::Validation(
                "CSV export requires the 'storage_csv' feature".to_string(),
            ))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvRecorder;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvRecorder;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::data::CurveFitter;
    use crate::measurement::{Direction, SweepData, SweepSample};
    use crate::plan::SourceVariable;

    #[test]
    fn test_report_written_with_metadata_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut samples: Vec<SweepSample> = (0..5)
            .map(|i| {
                let v = -1.0 + 0.5 * i as f64;
                SweepSample::new(v, v / 1000.0)
            })
            .collect();
        samples[4].saturated = true;
        let data = SweepData::new(SourceVariable::Voltage, Direction::Reverse, 1e-3, samples);
        let fit = CurveFitter::new().fit(&data).unwrap();
        let report = SweepReport::new(data, fit);

        let recorder = CsvRecorder::new(dir.path().join("out"));
        let path = recorder.write_report(&report).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_reverse.csv"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let (comments, table): (Vec<&str>, Vec<&str>) =
            contents.lines().partition(|l| l.starts_with('#'));
        assert!(comments.iter().any(|l| l.contains("\"direction\": \"reverse\"")));
        assert!(comments.iter().any(|l| l.contains("\"saturated\": 1")));
        assert_eq!(table[0], "index,voltage_V,current_A,saturated");
        assert_eq!(table.len(), 6);
        assert_eq!(table[1], "0,-1,-0.001,false");
        assert!(table[5].ends_with(",true"));
    }

    #[test]
    fn test_current_source_columns_are_swapped() {
        let dir = tempfile::tempdir().unwrap();
        let samples = (1..=3)
            .map(|i| SweepSample::new(i as f64 * 1e-3, i as f64))
            .collect();
        let data = SweepData::new(SourceVariable::Current, Direction::Forward, 10.0, samples);
        let fit = CurveFitter::new().fit(&data).unwrap();
        let path = CsvRecorder::new(dir.path())
            .write_report(&SweepReport::new(data, fit))
            .unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let first_row = contents
            .lines()
            .find(|l| l.starts_with("0,"))
            .unwrap();
        assert_eq!(first_row, "0,1,0.001,false");
    }
}
