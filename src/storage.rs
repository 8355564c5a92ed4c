//! Append-only persistence for measurement data.
//!
//! Every measurement series the engine produces (calibration sweeps and the
//! per-channel tuning series of the neighborhood search) is written to an
//! append-only CSV file, one file per series, with chrono-stamped names. The
//! files are write-once and write-only from the engine's perspective: they
//! exist purely for offline diagnosis and refitting, and nothing in the
//! engine ever reads them back. The neighborhood search in particular has no
//! analytic convergence proof, so its raw series are the only way to inspect
//! what it actually explored.
//!
//! The [`SeriesSink`] trait keeps the searches decoupled from the filesystem;
//! tests use [`NullSeriesSink`].

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::core::{MeasurementSample, SPECTRUM_SIZE};
use crate::error::AppResult;

/// Destination for completed measurement series.
pub trait SeriesSink {
    /// Records one completed series under a descriptive label.
    fn record_series(&mut self, label: &str, samples: &[MeasurementSample]) -> AppResult<()>;
}

/// Discards all series. For tests and dry runs where no diagnosis is wanted.
#[derive(Debug, Default)]
pub struct NullSeriesSink;

impl SeriesSink for NullSeriesSink {
    fn record_series(&mut self, _label: &str, _samples: &[MeasurementSample]) -> AppResult<()> {
        Ok(())
    }
}

/// Writes each series to its own timestamped CSV file in a directory.
///
/// Columns: `volR, volG, volB, x, y, Y, l1..l36`. The spectrum columns stay
/// empty for series measured without a spectrum read.
#[derive(Debug)]
pub struct CsvSeriesSink {
    dir: PathBuf,
}

impl CsvSeriesSink {
    /// Creates the sink, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    /// The directory series files are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn header() -> Vec<String> {
        let mut cols: Vec<String> = ["volR", "volG", "volB", "x", "y", "Y"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cols.extend((1..=SPECTRUM_SIZE).map(|i| format!("l{i}")));
        cols
    }
}

impl SeriesSink for CsvSeriesSink {
    fn record_series(&mut self, label: &str, samples: &[MeasurementSample]) -> AppResult<()> {
        let file_name = format!(
            "{}_{}.csv",
            label,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(file_name);
        let file = File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(Self::header())?;
        for sample in samples {
            let mut record: Vec<String> = sample
                .voltages
                .0
                .iter()
                .map(|v| v.to_string())
                .collect();
            record.push(sample.color.x.to_string());
            record.push(sample.color.y.to_string());
            record.push(sample.color.yy.to_string());
            match &sample.spectrum {
                Some(bins) => record.extend(bins.iter().map(|b| b.to_string())),
                None => record.extend(std::iter::repeat(String::new()).take(SPECTRUM_SIZE)),
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        log::debug!(
            "Recorded series '{}' ({} samples) to {}",
            label,
            samples.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorTriple;
    use crate::core::ControlVector;

    fn sample(spectrum: Option<Vec<f64>>) -> MeasurementSample {
        MeasurementSample {
            voltages: ControlVector::new(1024, 2048, 4095),
            color: ColorTriple::new(0.31, 0.33, 50.0),
            spectrum,
        }
    }

    #[test]
    fn test_series_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSeriesSink::new(dir.path()).unwrap();
        sink.record_series("tune_r10g20b30_iteration1_chred", &[sample(None)])
            .unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tune_r10g20b30_iteration1_chred"));

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("volR,volG,volB,x,y,Y,l1,"));
        assert!(header.ends_with(",l36"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("1024,2048,4095,0.31,0.33,50,"));
        // 6 data columns + 36 (empty) spectrum bins.
        assert_eq!(row.split(',').count(), 6 + SPECTRUM_SIZE);
    }

    #[test]
    fn test_spectrum_bins_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSeriesSink::new(dir.path()).unwrap();
        let bins: Vec<f64> = (0..SPECTRUM_SIZE).map(|i| i as f64 * 0.5).collect();
        sink.record_series("sweep_red", &[sample(Some(bins))])
            .unwrap();

        let path = fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let content = fs::read_to_string(path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert!(row.ends_with("17.5"));
    }
}
