//! Out-of-process indexer backends.
//!
//! The tool is handed a peak table in a scratch directory and is expected
//! to print candidate cells on stdout, one per line:
//!
//! ```text
//! cell <ax> <ay> <az> <bx> <by> <bz> <cx> <cy> <cz>
//! ```
//!
//! where the nine numbers are the reciprocal axes in m^-1. Anything else on
//! stdout is ignored. The invocation is bounded by a wall-clock timeout;
//! an overrunning tool is killed and reported failed for this image only.

use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::cell::UnitCell;
use super::config::ExternalCommand;
use super::error::IndexerError;
use super::geometry::Detector;
use super::image::Image;
use super::indexing::Indexer;
use super::peaks::PeakList;

pub struct ExternalIndexer {
    spec: ExternalCommand,
    temp_dir: PathBuf,
    timeout_secs: u64,
}

impl ExternalIndexer {
    pub fn new(spec: ExternalCommand, temp_dir: PathBuf, timeout_secs: u64) -> Self {
        Self {
            spec,
            temp_dir,
            timeout_secs,
        }
    }

    fn write_peak_table(
        &self,
        scratch: &tempfile::TempDir,
        peaks: &PeakList,
    ) -> Result<PathBuf, IndexerError> {
        let path = scratch.path().join("peaks.txt");
        let mut file = std::fs::File::create(&path)?;
        for p in peaks {
            writeln!(file, "{} {} {} {}", p.fs, p.ss, p.panel, p.intensity)?;
        }
        Ok(path)
    }

    fn parse_cells(stdout: &str) -> Vec<UnitCell> {
        let mut cells = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("cell") {
                continue;
            }
            let nums: Vec<f64> = parts.filter_map(|t| t.parse().ok()).collect();
            if nums.len() != 9 {
                continue;
            }
            if let Ok(cell) = UnitCell::from_reciprocal(
                [nums[0], nums[1], nums[2]],
                [nums[3], nums[4], nums[5]],
                [nums[6], nums[7], nums[8]],
            ) {
                cells.push(cell);
            }
        }
        cells
    }
}

impl Indexer for ExternalIndexer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn index(
        &self,
        image: &Image,
        _det: &Detector,
        peaks: &PeakList,
    ) -> Result<Vec<UnitCell>, IndexerError> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("snapindex-{}-", self.spec.name))
            .tempdir_in(&self.temp_dir)?;
        let peaks_path = self.write_peak_table(&scratch, peaks)?;

        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .arg(&peaks_path)
            .env("SNAPINDEX_LAMBDA_M", format!("{}", image.lambda))
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| IndexerError::ExternalFailed {
                name: self.spec.name.clone(),
                reason: format!("spawn failed: {e}"),
            })?;

        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(IndexerError::Timeout {
                            name: self.spec.name.clone(),
                            seconds: self.timeout_secs,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }

        if !status.success() {
            return Err(IndexerError::ExternalFailed {
                name: self.spec.name.clone(),
                reason: format!("exit status {status}"),
            });
        }

        Ok(Self::parse_cells(&stdout))
    }
}
