//! A results-injector backend: replays indexing solutions from a YAML file.
//! Useful for debugging the downstream pipeline and for reproducible tests
//! of multi-lattice extraction.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::cell::UnitCell;
use super::error::IndexerError;
use super::geometry::Detector;
use super::image::Image;
use super::indexing::Indexer;
use super::peaks::PeakList;

/// One injected solution: real-space axes in Angstrom, lab frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectedCell {
    pub a: [f64; 3],
    pub b: [f64; 3],
    pub c: [f64; 3],
}

/// One entry of the solutions file. Without a filename the entry applies to
/// every image; with one it must match, and the event too when given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionEntry {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    pub cells: Vec<InjectedCell>,
}

pub struct FileIndexer {
    entries: Vec<SolutionEntry>,
}

impl FileIndexer {
    pub fn from_file(path: &Path) -> Result<Self, IndexerError> {
        let text = std::fs::read_to_string(path)?;
        let entries: Vec<SolutionEntry> = serde_yaml::from_str(&text)?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<SolutionEntry>) -> Self {
        Self { entries }
    }
}

impl Indexer for FileIndexer {
    fn name(&self) -> &str {
        "file"
    }

    fn index(
        &self,
        image: &Image,
        _det: &Detector,
        _peaks: &PeakList,
    ) -> Result<Vec<UnitCell>, IndexerError> {
        let mut cells = Vec::new();
        for entry in &self.entries {
            if let Some(f) = &entry.filename {
                if *f != image.filename {
                    continue;
                }
            }
            if let Some(ev) = &entry.event {
                if Some(ev) != image.event.as_ref() {
                    continue;
                }
            }
            for ic in &entry.cells {
                let scale = 1e-10;
                cells.push(UnitCell::from_cartesian(
                    [ic.a[0] * scale, ic.a[1] * scale, ic.a[2] * scale],
                    [ic.b[0] * scale, ic.b[1] * scale, ic.b[2] * scale],
                    [ic.c[0] * scale, ic.c[1] * scale, ic.c[2] * scale],
                ));
            }
        }
        Ok(cells)
    }
}
