use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("Could not open geometry file {0:?}")]
    BadFilePath(PathBuf),
    #[error("Geometry failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Geometry failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Panel {0} has a degenerate basis vector")]
    DegenerateBasis(String),
    #[error("Panel {0} has zero size")]
    EmptyPanel(String),
    #[error("Geometry has no panels")]
    NoPanels,
    #[error("Pixel ({fs}, {ss}) is outside panel {panel}")]
    OutOfPanel { panel: String, fs: f64, ss: f64 },
}

#[derive(Debug, Error)]
pub enum CellError {
    #[error("Could not open cell file {0:?}")]
    BadFilePath(PathBuf),
    #[error("Cell file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Cell file failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Unknown centering symbol {0:?}")]
    BadCentering(char),
    #[error("Unknown lattice type {0:?}")]
    BadLatticeType(String),
    #[error("Unit cell parameters are not physically sensible")]
    NotSensible,
    #[error("Unit cell is singular")]
    Singular,
}

#[derive(Debug, Error)]
pub enum ImageFileError {
    #[error("Image file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Image read failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Dataset {path} has shape {got:?}; panel {panel} wants {want:?}")]
    ShapeMismatch {
        panel: String,
        path: String,
        want: (usize, usize),
        got: Vec<usize>,
    },
    #[error("Event {0} is out of range for this file")]
    BadEvent(usize),
    #[error("Metadata key {0} not found in image file")]
    MissingMetadata(String),
    #[error("Image read failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload truncated while reading {0}")]
    Truncated(&'static str),
    #[error("Payload has unsupported format version {0}")]
    BadVersion(u16),
    #[error("Payload panel count {got} does not match geometry ({want})")]
    PanelCountMismatch { want: usize, got: usize },
    #[error("Payload metadata is not valid UTF-8")]
    BadMetadata,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Input list {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Input list contains no jobs")]
    NoJobs,
    #[error("Image source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PeakSearchError {
    #[error("Unknown peak search method {0:?}")]
    UnknownMethod(String),
    #[error("Peak table read failed: {0}")]
    TableError(#[from] ImageFileError),
    #[error("Peak search needs a payload but the job has none")]
    NoPayload,
    #[error("Peak search method {0} needs a file-backed image")]
    NeedsFile(&'static str),
    #[error("Peak table row {0} refers to a nonexistent panel")]
    BadPanelIndex(usize),
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Unknown indexing method {0:?}")]
    UnknownMethod(String),
    #[error("Indexing method {0} requires a reference unit cell")]
    NeedsCell(String),
    #[error("External indexer {name} timed out after {seconds} s")]
    Timeout { name: String, seconds: u64 },
    #[error("External indexer {name} failed: {reason}")]
    ExternalFailed { name: String, reason: String },
    #[error("External indexer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Injected solutions file failed to parse: {0}")]
    BadSolutionsFile(#[from] serde_yaml::Error),
    #[error("Indexer failed due to cell error: {0}")]
    CellError(#[from] CellError),
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Prediction failed due to cell error: {0}")]
    CellError(#[from] CellError),
    #[error("Prediction given a wavelength <= 0")]
    BadWavelength,
    #[error("Prediction given an empty spectrum")]
    EmptySpectrum,
}

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Refinement ran out of usable reflections")]
    TooFewReflections,
    #[error("Refinement produced a non-finite residual")]
    NonFinite,
    #[error("Refinement failed due to prediction error: {0}")]
    PredictionError(#[from] PredictionError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Chunk for serial {0} emitted out of order")]
    OutOfOrder(u64),
    #[error("Stream is malformed near line {0}")]
    Malformed(usize),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Image load failed: {0}")]
    LoadError(#[from] ImageFileError),
    #[error("Payload unpack failed: {0}")]
    PayloadError(#[from] PayloadError),
    #[error("Peak search failed: {0}")]
    PeakSearchError(#[from] PeakSearchError),
    #[error("Pipeline cancelled")]
    Cancelled,
    #[error("File {0:?} not found after the configured wait")]
    FileWaitExpired(PathBuf),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher failed due to source error: {0}")]
    SourceError(#[from] SourceError),
    #[error("Dispatcher failed due to stream error: {0}")]
    StreamError(#[from] StreamError),
    #[error("Dispatcher failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Dispatcher failed due to geometry error: {0}")]
    GeometryError(#[from] GeometryError),
    #[error("Dispatcher failed due to cell error: {0}")]
    CellError(#[from] CellError),
    #[error("Dispatcher failed due to indexer setup error: {0}")]
    IndexerError(#[from] IndexerError),
    #[error("Dispatcher failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
