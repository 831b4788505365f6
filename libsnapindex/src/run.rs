//! Top-level wiring: build every component from a Config and drive the
//! dispatcher over an image source. This is what the CLI (or any embedding
//! application) calls; it is also the entry point of the end-to-end tests.

use std::sync::Arc;

use super::cell::UnitCell;
use super::config::Config;
use super::dispatcher::{Dispatcher, ProcessorFactory};
use super::error::DispatchError;
use super::geometry::Detector;
use super::indexing::IndexingDriver;
use super::pipeline::PipelineProcessor;
use super::predict;
use super::source::{ImageSource, ListFileSource};
use super::stream::{HeaderInfo, StreamWriter};
use super::worker_status::{SharedState, Totals};

/// Load the immutable run inputs, run the dispatcher over `source`, and
/// write the stream through `writer`. Configuration problems surface here,
/// before any worker is spawned.
pub fn run_with_source(
    config: Config,
    source: &mut dyn ImageSource,
    writer: &mut StreamWriter,
    shared: Arc<SharedState>,
    command_line: &str,
) -> Result<Totals, DispatchError> {
    config.validate()?;

    let det = Arc::new(Detector::from_file(&config.geometry_path)?);
    let cell: Option<UnitCell> = match &config.cell_path {
        Some(path) => Some(UnitCell::from_file(path)?),
        None => None,
    };

    // A representative wavelength for the prediction ceiling; per-image
    // values are read during processing
    let nominal_lambda = det
        .beam
        .photon_energy_ev
        .map(super::constants::ev_to_m)
        .unwrap_or(1.3e-10);
    let max_res = predict::largest_q(&det, nominal_lambda);
    let driver = Arc::new(IndexingDriver::new(&config, cell.clone(), max_res)?);

    writer.write_header(&HeaderInfo {
        command_line: command_line.to_string(),
        geometry_digest: format!("{:?}: {}", config.geometry_path, det.digest()),
        cell_summary: cell.as_ref().map(|c| c.to_string()),
        indexing_methods: config.indexing_methods.clone(),
    })?;

    let dispatcher = Dispatcher::new(
        config.n_workers,
        std::time::Duration::from_secs(config.stall_timeout_secs),
        config.reorder_buffer,
    );

    let config = Arc::new(config);
    let factory: ProcessorFactory = {
        let config = Arc::clone(&config);
        let det = Arc::clone(&det);
        let driver = Arc::clone(&driver);
        let shared_for_workers = Arc::clone(&shared);
        Box::new(move |worker_id, health| {
            Box::new(PipelineProcessor::new(
                Arc::clone(&config),
                Arc::clone(&det),
                Arc::clone(&driver),
                Arc::clone(&shared_for_workers),
                health,
                worker_id,
            ))
        })
    };

    let totals = dispatcher.run(source, factory, writer, shared)?;
    spdlog::info!(
        "{} images processed, {} hits, {} indexable, {} crystals, {} failed",
        totals.n_processed,
        totals.n_hits,
        totals.n_had_crystals,
        totals.n_crystals,
        totals.n_failed
    );
    Ok(totals)
}

/// The standard file-list entry point
pub fn run_list_file(
    config: Config,
    shared: Arc<SharedState>,
    command_line: &str,
) -> Result<Totals, DispatchError> {
    let list_path = config
        .input_list_path
        .clone()
        .ok_or_else(|| DispatchError::ConfigError(super::error::ConfigError::Invalid(
            String::from("input_list_path is required"),
        )))?;
    let mut source = ListFileSource::from_file(&list_path)?;
    let mut writer = StreamWriter::create(&config.output_stream_path)
        .map_err(DispatchError::StreamError)?;
    let totals = run_with_source(config, &mut source, &mut writer, shared, command_line)?;
    writer.close().map_err(DispatchError::StreamError)?;
    Ok(totals)
}
