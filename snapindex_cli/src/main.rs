//! # snapindex_cli
//!
//! The command line frontend for the snapindex engine.
//!
//! ## Use
//!
//! To process a run:
//!
//! ```bash
//! snapindex -p/--path <your_configuration.yaml>
//! ```
//!
//! To generate a configuration template file:
//!
//! ```bash
//! snapindex -p/--path <your_configuration.yaml> new
//! ```
//!
//! Frequently-changed configuration fields can be overridden from the
//! command line; see `snapindex --help`. The configuration file documents
//! everything else: geometry and cell paths, peak search thresholds,
//! indexing methods and tolerances, integration radii and the stream
//! content switches.

use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsnapindex::config::Config;
use libsnapindex::run::run_list_file;
use libsnapindex::worker_status::SharedState;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn apply_overrides(config: &mut Config, matches: &clap::ArgMatches) {
    if let Some(v) = matches.get_one::<String>("input") {
        config.input_list_path = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.get_one::<String>("output") {
        config.output_stream_path = PathBuf::from(v);
    }
    if let Some(v) = matches.get_one::<String>("geometry") {
        config.geometry_path = PathBuf::from(v);
    }
    if let Some(v) = matches.get_one::<String>("cell") {
        config.cell_path = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.get_one::<String>("indexing") {
        config.indexing_methods = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = matches.get_one::<String>("min-peaks") {
        config.min_peaks = v.parse().expect("--min-peaks takes an integer");
    }
    if let Some(v) = matches.get_one::<String>("jobs") {
        config.n_workers = v.parse().expect("-j takes an integer");
    }
    if let Some(v) = matches.get_one::<String>("tolerance") {
        let parts: Vec<f64> = v
            .split(',')
            .map(|t| t.trim().parse().expect("--tolerance takes numbers"))
            .collect();
        match parts.len() {
            4 => {
                config.tolerances =
                    [parts[0], parts[1], parts[2], parts[3], parts[3], parts[3]];
            }
            6 => config.tolerances = [parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]],
            _ => panic!("--tolerance takes 4 or 6 comma-separated values"),
        }
    }
    if let Some(v) = matches.get_one::<String>("int-radius") {
        let parts: Vec<f64> = v
            .split(',')
            .map(|t| t.trim().parse().expect("--int-radius takes numbers"))
            .collect();
        assert_eq!(parts.len(), 3, "--int-radius takes inn,mid,out");
        config.int_radii = [parts[0], parts[1], parts[2]];
    }
    if let Some(v) = matches.get_one::<String>("peak-radius") {
        let parts: Vec<f64> = v
            .split(',')
            .map(|t| t.trim().parse().expect("--peak-radius takes numbers"))
            .collect();
        assert_eq!(parts.len(), 3, "--peak-radius takes inn,mid,out");
        config.peak_radii = [parts[0], parts[1], parts[2]];
    }
    if let Some(v) = matches.get_one::<String>("peaks") {
        config.peak_method =
            serde_yaml::from_str(v).expect("--peaks takes a peak method name");
    }
    if let Some(v) = matches.get_one::<String>("integration") {
        config.int_method =
            serde_yaml::from_str(v).expect("--integration takes a method name");
    }
    if let Some(v) = matches.get_one::<String>("push-res") {
        config.push_res = v.parse().expect("--push-res takes a number (nm^-1)");
    }
    if let Some(v) = matches.get_one::<String>("highres") {
        config.highres = Some(v.parse().expect("--highres takes a number (Angstrom)"));
    }
    if let Some(v) = matches.get_one::<String>("wait-for-file") {
        config.wait_for_file = v.parse().expect("--wait-for-file takes an integer");
    }
    if let Some(v) = matches.get_one::<String>("temp-dir") {
        config.temp_dir = PathBuf::from(v);
    }
    if matches.get_flag("no-refine") {
        config.refine = false;
    }
    if matches.get_flag("no-retry") {
        config.retry = false;
    }
    if matches.get_flag("multi") {
        config.multi = true;
    }
    if matches.get_flag("no-check-cell") {
        config.check_cell_axes = false;
        config.check_cell_combinations = false;
    }
    if matches.get_flag("no-check-peaks") {
        config.check_peaks = false;
    }
}

fn count_list_entries(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    let mut n = 0u64;
    for line in reader.lines() {
        let line = line.ok()?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            n += 1;
        }
    }
    Some(n)
}

fn main() {
    // Create a cli
    let matches = Command::new("snapindex")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file"),
        )
        .arg(Arg::new("input").short('i').long("input").help("Image list file"))
        .arg(Arg::new("output").short('o').long("output").help("Output stream path"))
        .arg(Arg::new("geometry").short('g').long("geometry").help("Geometry file"))
        .arg(Arg::new("cell").long("cell").help("Reference unit cell file"))
        .arg(Arg::new("indexing").long("indexing").help("Comma-separated indexing methods"))
        .arg(Arg::new("peaks").long("peaks").help("Peak search method"))
        .arg(Arg::new("min-peaks").long("min-peaks").help("Minimum peaks for a hit"))
        .arg(Arg::new("tolerance").long("tolerance").help("Cell tolerances a,b,c,ang (%, deg)"))
        .arg(Arg::new("peak-radius").long("peak-radius").help("Peak radii inn,mid,out"))
        .arg(Arg::new("int-radius").long("int-radius").help("Integration radii inn,mid,out"))
        .arg(Arg::new("integration").long("integration").help("Integration method"))
        .arg(Arg::new("push-res").long("push-res").help("Integrate this far past the peak resolution (nm^-1)"))
        .arg(Arg::new("highres").long("highres").help("High resolution cutoff (Angstrom)"))
        .arg(Arg::new("wait-for-file").long("wait-for-file").help("Seconds to wait for missing files (-1 forever)"))
        .arg(Arg::new("temp-dir").long("temp-dir").help("Scratch directory for external indexers"))
        .arg(Arg::new("jobs").short('j').help("Number of parallel workers"))
        .arg(Arg::new("no-refine").long("no-refine").action(ArgAction::SetTrue).help("Skip prediction refinement"))
        .arg(Arg::new("no-retry").long("no-retry").action(ArgAction::SetTrue).help("Don't retry indexing with fewer peaks"))
        .arg(Arg::new("multi").long("multi").action(ArgAction::SetTrue).help("Attempt multi-lattice indexing"))
        .arg(Arg::new("no-check-cell").long("no-check-cell").action(ArgAction::SetTrue).help("Don't check candidate cells against the reference"))
        .arg(Arg::new("no-check-peaks").long("no-check-peaks").action(ArgAction::SetTrue).help("Don't check predictions against found peaks"))
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let mut config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &matches);
    if let Err(e) = config.validate() {
        log::error!("{e}");
        std::process::exit(1);
    }

    log::info!("Geometry: {}", config.geometry_path.to_string_lossy());
    log::info!("Output stream: {}", config.output_stream_path.to_string_lossy());
    log::info!("Indexing methods: {}", config.indexing_methods.join(","));
    log::info!("Workers: {}", config.n_workers);

    let n_jobs = config
        .input_list_path
        .as_deref()
        .and_then(count_list_entries)
        .unwrap_or(0);

    let command_line: Vec<String> = std::env::args().collect();
    let command_line = command_line.join(" ");

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(n_jobs.max(1)));
    let shared = Arc::new(SharedState::new());
    let status = shared.clone();

    // Spawn the task!
    let handle = std::thread::spawn(move || run_list_file(config, shared, &command_line));

    let exit_code = loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
        pb.set_position(status.totals().n_processed);

        if handle.is_finished() {
            match handle.join() {
                Ok(Ok(totals)) => {
                    log::info!(
                        "Processed {} images: {} hits, {} with crystals, {} failed",
                        totals.n_processed,
                        totals.n_hits,
                        totals.n_had_crystals,
                        totals.n_failed
                    );
                    if totals.n_processed == 0 {
                        log::error!("No images were processed");
                        break 1;
                    }
                    break 0;
                }
                Ok(Err(e)) => {
                    log::error!("Processing failed with error: {e}");
                    break 1;
                }
                Err(_) => {
                    log::error!("Failed to join processing task!");
                    break 1;
                }
            }
        }
    };

    pb.finish();
    log::info!("Done.");
    std::process::exit(exit_code);
}
