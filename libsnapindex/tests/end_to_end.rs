//! End-to-end scenarios: synthetic payloads through the full pipeline and
//! dispatcher, checked against the emitted stream.

use ndarray::Array2;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use libsnapindex::cell::{LatticeType, UnitCell};
use libsnapindex::config::{Config, PeakMethod};
use libsnapindex::crystal::Crystal;
use libsnapindex::geometry::{Beam, Detector, Panel};
use libsnapindex::payload::{encode_payload, Payload, PayloadPeak};
use libsnapindex::predict::{predict_reflections, PartialityModel};
use libsnapindex::run::run_with_source;
use libsnapindex::source::{ImageJob, QueueSource};
use libsnapindex::stream::{read_stream, RawChunk, StreamWriter};
use libsnapindex::worker_status::SharedState;

#[derive(Clone)]
struct VecSink(Arc<Mutex<Vec<u8>>>);

impl Write for VecSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

const PANEL_SIZE: usize = 512;
const EDGE_MARGIN: f64 = 12.0;

fn fixture_detector() -> Detector {
    Detector {
        panels: vec![Panel {
            name: String::from("q0"),
            w: PANEL_SIZE,
            h: PANEL_SIZE,
            fs: [1.0, 0.0, 0.0],
            ss: [0.0, 1.0, 0.0],
            corner: [-(PANEL_SIZE as f64) / 2.0, -(PANEL_SIZE as f64) / 2.0],
            clen: 0.08,
            clen_from: None,
            res: 1.0 / 110e-6,
            adu_per_photon: 1.0,
            max_adu: 16000.0,
            data_path: None,
            mask_path: None,
        }],
        beam: Beam {
            photon_energy_ev: Some(9300.0),
            photon_energy_from: None,
            bandwidth: 1.0e-8,
        },
        bad_regions: Vec::new(),
    }
}

fn cubic_cell() -> UnitCell {
    let half_pi = std::f64::consts::FRAC_PI_2;
    UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
        .unwrap()
        .with_lattice(LatticeType::Cubic, 'P')
}

struct Injected {
    fs: f64,
    ss: f64,
    intensity: f64,
}

/// Paint one lattice onto the panel: bilinear deposit of each predicted
/// reflection, plus the matching exact peak list entries.
fn paint_lattice(
    det: &Detector,
    panel: &mut Array2<f32>,
    peaks: &mut Vec<PayloadPeak>,
    cell: &UnitCell,
    base_intensity: f64,
) -> Vec<Injected> {
    let image = libsnapindex::image::Image::new(det, libsnapindex::constants::ev_to_m(9300.0));
    let mut truth = Crystal::new(cell.clone(), "truth");
    truth.profile_radius = 2.5e7;
    predict_reflections(&mut truth, &image, det, PartialityModel::XSphere, 2.4e9).unwrap();

    let mut injected = Vec::new();
    for (i, r) in truth.reflections.iter().enumerate() {
        let (fs, ss) = (r.fs, r.ss);
        if fs < EDGE_MARGIN
            || ss < EDGE_MARGIN
            || fs > PANEL_SIZE as f64 - EDGE_MARGIN
            || ss > PANEL_SIZE as f64 - EDGE_MARGIN
        {
            continue;
        }
        let intensity = base_intensity + (i % 7) as f64 * 100.0;
        deposit(panel, fs, ss, intensity);
        peaks.push(PayloadPeak {
            panel: 0,
            fs,
            ss,
            intensity,
        });
        injected.push(Injected { fs, ss, intensity });
    }
    injected
}

/// Spread `intensity` over the four pixels around the point, conserving
/// the total exactly. Coordinates are pixel-centre convention.
fn deposit(panel: &mut Array2<f32>, fs: f64, ss: f64, intensity: f64) {
    let fs0 = (fs - 0.5).floor();
    let ss0 = (ss - 0.5).floor();
    let wx = fs - 0.5 - fs0;
    let wy = ss - 0.5 - ss0;
    for (di, wi) in [(0.0, 1.0 - wy), (1.0, wy)] {
        for (dj, wj) in [(0.0, 1.0 - wx), (1.0, wx)] {
            let x = (fs0 + dj) as usize;
            let y = (ss0 + di) as usize;
            panel[[y, x]] += (intensity * wi * wj) as f32;
        }
    }
}

fn background_panel() -> Array2<f32> {
    Array2::from_elem((PANEL_SIZE, PANEL_SIZE), 10.0f32)
}

fn make_payload(panel: Array2<f32>, peaks: Vec<PayloadPeak>) -> Vec<u8> {
    encode_payload(&Payload {
        photon_energy_ev: 9300.0,
        event: String::from("0"),
        metadata: Vec::new(),
        panels: vec![panel],
        peaks,
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: Config,
}

fn fixture_config() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let geom_path = dir.path().join("geometry.yaml");
    std::fs::write(&geom_path, serde_yaml::to_string(&fixture_detector()).unwrap()).unwrap();
    let cell_path = dir.path().join("cell.yaml");
    let cell_file = libsnapindex::cell::CellFile {
        lattice_type: String::from("cubic"),
        centering: 'P',
        unique_axis: None,
        a: 50.0,
        b: 50.0,
        c: 50.0,
        alpha: 90.0,
        beta: 90.0,
        gamma: 90.0,
    };
    std::fs::write(&cell_path, serde_yaml::to_string(&cell_file).unwrap()).unwrap();

    let mut config = Config::default();
    config.geometry_path = geom_path;
    config.cell_path = Some(cell_path);
    config.temp_dir = dir.path().to_path_buf();
    config.output_stream_path = PathBuf::from("unused.stream");
    config.peak_method = PeakMethod::Payload;
    // Test payloads already use pixel-centre coordinates
    config.half_pixel_shift = false;
    config.min_peaks = 10;
    config.indexing_methods = vec![String::from("vecsearch")];
    config.n_workers = 1;

    Fixture { _dir: dir, config }
}

fn run_payloads(config: Config, payloads: Vec<Vec<u8>>) -> Vec<RawChunk> {
    let mut source = QueueSource::new(payloads.into_iter().map(ImageJob::Payload).collect());
    let sink = VecSink(Arc::new(Mutex::new(Vec::new())));
    let mut writer = StreamWriter::from_sink(Box::new(sink.clone()));
    let shared = Arc::new(SharedState::new());
    run_with_source(config, &mut source, &mut writer, shared, "test").unwrap();
    let bytes = sink.0.lock().unwrap().clone();
    let (_, chunks) = read_stream(std::io::BufReader::new(&bytes[..])).unwrap();
    chunks
}

/// Parse the measured reflection rows of a chunk: (fs, ss, intensity)
fn parse_reflections(chunk: &str) -> Vec<(f64, f64, f64)> {
    let mut out = Vec::new();
    let mut in_refl = false;
    for line in chunk.lines() {
        if line == "Reflections measured after indexing" {
            in_refl = true;
            continue;
        }
        if line == "End of reflections" {
            in_refl = false;
            continue;
        }
        if !in_refl || line.starts_with("   h") {
            continue;
        }
        let tok: Vec<&str> = line.split_whitespace().collect();
        if tok.len() < 9 {
            continue;
        }
        let intensity: f64 = tok[3].parse().unwrap();
        let fs: f64 = tok[6].parse().unwrap();
        let ss: f64 = tok[7].parse().unwrap();
        out.push((fs, ss, intensity));
    }
    out
}

/// Parse every "Cell parameters" line: lengths in metres
fn parse_cell_lengths(chunk: &str) -> Vec<[f64; 3]> {
    chunk
        .lines()
        .filter(|l| l.starts_with("Cell parameters"))
        .map(|l| {
            let tok: Vec<&str> = l.split_whitespace().collect();
            [
                tok[2].parse::<f64>().unwrap() * 1e-9,
                tok[3].parse::<f64>().unwrap() * 1e-9,
                tok[4].parse::<f64>().unwrap() * 1e-9,
            ]
        })
        .collect()
}

#[test]
fn single_perfect_image_indexes_and_integrates() {
    let fixture = fixture_config();
    let det = fixture_detector();
    let truth = cubic_cell().rotated([0.3, 0.5, 0.1], 0.4);

    let mut panel = background_panel();
    let mut peaks = Vec::new();
    let injected = paint_lattice(&det, &mut panel, &mut peaks, &truth, 1000.0);
    assert!(injected.len() >= 150, "only {} spots injected", injected.len());

    let chunks = run_payloads(fixture.config, vec![make_payload(panel, peaks)]);
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0].text;
    assert!(chunk.contains("indexed_by = vecsearch"), "not indexed:\n{chunk}");

    // Cell axes recovered to 0.1%
    let cells = parse_cell_lengths(chunk);
    assert_eq!(cells.len(), 1, "expected exactly one crystal");
    for len in cells[0] {
        assert!(
            (len - 50e-10).abs() / 50e-10 < 1e-3,
            "axis length {} A off by more than 0.1%",
            len * 1e10
        );
    }

    // Predictions coincide with the injected spots and the integrated
    // intensities match the injected values
    let reflections = parse_reflections(chunk);
    assert!(reflections.len() >= 100);
    let mut matched = 0usize;
    for inj in &injected {
        let best = reflections
            .iter()
            .map(|(fs, ss, i)| {
                let d = ((fs - inj.fs).powi(2) + (ss - inj.ss).powi(2)).sqrt();
                (d, *i)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((d, intensity)) = best {
            if d < 0.5 {
                matched += 1;
                assert!(
                    (intensity - inj.intensity).abs() / inj.intensity < 0.01,
                    "intensity {} vs injected {} at ({:.1}, {:.1})",
                    intensity,
                    inj.intensity,
                    inj.fs,
                    inj.ss
                );
            }
        }
    }
    assert!(
        matched as f64 >= 0.9 * injected.len() as f64,
        "only {matched} of {} injected spots matched within half a pixel",
        injected.len()
    );
}

#[test]
fn sparse_image_is_a_non_hit() {
    let fixture = fixture_config();
    let mut panel = background_panel();
    let mut peaks = Vec::new();
    for &(fs, ss) in &[(100.5, 120.5), (300.5, 80.5), (420.5, 400.5)] {
        deposit(&mut panel, fs, ss, 2000.0);
        peaks.push(PayloadPeak {
            panel: 0,
            fs,
            ss,
            intensity: 2000.0,
        });
    }

    let chunks = run_payloads(fixture.config, vec![make_payload(panel, peaks)]);
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0].text;
    assert!(chunk.contains("indexed_by = none"));
    assert!(!chunk.contains("--- Begin crystal"));
    assert!(chunk.contains("num_peaks = 3"));
}

#[test]
fn two_lattices_are_both_extracted() {
    let mut fixture = fixture_config();
    fixture.config.multi = true;
    fixture.config.min_peak_fraction = 0.25;
    fixture.config.refine = false;

    let det = fixture_detector();
    let lat1 = cubic_cell().rotated([0.2, 0.7, 0.3], 0.5);
    let lat2 = lat1.rotated([0.0, 0.0, 1.0], 30f64.to_radians());

    let mut panel = background_panel();
    let mut peaks = Vec::new();
    let inj1 = paint_lattice(&det, &mut panel, &mut peaks, &lat1, 1000.0);
    let inj2 = paint_lattice(&det, &mut panel, &mut peaks, &lat2, 1500.0);
    assert!(inj1.len() > 50 && inj2.len() > 50);

    let chunks = run_payloads(fixture.config, vec![make_payload(panel, peaks)]);
    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0].text;
    let n_crystals = chunk.matches("--- Begin crystal").count();
    assert_eq!(n_crystals, 2, "expected two crystal blocks:\n{chunk}");

    for lengths in parse_cell_lengths(chunk) {
        for len in lengths {
            assert!(
                (len - 50e-10).abs() / 50e-10 < 0.05,
                "cell axis {} A outside tolerance",
                len * 1e10
            );
        }
    }
}

#[test]
fn saturated_reflection_is_flagged_and_excluded() {
    let mut fixture = fixture_config();
    fixture.config.use_saturated = false;
    fixture.config.refine = false;
    // integrate_saturated defaults to false

    let det = fixture_detector();
    let truth = cubic_cell().rotated([0.1, 0.4, 0.8], 0.3);
    let mut panel = background_panel();
    let mut peaks = Vec::new();
    let injected = paint_lattice(&det, &mut panel, &mut peaks, &truth, 1000.0);
    assert!(injected.len() > 50);

    // Blow one spot far past the panel's max_adu, concentrated in a single
    // pixel so saturation is unambiguous
    let target = &injected[injected.len() / 2];
    let px = target.fs.floor() as usize;
    let py = target.ss.floor() as usize;
    panel[[py, px]] = 50000.0;

    let chunks = run_payloads(fixture.config, vec![make_payload(panel, peaks)]);
    let chunk = &chunks[0].text;
    assert!(chunk.contains("indexed_by = vecsearch"));
    assert!(chunk.contains("num_saturated_peaks = 1"), "chunk:\n{chunk}");
    assert!(
        chunk.contains("num_saturated_reflections = 1"),
        "chunk:\n{chunk}"
    );

    // The saturated position must not appear among the measured reflections
    for (fs, ss, _) in parse_reflections(chunk) {
        let d = ((fs - target.fs).powi(2) + (ss - target.ss).powi(2)).sqrt();
        assert!(d > 0.5, "saturated reflection was emitted");
    }
}

#[test]
fn wait_for_file_misses_immediately_and_retries_boundedly() {
    use libsnapindex::error::ProcessError;
    use libsnapindex::indexing::IndexingDriver;
    use libsnapindex::pipeline::{ImageProcessor, PipelineProcessor};
    use libsnapindex::worker_status::WorkerHealth;
    use std::time::Instant;

    let mut fixture = fixture_config();
    fixture.config.indexing_methods = Vec::new();
    fixture.config.cell_path = None;

    let make_processor = |config: Config| {
        let det = Arc::new(Detector::from_file(&config.geometry_path).unwrap());
        let driver = Arc::new(IndexingDriver::new(&config, None, 2e9).unwrap());
        PipelineProcessor::new(
            Arc::new(config),
            det,
            driver,
            Arc::new(SharedState::new()),
            Arc::new(WorkerHealth::new()),
            0,
        )
    };

    let missing = ImageJob::File {
        filename: PathBuf::from("/no/such/image.h5"),
        event: None,
    };

    // wait_for_file = 0: immediate miss
    let mut config0 = fixture.config.clone();
    config0.wait_for_file = 0;
    let mut proc0 = make_processor(config0);
    let started = Instant::now();
    let result = proc0.process(missing.clone(), 1);
    assert!(matches!(result, Err(ProcessError::FileWaitExpired(_))));
    assert!(started.elapsed() < std::time::Duration::from_millis(500));

    // wait_for_file = 2: at most two one-second retries
    let mut config2 = fixture.config.clone();
    config2.wait_for_file = 2;
    let mut proc2 = make_processor(config2);
    let started = Instant::now();
    let result = proc2.process(missing, 2);
    assert!(matches!(result, Err(ProcessError::FileWaitExpired(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_secs(2));
    assert!(elapsed < std::time::Duration::from_secs(4));
}

#[test]
fn several_images_stream_in_serial_order() {
    let mut fixture = fixture_config();
    fixture.config.n_workers = 3;
    fixture.config.refine = false;
    let det = fixture_detector();

    let mut payloads = Vec::new();
    for i in 0..5 {
        if i % 2 == 0 {
            let truth = cubic_cell().rotated([0.3, 0.5, 0.1], 0.2 + 0.1 * i as f64);
            let mut panel = background_panel();
            let mut peaks = Vec::new();
            paint_lattice(&det, &mut panel, &mut peaks, &truth, 1000.0);
            payloads.push(make_payload(panel, peaks));
        } else {
            payloads.push(make_payload(background_panel(), Vec::new()));
        }
    }

    let chunks = run_payloads(fixture.config, payloads);
    assert_eq!(chunks.len(), 5);
    let serials: Vec<u64> = chunks.iter().map(|c| c.serial).collect();
    assert_eq!(serials, vec![1, 2, 3, 4, 5]);
    assert!(chunks[1].text.contains("indexed_by = none"));
    assert!(chunks[0].text.contains("indexed_by = vecsearch"));
}
