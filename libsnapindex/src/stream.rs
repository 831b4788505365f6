//! The output stream: an append-only, line-oriented text format with one
//! chunk per image. Chunks appear atomically and in strictly ascending
//! serial order; the writer owns the sink and nobody else touches it.
//!
//! A small reader lives here too, sufficient for round-tripping a stream
//! (re-reading, re-emitting and diffing) and for downstream tooling tests.

use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use super::crystal::Crystal;
use super::error::StreamError;
use super::geometry::Detector;
use super::image::Image;
use super::peaks::PeakList;

pub const BEGIN_CHUNK: &str = "----- Begin chunk -----";
pub const END_CHUNK: &str = "----- End chunk -----";
pub const BEGIN_CRYSTAL: &str = "--- Begin crystal";
pub const END_CRYSTAL: &str = "--- End crystal";

/// Everything the stream header carries ahead of the first chunk
pub struct HeaderInfo {
    pub command_line: String,
    pub geometry_digest: String,
    pub cell_summary: Option<String>,
    pub indexing_methods: Vec<String>,
}

pub struct StreamWriter {
    sink: BufWriter<Box<dyn Write + Send>>,
    last_serial: Option<u64>,
}

impl StreamWriter {
    pub fn create(path: &Path) -> Result<Self, StreamError> {
        let file = std::fs::File::create(path)?;
        Ok(Self::from_sink(Box::new(file)))
    }

    pub fn from_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: BufWriter::new(sink),
            last_serial: None,
        }
    }

    pub fn write_header(&mut self, info: &HeaderInfo) -> Result<(), StreamError> {
        writeln!(self.sink, "Stream format: snapindex-1.0")?;
        writeln!(
            self.sink,
            "Generated by: {} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        writeln!(self.sink, "Command line: {}", info.command_line)?;
        writeln!(self.sink, "Geometry: {}", info.geometry_digest)?;
        match &info.cell_summary {
            Some(cell) => writeln!(self.sink, "Reference cell: {cell}")?,
            None => writeln!(self.sink, "Reference cell: none")?,
        }
        writeln!(
            self.sink,
            "Indexing methods: {}",
            info.indexing_methods.join(",")
        )?;
        Ok(())
    }

    /// Append one preformatted chunk. Serials must strictly ascend; the
    /// dispatcher's reorder buffer guarantees that in normal operation.
    pub fn write_chunk(&mut self, serial: u64, chunk: &str) -> Result<(), StreamError> {
        if let Some(last) = self.last_serial {
            if serial <= last {
                return Err(StreamError::OutOfOrder(serial));
            }
        }
        self.sink.write_all(chunk.as_bytes())?;
        self.sink.flush()?;
        self.last_serial = Some(serial);
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StreamError> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Format one image (plus its peak list and crystals) as a chunk.
/// The result always ends with a newline and contains the delimiters.
pub fn format_chunk(
    image: &Image,
    peaks: Option<&PeakList>,
    crystals: &[Crystal],
    det: &Detector,
    stream_refls: bool,
) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();

    writeln!(out, "{BEGIN_CHUNK}").unwrap();
    writeln!(out, "Image filename: {}", image.filename).unwrap();
    if let Some(ev) = &image.event {
        writeln!(out, "Event: {ev}").unwrap();
    }
    writeln!(out, "Image serial number: {}", image.serial).unwrap();
    let indexed_by = crystals
        .first()
        .map(|c| c.indexed_by.as_str())
        .unwrap_or("none");
    writeln!(out, "indexed_by = {indexed_by}").unwrap();
    writeln!(
        out,
        "photon_energy_eV = {:.4}",
        super::constants::m_to_ev(image.lambda)
    )
    .unwrap();
    if let Some(res) = image.peak_resolution {
        writeln!(out, "peak_resolution = {:.4} nm^-1", res * 1e-9).unwrap();
    }
    let n_peaks = peaks.map(|p| p.len()).unwrap_or(0);
    writeln!(out, "num_peaks = {n_peaks}").unwrap();
    writeln!(out, "num_saturated_peaks = {}", image.n_saturated_peaks).unwrap();
    let mut copy_keys: Vec<&String> = image.metadata.keys().collect();
    copy_keys.sort();
    for key in copy_keys {
        writeln!(out, "{key} = {}", image.metadata[key]).unwrap();
    }

    if let Some(peaks) = peaks {
        writeln!(out, "Peaks from peak search").unwrap();
        writeln!(out, "  fs/px   ss/px (1/d)/nm^-1   Intensity  Panel").unwrap();
        for p in peaks {
            writeln!(
                out,
                "{:7.2} {:7.2} {:11.3} {:11.2}  {}",
                p.fs,
                p.ss,
                p.resolution * 1e-9,
                p.intensity,
                det.panels[p.panel].name
            )
            .unwrap();
        }
        writeln!(out, "End of peak list").unwrap();
    }

    for crystal in crystals {
        writeln!(out, "{BEGIN_CRYSTAL}").unwrap();
        let (a, b, c, al, be, ga) = crystal.cell.parameters();
        writeln!(
            out,
            "Cell parameters {:.5} {:.5} {:.5} nm, {:.5} {:.5} {:.5} deg",
            a * 1e9,
            b * 1e9,
            c * 1e9,
            al.to_degrees(),
            be.to_degrees(),
            ga.to_degrees()
        )
        .unwrap();
        if let Ok((astar, bstar, cstar)) = crystal.cell.reciprocal() {
            for (name, v) in [("astar", astar), ("bstar", bstar), ("cstar", cstar)] {
                writeln!(
                    out,
                    "{name} = {:+.7} {:+.7} {:+.7} nm^-1",
                    v[0] * 1e-9,
                    v[1] * 1e-9,
                    v[2] * 1e-9
                )
                .unwrap();
            }
        }
        writeln!(out, "lattice_type = {}", crystal.cell.lattice_type()).unwrap();
        writeln!(out, "centering = {}", crystal.cell.centering()).unwrap();
        writeln!(
            out,
            "profile_radius = {:.5} nm^-1",
            crystal.profile_radius * 1e-9
        )
        .unwrap();
        writeln!(out, "indexed_by = {}", crystal.indexed_by).unwrap();

        let measured: Vec<_> = crystal
            .reflections
            .iter()
            .filter(|r| r.status.measured)
            .collect();
        writeln!(out, "num_reflections = {}", measured.len()).unwrap();
        writeln!(
            out,
            "num_saturated_reflections = {}",
            crystal
                .reflections
                .iter()
                .filter(|r| r.status.saturated)
                .count()
        )
        .unwrap();
        writeln!(
            out,
            "num_implausible_reflections = {}",
            crystal.n_implausible_reflections()
        )
        .unwrap();

        if stream_refls {
            writeln!(out, "Reflections measured after indexing").unwrap();
            writeln!(
                out,
                "   h    k    l           I    sigma(I)  partiality    fs/px   ss/px  panel"
            )
            .unwrap();
            for r in &measured {
                writeln!(
                    out,
                    "{:4} {:4} {:4} {:11.2} {:11.2} {:11.4} {:8.2} {:7.2}  {}",
                    r.h,
                    r.k,
                    r.l,
                    r.intensity,
                    r.esd,
                    r.partiality,
                    r.fs,
                    r.ss,
                    det.panels[r.panel].name
                )
                .unwrap();
            }
            writeln!(out, "End of reflections").unwrap();
        }
        writeln!(out, "{END_CRYSTAL}").unwrap();
    }

    writeln!(out, "{END_CHUNK}").unwrap();
    out
}

/// One chunk as read back from a stream, verbatim
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub serial: u64,
    pub text: String,
}

/// Read a stream: the header text and every chunk, byte-preserving.
pub fn read_stream<R: BufRead>(reader: R) -> Result<(String, Vec<RawChunk>), StreamError> {
    let mut header = String::new();
    let mut chunks = Vec::new();
    let mut current: Option<String> = None;
    let mut serial: Option<u64> = None;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line == BEGIN_CHUNK {
            if current.is_some() {
                return Err(StreamError::Malformed(lineno + 1));
            }
            current = Some(format!("{line}\n"));
            serial = None;
            continue;
        }
        match current.as_mut() {
            Some(text) => {
                text.push_str(&line);
                text.push('\n');
                if let Some(rest) = line.strip_prefix("Image serial number: ") {
                    serial = rest.trim().parse().ok();
                }
                if line == END_CHUNK {
                    let serial = serial.ok_or(StreamError::Malformed(lineno + 1))?;
                    chunks.push(RawChunk {
                        serial,
                        text: current.take().unwrap(),
                    });
                }
            }
            None => {
                header.push_str(&line);
                header.push('\n');
            }
        }
    }

    if current.is_some() {
        return Err(StreamError::Malformed(0));
    }
    Ok((header, chunks))
}
