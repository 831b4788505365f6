//! The in-memory image payload: a length-prefixed binary message carrying
//! pixel panels, beam metadata and an optional precomputed peak table.
//! The transport delivering these messages is outside the engine; both
//! sides of the format live here so producers and tests stay in step.
//!
//! Layout (little endian):
//!
//! ```text
//! magic  b"SNPX"
//! u16    format version (currently 1)
//! f64    photon energy, eV
//! u16    event string length, bytes     [event string]
//! u16    metadata entry count           [u16 key len, key, u16 val len, val]*
//! u16    panel count                    [u32 w, u32 h, w*h f32 pixels]*
//! u32    peak count                     [u16 panel, f32 fs, f32 ss, f32 intensity]*
//! ```

use ndarray::Array2;
use winnow::binary::{le_f32, le_f64, le_u16, le_u32};
use winnow::error::ContextError;
use winnow::token::take;
use winnow::{PResult, Parser};

use super::error::PayloadError;

pub const PAYLOAD_MAGIC: &[u8; 4] = b"SNPX";
pub const PAYLOAD_VERSION: u16 = 1;

#[derive(Debug, Clone)]
pub struct PayloadPeak {
    pub panel: usize,
    pub fs: f64,
    pub ss: f64,
    pub intensity: f64,
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub photon_energy_ev: f64,
    pub event: String,
    pub metadata: Vec<(String, String)>,
    pub panels: Vec<Array2<f32>>,
    pub peaks: Vec<PayloadPeak>,
}

fn parse_string(input: &mut &[u8]) -> PResult<String> {
    let len = le_u16.parse_next(input)?;
    let bytes = take(len as usize).parse_next(input)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn parse_panel(input: &mut &[u8]) -> PResult<Array2<f32>> {
    let w = le_u32.parse_next(input)? as usize;
    let h = le_u32.parse_next(input)? as usize;
    let raw = take(4 * w * h).parse_next(input)?;
    let mut data = Vec::with_capacity(w * h);
    for chunk in raw.chunks_exact(4) {
        data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    // Shape is checked on construction; the take above guarantees length
    Ok(Array2::from_shape_vec((h, w), data).expect("shape follows from take"))
}

fn parse_peak(input: &mut &[u8]) -> PResult<PayloadPeak> {
    let panel = le_u16.parse_next(input)? as usize;
    let fs = le_f32.parse_next(input)? as f64;
    let ss = le_f32.parse_next(input)? as f64;
    let intensity = le_f32.parse_next(input)? as f64;
    Ok(PayloadPeak {
        panel,
        fs,
        ss,
        intensity,
    })
}

fn parse_payload_inner(input: &mut &[u8]) -> PResult<Payload> {
    // Magic and version were checked up front; consume them
    let _magic = take(4usize).parse_next(input)?;
    let _version = le_u16.parse_next(input)?;
    let photon_energy_ev = le_f64.parse_next(input)?;
    let event = parse_string(input)?;

    let n_meta = le_u16.parse_next(input)?;
    let mut metadata = Vec::with_capacity(n_meta as usize);
    for _ in 0..n_meta {
        let key = parse_string(input)?;
        let value = parse_string(input)?;
        metadata.push((key, value));
    }

    let n_panels = le_u16.parse_next(input)?;
    let mut panels = Vec::with_capacity(n_panels as usize);
    for _ in 0..n_panels {
        panels.push(parse_panel(input)?);
    }

    let n_peaks = le_u32.parse_next(input)?;
    let mut peaks = Vec::with_capacity(n_peaks as usize);
    for _ in 0..n_peaks {
        peaks.push(parse_peak(input)?);
    }

    Ok(Payload {
        photon_energy_ev,
        event,
        metadata,
        panels,
        peaks,
    })
}

/// Parse a payload message. Version and truncation problems map onto
/// dedicated error variants; the image is then skipped and counted.
pub fn parse_payload(bytes: &[u8]) -> Result<Payload, PayloadError> {
    if bytes.len() < 6 {
        return Err(PayloadError::Truncated("header"));
    }
    if &bytes[0..4] != PAYLOAD_MAGIC {
        return Err(PayloadError::Truncated("magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != PAYLOAD_VERSION {
        return Err(PayloadError::BadVersion(version));
    }
    let mut input = bytes;
    parse_payload_inner
        .parse_next(&mut input)
        .map_err(|_: winnow::error::ErrMode<ContextError>| PayloadError::Truncated("body"))
}

/// Serialize a payload; the producer side of the format
pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(PAYLOAD_MAGIC);
    out.extend_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    out.extend_from_slice(&payload.photon_energy_ev.to_le_bytes());

    let put_string = |out: &mut Vec<u8>, s: &str| {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    };
    put_string(&mut out, &payload.event);

    out.extend_from_slice(&(payload.metadata.len() as u16).to_le_bytes());
    for (k, v) in &payload.metadata {
        put_string(&mut out, k);
        put_string(&mut out, v);
    }

    out.extend_from_slice(&(payload.panels.len() as u16).to_le_bytes());
    for panel in &payload.panels {
        out.extend_from_slice(&(panel.ncols() as u32).to_le_bytes());
        out.extend_from_slice(&(panel.nrows() as u32).to_le_bytes());
        for v in panel.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    out.extend_from_slice(&(payload.peaks.len() as u32).to_le_bytes());
    for p in &payload.peaks {
        out.extend_from_slice(&(p.panel as u16).to_le_bytes());
        out.extend_from_slice(&(p.fs as f32).to_le_bytes());
        out.extend_from_slice(&(p.ss as f32).to_le_bytes());
        out.extend_from_slice(&(p.intensity as f32).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Payload {
        let mut panel = Array2::<f32>::zeros((4, 6));
        panel[[2, 3]] = 123.5;
        Payload {
            photon_energy_ev: 9300.0,
            event: String::from("ev-7"),
            metadata: vec![(String::from("clen"), String::from("0.08"))],
            panels: vec![panel],
            peaks: vec![PayloadPeak {
                panel: 0,
                fs: 3.5,
                ss: 2.5,
                intensity: 500.0,
            }],
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let bytes = encode_payload(&sample());
        let back = parse_payload(&bytes).unwrap();
        assert_eq!(back.event, "ev-7");
        assert_eq!(back.photon_energy_ev, 9300.0);
        assert_eq!(back.metadata.len(), 1);
        assert_eq!(back.panels.len(), 1);
        assert_eq!(back.panels[0][[2, 3]], 123.5);
        assert_eq!(back.peaks.len(), 1);
        assert!((back.peaks[0].fs - 3.5).abs() < 1e-6);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = encode_payload(&sample());
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            parse_payload(&bytes),
            Err(PayloadError::Truncated(_))
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = encode_payload(&sample());
        bytes[4] = 99;
        assert!(matches!(
            parse_payload(&bytes),
            Err(PayloadError::BadVersion(99))
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = encode_payload(&sample());
        bytes[0] = b'X';
        assert!(parse_payload(&bytes).is_err());
    }
}
