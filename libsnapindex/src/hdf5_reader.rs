//! HDF5 image containers: multi-dataset panel data, per-image metadata and
//! prepared peak tables, including the CXI event-indexed layout.

use ndarray::s;
use std::path::Path;

use super::error::ImageFileError;
use super::geometry::Detector;
use super::image::Image;
use super::peaks::{Peak, PeakList};

pub fn open_image_file(path: &Path) -> Result<hdf5::File, ImageFileError> {
    if !path.exists() {
        return Err(ImageFileError::BadFilePath(path.to_path_buf()));
    }
    Ok(hdf5::File::open(path)?)
}

fn panel_data_path(panel: &super::geometry::Panel) -> String {
    panel
        .data_path
        .clone()
        .unwrap_or_else(|| format!("/data/{}", panel.name))
}

/// Fill the image's pixel arrays from the file. A 3-D dataset is indexed by
/// `event` along its first axis; a 2-D dataset ignores the event.
pub fn read_image_data(
    file: &hdf5::File,
    image: &mut Image,
    det: &Detector,
    event: Option<usize>,
) -> Result<(), ImageFileError> {
    for (pdata, panel) in image.panels.iter_mut().zip(det.panels.iter()) {
        let path = panel_data_path(panel);
        let ds = file.dataset(&path)?;
        let shape = ds.shape();
        let data = match shape.len() {
            2 => ds.read_2d::<f32>()?,
            3 => {
                let ev = event.ok_or(ImageFileError::BadEvent(0))?;
                if ev >= shape[0] {
                    return Err(ImageFileError::BadEvent(ev));
                }
                ds.read_slice_2d::<f32, _>(s![ev, .., ..])?
            }
            _ => {
                return Err(ImageFileError::ShapeMismatch {
                    panel: panel.name.clone(),
                    path,
                    want: (panel.h, panel.w),
                    got: shape,
                })
            }
        };
        if data.nrows() != panel.h || data.ncols() != panel.w {
            return Err(ImageFileError::ShapeMismatch {
                panel: panel.name.clone(),
                path,
                want: (panel.h, panel.w),
                got: vec![data.nrows(), data.ncols()],
            });
        }
        pdata.data = data;

        if let Some(mask_path) = &panel.mask_path {
            let mask = file.dataset(mask_path)?.read_2d::<i32>()?;
            if mask.nrows() == panel.h && mask.ncols() == panel.w {
                for ((ss, fs), m) in mask.indexed_iter() {
                    if *m != 0 {
                        pdata.bad[[ss, fs]] = true;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Resolve a scalar (or per-event) floating point metadata field
pub fn read_metadata_value(
    file: &hdf5::File,
    key: &str,
    event: Option<usize>,
) -> Result<f64, ImageFileError> {
    let ds = file
        .dataset(key)
        .map_err(|_| ImageFileError::MissingMetadata(key.to_string()))?;
    match ds.ndim() {
        0 => Ok(ds.read_scalar::<f64>()?),
        1 => {
            let ev = event.unwrap_or(0);
            let shape = ds.shape();
            if ev >= shape[0] {
                return Err(ImageFileError::BadEvent(ev));
            }
            let row = ds.read_slice_1d::<f64, _>(s![ev..ev + 1])?;
            Ok(row[0])
        }
        _ => Err(ImageFileError::MissingMetadata(key.to_string())),
    }
}

fn finish_peak(
    det: &Detector,
    lambda: f64,
    panel: usize,
    fs: f64,
    ss: f64,
    intensity: f64,
    half_pixel_shift: bool,
) -> Option<Peak> {
    let geom = det.panels.get(panel)?;
    let shift = if half_pixel_shift { 0.5 } else { 0.0 };
    let (fs, ss) = (fs + shift, ss + shift);
    if !geom.contains(fs, ss) {
        return None;
    }
    Some(Peak {
        fs,
        ss,
        panel,
        intensity,
        background: 0.0,
        snr: 0.0,
        resolution: geom.resolution(fs, ss, lambda),
    })
}

/// A plain precomputed peak table: rows of (fs, ss, intensity) or
/// (fs, ss, panel, intensity). Rows landing outside their panel are
/// dropped with a warning rather than failing the image.
pub fn read_peak_table(
    file: &hdf5::File,
    table_path: &str,
    det: &Detector,
    lambda: f64,
    half_pixel_shift: bool,
) -> Result<PeakList, ImageFileError> {
    let ds = file.dataset(table_path)?;
    let table = ds.read_2d::<f64>()?;
    let ncols = table.ncols();
    let mut peaks = Vec::with_capacity(table.nrows());
    let mut dropped = 0usize;
    for row in table.rows() {
        let (fs, ss, panel, intensity) = match ncols {
            3 => (row[0], row[1], 0usize, row[2]),
            4 => (row[0], row[1], row[2] as usize, row[3]),
            _ => {
                return Err(ImageFileError::ShapeMismatch {
                    panel: String::from("-"),
                    path: table_path.to_string(),
                    want: (table.nrows(), 3),
                    got: vec![table.nrows(), ncols],
                })
            }
        };
        match finish_peak(det, lambda, panel, fs, ss, intensity, half_pixel_shift) {
            Some(p) => peaks.push(p),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        spdlog::warn!("Dropped {dropped} out-of-panel rows from peak table {table_path}");
    }
    Ok(peaks)
}

/// CXI-style event-indexed peak table: `nPeaks`, `peakXPosRaw`,
/// `peakYPosRaw` and `peakTotalIntensity` under a common base path, one row
/// per event.
pub fn read_peak_table_cxi(
    file: &hdf5::File,
    base_path: &str,
    event: usize,
    det: &Detector,
    lambda: f64,
    half_pixel_shift: bool,
) -> Result<PeakList, ImageFileError> {
    let base = base_path.trim_end_matches('/');
    let n_ds = file.dataset(&format!("{base}/nPeaks"))?;
    let shape = n_ds.shape();
    if event >= shape[0] {
        return Err(ImageFileError::BadEvent(event));
    }
    let n = n_ds.read_slice_1d::<f64, _>(s![event..event + 1])?[0] as usize;

    let xs = file
        .dataset(&format!("{base}/peakXPosRaw"))?
        .read_slice_1d::<f64, _>(s![event, ..])?;
    let ys = file
        .dataset(&format!("{base}/peakYPosRaw"))?
        .read_slice_1d::<f64, _>(s![event, ..])?;
    let is = file
        .dataset(&format!("{base}/peakTotalIntensity"))?
        .read_slice_1d::<f64, _>(s![event, ..])?;

    let n = n.min(xs.len()).min(ys.len()).min(is.len());
    let mut peaks = Vec::with_capacity(n);
    for i in 0..n {
        if let Some(p) = finish_peak(det, lambda, 0, xs[i], ys[i], is[i], half_pixel_shift) {
            peaks.push(p);
        }
    }
    Ok(peaks)
}
