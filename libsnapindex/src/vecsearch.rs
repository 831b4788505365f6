//! The built-in indexer: a reciprocal basis-vector search guided by the
//! reference unit cell.
//!
//! Observed peaks are back-projected onto the Ewald sphere to give
//! reciprocal-space vectors. Differences between those vectors are candidate
//! lattice basis vectors; candidates whose lengths match the reference
//! reciprocal axes are clustered by direction, assembled into right-handed
//! triples with matching inter-axial angles, and scored by the fraction of
//! peaks they explain.

use super::cell::UnitCell;
use super::error::IndexerError;
use super::geometry::Detector;
use super::image::Image;
use super::indexing::Indexer;
use super::matrix::{angle, cross, dot, modulus, Vec3};
use super::peaks::PeakList;

pub struct VecSearch {
    reference: UnitCell,
    length_tol: [f64; 3],
    angle_tol: [f64; 3],
}

/// Largest number of direction clusters kept per reference axis
const MAX_CLUSTERS: usize = 24;
/// Two candidates closer than this in direction share a cluster
const CLUSTER_ANGLE: f64 = 3.0 * std::f64::consts::PI / 180.0;
/// A peak is explained when its fractional indices are all this close to
/// integers
const INDEX_TOLERANCE: f64 = 0.2;
/// Minimum explained fraction for a solution to be reported
const MIN_SCORE: f64 = 0.3;

struct Cluster {
    sum: Vec3,
    weight: usize,
}

impl Cluster {
    fn mean(&self) -> Vec3 {
        [
            self.sum[0] / self.weight as f64,
            self.sum[1] / self.weight as f64,
            self.sum[2] / self.weight as f64,
        ]
    }
}

impl VecSearch {
    pub fn new(reference: UnitCell, length_tol: [f64; 3], angle_tol: [f64; 3]) -> Self {
        Self {
            reference,
            length_tol,
            angle_tol,
        }
    }

    /// Collect direction clusters of candidate vectors matching one target
    /// axis length
    fn clusters_for_axis(candidates: &[Vec3], target_len: f64, tol: f64) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        for v in candidates {
            let len = modulus(v);
            if (len - target_len).abs() / target_len > tol {
                continue;
            }
            let mut placed = false;
            for cl in clusters.iter_mut() {
                if angle(&cl.mean(), v) < CLUSTER_ANGLE {
                    cl.sum[0] += v[0];
                    cl.sum[1] += v[1];
                    cl.sum[2] += v[2];
                    cl.weight += 1;
                    placed = true;
                    break;
                }
            }
            if !placed {
                clusters.push(Cluster {
                    sum: *v,
                    weight: 1,
                });
            }
        }
        clusters.sort_by(|a, b| b.weight.cmp(&a.weight));
        clusters.truncate(MAX_CLUSTERS);
        clusters
    }

    /// Polish the reciprocal basis by least squares against the observed
    /// spot directions. A spot pins its lattice point to the ray from the
    /// Ewald sphere centre through the spot; re-projecting the current
    /// prediction onto that ray removes the excitation-error bias of the
    /// plain back-projection, so for noise-free spots the fit converges to
    /// the exact basis.
    fn refine_basis(cell: &UnitCell, dirs: &[Vec3], knom: f64) -> Option<UnitCell> {
        let mut current = cell.clone();
        for _ in 0..4 {
            let mut hht = [[0.0f64; 3]; 3];
            // rhs[c][j] accumulates sum h[j] * q'[c]
            let mut rhs = [[0.0f64; 3]; 3];
            let mut n_used = 0usize;
            for dir in dirs {
                let q0 = [knom * dir[0], knom * dir[1], knom * (dir[2] - 1.0)];
                let (hf, kf, lf) = current.miller_of(&q0);
                let (hr, kr, lr) = (hf.round(), kf.round(), lf.round());
                if (hf - hr).abs() > INDEX_TOLERANCE
                    || (kf - kr).abs() > INDEX_TOLERANCE
                    || (lf - lr).abs() > INDEX_TOLERANCE
                {
                    continue;
                }
                if hr == 0.0 && kr == 0.0 && lr == 0.0 {
                    continue;
                }
                let g = current
                    .reciprocal_point(hr as i32, kr as i32, lr as i32)
                    .ok()?;
                // Lattice points on the spot ray: t*dir - knom*z. Project
                // the prediction onto the ray to pick t.
                let t = dot(&g, dir) + knom * dir[2];
                let q = [t * dir[0], t * dir[1], t * dir[2] - knom];
                let hv = [hr, kr, lr];
                for i in 0..3 {
                    for j in 0..3 {
                        hht[i][j] += hv[i] * hv[j];
                    }
                    for (c, rhs_c) in rhs.iter_mut().enumerate() {
                        rhs_c[i] += hv[i] * q[c];
                    }
                }
                n_used += 1;
            }
            if n_used < 6 {
                return None;
            }
            let rx = crate::matrix::solve3(&hht, &rhs[0])?;
            let ry = crate::matrix::solve3(&hht, &rhs[1])?;
            let rz = crate::matrix::solve3(&hht, &rhs[2])?;
            let astar = [rx[0], ry[0], rz[0]];
            let bstar = [rx[1], ry[1], rz[1]];
            let cstar = [rx[2], ry[2], rz[2]];
            let mut refined = UnitCell::from_reciprocal(astar, bstar, cstar).ok()?;
            refined.adopt_symmetry_of(cell);
            if !refined.is_sensible() {
                return None;
            }
            current = refined;
        }
        Some(current)
    }

    /// Fraction of peaks whose reciprocal vectors index as near-integers
    fn score(cell: &UnitCell, qs: &[Vec3]) -> f64 {
        if qs.is_empty() {
            return 0.0;
        }
        let explained = qs
            .iter()
            .filter(|q| {
                let (h, k, l) = cell.miller_of(q);
                (h - h.round()).abs() < INDEX_TOLERANCE
                    && (k - k.round()).abs() < INDEX_TOLERANCE
                    && (l - l.round()).abs() < INDEX_TOLERANCE
            })
            .count();
        explained as f64 / qs.len() as f64
    }
}

impl Indexer for VecSearch {
    fn name(&self) -> &str {
        "vecsearch"
    }

    fn index(
        &self,
        image: &Image,
        det: &Detector,
        peaks: &PeakList,
    ) -> Result<Vec<UnitCell>, IndexerError> {
        if peaks.len() < 5 {
            return Ok(Vec::new());
        }

        let k = 1.0 / image.lambda;
        let qs: Vec<Vec3> = peaks
            .iter()
            .map(|p| det.panels[p.panel].q_vector(p.fs, p.ss, k))
            .collect();
        // Unit scattering directions, for the basis polish
        let dirs: Vec<Vec3> = qs
            .iter()
            .map(|q| [q[0] / k, q[1] / k, q[2] / k + 1.0])
            .collect();

        // Candidate basis vectors: every pairwise difference (both signs)
        // plus the q vectors themselves
        let mut candidates: Vec<Vec3> = Vec::with_capacity(qs.len() * qs.len());
        for (i, qi) in qs.iter().enumerate() {
            candidates.push(*qi);
            candidates.push([-qi[0], -qi[1], -qi[2]]);
            for qj in qs.iter().skip(i + 1) {
                let d = [qi[0] - qj[0], qi[1] - qj[1], qi[2] - qj[2]];
                candidates.push(d);
                candidates.push([-d[0], -d[1], -d[2]]);
            }
        }

        let (astar, bstar, cstar) = self.reference.reciprocal()?;
        let targets = [
            (modulus(&astar), self.length_tol[0]),
            (modulus(&bstar), self.length_tol[1]),
            (modulus(&cstar), self.length_tol[2]),
        ];
        let ref_angles = [
            angle(&bstar, &cstar),
            angle(&astar, &cstar),
            angle(&astar, &bstar),
        ];

        let cl_a = Self::clusters_for_axis(&candidates, targets[0].0, targets[0].1);
        let cl_b = Self::clusters_for_axis(&candidates, targets[1].0, targets[1].1);
        let cl_c = Self::clusters_for_axis(&candidates, targets[2].0, targets[2].1);

        let mut solutions: Vec<(f64, UnitCell)> = Vec::new();
        for a_cl in &cl_a {
            let va = a_cl.mean();
            for b_cl in &cl_b {
                let vb = b_cl.mean();
                if (angle(&va, &vb) - ref_angles[2]).abs() > self.angle_tol[2] {
                    continue;
                }
                for c_cl in &cl_c {
                    let mut vc = c_cl.mean();
                    if (angle(&va, &vc) - ref_angles[1]).abs() > self.angle_tol[1] {
                        continue;
                    }
                    if (angle(&vb, &vc) - ref_angles[0]).abs() > self.angle_tol[0] {
                        continue;
                    }
                    // Keep the triple right-handed; the negated direction is
                    // an equally good cluster member
                    if dot(&cross(&va, &vb), &vc) < 0.0 {
                        vc = [-vc[0], -vc[1], -vc[2]];
                        if (angle(&va, &vc) - ref_angles[1]).abs() > self.angle_tol[1]
                            || (angle(&vb, &vc) - ref_angles[0]).abs() > self.angle_tol[0]
                        {
                            continue;
                        }
                    }

                    let Ok(mut cell) = UnitCell::from_reciprocal(va, vb, vc) else {
                        continue;
                    };
                    if !cell.is_sensible() {
                        continue;
                    }
                    cell.adopt_symmetry_of(&self.reference);
                    if let Some(refined) = Self::refine_basis(&cell, &dirs, k) {
                        cell = refined;
                    }
                    let s = Self::score(&cell, &qs);
                    if s >= MIN_SCORE {
                        solutions.push((s, cell));
                    }
                }
            }
        }

        solutions.sort_by(|a, b| b.0.total_cmp(&a.0));
        solutions.truncate(3);
        if let Some((best, _)) = solutions.first() {
            spdlog::debug!(
                "vecsearch: best solution explains {:.0}% of {} peaks",
                best * 100.0,
                peaks.len()
            );
        }
        Ok(solutions.into_iter().map(|(_, c)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::LatticeType;
    use crate::crystal::Crystal;
    use crate::geometry::single_panel;
    use crate::peaks::Peak;
    use crate::predict::{predict_reflections, PartialityModel};

    fn cubic_cell() -> UnitCell {
        let half_pi = std::f64::consts::FRAC_PI_2;
        UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
            .unwrap()
            .with_lattice(LatticeType::Cubic, 'P')
    }

    fn synthetic_peaks(
        cell: &UnitCell,
        image: &Image,
        det: &crate::geometry::Detector,
    ) -> PeakList {
        let mut crystal = Crystal::new(cell.clone(), "truth");
        crystal.profile_radius = 2.5e7;
        predict_reflections(&mut crystal, image, det, PartialityModel::XSphere, 2.2e9).unwrap();
        crystal
            .reflections
            .iter()
            .map(|r| Peak {
                fs: r.fs,
                ss: r.ss,
                panel: r.panel,
                intensity: 5000.0,
                background: 10.0,
                snr: 30.0,
                resolution: 0.0,
            })
            .collect()
    }

    #[test]
    fn indexes_a_clean_synthetic_pattern() {
        let det = single_panel(512, 512, 0.08, 110e-6);
        let image = Image::new(&det, 1.3e-10);
        let truth = cubic_cell().rotated([0.3, 0.5, 0.1], 0.4);
        let peaks = synthetic_peaks(&truth, &image, &det);
        assert!(peaks.len() > 30, "only {} synthetic peaks", peaks.len());

        let idx = VecSearch::new(
            cubic_cell(),
            [0.05, 0.05, 0.05],
            [
                1.5f64.to_radians(),
                1.5f64.to_radians(),
                1.5f64.to_radians(),
            ],
        );
        let cells = idx.index(&image, &det, &peaks).unwrap();
        assert!(!cells.is_empty(), "vecsearch found no solution");
        let best = &cells[0];
        let (a, b, c, ..) = best.parameters();
        for len in [a, b, c] {
            assert!(
                (len - 50e-10).abs() / 50e-10 < 0.02,
                "axis length {} deviates",
                len * 1e10
            );
        }
        assert!(best.is_right_handed());
        // Most peaks should index against the recovered basis
        assert!(VecSearch::score(best, &peaks
            .iter()
            .map(|p| det.panels[p.panel].q_vector(p.fs, p.ss, 1.0 / image.lambda))
            .collect::<Vec<_>>()) > 0.7);
    }

    #[test]
    fn too_few_peaks_is_not_an_error() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let image = Image::new(&det, 1.3e-10);
        let idx = VecSearch::new(cubic_cell(), [0.05; 3], [0.03; 3]);
        let cells = idx.index(&image, &det, &Vec::new()).unwrap();
        assert!(cells.is_empty());
    }
}
