//! Matching candidate indexing solutions against a reference unit cell.
//!
//! Indexers are free to hand back any valid basis for the lattice they
//! found, so the driver searches axis permutations (and optionally integer
//! linear combinations) of the candidate for one whose parameters agree
//! with the reference within tolerance.

use super::cell::UnitCell;
use super::matrix::{det3, Mat3};

/// Cell comparison tolerances: fractional for lengths, radians for angles
#[derive(Debug, Clone, Copy)]
pub struct Tolerances {
    pub length: [f64; 3],
    pub angle: [f64; 3],
}

impl Tolerances {
    pub fn new(length: [f64; 3], angle: [f64; 3]) -> Self {
        Self { length, angle }
    }
}

/// Do the parameters of `cell` agree with `reference` within tolerance?
/// Orientation is ignored; centering must match.
pub fn compare_cell_parameters(cell: &UnitCell, reference: &UnitCell, tol: &Tolerances) -> bool {
    if cell.centering() != reference.centering() {
        return false;
    }
    relative_error(cell, reference, tol).is_some()
}

/// Combined figure of merit for candidate ranking: the sum of fractional
/// length errors and angle errors scaled by their tolerances. None when any
/// single term is out of tolerance.
pub fn cell_error_figure(cell: &UnitCell, reference: &UnitCell, tol: &Tolerances) -> Option<f64> {
    relative_error(cell, reference, tol)
}

fn relative_error(cell: &UnitCell, reference: &UnitCell, tol: &Tolerances) -> Option<f64> {
    let (a1, b1, c1, al1, be1, ga1) = cell.parameters();
    let (a2, b2, c2, al2, be2, ga2) = reference.parameters();

    let mut total = 0.0;
    for (i, (got, want)) in [(a1, a2), (b1, b2), (c1, c2)].into_iter().enumerate() {
        let frac = (got - want).abs() / want;
        if frac > tol.length[i] {
            return None;
        }
        total += frac / tol.length[i];
    }
    for (i, (got, want)) in [(al1, al2), (be1, be2), (ga1, ga2)].into_iter().enumerate() {
        let diff = (got - want).abs();
        if diff > tol.angle[i] {
            return None;
        }
        total += diff / tol.angle[i];
    }
    Some(total)
}

/// Signed axis permutations: every unimodular matrix whose rows are
/// +-unit vectors
fn axis_permutations() -> Vec<Mat3> {
    let units: [[f64; 3]; 6] = [
        [1.0, 0.0, 0.0],
        [-1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, -1.0, 0.0],
        [0.0, 0.0, 1.0],
        [0.0, 0.0, -1.0],
    ];
    let mut out = Vec::new();
    for &r0 in &units {
        for &r1 in &units {
            for &r2 in &units {
                let m = [r0, r1, r2];
                if det3(&m).abs() > 0.5 {
                    out.push(m);
                }
            }
        }
    }
    out
}

/// All candidate rows with coefficients in {-1, 0, 1, 2}
fn combination_rows() -> Vec<[f64; 3]> {
    let coeffs = [-1.0, 0.0, 1.0, 2.0];
    let mut rows = Vec::new();
    for &x in &coeffs {
        for &y in &coeffs {
            for &z in &coeffs {
                if x == 0.0 && y == 0.0 && z == 0.0 {
                    continue;
                }
                rows.push([x, y, z]);
            }
        }
    }
    rows
}

/// Search transformations of `candidate` for the one best matching
/// `reference`. With `combinations` false only signed axis permutations are
/// tried; with it true, integer linear combinations with coefficients in
/// {-1, 0, 1, 2} are also considered. The winner is the unimodular,
/// right-handed transform minimising the combined relative error.
pub fn match_cell(
    candidate: &UnitCell,
    reference: &UnitCell,
    tol: &Tolerances,
    combinations: bool,
) -> Option<UnitCell> {
    let mats: Vec<Mat3> = if combinations {
        let rows = combination_rows();
        // Prefilter rows by length against each reference axis to keep the
        // triple loop tractable
        let (ra, rb, rc, _, _, _) = reference.parameters();
        let row_len = |row: &[f64; 3]| {
            let t = candidate.transformed(&[*row, [0.0; 3], [0.0; 3]]);
            let (la, _, _) = t.cartesian();
            super::matrix::modulus(&la)
        };
        let fits = |len: f64, want: f64, tol_frac: f64| (len - want).abs() / want <= tol_frac;
        let rows_a: Vec<[f64; 3]> = rows
            .iter()
            .copied()
            .filter(|r| fits(row_len(r), ra, tol.length[0]))
            .collect();
        let rows_b: Vec<[f64; 3]> = rows
            .iter()
            .copied()
            .filter(|r| fits(row_len(r), rb, tol.length[1]))
            .collect();
        let rows_c: Vec<[f64; 3]> = rows
            .iter()
            .copied()
            .filter(|r| fits(row_len(r), rc, tol.length[2]))
            .collect();
        let mut mats = Vec::new();
        for &r0 in &rows_a {
            for &r1 in &rows_b {
                for &r2 in &rows_c {
                    // Doubled axes are legitimate (coefficient 2 exists for
                    // them), so only degenerate triples are excluded
                    let m = [r0, r1, r2];
                    if det3(&m).abs() > 0.5 {
                        mats.push(m);
                    }
                }
            }
        }
        mats
    } else {
        axis_permutations()
    };

    let mut best: Option<(f64, UnitCell)> = None;
    for m in &mats {
        let trial = candidate.transformed(m);
        if !trial.is_right_handed() || !trial.is_sensible() {
            continue;
        }
        if let Some(err) = relative_error(&trial, reference, tol) {
            match &best {
                Some((b, _)) if *b <= err => {}
                _ => best = Some((err, trial)),
            }
        }
    }

    best.map(|(_, mut cell)| {
        cell.adopt_symmetry_of(reference);
        cell
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{LatticeType, UnitCell};

    fn tols() -> Tolerances {
        Tolerances::new([0.05, 0.05, 0.05], [
            1.5f64.to_radians(),
            1.5f64.to_radians(),
            1.5f64.to_radians(),
        ])
    }

    fn reference() -> UnitCell {
        UnitCell::from_parameters(
            40e-10,
            50e-10,
            60e-10,
            90f64.to_radians(),
            90f64.to_radians(),
            90f64.to_radians(),
        )
        .unwrap()
        .with_lattice(LatticeType::Orthorhombic, 'P')
    }

    #[test]
    fn identical_cell_matches_itself() {
        let r = reference();
        assert!(compare_cell_parameters(&r, &r, &tols()));
        let m = match_cell(&r, &r, &tols(), false).unwrap();
        assert!(compare_cell_parameters(&m, &r, &tols()));
    }

    #[test]
    fn permuted_axes_are_recovered() {
        let r = reference();
        // b, c, a ordering: lengths come back as 50, 60, 40
        let perm: crate::matrix::Mat3 = [[0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]];
        let permuted = r.transformed(&perm);
        assert!(!compare_cell_parameters(&permuted, &r, &tols()));
        let matched = match_cell(&permuted, &r, &tols(), false).unwrap();
        assert!(compare_cell_parameters(&matched, &r, &tols()));
        assert!(matched.is_right_handed());
        assert_eq!(matched.lattice_type(), LatticeType::Orthorhombic);
    }

    #[test]
    fn out_of_tolerance_cell_is_rejected() {
        let r = reference();
        let wrong = UnitCell::from_parameters(
            44e-10,
            50e-10,
            60e-10,
            90f64.to_radians(),
            90f64.to_radians(),
            90f64.to_radians(),
        )
        .unwrap();
        assert!(match_cell(&wrong, &r, &tols(), false).is_none());
    }

    #[test]
    fn doubled_axis_found_via_combinations() {
        // Candidate found the a axis halved relative to the reference
        let half = UnitCell::from_parameters(
            20e-10,
            50e-10,
            60e-10,
            90f64.to_radians(),
            90f64.to_radians(),
            90f64.to_radians(),
        )
        .unwrap();
        let r = reference();
        assert!(match_cell(&half, &r, &tols(), false).is_none());
        let matched = match_cell(&half, &r, &tols(), true).unwrap();
        assert!(compare_cell_parameters(&matched, &r, &tols()));
    }
}
