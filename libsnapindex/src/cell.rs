use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::error::CellError;
use super::matrix::{cross, dot, inv3, modulus, Mat3, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatticeType {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Rhombohedral,
    Hexagonal,
    Cubic,
}

impl FromStr for LatticeType {
    type Err = CellError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triclinic" => Ok(Self::Triclinic),
            "monoclinic" => Ok(Self::Monoclinic),
            "orthorhombic" => Ok(Self::Orthorhombic),
            "tetragonal" => Ok(Self::Tetragonal),
            "rhombohedral" => Ok(Self::Rhombohedral),
            "hexagonal" => Ok(Self::Hexagonal),
            "cubic" => Ok(Self::Cubic),
            _ => Err(CellError::BadLatticeType(s.to_string())),
        }
    }
}

impl fmt::Display for LatticeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Triclinic => "triclinic",
            Self::Monoclinic => "monoclinic",
            Self::Orthorhombic => "orthorhombic",
            Self::Tetragonal => "tetragonal",
            Self::Rhombohedral => "rhombohedral",
            Self::Hexagonal => "hexagonal",
            Self::Cubic => "cubic",
        };
        write!(f, "{s}")
    }
}

const CENTERINGS: &[char] = &['P', 'A', 'B', 'C', 'I', 'F', 'R', 'H'];

/// A unit cell, held canonically as the three real-space basis vectors in
/// metres. The crystallographic parameters (a, b, c, alpha, beta, gamma) and
/// the reciprocal basis are derived on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCell {
    a: Vec3,
    b: Vec3,
    c: Vec3,
    lattice_type: LatticeType,
    centering: char,
    unique_axis: char,
}

/// On-disk cell template: lengths in Angstrom, angles in degrees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellFile {
    pub lattice_type: String,
    pub centering: char,
    #[serde(default)]
    pub unique_axis: Option<char>,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl UnitCell {
    /// Build a cell from crystallographic parameters (metres, radians) in the
    /// conventional orientation: a along x, b in the xy plane.
    pub fn from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    ) -> Result<Self, CellError> {
        let cell = Self::try_from_parameters(a, b, c, alpha, beta, gamma)?;
        if !cell.is_sensible() {
            return Err(CellError::NotSensible);
        }
        Ok(cell)
    }

    fn try_from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    ) -> Result<Self, CellError> {
        if !(a > 0.0 && b > 0.0 && c > 0.0) {
            return Err(CellError::NotSensible);
        }
        let av = [a, 0.0, 0.0];
        let bv = [b * gamma.cos(), b * gamma.sin(), 0.0];
        let cx = c * beta.cos();
        let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
        let cz2 = c * c - cx * cx - cy * cy;
        if cz2 <= 0.0 || !cz2.is_finite() {
            return Err(CellError::NotSensible);
        }
        let cv = [cx, cy, cz2.sqrt()];
        Ok(Self {
            a: av,
            b: bv,
            c: cv,
            lattice_type: LatticeType::Triclinic,
            centering: 'P',
            unique_axis: '?',
        })
    }

    /// Build a cell directly from three real-space vectors (metres)
    pub fn from_cartesian(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self {
            a,
            b,
            c,
            lattice_type: LatticeType::Triclinic,
            centering: 'P',
            unique_axis: '?',
        }
    }

    /// Build a cell from three reciprocal-space vectors (m^-1)
    pub fn from_reciprocal(astar: Vec3, bstar: Vec3, cstar: Vec3) -> Result<Self, CellError> {
        // Direct basis rows satisfy M * Rt = I for reciprocal rows R
        let rt: Mat3 = [
            [astar[0], bstar[0], cstar[0]],
            [astar[1], bstar[1], cstar[1]],
            [astar[2], bstar[2], cstar[2]],
        ];
        let m = inv3(&rt).ok_or(CellError::Singular)?;
        Ok(Self::from_cartesian(m[0], m[1], m[2]))
    }

    /// Read a cell template from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, CellError> {
        if !path.exists() {
            return Err(CellError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let spec = serde_yaml::from_str::<CellFile>(&yaml_str)?;
        let lattice = LatticeType::from_str(&spec.lattice_type)?;
        if !CENTERINGS.contains(&spec.centering) {
            return Err(CellError::BadCentering(spec.centering));
        }
        let mut cell = Self::from_parameters(
            spec.a * 1e-10,
            spec.b * 1e-10,
            spec.c * 1e-10,
            spec.alpha.to_radians(),
            spec.beta.to_radians(),
            spec.gamma.to_radians(),
        )?;
        cell.lattice_type = lattice;
        cell.centering = spec.centering;
        cell.unique_axis = spec.unique_axis.unwrap_or('?');
        cell.check_centering()?;
        Ok(cell)
    }

    pub fn with_lattice(mut self, lattice: LatticeType, centering: char) -> Self {
        self.lattice_type = lattice;
        self.centering = centering;
        self
    }

    /// Copy lattice type, centering and unique axis from another cell,
    /// keeping this cell's vectors. Used when a candidate from an indexer
    /// inherits the reference cell's symmetry.
    pub fn adopt_symmetry_of(&mut self, other: &UnitCell) {
        self.lattice_type = other.lattice_type;
        self.centering = other.centering;
        self.unique_axis = other.unique_axis;
    }

    pub fn lattice_type(&self) -> LatticeType {
        self.lattice_type
    }

    pub fn centering(&self) -> char {
        self.centering
    }

    pub fn unique_axis(&self) -> char {
        self.unique_axis
    }

    pub fn cartesian(&self) -> (Vec3, Vec3, Vec3) {
        (self.a, self.b, self.c)
    }

    /// Crystallographic parameters: lengths in metres, angles in radians
    pub fn parameters(&self) -> (f64, f64, f64, f64, f64, f64) {
        let a = modulus(&self.a);
        let b = modulus(&self.b);
        let c = modulus(&self.c);
        let alpha = super::matrix::angle(&self.b, &self.c);
        let beta = super::matrix::angle(&self.a, &self.c);
        let gamma = super::matrix::angle(&self.a, &self.b);
        (a, b, c, alpha, beta, gamma)
    }

    /// The reciprocal basis (m^-1), rows a*, b*, c*
    pub fn reciprocal(&self) -> Result<(Vec3, Vec3, Vec3), CellError> {
        let m: Mat3 = [self.a, self.b, self.c];
        let mt: Mat3 = [
            [m[0][0], m[1][0], m[2][0]],
            [m[0][1], m[1][1], m[2][1]],
            [m[0][2], m[1][2], m[2][2]],
        ];
        let inv = inv3(&mt).ok_or(CellError::Singular)?;
        Ok((inv[0], inv[1], inv[2]))
    }

    /// Reciprocal-lattice vector of (h, k, l), m^-1
    pub fn reciprocal_point(&self, h: i32, k: i32, l: i32) -> Result<Vec3, CellError> {
        let (astar, bstar, cstar) = self.reciprocal()?;
        let (hf, kf, lf) = (h as f64, k as f64, l as f64);
        Ok([
            hf * astar[0] + kf * bstar[0] + lf * cstar[0],
            hf * astar[1] + kf * bstar[1] + lf * cstar[1],
            hf * astar[2] + kf * bstar[2] + lf * cstar[2],
        ])
    }

    /// Cell volume, m^3 (signed: negative for a left-handed basis)
    pub fn volume(&self) -> f64 {
        dot(&cross(&self.a, &self.b), &self.c)
    }

    pub fn is_right_handed(&self) -> bool {
        self.volume() > 0.0
    }

    /// The angle checks of Foadi and Evans (2011) plus finiteness
    pub fn is_sensible(&self) -> bool {
        let (a, b, c, al, be, ga) = self.parameters();
        if !(a.is_finite() && b.is_finite() && c.is_finite()) {
            return false;
        }
        if a <= 0.0 || b <= 0.0 || c <= 0.0 {
            return false;
        }
        if al.is_nan() || be.is_nan() || ga.is_nan() {
            return false;
        }
        let tau = 2.0 * std::f64::consts::PI;
        for (x, y, z) in [(al, be, ga), (al, ga, be), (be, ga, al)] {
            if x + y + z >= tau || x + y + z <= 0.0 {
                return false;
            }
            if x + y - z >= tau || x + y - z <= 0.0 {
                return false;
            }
        }
        true
    }

    fn check_centering(&self) -> Result<(), CellError> {
        use LatticeType::*;
        let ok = match self.centering {
            'P' => true,
            'A' | 'B' | 'C' => matches!(self.lattice_type, Monoclinic | Orthorhombic),
            'I' => matches!(self.lattice_type, Monoclinic | Orthorhombic | Tetragonal | Cubic),
            'F' => matches!(self.lattice_type, Orthorhombic | Cubic),
            'R' => matches!(self.lattice_type, Rhombohedral),
            'H' => matches!(self.lattice_type, Hexagonal),
            other => return Err(CellError::BadCentering(other)),
        };
        if !ok {
            return Err(CellError::NotSensible);
        }
        Ok(())
    }

    /// Return sin(theta)/lambda = 1/2d for the given indices, m^-1
    pub fn resolution(&self, h: i32, k: i32, l: i32) -> f64 {
        let (a, b, c, al, be, ga) = self.parameters();
        let (hf, kf, lf) = (h as f64, k as f64, l as f64);

        let vsq = a * a * b * b * c * c
            * (1.0 - al.cos() * al.cos() - be.cos() * be.cos() - ga.cos() * ga.cos()
                + 2.0 * al.cos() * be.cos() * ga.cos());

        let s11 = b * b * c * c * al.sin() * al.sin();
        let s22 = a * a * c * c * be.sin() * be.sin();
        let s33 = a * a * b * b * ga.sin() * ga.sin();
        let s12 = a * b * c * c * (al.cos() * be.cos() - ga.cos());
        let s23 = a * a * b * c * (be.cos() * ga.cos() - al.cos());
        let s13 = a * b * b * c * (ga.cos() * al.cos() - be.cos());

        let brackets = s11 * hf * hf
            + s22 * kf * kf
            + s33 * lf * lf
            + 2.0 * s12 * hf * kf
            + 2.0 * s23 * kf * lf
            + 2.0 * s13 * hf * lf;

        (brackets / vsq).sqrt() / 2.0
    }

    /// Systematic absence by centering. Reflection conditions must stay in
    /// step with the centering transformation matrices.
    pub fn forbidden_reflection(&self, h: i32, k: i32, l: i32) -> bool {
        match self.centering {
            'P' | 'R' => false,
            'A' => (k + l).rem_euclid(2) != 0,
            'B' => (h + l).rem_euclid(2) != 0,
            'C' => (h + k).rem_euclid(2) != 0,
            'I' => (h + k + l).rem_euclid(2) != 0,
            'F' => {
                (h + k).rem_euclid(2) != 0
                    || (h + l).rem_euclid(2) != 0
                    || (k + l).rem_euclid(2) != 0
            }
            'H' => (-h + k + l).rem_euclid(3) != 0,
            _ => false,
        }
    }

    /// Transform the cell axes by an integer (or rational) matrix:
    /// a' = m00 a + m01 b + m02 c, and so on.
    pub fn transformed(&self, m: &Mat3) -> Self {
        let mut out = self.clone();
        let basis: Mat3 = [self.a, self.b, self.c];
        let comb = |row: &Vec3| -> Vec3 {
            [
                row[0] * basis[0][0] + row[1] * basis[1][0] + row[2] * basis[2][0],
                row[0] * basis[0][1] + row[1] * basis[1][1] + row[2] * basis[2][1],
                row[0] * basis[0][2] + row[1] * basis[1][2] + row[2] * basis[2][2],
            ]
        };
        out.a = comb(&m[0]);
        out.b = comb(&m[1]);
        out.c = comb(&m[2]);
        out
    }

    /// Undo a transformation applied with `transformed`
    pub fn transformed_inverse(&self, m: &Mat3) -> Result<Self, CellError> {
        let mi = inv3(m).ok_or(CellError::Singular)?;
        Ok(self.transformed(&mi))
    }

    /// Rotate the whole cell rigidly about a lab axis
    pub fn rotated(&self, axis: Vec3, angle: f64) -> Self {
        let n = modulus(&axis);
        if n == 0.0 || angle == 0.0 {
            return self.clone();
        }
        let u = [axis[0] / n, axis[1] / n, axis[2] / n];
        let rotate = |v: &Vec3| -> Vec3 {
            // Rodrigues rotation
            let cosa = angle.cos();
            let sina = angle.sin();
            let ucv = cross(&u, v);
            let udv = dot(&u, v);
            [
                v[0] * cosa + ucv[0] * sina + u[0] * udv * (1.0 - cosa),
                v[1] * cosa + ucv[1] * sina + u[1] * udv * (1.0 - cosa),
                v[2] * cosa + ucv[2] * sina + u[2] * udv * (1.0 - cosa),
            ]
        };
        let mut out = self.clone();
        out.a = rotate(&self.a);
        out.b = rotate(&self.b);
        out.c = rotate(&self.c);
        out
    }

    /// Apply a reindexing operator in hkl space: indices transform by `m`,
    /// so the reciprocal basis transforms by m and the direct basis by the
    /// inverse transpose.
    pub fn reindexed(&self, m: &Mat3) -> Result<Self, CellError> {
        let (astar, bstar, cstar) = self.reciprocal()?;
        let new_astar = [
            m[0][0] * astar[0] + m[0][1] * bstar[0] + m[0][2] * cstar[0],
            m[0][0] * astar[1] + m[0][1] * bstar[1] + m[0][2] * cstar[1],
            m[0][0] * astar[2] + m[0][1] * bstar[2] + m[0][2] * cstar[2],
        ];
        let new_bstar = [
            m[1][0] * astar[0] + m[1][1] * bstar[0] + m[1][2] * cstar[0],
            m[1][0] * astar[1] + m[1][1] * bstar[1] + m[1][2] * cstar[1],
            m[1][0] * astar[2] + m[1][1] * bstar[2] + m[1][2] * cstar[2],
        ];
        let new_cstar = [
            m[2][0] * astar[0] + m[2][1] * bstar[0] + m[2][2] * cstar[0],
            m[2][0] * astar[1] + m[2][1] * bstar[1] + m[2][2] * cstar[1],
            m[2][0] * astar[2] + m[2][1] * bstar[2] + m[2][2] * cstar[2],
        ];
        let mut out = Self::from_reciprocal(new_astar, new_bstar, new_cstar)?;
        out.lattice_type = self.lattice_type;
        out.centering = self.centering;
        out.unique_axis = self.unique_axis;
        Ok(out)
    }

    /// Map a reciprocal-space vector to fractional Miller indices
    pub fn miller_of(&self, q: &Vec3) -> (f64, f64, f64) {
        // h = a . q by the duality of the bases
        (dot(&self.a, q), dot(&self.b, q), dot(&self.c, q))
    }
}

impl fmt::Display for UnitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, b, c, al, be, ga) = self.parameters();
        write!(
            f,
            "{} {} {:.2} {:.2} {:.2} A, {:.2} {:.2} {:.2} deg",
            self.lattice_type,
            self.centering,
            a * 1e10,
            b * 1e10,
            c * 1e10,
            al.to_degrees(),
            be.to_degrees(),
            ga.to_degrees()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic_50() -> UnitCell {
        let half_pi = std::f64::consts::FRAC_PI_2;
        UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
            .unwrap()
            .with_lattice(LatticeType::Cubic, 'P')
    }

    #[test]
    fn parameters_survive_construction() {
        let cell = UnitCell::from_parameters(
            40e-10,
            50e-10,
            60e-10,
            80f64.to_radians(),
            95f64.to_radians(),
            102f64.to_radians(),
        )
        .unwrap();
        let (a, b, c, al, be, ga) = cell.parameters();
        assert!((a - 40e-10).abs() < 1e-16);
        assert!((b - 50e-10).abs() < 1e-16);
        assert!((c - 60e-10).abs() < 1e-16);
        assert!((al.to_degrees() - 80.0).abs() < 1e-9);
        assert!((be.to_degrees() - 95.0).abs() < 1e-9);
        assert!((ga.to_degrees() - 102.0).abs() < 1e-9);
        assert!(cell.is_right_handed());
        assert!(cell.is_sensible());
    }

    #[test]
    fn identity_transformation_returns_equal_cell() {
        let cell = cubic_50();
        let ident: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let t = cell.transformed(&ident);
        let (a0, b0, c0) = cell.cartesian();
        let (a1, b1, c1) = t.cartesian();
        assert_eq!(a0, a1);
        assert_eq!(b0, b1);
        assert_eq!(c0, c1);
    }

    #[test]
    fn transformation_then_inverse_round_trips() {
        let cell = UnitCell::from_parameters(
            30e-10,
            45e-10,
            55e-10,
            85f64.to_radians(),
            92f64.to_radians(),
            100f64.to_radians(),
        )
        .unwrap();
        let m: Mat3 = [[0.0, 1.0, 0.0], [-1.0, 0.0, 1.0], [2.0, 0.0, 1.0]];
        let back = cell.transformed(&m).transformed_inverse(&m).unwrap();
        let (a0, b0, c0) = cell.cartesian();
        let (a1, b1, c1) = back.cartesian();
        for (orig, got) in [(a0, a1), (b0, b1), (c0, c1)] {
            for i in 0..3 {
                let scale = orig[i].abs().max(1e-10);
                assert!(
                    ((orig[i] - got[i]) / scale).abs() < 1e-6,
                    "component mismatch: {} vs {}",
                    orig[i],
                    got[i]
                );
            }
        }
    }

    #[test]
    fn cubic_resolution_matches_textbook() {
        let cell = cubic_50();
        // 1/2d for (100) of a 50 A cubic cell is 1/(2*50 A)
        let r = cell.resolution(1, 0, 0);
        assert!((r - 1.0 / (2.0 * 50e-10)).abs() / r < 1e-12);
        // (110) tightens by sqrt(2)
        let r110 = cell.resolution(1, 1, 0);
        assert!((r110 / r - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn centering_absences() {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let mut cell =
            UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi).unwrap();
        cell = cell.with_lattice(LatticeType::Cubic, 'I');
        assert!(cell.forbidden_reflection(1, 0, 0));
        assert!(!cell.forbidden_reflection(1, 1, 0));
        let f = cell.with_lattice(LatticeType::Cubic, 'F');
        assert!(f.forbidden_reflection(1, 1, 0));
        assert!(!f.forbidden_reflection(1, 1, 1));
        assert!(!f.forbidden_reflection(2, 0, 0));
    }

    #[test]
    fn silly_angles_are_not_sensible() {
        // alpha + beta + gamma far beyond the triangle condition
        let r = UnitCell::from_parameters(
            50e-10,
            50e-10,
            50e-10,
            170f64.to_radians(),
            170f64.to_radians(),
            170f64.to_radians(),
        );
        assert!(r.is_err());
    }

    #[test]
    fn reciprocal_duality() {
        let cell = UnitCell::from_parameters(
            32e-10,
            48e-10,
            61e-10,
            84f64.to_radians(),
            96f64.to_radians(),
            107f64.to_radians(),
        )
        .unwrap();
        let (astar, bstar, cstar) = cell.reciprocal().unwrap();
        let (a, b, c) = cell.cartesian();
        assert!((dot(&a, &astar) - 1.0).abs() < 1e-9);
        assert!((dot(&b, &bstar) - 1.0).abs() < 1e-9);
        assert!((dot(&c, &cstar) - 1.0).abs() < 1e-9);
        assert!(dot(&a, &bstar).abs() < 1e-9);
        assert!(dot(&a, &cstar).abs() < 1e-9);
    }

    #[test]
    fn rotation_preserves_parameters() {
        let cell = cubic_50();
        let rot = cell.rotated([0.3, -0.2, 0.9], 0.7);
        let (a0, b0, c0, al0, be0, ga0) = cell.parameters();
        let (a1, b1, c1, al1, be1, ga1) = rot.parameters();
        assert!((a0 - a1).abs() < 1e-20);
        assert!((b0 - b1).abs() < 1e-20);
        assert!((c0 - c1).abs() < 1e-20);
        assert!((al0 - al1).abs() < 1e-9);
        assert!((be0 - be1).abs() < 1e-9);
        assert!((ga0 - ga1).abs() < 1e-9);
        assert!(rot.is_right_handed());
    }

    #[test]
    fn miller_round_trip() {
        let cell = cubic_50();
        let q = cell.reciprocal_point(3, -2, 5).unwrap();
        let (h, k, l) = cell.miller_of(&q);
        assert!((h - 3.0).abs() < 1e-9);
        assert!((k + 2.0).abs() < 1e-9);
        assert!((l - 5.0).abs() < 1e-9);
    }
}
