//! Small fixed-size matrix helpers shared by the geometry, cell and
//! integration code. Everything here is 3x3; anything larger belongs to a
//! real linear algebra crate.

pub type Mat3 = [[f64; 3]; 3];
pub type Vec3 = [f64; 3];

pub fn det3(m: &Mat3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Solve m * x = b by Cramer's rule. Returns None for a singular system.
pub fn solve3(m: &Mat3, b: &Vec3) -> Option<Vec3> {
    let d = det3(m);
    if d.abs() < f64::MIN_POSITIVE * 1e3 || !d.is_finite() {
        return None;
    }
    let mut x = [0.0; 3];
    for (col, slot) in x.iter_mut().enumerate() {
        let mut mc = *m;
        for row in 0..3 {
            mc[row][col] = b[row];
        }
        *slot = det3(&mc) / d;
    }
    Some(x)
}

pub fn inv3(m: &Mat3) -> Option<Mat3> {
    let d = det3(m);
    if d.abs() < f64::MIN_POSITIVE * 1e3 || !d.is_finite() {
        return None;
    }
    let c = |r0: usize, r1: usize, c0: usize, c1: usize| {
        m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]
    };
    // Adjugate over determinant
    Some([
        [c(1, 2, 1, 2) / d, -c(0, 2, 1, 2) / d, c(0, 1, 1, 2) / d],
        [-c(1, 2, 0, 2) / d, c(0, 2, 0, 2) / d, -c(0, 1, 0, 2) / d],
        [c(1, 2, 0, 1) / d, -c(0, 2, 0, 1) / d, c(0, 1, 0, 1) / d],
    ])
}

pub fn mat_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

pub fn cross(a: &Vec3, b: &Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn dot(a: &Vec3, b: &Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn modulus(v: &Vec3) -> f64 {
    dot(v, v).sqrt()
}

/// Angle between two vectors, radians
pub fn angle(a: &Vec3, b: &Vec3) -> f64 {
    let m = modulus(a) * modulus(b);
    if m == 0.0 {
        return 0.0;
    }
    (dot(a, b) / m).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_and_invert_agree() {
        let m: Mat3 = [[2.0, 1.0, 0.5], [0.0, 3.0, 1.0], [1.0, 0.0, 4.0]];
        let b: Vec3 = [1.0, 2.0, 3.0];
        let x = solve3(&m, &b).unwrap();
        let mi = inv3(&m).unwrap();
        let xi = mat_vec(&mi, &b);
        for i in 0..3 {
            assert!((x[i] - xi[i]).abs() < 1e-12);
        }
        let back = mat_vec(&m, &x);
        for i in 0..3 {
            assert!((back[i] - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m: Mat3 = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 1.0, 0.0]];
        assert!(solve3(&m, &[1.0, 1.0, 1.0]).is_none());
        assert!(inv3(&m).is_none());
    }
}
