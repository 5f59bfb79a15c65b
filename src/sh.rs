//! Spherical harmonics helpers.
//!
//! Coefficients are ordered by ACN, that is `(n, m)` with `n` running from 0
//! to the maximum order and `m` from `-n` to `n`. The complex, orthonormal
//! basis with Condon-Shortley phase is used throughout.

use std::f64::consts::PI;

use realfft::num_complex::Complex;

use crate::Error;

/// Number of coefficients up to (and including) `order`.
pub fn sh_count(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// Degree `m` of every coefficient up to `order`.
pub fn sh_m(order: usize) -> Vec<f32> {
    (0..=order as i32)
        .flat_map(|n| (-n..=n).map(|m| m as f32))
        .collect()
}

/// Order `n` of every coefficient up to `order`.
pub fn sh_n(order: usize) -> Vec<usize> {
    (0..=order)
        .flat_map(|n| std::iter::repeat(n).take(2 * n + 1))
        .collect()
}

/// For every `(n, m)` the index of `(n, -m)`.
pub fn reverse_mn_ids(order: usize) -> Vec<usize> {
    (0..=order as i64)
        .flat_map(|n| (-n..=n).map(move |m| (n * n + n - m) as usize))
        .collect()
}

/// Associated Legendre function `P_n^m(x)` for `m >= 0`, including the
/// Condon-Shortley phase.
fn legendre(n: usize, m: usize, x: f64) -> f64 {
    let mut pmm = 1.0;

    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;

        for _ in 0..m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }

    if n == m {
        return pmm;
    }

    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;

    if n == m + 1 {
        return pmmp1;
    }

    let mut pnm = 0.0;

    for nn in m + 2..=n {
        pnm = (x * (2 * nn - 1) as f64 * pmmp1 - (nn + m - 1) as f64 * pmm) / (nn - m) as f64;
        pmm = pmmp1;
        pmmp1 = pnm;
    }

    pnm
}

/// Complex orthonormal spherical harmonic `Y_n^m` at `azimuth` and
/// `colatitude` (radians).
pub fn sph_harm(n: usize, m: i64, azimuth: f64, colatitude: f64) -> Complex<f64> {
    let m_abs = m.unsigned_abs() as usize;

    if m_abs > n {
        return Complex::new(0.0, 0.0);
    }

    // (n - |m|)! / (n + |m|)!
    let ratio = (n - m_abs + 1..=n + m_abs).fold(1.0, |acc, k| acc / k as f64);
    let norm = ((2 * n + 1) as f64 / (4.0 * PI) * ratio).sqrt();

    let y = Complex::from_polar(
        norm * legendre(n, m_abs, colatitude.cos()),
        m_abs as f64 * azimuth,
    );

    if m < 0 {
        let sign = if m_abs % 2 == 0 { 1.0 } else { -1.0 };
        y.conj() * sign
    } else {
        y
    }
}

/// Gauss-Legendre nodes and weights on `[-1, 1]`.
fn gauss_legendre(count: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; count];
    let mut weights = vec![0.0; count];

    for i in 0..count {
        let mut z = (PI * (i as f64 + 0.75) / (count as f64 + 0.5)).cos();
        let mut pp = 1.0;

        for _ in 0..100 {
            let mut p1 = 1.0;
            let mut p2 = 0.0;

            for j in 0..count {
                let p3 = p2;
                p2 = p1;
                p1 = ((2 * j + 1) as f64 * z * p2 - j as f64 * p3) / (j + 1) as f64;
            }

            pp = count as f64 * (z * p1 - p2) / (z * z - 1.0);

            let z1 = z;
            z = z1 - p1 / pp;

            if (z - z1).abs() < 1e-14 {
                break;
            }
        }

        nodes[i] = z;
        weights[i] = 2.0 / ((1.0 - z * z) * pp * pp);
    }

    (nodes, weights)
}

/// Spatial sampling points with quadrature weights (summing to `4π`).
#[derive(Clone, Debug)]
pub struct SamplingGrid {
    /// azimuth in radians
    pub azimuth: Vec<f32>,
    /// colatitude in radians
    pub colatitude: Vec<f32>,
    pub weights: Vec<f32>,
}

impl SamplingGrid {
    pub fn new(azimuth: Vec<f32>, colatitude: Vec<f32>, weights: Vec<f32>) -> Result<Self, Error> {
        if azimuth.is_empty() || azimuth.len() != colatitude.len() || azimuth.len() != weights.len() {
            return Err(Error::InvalidShConfiguration(format!(
                "grid dimensions differ: {} azimuths, {} colatitudes, {} weights",
                azimuth.len(),
                colatitude.len(),
                weights.len()
            )));
        }

        Ok(Self {
            azimuth,
            colatitude,
            weights,
        })
    }

    /// Gauss-Legendre by equiangular grid, exact quadrature up to `order`.
    pub fn gauss(order: usize) -> Self {
        let (nodes, gl_weights) = gauss_legendre(order + 1);
        let azimuth_count = 2 * order + 2;
        let azimuth_weight = 2.0 * PI / azimuth_count as f64;

        let mut azimuth = Vec::with_capacity(nodes.len() * azimuth_count);
        let mut colatitude = Vec::with_capacity(nodes.len() * azimuth_count);
        let mut weights = Vec::with_capacity(nodes.len() * azimuth_count);

        for (node, weight) in Iterator::zip(nodes.iter(), gl_weights.iter()) {
            for k in 0..azimuth_count {
                azimuth.push((2.0 * PI * k as f64 / azimuth_count as f64) as f32);
                colatitude.push(node.acos() as f32);
                weights.push((weight * azimuth_weight) as f32);
            }
        }

        Self {
            azimuth,
            colatitude,
            weights,
        }
    }

    pub fn len(&self) -> usize {
        self.azimuth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.azimuth.is_empty()
    }

    /// Quadrature weighted conjugate bases of size `[coefficients][points]`
    pub fn bases_weighted(&self, order: usize) -> Box<[Complex<f32>]> {
        let mut bases = Vec::with_capacity(sh_count(order) * self.len());

        for n in 0..=order {
            for m in -(n as i64)..=n as i64 {
                for p in 0..self.len() {
                    let y = sph_harm(
                        n,
                        m,
                        self.azimuth[p] as f64,
                        self.colatitude[p] as f64,
                    );
                    let w = y.conj() * self.weights[p] as f64;
                    bases.push(Complex::new(w.re as f32, w.im as f32));
                }
            }
        }

        bases.into_boxed_slice()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayKind {
    /// open sphere of omnidirectional transducers
    Open,
    /// transducers mounted on a rigid sphere
    Rigid,
}

/// Recording or measurement microphone array
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArrayConfiguration {
    /// sphere radius in meters
    pub radius: f32,
    pub kind: ArrayKind,
}

/// Everything needed to transform an incoming block of array signals into
/// spherical harmonics coefficients.
#[derive(Clone, Debug)]
pub struct ShConfiguration {
    order: usize,
    sh_m: Box<[f32]>,
    /// `[coefficients][channels]`
    sh_bases_weighted: Box<[Complex<f32>]>,
    channels: usize,
    array: Option<ArrayConfiguration>,
}

impl ShConfiguration {
    pub fn new(
        order: usize,
        grid: &SamplingGrid,
        array: Option<ArrayConfiguration>,
    ) -> Result<Self, Error> {
        if grid.is_empty() {
            return Err(Error::InvalidShConfiguration("empty sampling grid".into()));
        }

        Ok(Self {
            order,
            sh_m: sh_m(order).into_boxed_slice(),
            sh_bases_weighted: grid.bases_weighted(order),
            channels: grid.len(),
            array,
        })
    }

    /// Build from an externally computed weighted basis matrix of size
    /// `[coefficients][channels]`.
    pub fn from_bases(
        order: usize,
        sh_bases_weighted: Box<[Complex<f32>]>,
        array: Option<ArrayConfiguration>,
    ) -> Result<Self, Error> {
        let coeffs = sh_count(order);

        if sh_bases_weighted.is_empty() || sh_bases_weighted.len() % coeffs != 0 {
            return Err(Error::InvalidShConfiguration(format!(
                "{} basis values do not fit {} coefficients",
                sh_bases_weighted.len(),
                coeffs
            )));
        }

        Ok(Self {
            order,
            sh_m: sh_m(order).into_boxed_slice(),
            channels: sh_bases_weighted.len() / coeffs,
            sh_bases_weighted,
            array,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn sh_m(&self) -> &[f32] {
        &self.sh_m
    }

    pub fn sh_bases_weighted(&self) -> &[Complex<f32>] {
        &self.sh_bases_weighted
    }

    pub fn coefficient_count(&self) -> usize {
        self.sh_m.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn array(&self) -> Option<&ArrayConfiguration> {
        self.array.as_ref()
    }
}
