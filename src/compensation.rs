//! Spectral compensation of spherical harmonics domain filters.
//!
//! Rendering a sound field captured by a spherical array needs the array's
//! radial dependency undone (modal radial filters) and, once the order gets
//! truncated, the resulting loss of high frequency energy counteracted. A
//! [`Compensation`] produces one multiplier spectrum per SH coefficient which
//! gets multiplied into the filter set's SH domain blocks.

use std::f64::consts::PI;

use log::debug;
use realfft::num_complex::Complex;
use realfft::num_traits::{One, Zero};

use crate::filter::{FilterBlocks, ShFilters};
use crate::sh::{sh_count, sh_n, ArrayConfiguration, ArrayKind};
use crate::Error;

/// Speed of sound in m/s
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Head radius in meters used by the spherical head filter
pub const HEAD_RADIUS: f32 = 0.0875;

/// Lower bound of `kr` to keep the radial filters finite at DC
const MIN_KR: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompensationType {
    /// Inverse of the array's radial dependency, soft limited
    ModalRadialFilter,
    /// Half-sided Hann window over the orders
    Tapering,
    /// Equalization of the order truncation energy loss
    SphericalHeadFilter,
}

/// Parameters of a single compensation run
pub struct CompensationRequest<'a> {
    pub types: &'a [CompensationType],
    pub filter_set: &'a dyn ShFilters,
    /// Currently rendered SH order
    pub sh_order: usize,
    pub array: Option<&'a ArrayConfiguration>,
    /// Maximum amplification of the modal radial filters
    pub amp_limit_db: f32,
    /// Length of the two-sided spectrum
    pub fft_len: usize,
}

/// Multiplier of size `[coefficients][bins]`
#[derive(Clone, Debug, PartialEq)]
pub struct CompensationSpectrum {
    coeffs: usize,
    bins: usize,
    data: Box<[Complex<f32>]>,
}

impl CompensationSpectrum {
    pub fn unity(coeffs: usize, bins: usize) -> Self {
        Self {
            coeffs,
            bins,
            data: vec![Complex::one(); coeffs * bins].into_boxed_slice(),
        }
    }

    pub fn coefficient_count(&self) -> usize {
        self.coeffs
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn coefficient(&self, coeff: usize) -> &[Complex<f32>] {
        &self.data[coeff * self.bins..(coeff + 1) * self.bins]
    }

    pub fn coefficient_mut(&mut self, coeff: usize) -> &mut [Complex<f32>] {
        &mut self.data[coeff * self.bins..(coeff + 1) * self.bins]
    }

    /// Multiply into SH domain blocks of size `[blocks][coefficients][outputs][bins]`.
    pub fn apply(&self, blocks: &mut FilterBlocks) -> Result<(), Error> {
        if blocks.inputs() != self.coeffs || blocks.bins() != self.bins {
            return Err(Error::InvalidCompensation(format!(
                "spectrum of {} coefficients and {} bins does not match filter blocks {:?}",
                self.coeffs,
                self.bins,
                blocks.shape()
            )));
        }

        for b in 0..blocks.blocks() {
            for c in 0..self.coeffs {
                for o in 0..blocks.outputs() {
                    let gains = &self.data[c * self.bins..(c + 1) * self.bins];
                    for (bin, gain) in Iterator::zip(blocks.spectrum_mut(b, c, o).iter_mut(), gains) {
                        *bin *= gain;
                    }
                }
            }
        }

        Ok(())
    }
}

pub trait Compensation: Send {
    /// Drop everything cached from previous requests
    fn reset_config(&mut self);

    fn generate(&mut self, request: &CompensationRequest) -> Result<CompensationSpectrum, Error>;
}

/// Spherical Bessel function of the first kind.
pub fn spherical_jn(n: usize, x: f64) -> f64 {
    if x < (n + 1) as f64 {
        // ascending series, upward recurrence is unstable here
        let mut term = (1..=n).fold(1.0, |acc, k| acc * x / (2 * k + 1) as f64);
        let mut sum = term;

        for k in 1..100 {
            term *= -0.5 * x * x / (k * (2 * n + 2 * k + 1)) as f64;
            sum += term;

            if term.abs() < 1e-17 * sum.abs() {
                break;
            }
        }

        return sum;
    }

    let (sin, cos) = x.sin_cos();
    let mut prev = sin / x;

    if n == 0 {
        return prev;
    }

    let mut cur = sin / (x * x) - cos / x;

    for l in 1..n {
        let next = (2 * l + 1) as f64 / x * cur - prev;
        prev = cur;
        cur = next;
    }

    cur
}

/// Spherical Bessel function of the second kind.
pub fn spherical_yn(n: usize, x: f64) -> f64 {
    let (sin, cos) = x.sin_cos();
    let mut prev = -cos / x;

    if n == 0 {
        return prev;
    }

    let mut cur = -cos / (x * x) - sin / x;

    for l in 1..n {
        let next = (2 * l + 1) as f64 / x * cur - prev;
        prev = cur;
        cur = next;
    }

    cur
}

/// Derivative of a spherical Bessel function `f` of order `n` with respect to `x`
fn derivative(f: fn(usize, f64) -> f64, n: usize, x: f64) -> f64 {
    match n {
        0 => -f(1, x),
        _ => f(n - 1, x) - (n + 1) as f64 / x * f(n, x),
    }
}

/// Spherical Hankel function of the second kind and its derivative
fn spherical_hn2(n: usize, x: f64) -> (Complex<f64>, Complex<f64>) {
    let h = Complex::new(spherical_jn(n, x), -spherical_yn(n, x));
    let dh = Complex::new(
        derivative(spherical_jn, n, x),
        -derivative(spherical_yn, n, x),
    );
    (h, dh)
}

fn i_pow(n: usize) -> Complex<f64> {
    match n % 4 {
        0 => Complex::new(1.0, 0.0),
        1 => Complex::new(0.0, 1.0),
        2 => Complex::new(-1.0, 0.0),
        _ => Complex::new(0.0, -1.0),
    }
}

/// Radial dependency `b_n(kr)` of a sphere, without the `4π` factor.
fn radial_dependency(n: usize, kr: f64, kind: ArrayKind) -> Complex<f64> {
    let jn = spherical_jn(n, kr);

    let b = match kind {
        ArrayKind::Open => Complex::new(jn, 0.0),
        ArrayKind::Rigid => {
            let (hn, dhn) = spherical_hn2(n, kr);
            let djn = derivative(spherical_jn, n, kr);
            Complex::new(jn, 0.0) - hn * (djn / dhn)
        }
    };

    i_pow(n) * b
}

/// Soft clipping of the magnitude to `limit` while keeping the phase.
fn soft_limit(value: Complex<f64>, limit: f64) -> Complex<f64> {
    let magnitude = value.norm();

    if magnitude == 0.0 {
        return value;
    }

    value * (2.0 * limit / (PI * magnitude)) * (PI * magnitude / (2.0 * limit)).atan()
}

/// Frequency in Hz of every bin in the positive half of a two-sided spectrum
fn positive_frequencies(fft_len: usize, sample_rate: f32) -> impl Iterator<Item = f64> {
    let step = sample_rate as f64 / fft_len as f64;
    (0..=fft_len / 2).map(move |k| k as f64 * step)
}

/// Wavenumber times radius, bounded away from zero
fn kr(frequency: f64, radius: f32) -> f64 {
    f64::max(2.0 * PI * frequency * radius as f64 / SPEED_OF_SOUND as f64, MIN_KR)
}

/// Mirror bins `1..fft_len/2` into the negative frequencies as conjugates.
fn mirror_negative_frequencies(bins: &mut [Complex<f32>]) {
    let len = bins.len();
    for k in 1..(len + 1) / 2 {
        bins[len - k] = bins[k].conj();
    }
}

#[derive(Clone, Debug, PartialEq)]
struct RadialKey {
    array: ArrayConfiguration,
    amp_limit_db: f32,
    fft_len: usize,
    sample_rate: f32,
    max_order: usize,
}

/// Modal radial filters, tapering and spherical head filter for spherical
/// microphone arrays.
#[derive(Debug)]
pub struct SphericalCompensation {
    head_radius: f32,
    /// Radial filters of size `[orders][bins]` for the last configuration
    radial: Option<(RadialKey, Box<[Complex<f32>]>)>,
}

impl Default for SphericalCompensation {
    fn default() -> Self {
        Self::new(HEAD_RADIUS)
    }
}

impl SphericalCompensation {
    pub fn new(head_radius: f32) -> Self {
        Self {
            head_radius,
            radial: None,
        }
    }

    fn radial_filters(&mut self, key: RadialKey) -> &[Complex<f32>] {
        let cached = matches!(&self.radial, Some((k, _)) if *k == key);

        if !cached {
            let bins = key.fft_len;
            let limit = 10f64.powf(key.amp_limit_db as f64 / 20.0);
            let mut filters = vec![Complex::zero(); (key.max_order + 1) * bins];

            for n in 0..=key.max_order {
                let order = &mut filters[n * bins..(n + 1) * bins];

                for (bin, f) in positive_frequencies(bins, key.sample_rate).enumerate() {
                    let b = radial_dependency(n, kr(f, key.array.radius), key.array.kind) * 4.0 * PI;
                    let mrf = soft_limit(b.inv(), limit);
                    order[bin] = Complex::new(mrf.re as f32, mrf.im as f32);
                }

                mirror_negative_frequencies(order);
            }

            debug!(
                "Generated radial filters up to order {} for {:?}",
                key.max_order, key.array
            );
            self.radial = Some((key, filters.into_boxed_slice()));
        }

        match &self.radial {
            Some((_, filters)) => &filters[..],
            None => &[],
        }
    }

    /// Gain per bin of the spherical head filter for an order `order` rendering
    fn spherical_head_filter(&self, order: usize, fft_len: usize, sample_rate: f32) -> Vec<Complex<f32>> {
        let mut shf = vec![Complex::zero(); fft_len];

        for (bin, f) in positive_frequencies(fft_len, sample_rate).enumerate() {
            let kr = kr(f, self.head_radius);
            let energy = (0..=order)
                .map(|n| (2 * n + 1) as f64 * radial_dependency(n, kr, ArrayKind::Rigid).norm_sqr())
                .sum::<f64>();

            shf[bin] = Complex::new((1.0 / energy.sqrt()) as f32, 0.0);
        }

        mirror_negative_frequencies(&mut shf);
        shf
    }
}

fn tapering_weight(n: usize, order: usize) -> f32 {
    0.5 * (1.0 + (std::f32::consts::PI * n as f32 / (order + 1) as f32).cos())
}

impl Compensation for SphericalCompensation {
    fn reset_config(&mut self) {
        self.radial = None;
    }

    fn generate(&mut self, request: &CompensationRequest) -> Result<CompensationSpectrum, Error> {
        let max_order = request.filter_set.sh_max_order();
        let sample_rate = request.filter_set.sample_rate();
        let bins = request.fft_len;

        if request.sh_order > max_order {
            return Err(Error::InvalidCompensation(format!(
                "order {} exceeds filter order {}",
                request.sh_order, max_order
            )));
        }
        if !request.amp_limit_db.is_finite() {
            return Err(Error::InvalidCompensation(format!(
                "amplitude limit of {} dB",
                request.amp_limit_db
            )));
        }

        let orders = sh_n(max_order);
        let mut spectrum = CompensationSpectrum::unity(sh_count(max_order), bins);

        for c in 0..spectrum.coefficient_count() {
            if orders[c] > request.sh_order {
                spectrum.coefficient_mut(c).fill(Complex::zero());
            }
        }

        for kind in request.types {
            match kind {
                CompensationType::ModalRadialFilter => {
                    let array = request.array.ok_or_else(|| {
                        Error::InvalidCompensation("radial filters need an array configuration".into())
                    })?;
                    let radial = self.radial_filters(RadialKey {
                        array: *array,
                        amp_limit_db: request.amp_limit_db,
                        fft_len: bins,
                        sample_rate,
                        max_order,
                    });

                    for (c, n) in orders.iter().enumerate() {
                        let filter = &radial[n * bins..(n + 1) * bins];
                        for (bin, gain) in Iterator::zip(spectrum.coefficient_mut(c).iter_mut(), filter) {
                            *bin *= gain;
                        }
                    }
                }
                CompensationType::Tapering => {
                    for (c, n) in orders.iter().enumerate() {
                        if *n <= request.sh_order {
                            let weight = tapering_weight(*n, request.sh_order);
                            spectrum.coefficient_mut(c).iter_mut().for_each(|bin| *bin *= weight);
                        }
                    }
                }
                CompensationType::SphericalHeadFilter => {
                    let shf = self.spherical_head_filter(request.sh_order, bins, sample_rate);

                    for c in 0..spectrum.coefficient_count() {
                        for (bin, gain) in Iterator::zip(spectrum.coefficient_mut(c).iter_mut(), &shf) {
                            *bin *= gain;
                        }
                    }
                }
            }
        }

        for n in 0..=request.sh_order {
            let first = n * n;
            let rms = (spectrum.coefficient(first).iter().map(|v| v.norm_sqr()).sum::<f32>()
                / bins as f32)
                .sqrt();
            debug!("Compensation of order {}: {:.2} dB RMS", n, 20.0 * rms.log10());
        }

        Ok(spectrum)
    }
}
