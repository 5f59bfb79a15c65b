//! Forward and inverse DFT wrappers with pre-allocated scratch memory.
//!
//! Two flavours are provided. [`RealTransform`] produces one-sided spectra and
//! is used wherever signals and filters stay real. [`ComplexTransform`] keeps
//! the full two-sided spectrum, which is needed once spectra get multiplied by
//! phase terms that break conjugate symmetry (spherical harmonics rotation).

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

use crate::Error;

pub trait Transform: Send {
    /// Length of the time domain signal
    fn len(&self) -> usize;

    /// Number of spectral bins produced by [`Transform::forward`]
    fn bins(&self) -> usize;

    /// Transform `input` into frequency domain. `input` is used as scratch.
    fn forward(&mut self, input: &mut [f32], output: &mut [Complex<f32>]) -> Result<(), Error>;

    /// Transform `input` back into time domain and normalize. `input` is used
    /// as scratch.
    fn inverse(&mut self, input: &mut [Complex<f32>], output: &mut [f32]) -> Result<(), Error>;
}

pub struct RealTransform {
    len: usize,
    /// Real FFT module
    rfft: Arc<dyn RealToComplex<f32>>,
    /// Inverse FFT module
    ifft: Arc<dyn ComplexToReal<f32>>,
    /// RFFT scratch memory
    rfft_scratch: Vec<Complex<f32>>,
    /// IFFT scratch memory
    ifft_scratch: Vec<Complex<f32>>,
}

impl RealTransform {
    pub fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let rfft = planner.plan_fft_forward(len);
        let ifft = planner.plan_fft_inverse(len);

        let rfft_scratch = rfft.make_scratch_vec();
        let ifft_scratch = ifft.make_scratch_vec();

        Self {
            len,
            rfft,
            ifft,
            rfft_scratch,
            ifft_scratch,
        }
    }
}

impl Transform for RealTransform {
    fn len(&self) -> usize {
        self.len
    }

    fn bins(&self) -> usize {
        self.len / 2 + 1
    }

    fn forward(&mut self, input: &mut [f32], output: &mut [Complex<f32>]) -> Result<(), Error> {
        self.rfft
            .process_with_scratch(input, output, &mut self.rfft_scratch)?;
        Ok(())
    }

    fn inverse(&mut self, input: &mut [Complex<f32>], output: &mut [f32]) -> Result<(), Error> {
        // DC and Nyquist of a real signal have no imaginary part, drop rounding residue
        if let Some(first) = input.first_mut() {
            first.im = 0.0;
        }
        if self.len % 2 == 0 {
            if let Some(last) = input.last_mut() {
                last.im = 0.0;
            }
        }

        self.ifft
            .process_with_scratch(input, output, &mut self.ifft_scratch)?;

        let scale = 1.0 / self.len as f32;
        output.iter_mut().for_each(|sample| *sample *= scale);

        Ok(())
    }
}

pub struct ComplexTransform {
    len: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// in-place working buffer
    buffer: Box<[Complex<f32>]>,
    scratch: Vec<Complex<f32>>,
}

impl ComplexTransform {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(len);
        let ifft = planner.plan_fft_inverse(len);

        let scratch_len = usize::max(
            fft.get_inplace_scratch_len(),
            ifft.get_inplace_scratch_len(),
        );

        Self {
            len,
            fft,
            ifft,
            buffer: vec![Complex::zero(); len].into_boxed_slice(),
            scratch: vec![Complex::zero(); scratch_len],
        }
    }

    fn check_len(&self, time_len: usize, freq_len: usize) -> Result<(), Error> {
        if time_len != self.len {
            return Err(Error::InvalidInputLen(time_len, self.len));
        }
        if freq_len != self.len {
            return Err(Error::InvalidInputLen(freq_len, self.len));
        }
        Ok(())
    }
}

impl Transform for ComplexTransform {
    fn len(&self) -> usize {
        self.len
    }

    fn bins(&self) -> usize {
        self.len
    }

    fn forward(&mut self, input: &mut [f32], output: &mut [Complex<f32>]) -> Result<(), Error> {
        self.check_len(input.len(), output.len())?;

        for (bin, sample) in Iterator::zip(output.iter_mut(), input.iter()) {
            *bin = Complex::new(*sample, 0.0);
        }
        self.fft.process_with_scratch(output, &mut self.scratch);

        Ok(())
    }

    /// Only the real part of the normalized result is kept.
    fn inverse(&mut self, input: &mut [Complex<f32>], output: &mut [f32]) -> Result<(), Error> {
        self.check_len(output.len(), input.len())?;

        self.buffer.copy_from_slice(input);
        self.ifft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / self.len as f32;
        for (sample, bin) in Iterator::zip(output.iter_mut(), self.buffer.iter()) {
            *sample = bin.re * scale;
        }

        Ok(())
    }
}
