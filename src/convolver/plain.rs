//! Unpartitioned convolution, one spectral multiply per block.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

use super::engine::multiply_accumulate;
use super::{toggle, Convolve};
use crate::fft::{RealTransform, Transform};
use crate::filter::StaticFilters;
use crate::state::RunState;
use crate::Error;

/// Fast convolution by a single spectral multiplication per block.
///
/// There is no input or output buffering, so the result is the circular
/// convolution of the block with the filter. The block length equals the
/// filter length.
pub struct PlainConvolver<F> {
    filter: F,
    passthrough: bool,
    run_state: Arc<RunState>,
    transform: RealTransform,
    /// `[inputs][bins]`
    input_fd: Box<[Complex<f32>]>,
    scratch_td: Box<[f32]>,
    acc: Box<[Complex<f32>]>,
    /// `[outputs][block_len]`
    output: Box<[f32]>,
}

impl<F: StaticFilters> PlainConvolver<F> {
    pub fn new(mut filter: F, run_state: Arc<RunState>) -> Result<Self, Error> {
        filter.calculate_filter_blocks_fd(None)?;

        let block_len = filter.taps_len();
        let transform = RealTransform::new(block_len);
        let bins = transform.bins();

        Ok(Self {
            input_fd: vec![Complex::zero(); filter.input_channel_count() * bins].into_boxed_slice(),
            scratch_td: vec![0.0; block_len].into_boxed_slice(),
            acc: vec![Complex::zero(); bins].into_boxed_slice(),
            output: vec![0.0; filter.output_channel_count() * block_len].into_boxed_slice(),
            filter,
            passthrough: false,
            run_state,
            transform,
        })
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }
}

impl<F: StaticFilters> Convolve for PlainConvolver<F> {
    fn filter_block(&mut self, input: Option<&[f32]>) -> Result<Option<&[f32]>, Error> {
        let Some(input) = input else {
            if !self.run_state.is_running() {
                self.clear_buffers();
            }
            return Ok(None);
        };

        let block_len = self.transform.len();
        let bins = self.transform.bins();
        let inputs = self.filter.input_channel_count();

        if input.len() != inputs * block_len {
            return Err(Error::InvalidInputLen(input.len(), inputs * block_len));
        }

        for (i, x) in input.chunks_exact(block_len).enumerate() {
            self.scratch_td.copy_from_slice(x);
            self.transform
                .forward(&mut self.scratch_td, &mut self.input_fd[i * bins..(i + 1) * bins])?;
        }

        let filters = match self.passthrough {
            true => self.filter.dirac_blocks_fd()?,
            false => self.filter.filter_blocks_fd()?,
        };

        for (o, y) in self.output.chunks_exact_mut(block_len).enumerate() {
            self.acc.fill(Complex::zero());

            for i in 0..inputs {
                multiply_accumulate(
                    &mut self.acc,
                    &self.input_fd[i * bins..(i + 1) * bins],
                    filters.spectrum(0, i, o),
                    1.0,
                );
            }

            self.transform.inverse(&mut self.acc, y)?;
        }

        Ok(Some(&self.output[..]))
    }

    fn set_passthrough(&mut self, state: Option<bool>) -> bool {
        self.passthrough = toggle(self.passthrough, state);
        self.passthrough
    }

    fn input_channel_count(&self) -> usize {
        self.filter.input_channel_count()
    }

    fn output_channel_count(&self) -> usize {
        self.filter.output_channel_count()
    }

    fn block_len(&self) -> usize {
        self.transform.len()
    }

    fn clear_buffers(&mut self) {
        self.input_fd.fill(Complex::zero());
        self.output.fill(0.0);
    }
}
