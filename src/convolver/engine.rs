//! Buffers shared by the block based convolvers.
//!
//! For more details about the algorithm check Chapter 5 of Partitioned
//! convolution algorithms for real-time auralization: [`Book`]
//!
//! [`Book`]: https://publications.rwth-aachen.de/record/466561/files/466561.pdf

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

use crate::fft::Transform;
use crate::Error;

/// Input channel feeding output `output` when filters are bypassed: every
/// output for a single input, otherwise matching channel indices.
pub(crate) fn passthrough_input(output: usize, inputs: usize) -> Option<usize> {
    match inputs {
        1 => Some(0),
        _ if output < inputs => Some(output),
        _ => None,
    }
}

/// `acc += x * h * scale`
pub(crate) fn multiply_accumulate(
    acc: &mut [Complex<f32>],
    x: &[Complex<f32>],
    h: &[Complex<f32>],
    scale: f32,
) {
    for (acc, (x, h)) in Iterator::zip(acc.iter_mut(), Iterator::zip(x.iter(), h.iter())) {
        *acc += x * h * scale;
    }
}

/// Overlap-save input stage: the last two blocks of every channel in time
/// domain and their spectra.
pub(crate) struct Engine<T> {
    block_len: usize,
    channels: usize,
    transform: T,
    /// `[channels][2 * block_len]`
    input_td: Box<[f32]>,
    /// `[channels][bins]`
    input_fd: Box<[Complex<f32>]>,
    /// transform input scratch
    scratch_td: Box<[f32]>,
    /// transform output scratch
    scratch_fd: Box<[Complex<f32>]>,
}

impl<T: Transform> Engine<T> {
    pub fn new(transform: T, block_len: usize, channels: usize) -> Result<Self, Error> {
        if transform.len() != block_len * 2 {
            return Err(Error::InvalidInputLen(transform.len(), block_len * 2));
        }

        let bins = transform.bins();

        Ok(Self {
            block_len,
            channels,
            transform,
            input_td: vec![0.0; channels * block_len * 2].into_boxed_slice(),
            input_fd: vec![Complex::zero(); channels * bins].into_boxed_slice(),
            scratch_td: vec![0.0; block_len * 2].into_boxed_slice(),
            scratch_fd: vec![Complex::zero(); bins].into_boxed_slice(),
        })
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bins(&self) -> usize {
        self.transform.bins()
    }

    /// Reallocate the input stage for a different channel count.
    pub fn resize_input(&mut self, channels: usize) {
        self.channels = channels;
        self.input_td = vec![0.0; channels * self.block_len * 2].into_boxed_slice();
        self.input_fd = vec![Complex::zero(); channels * self.bins()].into_boxed_slice();
    }

    /// Spectra of the current input of size `[channels][bins]`
    pub fn input_fd(&self) -> &[Complex<f32>] {
        &self.input_fd
    }

    pub fn input_channel_fd(&self, channel: usize) -> &[Complex<f32>] {
        let bins = self.bins();
        &self.input_fd[channel * bins..(channel + 1) * bins]
    }

    /// Push a new planar block into the input stage and transform every
    /// channel.
    pub fn shift_and_convert_input(&mut self, input: &[f32]) -> Result<(), Error> {
        let block_len = self.block_len;
        let bins = self.bins();

        if input.len() != self.channels * block_len {
            return Err(Error::InvalidInputLen(input.len(), self.channels * block_len));
        }

        for (ch, x) in input.chunks_exact(block_len).enumerate() {
            let ring = &mut self.input_td[ch * block_len * 2..(ch + 1) * block_len * 2];

            // shift right part of the buffer to the left
            ring.copy_within(block_len.., 0);
            // store new data in right part
            ring[block_len..].copy_from_slice(x);

            self.scratch_td.copy_from_slice(ring);
            self.transform.forward(
                &mut self.scratch_td,
                &mut self.input_fd[ch * bins..(ch + 1) * bins],
            )?;
        }

        Ok(())
    }

    /// Transform `spectrum` back and write the valid right half to `output`.
    pub fn convert_result(&mut self, spectrum: &[Complex<f32>], output: &mut [f32]) -> Result<(), Error> {
        if spectrum.len() != self.scratch_fd.len() {
            return Err(Error::InvalidInputLen(spectrum.len(), self.scratch_fd.len()));
        }
        if output.len() != self.block_len {
            return Err(Error::InvalidInputLen(output.len(), self.block_len));
        }

        self.scratch_fd.copy_from_slice(spectrum);
        self.transform
            .inverse(&mut self.scratch_fd, &mut self.scratch_td)?;

        output.copy_from_slice(&self.scratch_td[self.block_len..]);

        Ok(())
    }

    pub fn clear(&mut self) {
        self.input_td.fill(0.0);
        self.input_fd.fill(Complex::zero());
    }
}

/// Frequency domain accumulator of size `[blocks][channels][bins]`.
///
/// Block 0 is the one due for output. Advancing releases it and appends a
/// cleared block at the end, without moving any data.
pub(crate) struct SpectrumRing {
    blocks: usize,
    channels: usize,
    bins: usize,
    head: usize,
    data: Box<[Complex<f32>]>,
}

impl SpectrumRing {
    pub fn new(blocks: usize, channels: usize, bins: usize) -> Self {
        Self {
            blocks,
            channels,
            bins,
            head: 0,
            data: vec![Complex::zero(); blocks * channels * bins].into_boxed_slice(),
        }
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    fn offset(&self, block: usize, channel: usize) -> usize {
        let slot = (self.head + block) % self.blocks;
        (slot * self.channels + channel) * self.bins
    }

    pub fn channel(&self, block: usize, channel: usize) -> &[Complex<f32>] {
        let off = self.offset(block, channel);
        &self.data[off..off + self.bins]
    }

    pub fn channel_mut(&mut self, block: usize, channel: usize) -> &mut [Complex<f32>] {
        let off = self.offset(block, channel);
        &mut self.data[off..off + self.bins]
    }

    pub fn advance(&mut self) {
        let len = self.channels * self.bins;
        let off = self.head * len;

        self.data[off..off + len].fill(Complex::zero());
        self.head = (self.head + 1) % self.blocks;
    }

    pub fn clear(&mut self) {
        self.data.fill(Complex::zero());
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::RealTransform;

    #[test]
    fn ring_rotates_without_moving_data() {
        let mut ring = SpectrumRing::new(3, 1, 2);

        for b in 0..3 {
            ring.channel_mut(b, 0).fill(Complex::new(b as f32 + 1.0, 0.0));
        }

        ring.advance();
        assert_eq!(ring.channel(0, 0)[0].re, 2.0);
        assert_eq!(ring.channel(1, 0)[0].re, 3.0);
        assert_eq!(ring.channel(2, 0)[0].re, 0.0);

        ring.advance();
        ring.advance();
        assert!(ring.channel(0, 0).iter().all(|v| v.is_zero()));
    }

    #[test]
    fn passthrough_mapping() {
        assert_eq!(passthrough_input(1, 1), Some(0));
        assert_eq!(passthrough_input(1, 2), Some(1));
        assert_eq!(passthrough_input(2, 2), None);
    }

    #[test]
    fn engine_checks_input_len() {
        let mut engine = Engine::new(RealTransform::new(8), 4, 2).unwrap();
        assert!(matches!(
            engine.shift_and_convert_input(&[0.0; 4]),
            Err(Error::InvalidInputLen(4, 8))
        ));

        assert!(Engine::new(RealTransform::new(6), 4, 1).is_err());
    }

    #[test]
    fn engine_checks_result_len() {
        let mut engine = Engine::new(RealTransform::new(8), 4, 1).unwrap();
        let spectrum = vec![Complex::zero(); engine.bins()];

        assert!(matches!(
            engine.convert_result(&spectrum[1..], &mut [0.0; 4]),
            Err(Error::InvalidInputLen(4, 5))
        ));
        assert!(matches!(
            engine.convert_result(&spectrum, &mut [0.0; 3]),
            Err(Error::InvalidInputLen(3, 4))
        ));
        assert!(engine.convert_result(&spectrum, &mut [0.0; 4]).is_ok());
    }

    #[test]
    fn engine_reproduces_last_block() {
        let mut engine = Engine::new(RealTransform::new(8), 4, 1).unwrap();
        let mut output = [0.0; 4];

        for block in [[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]] {
            engine.shift_and_convert_input(&block).unwrap();
            let spectrum = engine.input_channel_fd(0).to_vec();
            engine.convert_result(&spectrum, &mut output).unwrap();

            for (a, b) in Iterator::zip(block.iter(), output.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }
}
