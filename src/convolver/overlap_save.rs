//! Uniformly partitioned overlap-save convolution of fixed MIMO filters.

use std::sync::Arc;

use super::engine::{multiply_accumulate, passthrough_input, Engine, SpectrumRing};
use super::{toggle, Convolve, ConvolverBuilder};
use crate::fft::RealTransform;
use crate::filter::StaticFilters;
use crate::state::RunState;
use crate::Error;

/// Uniformly partitioned overlap-save convolution of a fixed MIMO filter.
///
/// Every output channel is the sum of all input channels convolved with the
/// corresponding filter. Filters longer than one block are split into
/// partitions, each landing in its own block of the accumulator ring.
pub struct OverlapSaveConvolver<F> {
    filter: F,
    passthrough: bool,
    run_state: Arc<RunState>,
    engine: Engine<RealTransform>,
    ring: SpectrumRing,
    /// `[outputs][block_len]`
    output: Box<[f32]>,
}

impl<F: StaticFilters> OverlapSaveConvolver<F> {
    pub fn new(mut filter: F, builder: &ConvolverBuilder) -> Result<Self, Error> {
        let block_len = builder.checked_block_len()?;

        filter.calculate_filter_blocks_fd(Some(block_len))?;
        let blocks = filter.filter_blocks_fd()?.blocks();

        let engine = Engine::new(
            RealTransform::new(block_len * 2),
            block_len,
            filter.input_channel_count(),
        )?;
        let ring = SpectrumRing::new(blocks, filter.output_channel_count(), engine.bins());

        Ok(Self {
            output: vec![0.0; filter.output_channel_count() * block_len].into_boxed_slice(),
            filter,
            passthrough: false,
            run_state: builder.run_state(),
            engine,
            ring,
        })
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Number of accumulator blocks, i.e. filter partitions
    pub fn blocks(&self) -> usize {
        self.ring.blocks()
    }
}

impl<F: StaticFilters> Convolve for OverlapSaveConvolver<F> {
    fn filter_block(&mut self, input: Option<&[f32]>) -> Result<Option<&[f32]>, Error> {
        let Some(input) = input else {
            if !self.run_state.is_running() {
                self.clear_buffers();
            }
            return Ok(None);
        };

        self.engine.shift_and_convert_input(input)?;

        let inputs = self.engine.channels();
        let outputs = self.filter.output_channel_count();

        if self.passthrough {
            // input spectrum replaces whatever is due now
            for o in 0..outputs {
                if let Some(i) = passthrough_input(o, inputs) {
                    self.ring
                        .channel_mut(0, o)
                        .copy_from_slice(self.engine.input_channel_fd(i));
                }
            }
        } else {
            let filters = self.filter.filter_blocks_fd()?;

            for b in 0..filters.blocks() {
                for i in 0..inputs {
                    for o in 0..outputs {
                        multiply_accumulate(
                            self.ring.channel_mut(b, o),
                            self.engine.input_channel_fd(i),
                            filters.spectrum(b, i, o),
                            1.0,
                        );
                    }
                }
            }
        }

        let block_len = self.engine.block_len();

        for (o, y) in self.output.chunks_exact_mut(block_len).enumerate() {
            self.engine.convert_result(self.ring.channel(0, o), y)?;
        }

        self.ring.advance();

        Ok(Some(&self.output[..]))
    }

    fn set_passthrough(&mut self, state: Option<bool>) -> bool {
        let passthrough = toggle(self.passthrough, state);

        if passthrough != self.passthrough {
            self.ring.clear();
            self.passthrough = passthrough;
        }

        self.passthrough
    }

    fn input_channel_count(&self) -> usize {
        self.engine.channels()
    }

    fn output_channel_count(&self) -> usize {
        self.filter.output_channel_count()
    }

    fn block_len(&self) -> usize {
        self.engine.block_len()
    }

    fn clear_buffers(&mut self) {
        self.engine.clear();
        self.ring.clear();
        self.output.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ImpulseResponses, MultiChannelFilterSet};
    use crate::state::RunState;
    use assert_approx_eq::assert_approx_eq;

    fn convolve_from_definition(x: &[f32], h: &[f32]) -> Vec<f32> {
        let mut x_neg_terms = vec![0.0; h.len() - 1];
        x_neg_terms.extend(x);

        (0..x.len())
            .map(|i| {
                Iterator::zip(x_neg_terms.iter().skip(i), h.iter().rev())
                    .map(|(x, h)| x * h)
                    .fold(0.0, |acc, x| acc + x)
            })
            .collect::<Vec<_>>()
    }

    #[must_use]
    struct ConvTest {
        filter_len: usize,
        input_len: usize,
        block_len: usize,
    }

    impl Default for ConvTest {
        fn default() -> Self {
            Self {
                filter_len: 256,
                input_len: 512,
                block_len: 64,
            }
        }
    }

    impl ConvTest {
        fn filter_len(mut self, filter_len: usize) -> Self {
            self.filter_len = filter_len;
            self
        }

        fn block_len(mut self, block_len: usize) -> Self {
            self.block_len = block_len;
            self
        }

        fn input_len(mut self, input_len: usize) -> Self {
            self.input_len = input_len;
            self
        }

        fn run(&self) {
            let input = (0..self.input_len)
                .map(|v| ((v * 7 % 23) as f32 - 11.0) / 11.0)
                .collect::<Vec<_>>();

            let h = (0..self.filter_len)
                .map(|v| 1.0 / (1.0 + v as f32))
                .collect::<Vec<_>>();

            let irs = ImpulseResponses::from_vec(1, 1, self.filter_len, h.clone()).unwrap();
            let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();

            let mut convolver = ConvolverBuilder::new(self.block_len)
                .build_overlap_save(filter)
                .expect("convolver");

            assert_eq!(
                convolver.blocks(),
                (self.filter_len + self.block_len - 1) / self.block_len
            );

            let mut output = Vec::with_capacity(self.input_len);

            for block in input.chunks_exact(self.block_len) {
                let y = convolver.filter_block(Some(block)).expect("block").expect("output");
                output.extend_from_slice(y);
            }

            let expected = convolve_from_definition(&input, &h);

            for (a, b) in std::iter::zip(expected.iter(), output.iter()) {
                assert_approx_eq!(a, b, 1e-3);
            }
        }
    }

    #[test]
    fn conv_default() {
        ConvTest::default().run();
    }

    #[test]
    fn conv_short_kernel() {
        ConvTest::default()
            .filter_len(16)
            .input_len(256)
            .block_len(32)
            .run();
    }

    #[test]
    fn conv_kernel_and_block_same_length() {
        ConvTest::default()
            .filter_len(16)
            .input_len(96)
            .block_len(16)
            .run();
    }

    #[test]
    fn conv_odd_kernel() {
        ConvTest::default()
            .filter_len(1025)
            .input_len(2048)
            .block_len(128)
            .run();
    }

    #[test]
    fn unit_impulse_over_two_partitions() {
        let mut irs = ImpulseResponses::new(1, 1, 256);
        irs.channel_mut(0, 0)[0] = 1.0;

        let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();
        let mut convolver = ConvolverBuilder::new(128).build_overlap_save(filter).unwrap();
        assert_eq!(convolver.blocks(), 2);

        let mut input = vec![0.0; 128];
        input[0] = 1.0;

        for k in 0..4 {
            let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

            for (t, y) in output.iter().enumerate() {
                let expected = if k == 0 && t == 0 { 1.0 } else { 0.0 };
                assert_approx_eq!(y, expected, 1e-5);
            }

            input[0] = 0.0;
        }
    }

    #[test]
    fn mimo_sums_inputs() {
        let mut irs = ImpulseResponses::new(2, 1, 8);
        irs.channel_mut(0, 0)[0] = 1.0;
        irs.channel_mut(1, 0)[1] = 2.0;

        let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();
        let mut convolver = ConvolverBuilder::new(4).build_overlap_save(filter).unwrap();

        let input = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

        for (a, b) in Iterator::zip([1.0, 0.0, 2.0, 0.0].iter(), output.iter()) {
            assert_approx_eq!(a, b, 1e-5);
        }
    }

    #[test]
    fn passthrough_is_identity() {
        let irs = ImpulseResponses::from_vec(2, 3, 40, vec![0.25; 2 * 3 * 40]).unwrap();
        let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();

        let mut convolver = ConvolverBuilder::new(16)
            .with_passthrough(true)
            .build_overlap_save(filter)
            .unwrap();

        for k in 0..5 {
            let input = (0..32)
                .map(|v| ((v + k * 32) as f32 * 0.1).cos())
                .collect::<Vec<_>>();
            let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

            for (a, b) in Iterator::zip(input.iter(), output[..32].iter()) {
                assert_approx_eq!(a, b, 1e-5);
            }
        }
    }

    #[test]
    fn buffers_are_cleared_while_paused() {
        // one block of delay
        let mut irs = ImpulseResponses::new(1, 1, 64);
        irs.channel_mut(0, 0)[16] = 1.0;

        let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();
        let run_state = Arc::new(RunState::new(true));

        let mut convolver = ConvolverBuilder::new(16)
            .with_run_state(Arc::clone(&run_state))
            .build_overlap_save(filter)
            .unwrap();

        convolver.filter_block(Some(&[1.0; 16])).unwrap();

        // running, the tail survives
        assert!(convolver.filter_block(None).unwrap().is_none());
        let output = convolver.filter_block(Some(&[0.0; 16])).unwrap().unwrap();
        assert_approx_eq!(output[0], 1.0, 1e-5);

        convolver.filter_block(Some(&[1.0; 16])).unwrap();

        run_state.set_running(false);
        assert!(convolver.filter_block(None).unwrap().is_none());
        run_state.set_running(true);

        let output = convolver.filter_block(Some(&[0.0; 16])).unwrap().unwrap();
        assert!(output.iter().all(|v| v.abs() < 1e-6));
    }
}
