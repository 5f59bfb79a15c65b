//! Head tracked convolution with filters selected by direction.
//!
//! Every source gets the filter nearest to its direction relative to the
//! listener. Filter switches are crossfaded over one block.

use std::sync::Arc;

use super::engine::{multiply_accumulate, passthrough_input, Engine, SpectrumRing};
use super::{crossfade_windows, resolve_direction, toggle, Convolve, ConvolverBuilder};
use crate::fft::RealTransform;
use crate::filter::DirectionalFilters;
use crate::state::RunState;
use crate::tracker::SharedOrientation;
use crate::Error;

/// Overlap-save convolution with filters selected per block by the direction
/// of every virtual source relative to the tracked head orientation.
///
/// Every source is fed by its own input channel and rendered to all outputs
/// of the filter set. Sources are summed with `1 / sources` to avoid clipping.
/// When the selected filter changes, the outputs of the previous and current
/// filter are crossfaded over one block.
pub struct AdjustableFdConvolver<F> {
    filter: F,
    passthrough: bool,
    crossfade: bool,
    run_state: Arc<RunState>,
    tracker: Arc<SharedOrientation>,
    /// azimuth and elevation in degrees
    sources: Box<[(f32, f32)]>,
    engine: Engine<RealTransform>,
    ring: SpectrumRing,
    /// accumulator driven by the previous filters
    last_ring: SpectrumRing,
    current_filters: Box<[usize]>,
    /// `None` renders silence, e.g. before the first block
    last_filters: Box<[Option<usize>]>,
    window_in: Box<[f32]>,
    window_out: Box<[f32]>,
    /// `[outputs][block_len]`
    output: Box<[f32]>,
    last_output: Box<[f32]>,
}

impl<F: DirectionalFilters> AdjustableFdConvolver<F> {
    pub fn new(mut filter: F, builder: &ConvolverBuilder) -> Result<Self, Error> {
        let block_len = builder.checked_block_len()?;
        let sources = builder.source_positions();

        if sources.is_empty() {
            return Err(Error::NoSourcePositions);
        }

        filter.calculate_filter_blocks_fd(block_len)?;
        let blocks = filter.filter_blocks_fd_at(0)?.blocks();
        let outputs = filter.output_channel_count();

        let engine = Engine::new(RealTransform::new(block_len * 2), block_len, sources.len())?;
        let (window_in, window_out) = crossfade_windows(block_len)?;

        Ok(Self {
            passthrough: false,
            crossfade: true,
            run_state: builder.run_state(),
            tracker: builder.tracker(),
            sources: sources.into(),
            ring: SpectrumRing::new(blocks, outputs, engine.bins()),
            last_ring: SpectrumRing::new(blocks, outputs, engine.bins()),
            current_filters: vec![0; sources.len()].into_boxed_slice(),
            last_filters: vec![None; sources.len()].into_boxed_slice(),
            window_in,
            window_out,
            output: vec![0.0; outputs * block_len].into_boxed_slice(),
            last_output: vec![0.0; outputs * block_len].into_boxed_slice(),
            engine,
            filter,
        })
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Filter index currently selected for every source
    pub fn current_filters(&self) -> &[usize] {
        &self.current_filters
    }

    fn select_filters(&mut self) {
        let orientation = self.tracker.load();
        let head_related = self.filter.is_head_related();

        for (selected, source) in Iterator::zip(self.current_filters.iter_mut(), self.sources.iter()) {
            let (azimuth, elevation) = resolve_direction(
                orientation.azimuth,
                orientation.elevation,
                *source,
                head_related,
            );
            *selected = self.filter.nearest_direction(azimuth, elevation);
        }
    }

    fn passthrough_block(&mut self) {
        let sources = self.engine.channels();

        for o in 0..self.filter.output_channel_count() {
            if let Some(s) = passthrough_input(o, sources) {
                self.ring
                    .channel_mut(0, o)
                    .copy_from_slice(self.engine.input_channel_fd(s));
            }
        }
    }
}

fn accumulate<F: DirectionalFilters>(
    filter: &F,
    engine: &Engine<RealTransform>,
    ring: &mut SpectrumRing,
    source: usize,
    index: usize,
    scale: f32,
) -> Result<(), Error> {
    let filters = filter.filter_blocks_fd_at(index)?;

    for b in 0..filters.blocks() {
        for o in 0..filters.outputs() {
            multiply_accumulate(
                ring.channel_mut(b, o),
                engine.input_channel_fd(source),
                filters.spectrum(b, 0, o),
                scale,
            );
        }
    }

    Ok(())
}

impl<F: DirectionalFilters> Convolve for AdjustableFdConvolver<F> {
    fn filter_block(&mut self, input: Option<&[f32]>) -> Result<Option<&[f32]>, Error> {
        let Some(input) = input else {
            if !self.run_state.is_running() {
                self.clear_buffers();
            }
            return Ok(None);
        };

        self.engine.shift_and_convert_input(input)?;

        let block_len = self.engine.block_len();

        if self.passthrough {
            self.passthrough_block();

            for (o, y) in self.output.chunks_exact_mut(block_len).enumerate() {
                self.engine.convert_result(self.ring.channel(0, o), y)?;
            }
            self.ring.advance();

            return Ok(Some(&self.output[..]));
        }

        self.select_filters();

        let scale = 1.0 / self.sources.len() as f32;

        for (s, index) in self.current_filters.iter().enumerate() {
            accumulate(&self.filter, &self.engine, &mut self.ring, s, *index, scale)?;
        }

        for (o, y) in self.output.chunks_exact_mut(block_len).enumerate() {
            self.engine.convert_result(self.ring.channel(0, o), y)?;
        }
        self.ring.advance();

        if self.crossfade {
            for (s, index) in self.last_filters.iter().enumerate() {
                if let Some(index) = index {
                    accumulate(&self.filter, &self.engine, &mut self.last_ring, s, *index, scale)?;
                }
            }

            for (o, y) in self.last_output.chunks_exact_mut(block_len).enumerate() {
                self.engine.convert_result(self.last_ring.channel(0, o), y)?;
            }
            self.last_ring.advance();

            for (y, last) in Iterator::zip(
                self.output.chunks_exact_mut(block_len),
                self.last_output.chunks_exact(block_len),
            ) {
                for (t, (y, last)) in Iterator::zip(y.iter_mut(), last.iter()).enumerate() {
                    *y = *y * self.window_in[t] + last * self.window_out[t];
                }
            }

            for (last, current) in Iterator::zip(self.last_filters.iter_mut(), self.current_filters.iter()) {
                *last = Some(*current);
            }
        }

        Ok(Some(&self.output[..]))
    }

    fn set_passthrough(&mut self, state: Option<bool>) -> bool {
        let passthrough = toggle(self.passthrough, state);

        if passthrough != self.passthrough {
            self.ring.clear();
            self.last_ring.clear();
            self.last_filters.fill(None);
            self.passthrough = passthrough;
        }

        self.passthrough
    }

    fn set_crossfade(&mut self, state: Option<bool>) -> bool {
        self.crossfade = toggle(self.crossfade, state);

        if !self.crossfade {
            self.last_ring.clear();
            self.last_filters.fill(None);
        }

        self.crossfade
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
        self.last_ring.clear();
        self.output.fill(0.0);
        self.last_output.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DirectionalFilterSet, ImpulseResponses};
    use crate::tracker::DataIndex;
    use assert_approx_eq::assert_approx_eq;

    const BLOCK_LEN: usize = 32;

    /// Four horizontal directions, the filter at `index` delays by `index`
    /// samples and scales left and right differently.
    fn filter_set(taps: usize) -> DirectionalFilterSet {
        let directions = vec![(0.0, 0.0), (90.0, 0.0), (180.0, 0.0), (270.0, 0.0)];
        let irs = (0..directions.len())
            .map(|index| {
                let mut ir = ImpulseResponses::new(1, 2, taps);
                ir.channel_mut(0, 0)[index] = 1.0;
                ir.channel_mut(0, 1)[index + taps / 2] = 0.5;
                ir
            })
            .collect();

        DirectionalFilterSet::new(48000.0, directions, irs, true).unwrap()
    }

    fn signal(blocks: usize, channels: usize) -> Vec<Vec<f32>> {
        (0..blocks)
            .map(|k| {
                (0..channels * BLOCK_LEN)
                    .map(|v| (((v + k * BLOCK_LEN) * 13 % 29) as f32 - 14.0) / 14.0)
                    .collect()
            })
            .collect()
    }

    fn render(convolver: &mut AdjustableFdConvolver<DirectionalFilterSet>, input: &[Vec<f32>]) -> Vec<Vec<f32>> {
        input
            .iter()
            .map(|block| convolver.filter_block(Some(block)).unwrap().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn no_sources_is_an_error() {
        let result = ConvolverBuilder::new(BLOCK_LEN)
            .with_source_positions(vec![])
            .build_adjustable_fd(filter_set(64));

        assert!(matches!(result, Err(Error::NoSourcePositions)));
    }

    #[test]
    fn passthrough_is_identity() {
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .with_passthrough(true)
            .build_adjustable_fd(filter_set(64))
            .unwrap();

        let input = signal(4, 1);

        for (x, y) in Iterator::zip(input.iter(), render(&mut convolver, &input).iter()) {
            for (a, b) in Iterator::zip(x.iter(), y[..BLOCK_LEN].iter()) {
                assert_approx_eq!(a, b, 1e-5);
            }
            for (a, b) in Iterator::zip(x.iter(), y[BLOCK_LEN..].iter()) {
                assert_approx_eq!(a, b, 1e-5);
            }
        }
    }

    #[test]
    fn filter_follows_tracker() {
        let tracker = Arc::new(SharedOrientation::default());
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .with_tracker(Arc::clone(&tracker))
            .with_source_positions(vec![(90.0, 0.0)])
            .with_crossfade(false)
            .build_adjustable_fd(filter_set(64))
            .unwrap();

        let input = signal(1, 1);

        convolver.filter_block(Some(&input[0])).unwrap();
        assert_eq!(convolver.current_filters(), &[1]);

        tracker.set(DataIndex::Azimuth, 95.0);
        convolver.filter_block(Some(&input[0])).unwrap();
        assert_eq!(convolver.current_filters(), &[2]);

        tracker.set(DataIndex::Azimuth, -100.0);
        convolver.filter_block(Some(&input[0])).unwrap();
        assert_eq!(convolver.current_filters(), &[0]);
    }

    #[test]
    fn two_sources_are_normalized() {
        let input = signal(6, 1);

        let mut single = ConvolverBuilder::new(BLOCK_LEN)
            .with_crossfade(false)
            .build_adjustable_fd(filter_set(64))
            .unwrap();
        let reference = render(&mut single, &input);

        let mut double = ConvolverBuilder::new(BLOCK_LEN)
            .with_source_positions(vec![(0.0, 0.0), (0.0, 0.0)])
            .with_crossfade(false)
            .build_adjustable_fd(filter_set(64))
            .unwrap();
        assert_eq!(double.input_channel_count(), 2);

        // signal on the first source only
        let one_active = input
            .iter()
            .map(|block| [block.clone(), vec![0.0; BLOCK_LEN]].concat())
            .collect::<Vec<_>>();

        for (y, r) in Iterator::zip(render(&mut double, &one_active).iter(), reference.iter()) {
            for (a, b) in Iterator::zip(y.iter(), r.iter()) {
                assert_approx_eq!(a, 0.5 * b, 1e-5);
            }
        }

        double.clear_buffers();

        // identical signals on both sources
        let both_active = input
            .iter()
            .map(|block| [block.clone(), block.clone()].concat())
            .collect::<Vec<_>>();

        for (y, r) in Iterator::zip(render(&mut double, &both_active).iter(), reference.iter()) {
            for (a, b) in Iterator::zip(y.iter(), r.iter()) {
                assert_approx_eq!(a, b, 1e-5);
            }
        }
    }

    #[test]
    fn crossfade_blends_filters() {
        let tracker = Arc::new(SharedOrientation::default());
        let input = vec![vec![1.0; BLOCK_LEN]; 4];

        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .with_tracker(Arc::clone(&tracker))
            .build_adjustable_fd(filter_set(8))
            .unwrap();

        // first block fades in from silence
        let first = convolver.filter_block(Some(&input[0])).unwrap().unwrap().to_vec();
        assert_approx_eq!(first[0], 0.0, 1e-5);
        assert_approx_eq!(first[BLOCK_LEN - 1], 1.0, 1e-5);

        // unchanged filter, crossfade is transparent
        let steady = convolver.filter_block(Some(&input[1])).unwrap().unwrap().to_vec();
        for y in &steady[..BLOCK_LEN] {
            assert_approx_eq!(y, 1.0, 1e-5);
        }

        // a delayed constant signal is still constant, the blend stays flat
        tracker.set(DataIndex::Azimuth, 180.0);
        let faded = convolver.filter_block(Some(&input[2])).unwrap().unwrap().to_vec();
        assert_eq!(convolver.current_filters(), &[2]);

        for y in &faded[..BLOCK_LEN] {
            assert_approx_eq!(y, 1.0, 1e-5);
        }

        assert!(!convolver.set_crossfade(Some(false)));
        assert!(convolver.last_filters.iter().all(Option::is_none));
    }
}
