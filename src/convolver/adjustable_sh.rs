use std::sync::Arc;

use log::{debug, info, warn};
use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

use super::engine::{passthrough_input, Engine};
use super::{
    crossfade_windows, resolve_direction, toggle, Convolve, ConvolverBuilder, ShProcessing,
};
use crate::compensation::{Compensation, CompensationRequest, CompensationType};
use crate::fft::ComplexTransform;
use crate::filter::{FilterBlocks, ShFilters};
use crate::sh::{reverse_mn_ids, sh_count, ArrayConfiguration, ShConfiguration};
use crate::state::RunState;
use crate::tracker::SharedOrientation;
use crate::Error;

/// Transformation of the array input into SH coefficients and their
/// combination with the SH domain filters.
///
/// Encoders are cloned while preparing, so a failed preparation leaves the
/// prepared one in place.
pub trait ShEncoder: Send + Clone {
    /// Check `sh_config` against the filter order and get ready for blocks of
    /// `block_len` samples.
    fn prepare(
        &mut self,
        sh_config: &ShConfiguration,
        filter_order: usize,
        block_len: usize,
    ) -> Result<(), Error>;

    /// Encode input spectra `[channels][bins]` into `nm` of size
    /// `[coefficients][bins]`.
    fn encode(&self, input: &[Complex<f32>], nm: &mut [Complex<f32>]);

    /// Multiply (reindexed) coefficients `[coefficients][bins]` with the first
    /// block of `filters` into `filtered` of size `[coefficients][outputs][bins]`.
    fn apply_filters(
        &self,
        encoded: &[Complex<f32>],
        filters: &FilterBlocks,
        filtered: &mut [Complex<f32>],
    );

    /// Whether compensation spectra get multiplied into the filters
    fn applies_compensation(&self) -> bool {
        true
    }
}

/// Discrete spherical Fourier transform with the weighted bases of the array
/// configuration.
#[derive(Clone, Debug, Default)]
pub struct AnalyticEncoder {
    /// `[coefficients][channels]`
    bases: Box<[Complex<f32>]>,
    channels: usize,
}

impl ShEncoder for AnalyticEncoder {
    fn prepare(
        &mut self,
        sh_config: &ShConfiguration,
        _filter_order: usize,
        _block_len: usize,
    ) -> Result<(), Error> {
        self.bases = sh_config.sh_bases_weighted().into();
        self.channels = sh_config.channel_count();
        Ok(())
    }

    fn encode(&self, input: &[Complex<f32>], nm: &mut [Complex<f32>]) {
        let bins = input.len() / self.channels;

        for (c, nm) in nm.chunks_exact_mut(bins).enumerate() {
            nm.fill(Complex::zero());

            for (ch, x) in input.chunks_exact(bins).enumerate() {
                let weight = self.bases[c * self.channels + ch];

                for (y, x) in Iterator::zip(nm.iter_mut(), x.iter()) {
                    *y += weight * x;
                }
            }
        }
    }

    fn apply_filters(
        &self,
        encoded: &[Complex<f32>],
        filters: &FilterBlocks,
        filtered: &mut [Complex<f32>],
    ) {
        let bins = filters.bins();
        let outputs = filters.outputs();

        for (c, x) in encoded.chunks_exact(bins).enumerate() {
            for o in 0..outputs {
                let off = (c * outputs + o) * bins;

                for (y, (x, h)) in Iterator::zip(
                    filtered[off..off + bins].iter_mut(),
                    Iterator::zip(x.iter(), filters.spectrum(0, c, o).iter()),
                ) {
                    *y = x * h;
                }
            }
        }
    }
}

/// Everything needed to regenerate the compensation when the order changes
#[derive(Clone, Debug)]
struct CompensationSettings {
    types: Vec<CompensationType>,
    array: Option<ArrayConfiguration>,
    mrf_limit_db: f32,
}

struct ShState {
    sh_m: Box<[f32]>,
    rev_ids: Box<[usize]>,
    cur_order: usize,
    settings: CompensationSettings,
    /// `[coefficients][bins]`
    nm: Box<[Complex<f32>]>,
    /// `nm` in reversed order
    encoded: Box<[Complex<f32>]>,
    /// `[coefficients][outputs][bins]`
    filtered: Box<[Complex<f32>]>,
    /// rotation of every coefficient
    azim: Box<[Complex<f32>]>,
    last_azim: Box<[Complex<f32>]>,
    last_azim_len: usize,
}

/// Per order RMS level in dB of the first filter block
fn order_levels(blocks: &FilterBlocks, order: usize) -> Vec<f32> {
    (0..=order)
        .map(|n| {
            let mut energy = 0.0;
            let mut count = 0;

            for c in n * n..(n + 1) * (n + 1) {
                for o in 0..blocks.outputs() {
                    energy += blocks.spectrum(0, c, o).iter().map(|v| v.norm_sqr()).sum::<f32>();
                    count += blocks.bins();
                }
            }

            10.0 * (energy / count.max(1) as f32).log10()
        })
        .collect()
}

/// Regenerate the SH domain filters and apply compensation for `order`.
///
/// The compensation is generated before the filters are touched, so a failure
/// leaves them as they were.
fn compensate<F: ShFilters, C: Compensation>(
    filter: &mut F,
    compensation: &mut C,
    settings: &CompensationSettings,
    apply: bool,
    order: usize,
    block_len: usize,
) -> Result<(), Error> {
    let fft_len = block_len * 2;
    let coeffs = sh_count(filter.sh_max_order());

    compensation.reset_config();

    let spectrum = match apply {
        true => {
            let spectrum = compensation.generate(&CompensationRequest {
                types: &settings.types,
                filter_set: &*filter,
                sh_order: order,
                array: settings.array.as_ref(),
                amp_limit_db: settings.mrf_limit_db,
                fft_len,
            })?;

            if spectrum.coefficient_count() != coeffs || spectrum.bins() != fft_len {
                return Err(Error::InvalidCompensation(format!(
                    "expected {} coefficients and {} bins, got {} and {}",
                    coeffs,
                    fft_len,
                    spectrum.coefficient_count(),
                    spectrum.bins()
                )));
            }

            Some(spectrum)
        }
        false => None,
    };

    filter.calculate_filter_blocks_nm(block_len)?;
    let blocks = filter.filter_blocks_nm_mut()?;

    if blocks.blocks() > 1 {
        warn!(
            "SH filters span {} blocks of {} samples, only the first one is rendered",
            blocks.blocks(),
            block_len
        );
    }

    if let Some(spectrum) = spectrum {
        let before = order_levels(blocks, order);
        spectrum.apply(blocks)?;
        let after = order_levels(blocks, order);

        for (n, (before, after)) in Iterator::zip(before.iter(), after.iter()).enumerate() {
            debug!("SH order {}: {:.1} dB -> {:.1} dB", n, before, after);
        }
    }

    Ok(())
}

/// `acc[o] = sum(filtered[c][o] * azim[c])` over the given coefficients
fn rotate_and_sum(filtered: &[Complex<f32>], azim: &[Complex<f32>], outputs: usize, acc: &mut [Complex<f32>]) {
    let bins = acc.len() / outputs;

    acc.fill(Complex::zero());

    for (c, a) in azim.iter().enumerate() {
        for (o, acc) in acc.chunks_exact_mut(bins).enumerate() {
            let off = (c * outputs + o) * bins;

            for (acc, x) in Iterator::zip(acc.iter_mut(), filtered[off..off + bins].iter()) {
                *acc += x * a;
            }
        }
    }
}

/// Binaural rendering of a spherical array signal in spherical harmonics
/// domain.
///
/// Head rotation is applied as a phase term per SH coefficient. The rendered
/// order can be lowered at runtime: the sound field is still decomposed at the
/// full order, only fewer coefficients contribute to the ear signals.
pub struct AdjustableShConvolver<F, C, E = AnalyticEncoder> {
    filter: F,
    compensation: C,
    encoder: E,
    passthrough: bool,
    crossfade: bool,
    run_state: Arc<RunState>,
    tracker: Arc<SharedOrientation>,
    /// azimuth and elevation in degrees
    source: (f32, f32),
    engine: Engine<ComplexTransform>,
    /// `[outputs][bins]`
    acc: Box<[Complex<f32>]>,
    last_acc: Box<[Complex<f32>]>,
    sh: Option<ShState>,
    window_in: Box<[f32]>,
    window_out: Box<[f32]>,
    /// `[outputs][block_len]`
    output: Box<[f32]>,
    last_output: Box<[f32]>,
}

impl<F, C, E> AdjustableShConvolver<F, C, E>
where
    F: ShFilters,
    C: Compensation,
    E: ShEncoder,
{
    pub fn new(filter: F, compensation: C, encoder: E, builder: &ConvolverBuilder) -> Result<Self, Error> {
        let block_len = builder.checked_block_len()?;

        let source = match builder.source_positions() {
            [] => return Err(Error::NoSourcePositions),
            [source] => *source,
            sources => return Err(Error::UnsupportedSourceCount(sources.len())),
        };

        let outputs = filter.output_channel_count();
        let engine = Engine::new(ComplexTransform::new(block_len * 2), block_len, 1)?;
        let (window_in, window_out) = crossfade_windows(block_len)?;

        Ok(Self {
            passthrough: false,
            crossfade: true,
            run_state: builder.run_state(),
            tracker: builder.tracker(),
            source,
            acc: vec![Complex::zero(); outputs * engine.bins()].into_boxed_slice(),
            last_acc: vec![Complex::zero(); outputs * engine.bins()].into_boxed_slice(),
            sh: None,
            window_in,
            window_out,
            output: vec![0.0; outputs * block_len].into_boxed_slice(),
            last_output: vec![0.0; outputs * block_len].into_boxed_slice(),
            engine,
            filter,
            compensation,
            encoder,
        })
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn compensation(&self) -> &C {
        &self.compensation
    }

    fn convert(&mut self) -> Result<(), Error> {
        let block_len = self.engine.block_len();
        let bins = self.engine.bins();

        for (o, y) in self.output.chunks_exact_mut(block_len).enumerate() {
            self.engine
                .convert_result(&self.acc[o * bins..(o + 1) * bins], y)?;
        }

        Ok(())
    }

    fn passthrough_block(&mut self) -> Result<(), Error> {
        let bins = self.engine.bins();
        let channels = self.engine.channels();

        for (o, acc) in self.acc.chunks_exact_mut(bins).enumerate() {
            match passthrough_input(o, channels) {
                Some(i) => acc.copy_from_slice(self.engine.input_channel_fd(i)),
                None => acc.fill(Complex::zero()),
            }
        }

        self.convert()
    }
}

impl<F, C, E> Convolve for AdjustableShConvolver<F, C, E>
where
    F: ShFilters,
    C: Compensation,
    E: ShEncoder,
{
    fn filter_block(&mut self, input: Option<&[f32]>) -> Result<Option<&[f32]>, Error> {
        let Some(input) = input else {
            if !self.run_state.is_running() {
                self.clear_buffers();
            }
            return Ok(None);
        };

        if self.passthrough {
            self.engine.shift_and_convert_input(input)?;
            self.passthrough_block()?;
            return Ok(Some(&self.output[..]));
        }

        let sh = self.sh.as_mut().ok_or(Error::ShNotPrepared)?;

        self.engine.shift_and_convert_input(input)?;
        self.encoder.encode(self.engine.input_fd(), &mut sh.nm);

        let bins = self.engine.bins();
        for (c, rev) in sh.rev_ids.iter().enumerate() {
            sh.encoded[c * bins..(c + 1) * bins].copy_from_slice(&sh.nm[rev * bins..(rev + 1) * bins]);
        }

        let filters = self.filter.filter_blocks_nm()?;
        self.encoder.apply_filters(&sh.encoded, filters, &mut sh.filtered);

        // elevation is not rendered
        let orientation = self.tracker.load();
        let (azimuth, _) = resolve_direction(
            orientation.azimuth,
            orientation.elevation,
            self.source,
            self.filter.is_head_related(),
        );
        let azimuth = azimuth.to_radians();

        for (a, m) in Iterator::zip(sh.azim.iter_mut(), sh.sh_m.iter()) {
            *a = Complex::from_polar(1.0, -m * azimuth);
        }

        let count = sh_count(sh.cur_order);
        let outputs = self.filter.output_channel_count();

        rotate_and_sum(&sh.filtered, &sh.azim[..count], outputs, &mut self.acc);

        if self.crossfade {
            rotate_and_sum(&sh.filtered, &sh.last_azim[..sh.last_azim_len], outputs, &mut self.last_acc);

            sh.last_azim.copy_from_slice(&sh.azim);
            sh.last_azim_len = count;

            let block_len = self.engine.block_len();

            for (o, y) in self.last_output.chunks_exact_mut(block_len).enumerate() {
                self.engine
                    .convert_result(&self.last_acc[o * bins..(o + 1) * bins], y)?;
            }

            self.convert()?;

            for (y, last) in Iterator::zip(
                self.output.chunks_exact_mut(block_len),
                self.last_output.chunks_exact(block_len),
            ) {
                for (t, (y, last)) in Iterator::zip(y.iter_mut(), last.iter()).enumerate() {
                    *y = *y * self.window_in[t] + last * self.window_out[t];
                }
            }
        } else {
            self.convert()?;
        }

        Ok(Some(&self.output[..]))
    }

    fn set_passthrough(&mut self, state: Option<bool>) -> bool {
        let passthrough = toggle(self.passthrough, state);

        if passthrough != self.passthrough {
            self.acc.fill(Complex::zero());
            self.last_acc.fill(Complex::zero());
            self.passthrough = passthrough;
        }

        self.passthrough
    }

    fn set_crossfade(&mut self, state: Option<bool>) -> bool {
        self.crossfade = toggle(self.crossfade, state);

        if !self.crossfade {
            self.last_acc.fill(Complex::zero());
            if let Some(sh) = self.sh.as_mut() {
                sh.last_azim.fill(Complex::zero());
            }
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
        self.acc.fill(Complex::zero());
        self.last_acc.fill(Complex::zero());
        self.output.fill(0.0);
        self.last_output.fill(0.0);
    }

    fn sh_processing(&mut self) -> Option<&mut dyn ShProcessing> {
        Some(self)
    }
}

impl<F, C, E> ShProcessing for AdjustableShConvolver<F, C, E>
where
    F: ShFilters,
    C: Compensation,
    E: ShEncoder,
{
    fn prepare_sh_processing(
        &mut self,
        sh_config: &ShConfiguration,
        mrf_limit_db: f32,
        compensation_type: CompensationType,
    ) -> Result<(), Error> {
        let max_order = self.filter.sh_max_order();
        let coeffs = sh_count(max_order);
        let block_len = self.engine.block_len();
        let bins = self.engine.bins();
        let outputs = self.filter.output_channel_count();

        if sh_config.coefficient_count() != coeffs {
            return Err(Error::InvalidShConfiguration(format!(
                "{} coefficients for filters of order {}",
                sh_config.coefficient_count(),
                max_order
            )));
        }

        let mut encoder = self.encoder.clone();
        encoder.prepare(sh_config, max_order, block_len)?;

        let mut types = vec![compensation_type];
        if sh_config.array().is_some() && compensation_type != CompensationType::ModalRadialFilter {
            types.push(CompensationType::ModalRadialFilter);
        }

        let settings = CompensationSettings {
            types,
            array: sh_config.array().copied(),
            mrf_limit_db,
        };

        compensate(
            &mut self.filter,
            &mut self.compensation,
            &settings,
            encoder.applies_compensation(),
            max_order,
            block_len,
        )?;

        self.encoder = encoder;
        self.sh = Some(ShState {
            sh_m: sh_config.sh_m().into(),
            rev_ids: reverse_mn_ids(max_order).into_boxed_slice(),
            cur_order: max_order,
            settings,
            nm: vec![Complex::zero(); coeffs * bins].into_boxed_slice(),
            encoded: vec![Complex::zero(); coeffs * bins].into_boxed_slice(),
            filtered: vec![Complex::zero(); coeffs * outputs * bins].into_boxed_slice(),
            azim: vec![Complex::zero(); coeffs].into_boxed_slice(),
            last_azim: vec![Complex::zero(); coeffs].into_boxed_slice(),
            last_azim_len: coeffs,
        });

        self.engine.resize_input(sh_config.channel_count());
        self.acc.fill(Complex::zero());
        self.last_acc.fill(Complex::zero());

        info!(
            "Prepared SH processing of order {} for {} input channels",
            max_order,
            sh_config.channel_count()
        );

        Ok(())
    }

    fn update_sh_processing(&mut self, order: Option<i32>) -> Result<usize, Error> {
        let max_order = self.filter.sh_max_order();
        let block_len = self.engine.block_len();
        let apply = self.encoder.applies_compensation();

        let sh = self.sh.as_mut().ok_or(Error::ShNotPrepared)?;
        let cur_order = sh.cur_order;

        let requested = match order {
            Some(order) if order < 0 || order as usize > max_order => {
                warn!(
                    "SH order {} out of bounds [0, {}], keeping order {}",
                    order, max_order, cur_order
                );
                return Ok(cur_order);
            }
            Some(order) => order as usize,
            None => max_order,
        };

        if requested == cur_order {
            return Ok(cur_order);
        }

        let _pause = self.run_state.pause();

        compensate(
            &mut self.filter,
            &mut self.compensation,
            &sh.settings,
            apply,
            requested,
            block_len,
        )?;

        sh.cur_order = requested;
        info!("SH order changed from {} to {}", cur_order, requested);

        Ok(requested)
    }

    fn sh_cur_order(&self) -> Option<usize> {
        self.sh.as_ref().map(|sh| sh.cur_order)
    }

    fn contributing_coefficient_count(&self) -> usize {
        self.sh.as_ref().map_or(0, |sh| sh_count(sh.cur_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::CompensationSpectrum;
    use crate::filter::{ImpulseResponses, ShFilterSet};
    use crate::sh::SamplingGrid;
    use assert_approx_eq::assert_approx_eq;

    const BLOCK_LEN: usize = 16;
    const ORDER: usize = 1;

    /// Unity compensation recording the requested orders
    #[derive(Default)]
    struct Recording {
        orders: Vec<usize>,
        resets: usize,
        fail_at: Option<usize>,
        /// number of spectra generated before failing
        budget: Option<usize>,
    }

    impl Compensation for Recording {
        fn reset_config(&mut self) {
            self.resets += 1;
        }

        fn generate(&mut self, request: &CompensationRequest) -> Result<CompensationSpectrum, Error> {
            if self.fail_at == Some(request.sh_order) || self.budget == Some(self.orders.len()) {
                return Err(Error::InvalidCompensation("test".into()));
            }

            self.orders.push(request.sh_order);

            Ok(CompensationSpectrum::unity(
                sh_count(request.filter_set.sh_max_order()),
                request.fft_len,
            ))
        }
    }

    /// Direction independent HRIRs: left is a unit impulse, right is half of
    /// it delayed by one sample.
    fn filter_set() -> ShFilterSet {
        let grid = SamplingGrid::gauss(ORDER);
        let mut irs = ImpulseResponses::new(grid.len(), 2, 8);

        for p in 0..grid.len() {
            irs.channel_mut(p, 0)[0] = 1.0;
            irs.channel_mut(p, 1)[1] = 0.5;
        }

        ShFilterSet::new(48000.0, &grid, irs, ORDER).unwrap()
    }

    fn array_config() -> ShConfiguration {
        ShConfiguration::new(ORDER, &SamplingGrid::gauss(ORDER), None).unwrap()
    }

    fn convolver(compensation: Recording, crossfade: bool) -> AdjustableShConvolver<ShFilterSet, Recording> {
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .with_crossfade(crossfade)
            .build_adjustable_sh(filter_set(), compensation)
            .unwrap();

        convolver
            .prepare_sh_processing(&array_config(), 18.0, CompensationType::Tapering)
            .unwrap();

        convolver
    }

    /// Same signal on every array channel
    fn diffuse_block(k: usize, channels: usize) -> Vec<f32> {
        let block = (0..BLOCK_LEN)
            .map(|v| (((v + k * BLOCK_LEN) * 5 % 17) as f32 - 8.0) / 8.0)
            .collect::<Vec<_>>();
        block.repeat(channels)
    }

    #[test]
    fn more_than_one_source_is_unsupported() {
        let result = ConvolverBuilder::new(BLOCK_LEN)
            .with_source_positions(vec![(0.0, 0.0), (90.0, 0.0)])
            .build_adjustable_sh(filter_set(), Recording::default());

        assert!(matches!(result, Err(Error::UnsupportedSourceCount(2))));
    }

    #[test]
    fn blocks_need_preparation() {
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .build_adjustable_sh(filter_set(), Recording::default())
            .unwrap();

        assert_eq!(convolver.sh_cur_order(), None);
        assert_eq!(convolver.contributing_coefficient_count(), 0);
        assert!(matches!(
            convolver.filter_block(Some(&[0.0; BLOCK_LEN])),
            Err(Error::ShNotPrepared)
        ));
        assert!(matches!(
            convolver.update_sh_processing(Some(0)),
            Err(Error::ShNotPrepared)
        ));
    }

    #[test]
    fn configuration_must_match_filter_order() {
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .build_adjustable_sh(filter_set(), Recording::default())
            .unwrap();

        let config = ShConfiguration::new(2, &SamplingGrid::gauss(2), None).unwrap();

        assert!(matches!(
            convolver.prepare_sh_processing(&config, 18.0, CompensationType::Tapering),
            Err(Error::InvalidShConfiguration(_))
        ));
    }

    #[test]
    fn diffuse_field_renders_omnidirectional_filter() {
        let mut convolver = convolver(Recording::default(), false);
        let channels = convolver.input_channel_count();
        assert_eq!(channels, 8);

        let scale = 4.0 * std::f32::consts::PI;
        let mut previous_last = 0.0;

        for k in 0..4 {
            let input = diffuse_block(k, channels);
            let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

            for t in 0..BLOCK_LEN {
                assert_approx_eq!(output[t], scale * input[t], 1e-3);

                let delayed = if t == 0 { previous_last } else { input[t - 1] };
                assert_approx_eq!(output[BLOCK_LEN + t], scale * 0.5 * delayed, 1e-3);
            }

            previous_last = input[BLOCK_LEN - 1];
        }
    }

    #[test]
    fn passthrough_is_identity() {
        let mut convolver = convolver(Recording::default(), true);
        assert!(convolver.set_passthrough(Some(true)));

        let channels = convolver.input_channel_count();
        let input = (0..channels * BLOCK_LEN)
            .map(|v| (v as f32 * 0.21).sin())
            .collect::<Vec<_>>();

        let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

        for (a, b) in Iterator::zip(input[..2 * BLOCK_LEN].iter(), output.iter()) {
            assert_approx_eq!(a, b, 1e-5);
        }
    }

    #[test]
    fn order_changes_are_validated() {
        let mut convolver = convolver(Recording::default(), true);
        assert_eq!(convolver.sh_cur_order(), Some(1));
        assert_eq!(convolver.contributing_coefficient_count(), 4);

        assert_eq!(convolver.update_sh_processing(Some(0)).unwrap(), 0);
        assert_eq!(convolver.contributing_coefficient_count(), 1);

        // out of range requests are ignored
        assert_eq!(convolver.update_sh_processing(Some(2)).unwrap(), 0);
        assert_eq!(convolver.update_sh_processing(Some(-1)).unwrap(), 0);
        assert_eq!(convolver.contributing_coefficient_count(), 1);

        // same order does not recompute anything
        assert_eq!(convolver.update_sh_processing(Some(0)).unwrap(), 0);

        assert_eq!(convolver.update_sh_processing(None).unwrap(), 1);
        assert_eq!(convolver.contributing_coefficient_count(), 4);

        assert_eq!(convolver.compensation().orders, vec![1, 0, 1]);
        assert_eq!(convolver.compensation().resets, 3);
        assert!(convolver.run_state.is_running());
    }

    #[test]
    fn failed_order_change_keeps_last_state() {
        let compensation = Recording {
            fail_at: Some(0),
            ..Recording::default()
        };
        let mut convolver = convolver(compensation, false);

        let channels = convolver.input_channel_count();
        let input = diffuse_block(0, channels);
        let expected = convolver.filter_block(Some(&input)).unwrap().unwrap().to_vec();

        assert!(matches!(
            convolver.update_sh_processing(Some(0)),
            Err(Error::InvalidCompensation(_))
        ));
        assert_eq!(convolver.sh_cur_order(), Some(1));
        assert!(convolver.run_state.is_running());

        convolver.clear_buffers();
        let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

        for (a, b) in Iterator::zip(expected.iter(), output.iter()) {
            assert_approx_eq!(a, b, 1e-5);
        }
    }

    #[test]
    fn failed_preparation_keeps_last_state() {
        let compensation = Recording {
            budget: Some(1),
            ..Recording::default()
        };
        let mut convolver = convolver(compensation, false);

        let input = diffuse_block(0, 8);
        let expected = convolver.filter_block(Some(&input)).unwrap().unwrap().to_vec();

        let bases = vec![Complex::zero(); sh_count(ORDER) * 16];
        let config = ShConfiguration::from_bases(ORDER, bases.into_boxed_slice(), None).unwrap();

        assert!(matches!(
            convolver.prepare_sh_processing(&config, 18.0, CompensationType::Tapering),
            Err(Error::InvalidCompensation(_))
        ));
        assert_eq!(convolver.input_channel_count(), 8);
        assert_eq!(convolver.sh_cur_order(), Some(ORDER));

        convolver.clear_buffers();
        let output = convolver.filter_block(Some(&input)).unwrap().unwrap();

        for (a, b) in Iterator::zip(expected.iter(), output.iter()) {
            assert_approx_eq!(a, b, 1e-5);
        }
    }

    #[test]
    fn dipole_field_needs_first_order() {
        let grid = SamplingGrid::gauss(ORDER);
        let mut irs = ImpulseResponses::new(grid.len(), 2, 8);

        for (p, colatitude) in grid.colatitude.iter().enumerate() {
            irs.channel_mut(p, 0)[0] = colatitude.cos();
        }

        let filter = ShFilterSet::new(48000.0, &grid, irs, ORDER).unwrap();
        let mut convolver = ConvolverBuilder::new(BLOCK_LEN)
            .with_crossfade(false)
            .build_adjustable_sh(filter, Recording::default())
            .unwrap();
        convolver
            .prepare_sh_processing(&array_config(), 18.0, CompensationType::Tapering)
            .unwrap();

        let signal = diffuse_block(0, 1);
        let input = grid
            .colatitude
            .iter()
            .flat_map(|colatitude| signal.iter().map(move |x| x * colatitude.cos()))
            .collect::<Vec<_>>();

        // only Y_1^0 is excited, in the field and in the filters
        let scale = 4.0 * std::f32::consts::PI / 3.0;

        for order in [Some(1), Some(0), None] {
            convolver.update_sh_processing(order).unwrap();
            convolver.clear_buffers();

            let output = convolver.filter_block(Some(&input)).unwrap().unwrap();
            let gain = match order {
                Some(0) => 0.0,
                _ => scale,
            };

            for t in 0..BLOCK_LEN {
                assert_approx_eq!(output[t], gain * signal[t], 1e-3);
                assert_approx_eq!(output[BLOCK_LEN + t], 0.0, 1e-3);
            }
        }
    }

    #[test]
    fn crossfade_is_transparent_for_steady_rotation() {
        let mut faded = convolver(Recording::default(), true);
        let mut direct = convolver(Recording::default(), false);
        let channels = faded.input_channel_count();

        for k in 0..3 {
            let input = diffuse_block(k, channels);
            let a = faded.filter_block(Some(&input)).unwrap().unwrap().to_vec();
            let b = direct.filter_block(Some(&input)).unwrap().unwrap().to_vec();

            // the first block fades in from silence
            if k == 0 {
                assert_approx_eq!(a[0], 0.0, 1e-5);
                continue;
            }

            for (a, b) in Iterator::zip(a.iter(), b.iter()) {
                assert_approx_eq!(a, b, 1e-4);
            }
        }
    }
}
