//! Block synchronous convolvers.
//!
//! Every convolver is invoked once per audio block from the real-time thread
//! and processes planar blocks, i.e. `[channels][block_len]` samples laid out
//! one channel after the other. Output blocks are owned by the convolver and
//! stay valid until the next call.
//!
//! Reconfiguration (passthrough, crossfade, SH order) is expected to be
//! serialized with block processing by the caller. [`RunState`] is the gate
//! the caller observes while filters are recomputed.

use std::sync::Arc;

use crate::compensation::{Compensation, CompensationType, SphericalCompensation};
use crate::filter::{
    DirectionalFilterSet, DirectionalFilters, ImpulseResponses, MultiChannelFilterSet, ShFilterSet,
    ShFilters, StaticFilters,
};
use crate::sh::ShConfiguration;
use crate::state::RunState;
use crate::tracker::SharedOrientation;
use crate::Error;

mod adjustable_fd;
mod adjustable_sh;
mod engine;
mod measured_enc;
mod overlap_save;
mod plain;

pub use adjustable_fd::AdjustableFdConvolver;
pub use adjustable_sh::{AdjustableShConvolver, AnalyticEncoder, ShEncoder};
pub use measured_enc::{AdjustableShConvolverMeasuredEnc, MeasuredEncoder};
pub use overlap_save::OverlapSaveConvolver;
pub use plain::PlainConvolver;

pub const DEFAULT_BLOCK_LEN: usize = 512;

/// Default maximum amplification of modal radial filters
pub const DEFAULT_MRF_LIMIT_DB: f32 = 18.0;

pub trait Convolve {
    /// Filter one block of `input_channel_count() * block_len()` samples.
    ///
    /// Passing `None` produces no output and clears all buffers if the
    /// processing is currently paused.
    fn filter_block(&mut self, input: Option<&[f32]>) -> Result<Option<&[f32]>, Error>;

    /// Bypass the filters, `None` toggles. Returns the realized state.
    fn set_passthrough(&mut self, state: Option<bool>) -> bool;

    /// Crossfade between previous and current filters, `None` toggles.
    /// Returns the realized state.
    fn set_crossfade(&mut self, _state: Option<bool>) -> bool {
        false
    }

    fn input_channel_count(&self) -> usize;

    fn output_channel_count(&self) -> usize;

    fn block_len(&self) -> usize;

    fn clear_buffers(&mut self);

    fn sh_processing(&mut self) -> Option<&mut dyn ShProcessing> {
        None
    }
}

/// Spherical harmonics specific control of a convolver
pub trait ShProcessing {
    /// Prepare everything needed before blocks can be processed in SH domain
    /// and apply the compensation filters.
    fn prepare_sh_processing(
        &mut self,
        sh_config: &ShConfiguration,
        mrf_limit_db: f32,
        compensation_type: CompensationType,
    ) -> Result<(), Error>;

    /// Change the rendered SH order, `None` restores the maximum order.
    ///
    /// Requests out of range are ignored. Returns the realized order.
    fn update_sh_processing(&mut self, order: Option<i32>) -> Result<usize, Error>;

    fn sh_cur_order(&self) -> Option<usize>;

    /// Number of SH coefficients contributing to the output
    fn contributing_coefficient_count(&self) -> usize;
}

pub(crate) fn toggle(current: bool, state: Option<bool>) -> bool {
    state.unwrap_or(!current)
}

fn wrap_azimuth(azimuth: f32) -> f32 {
    let azimuth = azimuth.rem_euclid(360.0);
    // rounding of tiny negative values
    if azimuth >= 360.0 {
        0.0
    } else {
        azimuth
    }
}

fn wrap_elevation(elevation: f32) -> f32 {
    let elevation = (elevation + 180.0).rem_euclid(360.0) - 180.0;
    if elevation >= 180.0 {
        -180.0
    } else {
        elevation
    }
}

/// Direction of `source` (azimuth, elevation in degrees) for the given tracker
/// orientation.
///
/// Head related filters rotate with the head, room related ones compensate
/// the rotation. Azimuth ends up in `[0, 360)`, elevation in `[-180, 180)`.
pub fn resolve_direction(
    tracker_azimuth: f32,
    tracker_elevation: f32,
    source: (f32, f32),
    head_related: bool,
) -> (f32, f32) {
    let sign = if head_related { 1.0 } else { -1.0 };

    (
        wrap_azimuth(sign * tracker_azimuth + source.0),
        wrap_elevation(sign * tracker_elevation + source.1),
    )
}

/// Complementary `cos²` shaped windows `(window_in, window_out)` fading from
/// the previous to the current filter over one block.
pub fn crossfade_windows(block_len: usize) -> Result<(Box<[f32]>, Box<[f32]>), Error> {
    if block_len < 2 {
        return Err(Error::InvalidBlockLen(block_len));
    }

    let step = std::f32::consts::FRAC_PI_2 / (block_len - 1) as f32;

    let window_out = (0..block_len)
        .map(|t| (t as f32 * step).cos().powi(2))
        .collect::<Box<[f32]>>();
    let window_in = window_out.iter().rev().copied().collect::<Box<[f32]>>();

    Ok((window_in, window_out))
}

#[must_use]
#[derive(Clone, Debug)]
pub struct ConvolverBuilder {
    block_len: Option<usize>,
    source_positions: Vec<(f32, f32)>,
    tracker: Arc<SharedOrientation>,
    run_state: Arc<RunState>,
    crossfade: bool,
    passthrough: bool,
}

impl Default for ConvolverBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_LEN)
    }
}

impl ConvolverBuilder {
    pub fn new(block_len: usize) -> Self {
        Self {
            block_len: Some(block_len),
            source_positions: vec![(0.0, 0.0)],
            tracker: Arc::default(),
            run_state: Arc::default(),
            crossfade: true,
            passthrough: false,
        }
    }

    /// Builder for convolvers without any buffering, where the block length
    /// equals the filter length.
    pub fn unbuffered() -> Self {
        Self {
            block_len: None,
            ..Self::default()
        }
    }

    /// Set virtual source positions as azimuth (counterclockwise) and
    /// elevation in degrees. Default is a single frontal source.
    pub fn with_source_positions(mut self, source_positions: Vec<(f32, f32)>) -> Self {
        self.source_positions = source_positions;
        self
    }

    /// Set head orientation written by a tracker. Default is a fixed frontal
    /// orientation.
    pub fn with_tracker(mut self, tracker: Arc<SharedOrientation>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Set running state shared with the block submission loop.
    pub fn with_run_state(mut self, run_state: Arc<RunState>) -> Self {
        self.run_state = run_state;
        self
    }

    /// Set initial crossfade state of dynamic convolvers. Default is `true`.
    pub fn with_crossfade(mut self, crossfade: bool) -> Self {
        self.crossfade = crossfade;
        self
    }

    /// Set initial passthrough state. Default is `false`.
    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub(crate) fn checked_block_len(&self) -> Result<usize, Error> {
        match self.block_len {
            Some(block_len) if block_len >= 2 => Ok(block_len),
            Some(block_len) => Err(Error::InvalidBlockLen(block_len)),
            None => Err(Error::InvalidBlockLen(0)),
        }
    }

    pub(crate) fn source_positions(&self) -> &[(f32, f32)] {
        &self.source_positions
    }

    pub(crate) fn tracker(&self) -> Arc<SharedOrientation> {
        Arc::clone(&self.tracker)
    }

    pub(crate) fn run_state(&self) -> Arc<RunState> {
        Arc::clone(&self.run_state)
    }

    pub fn build_plain<F: StaticFilters>(&self, filter: F) -> Result<PlainConvolver<F>, Error> {
        let mut convolver = PlainConvolver::new(filter, self.run_state())?;
        convolver.set_passthrough(Some(self.passthrough));
        Ok(convolver)
    }

    pub fn build_overlap_save<F: StaticFilters>(
        &self,
        filter: F,
    ) -> Result<OverlapSaveConvolver<F>, Error> {
        let mut convolver = OverlapSaveConvolver::new(filter, self)?;
        convolver.set_passthrough(Some(self.passthrough));
        Ok(convolver)
    }

    pub fn build_adjustable_fd<F: DirectionalFilters>(
        &self,
        filter: F,
    ) -> Result<AdjustableFdConvolver<F>, Error> {
        let mut convolver = AdjustableFdConvolver::new(filter, self)?;
        convolver.set_passthrough(Some(self.passthrough));
        convolver.set_crossfade(Some(self.crossfade));
        Ok(convolver)
    }

    pub fn build_adjustable_sh<F: ShFilters, C: Compensation>(
        &self,
        filter: F,
        compensation: C,
    ) -> Result<AdjustableShConvolver<F, C>, Error> {
        let mut convolver =
            AdjustableShConvolver::new(filter, compensation, AnalyticEncoder::default(), self)?;
        convolver.set_passthrough(Some(self.passthrough));
        convolver.set_crossfade(Some(self.crossfade));
        Ok(convolver)
    }

    /// Build a SH convolver encoding through the measured 8 by 8 filter bank
    /// `encoding` of size `[microphones][coefficient routes][taps]`.
    pub fn build_adjustable_sh_measured_enc<F: ShFilters, C: Compensation>(
        &self,
        filter: F,
        compensation: C,
        encoding: ImpulseResponses,
    ) -> Result<AdjustableShConvolverMeasuredEnc<F, C>, Error> {
        let encoder = MeasuredEncoder::new(encoding)?;
        let mut convolver = AdjustableShConvolver::new(filter, compensation, encoder, self)?;
        convolver.set_passthrough(Some(self.passthrough));
        convolver.set_crossfade(Some(self.crossfade));
        Ok(convolver)
    }
}

/// Filter sets the factory knows how to render
pub enum FilterSetKind {
    MultiChannel(MultiChannelFilterSet),
    Directional(DirectionalFilterSet),
    Sh {
        filter_set: ShFilterSet,
        /// measured encoding filters replacing the analytic SH encoding
        measured_encoding: Option<ImpulseResponses>,
    },
}

/// Create the convolver matching the filter set.
///
/// Without a block length only multichannel filter sets can be rendered,
/// unbuffered.
pub fn create_instance(
    kind: FilterSetKind,
    builder: &ConvolverBuilder,
) -> Result<Box<dyn Convolve + Send>, Error> {
    let unbuffered = builder.block_len.is_none();

    let convolver: Box<dyn Convolve + Send> = match kind {
        FilterSetKind::MultiChannel(filter) if unbuffered => Box::new(builder.build_plain(filter)?),
        FilterSetKind::MultiChannel(filter) => Box::new(builder.build_overlap_save(filter)?),
        FilterSetKind::Directional(filter) => Box::new(builder.build_adjustable_fd(filter)?),
        FilterSetKind::Sh {
            filter_set,
            measured_encoding: None,
        } => Box::new(builder.build_adjustable_sh(filter_set, SphericalCompensation::default())?),
        FilterSetKind::Sh {
            filter_set,
            measured_encoding: Some(encoding),
        } => Box::new(builder.build_adjustable_sh_measured_enc(
            filter_set,
            SphericalCompensation::default(),
            encoding,
        )?),
    };

    Ok(convolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sh::SamplingGrid;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;

    #[test]
    fn windows_are_complementary() {
        let (window_in, window_out) = crossfade_windows(128).unwrap();

        assert_approx_eq!(window_in[0], 0.0, 1e-6);
        assert_approx_eq!(window_out[0], 1.0, 1e-6);
        assert_approx_eq!(window_in[127], 1.0, 1e-6);
        assert_approx_eq!(window_out[127], 0.0, 1e-6);

        for t in 0..128 {
            assert_approx_eq!(window_in[t] + window_out[t], 1.0, 1e-6);
        }
        for t in 1..128 {
            assert!(window_in[t] >= window_in[t - 1]);
            assert!(window_out[t] <= window_out[t - 1]);
        }

        assert!(matches!(crossfade_windows(1), Err(Error::InvalidBlockLen(1))));
    }

    #[test]
    fn directions_are_wrapped() {
        let mut rng = rand::thread_rng();

        for _ in 0..10_000 {
            let tracker = (rng.gen_range(-1e4..1e4), rng.gen_range(-1e4..1e4));
            let source = (rng.gen_range(-720.0..720.0), rng.gen_range(-720.0..720.0));

            for head_related in [true, false] {
                let (azimuth, elevation) =
                    resolve_direction(tracker.0, tracker.1, source, head_related);

                assert!((0.0..360.0).contains(&azimuth), "{}", azimuth);
                assert!((-180.0..180.0).contains(&elevation), "{}", elevation);
            }
        }
    }

    #[test]
    fn direction_sign_follows_filter_kind() {
        let (azimuth, elevation) = resolve_direction(30.0, 10.0, (90.0, 0.0), true);
        assert_approx_eq!(azimuth, 120.0, 1e-4);
        assert_approx_eq!(elevation, 10.0, 1e-4);

        let (azimuth, elevation) = resolve_direction(30.0, 10.0, (0.0, 0.0), false);
        assert_approx_eq!(azimuth, 330.0, 1e-4);
        assert_approx_eq!(elevation, -10.0, 1e-4);

        let (_, elevation) = resolve_direction(0.0, 180.0, (0.0, 0.0), true);
        assert_approx_eq!(elevation, -180.0, 1e-4);
    }

    #[test]
    fn builder_validates_block_len() {
        let filter = MultiChannelFilterSet::new(48000.0, ImpulseResponses::dirac(1, 1, 8)).unwrap();

        assert!(matches!(
            ConvolverBuilder::new(1).build_overlap_save(filter.clone()),
            Err(Error::InvalidBlockLen(1))
        ));
        assert!(matches!(
            ConvolverBuilder::unbuffered().build_overlap_save(filter),
            Err(Error::InvalidBlockLen(0))
        ));
    }

    #[test]
    fn factory_picks_variant() {
        let irs = ImpulseResponses::dirac(2, 2, 8);
        let filter = MultiChannelFilterSet::new(48000.0, irs).unwrap();

        let plain = create_instance(
            FilterSetKind::MultiChannel(filter.clone()),
            &ConvolverBuilder::unbuffered(),
        )
        .unwrap();
        assert_eq!(plain.block_len(), 8);

        let mut overlap_save =
            create_instance(FilterSetKind::MultiChannel(filter), &ConvolverBuilder::new(4)).unwrap();
        assert_eq!(overlap_save.block_len(), 4);
        assert!(overlap_save.sh_processing().is_none());

        let directions = vec![(0.0, 0.0), (180.0, 0.0)];
        let irs = vec![ImpulseResponses::dirac(1, 2, 8); 2];
        let filter = DirectionalFilterSet::new(48000.0, directions, irs, true).unwrap();
        let mut fd = create_instance(FilterSetKind::Directional(filter), &ConvolverBuilder::new(4)).unwrap();
        assert_eq!(fd.output_channel_count(), 2);
        assert!(!fd.set_crossfade(None));

        let grid = SamplingGrid::gauss(1);
        let irs = ImpulseResponses::new(grid.len(), 2, 8);
        let filter_set = ShFilterSet::new(48000.0, &grid, irs, 1).unwrap();
        let mut sh = create_instance(
            FilterSetKind::Sh {
                filter_set,
                measured_encoding: None,
            },
            &ConvolverBuilder::new(4),
        )
        .unwrap();
        assert!(sh.sh_processing().is_some());
    }
}
