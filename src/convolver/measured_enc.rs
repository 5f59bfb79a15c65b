use log::warn;
use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

use super::adjustable_sh::{AdjustableShConvolver, ShEncoder};
use crate::fft::ComplexTransform;
use crate::filter::{FilterBlocks, ImpulseResponses};
use crate::sh::ShConfiguration;
use crate::Error;

/// Microphones of the measured array
const CHANNELS: usize = 8;

/// Order of the SH domain filters the measured encoding is made for
const FILTER_ORDER: usize = 2;

/// Destination coefficient and gain of every encoding filter output
const ENCODING_ROUTES: [(usize, f32); CHANNELS] = [
    (0, 1.0),
    (1, 1.0),
    (2, 1.0),
    (3, 1.0),
    (4, 0.0),
    (5, 0.0),
    (7, 0.0),
    (8, 0.0),
];

/// SH filter row and gain used for every (reindexed) coefficient
const FILTER_ROUTES: [Option<(usize, f32)>; 9] = [
    Some((0, 0.5)),
    Some((3, 1.0)),
    Some((2, 0.5)),
    Some((1, 1.0)),
    None,
    None,
    None,
    None,
    None,
];

/// SH encoding of an eight channel array through measured encoding filters
/// instead of the analytic spherical Fourier transform.
///
/// Only the first order coefficients are produced. Compensation is not applied
/// since the measured filters already contain it.
#[derive(Clone, Debug)]
pub struct MeasuredEncoder {
    /// `[microphones][routes][taps]`
    irs: ImpulseResponses,
    blocks: Option<FilterBlocks>,
}

/// SH convolver fed by [`MeasuredEncoder`]
pub type AdjustableShConvolverMeasuredEnc<F, C> = AdjustableShConvolver<F, C, MeasuredEncoder>;

impl MeasuredEncoder {
    pub fn new(irs: ImpulseResponses) -> Result<Self, Error> {
        if irs.inputs() != CHANNELS || irs.outputs() != CHANNELS {
            return Err(Error::InvalidFilterShape(format!(
                "expected {0} by {0} encoding filters, got {1} by {2}",
                CHANNELS,
                irs.inputs(),
                irs.outputs()
            )));
        }

        Ok(Self { irs, blocks: None })
    }

    pub fn impulse_responses(&self) -> &ImpulseResponses {
        &self.irs
    }
}

impl ShEncoder for MeasuredEncoder {
    fn prepare(
        &mut self,
        sh_config: &ShConfiguration,
        filter_order: usize,
        block_len: usize,
    ) -> Result<(), Error> {
        if sh_config.channel_count() != CHANNELS {
            return Err(Error::InvalidShConfiguration(format!(
                "measured encoding needs {} channels, got {}",
                CHANNELS,
                sh_config.channel_count()
            )));
        }

        if filter_order != FILTER_ORDER {
            return Err(Error::InvalidShConfiguration(format!(
                "measured encoding needs filters of order {}, got {}",
                FILTER_ORDER, filter_order
            )));
        }

        let mut transform = ComplexTransform::new(block_len * 2);
        let blocks = FilterBlocks::from_impulse_responses(&self.irs, Some(block_len), &mut transform)?;

        if blocks.blocks() > 1 {
            warn!(
                "Encoding filters span {} blocks of {} samples, only the first one is rendered",
                blocks.blocks(),
                block_len
            );
        }

        self.blocks = Some(blocks);
        Ok(())
    }

    fn encode(&self, input: &[Complex<f32>], nm: &mut [Complex<f32>]) {
        nm.fill(Complex::zero());

        let Some(blocks) = self.blocks.as_ref() else {
            return;
        };
        let bins = blocks.bins();

        for (route, &(dest, gain)) in ENCODING_ROUTES.iter().enumerate() {
            if gain == 0.0 {
                continue;
            }

            let nm = &mut nm[dest * bins..(dest + 1) * bins];

            for (mic, x) in input.chunks_exact(bins).enumerate() {
                let e = blocks.spectrum(0, mic, route);

                for (y, (x, e)) in Iterator::zip(nm.iter_mut(), Iterator::zip(x.iter(), e.iter())) {
                    *y += x * e * gain;
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

        for (c, &route) in FILTER_ROUTES.iter().enumerate() {
            let x = &encoded[c * bins..(c + 1) * bins];

            for o in 0..outputs {
                let y = &mut filtered[(c * outputs + o) * bins..(c * outputs + o + 1) * bins];

                match route {
                    Some((row, gain)) => {
                        let h = filters.spectrum(0, row, o);

                        for (y, (x, h)) in Iterator::zip(y.iter_mut(), Iterator::zip(x.iter(), h.iter())) {
                            *y = x * h * gain;
                        }
                    }
                    None => y.fill(Complex::zero()),
                }
            }
        }
    }

    fn applies_compensation(&self) -> bool {
        false
    }
}
