//! Filter sets feeding the convolvers.
//!
//! Reading filters from disk is not handled here. The traits in this module
//! are the seam to whatever loads HRIR, BRIR or array filter data; the
//! in-memory implementations are enough to drive every convolver.

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

use crate::fft::{ComplexTransform, RealTransform, Transform};
use crate::sh::{SamplingGrid, ShConfiguration};
use crate::Error;

/// Time domain filter coefficients of size `[inputs][outputs][taps]`
#[derive(Clone, Debug, PartialEq)]
pub struct ImpulseResponses {
    inputs: usize,
    outputs: usize,
    taps: usize,
    data: Box<[f32]>,
}

impl ImpulseResponses {
    pub fn new(inputs: usize, outputs: usize, taps: usize) -> Self {
        Self {
            inputs,
            outputs,
            taps,
            data: vec![0.0; inputs * outputs * taps].into_boxed_slice(),
        }
    }

    pub fn from_vec(
        inputs: usize,
        outputs: usize,
        taps: usize,
        data: Vec<f32>,
    ) -> Result<Self, Error> {
        if inputs == 0 || outputs == 0 || taps == 0 || data.len() != inputs * outputs * taps {
            return Err(Error::InvalidFilterShape(format!(
                "{} coefficients for {} inputs, {} outputs and {} taps",
                data.len(),
                inputs,
                outputs,
                taps
            )));
        }

        Ok(Self {
            inputs,
            outputs,
            taps,
            data: data.into_boxed_slice(),
        })
    }

    /// Identity filter: unit impulse where `input == output`, or on every
    /// output if there is a single input.
    pub fn dirac(inputs: usize, outputs: usize, taps: usize) -> Self {
        let mut dirac = Self::new(inputs, outputs, taps);

        for i in 0..inputs {
            for o in 0..outputs {
                if i == o || inputs == 1 {
                    if let Some(first) = dirac.channel_mut(i, o).first_mut() {
                        *first = 1.0;
                    }
                }
            }
        }

        dirac
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    pub fn channel(&self, input: usize, output: usize) -> &[f32] {
        let off = (input * self.outputs + output) * self.taps;
        &self.data[off..off + self.taps]
    }

    pub fn channel_mut(&mut self, input: usize, output: usize) -> &mut [f32] {
        let off = (input * self.outputs + output) * self.taps;
        &mut self.data[off..off + self.taps]
    }
}

/// Filter spectra of size `[blocks][inputs][outputs][bins]`
#[derive(Clone, Debug, PartialEq)]
pub struct FilterBlocks {
    blocks: usize,
    inputs: usize,
    outputs: usize,
    bins: usize,
    data: Box<[Complex<f32>]>,
}

impl FilterBlocks {
    pub fn new(blocks: usize, inputs: usize, outputs: usize, bins: usize) -> Self {
        Self {
            blocks,
            inputs,
            outputs,
            bins,
            data: vec![Complex::zero(); blocks * inputs * outputs * bins].into_boxed_slice(),
        }
    }

    /// Transform `irs` into frequency domain.
    ///
    /// Without a partition length the whole filter is transformed as one
    /// block and `transform` must be as long as the filter. Otherwise the
    /// filter is split into partitions of `partition_len` taps, each zero
    /// padded to the transform length of `2 * partition_len`.
    pub fn from_impulse_responses(
        irs: &ImpulseResponses,
        partition_len: Option<usize>,
        transform: &mut dyn Transform,
    ) -> Result<Self, Error> {
        let (block_len, blocks) = match partition_len {
            None => (irs.taps(), 1),
            Some(0) => return Err(Error::InvalidBlockLen(0)),
            Some(len) => (len, (irs.taps() + len - 1) / len),
        };

        let fft_len = match partition_len {
            None => block_len,
            Some(len) => len * 2,
        };

        if transform.len() != fft_len {
            return Err(Error::InvalidInputLen(transform.len(), fft_len));
        }

        let mut filter = Self::new(blocks, irs.inputs(), irs.outputs(), transform.bins());
        let mut scratch = vec![0.0; fft_len];

        for b in 0..blocks {
            for i in 0..irs.inputs() {
                for o in 0..irs.outputs() {
                    let taps = irs.channel(i, o);
                    let start = b * block_len;
                    let end = usize::min(start + block_len, taps.len());

                    scratch.fill(0.0);
                    scratch[..end - start].copy_from_slice(&taps[start..end]);

                    transform.forward(&mut scratch, filter.spectrum_mut(b, i, o))?;
                }
            }
        }

        Ok(filter)
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.blocks, self.inputs, self.outputs, self.bins]
    }

    pub fn spectrum(&self, block: usize, input: usize, output: usize) -> &[Complex<f32>] {
        let off = ((block * self.inputs + input) * self.outputs + output) * self.bins;
        &self.data[off..off + self.bins]
    }

    pub fn spectrum_mut(&mut self, block: usize, input: usize, output: usize) -> &mut [Complex<f32>] {
        let off = ((block * self.inputs + input) * self.outputs + output) * self.bins;
        &mut self.data[off..off + self.bins]
    }
}

/// Common metadata of every filter set
pub trait FilterSet {
    fn sample_rate(&self) -> f32;

    fn input_channel_count(&self) -> usize;

    fn output_channel_count(&self) -> usize;

    fn taps_len(&self) -> usize;

    /// Head related filters follow the tracked head orientation, room related
    /// ones compensate it.
    fn is_head_related(&self) -> bool {
        true
    }
}

/// Direction independent filters
pub trait StaticFilters: FilterSet {
    fn calculate_filter_blocks_fd(&mut self, partition_len: Option<usize>) -> Result<(), Error>;

    fn filter_blocks_fd(&self) -> Result<&FilterBlocks, Error>;

    fn dirac_td(&self) -> &ImpulseResponses;

    fn dirac_blocks_fd(&self) -> Result<&FilterBlocks, Error>;
}

/// Filters selected by direction, e.g. HRIRs or BRIRs
pub trait DirectionalFilters: FilterSet {
    fn calculate_filter_blocks_fd(&mut self, partition_len: usize) -> Result<(), Error>;

    fn direction_count(&self) -> usize;

    /// Index of the filter closest to the given direction in degrees
    fn nearest_direction(&self, azimuth_deg: f32, elevation_deg: f32) -> usize;

    fn filter_blocks_fd_at(&self, index: usize) -> Result<&FilterBlocks, Error>;

    fn filter_blocks_fd(&self, azimuth_deg: f32, elevation_deg: f32) -> Result<&FilterBlocks, Error> {
        self.filter_blocks_fd_at(self.nearest_direction(azimuth_deg, elevation_deg))
    }
}

/// Filters represented in spherical harmonics domain
pub trait ShFilters: FilterSet {
    fn sh_max_order(&self) -> usize;

    fn sh_configuration(&self) -> &ShConfiguration;

    /// (Re)compute the spherical harmonics domain blocks from scratch. Spectra
    /// are two-sided with `2 * block_len` bins.
    fn calculate_filter_blocks_nm(&mut self, block_len: usize) -> Result<(), Error>;

    /// Blocks of size `[blocks][coefficients][outputs][bins]`
    fn filter_blocks_nm(&self) -> Result<&FilterBlocks, Error>;

    fn filter_blocks_nm_mut(&mut self) -> Result<&mut FilterBlocks, Error>;
}

fn check_sample_rate(sample_rate: f32) -> Result<f32, Error> {
    match sample_rate.is_normal() && sample_rate.is_sign_positive() {
        true => Ok(sample_rate),
        false => Err(Error::InvalidSampleRate(sample_rate)),
    }
}

fn check_shape(irs: &ImpulseResponses) -> Result<(), Error> {
    if irs.inputs() == 0 || irs.outputs() == 0 || irs.taps() == 0 {
        return Err(Error::InvalidFilterShape(format!(
            "empty filters: {} inputs, {} outputs and {} taps",
            irs.inputs(),
            irs.outputs(),
            irs.taps()
        )));
    }

    Ok(())
}

/// Fixed multichannel filter, e.g. headphone compensation or a pre-rendered
/// room.
#[derive(Clone, Debug)]
pub struct MultiChannelFilterSet {
    sample_rate: f32,
    irs: ImpulseResponses,
    dirac: ImpulseResponses,
    blocks_fd: Option<FilterBlocks>,
    dirac_blocks_fd: Option<FilterBlocks>,
}

impl MultiChannelFilterSet {
    pub fn new(sample_rate: f32, irs: ImpulseResponses) -> Result<Self, Error> {
        let sample_rate = check_sample_rate(sample_rate)?;
        check_shape(&irs)?;

        let dirac = ImpulseResponses::dirac(irs.inputs(), irs.outputs(), irs.taps());

        Ok(Self {
            sample_rate,
            irs,
            dirac,
            blocks_fd: None,
            dirac_blocks_fd: None,
        })
    }

    pub fn impulse_responses(&self) -> &ImpulseResponses {
        &self.irs
    }
}

impl FilterSet for MultiChannelFilterSet {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn input_channel_count(&self) -> usize {
        self.irs.inputs()
    }

    fn output_channel_count(&self) -> usize {
        self.irs.outputs()
    }

    fn taps_len(&self) -> usize {
        self.irs.taps()
    }
}

impl StaticFilters for MultiChannelFilterSet {
    fn calculate_filter_blocks_fd(&mut self, partition_len: Option<usize>) -> Result<(), Error> {
        let fft_len = match partition_len {
            Some(len) => len * 2,
            None => self.irs.taps(),
        };
        let mut transform = RealTransform::new(fft_len);

        let blocks_fd =
            FilterBlocks::from_impulse_responses(&self.irs, partition_len, &mut transform)?;
        let dirac_blocks_fd =
            FilterBlocks::from_impulse_responses(&self.dirac, partition_len, &mut transform)?;

        self.blocks_fd = Some(blocks_fd);
        self.dirac_blocks_fd = Some(dirac_blocks_fd);

        Ok(())
    }

    fn filter_blocks_fd(&self) -> Result<&FilterBlocks, Error> {
        self.blocks_fd.as_ref().ok_or(Error::Uninitialized)
    }

    fn dirac_td(&self) -> &ImpulseResponses {
        &self.dirac
    }

    fn dirac_blocks_fd(&self) -> Result<&FilterBlocks, Error> {
        self.dirac_blocks_fd.as_ref().ok_or(Error::Uninitialized)
    }
}

fn unit_vector(azimuth_deg: f32, elevation_deg: f32) -> [f32; 3] {
    let (az, el) = (azimuth_deg.to_radians(), elevation_deg.to_radians());
    [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()]
}

/// Set of single input filters measured at discrete directions.
#[derive(Clone, Debug)]
pub struct DirectionalFilterSet {
    sample_rate: f32,
    head_related: bool,
    /// azimuth (counterclockwise) and elevation in degrees
    directions: Vec<(f32, f32)>,
    unit_vectors: Vec<[f32; 3]>,
    irs: Vec<ImpulseResponses>,
    blocks_fd: Vec<FilterBlocks>,
}

impl DirectionalFilterSet {
    /// Every filter in `irs` belongs to the direction of the same index and
    /// has a single input.
    pub fn new(
        sample_rate: f32,
        directions: Vec<(f32, f32)>,
        irs: Vec<ImpulseResponses>,
        head_related: bool,
    ) -> Result<Self, Error> {
        let sample_rate = check_sample_rate(sample_rate)?;

        if directions.is_empty() || directions.len() != irs.len() {
            return Err(Error::InvalidFilterShape(format!(
                "{} directions for {} filters",
                directions.len(),
                irs.len()
            )));
        }

        check_shape(&irs[0])?;
        let (outputs, taps) = (irs[0].outputs(), irs[0].taps());

        if irs
            .iter()
            .any(|ir| ir.inputs() != 1 || ir.outputs() != outputs || ir.taps() != taps)
        {
            return Err(Error::InvalidFilterShape(
                "directional filters need a single input and identical shapes".into(),
            ));
        }

        let unit_vectors = directions
            .iter()
            .map(|(az, el)| unit_vector(*az, *el))
            .collect();

        Ok(Self {
            sample_rate,
            head_related,
            directions,
            unit_vectors,
            irs,
            blocks_fd: Vec::new(),
        })
    }

    pub fn directions(&self) -> &[(f32, f32)] {
        &self.directions
    }
}

impl FilterSet for DirectionalFilterSet {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn input_channel_count(&self) -> usize {
        1
    }

    fn output_channel_count(&self) -> usize {
        self.irs[0].outputs()
    }

    fn taps_len(&self) -> usize {
        self.irs[0].taps()
    }

    fn is_head_related(&self) -> bool {
        self.head_related
    }
}

impl DirectionalFilters for DirectionalFilterSet {
    fn calculate_filter_blocks_fd(&mut self, partition_len: usize) -> Result<(), Error> {
        let mut transform = RealTransform::new(partition_len * 2);

        self.blocks_fd = self
            .irs
            .iter()
            .map(|ir| FilterBlocks::from_impulse_responses(ir, Some(partition_len), &mut transform))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(())
    }

    fn direction_count(&self) -> usize {
        self.directions.len()
    }

    fn nearest_direction(&self, azimuth_deg: f32, elevation_deg: f32) -> usize {
        let target = unit_vector(azimuth_deg, elevation_deg);

        let mut nearest = 0;
        let mut best = f32::NEG_INFINITY;

        for (index, v) in self.unit_vectors.iter().enumerate() {
            let dot = v[0] * target[0] + v[1] * target[1] + v[2] * target[2];
            if dot > best {
                best = dot;
                nearest = index;
            }
        }

        nearest
    }

    fn filter_blocks_fd_at(&self, index: usize) -> Result<&FilterBlocks, Error> {
        self.blocks_fd.get(index).ok_or(Error::Uninitialized)
    }
}

/// HRIRs on a spherical sampling grid, rendered in spherical harmonics domain.
#[derive(Clone, Debug)]
pub struct ShFilterSet {
    sample_rate: f32,
    sh_max_order: usize,
    /// `[grid points][ears][taps]`
    irs: ImpulseResponses,
    sh_config: ShConfiguration,
    blocks_nm: Option<FilterBlocks>,
}

impl ShFilterSet {
    pub fn new(
        sample_rate: f32,
        grid: &SamplingGrid,
        irs: ImpulseResponses,
        sh_max_order: usize,
    ) -> Result<Self, Error> {
        let sample_rate = check_sample_rate(sample_rate)?;
        check_shape(&irs)?;

        if irs.inputs() != grid.len() {
            return Err(Error::InvalidFilterShape(format!(
                "{} filters for {} grid points",
                irs.inputs(),
                grid.len()
            )));
        }

        Ok(Self {
            sample_rate,
            sh_max_order,
            irs,
            sh_config: ShConfiguration::new(sh_max_order, grid, None)?,
            blocks_nm: None,
        })
    }
}

impl FilterSet for ShFilterSet {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn input_channel_count(&self) -> usize {
        1
    }

    fn output_channel_count(&self) -> usize {
        self.irs.outputs()
    }

    fn taps_len(&self) -> usize {
        self.irs.taps()
    }
}

impl ShFilters for ShFilterSet {
    fn sh_max_order(&self) -> usize {
        self.sh_max_order
    }

    fn sh_configuration(&self) -> &ShConfiguration {
        &self.sh_config
    }

    fn calculate_filter_blocks_nm(&mut self, block_len: usize) -> Result<(), Error> {
        if block_len == 0 {
            return Err(Error::InvalidBlockLen(block_len));
        }

        let mut transform = ComplexTransform::new(block_len * 2);
        let spatial = FilterBlocks::from_impulse_responses(&self.irs, Some(block_len), &mut transform)?;

        let points = self.irs.inputs();
        let coeffs = self.sh_config.coefficient_count();
        let bases = self.sh_config.sh_bases_weighted();

        let mut blocks_nm = FilterBlocks::new(spatial.blocks(), coeffs, spatial.outputs(), spatial.bins());

        for b in 0..spatial.blocks() {
            for c in 0..coeffs {
                for o in 0..spatial.outputs() {
                    let nm = blocks_nm.spectrum_mut(b, c, o);

                    for p in 0..points {
                        let weight = bases[c * points + p];

                        for (nm, h) in Iterator::zip(nm.iter_mut(), spatial.spectrum(b, p, o).iter()) {
                            *nm += weight * h;
                        }
                    }
                }
            }
        }

        self.blocks_nm = Some(blocks_nm);

        Ok(())
    }

    fn filter_blocks_nm(&self) -> Result<&FilterBlocks, Error> {
        self.blocks_nm.as_ref().ok_or(Error::Uninitialized)
    }

    fn filter_blocks_nm_mut(&mut self) -> Result<&mut FilterBlocks, Error> {
        self.blocks_nm.as_mut().ok_or(Error::Uninitialized)
    }
}
