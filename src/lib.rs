//! # Spatconv
//!
//! Real-time, block synchronous convolution engine for spatial audio.
//!
//! The [`convolver`] module implements uniformly partitioned overlap-save
//! convolution of multichannel filters, head tracked rendering of
//! direction dependent filters (HRIRs, BRIRs) and binaural rendering of
//! spherical microphone array signals in spherical harmonics domain.
//!
//! Audio is exchanged in planar blocks: `[channels][block_len]` samples laid
//! out one channel after the other.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use spatconv::convolver::{Convolve, ConvolverBuilder};
//! use spatconv::filter::{DirectionalFilterSet, ImpulseResponses};
//! use spatconv::tracker::{DataIndex, SharedOrientation};
//!
//! // HRIRs for a horizontal grid in 5 degree steps
//! let directions = (0..72).map(|i| (i as f32 * 5.0, 0.0)).collect::<Vec<_>>();
//! let hrirs = directions
//!     .iter()
//!     .map(|_| ImpulseResponses::dirac(1, 2, 256))
//!     .collect::<Vec<_>>();
//!
//! let filter = DirectionalFilterSet::new(48000.0, directions, hrirs, true).unwrap();
//! let tracker = Arc::new(SharedOrientation::default());
//!
//! let mut convolver = ConvolverBuilder::new(128)
//!     .with_source_positions(vec![(30.0, 0.0)])
//!     .with_tracker(Arc::clone(&tracker))
//!     .build_adjustable_fd(filter)
//!     .unwrap();
//!
//! // head rotation from another thread
//! tracker.set(DataIndex::Azimuth, 15.0);
//!
//! let input = vec![0.0; 128];
//! let output = convolver.filter_block(Some(&input)).unwrap();
//! ```

pub mod client;
pub mod compensation;
pub mod convolver;
pub mod delay;
pub mod fft;
pub mod filter;
pub mod sh;
pub mod state;
pub mod tracker;

mod error;

pub use client::RenderClient;
pub use convolver::{
    create_instance, AdjustableFdConvolver, AdjustableShConvolver,
    AdjustableShConvolverMeasuredEnc, Convolve, ConvolverBuilder, FilterSetKind,
    OverlapSaveConvolver, PlainConvolver, ShProcessing,
};
pub use delay::DelayBuffer;
pub use error::Error;
