#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Block length is invalid: {0}")]
    InvalidBlockLen(usize),
    #[error("Input/Output length ({0}) should be equal to ({1})")]
    InvalidInputLen(usize, usize),
    #[error("Sample rate is invalid: {0}")]
    InvalidSampleRate(f32),
    #[error("Filter shape is invalid: {0}")]
    InvalidFilterShape(String),
    #[error("No virtual source positions given")]
    NoSourcePositions,
    #[error("More than one virtual source position given ({0}), which is not supported")]
    UnsupportedSourceCount(usize),
    #[error("Filter spectra were accessed before being calculated")]
    Uninitialized,
    #[error("Spherical harmonics processing was not prepared")]
    ShNotPrepared,
    #[error("Invalid spherical harmonics configuration: {0}")]
    InvalidShConfiguration(String),
    #[error("Invalid compensation: {0}")]
    InvalidCompensation(String),
    #[error("The owls are not what they seem")]
    InternalProcessingError(#[from] realfft::FftError),
}
