//! Block submission front end of a convolver.

use std::sync::Arc;

use log::info;

use crate::convolver::Convolve;
use crate::delay::DelayBuffer;
use crate::state::RunState;
use crate::Error;

/// Maximum input delay of a client in seconds
pub const CLIENT_MAX_DELAY_SEC: f32 = 1.0;

/// Feeds audio blocks into a convolver, with an adjustable input delay.
///
/// While the shared [`RunState`] is paused, the convolver receives no input
/// (which lets it drop its buffers) and the client produces silence.
pub struct RenderClient {
    convolver: Box<dyn Convolve + Send>,
    delay: DelayBuffer,
    run_state: Arc<RunState>,
    input: Box<[f32]>,
    silence: Box<[f32]>,
}

impl RenderClient {
    pub fn new(
        convolver: Box<dyn Convolve + Send>,
        sample_rate: f32,
        run_state: Arc<RunState>,
    ) -> Result<Self, Error> {
        let block_len = convolver.block_len();
        let inputs = convolver.input_channel_count();
        let outputs = convolver.output_channel_count();

        let mut delay = DelayBuffer::new(sample_rate, block_len)?;
        delay.init(CLIENT_MAX_DELAY_SEC, inputs);

        info!(
            "Render client with {} inputs, {} outputs, {} samples per block",
            inputs, outputs, block_len
        );

        Ok(Self {
            convolver,
            delay,
            run_state,
            input: vec![0.0; inputs * block_len].into_boxed_slice(),
            silence: vec![0.0; outputs * block_len].into_boxed_slice(),
        })
    }

    pub fn convolver(&self) -> &(dyn Convolve + Send) {
        &*self.convolver
    }

    pub fn convolver_mut(&mut self) -> &mut (dyn Convolve + Send) {
        &mut *self.convolver
    }

    /// Set input delay in milliseconds, returns the realized delay.
    pub fn set_delay(&mut self, delay_ms: f32) -> f32 {
        let delay_ms = self.delay.set_delay(delay_ms);
        info!("Input delay set to {:.1} ms", delay_ms);
        delay_ms
    }

    pub fn delay_ms(&self) -> f32 {
        self.delay.delay_ms()
    }

    /// Follow channel count changes of the convolver, e.g. after SH
    /// processing was prepared for an array. The delay setting is kept.
    fn sync_channels(&mut self) {
        let block_len = self.convolver.block_len();
        let inputs = self.convolver.input_channel_count();
        let outputs = self.convolver.output_channel_count();

        if self.input.len() != inputs * block_len {
            self.delay.set_channels(inputs);
            self.input = vec![0.0; inputs * block_len].into_boxed_slice();

            info!("Render client follows {} inputs", inputs);
        }

        if self.silence.len() != outputs * block_len {
            self.silence = vec![0.0; outputs * block_len].into_boxed_slice();
        }
    }

    /// Process one planar block of `[inputs][block_len]` samples.
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32], Error> {
        self.sync_channels();

        if !self.run_state.is_running() {
            self.convolver.filter_block(None)?;
            return Ok(&self.silence[..]);
        }

        if input.len() != self.input.len() {
            return Err(Error::InvalidInputLen(input.len(), self.input.len()));
        }

        self.input.copy_from_slice(input);
        self.delay.process_block(&mut self.input)?;

        match self.convolver.filter_block(Some(&self.input))? {
            Some(output) => Ok(output),
            None => Ok(&self.silence[..]),
        }
    }
}
