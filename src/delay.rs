use crate::Error;

/// Block quantized multichannel delay line.
///
/// Blocks are planar, i.e. `[channels][block_len]` samples laid out one
/// channel after the other.
#[derive(Clone, Debug)]
pub struct DelayBuffer {
    sample_rate: f32,
    block_len: usize,
    channels: usize,
    /// ring of `capacity` blocks
    buf: Box<[f32]>,
    capacity: usize,
    /// delay in blocks
    delay: usize,
    wpos: usize,
}

impl DelayBuffer {
    pub fn new(sample_rate: f32, block_len: usize) -> Result<Self, Error> {
        if !(sample_rate.is_normal() && sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        if block_len == 0 {
            return Err(Error::InvalidBlockLen(block_len));
        }

        Ok(Self {
            sample_rate,
            block_len,
            channels: 0,
            buf: Box::default(),
            capacity: 0,
            delay: 0,
            wpos: 0,
        })
    }

    /// Allocate room for up to `max_seconds` of delay on `channels` channels.
    pub fn init(&mut self, max_seconds: f32, channels: usize) {
        let blocks = (max_seconds.max(0.0) * self.sample_rate / self.block_len as f32).ceil();

        self.capacity = blocks as usize + 1;
        self.channels = channels;
        self.buf = vec![0.0; self.capacity * self.frame_len()].into_boxed_slice();
        self.delay = 0;
        self.wpos = 0;
    }

    fn frame_len(&self) -> usize {
        self.channels * self.block_len
    }

    fn block_ms(&self) -> f32 {
        1000.0 * self.block_len as f32 / self.sample_rate
    }

    /// Request a delay in milliseconds.
    ///
    /// The delay is rounded up to whole blocks and clamped to the buffer size.
    /// Returns the realized delay in milliseconds.
    pub fn set_delay(&mut self, delay_ms: f32) -> f32 {
        let max_blocks = self.capacity.saturating_sub(1);
        let blocks = (delay_ms.max(0.0) / self.block_ms()).ceil() as usize;
        let blocks = usize::min(blocks, max_blocks);

        if blocks == 0 {
            self.reset();
        }

        self.delay = blocks;
        self.delay_ms()
    }

    pub fn delay_ms(&self) -> f32 {
        self.delay as f32 * self.block_ms()
    }

    pub fn max_delay_ms(&self) -> f32 {
        self.capacity.saturating_sub(1) as f32 * self.block_ms()
    }

    /// Delay `block` in place.
    pub fn process_block(&mut self, block: &mut [f32]) -> Result<(), Error> {
        if self.delay == 0 {
            return Ok(());
        }
        if block.len() != self.frame_len() {
            return Err(Error::InvalidInputLen(block.len(), self.frame_len()));
        }

        let frame = self.frame_len();
        let rpos = (self.wpos + self.capacity - self.delay) % self.capacity;

        self.buf[self.wpos * frame..(self.wpos + 1) * frame].copy_from_slice(block);
        block.copy_from_slice(&self.buf[rpos * frame..(rpos + 1) * frame]);

        self.wpos = (self.wpos + 1) % self.capacity;

        Ok(())
    }

    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.wpos = 0;
    }

    /// Reallocate for `channels` channels. The delay is kept, the buffered
    /// blocks are dropped.
    pub fn set_channels(&mut self, channels: usize) {
        self.channels = channels;
        self.buf = vec![0.0; self.capacity * self.frame_len()].into_boxed_slice();
        self.wpos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;

    #[test]
    fn delay_is_quantized_and_clamped() {
        let mut delay = DelayBuffer::new(48000.0, 128).unwrap();
        delay.init(1.0, 2);

        let block_ms = 1000.0 * 128.0 / 48000.0;
        let max_ms = delay.max_delay_ms();
        assert!(max_ms >= 999.9);

        let mut rng = rand::thread_rng();

        for _ in 0..1000 {
            let requested = rng.gen_range(0.0..2000.0);
            let realized = delay.set_delay(requested);
            let blocks = realized / block_ms;

            assert_approx_eq!(blocks, blocks.round(), 1e-3);
            assert!(realized <= max_ms + 1e-3);
            assert!(realized >= requested.min(max_ms) - 1e-3);
        }

        assert_approx_eq!(delay.set_delay(1.0), block_ms, 1e-6);
        assert_eq!(delay.set_delay(0.0), 0.0);
    }

    #[test]
    fn uninitialized_is_passthrough() {
        let mut delay = DelayBuffer::new(48000.0, 4).unwrap();
        assert_eq!(delay.set_delay(10.0), 0.0);

        let mut block = [1.0, 2.0, 3.0, 4.0];
        delay.process_block(&mut block).unwrap();
        assert_eq!(block, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn blocks_come_out_later() {
        let block_len = 4;
        let mut delay = DelayBuffer::new(1000.0, block_len).unwrap();
        delay.init(0.1, 2);
        delay.set_delay(8.0);

        for k in 0..10 {
            let mut block = vec![k as f32 + 1.0; 2 * block_len];
            delay.process_block(&mut block).unwrap();

            let expected = if k < 2 { 0.0 } else { k as f32 - 1.0 };
            assert!(block.iter().all(|v| *v == expected));
        }

        let mut block = vec![0.0; block_len];
        assert!(matches!(
            delay.process_block(&mut block),
            Err(Error::InvalidInputLen(4, 8))
        ));
    }

    #[test]
    fn channel_change_keeps_delay() {
        let block_len = 4;
        let mut delay = DelayBuffer::new(1000.0, block_len).unwrap();
        delay.init(0.1, 1);
        assert_eq!(delay.set_delay(8.0), 8.0);

        let mut block = vec![1.0; block_len];
        delay.process_block(&mut block).unwrap();

        delay.set_channels(3);
        assert_eq!(delay.delay_ms(), 8.0);

        for k in 0..4 {
            let mut block = vec![k as f32 + 1.0; 3 * block_len];
            delay.process_block(&mut block).unwrap();

            let expected = if k < 2 { 0.0 } else { k as f32 - 1.0 };
            assert!(block.iter().all(|v| *v == expected));
        }
    }
}
