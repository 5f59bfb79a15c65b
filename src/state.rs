use std::sync::atomic::{AtomicBool, Ordering};

/// Gate observed by whoever submits audio blocks.
///
/// Reconfiguration pauses it while filters are being recomputed; the block
/// loop must not process blocks while it reads `false`.
#[derive(Debug)]
pub struct RunState {
    running: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RunState {
    pub fn new(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Stop processing until the returned guard is dropped, after which the
    /// previous state is restored.
    pub fn pause(&self) -> PauseGuard<'_> {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        PauseGuard {
            state: self,
            was_running,
        }
    }
}

#[must_use]
#[derive(Debug)]
pub struct PauseGuard<'a> {
    state: &'a RunState,
    was_running: bool,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.state.set_running(self.was_running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_restores_previous_state() {
        let state = RunState::default();

        {
            let _guard = state.pause();
            assert!(!state.is_running());
        }
        assert!(state.is_running());

        state.set_running(false);
        {
            let _guard = state.pause();
            assert!(!state.is_running());
        }
        assert!(!state.is_running());
    }
}
