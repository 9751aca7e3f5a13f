use futures_timer::Delay;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct DebounceState {
    generation: u64,
    armed: bool,
}

/// A cancellable single-shot debounce channel.
///
/// Arming while a timer is pending supersedes it, so at most one armed
/// timer exists per channel at any time. The pending closure runs on the
/// global executor when the delay elapses, unless a later arm or a
/// cancel got there first.
#[derive(Clone)]
pub struct Debouncer {
    state: Arc<Mutex<DebounceState>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debouncer {
    /// Creates an idle debouncer.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DebounceState {
                generation: 0,
                armed: false,
            })),
        }
    }

    /// (Re)arms the timer; any previously armed call is dropped.
    pub fn arm(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.armed = true;
            state.generation
        };
        let state = self.state.clone();
        async_global_executor::spawn(async move {
            Delay::new(delay).await;
            let fire = {
                let mut state = state.lock();
                if state.armed && state.generation == generation {
                    state.armed = false;
                    true
                } else {
                    false
                }
            };
            if fire {
                f();
            }
        })
        .detach();
    }

    /// Cancels the armed timer, if any.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.armed = false;
    }

    /// True while a timer is pending.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }
}
