use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Tracks sample throughput, with both *all-time* totals and a rate over a
/// *sliding window* (1 s unless built with [`Counter::with_window`]).
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time number of samples
    pub total_samples: u64,
    /// All-time number of increments
    pub n_batches: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    batches: VecDeque<(Instant, u64)>,
    samples_in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total_samples: 0,
            n_batches: 0,
            t_begin: Instant::now(),
            window,
            batches: VecDeque::new(),
            samples_in_window: 0,
        }
    }

    /// Samples per second over the sliding window.
    pub fn rate(&self) -> f64 {
        let secs = self
            .window
            .min(self.t_begin.elapsed())
            .as_secs_f64()
            .max(1e-6);
        self.samples_in_window as f64 / secs
    }

    pub fn increment(&mut self, samples: u64) {
        self.increment_at(Instant::now(), samples);
    }

    fn increment_at(&mut self, now: Instant, samples: u64) {
        self.total_samples += samples;
        self.n_batches += 1;

        self.batches.push_back((now, samples));
        self.samples_in_window += samples;

        while let Some(&(ts, n)) = self.batches.front() {
            if now.duration_since(ts) > self.window {
                self.batches.pop_front();
                self.samples_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.n_batches = 0;
        self.t_begin = Instant::now();

        self.batches.clear();
        self.samples_in_window = 0;
    }
}
