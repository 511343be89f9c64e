//! Completed-frame counter shared by the driver loop and engine callbacks

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Point-in-time throughput reading
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    /// Frames completed since the pipeline started
    pub frames: u64,
    pub elapsed: Duration,
    /// `frames / elapsed`, measured from pipeline start
    pub fps: f64,
    /// Rate over the most recent completions only
    pub steady_fps: f64,
}

/// Monotonic completion counter. Never reset mid-run.
pub struct ThroughputCounter {
    inner: Mutex<Window>,
}

struct Window {
    started: Instant,
    completed: u64,
    /// Completion instants for the steady-state rate
    recent: HeapRb<Instant>,
}

impl Window {
    fn reading(&self, now: Instant) -> Throughput {
        let elapsed = now.duration_since(self.started);
        let fps = if elapsed.is_zero() {
            0.0
        } else {
            self.completed as f64 / elapsed.as_secs_f64()
        };

        let span = self
            .recent
            .iter()
            .next()
            .zip(self.recent.iter().last())
            .map(|(first, last)| last.duration_since(*first));
        let steady_fps = match span {
            Some(span) if !span.is_zero() && self.recent.occupied_len() > 1 => {
                (self.recent.occupied_len() - 1) as f64 / span.as_secs_f64()
            }
            _ => fps,
        };

        Throughput {
            frames: self.completed,
            elapsed,
            fps,
            steady_fps,
        }
    }
}

impl ThroughputCounter {
    /// Starts the clock now. `window` completions feed the steady-state rate.
    pub fn new(window: usize) -> Self {
        Self {
            inner: Mutex::new(Window {
                started: Instant::now(),
                completed: 0,
                recent: HeapRb::new(window.max(2)),
            }),
        }
    }

    /// Count one completion and return the updated reading.
    pub fn record(&self) -> Throughput {
        let now = Instant::now();
        let reading = {
            let mut window = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            window.completed += 1;
            window.recent.push_overwrite(now);
            window.reading(now)
        };

        metrics::counter!("frames_completed").increment(1);
        metrics::gauge!("throughput_fps").set(reading.fps);
        reading
    }

    pub fn snapshot(&self) -> Throughput {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reading(Instant::now())
    }

    pub fn frames(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counts_every_record() {
        let counter = ThroughputCounter::new(4);
        for expected in 1..=10 {
            assert_eq!(counter.record().frames, expected);
        }
        assert_eq!(counter.frames(), 10);
        assert!(counter.snapshot().fps > 0.0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let counter = Arc::new(ThroughputCounter::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        counter.record();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.frames(), 1000);
    }

    #[test]
    fn steady_rate_uses_recent_window() {
        let counter = ThroughputCounter::new(3);
        counter.record();
        std::thread::sleep(Duration::from_millis(20));
        counter.record();
        let reading = counter.record();
        assert!(reading.steady_fps > 0.0);
        assert_eq!(reading.frames, 3);
    }
}
