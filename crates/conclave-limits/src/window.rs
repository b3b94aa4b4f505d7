use std::time::{Duration, Instant};

const BUCKET_COUNT: usize = 12;

/// Sliding-window counter over twelve time slices. Slices older than the
/// window roll off; the in-window sum gates admission.
#[derive(Debug)]
pub struct SlidingWindow {
    max: u32,
    window: Duration,
    bucket_width: Duration,
    counts: [u32; BUCKET_COUNT],
    /// Start of the slice `counts[cursor]` covers.
    slice_start: Instant,
    cursor: usize,
    /// Timestamps of in-window admissions, for wait-time queries.
    admissions: std::collections::VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            bucket_width: window / BUCKET_COUNT as u32,
            counts: [0; BUCKET_COUNT],
            slice_start: Instant::now(),
            cursor: 0,
            admissions: std::collections::VecDeque::new(),
        }
    }

    fn advance(&mut self, now: Instant) {
        // A long idle gap clears the whole window in one step.
        if now.duration_since(self.slice_start) >= self.window * 2 {
            self.counts = [0; BUCKET_COUNT];
            self.cursor = 0;
            self.slice_start = now;
            self.admissions.clear();
            return;
        }
        while now.duration_since(self.slice_start) >= self.bucket_width {
            self.slice_start += self.bucket_width;
            self.cursor = (self.cursor + 1) % BUCKET_COUNT;
            self.counts[self.cursor] = 0;
        }
        let horizon = now.checked_sub(self.window);
        if let Some(horizon) = horizon {
            while let Some(front) = self.admissions.front() {
                if *front < horizon {
                    self.admissions.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn current_count(&mut self) -> u32 {
        self.current_count_at(Instant::now())
    }

    pub(crate) fn current_count_at(&mut self, now: Instant) -> u32 {
        self.advance(now);
        self.counts.iter().sum()
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.advance(now);
        let current: u32 = self.counts.iter().sum();
        if current >= self.max {
            return false;
        }
        self.counts[self.cursor] += 1;
        self.admissions.push_back(now);
        true
    }

    /// Milliseconds until the oldest in-window admission ages out.
    pub fn wait_time_ms(&mut self) -> u64 {
        self.wait_time_ms_at(Instant::now())
    }

    pub(crate) fn wait_time_ms_at(&mut self, now: Instant) -> u64 {
        self.advance(now);
        match self.admissions.front() {
            Some(oldest) => {
                let expires = *oldest + self.window;
                expires.saturating_duration_since(now).as_millis() as u64
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_within_one_window() {
        let mut window = SlidingWindow::new(5, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..5 {
            assert!(window.try_acquire_at(now));
        }
        assert!(!window.try_acquire_at(now));
        assert!(window.wait_time_ms_at(now) > 0);
    }

    #[test]
    fn old_slices_roll_off() {
        let mut window = SlidingWindow::new(2, Duration::from_millis(1_200));
        let t0 = Instant::now();
        assert!(window.try_acquire_at(t0));
        assert!(window.try_acquire_at(t0));
        assert!(!window.try_acquire_at(t0 + Duration::from_millis(600)));
        // Past the window, both admissions have aged out.
        let later = t0 + Duration::from_millis(1_300);
        assert!(window.try_acquire_at(later));
    }

    #[test]
    fn never_admits_more_than_max_in_any_window() {
        let mut window = SlidingWindow::new(10, Duration::from_millis(1_200));
        let t0 = Instant::now();
        let mut admitted_times = Vec::new();
        // Hammer for three window-lengths at a 10 ms cadence.
        for step in 0..360 {
            let now = t0 + Duration::from_millis(step * 10);
            if window.try_acquire_at(now) {
                admitted_times.push(now);
            }
        }
        for (index, start) in admitted_times.iter().enumerate() {
            let in_window = admitted_times[index..]
                .iter()
                .filter(|t| t.duration_since(*start) < Duration::from_millis(1_200))
                .count();
            assert!(in_window <= 10, "window starting at {index} admitted {in_window}");
        }
    }

    #[test]
    fn wait_time_shrinks_as_the_oldest_entry_ages() {
        let mut window = SlidingWindow::new(1, Duration::from_millis(1_000));
        let t0 = Instant::now();
        assert!(window.try_acquire_at(t0));
        let wait_early = window.wait_time_ms_at(t0 + Duration::from_millis(100));
        let wait_late = window.wait_time_ms_at(t0 + Duration::from_millis(800));
        assert!(wait_early > wait_late);
        assert!(wait_late > 0);
    }
}
