use std::time::Instant;

use ffmpeg_next::Rational;

/// Largest accepted window; keeps `intervals * 1000` within `i32`.
pub const MAX_WINDOW: u32 = 1_000_000;

/// Estimates the average frame rate of a frame sequence over fixed-size
/// windows of arrivals.
///
/// The clock starts at the first arrival, so the first window measures
/// `window - 1` intervals. Every later window is timed from the arrival that
/// closed the previous one and measures `window` intervals.
///
/// Not thread safe: feed it from the thread that receives the frames.
pub struct FrameRateCollector {
    window: u32,
    received: u32,
    intervals: u32,
    started: Option<Instant>,
    frame_rate: Option<Rational>,
}

impl FrameRateCollector {
    /// `window` is the number of arrivals averaged per estimate, between 2
    /// and [`MAX_WINDOW`].
    pub fn new(window: u32) -> Self {
        assert!(
            (2..=MAX_WINDOW).contains(&window),
            "frame rate window must be in 2..={MAX_WINDOW}, got {window}"
        );
        Self {
            window,
            received: 0,
            intervals: 0,
            started: None,
            frame_rate: None,
        }
    }

    /// Last closed window's estimate; `None` until the first window closes.
    pub fn frame_rate(&self) -> Option<Rational> {
        self.frame_rate
    }

    pub fn frame_received(&mut self) {
        self.frame_received_at(Instant::now());
    }

    pub fn frame_received_at(&mut self, now: Instant) {
        self.received += 1;
        let Some(started) = self.started else {
            self.started = Some(now);
            return;
        };
        self.intervals += 1;
        if self.received < self.window {
            return;
        }

        let elapsed_ms = now.saturating_duration_since(started).as_millis();
        let frames = self.intervals as i32;
        let rate = match i32::try_from(elapsed_ms) {
            Ok(ms) if ms > 0 => Rational::new(frames * 1000, ms).reduce(),
            Ok(_) => Rational::new(self.received as i32, 1),
            // A window longer than ~24 days: effectively stalled.
            Err(_) => Rational::new(frames * 1000, i32::MAX).reduce(),
        };
        log::debug!("frame rate: {}/{}", rate.numerator(), rate.denominator());

        self.frame_rate = Some(rate);
        self.received = 0;
        self.intervals = 0;
        self.started = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn as_f64(rate: Rational) -> f64 {
        rate.numerator() as f64 / rate.denominator() as f64
    }

    fn feed_evenly(collector: &mut FrameRateCollector, start: Instant, from: u64, to: u64, step_ms: u64) {
        for i in from..to {
            collector.frame_received_at(start + Duration::from_millis(i * step_ms));
        }
    }

    #[test]
    fn test_no_rate_before_first_window() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(15);
        for i in 0..14 {
            collector.frame_received_at(start + Duration::from_millis(i * 33));
            assert!(collector.frame_rate().is_none());
        }
    }

    #[test]
    fn test_first_window_converges_from_first_arrival() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(15);
        feed_evenly(&mut collector, start, 0, 15, 40);
        let rate = collector.frame_rate().expect("window closed");
        assert_eq!(rate, Rational::new(25, 1));
    }

    #[test]
    fn test_later_windows_measure_full_window() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(15);
        feed_evenly(&mut collector, start, 0, 15, 40);
        // The second window is timed from the arrival that closed the first.
        feed_evenly(&mut collector, start, 15, 30, 40);
        assert_eq!(collector.frame_rate(), Some(Rational::new(25, 1)));
        // Switch to 50 fps: 15 intervals of 20 ms.
        let base = start + Duration::from_millis(29 * 40);
        for i in 1..=15 {
            collector.frame_received_at(base + Duration::from_millis(i * 20));
        }
        assert_eq!(collector.frame_rate(), Some(Rational::new(50, 1)));
    }

    #[test]
    fn test_thirty_fps_source() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(15);
        feed_evenly(&mut collector, start, 0, 15, 33);
        let rate = collector.frame_rate().unwrap();
        assert!((as_f64(rate) - 30.3).abs() < 0.1, "{rate}");
        assert_eq!(crate::encoder::keyframe_interval(rate), 30);
    }

    #[test]
    fn test_rate_is_held_until_next_window() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(2);
        collector.frame_received_at(start);
        collector.frame_received_at(start + Duration::from_millis(50));
        let first = collector.frame_rate().unwrap();
        assert_eq!(first, Rational::new(20, 1));

        collector.frame_received_at(start + Duration::from_millis(60));
        assert_eq!(collector.frame_rate(), Some(first));

        collector.frame_received_at(start + Duration::from_millis(70));
        assert_eq!(collector.frame_rate(), Some(Rational::new(100, 1)));
    }

    #[test]
    fn test_zero_elapsed_falls_back_to_window_size() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(5);
        for _ in 0..5 {
            collector.frame_received_at(start);
        }
        assert_eq!(collector.frame_rate(), Some(Rational::new(5, 1)));
    }

    #[test]
    #[should_panic]
    fn test_window_of_one_is_rejected() {
        let _ = FrameRateCollector::new(1);
    }

    #[test]
    #[should_panic]
    fn test_oversized_window_is_rejected() {
        let _ = FrameRateCollector::new(MAX_WINDOW + 1);
    }

    #[test]
    fn test_largest_window_does_not_overflow() {
        let start = Instant::now();
        let mut collector = FrameRateCollector::new(MAX_WINDOW);
        feed_evenly(&mut collector, start, 0, MAX_WINDOW as u64, 1);
        let rate = collector.frame_rate().unwrap();
        assert!((as_f64(rate) - 1000.0).abs() < 0.01, "{rate}");
    }
}
