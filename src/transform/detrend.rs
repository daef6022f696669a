//! Incremental-mean detrending.
//!
//! Removes a running mean from the signal sample by sample. The mean spans
//! every sample ever seen on the channel, across frame boundaries:
//!
//! ```text
//! mean_k = mean_{k-1} + (x_k - mean_{k-1}) / k
//! y_k    = x_k - mean_k
//! ```

use serde::Serialize;

/// Carried detrend state for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetrendState {
    /// Samples folded into `running_mean` so far. Zero until the first
    /// sample seeds the mean; the next sample uses `count + 1` as divisor.
    pub count: u64,
    pub running_mean: f64,
}

impl DetrendState {
    pub fn is_seeded(&self) -> bool {
        self.count > 0
    }

    /// Detrend `samples` in place and advance the carried mean.
    ///
    /// The first sample ever seen seeds the mean and is emitted as `0`.
    /// Not idempotent: replaying a frame shifts all later output.
    pub fn apply(&mut self, samples: &mut [f64]) {
        let mut start = 0;

        if !self.is_seeded() {
            let Some(first) = samples.first_mut() else {
                return;
            };
            self.running_mean = *first;
            *first = 0.0;
            self.count = 1;
            start = 1;
        }

        for x in &mut samples[start..] {
            #[allow(clippy::cast_precision_loss)]
            let divisor = (self.count + 1) as f64;
            let mean = self.running_mean + (*x - self.running_mean) / divisor;
            *x -= mean;
            self.running_mean = mean;
            self.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_signal_detrends_to_zero() {
        let mut state = DetrendState::default();
        let mut frame = vec![10.0; 4];
        state.apply(&mut frame);
        assert_eq!(frame, vec![0.0; 4]);

        for _ in 0..5 {
            let mut next = vec![10.0; 4];
            state.apply(&mut next);
            assert!(next.iter().all(|y| y.abs() < 1e-12));
        }
        assert_eq!(state.count, 24);
        assert!((state.running_mean - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_first_frame_recurrence() {
        let mut state = DetrendState::default();
        let mut frame = vec![2.0, 4.0, 6.0];
        state.apply(&mut frame);

        // mean: 2 -> 3 -> 4
        assert_eq!(frame, vec![0.0, 1.0, 2.0]);
        assert_eq!(state.count, 3);
        assert_eq!(state.running_mean, 4.0);
    }

    #[test]
    fn test_state_carries_across_frames() {
        let mut split = DetrendState::default();
        let mut a = vec![1.0, 5.0];
        let mut b = vec![3.0, 7.0, -2.0];
        split.apply(&mut a);
        split.apply(&mut b);

        let mut whole = DetrendState::default();
        let mut ab = vec![1.0, 5.0, 3.0, 7.0, -2.0];
        whole.apply(&mut ab);

        let joined: Vec<f64> = a.into_iter().chain(b).collect();
        for (x, y) in joined.iter().zip(&ab) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(split, whole);
    }

    #[test]
    fn test_second_frame_uses_carried_divisor() {
        let mut state = DetrendState {
            count: 4,
            running_mean: 1.0,
        };
        let mut frame = vec![6.0];
        state.apply(&mut frame);

        // mean' = 1 + (6 - 1) / 5 = 2
        assert_eq!(frame, vec![4.0]);
        assert_eq!(state.count, 5);
    }

    #[test]
    fn test_empty_frame_leaves_state_unseeded() {
        let mut state = DetrendState::default();
        state.apply(&mut []);
        assert!(!state.is_seeded());

        let mut frame = vec![3.0];
        state.apply(&mut frame);
        assert_eq!(frame, vec![0.0]);
        assert!(state.is_seeded());
    }

    #[test]
    fn test_replay_is_not_idempotent() {
        let mut state = DetrendState::default();
        let mut first = vec![1.0, 2.0, 3.0];
        state.apply(&mut first);

        let mut replay = vec![1.0, 2.0, 3.0];
        state.apply(&mut replay);
        assert_ne!(first, replay);
    }
}
