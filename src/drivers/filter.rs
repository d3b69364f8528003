/// Trailing average over the most recent `window` values, `window <= N`.
///
/// Until `window` values have been seen, the average covers what there is.
pub struct RunningAverage<const N: usize> {
    values: [f32; N],
    next: usize,
    filled: usize,
    window: usize,
}

impl<const N: usize> RunningAverage<N> {
    pub fn new(window: usize) -> Self {
        Self {
            values: [0.0; N],
            next: 0,
            filled: 0,
            window: window.clamp(1, N),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Changes the window length; history is kept.
    pub fn set_window(&mut self, window: usize) {
        self.window = window.clamp(1, N);
    }

    pub fn update(&mut self, input: f32) {
        self.values[self.next] = input;
        self.next = (self.next + 1) % N;
        self.filled = (self.filled + 1).min(N);
    }

    pub fn average(&self) -> f32 {
        let n = self.filled.min(self.window);
        if n == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for k in 1..=n {
            sum += self.values[(self.next + N - k) % N];
        }
        sum / n as f32
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_partial_history() {
        let mut avg = RunningAverage::<20>::new(3);
        assert_eq!(avg.average(), 0.0);
        avg.update(3.0);
        assert_eq!(avg.average(), 3.0);
        avg.update(5.0);
        assert_eq!(avg.average(), 4.0);
    }

    #[test]
    fn only_the_window_counts() {
        let mut avg = RunningAverage::<20>::new(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            avg.update(v);
        }
        assert_eq!(avg.average(), 2.0);

        avg.set_window(4);
        assert_eq!(avg.average(), 26.5);
    }

    #[test]
    fn wraps_around_capacity() {
        let mut avg = RunningAverage::<4>::new(10);
        assert_eq!(avg.window(), 4);
        for v in 0..10 {
            avg.update(v as f32);
        }
        assert_eq!(avg.average(), (6.0 + 7.0 + 8.0 + 9.0) / 4.0);
    }
}
