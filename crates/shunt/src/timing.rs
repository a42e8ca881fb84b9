use std::time::{Duration, Instant};

/// Paces periodic work inside the event loop. The first `fired` call after
/// construction reports true.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let due = self.last_acted.is_none_or(|t| t.elapsed() >= self.interval);
        if due {
            self.last_acted = Some(Instant::now());
        }
        due
    }
}
