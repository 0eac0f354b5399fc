/// What to do after a heartbeat could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Keep,
    Abandon,
}

/// Counts consecutive heartbeat sends that failed because the channel was
/// no longer writable.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            missed: 0,
        }
    }

    pub fn record_sent(&mut self) {
        self.missed = 0;
    }

    pub fn record_missed(&mut self) -> HeartbeatVerdict {
        self.missed += 1;
        if self.missed >= self.max_missed {
            HeartbeatVerdict::Abandon
        } else {
            HeartbeatVerdict::Keep
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abandons_after_consecutive_misses() {
        let mut monitor = HeartbeatMonitor::new(3);
        assert_eq!(monitor.record_missed(), HeartbeatVerdict::Keep);
        assert_eq!(monitor.record_missed(), HeartbeatVerdict::Keep);
        assert_eq!(monitor.record_missed(), HeartbeatVerdict::Abandon);
        assert_eq!(monitor.missed(), 3);
    }

    #[test]
    fn test_successful_send_resets_count() {
        let mut monitor = HeartbeatMonitor::new(3);
        monitor.record_missed();
        monitor.record_missed();
        monitor.record_sent();
        assert_eq!(monitor.record_missed(), HeartbeatVerdict::Keep);
        assert_eq!(monitor.missed(), 1);
    }
}
