use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::models::PliThrottleConfig;

struct ThrottleEntry {
    interval: Duration,
    last_sent: Option<Instant>,
}

/// Per-SSRC rate limit for forwarded keyframe requests. State is bounded by
/// the number of registered SSRCs; unregistered SSRCs always pass.
pub struct PliThrottle {
    config: PliThrottleConfig,
    entries: DashMap<u32, ThrottleEntry>,
}

impl PliThrottle {
    pub fn new(config: PliThrottleConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Registers an SSRC with the interval of its simulcast tier.
    pub fn add_track(&self, ssrc: u32, rid: &str) {
        let interval = match rid {
            "q" => self.config.low_quality,
            "h" => self.config.mid_quality,
            _ => self.config.high_quality,
        };
        self.entries.insert(
            ssrc,
            ThrottleEntry {
                interval,
                last_sent: None,
            },
        );
    }

    pub fn remove_track(&self, ssrc: u32) {
        self.entries.remove(&ssrc);
    }

    /// Reports whether a keyframe request for `ssrc` may be forwarded now,
    /// and records the send time when it may.
    pub fn can_send(&self, ssrc: u32) -> bool {
        let Some(mut entry) = self.entries.get_mut(&ssrc) else {
            return true;
        };
        match entry.last_sent {
            Some(at) if at.elapsed() < entry.interval => false,
            _ => {
                entry.last_sent = Some(Instant::now());
                true
            }
        }
    }
}
