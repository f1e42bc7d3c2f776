//! Transport counters and the derived health state.

use std::time::Duration;

use tokio::time::Instant;

/// Coarse transport condition derived from [`TransportStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A point-in-time snapshot of the transport counters.
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub messages_sent:     u64,
    pub messages_received: u64,
    pub errors:            u64,
    pub reconnects:        u64,
    pub queue_depth:       usize,
    pub connected:         bool,
    pub avg_response:      Option<Duration>,
    pub since_last_ping:   Option<Duration>,
    pub since_last_pong:   Option<Duration>,
}

impl TransportStats {
    pub fn error_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            return 0.0;
        }
        self.errors as f64 / self.messages_sent as f64
    }

    /// Health policy: not connected or starved of pongs or mostly failing
    /// is unhealthy; slow or noticeably failing is degraded.
    pub fn health(&self, ping_interval: Duration) -> Health {
        if !self.connected {
            return Health::Unhealthy;
        }
        let pong_gap = match (self.since_last_ping, self.since_last_pong) {
            (_, Some(gap)) => Some(gap),
            (Some(gap), None) => Some(gap),
            (None, None) => None,
        };
        if let Some(gap) = pong_gap {
            if gap > ping_interval * 2 {
                return Health::Unhealthy;
            }
        }
        let error_rate = self.error_rate();
        if error_rate > 0.5 {
            return Health::Unhealthy;
        }
        if error_rate > 0.1 || self.avg_response > Some(Duration::from_secs(5)) {
            return Health::Degraded;
        }
        Health::Healthy
    }
}

/// Mutable counter state owned by the driver, snapshotted on demand.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub messages_sent:     u64,
    pub messages_received: u64,
    pub errors:            u64,
    pub responses:         u64,
    pub total_response:    Duration,
    pub last_ping:         Option<Instant>,
    pub last_pong:         Option<Instant>,
    pub queue_depth:       usize,
    pub reconnects:        u64,
    pub connected:         bool,
}

impl StatsInner {
    pub(crate) fn record_response(&mut self, elapsed: Duration) {
        self.responses += 1;
        self.total_response += elapsed;
    }

    pub(crate) fn snapshot(&self, now: Instant) -> TransportStats {
        TransportStats {
            messages_sent:     self.messages_sent,
            messages_received: self.messages_received,
            errors:            self.errors,
            reconnects:        self.reconnects,
            queue_depth:       self.queue_depth,
            connected:         self.connected,
            avg_response:      (self.responses > 0)
                .then(|| self.total_response / self.responses as u32),
            since_last_ping:   self.last_ping.map(|at| now.duration_since(at)),
            since_last_pong:   self.last_pong.map(|at| now.duration_since(at)),
        }
    }
}
