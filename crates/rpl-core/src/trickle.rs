//! Trickle timer (RFC 6206) in 100 ms ticks, driving DIO transmission

use rand::Rng;
use rand::rngs::SmallRng;

/// Upper clamp for interval values so doubling cannot overflow.
pub const TRICKLE_TIME_MAX: u32 = 0x7FFF_FFFF;

/// Trickle parameters, derived from the DODAG configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrickleParams {
    /// Minimum interval in ticks
    pub imin: u32,
    /// Maximum interval in ticks
    pub imax: u32,
    /// Redundancy constant; 0 disables suppression (RFC 6550 §8.3.1)
    pub k: u8,
}

impl TrickleParams {
    /// Convert DIO interval configuration (RFC 6550 §6.7.6: interval min as
    /// a power-of-two of milliseconds, plus doublings) into tick params.
    pub fn from_dio_config(
        dio_interval_min: u8,
        dio_interval_doublings: u8,
        dio_redundancy_constant: u8,
    ) -> Self {
        let imin_ms: u64 = if dio_interval_min < 32 {
            1u64 << dio_interval_min
        } else {
            u32::MAX as u64
        };
        let exp = dio_interval_min as u32 + dio_interval_doublings as u32;
        let imax_ms: u64 = if exp < 32 { 1u64 << exp } else { u32::MAX as u64 };
        let to_ticks = |ms: u64| -> u32 { (ms.div_ceil(100)).min(TRICKLE_TIME_MAX as u64) as u32 };
        TrickleParams {
            imin: to_ticks(imin_ms).max(1),
            imax: to_ticks(imax_ms).max(1),
            k: dio_redundancy_constant,
        }
    }
}

/// A running Trickle timer. Advanced by [`TrickleTimer::tick`]; returns
/// whether the caller should transmit.
#[derive(Debug, Clone)]
pub struct TrickleTimer {
    /// Current interval length in ticks
    i: u32,
    /// Ticks elapsed within the current interval
    now: u32,
    /// Transmission point within the interval
    t: u32,
    /// Consistency counter
    pub c: u8,
    transmitted: bool,
    running: bool,
}

impl TrickleTimer {
    pub fn stopped() -> Self {
        TrickleTimer {
            i: 0,
            now: 0,
            t: 0,
            c: 0,
            transmitted: false,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// (Re)start with a fresh minimal interval.
    pub fn start(&mut self, params: &TrickleParams, rng: &mut SmallRng) {
        self.running = true;
        self.i = params.imin;
        self.begin_interval(rng);
    }

    fn begin_interval(&mut self, rng: &mut SmallRng) {
        self.now = 0;
        self.c = 0;
        self.transmitted = false;
        // t picked from [I/2, I)
        let half = (self.i / 2).max(1);
        self.t = rng.random_range(half..self.i.max(half + 1));
    }

    /// Record a consistent reception.
    pub fn consistent_heard(&mut self) {
        self.c = self.c.saturating_add(1);
    }

    /// Record an inconsistency: reset to the minimal interval unless
    /// already there.
    pub fn inconsistent_heard(&mut self, params: &TrickleParams, rng: &mut SmallRng) {
        if !self.running || self.i != params.imin {
            self.running = true;
            self.i = params.imin;
            self.begin_interval(rng);
        }
    }

    /// Advance by `ticks`; returns true when a transmission is due now.
    pub fn tick(&mut self, params: &TrickleParams, ticks: u32, rng: &mut SmallRng) -> bool {
        if !self.running {
            return false;
        }
        self.now = self.now.saturating_add(ticks);
        let mut transmit = false;
        if !self.transmitted && self.now >= self.t {
            self.transmitted = true;
            if params.k == 0 || self.c < params.k {
                transmit = true;
            }
        }
        if self.now >= self.i {
            // interval expired: double up to Imax
            self.i = self.i.saturating_mul(2).min(params.imax).max(params.imin);
            self.begin_interval(rng);
        }
        transmit
    }
}
