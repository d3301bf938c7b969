//! Packet throttle state and adjustment law.
//!
//! The throttle is a survival probability for unreliable payloads, expressed
//! in 1/32 units. It rises while measured RTTs stay at or below the last
//! epoch's baseline and falls when they exceed baseline by more than twice
//! its variance. The host bandwidth throttle caps it via `limit`.

use relink_core::constants::{
    PEER_DEFAULT_PACKET_THROTTLE, PEER_PACKET_THROTTLE_ACCELERATION,
    PEER_PACKET_THROTTLE_DECELERATION, PEER_PACKET_THROTTLE_INTERVAL, PEER_PACKET_THROTTLE_SCALE,
};

/// Dynamic throttle applied to unreliable payload commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketThrottle {
    /// Current throttle in `[0, PEER_PACKET_THROTTLE_SCALE]`.
    pub value: u32,
    /// Upper bound imposed by the host bandwidth throttle.
    pub limit: u32,
    /// Counter cycled per unreliable payload send to decide drops.
    pub counter: u32,
    /// Start of the current RTT measurement epoch.
    pub epoch: u32,
    /// Step applied when RTT improves.
    pub acceleration: u32,
    /// Step applied when RTT degrades.
    pub deceleration: u32,
    /// Epoch length in milliseconds.
    pub interval: u32,
}

impl Default for PacketThrottle {
    fn default() -> Self {
        Self {
            value: PEER_DEFAULT_PACKET_THROTTLE,
            limit: PEER_PACKET_THROTTLE_SCALE,
            counter: 0,
            epoch: 0,
            acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
            deceleration: PEER_PACKET_THROTTLE_DECELERATION,
            interval: PEER_PACKET_THROTTLE_INTERVAL,
        }
    }
}

impl PacketThrottle {
    /// Adjusts the throttle for a fresh RTT measurement against the last
    /// epoch's baseline. Returns +1 on acceleration, -1 on deceleration,
    /// 0 when the sample is inconclusive.
    pub fn adjust(&mut self, rtt: u32, last_rtt: u32, last_rtt_variance: u32) -> i32 {
        if last_rtt <= last_rtt_variance {
            self.value = self.limit;
        } else if rtt <= last_rtt {
            self.value = (self.value + self.acceleration).min(self.limit);
            return 1;
        } else if rtt > last_rtt + 2 * last_rtt_variance {
            self.value = self.value.saturating_sub(self.deceleration);
            return -1;
        }
        0
    }

    /// Applies a THROTTLE_CONFIGURE record.
    pub fn configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.interval = interval;
        self.acceleration = acceleration;
        self.deceleration = deceleration;
    }
}
