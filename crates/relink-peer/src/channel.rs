//! Per-channel sequencing state and reliable window bookkeeping.

use std::collections::VecDeque;

use relink_core::constants::{PEER_RELIABLE_WINDOWS, PEER_RELIABLE_WINDOW_SIZE};

use crate::command_queue::IncomingCommand;

/// Returns the reliable window a sequence number falls into.
#[inline]
pub fn reliable_window(sequence_number: u16) -> u16 {
    sequence_number / PEER_RELIABLE_WINDOW_SIZE
}

/// Independent ordering context for one channel of a connection.
///
/// Reliable sequence space is divided into 16 windows of 4096; the window
/// table counts in-flight commands per window so the sender can refuse to
/// wrap into occupied windows.
#[derive(Debug, Default)]
pub struct Channel {
    /// Next reliable sequence number to assign, pre-increment.
    pub outgoing_reliable_sequence_number: u16,
    /// Next unreliable sequence number to assign, pre-increment.
    pub outgoing_unreliable_sequence_number: u16,
    /// Bitmap of windows with in-flight reliable commands.
    pub used_reliable_windows: u16,
    /// In-flight reliable command count per window.
    pub reliable_windows: [u16; PEER_RELIABLE_WINDOWS as usize],
    /// Highest reliable sequence number delivered in order.
    pub incoming_reliable_sequence_number: u16,
    /// Highest unreliable sequence number delivered under the current
    /// reliable baseline.
    pub incoming_unreliable_sequence_number: u16,
    /// Out-of-order or partially reassembled reliable arrivals, in
    /// sequence order.
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    /// Pending unreliable arrivals, in (reliable, unreliable) order.
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    /// Creates a channel with all sequence state cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifts a sequence number's window index into the next wrap when the
    /// number sits numerically below the channel's incoming baseline.
    pub fn incoming_window_of(&self, sequence_number: u16) -> u16 {
        let mut window = reliable_window(sequence_number);
        if sequence_number < self.incoming_reliable_sequence_number {
            window += PEER_RELIABLE_WINDOWS;
        }
        window
    }

    /// Current window of the incoming reliable baseline.
    pub fn current_incoming_window(&self) -> u16 {
        reliable_window(self.incoming_reliable_sequence_number)
    }

    /// Records retirement of an in-flight reliable command from a window.
    pub fn retire_reliable(&mut self, sequence_number: u16) {
        let window = reliable_window(sequence_number);
        if self.reliable_windows[window as usize] > 0 {
            self.reliable_windows[window as usize] -= 1;
            if self.reliable_windows[window as usize] == 0 {
                self.used_reliable_windows &= !(1 << window);
            }
        }
    }

    /// Records the first transmission of a reliable command into a window.
    pub fn occupy_reliable(&mut self, sequence_number: u16) {
        let window = reliable_window(sequence_number);
        self.used_reliable_windows |= 1 << window;
        self.reliable_windows[window as usize] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_occupancy_round_trip() {
        let mut channel = Channel::new();
        channel.occupy_reliable(1);
        channel.occupy_reliable(2);
        assert_eq!(channel.reliable_windows[0], 2);
        assert_eq!(channel.used_reliable_windows & 1, 1);

        channel.retire_reliable(1);
        assert_eq!(channel.reliable_windows[0], 1);
        assert_eq!(channel.used_reliable_windows & 1, 1);

        channel.retire_reliable(2);
        assert_eq!(channel.reliable_windows[0], 0);
        assert_eq!(channel.used_reliable_windows, 0);
    }

    #[test]
    fn test_incoming_window_lifts_across_wrap() {
        let mut channel = Channel::new();
        channel.incoming_reliable_sequence_number = 0xF000;
        // A small sequence number is interpreted in the next wrap.
        assert_eq!(channel.incoming_window_of(0x0001), PEER_RELIABLE_WINDOWS);
        assert_eq!(channel.incoming_window_of(0xF001), 15);
        assert_eq!(channel.current_incoming_window(), 15);
    }

    #[test]
    fn test_retire_ignores_empty_window() {
        let mut channel = Channel::new();
        channel.retire_reliable(5);
        assert_eq!(channel.reliable_windows[0], 0);
        assert_eq!(channel.used_reliable_windows, 0);
    }
}
