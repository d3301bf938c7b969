//! Reliable and unreliable dispatch to the delivery queue.
//!
//! Dispatch moves runs of deliverable commands from a channel's incoming
//! queues onto the peer's `dispatched_commands` and marks the peer for the
//! host's dispatch queue. The unreliable scan additionally destroys commands
//! stranded under stale reliable baselines.

use std::ops::Range;

use relink_core::constants::PEER_FREE_RELIABLE_WINDOWS;

use crate::peer::Peer;

impl Peer {
    /// Advances the channel's reliable baseline through every contiguous,
    /// fully reassembled command and splices the run onto the delivery queue.
    ///
    /// A fragmented command advances the baseline past its whole run, so the
    /// next expected sequence number lands after the fragments it consumed.
    pub(crate) fn dispatch_incoming_reliable_commands(&mut self, channel_index: usize) {
        let channel = &mut self.channels[channel_index];

        let mut next_sequence_number = channel.incoming_reliable_sequence_number;
        let mut run_length = 0usize;
        for incoming in &channel.incoming_reliable_commands {
            if incoming.fragments_remaining > 0
                || incoming.reliable_sequence_number != next_sequence_number.wrapping_add(1)
            {
                break;
            }
            next_sequence_number = incoming.reliable_sequence_number;
            if incoming.fragment_count > 0 {
                next_sequence_number =
                    next_sequence_number.wrapping_add(incoming.fragment_count as u16 - 1);
            }
            run_length += 1;
        }

        if run_length == 0 {
            return;
        }

        channel.incoming_reliable_sequence_number = next_sequence_number;
        channel.incoming_unreliable_sequence_number = 0;

        let run = channel.incoming_reliable_commands.drain(..run_length);
        self.dispatched_commands.extend(run);
        self.needs_dispatch = true;

        if !self.channels[channel_index].incoming_unreliable_commands.is_empty() {
            self.dispatch_incoming_unreliable_commands(channel_index, None);
        }
    }

    /// Scans the unreliable queue for deliverable runs.
    ///
    /// Commands at the current reliable baseline advance the unreliable
    /// sequence number; commands under stale baselines are destroyed; a
    /// command within the free reliable window horizon halts the scan.
    /// Unsequenced commands ride along inside whatever run surrounds them,
    /// and `protect` (the index of a command queued by the caller) is never
    /// destroyed by the stale sweep.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        channel_index: usize,
        protect: Option<usize>,
    ) {
        let channel = &mut self.channels[channel_index];
        let queue_length = channel.incoming_unreliable_commands.len();

        let mut moves: Vec<Range<usize>> = Vec::new();
        let mut run_start = 0usize;
        let mut dropped = 0usize;
        let mut index = 0usize;

        while index < queue_length {
            let incoming = &channel.incoming_unreliable_commands[index];

            if incoming.is_unsequenced() {
                index += 1;
                continue;
            }

            if incoming.reliable_sequence_number == channel.incoming_reliable_sequence_number {
                if incoming.fragments_remaining == 0 {
                    channel.incoming_unreliable_sequence_number =
                        incoming.unreliable_sequence_number;
                    index += 1;
                    continue;
                }

                // Incomplete reassembly at the baseline: flush the run
                // before it and leave it queued.
                if run_start != index {
                    moves.push(run_start..index);
                    dropped = index;
                } else if dropped != index {
                    dropped = index - 1;
                }
            } else {
                let reliable_window = channel.incoming_window_of(incoming.reliable_sequence_number);
                let current_window = channel.current_incoming_window();
                if reliable_window >= current_window
                    && reliable_window < current_window + PEER_FREE_RELIABLE_WINDOWS - 1
                {
                    // A future baseline we may still reach: stop here.
                    break;
                }

                dropped = index + 1;
                if run_start != index {
                    moves.push(run_start..index);
                }
            }

            run_start = index + 1;
            index += 1;
        }

        if run_start != index {
            moves.push(run_start..index);
            dropped = index;
        }

        if moves.is_empty() && dropped == 0 {
            return;
        }
        if !moves.is_empty() {
            self.needs_dispatch = true;
        }

        let queue = std::mem::take(&mut channel.incoming_unreliable_commands);
        let mut move_ranges = moves.iter();
        let mut current_move = move_ranges.next();
        for (position, command) in queue.into_iter().enumerate() {
            while let Some(range) = current_move {
                if position < range.end {
                    break;
                }
                current_move = move_ranges.next();
            }

            let moved = current_move.map(|range| range.contains(&position)).unwrap_or(false);
            if moved {
                self.dispatched_commands.push_back(command);
            } else if position < dropped && protect != Some(position) {
                // Stranded under a stale reliable baseline.
                drop(command);
            } else {
                self.channels[channel_index].incoming_unreliable_commands.push_back(command);
            }
        }
    }
}
