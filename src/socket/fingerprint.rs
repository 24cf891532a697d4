//! Per-destination TCP fingerprint state
//!
//! Every destination address gets its own fabricated flow state so crafted
//! packets look like segments of one ongoing TCP connection: a random
//! initial sequence advancing by MSS per packet, a fixed plausible window,
//! TTL and TOS chosen once per flow, millisecond TCP timestamps with
//! jitter, and a cycling set of header flag profiles.

use std::time::Instant;

use rand::Rng;

use crate::protocol::TcpFlags;

/// Conventional MSS used for the sequence arithmetic.
pub const MSS: u32 = 1460;

/// TOS values seen on ordinary traffic: default, low-delay, throughput.
const TOS_CHOICES: [u8; 3] = [0x00, 0x10, 0x08];

/// Header values for one crafted packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketFingerprint {
    /// Sequence number
    pub seq: u32,
    /// Acknowledgement number
    pub ack: u32,
    /// Advertised window
    pub window: u16,
    /// IP TTL / hop limit
    pub ttl: u8,
    /// IP TOS / traffic class
    pub tos: u8,
    /// Header flags
    pub flags: TcpFlags,
    /// TCP timestamp value (TSval)
    pub ts_val: u32,
    /// TCP timestamp echo (TSecr)
    pub ts_ecr: u32,
    /// IPv4 identification
    pub ip_id: u16,
}

/// Fabricated TCP flow state for one destination.
#[derive(Debug)]
pub struct FlowState {
    base_seq: u32,
    ack_seq: u32,
    counter: u32,
    window: u16,
    ttl: u8,
    tos: u8,
    ts_epoch: Instant,
    ts_base: u32,
    flags: Vec<TcpFlags>,
    flag_idx: usize,
    ip_id: u16,
}

impl FlowState {
    /// Create flow state with the given flag-profile cycle.
    pub fn new(flags: Vec<TcpFlags>) -> Self {
        let mut rng = rand::thread_rng();
        let flags = if flags.is_empty() {
            vec![TcpFlags::psh_ack(), TcpFlags::ack_only()]
        } else {
            flags
        };
        FlowState {
            base_seq: rng.gen(),
            ack_seq: rng.gen(),
            counter: 0,
            window: rng.gen_range(64240..=65535),
            ttl: rng.gen_range(60..=68),
            tos: TOS_CHOICES[rng.gen_range(0..TOS_CHOICES.len())],
            ts_epoch: Instant::now(),
            ts_base: rng.gen(),
            flags,
            flag_idx: 0,
            ip_id: rng.gen(),
        }
    }

    /// Replace the flag cycle, e.g. after a peer advertisement.
    pub fn set_flags(&mut self, flags: Vec<TcpFlags>) {
        if !flags.is_empty() {
            self.flags = flags;
            self.flag_idx = 0;
        }
    }

    /// Produce the header values for the next crafted packet.
    ///
    /// Non-SYN sequence numbers form the arithmetic sequence
    /// `base + counter * MSS`; a SYN gets a fully random sequence because
    /// real stacks randomize their ISNs.
    pub fn next(&mut self) -> PacketFingerprint {
        let mut rng = rand::thread_rng();

        let flags = self.flags[self.flag_idx % self.flags.len()];
        self.flag_idx = (self.flag_idx + 1) % self.flags.len();

        self.counter = self.counter.wrapping_add(1);
        let seq = if flags.syn {
            rng.gen()
        } else {
            self.base_seq.wrapping_add(self.counter.wrapping_mul(MSS))
        };

        // The peer plausibly sent about as much as we did.
        let ack = self.ack_seq.wrapping_add(self.counter.wrapping_mul(MSS));

        // Millisecond timestamp clock with +-10ms jitter; the echo lags a
        // plausible 50-250ms behind.
        let elapsed = self.ts_epoch.elapsed().as_millis() as u32;
        let jitter = rng.gen_range(0..=20);
        let ts_val = self
            .ts_base
            .wrapping_add(elapsed)
            .wrapping_add(jitter)
            .wrapping_sub(10);
        let ts_ecr = ts_val.wrapping_sub(rng.gen_range(50..=250));

        self.ip_id = self.ip_id.wrapping_add(1);

        PacketFingerprint {
            seq,
            ack,
            window: self.window,
            ttl: self.ttl,
            tos: self.tos,
            flags,
            ts_val,
            ts_ecr,
            ip_id: self.ip_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_syn_seq_is_arithmetic() {
        let mut flow = FlowState::new(vec![TcpFlags::psh_ack()]);
        let first = flow.next().seq;
        let mut prev = first;
        for _ in 0..100 {
            let seq = flow.next().seq;
            assert_eq!(seq.wrapping_sub(prev), MSS);
            prev = seq;
        }
    }

    #[test]
    fn test_syn_seq_is_random() {
        let mut flow = FlowState::new(vec![TcpFlags {
            syn: true,
            ..Default::default()
        }]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(flow.next().seq);
        }
        assert!(seen.len() >= 95, "SYN sequences should not repeat");
    }

    #[test]
    fn test_flow_constants_in_range() {
        for _ in 0..200 {
            let mut flow = FlowState::new(vec![]);
            let fp = flow.next();
            assert!(fp.window >= 64240);
            assert!((60..=68).contains(&fp.ttl));
            assert!(TOS_CHOICES.contains(&fp.tos));
        }
    }

    #[test]
    fn test_flag_cycle() {
        let cycle = vec![TcpFlags::psh_ack(), TcpFlags::ack_only()];
        let mut flow = FlowState::new(cycle.clone());
        for i in 0..10 {
            let fp = flow.next();
            assert_eq!(fp.flags, cycle[i % 2]);
        }
    }

    #[test]
    fn test_set_flags_resets_cycle() {
        let mut flow = FlowState::new(vec![TcpFlags::psh_ack(), TcpFlags::ack_only()]);
        flow.next();
        flow.set_flags(vec![TcpFlags::ack_only()]);
        for _ in 0..5 {
            assert_eq!(flow.next().flags, TcpFlags::ack_only());
        }
        // Empty advertisement keeps the existing cycle.
        flow.set_flags(vec![]);
        assert_eq!(flow.next().flags, TcpFlags::ack_only());
    }

    #[test]
    fn test_ts_ecr_lags_ts_val() {
        let mut flow = FlowState::new(vec![]);
        for _ in 0..50 {
            let fp = flow.next();
            let lag = fp.ts_val.wrapping_sub(fp.ts_ecr);
            assert!((50..=250).contains(&lag), "lag {} out of range", lag);
        }
    }
}
