//! Segment acceptance checks.
//!
//! - [`TcpFsm`] - handshake-aware state machine, one per connection
//! - [`OptionChecker`] - MSS, window and SACK consistency, one entry per direction

use crate::capture::TcpSegment;

use super::Direction;

/// State of the acceptance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Closed,
    SynSent,
    Established,
    CloseWait,
    LastAck,
    Reset,
}

impl FsmState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Closed => "closed",
            FsmState::SynSent => "syn_sent",
            FsmState::Established => "established",
            FsmState::CloseWait => "close_wait",
            FsmState::LastAck => "last_ack",
            FsmState::Reset => "reset",
        }
    }
}

/// Simplified TCP state machine used to accept or reject segments.
///
/// `dir` remembers which side performed the last state-changing action (the
/// SYN sender while opening, the FIN sender while closing).
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state: FsmState,
    dir: Direction,
    allow_missing_init: bool,
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        Self {
            state: FsmState::Closed,
            dir: Direction::ToServer,
            allow_missing_init,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Check a segment travelling in `dir` and advance the state.
    ///
    /// Returns `false` when the segment is inconsistent with the current state.
    pub fn check(&mut self, seg: &TcpSegment, dir: Direction) -> bool {
        let f = seg.flags;

        if self.state == FsmState::Closed && self.allow_missing_init && !(f.syn && !f.ack) {
            self.dir = dir;
            self.state = FsmState::Established;
            return true;
        }

        match self.state {
            FsmState::Closed => {
                if f.syn && !f.ack {
                    self.dir = dir;
                    self.state = FsmState::SynSent;
                    return true;
                }
            }
            FsmState::SynSent => {
                if f.rst {
                    self.state = FsmState::Reset;
                    return true;
                }
                if f.syn && f.ack && dir == self.dir.reverse() {
                    self.state = FsmState::Established;
                    return true;
                }
                // SYN retransmission
                if f.syn && !f.ack && dir == self.dir {
                    return true;
                }
            }
            FsmState::Established => {
                if f.rst {
                    self.state = FsmState::Reset;
                    return true;
                }
                if f.fin {
                    self.state = FsmState::CloseWait;
                    self.dir = dir;
                }
                return true;
            }
            FsmState::CloseWait => {
                if f.rst {
                    self.state = FsmState::Reset;
                    return true;
                }
                if f.fin && f.ack && dir == self.dir.reverse() {
                    self.state = FsmState::LastAck;
                    return true;
                }
                if f.ack {
                    return true;
                }
            }
            FsmState::LastAck => {
                if f.ack && dir == self.dir {
                    self.state = FsmState::Closed;
                    return true;
                }
            }
            FsmState::Reset => {}
        }

        false
    }
}

/// Negotiated options of one direction.
#[derive(Debug, Clone, Copy)]
struct StreamOptions {
    /// Announced MSS, `-1` when unknown.
    mss: i32,
    /// Window scale shift, `-1` when unknown.
    scale: i32,
    receive_window: u64,
    sack_permitted: bool,
    syn_seen: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            mss: -1,
            scale: -1,
            receive_window: 0,
            sack_permitted: false,
            syn_seen: false,
        }
    }
}

/// Why a segment failed the option check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionViolation {
    /// Sequence number before the expected one.
    Reemitted { diff: i64 },
    /// Payload longer than the peer's MSS.
    ExceedsMss { length: usize, mss: i32 },
    /// Sequence number outside the peer's receive window.
    OutsideWindow { diff: i64, window: u64 },
    /// SACK block without SACK-permitted on the handshake.
    UnnegotiatedSack,
}

/// Per-direction TCP option consistency check.
#[derive(Debug, Clone, Default)]
pub struct OptionChecker {
    options: [StreamOptions; 2],
}

impl OptionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a segment against the expected next sequence number of its direction.
    pub fn check(
        &mut self,
        seg: &TcpSegment,
        payload_len: usize,
        dir: Direction,
        next_seq: Option<u32>,
    ) -> Result<(), OptionViolation> {
        let idx = dir.index();

        if seg.flags.syn {
            let opts = &mut self.options[idx];
            opts.mss = seg.options.mss.map(i32::from).unwrap_or(-1);
            opts.scale = seg.options.window_scale.map(i32::from).unwrap_or(-1);
            opts.sack_permitted = seg.options.sack_permitted;
            opts.syn_seen = true;
        } else {
            if seg.options.sack {
                let own = &self.options[idx];
                if own.syn_seen && !own.sack_permitted {
                    return Err(OptionViolation::UnnegotiatedSack);
                }
            }

            if let Some(next) = next_seq {
                let rev = &self.options[dir.reverse().index()];
                let diff = seg.seq.wrapping_sub(next) as i32 as i64;

                if diff == -1 && payload_len <= 1 {
                    // keep-alive
                } else if diff < 0 {
                    return Err(OptionViolation::Reemitted { diff });
                } else if rev.mss > 0 && payload_len > rev.mss as usize {
                    return Err(OptionViolation::ExceedsMss {
                        length: payload_len,
                        mss: rev.mss,
                    });
                } else if rev.receive_window != 0 && rev.scale < 0 && diff as u64 > rev.receive_window {
                    return Err(OptionViolation::OutsideWindow {
                        diff,
                        window: rev.receive_window,
                    });
                }
            }
        }

        let opts = &mut self.options[idx];
        opts.receive_window = u64::from(seg.window);
        if opts.scale > 0 {
            opts.receive_window <<= opts.scale as u32;
        }
        Ok(())
    }

    /// Exchange the two directions.
    pub fn swap(&mut self) {
        self.options.swap(0, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TcpFlags;

    fn seg(seq: u32, flags: TcpFlags) -> TcpSegment {
        TcpSegment::new(40000, 80, seq, flags)
    }

    // Test 1: Full handshake and close
    #[test]
    fn test_handshake_and_close() {
        let mut fsm = TcpFsm::new(false);

        assert!(fsm.check(&seg(100, TcpFlags::SYN), Direction::ToServer));
        assert_eq!(fsm.state(), FsmState::SynSent);
        assert!(fsm.check(&seg(100, TcpFlags::SYN), Direction::ToServer)); // retransmit
        assert!(fsm.check(&seg(500, TcpFlags::SYN_ACK), Direction::ToClient));
        assert_eq!(fsm.state(), FsmState::Established);
        assert!(fsm.check(&seg(101, TcpFlags::PSH_ACK), Direction::ToServer));

        assert!(fsm.check(&seg(110, TcpFlags::FIN_ACK), Direction::ToServer));
        assert_eq!(fsm.state(), FsmState::CloseWait);
        assert!(fsm.check(&seg(501, TcpFlags::FIN_ACK), Direction::ToClient));
        assert_eq!(fsm.state(), FsmState::LastAck);
        assert!(fsm.check(&seg(111, TcpFlags::ACK), Direction::ToServer));
        assert_eq!(fsm.state(), FsmState::Closed);
    }

    // Test 2: Data without handshake is rejected unless allowed
    #[test]
    fn test_missing_init() {
        let mut strict = TcpFsm::new(false);
        assert!(!strict.check(&seg(100, TcpFlags::PSH_ACK), Direction::ToServer));
        assert_eq!(strict.state(), FsmState::Closed);

        let mut lenient = TcpFsm::new(true);
        assert!(lenient.check(&seg(100, TcpFlags::PSH_ACK), Direction::ToServer));
        assert_eq!(lenient.state(), FsmState::Established);
    }

    // Test 3: SYN-ACK from the SYN sender is rejected
    #[test]
    fn test_syn_ack_wrong_direction() {
        let mut fsm = TcpFsm::new(false);
        fsm.check(&seg(100, TcpFlags::SYN), Direction::ToServer);
        assert!(!fsm.check(&seg(100, TcpFlags::SYN_ACK), Direction::ToServer));
        assert_eq!(fsm.state(), FsmState::SynSent);
    }

    // Test 4: Everything after RST is rejected
    #[test]
    fn test_reset() {
        let mut fsm = TcpFsm::new(true);
        assert!(fsm.check(&seg(100, TcpFlags::ACK), Direction::ToServer));
        assert!(fsm.check(&seg(100, TcpFlags::RST), Direction::ToClient));
        assert_eq!(fsm.state(), FsmState::Reset);
        assert!(!fsm.check(&seg(101, TcpFlags::ACK), Direction::ToServer));
    }

    // Test 5: Re-emitted segment and keep-alive
    #[test]
    fn test_option_reemitted_and_keepalive() {
        let mut checker = OptionChecker::new();

        let res = checker.check(&seg(90, TcpFlags::ACK), 10, Direction::ToServer, Some(100));
        assert_eq!(res, Err(OptionViolation::Reemitted { diff: -10 }));

        assert!(checker.check(&seg(99, TcpFlags::ACK), 1, Direction::ToServer, Some(100)).is_ok());
        assert!(checker.check(&seg(100, TcpFlags::ACK), 10, Direction::ToServer, Some(100)).is_ok());
    }

    // Test 6: Payload larger than the peer's MSS
    #[test]
    fn test_option_mss() {
        let mut checker = OptionChecker::new();
        let mut syn_ack = seg(500, TcpFlags::SYN_ACK);
        syn_ack.options.mss = Some(100);
        checker.check(&syn_ack, 0, Direction::ToClient, None).unwrap();

        let res = checker.check(&seg(101, TcpFlags::ACK), 200, Direction::ToServer, Some(101));
        assert_eq!(res, Err(OptionViolation::ExceedsMss { length: 200, mss: 100 }));
        assert!(checker.check(&seg(101, TcpFlags::ACK), 100, Direction::ToServer, Some(101)).is_ok());
    }

    // Test 7: SACK without SACK-permitted
    #[test]
    fn test_option_sack() {
        let mut checker = OptionChecker::new();
        checker.check(&seg(100, TcpFlags::SYN), 0, Direction::ToServer, None).unwrap();

        let mut sack = seg(101, TcpFlags::ACK);
        sack.options.sack = true;
        assert_eq!(
            checker.check(&sack, 0, Direction::ToServer, Some(101)),
            Err(OptionViolation::UnnegotiatedSack)
        );

        let mut permitted = OptionChecker::new();
        let mut syn = seg(100, TcpFlags::SYN);
        syn.options.sack_permitted = true;
        permitted.check(&syn, 0, Direction::ToServer, None).unwrap();
        assert!(permitted.check(&sack, 0, Direction::ToServer, Some(101)).is_ok());
    }

    // Test 8: Window check applies only without window scaling
    #[test]
    fn test_option_window() {
        let mut checker = OptionChecker::new();
        let mut syn_ack = seg(500, TcpFlags::SYN_ACK);
        syn_ack.window = 1000;
        checker.check(&syn_ack, 0, Direction::ToClient, None).unwrap();

        let res = checker.check(&seg(3101, TcpFlags::ACK), 10, Direction::ToServer, Some(101));
        assert_eq!(res, Err(OptionViolation::OutsideWindow { diff: 3000, window: 1000 }));
    }
}
