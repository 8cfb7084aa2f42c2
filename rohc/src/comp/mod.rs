//! The compression side: per-CID contexts, the IR/FO/SO state machine
//! and the ROHCv2 IP-only profile.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use rand::RngCore;

use crate::{Config, Error};

pub mod rfc5225;

/// Packets to send in IR state before graduating. The MSN travels in
/// full inside every IR, so a single one establishes the context.
pub const MAX_IR_COUNT: u32 = 1;
/// Packets to send in FO state before graduating.
pub const MAX_FO_COUNT: u32 = 3;

/// U-mode periodic refresh thresholds: go back down after this many
/// packets or this much time without a refresh.
const REFRESH_IR_PACKETS: u32 = 1700;
const REFRESH_FO_PACKETS: u32 = 700;
const REFRESH_IR_PERIOD: Duration = Duration::from_secs(30);
const REFRESH_FO_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	/// Initialization and Refresh: full static + dynamic chains.
	Ir,
	/// First Order: CO packets carrying at least a 7-bit CRC.
	Fo,
	/// Second Order: the smallest format available.
	So,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Unidirectional,
	Optimistic,
	Reliable,
}

/// The per-context operating state shared by compression profiles.
#[derive(Debug, Clone)]
pub struct Machine {
	pub state: State,
	pub mode: Mode,
	ir_count: u32,
	fo_count: u32,
	so_count: u32,
	pub num_sent: u64,
	go_back_ir_count: u32,
	go_back_fo_count: u32,
	last_ir_time: Duration,
	last_fo_time: Duration,
}

impl Machine {
	fn new(now: Duration) -> Self {
		Self {
			state: State::Ir,
			mode: Mode::Unidirectional,
			ir_count: 0,
			fo_count: 0,
			so_count: 0,
			num_sent: 0,
			go_back_ir_count: 0,
			go_back_fo_count: 0,
			last_ir_time: now,
			last_fo_time: now,
		}
	}

	pub(crate) fn change_state(&mut self, next: State) {
		if self.state != next {
			debug!("state {:?} -> {:?}", self.state, next);
			match next {
				State::Ir => self.ir_count = 0,
				State::Fo => self.fo_count = 0,
				State::So => self.so_count = 0,
			}
			self.state = next;
		}
	}

	/// Decide the state for the next packet: graduate on counters, then
	/// apply the U-mode periodic down-transitions.
	pub fn decide_state(&mut self, now: Duration) {
		let next = match self.state {
			State::Ir if self.ir_count >= MAX_IR_COUNT => State::So,
			State::Fo if self.fo_count >= MAX_FO_COUNT => State::So,
			other => other,
		};
		self.change_state(next);

		if self.mode == Mode::Unidirectional {
			self.periodic_down_transition(now);
		}
	}

	fn periodic_down_transition(&mut self, now: Duration) {
		self.go_back_ir_count += 1;
		self.go_back_fo_count += 1;

		if self.go_back_ir_count >= REFRESH_IR_PACKETS
			|| now.saturating_sub(self.last_ir_time) >= REFRESH_IR_PERIOD
		{
			debug!("periodic refresh: go back to IR");
			self.go_back_ir_count = 0;
			self.go_back_fo_count = 0;
			self.last_ir_time = now;
			self.last_fo_time = now;
			self.change_state(State::Ir);
		} else if self.state == State::So
			&& (self.go_back_fo_count >= REFRESH_FO_PACKETS
				|| now.saturating_sub(self.last_fo_time) >= REFRESH_FO_PERIOD)
		{
			debug!("periodic refresh: go back to FO");
			self.go_back_fo_count = 0;
			self.last_fo_time = now;
			self.change_state(State::Fo);
		}
	}

	/// Count one packet against the current state.
	pub fn bump(&mut self) {
		match self.state {
			State::Ir => self.ir_count += 1,
			State::Fo => self.fo_count += 1,
			State::So => self.so_count += 1,
		}
	}
}

/// The ROHC compressor: a store of per-CID flow contexts, all speaking
/// the ROHCv2 IP-only profile.
pub struct Compressor {
	cfg: Config,
	rng: Box<dyn RngCore>,
	contexts: HashMap<u16, rfc5225::Context>,
}

impl Compressor {
	pub fn new(cfg: Config) -> Self {
		Self::with_rng(cfg, rand::thread_rng())
	}

	/// Build a compressor drawing its MSN initialisation from `rng`.
	pub fn with_rng(cfg: Config, rng: impl RngCore + 'static) -> Self {
		Self { cfg, rng: Box::new(rng), contexts: HashMap::new() }
	}

	/// Whether the packet fits the ROHCv2 IP-only profile at all.
	pub fn check_profile(&self, packet: &[u8]) -> bool {
		rfc5225::check_profile(&self.cfg, packet)
	}

	/// Compress one packet for the flow at `cid`. Creates the context on
	/// first use. Writes the full ROHC packet (header + payload) into
	/// `out` and returns its length.
	pub fn compress(
		&mut self,
		cid: u16,
		now: Duration,
		packet: &[u8],
		out: &mut [u8],
	) -> Result<usize, Error> {
		if cid > self.cfg.max_cid {
			warn!("CID {cid} above the configured maximum {}", self.cfg.max_cid);
			return Err(Error::Unsupported);
		}

		if let Some(ctxt) = self.contexts.get_mut(&cid) {
			if !ctxt.check_context(packet) {
				warn!("packet does not belong to the context of CID {cid}");
				return Err(Error::ProfileMismatch);
			}
		} else {
			if !rfc5225::check_profile(&self.cfg, packet) {
				warn!("packet does not fit the IP-only profile");
				return Err(Error::ProfileMismatch);
			}
			let machine = Machine::new(now);
			let ctxt =
				rfc5225::Context::create(&self.cfg, packet, machine, self.rng.next_u32() as u16)?;
			debug!("created context for CID {cid}, initial MSN 0x{:04x}", ctxt.msn());
			self.contexts.insert(cid, ctxt);
		}

		let ctxt = self.contexts.get_mut(&cid).expect("context just ensured");
		ctxt.encode(&self.cfg, cid, now, packet, out)
	}

	/// Feedback is accepted and ignored: the engine runs in U-mode.
	pub fn feedback(&mut self, cid: u16, _data: &[u8]) {
		debug!("ignoring feedback for CID {cid}: U-mode only");
	}

	/// Drop the context for `cid`, if any.
	pub fn destroy(&mut self, cid: u16) {
		self.contexts.remove(&cid);
	}

	pub fn state(&self, cid: u16) -> Option<State> {
		self.contexts.get(&cid).map(|c| c.machine.state)
	}

	pub fn msn(&self, cid: u16) -> Option<u16> {
		self.contexts.get(&cid).map(|c| c.msn())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn graduates_ir_to_so() {
		let mut m = Machine::new(Duration::ZERO);
		assert_eq!(m.state, State::Ir);
		m.decide_state(Duration::from_millis(1));
		m.bump();
		assert_eq!(m.state, State::Ir);
		m.decide_state(Duration::from_millis(2));
		assert_eq!(m.state, State::So);
	}

	#[test]
	fn periodic_refresh_goes_back_to_ir() {
		let mut m = Machine::new(Duration::ZERO);
		m.decide_state(Duration::from_millis(1));
		m.bump();
		m.decide_state(Duration::from_millis(2));
		assert_eq!(m.state, State::So);

		// Long silence forces a full refresh.
		m.decide_state(Duration::from_secs(60));
		assert_eq!(m.state, State::Ir);
	}

	#[test]
	fn fo_graduates_after_enough_packets() {
		let mut m = Machine::new(Duration::ZERO);
		m.change_state(State::Fo);
		for i in 0..MAX_FO_COUNT {
			m.decide_state(Duration::from_millis(i as u64));
			assert_eq!(m.state, State::Fo);
			m.bump();
		}
		m.decide_state(Duration::from_millis(10));
		assert_eq!(m.state, State::So);
	}
}
