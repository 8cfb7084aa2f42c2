//! The decompression side: per-CID contexts for the ROHCv2 IP-only
//! profile, the RFC 3095 generic IP profile and the TCP profile.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};

use crate::{cid, Config, Error};

pub mod rfc3095;
pub mod rfc5225;
pub mod tcp;

/// Packet type octet of an IR packet (RFC 3095 allows the D bit clear).
pub const ROHC_IR: u8 = 0xfd;
pub const ROHC_IR_NO_DYN: u8 = 0xfc;
/// Packet type octet of an IR-DYN packet.
pub const ROHC_IR_DYN: u8 = 0xf8;

/// The profiles the decompressor can bind to a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
	/// ROHCv2 IP-only (RFC 5225, 0x0104).
	Rfc5225Ip,
	/// RFC 3095 generic IP-only (0x0004).
	Rfc3095Ip,
	/// TCP (0x0006).
	Tcp,
}

/// What a profile decode pass produced. `NeedReparse` never escapes to
/// the caller: the dispatcher retries exactly once.
pub(crate) enum Outcome {
	Done(usize),
	NeedReparse,
}

#[derive(Clone)]
enum Ctxt {
	Rfc5225(rfc5225::Context),
	Rfc3095(rfc3095::Context),
	Tcp(tcp::Context),
}

/// The ROHC decompressor: a store of per-CID contexts, each bound to a
/// profile by [`Decompressor::create`].
#[derive(Clone)]
pub struct Decompressor {
	cfg: Config,
	contexts: HashMap<u16, Ctxt>,
}

impl Decompressor {
	pub fn new(cfg: Config) -> Self {
		Self { cfg, contexts: HashMap::new() }
	}

	/// Bind `cid` to a profile. An existing context is replaced.
	pub fn create(&mut self, cid: u16, profile: Profile) -> Result<(), Error> {
		if cid > self.cfg.max_cid {
			return Err(Error::Unsupported);
		}
		let ctxt = match profile {
			Profile::Rfc5225Ip => Ctxt::Rfc5225(rfc5225::Context::new()),
			Profile::Rfc3095Ip => Ctxt::Rfc3095(rfc3095::Context::new()),
			Profile::Tcp => Ctxt::Tcp(tcp::Context::new()),
		};
		self.contexts.insert(cid, ctxt);
		Ok(())
	}

	pub fn destroy(&mut self, cid: u16) {
		self.contexts.remove(&cid);
	}

	/// The sequence number reference of the context, for feedback.
	pub fn msn(&self, cid: u16) -> Option<u16> {
		self.contexts.get(&cid).map(|c| match c {
			Ctxt::Rfc5225(c) => c.msn(),
			Ctxt::Rfc3095(c) => c.sn(),
			Ctxt::Tcp(c) => c.msn(),
		})
	}

	/// Decompress one ROHC packet into `out`; returns the length of the
	/// rebuilt uncompressed packet.
	pub fn decompress(
		&mut self,
		now: Duration,
		packet: &[u8],
		out: &mut [u8],
	) -> Result<usize, Error> {
		let (cid, layout) = cid::decode(packet, self.cfg.cid_type)?;
		let Some(ctxt) = self.contexts.get_mut(&cid) else {
			warn!("no context for CID {cid}");
			return Err(Error::NoContext);
		};

		let first_byte = packet[layout.first_byte];
		let chained = matches!(first_byte, ROHC_IR | ROHC_IR_NO_DYN | ROHC_IR_DYN);

		// CO headers are written contiguously from the packet-type octet
		// on, skipping over any large-CID bytes; stitch the two pieces
		// back together before parsing.
		let scratch;
		let co_view: &[u8] = if chained || layout.after_cid == layout.first_byte + 1 {
			&packet[layout.first_byte..]
		} else {
			let mut v = Vec::with_capacity(1 + packet.len() - layout.after_cid);
			v.push(first_byte);
			v.extend_from_slice(&packet[layout.after_cid..]);
			scratch = v;
			&scratch
		};

		let mut reparsed = false;
		loop {
			let outcome = match ctxt {
				Ctxt::Rfc5225(c) => c.decode(&self.cfg, packet, layout, co_view, out),
				Ctxt::Rfc3095(c) => c.decode(now, packet, layout, co_view, out),
				Ctxt::Tcp(c) => c.decode(packet, layout, co_view, out),
			};
			match outcome {
				Ok(Outcome::Done(len)) => return Ok(len),
				Ok(Outcome::NeedReparse) if !reparsed => {
					debug!("reparsing the packet under the flipped assumption");
					reparsed = true;
				}
				Ok(Outcome::NeedReparse) => {
					warn!("packet asked for a second reparse");
					return Err(Error::Malformed);
				}
				Err(e) => return Err(e),
			}
		}
	}
}
