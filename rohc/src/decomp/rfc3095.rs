//! The RFC 3095 generic decompressor, bound to the IP-only profile
//! (0x0004): IR, IR-DYN, UO-0, UO-1 and UOR-2 with extensions 0-3.
//!
//! Two header-change records exist per flow: `last` (committed) and
//! `active` (tentative). Parsing writes to a working copy of `active`;
//! only a packet whose CRC verifies is folded back. On CRC failure two
//! repair hypotheses are tried (SN LSB wraparound, incorrect SN update),
//! and a successful repair is held on probation for three packets.

use std::time::Duration;

use log::{debug, warn};
use net::{ipv4, ipv6, IpHeader, Protocol};
use utils::bytes::{Reader, Writer};
use utils::endian::swab16;

use super::{Outcome, ROHC_IR, ROHC_IR_DYN, ROHC_IR_NO_DYN};
use crate::cid::Layout;
use crate::wlsb::{IpIdRef, Lsb};
use crate::{crc, Error, PROFILE_RFC3095_IP};

/// Tentative or committed per-header state: the full header image plus
/// the RND and NBO properties of its IP-ID.
#[derive(Debug, Clone)]
struct HdrChanges {
	ip: IpHeader,
	rnd: bool,
	nbo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DState {
	NoContext,
	FullContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
	Uo0,
	Uo1,
	Uor2,
}

struct Decoded {
	hlen: usize,
	consumed: usize,
	calc_crc: u8,
	sn: u16,
	sn_k: u8,
	id: u16,
	id2: u16,
	work: Vec<HdrChanges>,
}

#[derive(Debug, Clone)]
pub struct Context {
	last: Vec<HdrChanges>,
	active: Vec<HdrChanges>,
	sn: Lsb,
	ip_id1: IpIdRef,
	ip_id2: IpIdRef,
	state: DState,
	/// Repair probation: 0 stable, 1-2 tentative.
	counter: u8,
	last_packet_time: Option<Duration>,
	current_packet_time: Duration,
	/// Smoothed inter-arrival time in microseconds.
	inter_arrival: u64,
}

impl Context {
	pub fn new() -> Self {
		Self {
			last: Vec::new(),
			active: Vec::new(),
			sn: Lsb::new(0),
			ip_id1: IpIdRef::new(0, 0),
			ip_id2: IpIdRef::new(0, 0),
			state: DState::NoContext,
			counter: 0,
			last_packet_time: None,
			current_packet_time: Duration::ZERO,
			inter_arrival: 0,
		}
	}

	pub fn sn(&self) -> u16 {
		self.sn.reference()
	}

	pub(crate) fn decode(
		&mut self,
		now: Duration,
		packet: &[u8],
		layout: Layout,
		co_view: &[u8],
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		self.current_packet_time = now;

		let first = packet[layout.first_byte];
		match first {
			ROHC_IR | ROHC_IR_NO_DYN => self.decode_ir(packet, layout, first & 0x01 != 0, out),
			ROHC_IR_DYN => self.decode_ir_dyn(packet, layout, out),
			_ if self.state == DState::NoContext => {
				warn!("non-IR packet in No Context state");
				Err(Error::NoContext)
			}
			b if b & 0x80 == 0 => self.decode_uo(PacketKind::Uo0, co_view, out),
			b if b >> 6 == 0b10 => self.decode_uo(PacketKind::Uo1, co_view, out),
			b if b >> 5 == 0b110 => self.decode_uor2(co_view, out),
			b => {
				warn!("unknown packet type 0x{b:02x}");
				Err(Error::Unsupported)
			}
		}
	}

	/// IR: profile, CRC-8, static chain for one or two IP headers, the
	/// dynamic chain when the D bit is set, then the 16-bit SN.
	fn decode_ir(
		&mut self,
		packet: &[u8],
		layout: Layout,
		dynamic: bool,
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		let mut r = Reader::new(&packet[layout.after_cid..]);

		if r.u8()? != PROFILE_RFC3095_IP as u8 {
			warn!("IR carries the wrong profile octet");
			return Err(Error::ProfileMismatch);
		}
		let crc_pos = layout.after_cid + r.pos();
		let packet_crc = r.u8()?;

		let mut work = vec![Self::parse_static_ip(&mut r)?];
		if work[0].ip.protocol().is_tunneling() {
			work.push(Self::parse_static_ip(&mut r)?);
		}

		if self.state == DState::FullContext {
			let same_shape = work.len() == self.last.len()
				&& work
					.iter()
					.zip(&self.last)
					.all(|(a, b)| a.ip.version() == b.ip.version());
			if !same_shape {
				warn!("IR static chain contradicts the context");
				return Err(Error::ProfileMismatch);
			}
		}

		let sn;
		if dynamic {
			for hdr in &mut work {
				Self::parse_dynamic_ip(&mut r, hdr)?;
			}
			sn = r.u16be()?;
		} else {
			if self.state != DState::FullContext {
				warn!("IR without a dynamic part before the context is established");
				return Err(Error::Malformed);
			}
			// Keep the committed dynamic fields under the fresh static ones.
			for (hdr, old) in work.iter_mut().zip(&self.last) {
				copy_dynamic(&mut hdr.ip, &old.ip);
				hdr.rnd = old.rnd;
				hdr.nbo = old.nbo;
			}
			sn = self.sn.reference();
		}

		let hdr_end = layout.after_cid + r.pos();
		let mut computed = crc::crc8(crc::CRC_INIT_8, &packet[..crc_pos]);
		computed = crc::crc8(computed, &[0]);
		computed = crc::crc8(computed, &packet[crc_pos + 1..hdr_end]);
		if computed != packet_crc {
			warn!("IR header CRC-8 mismatch (got 0x{packet_crc:02x}, computed 0x{computed:02x})");
			return Err(Error::Crc);
		}

		// Commit.
		self.active = work.clone();
		self.last = work;
		self.counter = 0;
		self.state = DState::FullContext;
		self.sn = Lsb::new(sn);
		self.update_ip_id_refs(sn);
		self.update_inter_packet();

		let payload = &packet[hdr_end..];
		let len = build_headers(&self.active, payload, out)?;
		Ok(Outcome::Done(len))
	}

	/// IR-DYN: profile, CRC-8, dynamic chains only, then the SN.
	fn decode_ir_dyn(
		&mut self,
		packet: &[u8],
		layout: Layout,
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		if self.state == DState::NoContext {
			warn!("IR-DYN before any IR established the static chain");
			return Err(Error::NoContext);
		}

		let mut r = Reader::new(&packet[layout.after_cid..]);
		if r.u8()? != PROFILE_RFC3095_IP as u8 {
			return Err(Error::ProfileMismatch);
		}
		let crc_pos = layout.after_cid + r.pos();
		let packet_crc = r.u8()?;

		let mut work = self.active.clone();
		for hdr in &mut work {
			Self::parse_dynamic_ip(&mut r, hdr)?;
		}
		let sn = r.u16be()?;

		let hdr_end = layout.after_cid + r.pos();
		let mut computed = crc::crc8(crc::CRC_INIT_8, &packet[..crc_pos]);
		computed = crc::crc8(computed, &[0]);
		computed = crc::crc8(computed, &packet[crc_pos + 1..hdr_end]);
		if computed != packet_crc {
			warn!("IR-DYN header CRC-8 mismatch");
			return Err(Error::Crc);
		}

		self.active = work.clone();
		self.last = work;
		self.counter = 0;
		self.sn = Lsb::new(sn);
		self.update_ip_id_refs(sn);
		self.update_inter_packet();

		let payload = &packet[hdr_end..];
		let len = build_headers(&self.active, payload, out)?;
		Ok(Outcome::Done(len))
	}

	/// The IP static part, RFC 3095 sections 5.7.7.3 and 5.7.7.4.
	fn parse_static_ip(r: &mut Reader) -> Result<HdrChanges, Error> {
		let version = r.peek()? >> 4;
		match version {
			4 => {
				r.skip(1)?;
				let protocol = Protocol::from(r.u8()?);
				let src = r.array::<4>()?.into();
				let dst = r.array::<4>()?.into();
				Ok(HdrChanges {
					ip: IpHeader::V4(ipv4::Header {
						tos: 0,
						id: 0,
						dont_fragment: false,
						ttl: 0,
						protocol,
						src,
						dst,
						total_len: 0,
						checksum: 0,
						is_fragment: false,
					}),
					rnd: false,
					nbo: true,
				})
			}
			6 => {
				let b0 = r.u8()?;
				let flow_label =
					((b0 as u32 & 0x0f) << 16) | (r.u8()? as u32) << 8 | r.u8()? as u32;
				let next_header = Protocol::from(r.u8()?);
				let src = r.array::<16>()?.into();
				let dst = r.array::<16>()?.into();
				Ok(HdrChanges {
					ip: IpHeader::V6(ipv6::Header {
						traffic_class: 0,
						flow_label,
						next_header,
						hop_limit: 0,
						src,
						dst,
						payload_len: 0,
					}),
					rnd: false,
					nbo: true,
				})
			}
			v => {
				warn!("wrong IP version {v} in the static chain");
				Err(Error::Malformed)
			}
		}
	}

	/// The IP dynamic part: TOS, TTL, IP-ID and the DF/RND/NBO flags for
	/// IPv4; TC and HL for IPv6.
	fn parse_dynamic_ip(r: &mut Reader, hdr: &mut HdrChanges) -> Result<(), Error> {
		match &mut hdr.ip {
			IpHeader::V4(v4) => {
				v4.tos = r.u8()?;
				v4.ttl = r.u8()?;
				v4.id = r.u16be()?;
				let flags = r.u8()?;
				v4.dont_fragment = flags & 0x80 != 0;
				hdr.rnd = flags & 0x40 != 0;
				hdr.nbo = flags & 0x20 != 0;
			}
			IpHeader::V6(v6) => {
				v6.traffic_class = r.u8()?;
				v6.hop_limit = r.u8()?;
			}
		}
		Ok(())
	}

	fn update_ip_id_refs(&mut self, sn: u16) {
		if let Some(IpHeader::V4(v4)) = self.active.first().map(|h| &h.ip) {
			self.ip_id1.update(v4.id, sn);
		}
		if let Some(IpHeader::V4(v4)) = self.active.get(1).map(|h| &h.ip) {
			self.ip_id2.update(v4.id, sn);
		}
	}

	fn update_inter_packet(&mut self) {
		let delta = self
			.last_packet_time
			.map(|last| self.current_packet_time.saturating_sub(last).as_micros() as u64)
			.unwrap_or(0);
		self.last_packet_time = Some(self.current_packet_time);

		self.inter_arrival = if self.inter_arrival != 0 {
			(self.inter_arrival >> 1) + (delta >> 1)
		} else {
			delta
		};
	}

	/// UO-0 and UO-1 share everything but the first two bytes.
	fn decode_uo(
		&mut self,
		kind: PacketKind,
		co: &[u8],
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		let mut r = Reader::new(co);
		let b0 = r.u8()?;

		let (sn_bits, sn_k, id_bits, id_k, real_crc) = match kind {
			PacketKind::Uo0 => ((b0 >> 3) as u16 & 0x0f, 4u8, 0u16, 0u8, b0 & 0x07),
			PacketKind::Uo1 => {
				let b1 = r.u8()?;
				((b1 >> 3) as u16 & 0x1f, 5, b0 as u16 & 0x3f, 6, b1 & 0x07)
			}
			PacketKind::Uor2 => unreachable!("UOR-2 has its own entry"),
		};
		let body = &co[r.pos()..];

		let decoded = self.try_decode_uo(body, sn_bits, sn_k, id_bits, id_k, out)?;
		if decoded.calc_crc != real_crc {
			warn!(
				"CRC-3 failure (computed 0x{:x}, received 0x{real_crc:x})",
				decoded.calc_crc
			);
			return self.act_on_crc_failure(kind, 0, body, sn_bits, sn_k, id_bits, id_k, real_crc, out);
		}

		self.finish(decoded, body)
	}

	fn decode_uor2(&mut self, co: &[u8], out: &mut [u8]) -> Result<Outcome, Error> {
		let mut r = Reader::new(co);
		let b0 = r.u8()?;
		let sn_bits = b0 as u16 & 0x1f;
		let b1 = r.u8()?;
		let ext = b1 & 0x80 != 0;
		let real_crc = b1 & 0x7f;
		let body = &co[r.pos()..];

		let decoded = match self.try_decode_uor2(body, sn_bits, ext, out) {
			Ok(Some(d)) => d,
			Ok(None) => return Ok(Outcome::NeedReparse),
			Err(e) => return Err(e),
		};

		if decoded.calc_crc != real_crc {
			warn!(
				"CRC-7 failure (computed 0x{:02x}, received 0x{real_crc:02x})",
				decoded.calc_crc
			);
			let sn_k = decoded.sn_k;
			return self.act_on_crc_failure(
				PacketKind::Uor2,
				if ext { 1 } else { 0 },
				body,
				sn_bits,
				sn_k,
				0,
				0,
				real_crc,
				out,
			);
		}

		self.state = DState::FullContext;
		self.finish(decoded, body)
	}

	/// The common tail of every successful UO* parse: probation
	/// accounting and context commit. The rebuild already placed the
	/// headers and the payload in the output buffer.
	fn finish(&mut self, decoded: Decoded, body: &[u8]) -> Result<Outcome, Error> {
		// After a repair, the first two CRC-valid packets are still
		// discarded; only the third is delivered and confirms the
		// correction.
		if self.counter == 1 {
			debug!("repair probation: first follower thrown away");
			self.counter = 2;
			self.commit(&decoded);
			return Err(Error::Crc);
		}
		if self.counter == 2 {
			debug!("repair probation: second follower thrown away");
			self.counter = 0;
			self.commit(&decoded);
			return Err(Error::Crc);
		}

		self.commit(&decoded);

		let payload_len = body.len() - decoded.consumed;
		Ok(Outcome::Done(decoded.hlen + payload_len))
	}

	fn commit(&mut self, decoded: &Decoded) {
		self.active = decoded.work.clone();
		self.last = decoded.work.clone();
		self.update_inter_packet();
		self.sn.sync();
		self.sn.update(decoded.sn);
		if matches!(self.active[0].ip, IpHeader::V4(_)) {
			self.ip_id1.update(decoded.id, decoded.sn);
		}
		if matches!(self.active.get(1).map(|h| &h.ip), Some(IpHeader::V4(_))) {
			self.ip_id2.update(decoded.id2, decoded.sn);
		}
	}

	/// Decode the SN- and IP-ID-carrying part shared by UO-0 and UO-1,
	/// build the headers and compute their CRC-3.
	fn try_decode_uo(
		&mut self,
		body: &[u8],
		sn_bits: u16,
		sn_k: u8,
		id_bits: u16,
		id_k: u8,
		out: &mut [u8],
	) -> Result<Decoded, Error> {
		let mut r = Reader::new(body);
		let mut work = self.active.clone();

		let sn = self.sn.decode(sn_bits, sn_k);
		debug!("SN = {sn}");

		let mut id = 0;
		let mut id2 = 0;

		if matches!(work[0].ip, IpHeader::V4(_)) {
			id = if work[0].rnd {
				r.u16be()?
			} else {
				self.ip_id1.decode(id_bits, id_k, sn)
			};
			set_ip_id(&mut work[0], id)?;
		}

		if work.len() > 1 && matches!(work[1].ip, IpHeader::V4(_)) {
			id2 = if work[1].rnd { r.u16be()? } else { self.ip_id2.decode(0, 0, sn) };
			set_ip_id(&mut work[1], id2)?;
		}

		let hlen = build_headers(&work, &body[r.pos()..], out)?
			- (body.len() - r.pos());
		let calc_crc = crc::crc3(crc::CRC_INIT_3, &out[..hlen]);

		Ok(Decoded { hlen, consumed: r.pos(), calc_crc, sn, sn_k, id, id2, work })
	}

	/// Decode a UOR-2 body: the optional extension, the IP-IDs, the
	/// header rebuild and its CRC-7. `None` asks for a reparse after an
	/// extension 3 flipped a RND flag.
	fn try_decode_uor2(
		&mut self,
		body: &[u8],
		sn_bits: u16,
		ext: bool,
		out: &mut [u8],
	) -> Result<Option<Decoded>, Error> {
		let mut r = Reader::new(body);
		let mut work = self.active.clone();

		let sn;
		let sn_k;
		let mut id = 0u16;
		let mut id2 = 0u16;
		let mut id_from_ext3 = false;
		let mut id2_from_ext3 = false;

		if ext {
			let ext_type = r.peek()? >> 6;
			match ext_type {
				0 => {
					let b = r.u8()?;
					// +3 SN bits, 3 IP-ID offset bits.
					sn_k = 8;
					sn = self.sn.decode((sn_bits << 3) | (b as u16 >> 3) & 0x7, sn_k);
					if !matches!(work[0].ip, IpHeader::V4(_)) {
						warn!("extension 0 needs an IPv4 outer header");
						return Err(Error::Malformed);
					}
					id = self.ip_id1.decode(b as u16 & 0x7, 3, sn);
					id2 = self.ip_id2.decode(0, 0, sn);
				}
				1 => {
					let b = r.u8()?;
					let b1 = r.u8()?;
					// +3 SN bits, 11 IP-ID offset bits.
					sn_k = 8;
					sn = self.sn.decode((sn_bits << 3) | (b as u16 >> 3) & 0x7, sn_k);
					if !matches!(work[0].ip, IpHeader::V4(_)) {
						warn!("extension 1 needs an IPv4 outer header");
						return Err(Error::Malformed);
					}
					id = self.ip_id1.decode(((b as u16 & 0x7) << 8) | b1 as u16, 11, sn);
					id2 = self.ip_id2.decode(0, 0, sn);
				}
				2 => {
					let b = r.u8()?;
					let b1 = r.u8()?;
					let b2 = r.u8()?;
					// +3 SN bits, 11 outer offset bits, 8 inner bits.
					sn_k = 8;
					sn = self.sn.decode((sn_bits << 3) | (b as u16 >> 3) & 0x7, sn_k);
					let both_v4 = matches!(work[0].ip, IpHeader::V4(_))
						&& matches!(work.get(1).map(|h| &h.ip), Some(IpHeader::V4(_)));
					if !both_v4 {
						warn!("extension 2 needs two IPv4 headers");
						return Err(Error::Malformed);
					}
					id = self.ip_id1.decode(((b as u16 & 0x7) << 8) | b1 as u16, 11, sn);
					id2 = self.ip_id2.decode(b2 as u16, 8, sn);
				}
				_ => {
					// Extension 3.
					let flags = r.u8()?;
					let s = flags & 0x20 != 0;
					let _mode = (flags >> 3) & 0x3;
					let i = flags & 0x04 != 0;
					let ip = flags & 0x02 != 0;
					let ip2 = flags & 0x01 != 0;

					let inner_flags = if ip { Some(r.u8()?) } else { None };
					let outer_flags = if ip2 { Some(r.u8()?) } else { None };

					let (bits, k) = if s {
						((sn_bits << 8) | r.u8()? as u16, 13u8)
					} else {
						(sn_bits, 5)
					};
					sn_k = k;
					sn = self.sn.decode(bits, sn_k);

					// Inner header flags act on the innermost header.
					let inner_pos = work.len() - 1;
					if let Some(flags) = inner_flags {
						if self.apply_header_flags(&mut work, inner_pos, flags, &mut r)? {
							return Ok(None);
						}
					}

					if i {
						let raw = r.u16be()?;
						if work.len() > 1 {
							set_ip_id(&mut work[1], raw)?;
							id2 = raw;
							id2_from_ext3 = true;
						} else {
							set_ip_id(&mut work[0], raw)?;
							id = raw;
							id_from_ext3 = true;
						}
					}

					if let Some(flags) = outer_flags {
						if self.apply_header_flags(&mut work, 0, flags, &mut r)? {
							return Ok(None);
						}
						// Outer flags carry their own IP-ID presence bit.
						if flags & 0x01 != 0 {
							if id_from_ext3 {
								warn!("outer IP-ID transmitted twice in extension 3");
								return Err(Error::Malformed);
							}
							let raw = r.u16be()?;
							set_ip_id(&mut work[0], raw)?;
							id = raw;
							id_from_ext3 = true;
						}
					}

					if !id_from_ext3 && matches!(work[0].ip, IpHeader::V4(_)) {
						id = self.ip_id1.decode(0, 0, sn);
					}
					if !id2_from_ext3
						&& matches!(work.get(1).map(|h| &h.ip), Some(IpHeader::V4(_)))
					{
						id2 = self.ip_id2.decode(0, 0, sn);
					}
				}
			}
		} else {
			sn_k = 5;
			sn = self.sn.decode(sn_bits, sn_k);
			if matches!(work[0].ip, IpHeader::V4(_)) {
				id = self.ip_id1.decode(0, 0, sn);
			}
			if matches!(work.get(1).map(|h| &h.ip), Some(IpHeader::V4(_))) {
				id2 = self.ip_id2.decode(0, 0, sn);
			}
		}
		debug!("SN = {sn}");

		// Random IP-IDs ride uncompressed behind the extension.
		if let IpHeader::V4(_) = &work[0].ip {
			if work[0].rnd && !id_from_ext3 {
				id = r.u16be()?;
			}
			set_ip_id(&mut work[0], id)?;
		}
		if work.len() > 1 {
			if let IpHeader::V4(_) = &work[1].ip {
				if work[1].rnd && !id2_from_ext3 {
					id2 = r.u16be()?;
				}
				set_ip_id(&mut work[1], id2)?;
			}
		}

		let hlen = build_headers(&work, &body[r.pos()..], out)?
			- (body.len() - r.pos());
		let calc_crc = crc::crc7(crc::CRC_INIT_7, &out[..hlen]);

		Ok(Some(Decoded { hlen, consumed: r.pos(), calc_crc, sn, sn_k, id, id2, work }))
	}

	/// Apply one extension-3 header-flags octet and its trailing fields.
	/// Returns `true` when a RND flip demands a reparse.
	fn apply_header_flags(
		&mut self,
		work: &mut [HdrChanges],
		pos: usize,
		flags: u8,
		r: &mut Reader,
	) -> Result<bool, Error> {
		let is_tos = flags & 0x80 != 0;
		let is_ttl = flags & 0x40 != 0;
		let df = flags & 0x20 != 0;
		let is_pr = flags & 0x10 != 0;
		let is_ipx = flags & 0x08 != 0;
		let nbo = flags & 0x04 != 0;
		let rnd = flags & 0x02 != 0;

		if is_ipx {
			warn!("extension-header list compression is not supported");
			return Err(Error::Unsupported);
		}

		let tos = if is_tos { Some(r.u8()?) } else { None };
		let ttl = if is_ttl { Some(r.u8()?) } else { None };
		let pr = if is_pr { Some(r.u8()?) } else { None };

		let hdr = &mut work[pos];
		match &mut hdr.ip {
			IpHeader::V4(v4) => {
				if let Some(tos) = tos {
					v4.tos = tos;
				}
				if let Some(ttl) = ttl {
					v4.ttl = ttl;
				}
				if let Some(pr) = pr {
					v4.protocol = Protocol::from(pr);
				}
				v4.dont_fragment = df;
				hdr.nbo = nbo;

				if hdr.rnd != rnd {
					debug!("RND flip ({} -> {rnd}): the packet must be reparsed", hdr.rnd);
					hdr.rnd = rnd;
					// The flip must survive into the retry.
					self.active[pos].rnd = rnd;
					return Ok(true);
				}
			}
			IpHeader::V6(v6) => {
				if df || nbo || rnd {
					warn!("IPv4-only flag set on an IPv6 header");
					return Err(Error::Malformed);
				}
				if let Some(tos) = tos {
					v6.traffic_class = tos;
				}
				if let Some(ttl) = ttl {
					v6.hop_limit = ttl;
				}
				if let Some(pr) = pr {
					v6.next_header = Protocol::from(pr);
				}
			}
		}

		Ok(false)
	}

	/// CRC failure: try the SN-wraparound hypothesis when packets
	/// stopped arriving for much longer than the SN field can count,
	/// otherwise re-decode against the previous SN reference. Either
	/// way the packet itself is dropped; a match only starts probation.
	#[allow(clippy::too_many_arguments)]
	fn act_on_crc_failure(
		&mut self,
		kind: PacketKind,
		ext: u8,
		body: &[u8],
		sn_bits: u16,
		sn_k: u8,
		id_bits: u16,
		id_k: u8,
		real_crc: u8,
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		// Undo whatever the failed parse staged.
		self.active = self.last.clone();

		let interval = self
			.last_packet_time
			.map(|last| self.current_packet_time.saturating_sub(last).as_micros() as u64)
			.unwrap_or(0);

		let saved_ref = self.sn.reference();
		let wraparound = self.inter_arrival != 0
			&& interval > (1u64 << sn_k) * self.inter_arrival;

		if wraparound {
			debug!("repair attempt: SN LSB wraparound");
			let new_ref = saved_ref.wrapping_add(1 << sn_k);
			self.sn.sync();
			self.sn.update(new_ref);
		} else {
			debug!("repair attempt: incorrect SN update");
			let old_ref = self.sn.old_reference();
			if old_ref == saved_ref {
				debug!("previous SN reference is no different, give up");
				return Err(Error::Crc);
			}
			self.sn.update(old_ref);
		}

		let redecoded = match kind {
			PacketKind::Uo0 | PacketKind::Uo1 => {
				self.try_decode_uo(body, sn_bits, sn_k, id_bits, id_k, out)
			}
			PacketKind::Uor2 => match self.try_decode_uor2(body, sn_bits, ext != 0, out) {
				Ok(Some(d)) => Ok(d),
				Ok(None) => Err(Error::Malformed),
				Err(e) => Err(e),
			},
		};

		match redecoded {
			Ok(d) if d.calc_crc == real_crc => {
				debug!("repair hypothesis matches; hold it on probation");
				self.counter = 1;
				self.commit(&d);
				Err(Error::Crc)
			}
			_ => {
				debug!("repair failed too");
				self.sn.update(saved_ref);
				self.active = self.last.clone();
				self.counter = 0;
				Err(Error::Crc)
			}
		}
	}
}

fn set_ip_id(hdr: &mut HdrChanges, id: u16) -> Result<(), Error> {
	match &mut hdr.ip {
		IpHeader::V4(v4) => {
			v4.id = id;
			Ok(())
		}
		IpHeader::V6(_) => {
			warn!("IP-ID update aimed at an IPv6 header");
			Err(Error::Malformed)
		}
	}
}

fn copy_dynamic(dst: &mut IpHeader, src: &IpHeader) {
	match (dst, src) {
		(IpHeader::V4(d), IpHeader::V4(s)) => {
			d.tos = s.tos;
			d.ttl = s.ttl;
			d.id = s.id;
			d.dont_fragment = s.dont_fragment;
		}
		(IpHeader::V6(d), IpHeader::V6(s)) => {
			d.traffic_class = s.traffic_class;
			d.hop_limit = s.hop_limit;
		}
		_ => {}
	}
}

/// Serialise the header chain and the payload. The IP-ID is emitted
/// byte-swapped when NBO is clear; lengths and the IPv4 checksum are
/// recomputed.
fn build_headers(headers: &[HdrChanges], payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
	let lens: Vec<usize> = headers.iter().map(|h| h.ip.len()).collect();

	let mut w = Writer::new(out);
	for (pos, hdr) in headers.iter().enumerate() {
		let trailing = payload.len() + lens[pos + 1..].iter().sum::<usize>();
		match &hdr.ip {
			IpHeader::V4(v4) => {
				let mut v4 = v4.clone();
				if !hdr.nbo {
					v4.id = swab16(v4.id);
				}
				v4.write(&mut w, trailing)?;
			}
			IpHeader::V6(v6) => v6.write(&mut w, trailing)?,
		}
	}

	w.slice(payload)?;
	Ok(w.pos())
}
