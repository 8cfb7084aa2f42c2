//! The ROHCv2 IP-only profile decompressor (RFC 5225, profile 0x0104).
//!
//! Mirrors the compressor chain by chain: discriminator recognition,
//! static/dynamic/irregular chain parsing, MSN LSB decoding against the
//! reorder-ratio interval, IP-ID inference, CRC verification against the
//! rebuilt header, and context commit only after the CRC holds.

use core::net::{Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use net::{ipv4, ipv6, Protocol};
use utils::bytes::{Reader, Writer};
use utils::endian::swab16;

use super::Outcome;
use crate::cid::Layout;
use crate::comp::rfc5225::{CO_COMMON, MAX_IP_HEADERS, ROHC_IR};
use crate::wlsb::{decode16, ip_id_p, msn_p};
use crate::{crc, Config, Error, IpIdBehavior, ReorderRatio, PROFILE_RFC5225_IP};

#[derive(Debug, Clone)]
enum IpCtxt {
	V4 {
		protocol: Protocol,
		src: Ipv4Addr,
		dst: Ipv4Addr,
		tos: u8,
		ttl: u8,
		df: bool,
		last_id: u16,
		behavior: IpIdBehavior,
	},
	V6 {
		next_header: Protocol,
		flow_label: u32,
		src: Ipv6Addr,
		dst: Ipv6Addr,
		tc: u8,
		hl: u8,
	},
}

#[derive(Debug, Clone)]
pub struct Context {
	msn: u16,
	reorder_ratio: ReorderRatio,
	/// The last committed innermost IP-ID/MSN offset.
	last_offset: u16,
	ips: Vec<IpCtxt>,
	full_context: bool,
}

#[derive(Debug, Clone, Copy)]
enum PacketType {
	Pt0Crc3,
	Pt0Crc7,
	Pt1SeqId,
	Pt2SeqId,
	CoCommon,
}

impl Context {
	pub fn new() -> Self {
		Self {
			msn: 0,
			reorder_ratio: ReorderRatio::None,
			last_offset: 0,
			ips: Vec::new(),
			full_context: false,
		}
	}

	pub fn msn(&self) -> u16 {
		self.msn
	}

	pub(crate) fn decode(
		&mut self,
		cfg: &Config,
		packet: &[u8],
		layout: Layout,
		co_view: &[u8],
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		if packet[layout.first_byte] == ROHC_IR {
			self.decode_ir(cfg, packet, layout, out).map(Outcome::Done)
		} else {
			self.decode_co(co_view, out).map(Outcome::Done)
		}
	}

	/// IR: profile octet, CRC-8 over the whole header, then the static
	/// and dynamic chains.
	fn decode_ir(
		&mut self,
		_cfg: &Config,
		packet: &[u8],
		layout: Layout,
		out: &mut [u8],
	) -> Result<usize, Error> {
		let mut r = Reader::new(&packet[layout.after_cid..]);

		if r.u8()? != PROFILE_RFC5225_IP as u8 {
			warn!("IR carries the wrong profile octet");
			return Err(Error::ProfileMismatch);
		}
		let crc_pos = layout.after_cid + r.pos();
		let packet_crc = r.u8()?;

		let mut next = Context::new();

		// Static chain: one part per IP header, the innermost flag ends it.
		loop {
			if next.ips.len() == MAX_IP_HEADERS {
				return Err(Error::TooManyHeaders);
			}
			let flags = r.u8()?;
			let is_innermost = flags & 0x40 != 0;

			if flags & 0x80 == 0 {
				let protocol = Protocol::from(r.u8()?);
				let src = Ipv4Addr::from(r.array::<4>()?);
				let dst = Ipv4Addr::from(r.array::<4>()?);
				next.ips.push(IpCtxt::V4 {
					protocol,
					src,
					dst,
					tos: 0,
					ttl: 0,
					df: false,
					last_id: 0,
					behavior: IpIdBehavior::Sequential,
				});
			} else {
				let flow_label = if flags & 0x10 != 0 {
					((flags as u32 & 0x0f) << 16) | r.u16be()? as u32
				} else {
					0
				};
				let next_header = Protocol::from(r.u8()?);
				let src = Ipv6Addr::from(r.array::<16>()?);
				let dst = Ipv6Addr::from(r.array::<16>()?);
				next.ips.push(IpCtxt::V6 { next_header, flow_label, src, dst, tc: 0, hl: 0 });
			}

			if is_innermost {
				break;
			}
		}

		// Dynamic chain, in the same header order.
		let last = next.ips.len() - 1;
		for pos in 0..next.ips.len() {
			let is_innermost = pos == last;
			match &mut next.ips[pos] {
				IpCtxt::V4 { tos, ttl, df, last_id, behavior, .. } => {
					let flags = r.u8()?;
					if is_innermost {
						next.reorder_ratio = ReorderRatio::from_bits(flags >> 3);
					}
					*df = flags & 0x04 != 0;
					*behavior = IpIdBehavior::from_bits(flags);
					*tos = r.u8()?;
					*ttl = r.u8()?;
					*last_id = if *behavior == IpIdBehavior::Zero { 0 } else { r.u16be()? };
					if is_innermost {
						next.msn = r.u16be()?;
					}
				}
				IpCtxt::V6 { tc, hl, .. } => {
					*tc = r.u8()?;
					*hl = r.u8()?;
					if is_innermost {
						next.reorder_ratio = ReorderRatio::from_bits(r.u8()? >> 6);
						next.msn = r.u16be()?;
					}
				}
			}
		}

		// The CRC covers everything written so far, CRC octet zeroed.
		let hdr_end = layout.after_cid + r.pos();
		let mut computed = crc::crc8(crc::CRC_INIT_8, &packet[..crc_pos]);
		computed = crc::crc8(computed, &[0]);
		computed = crc::crc8(computed, &packet[crc_pos + 1..hdr_end]);
		if computed != packet_crc {
			warn!("IR header CRC-8 mismatch (got 0x{packet_crc:02x}, computed 0x{computed:02x})");
			return Err(Error::Crc);
		}

		if self.full_context && !self.same_static(&next) {
			warn!("IR static chain contradicts the established context");
			return Err(Error::ProfileMismatch);
		}

		// Commit and rebuild.
		next.full_context = true;
		next.last_offset = match next.ips[last] {
			IpCtxt::V4 { last_id, behavior: IpIdBehavior::SequentialSwapped, .. } => {
				swab16(last_id).wrapping_sub(next.msn)
			}
			IpCtxt::V4 { last_id, .. } => last_id.wrapping_sub(next.msn),
			IpCtxt::V6 { .. } => 0,
		};
		*self = next;

		let payload = &packet[hdr_end..];
		let ids: Vec<u16> = self
			.ips
			.iter()
			.map(|ip| match ip {
				IpCtxt::V4 { last_id, .. } => *last_id,
				IpCtxt::V6 { .. } => 0,
			})
			.collect();
		self.rebuild(&ids, payload, out)
	}

	fn same_static(&self, other: &Context) -> bool {
		self.ips.len() == other.ips.len()
			&& self.ips.iter().zip(&other.ips).all(|pair| match pair {
				(
					IpCtxt::V4 { protocol, src, dst, .. },
					IpCtxt::V4 { protocol: p2, src: s2, dst: d2, .. },
				) => protocol == p2 && src == s2 && dst == d2,
				(
					IpCtxt::V6 { next_header, flow_label, src, dst, .. },
					IpCtxt::V6 { next_header: n2, flow_label: f2, src: s2, dst: d2, .. },
				) => next_header == n2 && flow_label == f2 && src == s2 && dst == d2,
				_ => false,
			})
	}

	fn decode_co(&mut self, co: &[u8], out: &mut [u8]) -> Result<usize, Error> {
		if !self.full_context {
			warn!("CO packet before any IR established the context");
			return Err(Error::NoContext);
		}

		let mut r = Reader::new(co);
		let b0 = r.u8()?;

		let (packet_type, msn_bits, msn_k, packet_crc, mut offset_bits) = if b0 & 0x80 == 0 {
			(PacketType::Pt0Crc3, (b0 >> 3) as u16 & 0x0f, 4u8, b0 & 0x07, 0u16)
		} else if b0 == CO_COMMON {
			(PacketType::CoCommon, 0, 8, 0, 0)
		} else {
			match b0 >> 5 {
				0b100 => {
					let b1 = r.u8()?;
					(
						PacketType::Pt0Crc7,
						((b0 as u16 & 0x1f) << 1) | (b1 >> 7) as u16,
						6,
						b1 & 0x7f,
						0,
					)
				}
				0b101 => {
					let b1 = r.u8()?;
					(
						PacketType::Pt1SeqId,
						((b0 as u16 & 0x03) << 4) | (b1 >> 4) as u16,
						6,
						(b0 >> 2) & 0x07,
						(b1 & 0x0f) as u16,
					)
				}
				0b110 => {
					let b1 = r.u8()?;
					let b2 = r.u8()?;
					(
						PacketType::Pt2SeqId,
						b2 as u16,
						8,
						b1 & 0x7f,
						((b0 as u16 & 0x1f) << 1) | (b1 >> 7) as u16,
					)
				}
				_ => {
					warn!("unknown CO discriminator 0x{b0:02x}");
					return Err(Error::Unsupported);
				}
			}
		};

		// Stage every context mutation; nothing commits before the CRC
		// holds.
		let mut next = self.clone();
		let innermost = next.ips.len() - 1;
		let mut outer_ip_flag = false;
		let mut tos_override = None;
		let mut ttl_override = None;

		let (msn, packet_crc, crc_is_7) = if let PacketType::CoCommon = packet_type {
			let b1 = r.u8()?;
			let wide_id = b1 & 0x80 != 0;
			let crc7 = b1 & 0x7f;
			let b2 = r.u8()?;
			let flags_present = b2 & 0x80 != 0;
			let ttl_present = b2 & 0x40 != 0;
			let tos_present = b2 & 0x20 != 0;
			next.reorder_ratio = ReorderRatio::from_bits(b2 >> 3);
			let control_crc = b2 & 0x07;

			if flags_present {
				let flags = r.u8()?;
				outer_ip_flag = flags & 0x80 != 0;
				if let IpCtxt::V4 { df, behavior, .. } = &mut next.ips[innermost] {
					*df = flags & 0x40 != 0;
					*behavior = IpIdBehavior::from_bits(flags >> 4);
				}
			}
			if tos_present {
				tos_override = Some(r.u8()?);
			}
			if ttl_present {
				ttl_override = Some(r.u8()?);
			}

			let msn = decode16(r.u8()? as u16, 8, msn_p(8, self.reorder_ratio), self.msn);

			if let IpCtxt::V4 { behavior, .. } = &next.ips[innermost] {
				if behavior.is_sequential() {
					offset_bits = if wide_id { r.u16be()? } else { r.u8()? as u16 };
					let k = if wide_id { 16 } else { 8 };
					offset_bits = decode16(offset_bits, k, ip_id_p(k), self.last_offset);
				}
			}

			let (df, behavior) = match &next.ips[innermost] {
				IpCtxt::V4 { df, behavior, .. } => (*df, *behavior),
				IpCtxt::V6 { .. } => (false, IpIdBehavior::Zero),
			};
			let control = [next.reorder_ratio as u8, df as u8, behavior as u8];
			if crc::crc3(crc::CRC_INIT_3, &control) != control_crc {
				warn!("co_common control CRC-3 mismatch");
				return Err(Error::Crc);
			}

			(msn, crc7, true)
		} else {
			let msn = decode16(msn_bits, msn_k, msn_p(msn_k, self.reorder_ratio), self.msn);
			let crc_is_7 = matches!(packet_type, PacketType::Pt0Crc7 | PacketType::Pt2SeqId);
			(msn, packet_crc, crc_is_7)
		};

		debug!("decoded MSN 0x{msn:04x} from {packet_type:?}");

		// The innermost IP-ID: transmitted as an offset, inferred from
		// the MSN delta, zero, or read from the irregular chain.
		let msn_delta = msn.wrapping_sub(self.msn);
		let mut ids = vec![0u16; next.ips.len()];
		let mut new_offset = self.last_offset;

		match packet_type {
			PacketType::Pt1SeqId | PacketType::Pt2SeqId => {
				let k = if matches!(packet_type, PacketType::Pt1SeqId) { 4 } else { 6 };
				new_offset = decode16(offset_bits, k, ip_id_p(k), self.last_offset);
			}
			PacketType::CoCommon => {
				if let IpCtxt::V4 { behavior, .. } = &next.ips[innermost] {
					if behavior.is_sequential() {
						new_offset = offset_bits;
					}
				}
			}
			_ => {}
		}

		if let IpCtxt::V4 { behavior, last_id, .. } = &next.ips[innermost] {
			ids[innermost] = match behavior {
				IpIdBehavior::Zero => 0,
				IpIdBehavior::Random => 0, // filled from the irregular chain
				IpIdBehavior::Sequential => match packet_type {
					PacketType::Pt0Crc3 | PacketType::Pt0Crc7 => last_id.wrapping_add(msn_delta),
					_ => msn.wrapping_add(new_offset),
				},
				IpIdBehavior::SequentialSwapped => match packet_type {
					PacketType::Pt0Crc3 | PacketType::Pt0Crc7 => {
						swab16(swab16(*last_id).wrapping_add(msn_delta))
					}
					_ => swab16(msn.wrapping_add(new_offset)),
				},
			};
		}

		// Irregular chain: random IP-IDs for every random IPv4 header,
		// outer TOS/TTL pairs when co_common raised the flag.
		for pos in 0..next.ips.len() {
			let is_innermost = pos == innermost;
			if let IpCtxt::V4 { behavior: IpIdBehavior::Random, .. } = &next.ips[pos] {
				ids[pos] = r.u16be()?;
			}
			if !is_innermost && outer_ip_flag {
				let tos = r.u8()?;
				let ttl = r.u8()?;
				match &mut next.ips[pos] {
					IpCtxt::V4 { tos: t, ttl: l, .. } => {
						*t = tos;
						*l = ttl;
					}
					IpCtxt::V6 { tc, hl, .. } => {
						*tc = tos;
						*hl = ttl;
					}
				}
			}
		}

		if let Some(tos) = tos_override {
			match &mut next.ips[innermost] {
				IpCtxt::V4 { tos: t, .. } => *t = tos,
				IpCtxt::V6 { tc, .. } => *tc = tos,
			}
		}
		if let Some(ttl) = ttl_override {
			match &mut next.ips[innermost] {
				IpCtxt::V4 { ttl: t, .. } => *t = ttl,
				IpCtxt::V6 { hl, .. } => *hl = ttl,
			}
		}

		let payload = r.rest();
		let len = next.rebuild(&ids, payload, out)?;

		// Verify the rebuilt header against the received CRC.
		let hdr_len = len - payload.len();
		let computed = if crc_is_7 {
			crc::crc7(crc::CRC_INIT_7, &out[..hdr_len])
		} else {
			crc::crc3(crc::CRC_INIT_3, &out[..hdr_len])
		};
		if computed != packet_crc {
			warn!("CO header CRC mismatch (got 0x{packet_crc:02x}, computed 0x{computed:02x})");
			return Err(Error::Crc);
		}

		// Commit.
		next.msn = msn;
		for (pos, ip) in next.ips.iter_mut().enumerate() {
			if let IpCtxt::V4 { last_id, behavior, .. } = ip {
				*last_id = ids[pos];
				if pos == innermost {
					next.last_offset = match behavior {
						IpIdBehavior::SequentialSwapped => swab16(*last_id).wrapping_sub(msn),
						_ => last_id.wrapping_sub(msn),
					};
				}
			}
		}
		*self = next;

		Ok(len)
	}

	/// Serialise the context's headers (with the packet's IP-IDs) and the
	/// payload into `out`.
	fn rebuild(&self, ids: &[u16], payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
		let lens: Vec<usize> = self
			.ips
			.iter()
			.map(|ip| match ip {
				IpCtxt::V4 { .. } => ipv4::HEADER_LEN,
				IpCtxt::V6 { .. } => ipv6::HEADER_LEN,
			})
			.collect();

		let mut w = Writer::new(out);
		for (pos, ip) in self.ips.iter().enumerate() {
			let trailing = payload.len() + lens[pos + 1..].iter().sum::<usize>();
			match ip {
				IpCtxt::V4 { protocol, src, dst, tos, ttl, df, .. } => {
					let hdr = ipv4::Header {
						tos: *tos,
						id: ids[pos],
						dont_fragment: *df,
						ttl: *ttl,
						protocol: *protocol,
						src: *src,
						dst: *dst,
						total_len: 0,
						checksum: 0,
						is_fragment: false,
					};
					hdr.write(&mut w, trailing)?;
				}
				IpCtxt::V6 { next_header, flow_label, src, dst, tc, hl } => {
					let hdr = ipv6::Header {
						traffic_class: *tc,
						flow_label: *flow_label,
						next_header: *next_header,
						hop_limit: *hl,
						src: *src,
						dst: *dst,
						payload_len: 0,
					};
					hdr.write(&mut w, trailing)?;
				}
			}
		}

		w.slice(payload)?;
		Ok(w.pos())
	}
}
