//! The ROHCv2 IP-only profile compressor (RFC 5225, profile 0x0104).

use core::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use log::debug;
use net::{ipv4, ipv6, IpHeader, Protocol};
use utils::bytes::{Reader, Writer};
use utils::endian::swab16;

use super::{Machine, State};
use crate::wlsb::{ip_id_p, msn_p, Wlsb};
use crate::{cid, crc, Config, Error, IpIdBehavior, PROFILE_RFC5225_IP};

/// Upper bound on tunnelled IP headers per flow.
pub const MAX_IP_HEADERS: usize = 4;

/// Packet type octet of an IR packet.
pub const ROHC_IR: u8 = 0xfd;
/// Discriminator octet of a co_common packet.
pub const CO_COMMON: u8 = 0xfa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
	Ir,
	Pt0Crc3,
	Pt0Crc7,
	Pt1SeqId,
	Pt2SeqId,
	CoCommon,
}

/// The per-IP-header slice of the flow context.
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

/// What the per-packet differ found, relative to the context.
struct Changes {
	outer_ip_flag: bool,
	innermost_ip_flag: bool,
	df_changed: bool,
	behavior_changed: bool,
	/// DF or IP-ID behavior moved on a non-innermost header; co_common
	/// cannot express that, only a fresh IR can.
	outer_ctrl_changed: bool,
	innermost_ip_id: u16,
	innermost_offset: u16,
	/// The freshly classified behavior per IPv4 header; committed to the
	/// context only after the packet is fully built.
	behaviors: [IpIdBehavior; MAX_IP_HEADERS],
}

pub struct Context {
	pub(crate) machine: Machine,
	msn: u16,
	msn_wlsb: Wlsb,
	ip_id_wlsb: Wlsb,
	ips: Vec<IpCtxt>,
}

/// IPv6 extension headers are not handled by the profile.
fn is_ipv6_ext(p: Protocol) -> bool {
	matches!(u8::from(p), 0 | 43 | 44 | 50 | 51 | 60 | 135)
}

/// Parse the chain of IP headers off `packet`. Returns the headers and
/// the offset where the payload begins.
fn parse_ip_chain(packet: &[u8]) -> Result<(Vec<IpHeader>, usize), Error> {
	let mut r = Reader::new(packet);
	let mut headers = Vec::new();

	loop {
		let hdr = IpHeader::parse(&mut r)?;
		let proto = hdr.protocol();
		headers.push(hdr);

		if !proto.is_tunneling() {
			break;
		}
		if headers.len() >= MAX_IP_HEADERS {
			return Err(Error::TooManyHeaders);
		}
	}

	Ok((headers, r.pos()))
}

/// Whether the packet fits the profile: IP versions 4 or 6 only, no
/// fragments, no IPv4 options, correct lengths and checksums, no IPv6
/// extension headers, at most [`MAX_IP_HEADERS`] headers.
pub fn check_profile(cfg: &Config, packet: &[u8]) -> bool {
	let mut r = Reader::new(packet);
	let mut nr = 0;

	loop {
		let start = r.pos();
		let hdr = match IpHeader::parse(&mut r) {
			Ok(hdr) => hdr,
			Err(e) => {
				debug!("header #{} does not parse: {e}", nr + 1);
				return false;
			}
		};
		nr += 1;

		match &hdr {
			IpHeader::V4(v4) => {
				if v4.is_fragment {
					debug!("IPv4 header #{nr} is a fragment");
					return false;
				}
				if v4.total_len as usize != packet.len() - start {
					debug!("IPv4 header #{nr} carries a wrong total length");
					return false;
				}
				if !cfg.features.no_ip_checksums && !v4.checksum_valid(&packet[start..]) {
					debug!("IPv4 header #{nr} has a bad checksum");
					return false;
				}
			}
			IpHeader::V6(v6) => {
				if v6.payload_len as usize != packet.len() - start - ipv6::HEADER_LEN {
					debug!("IPv6 header #{nr} carries a wrong payload length");
					return false;
				}
				if is_ipv6_ext(v6.next_header) {
					debug!("IPv6 header #{nr} is followed by an extension header");
					return false;
				}
			}
		}

		if !hdr.protocol().is_tunneling() {
			return true;
		}
		if nr >= MAX_IP_HEADERS {
			debug!("too many IP headers for the IP-only profile");
			return false;
		}
	}
}

impl Context {
	/// Initialize a context from the first packet of the flow. The first
	/// IP-ID behavior is optimistically sequential.
	pub fn create(
		cfg: &Config,
		packet: &[u8],
		machine: Machine,
		initial_msn: u16,
	) -> Result<Self, Error> {
		let (headers, _) = parse_ip_chain(packet)?;

		let ips = headers
			.iter()
			.map(|hdr| match hdr {
				IpHeader::V4(v4) => IpCtxt::V4 {
					protocol: v4.protocol,
					src: v4.src,
					dst: v4.dst,
					tos: v4.tos,
					ttl: v4.ttl,
					df: v4.dont_fragment,
					last_id: v4.id,
					behavior: IpIdBehavior::Sequential,
				},
				IpHeader::V6(v6) => IpCtxt::V6 {
					next_header: v6.next_header,
					flow_label: v6.flow_label,
					src: v6.src,
					dst: v6.dst,
					tc: v6.traffic_class,
					hl: v6.hop_limit,
				},
			})
			.collect();

		Ok(Self {
			machine,
			msn: initial_msn,
			msn_wlsb: Wlsb::new(cfg.wlsb_window_width),
			ip_id_wlsb: Wlsb::new(cfg.wlsb_window_width),
			ips,
		})
	}

	pub fn msn(&self) -> u16 {
		self.msn
	}

	/// Whether the packet still belongs to this flow: same header count,
	/// versions, addresses, protocols and flow labels.
	pub fn check_context(&self, packet: &[u8]) -> bool {
		let Ok((headers, _)) = parse_ip_chain(packet) else {
			return false;
		};
		if headers.len() != self.ips.len() {
			debug!("IP header count changed");
			return false;
		}

		headers.iter().zip(&self.ips).all(|(hdr, ctxt)| match (hdr, ctxt) {
			(IpHeader::V4(v4), IpCtxt::V4 { protocol, src, dst, .. }) => {
				v4.src == *src && v4.dst == *dst && v4.protocol == *protocol
			}
			(IpHeader::V6(v6), IpCtxt::V6 { next_header, flow_label, src, dst, .. }) => {
				v6.src == *src
					&& v6.dst == *dst && v6.next_header == *next_header
					&& v6.flow_label == *flow_label
			}
			_ => false,
		})
	}

	/// Compare the packet against the context and classify IP-ID moves.
	fn detect_changes(&self, headers: &[IpHeader], msn: u16) -> Changes {
		let mut tmp = Changes {
			outer_ip_flag: false,
			innermost_ip_flag: false,
			df_changed: false,
			behavior_changed: false,
			outer_ctrl_changed: false,
			innermost_ip_id: 0,
			innermost_offset: 0,
			behaviors: [IpIdBehavior::Sequential; MAX_IP_HEADERS],
		};

		for (pos, (hdr, ctxt)) in headers.iter().zip(&self.ips).enumerate() {
			let is_innermost = pos + 1 == self.ips.len();

			if hdr.tos_tc() != ctxt.tos_tc() || hdr.ttl_hl() != ctxt.ttl_hl() {
				debug!(
					"TOS/TC ({:02x} -> {:02x}) or TTL/HL ({} -> {}) changed on header #{}",
					ctxt.tos_tc(),
					hdr.tos_tc(),
					ctxt.ttl_hl(),
					hdr.ttl_hl(),
					pos + 1
				);
				if is_innermost {
					tmp.innermost_ip_flag = true;
				} else {
					tmp.outer_ip_flag = true;
				}
			}

			if let (IpHeader::V4(v4), IpCtxt::V4 { df, last_id, behavior, .. }) = (hdr, ctxt) {
				if v4.dont_fragment != *df {
					tmp.df_changed = true;
					if !is_innermost {
						tmp.outer_ctrl_changed = true;
					}
				}

				let new_behavior = if self.machine.num_sent == 0 {
					IpIdBehavior::Sequential
				} else {
					let detected = IpIdBehavior::detect(*last_id, v4.id);
					// Only the innermost IP-ID travels compressed.
					if !is_innermost && detected.is_sequential() {
						IpIdBehavior::Random
					} else {
						detected
					}
				};
				tmp.behaviors[pos] = new_behavior;
				if new_behavior != *behavior {
					debug!("IP-ID behavior of header #{} became {:?}", pos + 1, new_behavior);
					tmp.behavior_changed = true;
					if !is_innermost {
						tmp.outer_ctrl_changed = true;
					}
				}

				if is_innermost {
					tmp.innermost_ip_id = v4.id;
					tmp.innermost_offset = match new_behavior {
						// The offset is always recorded, whatever the
						// behavior, so later sequential packets still
						// find usable references in the window.
						IpIdBehavior::SequentialSwapped => swab16(v4.id).wrapping_sub(msn),
						_ => v4.id.wrapping_sub(msn),
					};
				}
			}
		}

		tmp
	}

	fn innermost(&self) -> &IpCtxt {
		self.ips.last().expect("flow has at least one IP header")
	}

	/// Whether the innermost IP-ID advanced by exactly the MSN delta and
	/// therefore needs no bits at all.
	fn seq_ipid_inferred(&self, new_behavior: IpIdBehavior, new_ip_id: u16) -> bool {
		match self.innermost() {
			IpCtxt::V4 { last_id, .. } => match new_behavior {
				IpIdBehavior::Sequential => new_ip_id == last_id.wrapping_add(1),
				IpIdBehavior::SequentialSwapped => {
					swab16(new_ip_id) == swab16(*last_id).wrapping_add(1)
				}
				_ => false,
			},
			IpCtxt::V6 { .. } => false,
		}
	}

	fn msn_possible(&self, cfg: &Config, k: u8) -> bool {
		self.msn_wlsb.is_possible(self.msn, k, msn_p(k, cfg.reorder_ratio))
	}

	fn offset_possible(&self, offset: u16, k: u8) -> bool {
		self.ip_id_wlsb.is_possible(offset, k, ip_id_p(k))
	}

	/// Pick the smallest format the current state and W-LSB tolerances
	/// allow; FO restricts the choice to 7-bit-CRC forms.
	fn decide_packet(&self, cfg: &Config, tmp: &Changes) -> PacketType {
		match self.machine.state {
			State::Ir => PacketType::Ir,
			State::Fo => self.decide_fo_so_packet(cfg, tmp, true),
			State::So => self.decide_fo_so_packet(cfg, tmp, false),
		}
	}

	fn decide_fo_so_packet(&self, cfg: &Config, tmp: &Changes, crc7_at_least: bool) -> PacketType {
		let innermost_pos = self.ips.len() - 1;
		let behavior = match self.innermost() {
			IpCtxt::V4 { .. } => tmp.behaviors[innermost_pos],
			IpCtxt::V6 { .. } => IpIdBehavior::Zero,
		};
		let sequential = behavior.is_sequential();
		let ipid_inferable =
			!sequential || self.seq_ipid_inferred(behavior, tmp.innermost_ip_id);
		let nothing_changed = !tmp.outer_ip_flag
			&& !tmp.innermost_ip_flag
			&& !tmp.df_changed
			&& !tmp.behavior_changed;

		if !crc7_at_least && self.msn_possible(cfg, 4) && ipid_inferable && nothing_changed {
			PacketType::Pt0Crc3
		} else if self.msn_possible(cfg, 6) && ipid_inferable && nothing_changed {
			PacketType::Pt0Crc7
		} else if !crc7_at_least
			&& self.msn_possible(cfg, 6)
			&& sequential && self.offset_possible(tmp.innermost_offset, 4)
			&& nothing_changed
		{
			PacketType::Pt1SeqId
		} else if sequential
			&& self.offset_possible(tmp.innermost_offset, 6)
			&& self.msn_possible(cfg, 8)
			&& nothing_changed
		{
			PacketType::Pt2SeqId
		} else if !tmp.outer_ctrl_changed && self.msn_possible(cfg, 8) {
			PacketType::CoCommon
		} else {
			PacketType::Ir
		}
	}

	/// Encode one packet. The context is only mutated once the packet is
	/// fully built.
	pub fn encode(
		&mut self,
		cfg: &Config,
		cid: u16,
		now: Duration,
		packet: &[u8],
		out: &mut [u8],
	) -> Result<usize, Error> {
		let (headers, payload_offset) = parse_ip_chain(packet)?;
		if headers.len() != self.ips.len() {
			return Err(Error::ProfileMismatch);
		}

		let msn = self.msn.wrapping_add(1);
		debug!("MSN = 0x{msn:04x}");

		let tmp = self.detect_changes(&headers, msn);

		self.machine.decide_state(now);

		let packet_type = self.decide_packet(cfg, &tmp);
		self.machine.bump();

		// The outer_ip_flag is only expressible in co_common.
		let outer_ip_flag = tmp.outer_ip_flag && packet_type == PacketType::CoCommon;
		debug!("packet type {packet_type:?}");

		let header_len = match packet_type {
			PacketType::Ir => self.code_ir(cfg, cid, msn, &headers, &tmp, out)?,
			_ => self.code_co(
				cfg,
				cid,
				msn,
				&headers,
				&tmp,
				outer_ip_flag,
				packet_type,
				&packet[..payload_offset],
				out,
			)?,
		};

		let payload = &packet[payload_offset..];
		if out.len() < header_len + payload.len() {
			return Err(Error::Malformed);
		}
		out[header_len..header_len + payload.len()].copy_from_slice(payload);

		self.commit(msn, &headers, &tmp);

		// A context-updating CO packet needs stronger protection behind
		// it: re-enter FO so the next packets carry 7-bit CRCs.
		if packet_type == PacketType::CoCommon {
			self.machine.change_state(State::Fo);
		}

		Ok(header_len + payload.len())
	}

	/// Fold the packet into the context: the very last step of encoding.
	fn commit(&mut self, msn: u16, headers: &[IpHeader], tmp: &Changes) {
		self.msn = msn;
		self.msn_wlsb.add(msn, msn);
		self.machine.num_sent += 1;

		let innermost_pos = self.ips.len() - 1;
		for (pos, (hdr, ctxt)) in headers.iter().zip(self.ips.iter_mut()).enumerate() {
			match (hdr, ctxt) {
				(IpHeader::V4(v4), IpCtxt::V4 { tos, ttl, df, last_id, behavior, .. }) => {
					*tos = v4.tos;
					*ttl = v4.ttl;
					*df = v4.dont_fragment;
					*last_id = v4.id;
					*behavior = tmp.behaviors[pos];
					if pos == innermost_pos {
						self.ip_id_wlsb.add(msn, tmp.innermost_offset);
					}
				}
				(IpHeader::V6(v6), IpCtxt::V6 { tc, hl, .. }) => {
					*tc = v6.traffic_class;
					*hl = v6.hop_limit;
				}
				_ => unreachable!("check_context keeps versions stable"),
			}
		}
	}

	/// Build an IR packet: CID bytes, type octet, profile octet, CRC-8,
	/// static chain, dynamic chain. The CRC covers the whole header with
	/// the CRC octet zeroed.
	fn code_ir(
		&self,
		cfg: &Config,
		cid: u16,
		msn: u16,
		headers: &[IpHeader],
		tmp: &Changes,
		out: &mut [u8],
	) -> Result<usize, Error> {
		let mut w = Writer::new(out);
		let layout = cid::encode(&mut w, cfg.cid_type, cid)?;
		w.set(layout.first_byte, ROHC_IR);

		w.u8(PROFILE_RFC5225_IP as u8)?;
		let crc_pos = w.pos();
		w.u8(0)?;

		for (pos, hdr) in headers.iter().enumerate() {
			let is_innermost = pos + 1 == headers.len();
			match hdr {
				IpHeader::V4(v4) => static_ipv4(&mut w, is_innermost, v4)?,
				IpHeader::V6(v6) => static_ipv6(&mut w, is_innermost, v6)?,
			}
		}

		for (pos, hdr) in headers.iter().enumerate() {
			let is_innermost = pos + 1 == headers.len();
			match hdr {
				IpHeader::V4(v4) => {
					dynamic_ipv4(&mut w, cfg, is_innermost, v4, tmp.behaviors[pos], msn)?
				}
				IpHeader::V6(v6) => dynamic_ipv6(&mut w, cfg, is_innermost, v6, msn)?,
			}
		}

		let crc = crc::crc8(crc::CRC_INIT_8, w.written());
		w.set(crc_pos, crc);

		Ok(w.pos())
	}

	/// Build a CO packet. The CO block is written contiguously starting
	/// one byte before the end of the CID bytes; with large CIDs the
	/// first CO octet is then swapped into place before the CID and the
	/// clobbered CID octet restored.
	#[allow(clippy::too_many_arguments)]
	fn code_co(
		&self,
		cfg: &Config,
		cid: u16,
		msn: u16,
		headers: &[IpHeader],
		tmp: &Changes,
		outer_ip_flag: bool,
		packet_type: PacketType,
		uncomp_hdr: &[u8],
		out: &mut [u8],
	) -> Result<usize, Error> {
		let crc = match packet_type {
			PacketType::Pt0Crc3 | PacketType::Pt1SeqId => crc::crc3(crc::CRC_INIT_3, uncomp_hdr),
			_ => crc::crc7(crc::CRC_INIT_7, uncomp_hdr),
		};

		let mut w = Writer::new(out);
		let layout = cid::encode(&mut w, cfg.cid_type, cid)?;
		let co_start = layout.after_cid - 1;
		let saved = out[co_start];

		let co_len = {
			let mut w = Writer::new(&mut out[co_start..]);
			match packet_type {
				PacketType::Pt0Crc3 => {
					w.u8((msn as u8 & 0x0f) << 3 | crc)?;
				}
				PacketType::Pt0Crc7 => {
					w.u8(0x80 | ((msn >> 1) as u8 & 0x1f))?;
					w.u8((msn as u8 & 0x01) << 7 | crc)?;
				}
				PacketType::Pt1SeqId => {
					w.u8(0xa0 | (crc << 2) | ((msn >> 4) as u8 & 0x03))?;
					w.u8((msn as u8 & 0x0f) << 4 | (tmp.innermost_offset as u8 & 0x0f))?;
				}
				PacketType::Pt2SeqId => {
					w.u8(0xc0 | ((tmp.innermost_offset >> 1) as u8 & 0x1f))?;
					w.u8((tmp.innermost_offset as u8 & 0x01) << 7 | crc)?;
					w.u8(msn as u8)?;
				}
				PacketType::CoCommon => {
					self.code_co_common(cfg, msn, headers, tmp, outer_ip_flag, crc, &mut w)?
				}
				PacketType::Ir => unreachable!("IR is not a CO packet"),
			}

			self.irregular_chain(headers, tmp, outer_ip_flag, &mut w)?;
			w.pos()
		};

		if cfg.cid_type == crate::CidType::Large {
			out[layout.first_byte] = out[co_start];
			out[co_start] = saved;
		}

		Ok(co_start + co_len)
	}

	fn code_co_common(
		&self,
		cfg: &Config,
		msn: u16,
		headers: &[IpHeader],
		tmp: &Changes,
		outer_ip_flag: bool,
		crc7: u8,
		w: &mut Writer,
	) -> Result<(), Error> {
		let innermost_pos = self.ips.len() - 1;
		let innermost = &headers[innermost_pos];

		let (df, behavior) = match (innermost, self.innermost()) {
			(IpHeader::V4(v4), IpCtxt::V4 { .. }) => {
				(v4.dont_fragment, tmp.behaviors[innermost_pos])
			}
			_ => (false, IpIdBehavior::Zero),
		};

		let flags_present = tmp.df_changed || tmp.behavior_changed || outer_ip_flag;
		let tos_present = tmp.innermost_ip_flag;
		let ttl_present = tmp.innermost_ip_flag;

		// Sequential IP-IDs travel here as the IP-ID/MSN offset, in one
		// byte when the window allows it.
		let (id_bytes, wide_id) = if behavior.is_sequential() {
			if self.offset_possible(tmp.innermost_offset, 8) {
				(1, false)
			} else {
				(2, true)
			}
		} else {
			(0, false)
		};

		let control = [cfg.reorder_ratio as u8, df as u8, behavior as u8];
		let control_crc = crc::crc3(crc::CRC_INIT_3, &control);

		w.u8(CO_COMMON)?;
		w.u8((wide_id as u8) << 7 | crc7)?;
		w.u8((flags_present as u8) << 7
			| (ttl_present as u8) << 6
			| (tos_present as u8) << 5
			| (cfg.reorder_ratio as u8) << 3
			| control_crc)?;
		if flags_present {
			w.u8((outer_ip_flag as u8) << 7 | (df as u8) << 6 | (behavior as u8) << 4)?;
		}
		if tos_present {
			w.u8(innermost.tos_tc())?;
		}
		if ttl_present {
			w.u8(innermost.ttl_hl())?;
		}
		w.u8(msn as u8)?;
		match id_bytes {
			1 => w.u8(tmp.innermost_offset as u8)?,
			2 => w.u16be(tmp.innermost_offset)?,
			_ => {}
		}

		Ok(())
	}

	/// The irregular chain: random IP-IDs, and outer TOS/TTL when
	/// co_common raised the outer flag.
	fn irregular_chain(
		&self,
		headers: &[IpHeader],
		tmp: &Changes,
		outer_ip_flag: bool,
		w: &mut Writer,
	) -> Result<(), Error> {
		for (pos, hdr) in headers.iter().enumerate() {
			let is_innermost = pos + 1 == headers.len();

			if let IpHeader::V4(v4) = hdr {
				if tmp.behaviors[pos] == IpIdBehavior::Random {
					w.u16be(v4.id)?;
				}
			}

			if !is_innermost && outer_ip_flag {
				w.u8(hdr.tos_tc())?;
				w.u8(hdr.ttl_hl())?;
			}
		}
		Ok(())
	}
}

impl IpCtxt {
	fn tos_tc(&self) -> u8 {
		match self {
			IpCtxt::V4 { tos, .. } => *tos,
			IpCtxt::V6 { tc, .. } => *tc,
		}
	}

	fn ttl_hl(&self) -> u8 {
		match self {
			IpCtxt::V4 { ttl, .. } => *ttl,
			IpCtxt::V6 { hl, .. } => *hl,
		}
	}
}

fn static_ipv4(w: &mut Writer, is_innermost: bool, v4: &ipv4::Header) -> Result<(), Error> {
	w.u8((is_innermost as u8) << 6)?;
	w.u8(v4.protocol.into())?;
	w.slice(&v4.src.octets())?;
	w.slice(&v4.dst.octets())?;
	Ok(())
}

fn static_ipv6(w: &mut Writer, is_innermost: bool, v6: &ipv6::Header) -> Result<(), Error> {
	if v6.flow_label == 0 {
		// The short variant elides the all-zero flow label.
		w.u8(0x80 | (is_innermost as u8) << 6)?;
	} else {
		w.u8(0x80 | (is_innermost as u8) << 6 | 0x10 | ((v6.flow_label >> 16) as u8 & 0x0f))?;
		w.u16be(v6.flow_label as u16)?;
	}
	w.u8(v6.next_header.into())?;
	w.slice(&v6.src.octets())?;
	w.slice(&v6.dst.octets())?;
	Ok(())
}

fn dynamic_ipv4(
	w: &mut Writer,
	cfg: &Config,
	is_innermost: bool,
	v4: &ipv4::Header,
	behavior: IpIdBehavior,
	msn: u16,
) -> Result<(), Error> {
	if is_innermost {
		w.u8((cfg.reorder_ratio as u8) << 3 | (v4.dont_fragment as u8) << 2 | behavior as u8)?;
	} else {
		w.u8((v4.dont_fragment as u8) << 2 | behavior as u8)?;
	}
	w.u8(v4.tos)?;
	w.u8(v4.ttl)?;
	if behavior != IpIdBehavior::Zero {
		w.u16be(v4.id)?;
	}
	if is_innermost {
		w.u16be(msn)?;
	}
	Ok(())
}

fn dynamic_ipv6(
	w: &mut Writer,
	cfg: &Config,
	is_innermost: bool,
	v6: &ipv6::Header,
	msn: u16,
) -> Result<(), Error> {
	w.u8(v6.traffic_class)?;
	w.u8(v6.hop_limit)?;
	if is_innermost {
		w.u8((cfg.reorder_ratio as u8) << 6)?;
		w.u16be(msn)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	fn ipv4_udp(frag_offset: u16) -> [u8; 24] {
		// 20-byte IPv4 header + 4 payload bytes.
		let mut pkt = [0u8; 24];
		pkt[0] = 0x45;
		pkt[3] = 24;
		pkt[6] = (frag_offset >> 8) as u8;
		pkt[7] = frag_offset as u8;
		pkt[8] = 64;
		pkt[9] = 17;
		let csum = net::Checksum::of(&pkt[..20]).end();
		pkt[10] = csum[0];
		pkt[11] = csum[1];
		pkt
	}

	#[test]
	fn admits_plain_ipv4() {
		assert!(check_profile(&Config::default(), &ipv4_udp(0)));
	}

	#[test]
	fn rejects_fragments() {
		assert!(!check_profile(&Config::default(), &ipv4_udp(1)));
	}

	#[test]
	fn rejects_bad_checksum_unless_disabled() {
		let mut pkt = ipv4_udp(0);
		pkt[10] ^= 0xff;
		assert!(!check_profile(&Config::default(), &pkt));

		let mut cfg = Config::default();
		cfg.features.no_ip_checksums = true;
		assert!(check_profile(&cfg, &pkt));
	}
}
