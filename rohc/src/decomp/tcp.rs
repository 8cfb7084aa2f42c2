//! The TCP profile decompressor (profile 0x0006): IR/IR-DYN chains, the
//! sixteen `rnd`/`seq` CO formats plus `co_common`, the compressed TCP
//! option list with its 16-slot index table, and scaled sequence/ack
//! numbers.
//!
//! CO recognition needs both the first packet byte and the context's
//! innermost IP-ID behavior: the same discriminators name different
//! formats on sequential and random flows.

use core::net::{Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use net::{ipv4, ipv6, tcp, Protocol};
use utils::bytes::{Reader, Writer};
use utils::endian::swab16;

use super::{Outcome, ROHC_IR, ROHC_IR_DYN};
use crate::cid::Layout;
use crate::wlsb::{decode16, decode32};
use crate::{crc, Error, IpIdBehavior, PROFILE_TCP};

/// Reserved option-table indices, RFC 4996/6846 page 27.
const INDEX_NOP: u8 = 0;
const INDEX_EOL: u8 = 1;
const INDEX_MSS: u8 = 2;
const INDEX_WINDOW: u8 = 3;
const INDEX_TIMESTAMP: u8 = 4;
const INDEX_SACK_PERMITTED: u8 = 5;
const INDEX_SACK: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoFormat {
	Rnd1,
	Rnd2,
	Rnd3,
	Rnd4,
	Rnd5,
	Rnd6,
	Rnd7,
	Rnd8,
	Seq1,
	Seq2,
	Seq3,
	Seq4,
	Seq5,
	Seq6,
	Seq7,
	Seq8,
	CoCommon,
}

/// One slot of the TCP option index table. A slot, once assigned a
/// kind, keeps it for the lifetime of the context.
#[derive(Debug, Clone)]
struct Slot {
	kind: u8,
	payload: Vec<u8>,
}

#[derive(Debug, Clone)]
enum IpCtxt {
	V4 {
		protocol: Protocol,
		src: Ipv4Addr,
		dst: Ipv4Addr,
		dscp_ecn: u8,
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
		dscp_ecn: u8,
		hl: u8,
	},
}

/// The TCP fields the CO formats inherit from the previous packet.
#[derive(Debug, Clone, Default)]
struct TcpFields {
	seq: u32,
	ack: u32,
	window: u16,
	checksum: u16,
	urg_ptr: u16,
	res_flags: u8,
	ecn_flags: u8,
	urg_flag: bool,
	ack_flag: bool,
	psh_flag: bool,
	rsf_flags: u8,
}

#[derive(Debug, Clone)]
pub struct Context {
	msn: u16,
	ecn_used: bool,
	src_port: u16,
	dst_port: u16,
	seq_scaled: u32,
	seq_residue: u32,
	ack_stride: u16,
	ack_scaled: u32,
	ack_residue: u32,
	old_tcp: TcpFields,
	slots: [Option<Slot>; 16],
	ips: Vec<IpCtxt>,
	full: bool,
}

impl Context {
	pub fn new() -> Self {
		Self {
			msn: 0,
			ecn_used: false,
			src_port: 0,
			dst_port: 0,
			seq_scaled: 0,
			seq_residue: 0,
			ack_stride: 0,
			ack_scaled: 0,
			ack_residue: 0,
			old_tcp: TcpFields::default(),
			slots: Default::default(),
			ips: Vec::new(),
			full: false,
		}
	}

	pub fn msn(&self) -> u16 {
		self.msn
	}

	pub(crate) fn decode(
		&mut self,
		packet: &[u8],
		layout: Layout,
		co_view: &[u8],
		out: &mut [u8],
	) -> Result<Outcome, Error> {
		match packet[layout.first_byte] {
			ROHC_IR => self.decode_ir(packet, layout, false, out).map(Outcome::Done),
			ROHC_IR_DYN => self.decode_ir(packet, layout, true, out).map(Outcome::Done),
			_ => self.decode_co(co_view, out).map(Outcome::Done),
		}
	}

	/// IR and IR-DYN: profile octet, CRC-8 over the whole header, the
	/// static chain (IR only) and the dynamic chain.
	fn decode_ir(
		&mut self,
		packet: &[u8],
		layout: Layout,
		dyn_only: bool,
		out: &mut [u8],
	) -> Result<usize, Error> {
		let mut r = Reader::new(&packet[layout.after_cid..]);

		if r.u8()? != PROFILE_TCP as u8 {
			warn!("IR carries the wrong profile octet");
			return Err(Error::ProfileMismatch);
		}
		let crc_pos = layout.after_cid + r.pos();
		let packet_crc = r.u8()?;

		let mut work = self.clone();

		if dyn_only {
			if !self.full {
				warn!("IR-DYN before any IR established the static chain");
				return Err(Error::NoContext);
			}
		} else {
			work.ips.clear();
			loop {
				if work.ips.len() == 2 {
					return Err(Error::TooManyHeaders);
				}
				let proto = parse_static_ip(&mut r, &mut work.ips)?;
				if !proto.is_tunneling() {
					if proto != Protocol::Tcp {
						warn!("chain ends in {proto:?}, not TCP");
						return Err(Error::ProfileMismatch);
					}
					break;
				}
			}
			work.src_port = r.u16be()?;
			work.dst_port = r.u16be()?;
		}

		// Dynamic chain: IP parts then the TCP part.
		for pos in 0..work.ips.len() {
			parse_dynamic_ip(&mut r, &mut work.ips[pos])?;
		}
		let (tcp_fields, options) = work.parse_dynamic_tcp(&mut r)?;

		let hdr_end = layout.after_cid + r.pos();
		let mut computed = crc::crc8(crc::CRC_INIT_8, &packet[..crc_pos]);
		computed = crc::crc8(computed, &[0]);
		computed = crc::crc8(computed, &packet[crc_pos + 1..hdr_end]);
		if computed != packet_crc {
			warn!("IR header CRC-8 mismatch (got 0x{packet_crc:02x}, computed 0x{computed:02x})");
			return Err(Error::Crc);
		}

		let payload = &packet[hdr_end..];

		// RFC 4996 pages 32/33: the scaling state follows from the very
		// packet that carries the seq number in full.
		if !payload.is_empty() {
			work.seq_scaled = tcp_fields.seq / payload.len() as u32;
			work.seq_residue = tcp_fields.seq % payload.len() as u32;
		}
		if work.ack_stride != 0 {
			work.ack_scaled = tcp_fields.ack / work.ack_stride as u32;
			work.ack_residue = tcp_fields.ack % work.ack_stride as u32;
		}

		work.old_tcp = tcp_fields;
		work.full = true;
		*self = work;

		self.rebuild(&self.collect_ids(), &options, payload, out)
	}

	/// The TCP dynamic part: flag octets, MSN, sequence number, the
	/// zero-elided ack/urg-ptr/ack-stride fields and the option list.
	fn parse_dynamic_tcp(&mut self, r: &mut Reader) -> Result<(TcpFields, Vec<u8>), Error> {
		let b0 = r.u8()?;
		let ecn_used = b0 & 0x80 != 0;
		let ack_stride_flag = b0 & 0x40 != 0;
		let ack_zero = b0 & 0x20 != 0;
		let urp_zero = b0 & 0x10 != 0;
		let res_flags = b0 & 0x0f;

		let b1 = r.u8()?;
		let ecn_flags = b1 >> 6;
		let urg_flag = b1 & 0x20 != 0;
		let ack_flag = b1 & 0x10 != 0;
		let psh_flag = b1 & 0x08 != 0;
		let rsf_flags = b1 & 0x07;

		self.msn = r.u16be()?;
		let seq = r.u32be()?;
		let ack = if ack_zero { 0 } else { r.u32be()? };
		let window = r.u16be()?;
		let checksum = r.u16be()?;
		let urg_ptr = if urp_zero { 0 } else { r.u16be()? };
		self.ack_stride = if ack_stride_flag { 0 } else { r.u16be()? };
		self.ecn_used = ecn_used;

		let options = self.parse_options_list(r, false, ack)?;

		Ok((
			TcpFields {
				seq,
				ack,
				window,
				checksum,
				urg_ptr,
				res_flags,
				ecn_flags,
				urg_flag,
				ack_flag,
				psh_flag,
				rsf_flags,
			},
			options,
		))
	}

	/// The compressed option list, RFC 6846 pages 25-27: a `PS|m` octet,
	/// `m` XI items (packed two per byte when 4-bit) and the items whose
	/// `present` bit is set. Returns the rebuilt option bytes, EOL-padded
	/// to a 32-bit boundary.
	fn parse_options_list(
		&mut self,
		r: &mut Reader,
		compressed: bool,
		ack: u32,
	) -> Result<Vec<u8>, Error> {
		let head = r.u8()?;
		let ps = head & 0x10 != 0;
		let m = (head & 0x0f) as usize;

		let xi_len = if ps { m } else { (m + 1) / 2 };
		let xi = r.take(xi_len)?.to_vec();

		let mut options = Vec::new();
		for i in 0..m {
			let (present, index) = if ps {
				(xi[i] & 0x80 != 0, xi[i] & 0x0f)
			} else if i & 1 == 0 {
				(xi[i / 2] & 0x80 != 0, (xi[i / 2] >> 4) & 0x07)
			} else {
				(xi[i / 2] & 0x08 != 0, xi[i / 2] & 0x07)
			};

			if present {
				self.parse_option_item(r, index, compressed, ack, &mut options)?;
			} else {
				self.emit_known_option(index, &mut options)?;
			}
		}

		// Pad with EOL so data_offset lands on a word boundary.
		while options.len() % 4 != 0 {
			options.push(tcp::OPT_EOL);
		}

		Ok(options)
	}

	/// One `present` item: uncompressed option bytes in IR chains,
	/// compressed forms in CO lists. The table slot is (re)written.
	fn parse_option_item(
		&mut self,
		r: &mut Reader,
		index: u8,
		compressed: bool,
		ack: u32,
		options: &mut Vec<u8>,
	) -> Result<(), Error> {
		match index {
			INDEX_NOP => {
				if !compressed {
					r.skip(1)?;
				}
				options.push(tcp::OPT_NOP);
			}
			INDEX_EOL => {
				if !compressed {
					r.skip(1)?;
				}
				options.push(tcp::OPT_EOL);
			}
			INDEX_MSS => {
				let value = if compressed {
					r.array::<2>()?
				} else {
					let raw = r.array::<4>()?;
					if raw[0] != tcp::OPT_MSS || raw[1] != 4 {
						return Err(Error::Malformed);
					}
					[raw[2], raw[3]]
				};
				self.set_slot(INDEX_MSS, tcp::OPT_MSS, &value)?;
				options.extend_from_slice(&[tcp::OPT_MSS, 4, value[0], value[1]]);
			}
			INDEX_WINDOW => {
				let value = if compressed {
					r.u8()?
				} else {
					let raw = r.array::<3>()?;
					if raw[0] != tcp::OPT_WINDOW_SCALE || raw[1] != 3 {
						return Err(Error::Malformed);
					}
					raw[2]
				};
				self.set_slot(INDEX_WINDOW, tcp::OPT_WINDOW_SCALE, &[value])?;
				options.extend_from_slice(&[tcp::OPT_WINDOW_SCALE, 3, value]);
			}
			INDEX_TIMESTAMP => {
				let (ts, ts_echo) = if compressed {
					let reference = self.slot_timestamp();
					let ts = ts_lsb(r, reference.0)?;
					let ts_echo = ts_lsb(r, reference.1)?;
					(ts, ts_echo)
				} else {
					let raw = r.array::<10>()?;
					if raw[0] != tcp::OPT_TIMESTAMP || raw[1] != 10 {
						return Err(Error::Malformed);
					}
					(
						u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
						u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]),
					)
				};
				let mut payload = [0u8; 8];
				payload[..4].copy_from_slice(&ts.to_be_bytes());
				payload[4..].copy_from_slice(&ts_echo.to_be_bytes());
				self.set_slot(INDEX_TIMESTAMP, tcp::OPT_TIMESTAMP, &payload)?;
				options.extend_from_slice(&[tcp::OPT_TIMESTAMP, 10]);
				options.extend_from_slice(&payload);
			}
			INDEX_SACK_PERMITTED => {
				if !compressed {
					let raw = r.array::<2>()?;
					if raw[0] != tcp::OPT_SACK_PERMITTED || raw[1] != 2 {
						return Err(Error::Malformed);
					}
				}
				self.set_slot(INDEX_SACK_PERMITTED, tcp::OPT_SACK_PERMITTED, &[])?;
				options.extend_from_slice(&[tcp::OPT_SACK_PERMITTED, 2]);
			}
			INDEX_SACK => {
				let blocks = if compressed {
					parse_sack_compressed(r, ack)?
				} else {
					let kind = r.u8()?;
					let len = r.u8()? as usize;
					if kind != tcp::OPT_SACK || len < 2 || (len - 2) % 8 != 0 {
						return Err(Error::Malformed);
					}
					r.take(len - 2)?.to_vec()
				};
				self.set_slot(INDEX_SACK, tcp::OPT_SACK, &blocks)?;
				options.extend_from_slice(&[tcp::OPT_SACK, blocks.len() as u8 + 2]);
				options.extend_from_slice(&blocks);
			}
			_ => {
				// Generic item: full kind/length/value bytes either way.
				let kind = r.u8()?;
				let len = r.u8()? as usize;
				if len < 2 {
					return Err(Error::Malformed);
				}
				let value = r.take(len - 2)?.to_vec();
				self.set_slot(index, kind, &value)?;
				options.push(kind);
				options.push(len as u8);
				options.extend_from_slice(&value);
			}
		}
		Ok(())
	}

	/// A `present = 0` item: the option is known from the context and
	/// replayed from its slot.
	fn emit_known_option(&self, index: u8, options: &mut Vec<u8>) -> Result<(), Error> {
		match index {
			INDEX_NOP => {
				options.push(tcp::OPT_NOP);
				return Ok(());
			}
			INDEX_EOL => {
				options.push(tcp::OPT_EOL);
				return Ok(());
			}
			_ => {}
		}

		let Some(slot) = &self.slots[index as usize] else {
			warn!("option index {index} referenced before it was assigned");
			return Err(Error::Malformed);
		};

		match slot.kind {
			tcp::OPT_SACK_PERMITTED => options.extend_from_slice(&[slot.kind, 2]),
			_ => {
				options.push(slot.kind);
				options.push(slot.payload.len() as u8 + 2);
				options.extend_from_slice(&slot.payload);
			}
		}
		Ok(())
	}

	/// Write a table slot. A slot never changes its kind; a generic item
	/// repeated as `present` must match the stored bytes.
	fn set_slot(&mut self, index: u8, kind: u8, payload: &[u8]) -> Result<(), Error> {
		match &mut self.slots[index as usize] {
			Some(slot) => {
				if slot.kind != kind {
					warn!(
						"option index {index} rebound from kind {} to {kind}",
						slot.kind
					);
					return Err(Error::Malformed);
				}
				if index > INDEX_SACK && slot.payload != payload {
					warn!("generic option at index {index} differs from its context value");
					return Err(Error::Malformed);
				}
				slot.payload = payload.to_vec();
			}
			empty => *empty = Some(Slot { kind, payload: payload.to_vec() }),
		}
		Ok(())
	}

	fn slot_timestamp(&self) -> (u32, u32) {
		match &self.slots[INDEX_TIMESTAMP as usize] {
			Some(slot) if slot.payload.len() == 8 => (
				u32::from_be_bytes([slot.payload[0], slot.payload[1], slot.payload[2], slot.payload[3]]),
				u32::from_be_bytes([slot.payload[4], slot.payload[5], slot.payload[6], slot.payload[7]]),
			),
			_ => (0, 0),
		}
	}

	fn innermost_behavior(&self) -> IpIdBehavior {
		match self.ips.last() {
			Some(IpCtxt::V4 { behavior, .. }) => *behavior,
			_ => IpIdBehavior::Random,
		}
	}

	/// Decode the innermost IP-ID from its transmitted offset bits.
	fn decode_ip_id(&self, bits: u16, k: u8, p: i32, msn: u16) -> u16 {
		let Some(IpCtxt::V4 { last_id, behavior, .. }) = self.ips.last() else {
			return 0;
		};
		match behavior {
			IpIdBehavior::SequentialSwapped => {
				let offset_ref = swab16(*last_id).wrapping_sub(self.msn);
				let offset = decode16(bits, k, p, offset_ref);
				swab16(msn.wrapping_add(offset))
			}
			_ => {
				let offset_ref = last_id.wrapping_sub(self.msn);
				let offset = decode16(bits, k, p, offset_ref);
				msn.wrapping_add(offset)
			}
		}
	}

	fn decode_co(&mut self, co: &[u8], out: &mut [u8]) -> Result<usize, Error> {
		if !self.full {
			warn!("CO packet before any IR established the context");
			return Err(Error::NoContext);
		}

		let b0 = *co.first().ok_or(Error::Malformed)?;
		let seq_flow = self.innermost_behavior().is_sequential();

		let format = match b0 >> 4 {
			0x0..=0x7 => if seq_flow { CoFormat::Seq4 } else { CoFormat::Rnd3 },
			0x8 => if seq_flow { CoFormat::Seq5 } else { CoFormat::Rnd5 },
			0x9 => if seq_flow { CoFormat::Seq3 } else { CoFormat::Rnd5 },
			0xa => if seq_flow { CoFormat::Seq1 } else { CoFormat::Rnd6 },
			0xb => {
				if seq_flow {
					CoFormat::Seq8
				} else if b0 & 0x08 == 0 {
					CoFormat::Rnd8
				} else if b0 & 0x04 != 0 {
					CoFormat::Rnd7
				} else {
					CoFormat::Rnd1
				}
			}
			0xc => if seq_flow { CoFormat::Seq7 } else { CoFormat::Rnd2 },
			0xd => {
				if !seq_flow {
					CoFormat::Rnd4
				} else if b0 & 0x08 != 0 {
					CoFormat::Seq6
				} else {
					CoFormat::Seq2
				}
			}
			0xf if b0 & 0xfe == 0xfa => CoFormat::CoCommon,
			_ => {
				warn!("unknown CO discriminator 0x{b0:02x}");
				return Err(Error::Unsupported);
			}
		};
		debug!("CO format {format:?}");

		match format {
			CoFormat::CoCommon => self.decode_co_common(co, out),
			_ => self.decode_co_fixed(format, co, out),
		}
	}

	/// The sixteen fixed-layout rnd/seq formats.
	fn decode_co_fixed(&mut self, format: CoFormat, co: &[u8], out: &mut [u8]) -> Result<usize, Error> {
		use CoFormat::*;

		// Fixed size, plus where the CRC bits live inside the header.
		let (size, crc_idx, crc_mask, crc_shift) = match format {
			Rnd1 => (4, 3, 0x07, 0),
			Rnd2 => (2, 1, 0x07, 0),
			Rnd3 => (3, 2, 0x07, 0),
			Rnd4 => (2, 1, 0x07, 0),
			Rnd5 => (5, 1, 0xe0, 5),
			Rnd6 => (4, 0, 0x0e, 1),
			Rnd7 => (6, 5, 0x07, 0),
			Rnd8 => (7, 1, 0xfe, 1),
			Seq1 => (4, 3, 0x07, 0),
			Seq2 => (3, 2, 0x07, 0),
			Seq3 => (4, 3, 0x07, 0),
			Seq4 => (2, 1, 0x07, 0),
			Seq5 => (6, 5, 0x07, 0),
			Seq6 => (5, 4, 0x07, 0),
			Seq7 => (6, 5, 0x07, 0),
			Seq8 => (7, 1, 0x7f, 0),
			CoCommon => unreachable!("co_common has its own decoder"),
		};

		if co.len() < size {
			return Err(Error::Malformed);
		}
		let hdr = &co[..size];

		// The list-bearing formats protect the options with the CRC too.
		let list_present = match format {
			Rnd8 => hdr[0] & 0x01 != 0,
			Seq8 => hdr[1] & 0x80 != 0,
			_ => false,
		};

		let mut work = self.clone();
		let mut r = Reader::new(&co[size..]);
		let options = if list_present {
			let ack_ref = self.old_tcp.ack;
			Some(work.parse_options_list(&mut r, true, ack_ref)?)
		} else {
			None
		};
		let covered = size + r.pos();

		let wide_crc = matches!(format, Rnd8 | Seq8);
		let received_crc = (hdr[crc_idx] & crc_mask) >> crc_shift;
		let computed_crc = crc_with_zeroed_field(&co[..covered], crc_idx, crc_mask, wide_crc);
		if received_crc != computed_crc {
			warn!(
				"CO header CRC mismatch (got 0x{received_crc:02x}, computed 0x{computed_crc:02x})"
			);
			return Err(Error::Crc);
		}

		// Every format carries a 4-bit MSN.
		let msn_bits = match format {
			Rnd1 | Rnd2 | Rnd3 | Rnd4 | Rnd7 | Seq1 | Seq2 | Seq3 | Seq4 | Seq5 | Seq6 | Seq7 => {
				(hdr[size - 1] >> 4) as u16
			}
			Rnd5 => (hdr[0] & 0x0f) as u16,
			Rnd6 => (hdr[3] >> 4) as u16,
			Rnd8 => (((hdr[1] & 0x01) << 3) | (hdr[2] >> 5)) as u16,
			Seq8 => (hdr[2] >> 4) as u16,
			CoCommon => unreachable!(),
		};
		let msn = decode16(msn_bits, 4, 4, self.msn.wrapping_add(1));
		debug!("MSN = 0x{msn:04x}");

		let mut tcp = self.old_tcp.clone();
		let mut ip_id = None;
		let mut seq_scaled_used = None;
		let mut ack_scaled_used = None;
		let mut ttl_update = None;

		match format {
			Rnd1 => {
				let bits = ((hdr[0] as u32 & 0x03) << 16)
					| (hdr[1] as u32) << 8 | hdr[2] as u32;
				tcp.seq = decode32(bits, 18, 65535, self.old_tcp.seq);
				tcp.psh_flag = hdr[3] & 0x08 != 0;
			}
			Rnd2 => {
				seq_scaled_used =
					Some(decode32((hdr[0] & 0x0f) as u32, 4, 7, self.seq_scaled));
				tcp.psh_flag = hdr[1] & 0x08 != 0;
			}
			Rnd3 => {
				let bits = ((hdr[0] as u32 & 0x7f) << 8) | hdr[1] as u32;
				tcp.ack = decode32(bits, 15, 8191, self.old_tcp.ack);
				tcp.psh_flag = hdr[2] & 0x08 != 0;
			}
			Rnd4 => {
				if self.ack_stride == 0 {
					warn!("rnd_4 needs a non-zero ack stride");
					return Err(Error::Malformed);
				}
				ack_scaled_used =
					Some(decode32((hdr[0] & 0x0f) as u32, 4, 3, self.ack_scaled));
				tcp.psh_flag = hdr[1] & 0x08 != 0;
			}
			Rnd5 => {
				tcp.psh_flag = hdr[0] & 0x10 != 0;
				let seq_bits = ((hdr[1] as u32 & 0x1f) << 9)
					| (hdr[2] as u32) << 1 | (hdr[3] >> 7) as u32;
				tcp.seq = decode32(seq_bits, 14, 8191, self.old_tcp.seq);
				let ack_bits = ((hdr[3] as u32 & 0x7f) << 8) | hdr[4] as u32;
				tcp.ack = decode32(ack_bits, 15, 8191, self.old_tcp.ack);
			}
			Rnd6 => {
				tcp.psh_flag = hdr[0] & 0x01 != 0;
				let bits = ((hdr[1] as u32) << 8) | hdr[2] as u32;
				tcp.ack = decode32(bits, 16, 16383, self.old_tcp.ack);
				seq_scaled_used =
					Some(decode32((hdr[3] & 0x0f) as u32, 4, 7, self.seq_scaled));
			}
			Rnd7 => {
				let bits = ((hdr[0] as u32 & 0x03) << 16)
					| (hdr[1] as u32) << 8 | hdr[2] as u32;
				tcp.ack = decode32(bits, 18, 65535, self.old_tcp.ack);
				tcp.window = u16::from_be_bytes([hdr[3], hdr[4]]);
				tcp.psh_flag = hdr[5] & 0x08 != 0;
			}
			Rnd8 => {
				tcp.rsf_flags = rsf_index_dec((hdr[0] >> 1) & 0x03);
				tcp.psh_flag = hdr[2] & 0x10 != 0;
				ttl_update = Some(decode16(((hdr[2] >> 1) & 0x07) as u16, 3, 3, self.innermost_ttl() as u16) as u8);
				work.ecn_used = hdr[2] & 0x01 != 0;
				tcp.seq = decode32(
					u16::from_be_bytes([hdr[3], hdr[4]]) as u32,
					16,
					65535,
					self.old_tcp.seq,
				);
				tcp.ack = decode32(
					u16::from_be_bytes([hdr[5], hdr[6]]) as u32,
					16,
					16383,
					self.old_tcp.ack,
				);
			}
			Seq1 => {
				ip_id = Some(self.decode_ip_id((hdr[0] & 0x0f) as u16, 4, 3, msn));
				tcp.seq = decode32(
					u16::from_be_bytes([hdr[1], hdr[2]]) as u32,
					16,
					32767,
					self.old_tcp.seq,
				);
				tcp.psh_flag = hdr[3] & 0x08 != 0;
			}
			Seq2 => {
				let id_bits = (((hdr[0] & 0x07) as u16) << 4) | (hdr[1] >> 4) as u16;
				ip_id = Some(self.decode_ip_id(id_bits, 7, 3, msn));
				seq_scaled_used =
					Some(decode32((hdr[1] & 0x0f) as u32, 4, 7, self.seq_scaled));
				tcp.psh_flag = hdr[2] & 0x08 != 0;
			}
			Seq3 => {
				ip_id = Some(self.decode_ip_id((hdr[0] & 0x0f) as u16, 4, 3, msn));
				tcp.ack = decode32(
					u16::from_be_bytes([hdr[1], hdr[2]]) as u32,
					16,
					16383,
					self.old_tcp.ack,
				);
				tcp.psh_flag = hdr[3] & 0x08 != 0;
			}
			Seq4 => {
				if self.ack_stride == 0 {
					warn!("seq_4 needs a non-zero ack stride");
					return Err(Error::Malformed);
				}
				ack_scaled_used =
					Some(decode32(((hdr[0] >> 3) & 0x0f) as u32, 4, 3, self.ack_scaled));
				ip_id = Some(self.decode_ip_id((hdr[0] & 0x07) as u16, 3, 1, msn));
				tcp.psh_flag = hdr[1] & 0x08 != 0;
			}
			Seq5 => {
				ip_id = Some(self.decode_ip_id((hdr[0] & 0x0f) as u16, 4, 3, msn));
				tcp.ack = decode32(
					u16::from_be_bytes([hdr[1], hdr[2]]) as u32,
					16,
					16383,
					self.old_tcp.ack,
				);
				tcp.seq = decode32(
					u16::from_be_bytes([hdr[3], hdr[4]]) as u32,
					16,
					32767,
					self.old_tcp.seq,
				);
				tcp.psh_flag = hdr[5] & 0x08 != 0;
			}
			Seq6 => {
				let scaled_bits = (((hdr[0] & 0x07) << 1) | (hdr[1] >> 7)) as u32;
				seq_scaled_used = Some(decode32(scaled_bits, 4, 7, self.seq_scaled));
				ip_id = Some(self.decode_ip_id((hdr[1] & 0x7f) as u16, 7, 3, msn));
				tcp.ack = decode32(
					u16::from_be_bytes([hdr[2], hdr[3]]) as u32,
					16,
					16383,
					self.old_tcp.ack,
				);
				tcp.psh_flag = hdr[4] & 0x08 != 0;
			}
			Seq7 => {
				let window_bits = ((hdr[0] as u32 & 0x0f) << 11)
					| (hdr[1] as u32) << 3 | (hdr[2] >> 5) as u32;
				tcp.window =
					decode32(window_bits, 15, 16383, self.old_tcp.window as u32) as u16;
				ip_id = Some(self.decode_ip_id((hdr[2] & 0x1f) as u16, 5, 3, msn));
				tcp.ack = decode32(
					u16::from_be_bytes([hdr[3], hdr[4]]) as u32,
					16,
					32767,
					self.old_tcp.ack,
				);
				tcp.psh_flag = hdr[5] & 0x08 != 0;
			}
			Seq8 => {
				ip_id = Some(self.decode_ip_id((hdr[0] & 0x0f) as u16, 4, 3, msn));
				tcp.psh_flag = hdr[2] & 0x08 != 0;
				ttl_update = Some(decode16((hdr[2] & 0x07) as u16, 3, 3, self.innermost_ttl() as u16) as u8);
				work.ecn_used = hdr[3] & 0x80 != 0;
				let ack_bits = ((hdr[3] as u32 & 0x7f) << 8) | hdr[4] as u32;
				tcp.ack = decode32(ack_bits, 15, 8191, self.old_tcp.ack);
				tcp.rsf_flags = rsf_index_dec(hdr[5] >> 6);
				let seq_bits = ((hdr[5] as u32 & 0x3f) << 8) | hdr[6] as u32;
				tcp.seq = decode32(seq_bits, 14, 8191, self.old_tcp.seq);
			}
			CoCommon => unreachable!(),
		}

		work.finish_co(co, covered, msn, tcp, ip_id, seq_scaled_used, ack_scaled_used, ttl_update, false, options, out)
			.map(|len| {
				*self = work;
				len
			})
	}

	fn decode_co_common(&mut self, co: &[u8], out: &mut [u8]) -> Result<usize, Error> {
		if co.len() < 5 {
			return Err(Error::Malformed);
		}

		let ttl_outer_flag = co[0] & 0x01 != 0;
		let ack_flag = co[1] & 0x80 != 0;
		let psh_flag = co[1] & 0x40 != 0;
		let rsf_bits = (co[1] >> 4) & 0x03;
		let msn_bits = (co[1] & 0x0f) as u16;
		let seq_ind = co[2] >> 6;
		let ack_ind = (co[2] >> 4) & 0x03;
		let ack_stride_ind = co[2] & 0x08 != 0;
		let window_ind = co[2] & 0x04 != 0;
		let ip_id_ind = co[2] & 0x02 != 0;
		let urg_ptr_present = co[2] & 0x01 != 0;
		let ecn_used = co[3] & 0x40 != 0;
		let dscp_present = co[3] & 0x20 != 0;
		let ttl_present = co[3] & 0x10 != 0;
		let list_present = co[3] & 0x08 != 0;
		let behavior = IpIdBehavior::from_bits((co[3] >> 1) & 0x03);
		let urg_flag = co[3] & 0x01 != 0;
		let df = co[4] & 0x80 != 0;
		let received_crc = co[4] & 0x7f;

		let mut work = self.clone();
		let mut r = Reader::new(&co[5..]);

		let mut tcp = self.old_tcp.clone();
		tcp.ack_flag = ack_flag;
		tcp.psh_flag = psh_flag;
		tcp.rsf_flags = rsf_index_dec(rsf_bits);
		tcp.urg_flag = urg_flag;

		let msn = decode16(msn_bits, 4, 4, self.msn.wrapping_add(1));

		tcp.seq = variable_length_32(&mut r, seq_ind, self.old_tcp.seq)?;
		tcp.ack = variable_length_32(&mut r, ack_ind, self.old_tcp.ack)?;
		if ack_stride_ind {
			work.ack_stride = r.u16be()?;
			if work.ack_stride != 0 {
				work.ack_residue = tcp.ack % work.ack_stride as u32;
				work.ack_scaled = tcp.ack / work.ack_stride as u32;
			}
		}
		if window_ind {
			tcp.window = r.u16be()?;
		}

		// The IP-ID field is only present for the sequential behaviors.
		let mut ip_id = None;
		if behavior.is_sequential() {
			let bits = if ip_id_ind { r.u16be()? } else { r.u8()? as u16 };
			let k = if ip_id_ind { 16 } else { 8 };
			// Record the behavior before decoding against it.
			work.set_innermost_behavior(behavior);
			ip_id = Some(work.decode_ip_id_against(self, bits, k, 3, msn));
		} else {
			work.set_innermost_behavior(behavior);
		}
		if urg_ptr_present {
			tcp.urg_ptr = r.u16be()?;
		}
		work.ecn_used = ecn_used;
		if dscp_present {
			work.set_innermost_dscp(r.u8()?);
		}
		if ttl_present {
			work.set_innermost_ttl(r.u8()?);
		}
		work.set_innermost_df(df);

		let options = if list_present {
			Some(work.parse_options_list(&mut r, true, tcp.ack)?)
		} else {
			None
		};

		let covered = 5 + r.pos();
		let computed_crc = crc_with_zeroed_field(&co[..covered], 4, 0x7f, true);
		if received_crc != computed_crc {
			warn!(
				"co_common CRC-7 mismatch (got 0x{received_crc:02x}, computed 0x{computed_crc:02x})"
			);
			return Err(Error::Crc);
		}

		work.finish_co(co, covered, msn, tcp, ip_id, None, None, None, ttl_outer_flag, options, out)
			.map(|len| {
				*self = work;
				len
			})
	}

	/// The shared tail of every CO decode: irregular chain, scaled
	/// numbers, header rebuild and context commit.
	#[allow(clippy::too_many_arguments)]
	fn finish_co(
		&mut self,
		co: &[u8],
		mut consumed: usize,
		msn: u16,
		mut tcp: TcpFields,
		ip_id: Option<u16>,
		seq_scaled: Option<u32>,
		ack_scaled: Option<u32>,
		ttl_update: Option<u8>,
		ttl_outer_flag: bool,
		options: Option<Vec<u8>>,
		out: &mut [u8],
	) -> Result<usize, Error> {
		let mut r = Reader::new(&co[consumed..]);

		// Irregular chain: random IP-IDs, outer DSCP/TTL refreshes, the
		// ECN octet and the genuine TCP checksum.
		let innermost = self.ips.len() - 1;
		let mut rand_ids = [None; 2];
		for pos in 0..self.ips.len() {
			if let IpCtxt::V4 { behavior: IpIdBehavior::Random, .. } = self.ips[pos] {
				rand_ids[pos] = Some(r.u16be()?);
			}
			if pos != innermost && ttl_outer_flag {
				let dscp_ecn = r.u8()?;
				let ttl = r.u8()?;
				match &mut self.ips[pos] {
					IpCtxt::V4 { dscp_ecn: d, ttl: t, .. } => {
						*d = dscp_ecn;
						*t = ttl;
					}
					IpCtxt::V6 { dscp_ecn: d, hl, .. } => {
						*d = dscp_ecn;
						*hl = ttl;
					}
				}
			}
		}
		if self.ecn_used {
			let b = r.u8()?;
			let ecn = (b >> 6) & 0x03;
			match &mut self.ips[innermost] {
				IpCtxt::V4 { dscp_ecn, .. } | IpCtxt::V6 { dscp_ecn, .. } => {
					*dscp_ecn = (*dscp_ecn & 0xfc) | ecn;
				}
			}
			tcp.ecn_flags = (b >> 4) & 0x03;
			tcp.res_flags = b & 0x0f;
		} else {
			tcp.ecn_flags = 0;
			tcp.res_flags = 0;
			match &mut self.ips[innermost] {
				IpCtxt::V4 { dscp_ecn, .. } | IpCtxt::V6 { dscp_ecn, .. } => {
					*dscp_ecn &= 0xfc;
				}
			}
		}
		tcp.checksum = r.u16be()?;
		consumed += r.pos();

		let payload = &co[consumed..];

		// Scaled fields resolve once the payload length is known.
		if let Some(scaled) = seq_scaled {
			if payload.is_empty() {
				warn!("scaled sequence number without a payload");
				return Err(Error::Malformed);
			}
			tcp.seq = scaled
				.wrapping_mul(payload.len() as u32)
				.wrapping_add(self.seq_residue);
			self.seq_scaled = scaled;
		}
		if let Some(scaled) = ack_scaled {
			tcp.ack = scaled
				.wrapping_mul(self.ack_stride as u32)
				.wrapping_add(self.ack_residue);
			self.ack_scaled = scaled;
		}

		if let Some(ttl) = ttl_update {
			self.set_innermost_ttl(ttl);
		}

		// Commit the innermost IP-ID.
		let mut ids = self.collect_ids();
		for pos in 0..self.ips.len() {
			if let Some(id) = rand_ids[pos] {
				ids[pos] = id;
				if let IpCtxt::V4 { last_id, .. } = &mut self.ips[pos] {
					*last_id = id;
				}
			}
		}
		let msn_delta = msn.wrapping_sub(self.msn);
		if let Some(IpCtxt::V4 { behavior, last_id, .. }) = self.ips.last_mut() {
			match behavior {
				IpIdBehavior::Zero => {
					*last_id = 0;
					ids[innermost] = 0;
				}
				IpIdBehavior::Sequential | IpIdBehavior::SequentialSwapped => {
					// Without transmitted bits the IP-ID keeps following
					// the MSN at its established offset.
					let id = ip_id.unwrap_or(match behavior {
						IpIdBehavior::SequentialSwapped => {
							swab16(swab16(*last_id).wrapping_add(msn_delta))
						}
						_ => last_id.wrapping_add(msn_delta),
					});
					*last_id = id;
					ids[innermost] = id;
				}
				IpIdBehavior::Random => {}
			}
		}

		// Scaling state follows the decoded packet, ready for the next one.
		if !payload.is_empty() {
			self.seq_scaled = tcp.seq / payload.len() as u32;
			self.seq_residue = tcp.seq % payload.len() as u32;
		}
		if self.ack_stride != 0 {
			self.ack_residue = tcp.ack % self.ack_stride as u32;
			self.ack_scaled = tcp.ack / self.ack_stride as u32;
		}

		self.msn = msn;
		self.old_tcp = tcp;

		let opts = options.unwrap_or_default();
		self.rebuild(&ids, &opts, payload, out)
	}

	fn collect_ids(&self) -> Vec<u16> {
		self.ips
			.iter()
			.map(|ip| match ip {
				IpCtxt::V4 { last_id, .. } => *last_id,
				IpCtxt::V6 { .. } => 0,
			})
			.collect()
	}

	fn innermost_ttl(&self) -> u8 {
		match self.ips.last() {
			Some(IpCtxt::V4 { ttl, .. }) => *ttl,
			Some(IpCtxt::V6 { hl, .. }) => *hl,
			None => 0,
		}
	}

	fn set_innermost_ttl(&mut self, v: u8) {
		match self.ips.last_mut() {
			Some(IpCtxt::V4 { ttl, .. }) => *ttl = v,
			Some(IpCtxt::V6 { hl, .. }) => *hl = v,
			None => {}
		}
	}

	fn set_innermost_dscp(&mut self, dscp: u8) {
		if let Some(IpCtxt::V4 { dscp_ecn, .. } | IpCtxt::V6 { dscp_ecn, .. }) =
			self.ips.last_mut()
		{
			*dscp_ecn = (dscp << 2) | (*dscp_ecn & 0x03);
		}
	}

	fn set_innermost_df(&mut self, v: bool) {
		if let Some(IpCtxt::V4 { df, .. }) = self.ips.last_mut() {
			*df = v;
		}
	}

	fn set_innermost_behavior(&mut self, b: IpIdBehavior) {
		if let Some(IpCtxt::V4 { behavior, .. }) = self.ips.last_mut() {
			*behavior = b;
		}
	}

	/// Like [`Self::decode_ip_id`] but reading the reference state from
	/// `reference` (the unmodified context) while `self` already carries
	/// the staged behavior.
	fn decode_ip_id_against(&self, reference: &Context, bits: u16, k: u8, p: i32, msn: u16) -> u16 {
		let behavior = self.innermost_behavior();
		let Some(IpCtxt::V4 { last_id, .. }) = reference.ips.last() else {
			return 0;
		};
		match behavior {
			IpIdBehavior::SequentialSwapped => {
				let offset_ref = swab16(*last_id).wrapping_sub(reference.msn);
				let offset = decode16(bits, k, p, offset_ref);
				swab16(msn.wrapping_add(offset))
			}
			_ => {
				let offset_ref = last_id.wrapping_sub(reference.msn);
				let offset = decode16(bits, k, p, offset_ref);
				msn.wrapping_add(offset)
			}
		}
	}

	/// Serialise IP headers, the TCP header with its options, and the
	/// payload; recompute lengths and the IPv4 checksum. The TCP fields
	/// come from `old_tcp`, which the caller has already committed.
	fn rebuild(
		&self,
		ids: &[u16],
		options: &[u8],
		payload: &[u8],
		out: &mut [u8],
	) -> Result<usize, Error> {
		let fields = &self.old_tcp;
		let tcp_len = tcp::HEADER_LEN + options.len();
		let ip_lens: Vec<usize> = self
			.ips
			.iter()
			.map(|ip| match ip {
				IpCtxt::V4 { .. } => ipv4::HEADER_LEN,
				IpCtxt::V6 { .. } => ipv6::HEADER_LEN,
			})
			.collect();

		let mut w = Writer::new(out);
		for (pos, ip) in self.ips.iter().enumerate() {
			let trailing =
				tcp_len + payload.len() + ip_lens[pos + 1..].iter().sum::<usize>();
			match ip {
				IpCtxt::V4 { protocol, src, dst, dscp_ecn, ttl, df, .. } => {
					ipv4::Header {
						tos: *dscp_ecn,
						id: ids[pos],
						dont_fragment: *df,
						ttl: *ttl,
						protocol: *protocol,
						src: *src,
						dst: *dst,
						total_len: 0,
						checksum: 0,
						is_fragment: false,
					}
					.write(&mut w, trailing)?;
				}
				IpCtxt::V6 { next_header, flow_label, src, dst, dscp_ecn, hl } => {
					ipv6::Header {
						traffic_class: *dscp_ecn,
						flow_label: *flow_label,
						next_header: *next_header,
						hop_limit: *hl,
						src: *src,
						dst: *dst,
						payload_len: 0,
					}
					.write(&mut w, trailing)?;
				}
			}
		}

		let hdr = tcp::Header {
			src_port: self.src_port,
			dst_port: self.dst_port,
			seq: fields.seq,
			ack: fields.ack,
			data_offset: (tcp_len / 4) as u8,
			res_flags: fields.res_flags,
			ecn_flags: fields.ecn_flags,
			urg_flag: fields.urg_flag,
			ack_flag: fields.ack_flag,
			psh_flag: fields.psh_flag,
			rsf_flags: fields.rsf_flags,
			window: fields.window,
			checksum: fields.checksum,
			urg_ptr: fields.urg_ptr,
			options: options.to_vec(),
		};
		hdr.write(&mut w)?;

		w.slice(payload)?;
		Ok(w.pos())
	}
}

/// `rsf_index_dec`, RFC 6846: two bits name one of RST/SYN/FIN or none.
fn rsf_index_dec(bits: u8) -> u8 {
	match bits & 0x03 {
		1 => 0x04, // RST
		2 => 0x02, // SYN
		3 => 0x01, // FIN
		_ => 0,
	}
}

/// `variable_length_32`: 0, 1, 2 or 4 bytes of a 32-bit field; absent
/// means "keep the context value", short forms replace the low bits.
fn variable_length_32(r: &mut Reader, indicator: u8, reference: u32) -> Result<u32, Error> {
	Ok(match indicator {
		0 => reference,
		1 => (reference & 0xffff_ff00) | r.u8()? as u32,
		2 => (reference & 0xffff_0000) | r.u16be()? as u32,
		_ => r.u32be()?,
	})
}

/// The variable-length timestamp LSB encoding of RFC 6846 section
/// 6.3.4: 7, 14, 21 or 29 bits after a 1-3 bit discriminator.
fn ts_lsb(r: &mut Reader, reference: u32) -> Result<u32, Error> {
	let b0 = r.u8()?;
	Ok(if b0 & 0x80 == 0 {
		decode32((b0 & 0x7f) as u32, 7, -1, reference)
	} else if b0 & 0x40 == 0 {
		let bits = ((b0 as u32 & 0x3f) << 8) | r.u8()? as u32;
		decode32(bits, 14, -1, reference)
	} else if b0 & 0x20 == 0 {
		let bits = ((b0 as u32 & 0x1f) << 16) | (r.u8()? as u32) << 8 | r.u8()? as u32;
		decode32(bits, 21, -1, reference)
	} else {
		let rest = r.array::<3>()?;
		let bits = ((b0 as u32 & 0x1f) << 24)
			| (rest[0] as u32) << 16 | (rest[1] as u32) << 8 | rest[2] as u32;
		decode32(bits, 29, -1, reference)
	})
}

/// One pure-LSB SACK field: a self-describing 15/22/29-bit delta, or a
/// full 32-bit value, added onto `base`.
fn sack_pure_lsb(r: &mut Reader, base: u32) -> Result<u32, Error> {
	let b0 = r.u8()?;
	let delta = if b0 & 0x80 == 0 {
		((b0 as u32) << 8) | r.u8()? as u32
	} else if b0 & 0x40 == 0 {
		((b0 as u32 & 0x3f) << 16) | (r.u8()? as u32) << 8 | r.u8()? as u32
	} else if b0 != 0xff {
		let rest = r.array::<3>()?;
		((b0 as u32 & 0x1f) << 24)
			| (rest[0] as u32) << 16 | (rest[1] as u32) << 8 | rest[2] as u32
	} else {
		return r.u32be().map_err(Into::into);
	};
	Ok(base.wrapping_add(delta))
}

/// A compressed SACK item: a block count, then each block as two
/// pure-LSB fields chained off the ACK number. Returns the raw 8-byte
/// blocks of the rebuilt option.
fn parse_sack_compressed(r: &mut Reader, ack: u32) -> Result<Vec<u8>, Error> {
	let count = r.u8()?;
	if count == 0 || count > 4 {
		return Err(Error::Malformed);
	}

	let mut blocks = Vec::with_capacity(count as usize * 8);
	let mut base = ack;
	for _ in 0..count {
		let start = sack_pure_lsb(r, base)?;
		let end = sack_pure_lsb(r, start)?;
		blocks.extend_from_slice(&start.to_be_bytes());
		blocks.extend_from_slice(&end.to_be_bytes());
		base = end;
	}
	Ok(blocks)
}

/// Compute the format's CRC with the CRC bits themselves zeroed.
fn crc_with_zeroed_field(data: &[u8], crc_idx: usize, mask: u8, wide: bool) -> u8 {
	let mut acc = if wide { crc::CRC_INIT_7 } else { crc::CRC_INIT_3 };
	for (i, &b) in data.iter().enumerate() {
		let b = if i == crc_idx { b & !mask } else { b };
		acc = if wide { crc::crc7(acc, &[b]) } else { crc::crc3(acc, &[b]) };
	}
	acc
}

fn parse_static_ip(r: &mut Reader, ips: &mut Vec<IpCtxt>) -> Result<Protocol, Error> {
	let b0 = r.u8()?;
	if b0 & 0x80 == 0 {
		let protocol = Protocol::from(r.u8()?);
		let src = Ipv4Addr::from(r.array::<4>()?);
		let dst = Ipv4Addr::from(r.array::<4>()?);
		ips.push(IpCtxt::V4 {
			protocol,
			src,
			dst,
			dscp_ecn: 0,
			ttl: 0,
			df: false,
			last_id: 0,
			behavior: IpIdBehavior::Random,
		});
		Ok(protocol)
	} else {
		let flow_label = if b0 & 0x10 != 0 {
			((b0 as u32 & 0x0f) << 16) | r.u16be()? as u32
		} else {
			0
		};
		let next_header = Protocol::from(r.u8()?);
		let src = Ipv6Addr::from(r.array::<16>()?);
		let dst = Ipv6Addr::from(r.array::<16>()?);
		ips.push(IpCtxt::V6 { next_header, flow_label, src, dst, dscp_ecn: 0, hl: 0 });
		Ok(next_header)
	}
}

fn parse_dynamic_ip(r: &mut Reader, ip: &mut IpCtxt) -> Result<(), Error> {
	match ip {
		IpCtxt::V4 { dscp_ecn, ttl, df, last_id, behavior, .. } => {
			let b0 = r.u8()?;
			*df = b0 & 0x04 != 0;
			*behavior = IpIdBehavior::from_bits(b0);
			*dscp_ecn = r.u8()?;
			*ttl = r.u8()?;
			*last_id = if *behavior == IpIdBehavior::Zero { 0 } else { r.u16be()? };
		}
		IpCtxt::V6 { dscp_ecn, hl, .. } => {
			*dscp_ecn = r.u8()?;
			*hl = r.u8()?;
		}
	}
	Ok(())
}
