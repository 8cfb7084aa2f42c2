use utils::bytes::{Reader, Truncated, Writer};

use crate::ParseError;

pub const HEADER_LEN: usize = 20;

/// TCP option kinds, RFC 9293 plus SACK (RFC 2018).
pub const OPT_EOL: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;
pub const OPT_WINDOW_SCALE: u8 = 3;
pub const OPT_SACK_PERMITTED: u8 = 4;
pub const OPT_SACK: u8 = 5;
pub const OPT_TIMESTAMP: u8 = 8;

/// A TCP header plus its raw options bytes.
///
/// The control bits are grouped the way the compressed formats carry them:
/// RST/SYN/FIN together as `rsf_flags`, ECE/CWR together as `ecn_flags`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	pub data_offset: u8,
	/// The reserved nibble between data offset and the flags.
	pub res_flags: u8,
	pub ecn_flags: u8,
	pub urg_flag: bool,
	pub ack_flag: bool,
	pub psh_flag: bool,
	pub rsf_flags: u8,
	pub window: u16,
	pub checksum: u16,
	pub urg_ptr: u16,
	/// Raw option bytes, `(data_offset - 5) * 4` of them.
	pub options: Vec<u8>,
}

impl Header {
	pub fn parse(r: &mut Reader) -> Result<Self, ParseError> {
		let src_port = r.u16be()?;
		let dst_port = r.u16be()?;
		let seq = r.u32be()?;
		let ack = r.u32be()?;

		let raw = r.u16be()?;
		let data_offset = (raw >> 12) as u8;
		if data_offset < 5 {
			return Err(ParseError::Malformed);
		}
		let res_flags = ((raw >> 8) & 0x0f) as u8;
		let flags = (raw & 0xff) as u8;

		let window = r.u16be()?;
		let checksum = r.u16be()?;
		let urg_ptr = r.u16be()?;

		let options = r.take((data_offset as usize - 5) * 4)?.to_vec();

		Ok(Self {
			src_port,
			dst_port,
			seq,
			ack,
			data_offset,
			res_flags,
			ecn_flags: (flags >> 6) & 0x03,
			urg_flag: flags & 0x20 != 0,
			ack_flag: flags & 0x10 != 0,
			psh_flag: flags & 0x08 != 0,
			rsf_flags: flags & 0x07,
			window,
			checksum,
			urg_ptr,
			options,
		})
	}

	pub fn write(&self, w: &mut Writer) -> Result<(), Truncated> {
		w.u16be(self.src_port)?;
		w.u16be(self.dst_port)?;
		w.u32be(self.seq)?;
		w.u32be(self.ack)?;

		let flags = (self.ecn_flags << 6)
			| (self.urg_flag as u8) << 5
			| (self.ack_flag as u8) << 4
			| (self.psh_flag as u8) << 3
			| self.rsf_flags;
		w.u16be(((self.data_offset as u16) << 12) | ((self.res_flags as u16) << 8) | flags as u16)?;

		w.u16be(self.window)?;
		w.u16be(self.checksum)?;
		w.u16be(self.urg_ptr)?;
		w.slice(&self.options)?;
		Ok(())
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.data_offset as usize * 4
	}

	/// Walk the option bytes as (kind, payload) pairs.
	pub fn options(&self) -> OptionIter<'_> {
		OptionIter { data: &self.options }
	}
}

pub struct OptionIter<'a> {
	data: &'a [u8],
}

impl<'a> Iterator for OptionIter<'a> {
	/// Option kind and its payload (without the kind/length bytes).
	type Item = (u8, &'a [u8]);

	fn next(&mut self) -> Option<Self::Item> {
		let (&kind, rest) = self.data.split_first()?;
		match kind {
			OPT_EOL => None,
			OPT_NOP => {
				self.data = rest;
				Some((OPT_NOP, &[]))
			}
			_ => {
				let (&len, rest) = rest.split_first()?;
				let body_len = (len as usize).checked_sub(2)?;
				if rest.len() < body_len {
					return None;
				}
				let (body, rest) = rest.split_at(body_len);
				self.data = rest;
				Some((kind, body))
			}
		}
	}
}
