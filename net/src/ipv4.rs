use core::net::Ipv4Addr;

use bilge::prelude::*;
use utils::bytes::{Reader, Truncated, Writer};

use crate::{Checksum, ParseError, Protocol};

pub const HEADER_LEN: usize = 20;

#[bitsize(8)]
#[derive(FromBits)]
struct Meta {
	ihl: u4,
	ver: u4,
}

#[bitsize(16)]
#[derive(FromBits)]
struct Fragment {
	ofst: u13,
	more: bool,
	dont: bool,
	reserved: bool,
}

/// An IPv4 header without options, the only shape the profiles accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
	pub tos: u8,
	pub id: u16,
	pub dont_fragment: bool,
	pub ttl: u8,
	pub protocol: Protocol,
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	/// Total length as carried by the packet. Recomputed on write.
	pub total_len: u16,
	/// Header checksum as carried by the packet. Recomputed on write.
	pub checksum: u16,
	/// Whether the packet is a fragment (offset != 0 or MF set).
	pub is_fragment: bool,
}

impl Header {
	pub fn parse(r: &mut Reader) -> Result<Self, ParseError> {
		let meta = Meta::from(r.u8()?);
		if meta.ver().value() != 4 {
			return Err(ParseError::Version(meta.ver().value()));
		}
		if meta.ihl().value() != 5 {
			// IP options are not supported by any of the profiles.
			return Err(ParseError::Malformed);
		}

		let tos = r.u8()?;
		let total_len = r.u16be()?;
		let id = r.u16be()?;
		let frag = Fragment::from(r.u16be()?);
		let ttl = r.u8()?;
		let protocol = Protocol::from(r.u8()?);
		let checksum = r.u16be()?;
		let src = Ipv4Addr::from(r.array::<4>()?);
		let dst = Ipv4Addr::from(r.array::<4>()?);

		Ok(Self {
			tos,
			id,
			dont_fragment: frag.dont(),
			ttl,
			protocol,
			src,
			dst,
			total_len,
			checksum,
			is_fragment: frag.more() || frag.ofst().value() != 0,
		})
	}

	/// Serialise the header with a recomputed length and checksum.
	pub fn write(&self, w: &mut Writer, payload_len: usize) -> Result<(), Truncated> {
		let start = w.pos();

		w.u8(Meta::new(u4::new(5), u4::new(4)).into())?;
		w.u8(self.tos)?;
		w.u16be((HEADER_LEN + payload_len) as u16)?;
		w.u16be(self.id)?;
		w.u16be(Fragment::new(u13::new(0), false, self.dont_fragment).into())?;
		w.u8(self.ttl)?;
		w.u8(self.protocol.into())?;
		w.u16be(0)?;
		w.slice(&self.src.octets())?;
		w.slice(&self.dst.octets())?;

		let csum = Checksum::of(&w.written()[start..start + HEADER_LEN]).end();
		w.set(start + 10, csum[0]);
		w.set(start + 11, csum[1]);

		Ok(())
	}

	/// Whether the stored header checksum matches the other fields.
	pub fn checksum_valid(&self, raw: &[u8]) -> bool {
		raw.len() >= HEADER_LEN && Checksum::of(&raw[..HEADER_LEN]).end() == [0, 0]
	}
}
