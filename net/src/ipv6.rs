use core::net::Ipv6Addr;

use bilge::prelude::*;
use utils::bytes::{Reader, Truncated, Writer};

use crate::{ParseError, Protocol};

pub const HEADER_LEN: usize = 40;

#[bitsize(32)]
#[derive(FromBits)]
struct Prefix {
	flow_label: u20,
	traffic_class: u8,
	ver: u4,
}

/// An IPv6 base header. Extension headers are not modelled; flows that
/// carry them are rejected at profile admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
	pub traffic_class: u8,
	pub flow_label: u32,
	pub next_header: Protocol,
	pub hop_limit: u8,
	pub src: Ipv6Addr,
	pub dst: Ipv6Addr,
	/// Payload length as carried by the packet. Recomputed on write.
	pub payload_len: u16,
}

impl Header {
	pub fn parse(r: &mut Reader) -> Result<Self, ParseError> {
		let prefix = Prefix::from(r.u32be()?);
		if prefix.ver().value() != 6 {
			return Err(ParseError::Version(prefix.ver().value()));
		}

		let payload_len = r.u16be()?;
		let next_header = Protocol::from(r.u8()?);
		let hop_limit = r.u8()?;
		let src = Ipv6Addr::from(r.array::<16>()?);
		let dst = Ipv6Addr::from(r.array::<16>()?);

		Ok(Self {
			traffic_class: prefix.traffic_class(),
			flow_label: prefix.flow_label().value(),
			next_header,
			hop_limit,
			src,
			dst,
			payload_len,
		})
	}

	/// Serialise the header with a recomputed payload length.
	pub fn write(&self, w: &mut Writer, payload_len: usize) -> Result<(), Truncated> {
		w.u32be(Prefix::new(u20::new(self.flow_label), self.traffic_class, u4::new(6)).into())?;
		w.u16be(payload_len as u16)?;
		w.u8(self.next_header.into())?;
		w.u8(self.hop_limit)?;
		w.slice(&self.src.octets())?;
		w.slice(&self.dst.octets())?;
		Ok(())
	}
}
