//! CID encoding, RFC 5795 section 5.2.
//!
//! Small CIDs ride in an Add-CID octet (`1110` + 4 bits) before the
//! packet; CID 0 is implicit. Large CIDs are 1-2 self-describing bytes
//! placed *after* the first packet octet: `0xxxxxxx` for 0-127,
//! `10xxxxxx xxxxxxxx` for 128-16383.

use utils::bytes::{Reader, Truncated, Writer};

use crate::{CidType, Error};

pub const ADD_CID_PREFIX: u8 = 0xe0;

/// Where the CID bytes ended up relative to the packet-type octet.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
	/// Index of the packet-type octet.
	pub first_byte: usize,
	/// Index of the first octet after the CID bytes.
	pub after_cid: usize,
}

/// Reserve room for the CID bytes and the packet-type octet. The caller
/// writes the type octet at `first_byte` and continues at `after_cid`.
pub fn encode(w: &mut Writer, cid_type: CidType, cid: u16) -> Result<Layout, Truncated> {
	let base = w.pos();
	match cid_type {
		CidType::Small => {
			if cid != 0 {
				w.u8(ADD_CID_PREFIX | (cid as u8 & 0x0f))?;
			}
			let first_byte = w.pos();
			w.u8(0)?;
			Ok(Layout { first_byte, after_cid: w.pos() })
		}
		CidType::Large => {
			w.u8(0)?;
			if cid < 0x80 {
				w.u8(cid as u8)?;
			} else {
				w.u8(0x80 | (cid >> 8) as u8)?;
				w.u8(cid as u8)?;
			}
			Ok(Layout { first_byte: base, after_cid: w.pos() })
		}
	}
}

/// Parse the CID off an incoming packet. Returns the CID and the layout
/// of the remaining bytes.
pub fn decode(packet: &[u8], cid_type: CidType) -> Result<(u16, Layout), Error> {
	let mut r = Reader::new(packet);
	match cid_type {
		CidType::Small => {
			let mut cid = 0;
			if r.peek()? & 0xf8 == ADD_CID_PREFIX {
				cid = (r.u8()? & 0x0f) as u16;
			}
			let first_byte = r.pos();
			r.skip(1)?;
			Ok((cid, Layout { first_byte, after_cid: r.pos() }))
		}
		CidType::Large => {
			let first_byte = r.pos();
			r.skip(1)?;
			let b = r.u8()?;
			let cid = if b & 0x80 == 0 {
				b as u16
			} else if b & 0xc0 == 0x80 {
				((b as u16 & 0x3f) << 8) | r.u8()? as u16
			} else {
				return Err(Error::Malformed);
			};
			Ok((cid, Layout { first_byte, after_cid: r.pos() }))
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn round_trip(cid_type: CidType, cid: u16) -> (u16, Layout) {
		let mut buf = [0u8; 8];
		let mut w = Writer::new(&mut buf);
		let layout = encode(&mut w, cid_type, cid).unwrap();
		let len = w.pos();
		let (got, parsed) = decode(&buf[..len], cid_type).unwrap();
		assert_eq!(parsed.first_byte, layout.first_byte);
		assert_eq!(parsed.after_cid, layout.after_cid);
		(got, parsed)
	}

	#[test]
	fn small_cids() {
		assert_eq!(round_trip(CidType::Small, 0).0, 0);
		let (cid, layout) = round_trip(CidType::Small, 9);
		assert_eq!(cid, 9);
		assert_eq!(layout.first_byte, 1);
	}

	#[test]
	fn large_cids() {
		for cid in [0u16, 127, 128, 2000, 16383] {
			let (got, layout) = round_trip(CidType::Large, cid);
			assert_eq!(got, cid);
			assert_eq!(layout.first_byte, 0);
			assert_eq!(layout.after_cid, if cid < 128 { 2 } else { 3 });
		}
	}
}
