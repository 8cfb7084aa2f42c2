//! Robust Header Compression (ROHC) engine.
//!
//! Compression implements the ROHCv2 IP-only profile of RFC 5225;
//! decompression additionally speaks the RFC 3095 generic IP profile and
//! the RFC 6846-style TCP profile. The engine performs no I/O: the caller
//! feeds packets in transmission order together with their arrival time
//! and harvests the (de)compressed bytes from its own buffer.

use core::fmt;

use utils::bytes::Truncated;

pub mod cid;
pub mod crc;
pub mod wlsb;

pub mod comp;
pub mod decomp;

/// ROHCv2 IP-only profile (RFC 5225).
pub const PROFILE_RFC5225_IP: u16 = 0x0104;
/// RFC 3095 IP-only profile.
pub const PROFILE_RFC3095_IP: u16 = 0x0004;
/// TCP profile (RFC 6846 lineage).
pub const PROFILE_TCP: u16 = 0x0006;

/// How CIDs are carried on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidType {
	/// CIDs 0-15, CID 0 implicit, others as an Add-CID octet.
	Small,
	/// CIDs 0-16383 as 1-2 self-describing bytes after the first octet.
	Large,
}

/// The expected amount of packet reordering on the channel, RFC 5225
/// section 6.6.4. Widens the MSN interpretation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderRatio {
	None = 0,
	Quarter = 1,
	Half = 2,
	ThreeQuarters = 3,
}

impl ReorderRatio {
	pub(crate) fn from_bits(v: u8) -> Self {
		match v & 0x3 {
			0 => ReorderRatio::None,
			1 => ReorderRatio::Quarter,
			2 => ReorderRatio::Half,
			_ => ReorderRatio::ThreeQuarters,
		}
	}
}

/// Optional engine behaviors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
	/// Skip IPv4 header-checksum verification on profile admission.
	pub no_ip_checksums: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
	pub cid_type: CidType,
	pub max_cid: u16,
	pub wlsb_window_width: usize,
	pub reorder_ratio: ReorderRatio,
	pub features: Features,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			cid_type: CidType::Small,
			max_cid: 15,
			wlsb_window_width: 4,
			reorder_ratio: ReorderRatio::None,
			features: Features::default(),
		}
	}
}

/// Every way a packet can be rejected. All failures are local: the
/// context keeps its pre-packet state and the caller drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Truncated packet, bad version, or a field out of range.
	Malformed,
	/// The packet does not belong to the profile or to the context.
	ProfileMismatch,
	/// The header CRC did not match, repair included.
	Crc,
	/// More IP headers than the engine supports.
	TooManyHeaders,
	/// A wire construct the engine does not implement.
	Unsupported,
	/// No context exists for the CID.
	NoContext,
}

impl From<Truncated> for Error {
	fn from(_: Truncated) -> Self {
		Error::Malformed
	}
}

impl From<net::ParseError> for Error {
	fn from(_: net::ParseError) -> Self {
		Error::Malformed
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Malformed => f.write_str("malformed packet"),
			Error::ProfileMismatch => f.write_str("packet does not match profile or context"),
			Error::Crc => f.write_str("header CRC mismatch"),
			Error::TooManyHeaders => f.write_str("too many IP headers"),
			Error::Unsupported => f.write_str("unsupported construct"),
			Error::NoContext => f.write_str("no context for CID"),
		}
	}
}

impl std::error::Error for Error {}

/// How the innermost (or any IPv4) IP-ID moves between packets,
/// RFC 5225 section 6.3.3. The wire values matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum IpIdBehavior {
	Sequential = 0,
	SequentialSwapped = 1,
	Random = 2,
	Zero = 3,
}

impl IpIdBehavior {
	#[inline]
	pub fn is_sequential(self) -> bool {
		matches!(self, IpIdBehavior::Sequential | IpIdBehavior::SequentialSwapped)
	}

	pub(crate) fn from_bits(v: u8) -> Self {
		match v & 0x3 {
			0 => IpIdBehavior::Sequential,
			1 => IpIdBehavior::SequentialSwapped,
			2 => IpIdBehavior::Random,
			_ => IpIdBehavior::Zero,
		}
	}

	/// Classify the move from `last` to `new`, with the default tolerance
	/// of 19 and byte-swapped sequential detection.
	pub fn detect(last: u16, new: u16) -> Self {
		const TOLERANCE: u16 = 19;

		if last == 0 && new == 0 {
			IpIdBehavior::Zero
		} else if new.wrapping_sub(last).wrapping_sub(1) < TOLERANCE {
			IpIdBehavior::Sequential
		} else {
			let (last, new) = (utils::endian::swab16(last), utils::endian::swab16(new));
			if new.wrapping_sub(last).wrapping_sub(1) < TOLERANCE {
				IpIdBehavior::SequentialSwapped
			} else {
				IpIdBehavior::Random
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn detect_ip_id_behavior() {
		assert_eq!(IpIdBehavior::detect(0x1000, 0x1001), IpIdBehavior::Sequential);
		assert_eq!(IpIdBehavior::detect(0x1000, 0x1013), IpIdBehavior::Sequential);
		assert_eq!(IpIdBehavior::detect(0x1000, 0x1014), IpIdBehavior::Random);
		assert_eq!(IpIdBehavior::detect(0x0010, 0x0110), IpIdBehavior::SequentialSwapped);
		assert_eq!(IpIdBehavior::detect(0, 0), IpIdBehavior::Zero);
		assert_eq!(IpIdBehavior::detect(0x1000, 0x7f3a), IpIdBehavior::Random);
		// The delta is taken forward only.
		assert_eq!(IpIdBehavior::detect(0x1001, 0x1000), IpIdBehavior::Random);
	}
}
