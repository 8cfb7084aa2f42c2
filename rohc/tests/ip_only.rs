//! End-to-end scenarios for the ROHCv2 IP-only profile: every flow is
//! compressed and decompressed and must come back byte-equal.

use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::rngs::mock::StepRng;
use rohc::comp::Compressor;
use rohc::decomp::{Decompressor, Profile};
use rohc::{CidType, Config, Error};
use utils::bytes::Writer;

fn ms(i: u64) -> Duration {
	Duration::from_millis(i)
}

/// An IPv4 packet with the given IP-ID and an opaque payload.
fn ipv4_packet(id: u16, payload: &[u8]) -> Vec<u8> {
	let hdr = net::ipv4::Header {
		tos: 0,
		id,
		dont_fragment: true,
		ttl: 64,
		protocol: net::Protocol::Tcp,
		src: "10.0.0.1".parse().unwrap(),
		dst: "10.0.0.2".parse().unwrap(),
		total_len: 0,
		checksum: 0,
		is_fragment: false,
	};

	let mut buf = vec![0u8; net::ipv4::HEADER_LEN + payload.len()];
	let mut w = Writer::new(&mut buf);
	hdr.write(&mut w, payload.len()).unwrap();
	w.slice(payload).unwrap();
	buf
}

fn ipv6_packet(flow_label: u32, payload: &[u8]) -> Vec<u8> {
	let hdr = net::ipv6::Header {
		traffic_class: 0x04,
		flow_label,
		next_header: net::Protocol::Tcp,
		hop_limit: 63,
		src: "fe80::1".parse().unwrap(),
		dst: "fe80::2".parse().unwrap(),
		payload_len: 0,
	};

	let mut buf = vec![0u8; net::ipv6::HEADER_LEN + payload.len()];
	let mut w = Writer::new(&mut buf);
	hdr.write(&mut w, payload.len()).unwrap();
	w.slice(payload).unwrap();
	buf
}

fn pair(cfg: Config) -> (Compressor, Decompressor) {
	let comp = Compressor::with_rng(cfg, StepRng::new(0x1234, 0));
	let mut decomp = Decompressor::new(cfg);
	decomp.create(0, Profile::Rfc5225Ip).unwrap();
	(comp, decomp)
}

#[test]
fn steady_ipv4_sequential() {
	let cfg = Config::default();
	let (mut comp, mut decomp) = pair(cfg);

	for i in 0..50u16 {
		let payload = [0x42u8, i as u8, 0x99];
		let packet = ipv4_packet(0x1000 + i, &payload);

		let mut rohc = [0u8; 256];
		let len = comp.compress(0, ms(i as u64), &packet, &mut rohc).unwrap();

		if i == 0 {
			// One IR packet, then the flow graduates to SO.
			assert_eq!(rohc[0], 0xfd);
		} else {
			// PT-0-CRC3: a single header byte in front of the payload.
			assert_eq!(len, 1 + payload.len(), "packet {i}");
			assert_eq!(rohc[0] & 0x80, 0, "packet {i}");
		}

		let mut out = [0u8; 256];
		let out_len = decomp.decompress(ms(i as u64), &rohc[..len], &mut out).unwrap();
		assert_eq!(&out[..out_len], &packet[..], "packet {i}");
	}
}

#[test]
fn monotonic_msn() {
	let cfg = Config::default();
	let (mut comp, mut decomp) = pair(cfg);

	let mut rohc = [0u8; 256];
	let mut out = [0u8; 256];
	for i in 0..20u16 {
		let packet = ipv4_packet(0x2000 + i, b"x");
		let len = comp.compress(0, ms(i as u64), &packet, &mut rohc).unwrap();
		decomp.decompress(ms(i as u64), &rohc[..len], &mut out).unwrap();
		assert_eq!(comp.msn(0), decomp.msn(0));
	}

	// The initial MSN came from the mock RNG; 20 packets later the
	// counter has moved by exactly 20 modulo 2^16.
	assert_eq!(comp.msn(0), Some(0x1234u16.wrapping_add(20)));
}

#[test]
fn ip_id_becomes_random() {
	let cfg = Config::default();
	let (mut comp, mut decomp) = pair(cfg);

	let mut rohc = [0u8; 256];
	let mut out = [0u8; 256];
	for i in 0..20u16 {
		let packet = ipv4_packet(0x1000 + i, b"pay");
		let len = comp.compress(0, ms(i as u64), &packet, &mut rohc).unwrap();
		let n = decomp.decompress(ms(i as u64), &rohc[..len], &mut out).unwrap();
		assert_eq!(&out[..n], &packet[..]);
	}

	// A wild IP-ID changes the behavior: only CO-COMMON can say so.
	let packet = ipv4_packet(0x7f3a, b"pay");
	let len = comp.compress(0, ms(20), &packet, &mut rohc).unwrap();
	assert_eq!(rohc[0], 0xfa);
	let n = decomp.decompress(ms(20), &rohc[..len], &mut out).unwrap();
	assert_eq!(&out[..n], &packet[..]);

	// The next random IP-ID travels in the irregular chain of a
	// PT-0-CRC7 (the flow re-entered FO, so 3-bit CRCs are out).
	let packet = ipv4_packet(0x12ab, b"pay");
	let len = comp.compress(0, ms(21), &packet, &mut rohc).unwrap();
	assert_eq!(rohc[0] & 0xe0, 0x80);
	assert_eq!(len, 2 + 2 + 3);
	let n = decomp.decompress(ms(21), &rohc[..len], &mut out).unwrap();
	assert_eq!(&out[..n], &packet[..]);
}

#[test]
fn ipv6_flow_label_variants() {
	let cfg = Config::default();

	// Zero flow label: the short static variant, 34 bytes.
	let (mut comp, mut decomp) = pair(cfg);
	let packet = ipv6_packet(0, b"abcdef");
	let mut rohc = [0u8; 256];
	let len = comp.compress(0, ms(0), &packet, &mut rohc).unwrap();
	// type + profile + CRC + static (34) + dynamic (TC, HL, RR, MSN).
	assert_eq!(len - packet.len() + net::ipv6::HEADER_LEN, 3 + 34 + 5);
	assert_eq!(rohc[3] & 0x10, 0);

	let mut out = [0u8; 256];
	let n = decomp.decompress(ms(0), &rohc[..len], &mut out).unwrap();
	assert_eq!(&out[..n], &packet[..]);

	// A non-zero flow label costs two more static bytes.
	let (mut comp, mut decomp) = pair(cfg);
	let packet = ipv6_packet(0xbeef5, b"abcdef");
	let len = comp.compress(0, ms(0), &packet, &mut rohc).unwrap();
	assert_eq!(len - packet.len() + net::ipv6::HEADER_LEN, 3 + 36 + 5);
	assert_eq!(rohc[3] & 0x10, 0x10);
	let n = decomp.decompress(ms(0), &rohc[..len], &mut out).unwrap();
	assert_eq!(&out[..n], &packet[..]);

	// And the compressed phase still works: CO packets carry nothing
	// but MSN and CRC for an IPv6 flow.
	let (mut comp, mut decomp) = pair(cfg);
	for i in 0..5u64 {
		let packet = ipv6_packet(0, b"abcdef");
		let len = comp.compress(0, ms(i), &packet, &mut rohc).unwrap();
		if i > 0 {
			assert_eq!(len, 1 + 6);
		}
		let n = decomp.decompress(ms(i), &rohc[..len], &mut out).unwrap();
		assert_eq!(&out[..n], &packet[..]);
	}
}

#[test]
fn large_cid_byte_shuffle() {
	let mut cfg = Config::default();
	cfg.cid_type = CidType::Large;
	cfg.max_cid = 16383;

	for cid in [5u16, 300] {
		let mut comp = Compressor::with_rng(cfg, StepRng::new(7, 0));
		let mut decomp = Decompressor::new(cfg);
		decomp.create(cid, Profile::Rfc5225Ip).unwrap();

		let cid_len = if cid < 128 { 1 } else { 2 };
		let mut rohc = [0u8; 256];
		let mut out = [0u8; 256];

		for i in 0..5u16 {
			let packet = ipv4_packet(0x4000 + i, b"zz");
			let len = comp.compress(cid, ms(i as u64), &packet, &mut rohc).unwrap();

			if i > 0 {
				// The first CO octet sits in front of the CID bytes.
				assert_eq!(len, 1 + cid_len + 2);
				assert_eq!(rohc[0] & 0x80, 0, "CO type octet first");
				if cid < 128 {
					assert_eq!(rohc[1], cid as u8);
				} else {
					assert_eq!(rohc[1], 0x80 | (cid >> 8) as u8);
					assert_eq!(rohc[2], cid as u8);
				}
			}

			let n = decomp.decompress(ms(i as u64), &rohc[..len], &mut out).unwrap();
			assert_eq!(&out[..n], &packet[..]);
		}
	}
}

#[test]
fn crc_gates_every_header_bit() {
	let cfg = Config::default();
	let (mut comp, mut decomp) = pair(cfg);

	let mut rohc = [0u8; 256];
	let mut out = [0u8; 256];
	for i in 0..4u16 {
		let packet = ipv4_packet(0x3000 + i, b"payload");
		let len = comp.compress(0, ms(i as u64), &packet, &mut rohc).unwrap();
		decomp.decompress(ms(i as u64), &rohc[..len], &mut out).unwrap();
	}

	// One more PT-0-CRC3; flip each MSN and CRC bit in turn. With the
	// mock RNG the whole context is known, so the exact outcome of each
	// flip is computable: a flip either trips the CRC or (if the 3-bit
	// CRC collides) decodes to the header its flipped MSN implies.
	let packet = ipv4_packet(0x3004, b"payload");
	let len = comp.compress(0, ms(4), &packet, &mut rohc).unwrap();
	assert_eq!(len, 1 + 7);

	let ref_msn = 0x1234u16.wrapping_add(4); // before this packet
	let last_id = 0x3003u16;

	for bit in 0..7 {
		let mut mangled = rohc[..len].to_vec();
		mangled[0] ^= 1 << bit;

		let msn_bits = (mangled[0] >> 3) as u16 & 0x0f;
		let rx_crc = mangled[0] & 0x07;
		let msn = rohc::wlsb::decode16(msn_bits, 4, 1, ref_msn);
		let inferred = ipv4_packet(last_id.wrapping_add(msn.wrapping_sub(ref_msn)), b"payload");
		let survives = rohc::crc::crc3(rohc::crc::CRC_INIT_3, &inferred[..20]) == rx_crc;

		let mut fork = decomp.clone();
		match fork.decompress(ms(4), &mangled, &mut out) {
			Ok(n) => {
				assert!(survives, "bit {bit}: decode passed a CRC that should not match");
				assert_eq!(&out[..n], &inferred[..], "bit {bit}");
			}
			Err(Error::Crc) => assert!(!survives, "bit {bit}: valid packet rejected"),
			Err(e) => panic!("unexpected error {e:?} for bit {bit}"),
		}
	}

	// Untouched, the packet still decodes.
	let n = decomp.decompress(ms(4), &rohc[..len], &mut out).unwrap();
	assert_eq!(&out[..n], &packet[..]);
}

#[test]
fn rejects_unknown_cid_and_wrong_flow() {
	let cfg = Config::default();
	let (mut comp, mut decomp) = pair(cfg);

	let packet = ipv4_packet(1, b"a");
	let mut rohc = [0u8; 256];
	let len = comp.compress(0, ms(0), &packet, &mut rohc).unwrap();

	// A packet for a CID nobody created.
	let mut other = rohc[..len].to_vec();
	let mut with_cid = vec![0xe0 | 3];
	with_cid.append(&mut other);
	let mut out = [0u8; 256];
	assert_eq!(decomp.decompress(ms(0), &with_cid, &mut out), Err(Error::NoContext));

	// A different flow on the same CID is refused by the compressor.
	let other_flow = {
		let hdr = net::ipv4::Header {
			tos: 0,
			id: 9,
			dont_fragment: false,
			ttl: 64,
			protocol: net::Protocol::Udp,
			src: "192.168.1.1".parse().unwrap(),
			dst: "192.168.1.2".parse().unwrap(),
			total_len: 0,
			checksum: 0,
			is_fragment: false,
		};
		let mut buf = vec![0u8; 20];
		hdr.write(&mut Writer::new(&mut buf), 0).unwrap();
		buf
	};
	assert_eq!(
		comp.compress(0, ms(1), &other_flow, &mut rohc),
		Err(Error::ProfileMismatch)
	);
}
