//! Hand-crafted RFC 3095 packets against the generic IP-only
//! decompressor: IR, UO-0, UOR-2 with extension 3, CRC repair and its
//! probation.

use std::time::Duration;

use pretty_assertions::assert_eq;
use rohc::crc::{crc3, crc7, crc8, CRC_INIT_3, CRC_INIT_7, CRC_INIT_8};
use rohc::decomp::{Decompressor, Profile};
use rohc::{Config, Error};
use utils::bytes::Writer;

const SRC: [u8; 4] = [10, 0, 0, 1];
const DST: [u8; 4] = [10, 0, 0, 2];
const TOS: u8 = 0;
const TTL: u8 = 64;
const PROTO: u8 = 17;

fn ms(i: u64) -> Duration {
	Duration::from_millis(i)
}

/// The uncompressed IPv4 packet the decompressor is expected to emit.
fn expected_packet(id: u16, payload: &[u8]) -> Vec<u8> {
	let hdr = net::ipv4::Header {
		tos: TOS,
		id,
		dont_fragment: false,
		ttl: TTL,
		protocol: net::Protocol::Udp,
		src: SRC.into(),
		dst: DST.into(),
		total_len: 0,
		checksum: 0,
		is_fragment: false,
	};
	let mut buf = vec![0u8; 20 + payload.len()];
	let mut w = Writer::new(&mut buf);
	hdr.write(&mut w, payload.len()).unwrap();
	w.slice(payload).unwrap();
	buf
}

/// An IR packet: type, profile, CRC-8, IPv4 static and dynamic parts,
/// then the 16-bit SN.
fn craft_ir(sn: u16, id: u16, rnd: bool, payload: &[u8]) -> Vec<u8> {
	let mut p = vec![0xfd, 0x04, 0x00];
	// Static part: version nibble, protocol, addresses.
	p.push(0x40);
	p.push(PROTO);
	p.extend_from_slice(&SRC);
	p.extend_from_slice(&DST);
	// Dynamic part: TOS, TTL, IP-ID, DF/RND/NBO flags.
	p.push(TOS);
	p.push(TTL);
	p.extend_from_slice(&id.to_be_bytes());
	p.push(if rnd { 0x60 } else { 0x20 });
	// SN.
	p.extend_from_slice(&sn.to_be_bytes());

	let crc = crc8(CRC_INIT_8, &p);
	p[2] = crc;
	p.extend_from_slice(payload);
	p
}

/// A UO-0 packet for the given SN, CRC'd against the header it should
/// reconstruct.
fn craft_uo0(sn: u16, expected_id: u16, payload: &[u8]) -> Vec<u8> {
	let rebuilt = expected_packet(expected_id, payload);
	let crc = crc3(CRC_INIT_3, &rebuilt[..20]);
	let mut p = vec![((sn as u8) & 0x0f) << 3 | crc];
	p.extend_from_slice(payload);
	p
}

#[test]
fn ir_then_uo0_flow() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Rfc3095Ip).unwrap();

	let mut out = [0u8; 256];

	// IR: SN 100, IP-ID 200, NBO, not random.
	let ir = craft_ir(100, 200, false, b"hi");
	let n = decomp.decompress(ms(0), &ir, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(200, b"hi")[..]);
	assert_eq!(decomp.msn(0), Some(100));

	// Ten UO-0 packets; the IP-ID rides the SN at a fixed offset.
	for i in 1..=10u16 {
		let uo0 = craft_uo0(100 + i, 200 + i, b"data");
		let n = decomp.decompress(ms(i as u64 * 10), &uo0, &mut out).unwrap();
		assert_eq!(&out[..n], &expected_packet(200 + i, b"data")[..], "packet {i}");
		assert_eq!(decomp.msn(0), Some(100 + i));
	}
}

#[test]
fn uo0_crc_failure_leaves_context() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Rfc3095Ip).unwrap();

	let mut out = [0u8; 256];
	decomp.decompress(ms(0), &craft_ir(100, 200, false, b""), &mut out).unwrap();
	decomp
		.decompress(ms(10), &craft_uo0(101, 201, b""), &mut out)
		.unwrap();

	// A corrupted CRC is rejected...
	let mut bad = craft_uo0(102, 202, b"");
	bad[0] ^= 0x01;
	assert_eq!(decomp.decompress(ms(20), &bad, &mut out), Err(Error::Crc));

	// ...and the context still decodes the intact packet.
	let n = decomp
		.decompress(ms(30), &craft_uo0(102, 202, b""), &mut out)
		.unwrap();
	assert_eq!(&out[..n], &expected_packet(202, b"")[..]);
}

#[test]
fn sn_wraparound_repair_and_probation() {
	// The true SN jumps from 101 to 118: past the 4-bit window, so the
	// naive decode lands on 102. Pick an IR IP-ID for which the two
	// candidate headers have different CRC-3s, so the failure is
	// detected and the repair has something to fix.
	let id_base = (200u16..264)
		.find(|&base| {
			let naive = expected_packet(base + 2, b"");
			let real = expected_packet(base + 18, b"");
			crc3(CRC_INIT_3, &naive[..20]) != crc3(CRC_INIT_3, &real[..20])
		})
		.expect("some IP-ID distinguishes the two candidates");

	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Rfc3095Ip).unwrap();

	let mut out = [0u8; 256];
	decomp.decompress(ms(0), &craft_ir(100, id_base, false, b""), &mut out).unwrap();
	// Establishes the inter-arrival estimate (10 ms).
	decomp
		.decompress(ms(10), &craft_uo0(101, id_base + 1, b""), &mut out)
		.unwrap();

	// Half a second of silence is far beyond 2^4 inter-arrival times:
	// the wraparound hypothesis applies. The repaired packet itself is
	// still reported as a CRC error.
	let (sn_true, id_true) = (118u16, id_base + 18);
	let wrapped = craft_uo0(sn_true, id_true, b"");
	assert_eq!(decomp.decompress(ms(510), &wrapped, &mut out), Err(Error::Crc));

	// Probation: two more valid packets are still discarded...
	for extra in 1..=2u16 {
		let follower = craft_uo0(sn_true + extra, id_true + extra, b"");
		assert_eq!(
			decomp.decompress(ms(510 + extra as u64 * 10), &follower, &mut out),
			Err(Error::Crc),
			"follower {extra} must be held back"
		);
	}

	// ...and the third is delivered.
	let third = craft_uo0(sn_true + 3, id_true + 3, b"");
	let n = decomp.decompress(ms(540), &third, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(id_true + 3, b"")[..]);
}

#[test]
fn uor2_extension3_rnd_flip_reparses() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Rfc3095Ip).unwrap();

	let mut out = [0u8; 256];
	decomp.decompress(ms(0), &craft_ir(100, 200, false, b""), &mut out).unwrap();

	// A UOR-2 whose extension 3 flips RND on: the IP-ID is suddenly
	// carried raw, so the first parse must be thrown away.
	let sn = 101u16;
	let raw_id = 0xcafe_u16;
	let rebuilt = expected_packet(raw_id, b"xy");
	let crc = crc7(CRC_INIT_7, &rebuilt[..20]);

	let mut p = vec![
		0xc0 | (sn as u8 & 0x1f),
		0x80 | crc,
		// Extension 3: S = 0, mode = 0, I = 0, ip = 1, ip2 = 0.
		0xc2,
		// Inner header flags: NBO = 1, RND = 1.
		0x06,
	];
	p.extend_from_slice(&raw_id.to_be_bytes());
	p.extend_from_slice(b"xy");

	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &rebuilt[..]);
	assert_eq!(decomp.msn(0), Some(101));

	// The flipped RND sticks: the next UO-0 carries its IP-ID raw too.
	let next = expected_packet(0x1111, b"z");
	let crc = crc3(CRC_INIT_3, &next[..20]);
	let mut p = vec![((102u8) & 0x0f) << 3 | crc, 0x11, 0x11];
	p.extend_from_slice(b"z");
	let n = decomp.decompress(ms(20), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &next[..]);
}

#[test]
fn ir_dyn_refreshes_dynamic_fields() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Rfc3095Ip).unwrap();

	let mut out = [0u8; 256];
	decomp.decompress(ms(0), &craft_ir(100, 200, false, b""), &mut out).unwrap();

	// IR-DYN: new TTL and IP-ID, same static chain.
	let mut p = vec![0xf8, 0x04, 0x00];
	p.push(TOS);
	p.push(TTL);
	p.extend_from_slice(&500u16.to_be_bytes());
	p.push(0x20);
	p.extend_from_slice(&300u16.to_be_bytes());
	let crc = crc8(CRC_INIT_8, &p);
	p[2] = crc;

	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(500, b"")[..]);
	assert_eq!(decomp.msn(0), Some(300));
}
