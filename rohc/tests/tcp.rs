//! Hand-crafted TCP-profile packets: IR chains with the option list,
//! the CO discriminator tree, option-table reuse, and the scaled
//! sequence/ack formats.

use std::time::Duration;

use pretty_assertions::assert_eq;
use rohc::crc::{crc3, crc7, crc8, CRC_INIT_3, CRC_INIT_7, CRC_INIT_8};
use rohc::decomp::{Decompressor, Profile};
use rohc::Config;
use utils::bytes::Writer;

const SRC: [u8; 4] = [192, 168, 0, 1];
const DST: [u8; 4] = [192, 168, 0, 2];
const SPORT: u16 = 0x1234;
const DPORT: u16 = 80;
const TTL: u8 = 64;
const SEQ: u32 = 0x1000_0000;
const ACK: u32 = 0x2000_0000;
const WINDOW: u16 = 0xfaf0;
const CSUM: u16 = 0xbeef;

fn ms(i: u64) -> Duration {
	Duration::from_millis(i)
}

struct Tcp {
	seq: u32,
	ack: u32,
	psh: bool,
	rsf: u8,
	window: u16,
	checksum: u16,
	options: Vec<u8>,
}

impl Default for Tcp {
	fn default() -> Self {
		Self {
			seq: SEQ,
			ack: ACK,
			psh: false,
			rsf: 0,
			window: WINDOW,
			checksum: CSUM,
			options: Vec::new(),
		}
	}
}

/// The uncompressed IPv4/TCP packet a decode is expected to produce.
fn expected_packet(id: u16, tcp: &Tcp, payload: &[u8]) -> Vec<u8> {
	let ip = net::ipv4::Header {
		tos: 0,
		id,
		dont_fragment: true,
		ttl: TTL,
		protocol: net::Protocol::Tcp,
		src: SRC.into(),
		dst: DST.into(),
		total_len: 0,
		checksum: 0,
		is_fragment: false,
	};
	let tcp_hdr = net::tcp::Header {
		src_port: SPORT,
		dst_port: DPORT,
		seq: tcp.seq,
		ack: tcp.ack,
		data_offset: 5 + (tcp.options.len() / 4) as u8,
		res_flags: 0,
		ecn_flags: 0,
		urg_flag: false,
		ack_flag: true,
		psh_flag: tcp.psh,
		rsf_flags: tcp.rsf,
		window: tcp.window,
		checksum: tcp.checksum,
		urg_ptr: 0,
		options: tcp.options.clone(),
	};

	let tcp_len = tcp_hdr.len();
	let mut buf = vec![0u8; 20 + tcp_len + payload.len()];
	let mut w = Writer::new(&mut buf);
	ip.write(&mut w, tcp_len + payload.len()).unwrap();
	tcp_hdr.write(&mut w).unwrap();
	w.slice(payload).unwrap();
	buf
}

/// An IR packet for the TCP profile. `behavior` is the IP-ID behavior
/// octet value; `opt_list` is the pre-encoded compressed option list
/// (starting with the PS|m octet).
fn craft_ir(
	behavior: u8,
	id: u16,
	msn: u16,
	tcp: &Tcp,
	ack_stride: Option<u16>,
	opt_list: &[u8],
	payload: &[u8],
) -> Vec<u8> {
	let mut p = vec![0xfd, 0x06, 0x00];

	// Static chain: IPv4 then TCP.
	p.push(0x00);
	p.push(6);
	p.extend_from_slice(&SRC);
	p.extend_from_slice(&DST);
	p.extend_from_slice(&SPORT.to_be_bytes());
	p.extend_from_slice(&DPORT.to_be_bytes());

	// Dynamic chain: IPv4 (DF set) then TCP.
	p.push(0x04 | behavior);
	p.push(0x00);
	p.push(TTL);
	if behavior != 3 {
		p.extend_from_slice(&id.to_be_bytes());
	}

	// TCP dynamic: ack present, urg_ptr zero, ack_stride per caller.
	let stride_flag = if ack_stride.is_some() { 0x00 } else { 0x40 };
	p.push(stride_flag | 0x10);
	p.push(0x10 | (tcp.psh as u8) << 3 | tcp.rsf);
	p.extend_from_slice(&msn.to_be_bytes());
	p.extend_from_slice(&tcp.seq.to_be_bytes());
	p.extend_from_slice(&tcp.ack.to_be_bytes());
	p.extend_from_slice(&tcp.window.to_be_bytes());
	p.extend_from_slice(&tcp.checksum.to_be_bytes());
	if let Some(stride) = ack_stride {
		p.extend_from_slice(&stride.to_be_bytes());
	}
	p.extend_from_slice(opt_list);

	let crc = crc8(CRC_INIT_8, &p);
	p[2] = crc;
	p.extend_from_slice(payload);
	p
}

/// MSS + window scale + SACK-permitted, uncompressed item form.
fn syn_options_list() -> Vec<u8> {
	vec![
		0x03, // PS = 0, m = 3
		0xab, 0xd0, // XI: indices 2, 3, 5, all present
		2, 4, 0x05, 0xb4, // MSS 1460
		3, 3, 7, // window scale 7
		4, 2, // SACK permitted
	]
}

/// The option bytes those items decompress to, EOL-padded.
fn syn_options_rebuilt() -> Vec<u8> {
	vec![2, 4, 0x05, 0xb4, 3, 3, 7, 4, 2, 0, 0, 0]
}

#[test]
fn ir_with_option_list() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	let tcp = Tcp { rsf: 0x02, options: syn_options_rebuilt(), ..Tcp::default() };
	let ir = craft_ir(0, 0x0100, 42, &tcp, None, &syn_options_list(), b"");

	let mut out = [0u8; 512];
	let n = decomp.decompress(ms(0), &ir, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(0x0100, &tcp, b"")[..]);
	assert_eq!(decomp.msn(0), Some(42));
}

#[test]
fn seq8_replays_options_from_the_table() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	let mut out = [0u8; 512];
	let syn = Tcp { rsf: 0x02, options: syn_options_rebuilt(), ..Tcp::default() };
	let ir = craft_ir(0, 0x0100, 42, &syn, None, &syn_options_list(), b"");
	decomp.decompress(ms(0), &ir, &mut out).unwrap();

	// seq_8 with a list that references MSS and window scale by index
	// only: the payloads must come back from the context table.
	let msn = 43u16;
	let id = 0x0101u16;
	let offset = id.wrapping_sub(msn); // same offset as the IR

	let mut p = vec![
		0xb0 | (offset & 0x0f) as u8,
		0x80, // list present, CRC patched below
		(msn as u8 & 0x0f) << 4 | 0x08 | (TTL & 0x07),
		((ACK >> 8) & 0x7f) as u8,
		ACK as u8,
		((SEQ.wrapping_add(5) >> 8) & 0x3f) as u8,
		SEQ.wrapping_add(5) as u8,
		// Option list: 4-bit XIs for indices 2 and 3, not present.
		0x02, 0x23,
	];
	let crc = {
		let mut masked = p.clone();
		masked[1] &= !0x7f;
		crc7(CRC_INIT_7, &masked)
	};
	p[1] |= crc;
	// Irregular chain: only the TCP checksum.
	p.extend_from_slice(&CSUM.to_be_bytes());

	let expected = Tcp {
		seq: SEQ.wrapping_add(5),
		psh: true,
		rsf: 0,
		options: vec![2, 4, 0x05, 0xb4, 3, 3, 7, 0],
		..Tcp::default()
	};
	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(0x0101, &expected, b"")[..]);
	assert_eq!(decomp.msn(0), Some(43));
}

#[test]
fn rnd1_on_a_random_flow() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	let mut out = [0u8; 512];
	let ir = craft_ir(2, 0x4242, 7, &Tcp::default(), None, &[0x00], b"");
	decomp.decompress(ms(0), &ir, &mut out).unwrap();

	// rnd_1: 18 seq bits, then the random IP-ID and the checksum ride
	// the irregular chain.
	let msn = 8u16;
	let seq = SEQ.wrapping_add(3);
	let new_id = 0x7788u16;

	let mut p = vec![
		0xb8 | ((seq >> 16) & 0x03) as u8,
		(seq >> 8) as u8,
		seq as u8,
		(msn as u8 & 0x0f) << 4 | 0x08,
	];
	let crc = {
		let mut masked = p.clone();
		masked[3] &= !0x07;
		crc3(CRC_INIT_3, &masked)
	};
	p[3] |= crc;
	p.extend_from_slice(&new_id.to_be_bytes());
	p.extend_from_slice(&CSUM.to_be_bytes());
	p.extend_from_slice(b"data");

	let expected = Tcp { seq, psh: true, ..Tcp::default() };
	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(new_id, &expected, b"data")[..]);
}

#[test]
fn rnd2_scaled_sequence_number() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	// The IR carries an 8-byte payload: seq 80 scales to 10 remainder 0.
	let mut out = [0u8; 512];
	let tcp = Tcp { seq: 80, ..Tcp::default() };
	let ir = craft_ir(2, 0x4242, 7, &tcp, None, &[0x00], b"abcdefgh");
	decomp.decompress(ms(0), &ir, &mut out).unwrap();

	// rnd_2 advances the scaled value by one: with another 8-byte
	// payload the sequence number moves by exactly one payload.
	let msn = 8u16;
	let mut p = vec![0xc0 | 11u8 & 0x0f, (msn as u8 & 0x0f) << 4];
	let crc = crc3(CRC_INIT_3, &p);
	p[1] |= crc;
	p.extend_from_slice(&0x9999u16.to_be_bytes());
	p.extend_from_slice(&CSUM.to_be_bytes());
	p.extend_from_slice(b"ABCDEFGH");

	let expected = Tcp { seq: 88, ..Tcp::default() };
	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(0x9999, &expected, b"ABCDEFGH")[..]);
}

#[test]
fn seq4_scaled_ack_needs_a_stride() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	// ack 1000 with stride 100: scaled 10, residue 0.
	let mut out = [0u8; 512];
	let tcp = Tcp { ack: 1000, ..Tcp::default() };
	let ir = craft_ir(0, 0x0100, 7, &tcp, Some(100), &[0x00], b"");
	decomp.decompress(ms(0), &ir, &mut out).unwrap();

	// seq_4: scaled ack 11 -> ack 1100; 3 bits of IP-ID offset.
	let msn = 8u16;
	let id = 0x0101u16;
	let offset = id.wrapping_sub(msn);
	let mut p = vec![(11u8 & 0x0f) << 3 | (offset & 0x07) as u8, (msn as u8 & 0x0f) << 4];
	let crc = crc3(CRC_INIT_3, &p);
	p[1] |= crc;
	p.extend_from_slice(&CSUM.to_be_bytes());

	let expected = Tcp { ack: 1100, ..Tcp::default() };
	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(id, &expected, b"")[..]);
}

#[test]
fn co_common_updates_the_window() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	let mut out = [0u8; 512];
	let ir = craft_ir(0, 0x0100, 7, &Tcp::default(), None, &[0x00], b"");
	decomp.decompress(ms(0), &ir, &mut out).unwrap();

	let msn = 8u16;
	let id = 0x0101u16;
	let offset = id.wrapping_sub(msn);
	let new_window = 0x1234u16;

	let mut p = vec![
		0xfa,
		0x80 | (msn as u8 & 0x0f), // ack flag, MSN
		0x04,                      // window indicator
		0x00,                      // sequential behavior, nothing else
		0x80,                      // DF, CRC patched below
	];
	p.extend_from_slice(&new_window.to_be_bytes());
	p.push(offset as u8);
	let crc = {
		let mut masked = p.clone();
		masked[4] &= !0x7f;
		crc7(CRC_INIT_7, &masked)
	};
	p[4] |= crc;
	p.extend_from_slice(&CSUM.to_be_bytes());

	let expected = Tcp { window: new_window, ..Tcp::default() };
	let n = decomp.decompress(ms(10), &p, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(id, &expected, b"")[..]);
	assert_eq!(decomp.msn(0), Some(8));
}

#[test]
fn generic_option_must_match_its_context_value() {
	let mut decomp = Decompressor::new(Config::default());
	decomp.create(0, Profile::Tcp).unwrap();

	// An IR assigning a generic option (kind 0xfe) to index 8.
	let list = vec![
		0x11, // PS = 1, m = 1
		0x88, // XI: present, index 8
		0xfe, 4, 0xaa, 0xbb,
	];
	let tcp = Tcp { options: vec![0xfe, 4, 0xaa, 0xbb], ..Tcp::default() };
	let ir = craft_ir(0, 0x0100, 7, &tcp, None, &list, b"");

	let mut out = [0u8; 512];
	let n = decomp.decompress(ms(0), &ir, &mut out).unwrap();
	assert_eq!(&out[..n], &expected_packet(0x0100, &tcp, b"")[..]);

	// A second IR re-sending the same index with different bytes must
	// be rejected: table entries are immutable.
	let bad_list = vec![0x11, 0x88, 0xfe, 4, 0xaa, 0xcc];
	let bad_ir = craft_ir(0, 0x0101, 8, &tcp, None, &bad_list, b"");
	assert!(decomp.decompress(ms(10), &bad_ir, &mut out).is_err());
}
