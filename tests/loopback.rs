//! Test against own implementation: receiver and transmitter looped
//! back over a pair of in-process byte channels.
extern crate rand;
extern crate xmodem1k;

use rand::{thread_rng, Rng};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;
use xmodem1k::{
	BlockLength, Channel, Checksum, SliceSink, SliceSource, Xmodem,
};

struct BidirectionalPipe {
	pin: Receiver<u8>,
	pout: Sender<u8>,
}

impl Channel for BidirectionalPipe {
	fn getc(&mut self, timeout_ms: u16) -> Option<u8> {
		self.pin
			.recv_timeout(Duration::from_millis(timeout_ms as u64))
			.ok()
	}

	fn putc(&mut self, byte: u8) {
		/* The peer hanging up reads back as a timeout. */
		let _ = self.pout.send(byte);
	}
}

fn loopback() -> (BidirectionalPipe, BidirectionalPipe) {
	let (s1, r1) = channel();
	let (s2, r2) = channel();
	(
		BidirectionalPipe { pin: r1, pout: s2 },
		BidirectionalPipe { pin: r2, pout: s1 },
	)
}

fn patterned(data_len: usize) -> Vec<u8> {
	let mut data = vec![0; data_len];
	for idx in 0 .. data_len {
		data[idx] = ((idx + 7) * 13) as u8;
	}
	data
}

/// Run one full transfer and return (bytes the sender reports, bytes
/// the receiver reports, what landed in the sink).
fn transfer(
	data: Vec<u8>,
	checksum_mode: Checksum,
	block_length: BlockLength,
	binary: bool,
) -> (usize, usize, Vec<u8>) {
	let data_len = data.len();
	let (mut p1, mut p2) = loopback();

	let sender = std::thread::spawn(move || {
		let mut xmodem = Xmodem::new();
		xmodem.block_length = block_length;
		xmodem.binary = binary;
		let mut source = SliceSource::new(&data);
		xmodem.send(&mut p1, &mut source, data_len).unwrap()
	});
	let receiver = std::thread::spawn(move || {
		let xmodem = Xmodem::new();
		let mut data_in = vec![0; data_len];
		let bytes_in = {
			let mut sink = SliceSink::new(&mut data_in);
			xmodem.recv(&mut p2, &mut sink, data_len,
			    checksum_mode).unwrap()
		};
		(bytes_in, data_in)
	});

	let bytes_out = sender.join().unwrap();
	let (bytes_in, data_in) = receiver.join().unwrap();
	(bytes_out, bytes_in, data_in)
}

fn xmodem_loopback(
	checksum_mode: Checksum,
	block_length: BlockLength,
	data_len: usize,
) {
	let data_out = patterned(data_len);
	let (bytes_out, bytes_in, data_in) = transfer(
		data_out.clone(),
		checksum_mode,
		block_length,
		true,
	);

	assert_eq!(bytes_in, data_len);
	assert_eq!(data_in, data_out);

	/* The sender's count is rounded up to a block boundary. */
	assert!(bytes_out >= data_len);
	assert_eq!(bytes_out % 128, 0);
}

#[test]
fn xmodem_loopback_standard() {
	xmodem_loopback(Checksum::Standard, BlockLength::Standard, 2000);
}

#[test]
fn xmodem_loopback_onek() {
	xmodem_loopback(Checksum::Standard, BlockLength::OneK, 2200);
}

#[test]
fn xmodem_loopback_crc() {
	xmodem_loopback(Checksum::CRC16, BlockLength::Standard, 2000);
}

#[test]
fn xmodem_loopback_long_crc() {
	// make sure we wrap the block counter
	xmodem_loopback(Checksum::CRC16, BlockLength::Standard, 50000);
}

#[test]
fn xmodem_loopback_onek_crc_random() {
	let mut data_out = vec![0; 2500];
	thread_rng().fill_bytes(&mut data_out);

	let (bytes_out, bytes_in, data_in) = transfer(
		data_out.clone(),
		Checksum::CRC16,
		BlockLength::OneK,
		true,
	);

	assert_eq!(bytes_in, 2500);
	assert_eq!(data_in, data_out);
	/* Two full 1K blocks plus one padded 1K block for the 452-byte
	 * tail. */
	assert_eq!(bytes_out, 3072);
}

#[test]
fn xmodem_loopback_text_tail() {
	/* An exact multiple of the block size in text mode rides out one
	 * extra block that leads with CTRL-Z. */
	let data_out = patterned(256);
	let (bytes_out, bytes_in, data_in) = transfer(
		data_out.clone(),
		Checksum::CRC16,
		BlockLength::Standard,
		false,
	);

	assert_eq!(bytes_in, 256);
	assert_eq!(data_in, data_out);
	assert_eq!(bytes_out, 384);
}

#[test]
fn xmodem_loopback_control_block() {
	/* YMODEM-style block 0: one short frame, no EOT. */
	let mut meta = vec![0; 128];
	meta[.. 9].copy_from_slice(b"file.bin\0");

	let (mut p1, mut p2) = loopback();
	let meta_out = meta.clone();
	let sender = std::thread::spawn(move || {
		let xmodem = Xmodem::new();
		let mut source = SliceSource::new(&meta_out);
		xmodem.send(&mut p1, &mut source, 0).unwrap()
	});
	let receiver = std::thread::spawn(move || {
		let xmodem = Xmodem::new();
		let mut data_in = vec![0; 128];
		let bytes_in = {
			let mut sink = SliceSink::new(&mut data_in);
			xmodem.recv(&mut p2, &mut sink, 0, Checksum::CRC16)
				.unwrap()
		};
		(bytes_in, data_in)
	});

	assert_eq!(sender.join().unwrap(), 128);
	let (bytes_in, data_in) = receiver.join().unwrap();
	assert_eq!(bytes_in, 128);
	assert_eq!(data_in, meta);
}
