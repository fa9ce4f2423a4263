#![cfg_attr(not(feature = "std"), no_std)]

//! XMODEM / XMODEM-1K protocol engine with classic-checksum and
//! CCITT-CRC-16 integrity modes, including the control-block exchange
//! YMODEM builds on.

#[cfg(not(feature = "std"))]
use core_io::{self as io, Read, Write};
#[cfg(feature = "std")]
use std::io::{self, Read, Write};

use core::fmt;

use ::log::{debug, error, info, log, warn};
use crc16;

/// Protocol control bytes, as they appear on the wire.
pub mod consts {
	/// Leader of a 128-byte block.
	pub const SOH: u8 = 0x01;
	/// Leader of a 1024-byte block.
	pub const STX: u8 = 0x02;
	/// End of transmission.
	pub const EOT: u8 = 0x04;
	/// Positive acknowledgement.
	pub const ACK: u8 = 0x06;
	/// Negative acknowledgement; also the checksum-mode sync byte.
	pub const NAK: u8 = 0x15;
	/// Cancellation; two in a row abort the session.
	pub const CAN: u8 = 0x18;
	/// Text-mode tail marker (CP/M EOF).
	pub const CTRLZ: u8 = 0x1A;
	/// CRC-mode sync byte.
	pub const CRC: u8 = 0x43;
}

use self::consts::*;

/* Timing and retry policy of the historical protocol. */
const DLY_1S: u16 = 1000;
const MAXRETRANS: u32 = 25;

/* 1024 for XMODEM-1K + 3 head bytes + 2 CRC bytes */
const XBUF_SIZE: usize = 1024 + 3 + 2;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
	/// The transmission was canceled by the other end of the channel
	/// (two CAN bytes in a row).
	Canceled,

	/// The two sides never agreed on a transfer: the receiver ran out
	/// of sync probes, or the transmitter was never solicited.
	SyncFailed,

	/// The receiver's retransmission budget for a single block was
	/// exhausted.
	TooManyRetries,

	/// A block was transmitted `MAXRETRANS` times without ever being
	/// acknowledged.
	TransmitFailed,

	/// The final EOT was never acknowledged.
	NoEotAck,
}

impl Error {
	/// The negative status code historical XMODEM hosts use for this
	/// failure.
	pub fn code(&self) -> i32 {
		match self {
			Error::Canceled => -1,
			Error::SyncFailed => -2,
			Error::TooManyRetries => -3,
			Error::TransmitFailed => -4,
			Error::NoEotAck => -5,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Canceled => {
				write!(f, "canceled by remote")
			}
			Error::SyncFailed => {
				write!(f, "unable to sync with the peer")
			}
			Error::TooManyRetries => {
				write!(f, "too many retransmissions")
			}
			Error::TransmitFailed => {
				write!(f, "block never acknowledged")
			}
			Error::NoEotAck => {
				write!(f, "no acknowledgement for EOT")
			}
		}
	}
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[derive(Copy, Clone, Debug)]
pub enum Checksum {
	Standard,
	CRC16,
}

#[derive(Copy, Clone, Debug)]
pub enum BlockLength {
	Standard = 128,
	OneK = 1024,
}

/// The byte transport the engine drives. This is the only seam between
/// the protocol core and the outside world; there is no module-level
/// transport state.
pub trait Channel {
	/// Read one byte, waiting at most `timeout_ms` milliseconds.
	/// Returns `None` on timeout or on a transport error; the engine
	/// treats the two identically.
	fn getc(&mut self, timeout_ms: u16) -> Option<u8>;

	/// Write one byte. Assumed to complete promptly; buffering is the
	/// transport's concern.
	fn putc(&mut self, byte: u8);
}

/// Where accepted payload bytes go on the receive side. Called once per
/// accepted block with the delivered (possibly truncated) slice.
pub trait BlockSink {
	fn store(&mut self, data: &[u8]);
}

/// Where payload bytes come from on the transmit side. `fetch` must
/// leave every byte of `buf` defined; a short source should zero-fill
/// the tail.
pub trait BlockSource {
	fn fetch(&mut self, buf: &mut [u8]);
}

/// Callback form of [`BlockSink`]; any captured context rides in the
/// closure.
pub struct SinkFn<F>(pub F);

impl<F: FnMut(&[u8])> BlockSink for SinkFn<F> {
	fn store(&mut self, data: &[u8]) {
		(self.0)(data)
	}
}

/// Callback form of [`BlockSource`].
pub struct SourceFn<F>(pub F);

impl<F: FnMut(&mut [u8])> BlockSource for SourceFn<F> {
	fn fetch(&mut self, buf: &mut [u8]) {
		(self.0)(buf)
	}
}

/// Receives into a contiguous memory region, front to back.
///
/// The region must hold at least `dest_size` bytes or delivery panics.
pub struct SliceSink<'a> {
	buf: &'a mut [u8],
	len: usize,
}

impl<'a> SliceSink<'a> {
	pub fn new(buf: &'a mut [u8]) -> SliceSink<'a> {
		SliceSink { buf, len: 0 }
	}

	/// Bytes delivered so far.
	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl BlockSink for SliceSink<'_> {
	fn store(&mut self, data: &[u8]) {
		self.buf[self.len .. self.len + data.len()]
			.copy_from_slice(data);
		self.len += data.len();
	}
}

/// Transmits a contiguous memory region, front to back. Fetches past
/// the end of the region are zero-filled, which covers a control block
/// shorter than its 128-byte frame.
pub struct SliceSource<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> SliceSource<'a> {
	pub fn new(buf: &'a [u8]) -> SliceSource<'a> {
		SliceSource { buf, pos: 0 }
	}
}

impl BlockSource for SliceSource<'_> {
	fn fetch(&mut self, buf: &mut [u8]) {
		let avail = self.buf.len() - self.pos;
		let n = if buf.len() < avail { buf.len() } else { avail };
		buf[..n].copy_from_slice(&self.buf[self.pos .. self.pos + n]);
		for b in &mut buf[n..] {
			*b = 0;
		}
		self.pos += n;
	}
}

/// Adapts a serial-style device to [`Channel`].
///
/// This way of bridging has no means of honoring the per-call timeout,
/// so it's up to the caller to configure the timeout of the device
/// before starting a transfer. Read errors and end-of-stream both
/// surface as timeouts.
pub struct IoChannel<D> {
	dev: D,
}

impl<D> IoChannel<D> {
	pub fn new(dev: D) -> IoChannel<D> {
		IoChannel { dev }
	}

	pub fn into_inner(self) -> D {
		self.dev
	}
}

impl<D: Read + Write> Channel for IoChannel<D> {
	fn getc(&mut self, _timeout_ms: u16) -> Option<u8> {
		let mut buf = [0];
		match self.dev.read(&mut buf) {
			Ok(1) => Some(buf[0]),
			Ok(_) => None,
			Err(e) => {
				if (e.kind() != io::ErrorKind::TimedOut) {
					warn!("channel read error: {}", e);
				}
				None
			}
		}
	}

	fn putc(&mut self, byte: u8) {
		if let Err(e) = self.dev.write_all(&[byte]) {
			warn!("channel write error: {}", e);
		}
	}
}

/// Feeds a byte stream into the transmitter. Reads past end-of-stream
/// are zero-filled.
pub struct ReadSource<R> {
	inner: R,
}

impl<R> ReadSource<R> {
	pub fn new(inner: R) -> ReadSource<R> {
		ReadSource { inner }
	}

	pub fn into_inner(self) -> R {
		self.inner
	}
}

impl<R: Read> BlockSource for ReadSource<R> {
	fn fetch(&mut self, buf: &mut [u8]) {
		let mut done = 0;
		while done < buf.len() {
			match self.inner.read(&mut buf[done..]) {
				Ok(0) => break,
				Ok(n) => done += n,
				Err(e) => {
					warn!("source read error: {}", e);
					break;
				}
			}
		}
		for b in &mut buf[done..] {
			*b = 0;
		}
	}
}

/// Drains received payload into a byte stream.
pub struct WriteSink<W> {
	inner: W,
}

impl<W> WriteSink<W> {
	pub fn new(inner: W) -> WriteSink<W> {
		WriteSink { inner }
	}

	pub fn into_inner(self) -> W {
		self.inner
	}
}

impl<W: Write> BlockSink for WriteSink<W> {
	fn store(&mut self, data: &[u8]) {
		if let Err(e) = self.inner.write_all(data) {
			error!("sink write error: {}", e);
		}
	}
}

/// One on-wire packet: `leader | seq | ~seq | data | trailer`. The
/// buffer lives on the stack of the session call and never outlives it.
struct Frame {
	buf: [u8; XBUF_SIZE],
	block_length: BlockLength,
	mode: Checksum,
}

/// What the framing layer concluded about an inbound packet, relative
/// to the sequence number the session expects next.
enum Verdict {
	Accept,
	Duplicate,
	Corrupt,
}

impl Frame {
	fn new(block_length: BlockLength, mode: Checksum) -> Frame {
		let mut frame = Frame {
			buf: [0; XBUF_SIZE],
			block_length,
			mode,
		};
		frame.buf[0] = match block_length {
			BlockLength::Standard => SOH,
			BlockLength::OneK => STX,
		};
		frame
	}

	fn block_size(&self) -> usize {
		self.block_length as usize
	}

	fn trailer_size(&self) -> usize {
		match self.mode {
			Checksum::Standard => 1,
			Checksum::CRC16 => 2,
		}
	}

	/// Leader + seq + complement + data + trailer.
	fn wire_size(&self) -> usize {
		3 + self.block_size() + self.trailer_size()
	}

	fn seq(&self) -> u8 {
		self.buf[1]
	}

	fn data(&self) -> &[u8] {
		&self.buf[3 .. 3 + self.block_size()]
	}

	/// Assemble an outbound packet. `effective` is how much real
	/// payload the block carries; the rest of the data region is zero
	/// padding, with a CTRL-Z marker right after the payload in text
	/// mode.
	fn encode<S: BlockSource>(
		seq: u8,
		source: &mut S,
		effective: usize,
		block_length: BlockLength,
		mode: Checksum,
		binary: bool,
	) -> Frame {
		let mut frame = Frame::new(block_length, mode);
		let bufsz = frame.block_size();
		frame.buf[1] = seq;
		frame.buf[2] = !seq;
		if (effective == 0) {
			if !binary {
				frame.buf[3] = CTRLZ;
			}
		} else {
			source.fetch(&mut frame.buf[3 .. 3 + effective]);
			if !binary && effective < bufsz {
				frame.buf[3 + effective] = CTRLZ;
			}
		}
		frame.seal();
		frame
	}

	fn seal(&mut self) {
		let bufsz = self.block_size();
		match self.mode {
			Checksum::Standard => {
				self.buf[3 + bufsz] =
					calc_checksum(&self.buf[3 .. 3 + bufsz]);
			}
			Checksum::CRC16 => {
				let crc = calc_crc(&self.buf[3 .. 3 + bufsz])
					.to_be_bytes();
				self.buf[3 + bufsz] = crc[0];
				self.buf[3 + bufsz + 1] = crc[1];
			}
		}
	}

	/// Read the body of an inbound packet, the leader byte having been
	/// consumed already. Every byte gets a one-second window; `None`
	/// means the packet went quiet mid-flight.
	fn read<C: Channel>(
		chan: &mut C,
		block_length: BlockLength,
		mode: Checksum,
	) -> Option<Frame> {
		let mut frame = Frame::new(block_length, mode);
		for i in 1 .. frame.wire_size() {
			frame.buf[i] = chan.getc(DLY_1S)?;
		}
		Some(frame)
	}

	/// Sequence/complement and trailer validation, then placement
	/// relative to the expected sequence number.
	fn classify(&self, expected: u8) -> Verdict {
		if (self.buf[1] != !self.buf[2]) {
			return Verdict::Corrupt;
		}
		let bufsz = self.block_size();
		let data = &self.buf[3 .. 3 + bufsz];
		let trailer_ok = match self.mode {
			Checksum::Standard => {
				calc_checksum(data) == self.buf[3 + bufsz]
			}
			Checksum::CRC16 => {
				calc_crc(data) == u16::from_be_bytes([
					self.buf[3 + bufsz],
					self.buf[3 + bufsz + 1],
				])
			}
		};
		if !trailer_ok {
			return Verdict::Corrupt;
		}
		if (self.seq() == expected) {
			Verdict::Accept
		} else if (self.seq() == expected.wrapping_sub(1)) {
			Verdict::Duplicate
		} else {
			Verdict::Corrupt
		}
	}

	fn emit<C: Channel>(&self, chan: &mut C) {
		for &b in &self.buf[.. self.wire_size()] {
			chan.putc(b);
		}
	}
}

/// Configuration for an XMODEM transfer.
#[derive(Copy, Clone, Debug)]
pub struct Xmodem {
	/// The preferred block length for transmission. `OneK` engages
	/// XMODEM-1K framing for any block with more than 128 bytes of
	/// payload left to carry; the receive side always honors whatever
	/// leader the peer sends.
	pub block_length: BlockLength,

	/// Binary mode sends the data region exactly as fetched. With
	/// `binary` off (text mode), the byte after the last payload byte
	/// of a short block is CTRL-Z, and a source that fills its final
	/// block exactly is followed by one extra block leading with
	/// CTRL-Z.
	pub binary: bool,
}

impl Xmodem {
	/// Creates the XMODEM config with default parameters.
	pub fn new() -> Self {
		Xmodem {
			block_length: BlockLength::Standard,
			binary: true,
		}
	}

	/// Receive an XMODEM transmission.
	///
	/// `chan` is the byte transport; accepted payload goes to `sink`,
	/// one call per accepted block. `dest_size` bounds delivery: a
	/// block that would overshoot it is truncated on delivery (but
	/// still acknowledged in full), and `dest_size == 0` instead
	/// receives exactly one control block (YMODEM block 0, sequence
	/// number 0). `checksum` picks the integrity mode to solicit;
	/// after 16 unanswered CRC probes the receiver falls back to the
	/// classic checksum on its own.
	///
	/// Returns the number of payload bytes delivered to `sink`.
	pub fn recv<C: Channel, S: BlockSink>(
		&self,
		chan: &mut C,
		sink: &mut S,
		dest_size: usize,
		checksum: Checksum,
	) -> Result<usize> {
		let mut mode = checksum;
		let mut trychar = Some(match mode {
			Checksum::Standard => NAK,
			Checksum::CRC16 => CRC,
		});
		let mut packetno: u8 = if (dest_size != 0) { 1 } else { 0 };
		let mut len: usize = 0;
		let mut retrans = MAXRETRANS;

		debug!("starting XMODEM receive, {} bytes wanted", dest_size);

		'session: loop {
			/*
			 * Solicit the transmitter (or, once the transfer is
			 * underway, silently await the next leader byte).
			 */
			let mut leader = None;
			for _retry in 0 .. 16 {
				if let Some(probe) = trychar {
					chan.putc(probe);
				}
				match chan.getc(DLY_1S * 2) {
					Some(SOH) => {
						leader =
						    Some(BlockLength::Standard);
						break;
					}
					Some(STX) => {
						leader =
						    Some(BlockLength::OneK);
						break;
					}
					Some(EOT) => {
						chan.putc(ACK);
						info!(
							"receive complete, \
							 {} bytes",
							len
						);
						return Ok(len);
					}
					Some(CAN) => {
						if (chan.getc(DLY_1S)
						    == Some(CAN))
						{
							flush_input(chan);
							chan.putc(ACK);
							warn!("canceled by \
							       remote");
							return Err(
							    Error::Canceled);
						}
					}
					Some(c) => debug!(
						"unexpected byte {:#04x} \
						 while syncing",
						c
					),
					None => {}
				}
			}
			let block_length = match leader {
				Some(bl) => bl,
				None => {
					if (trychar == Some(CRC)) {
						/*
						 * The peer may not speak CRC
						 * mode; downgrade once and
						 * probe with NAK instead.
						 */
						warn!(
							"no answer to CRC \
							 probe, falling back \
							 to checksum"
						);
						mode = Checksum::Standard;
						trychar = Some(NAK);
						continue 'session;
					}
					flush_input(chan);
					cancel(chan);
					error!("unable to sync with \
					        transmitter");
					return Err(Error::SyncFailed);
				}
			};

			/* A transfer is underway; stop probing. */
			trychar = None;

			let frame = match Frame::read(chan, block_length, mode)
			{
				Some(f) => f,
				None => {
					warn!(
						"packet {} went quiet \
						 mid-flight",
						packetno
					);
					flush_input(chan);
					chan.putc(NAK);
					continue 'session;
				}
			};

			match frame.classify(packetno) {
				Verdict::Accept => {
					let bufsz = frame.block_size();
					let goal = if (dest_size != 0) {
						dest_size
					} else {
						bufsz
					};
					let mut count = goal - len;
					if (count > bufsz) {
						count = bufsz;
					}
					if (count > 0) {
						sink.store(
						    &frame.data()[.. count]);
						len += count;
					}
					debug!(
						"accepted block {}, {} bytes \
						 delivered",
						packetno, count
					);
					packetno = packetno.wrapping_add(1);
					retrans = MAXRETRANS + 1;
				}
				Verdict::Duplicate => {
					debug!(
						"retransmission of block {}, \
						 not delivered",
						frame.seq()
					);
				}
				Verdict::Corrupt => {
					warn!(
						"rejecting bad packet \
						 (seq {})",
						frame.seq()
					);
					flush_input(chan);
					chan.putc(NAK);
					continue 'session;
				}
			}

			retrans -= 1;
			if (retrans == 0) {
				flush_input(chan);
				cancel(chan);
				error!("too many retransmissions, giving up");
				return Err(Error::TooManyRetries);
			}
			chan.putc(ACK);
			if (dest_size == 0) {
				/* One-shot control block exchange. */
				return Ok(len);
			}
		}
	}

	/// Starts the XMODEM transmission.
	///
	/// `chan` is the byte transport; payload is pulled from `source`
	/// one block at a time. `source_size` is how many payload bytes
	/// the source holds; `source_size == 0` instead sends exactly one
	/// control block (YMODEM block 0, sequence number 0). The
	/// integrity mode is whatever the receiver's sync byte asks for.
	///
	/// Returns the number of bytes acknowledged by the peer, which is
	/// `source_size` rounded up to a block boundary — padding is part
	/// of every block, and historical counterparts count it that way.
	/// A text-mode control block is chased by its CTRL-Z marker
	/// block, so that session reports 256 bytes rather than 128.
	pub fn send<C: Channel, S: BlockSource>(
		&self,
		chan: &mut C,
		source: &mut S,
		source_size: usize,
	) -> Result<usize> {
		debug!("starting XMODEM transmit, {} bytes", source_size);
		let mode = self.start_send(chan)?;
		self.send_stream(chan, source, source_size, mode)
	}

	/// Await the receiver's sync byte; it decides the integrity mode.
	fn start_send<C: Channel>(&self, chan: &mut C) -> Result<Checksum> {
		for _retry in 0 .. 16 {
			match chan.getc(DLY_1S * 2) {
				Some(CRC) => {
					debug!("16-bit CRC requested");
					return Ok(Checksum::CRC16);
				}
				Some(NAK) => {
					debug!("standard checksum requested");
					return Ok(Checksum::Standard);
				}
				Some(CAN) => {
					if (chan.getc(DLY_1S) == Some(CAN)) {
						chan.putc(ACK);
						flush_input(chan);
						warn!("canceled by remote \
						       before transfer start");
						return Err(Error::Canceled);
					}
				}
				Some(c) => warn!(
					"unknown byte {:#04x} at start of \
					 transfer",
					c
				),
				None => {}
			}
		}
		cancel(chan);
		flush_input(chan);
		error!("receiver never requested a transfer");
		Err(Error::SyncFailed)
	}

	fn send_stream<C: Channel, S: BlockSource>(
		&self,
		chan: &mut C,
		source: &mut S,
		source_size: usize,
		mode: Checksum,
	) -> Result<usize> {
		let mut packetno: u8 = if (source_size != 0) { 1 } else { 0 };
		let mut len: usize = 0;

		loop {
			/* A control block is always a short frame. */
			let goal = if (source_size != 0) {
				source_size
			} else {
				128
			};
			let remaining = goal.checked_sub(len);
			let onek = match self.block_length {
				BlockLength::Standard => false,
				BlockLength::OneK => true,
			};
			let block_length = match remaining {
				Some(r) if onek && r > 128 => {
					BlockLength::OneK
				}
				_ => BlockLength::Standard,
			};
			let bufsz = block_length as usize;
			let mut effective = remaining.unwrap_or(0);
			if (effective > bufsz) {
				effective = bufsz;
			}

			if effective > 0
				|| (!self.binary && remaining == Some(0))
			{
				let frame = Frame::encode(
					packetno,
					source,
					effective,
					block_length,
					mode,
					self.binary,
				);

				/*
				 * Stop-and-wait: this packet goes out up to
				 * MAXRETRANS times until the peer
				 * acknowledges it.
				 */
				let mut acked = false;
				for _retry in 0 .. MAXRETRANS {
					debug!(
						"sending block {} ({} data \
						 bytes)",
						packetno, effective
					);
					frame.emit(chan);
					match chan.getc(DLY_1S) {
						Some(ACK) => {
							acked = true;
							break;
						}
						Some(CAN) => {
							if (chan.getc(DLY_1S)
							    == Some(CAN))
							{
								chan.putc(ACK);
								flush_input(
								    chan);
								warn!(
								    "canceled \
								     by \
								     remote");
								return Err(
								    Error::Canceled,
								);
							}
						}
						Some(NAK) => warn!(
							"block {} rejected, \
							 retransmitting",
							packetno
						),
						Some(c) => warn!(
							"expected ACK for \
							 block {}, got \
							 {:#04x}",
							packetno, c
						),
						None => warn!(
							"timeout waiting for \
							 ACK for block {}",
							packetno
						),
					}
				}
				if !acked {
					cancel(chan);
					flush_input(chan);
					error!(
						"block {} never \
						 acknowledged, giving up",
						packetno
					);
					return Err(Error::TransmitFailed);
				}
				packetno = packetno.wrapping_add(1);
				/*
				 * The whole block counts, padding included;
				 * that is how historical peers account for
				 * it.
				 */
				len += bufsz;
			} else if (source_size != 0) {
				return self.finish_send(chan, len);
			} else {
				info!("control block sent");
				return Ok(len);
			}
		}
	}

	/// Send EOT until the receiver acknowledges the end of the
	/// transfer.
	fn finish_send<C: Channel>(
		&self,
		chan: &mut C,
		len: usize,
	) -> Result<usize> {
		for _retry in 0 .. 10 {
			chan.putc(EOT);
			if (chan.getc(DLY_1S * 2) == Some(ACK)) {
				info!("transmit complete, {} bytes", len);
				return Ok(len);
			}
			warn!("no acknowledgement for EOT yet");
		}
		flush_input(chan);
		error!("EOT never acknowledged");
		Err(Error::NoEotAck)
	}
}

impl Default for Xmodem {
	fn default() -> Self {
		Xmodem::new()
	}
}

fn calc_checksum(data: &[u8]) -> u8 {
	data.iter().fold(0, |x, &y| x.wrapping_add(y))
}

fn calc_crc(data: &[u8]) -> u16 {
	crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Drain pipelined garbage: keep reading until the line has been quiet
/// for a second and a half.
fn flush_input<C: Channel>(chan: &mut C) {
	while chan.getc(DLY_1S * 3 / 2).is_some() {}
}

/// Politely terminate the peer before reporting a hard failure.
fn cancel<C: Channel>(chan: &mut C) {
	chan.putc(CAN);
	chan.putc(CAN);
	chan.putc(CAN);
}
