// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to serialize/deserialize wire messages as
//! well as the persistent channel records.

use std::io::{Read, Write};
use std::cmp;

use bitcoin::consensus;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::hash_types::{Txid, BlockHash};
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, COMPACT_SIGNATURE_SIZE};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::transaction::{Transaction, TxOut};
use bitcoin::Witness;

use crate::ln::msgs::DecodeError;

pub(crate) const MAX_BUF_SIZE: usize = 64 * 1024;

/// A trait that is similar to [`std::io::Write`] but has one extra function which can be used to
/// size buffers being written into.
///
/// An impl is provided for any type that also impls [`std::io::Write`] which simply ignores size
/// hints.
pub trait Writer {
	/// Writes the given buf out. See [`std::io::Write::write_all`] for more.
	fn write_all(&mut self, buf: &[u8]) -> Result<(), std::io::Error>;
	/// Hints that data of the given size is about to be written. This may not always be called
	/// prior to data being written and may be safely ignored.
	fn size_hint(&mut self, size: usize);
}

impl<W: Write> Writer for W {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), std::io::Error> {
		<Self as std::io::Write>::write_all(self, buf)
	}
	#[inline]
	fn size_hint(&mut self, _size: usize) {}
}

/// Adapts a [`Writer`] into the [`bitcoin::io::Write`] consensus encoding requires.
pub(crate) struct WriterWriteAdaptor<'a, W: Writer + 'a>(pub &'a mut W);
impl<'a, W: Writer + 'a> bitcoin::io::Write for WriterWriteAdaptor<'a, W> {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> bitcoin::io::Result<()> {
		self.0.write_all(buf).map_err(|e| e.into())
	}
	#[inline]
	fn write(&mut self, buf: &[u8]) -> bitcoin::io::Result<usize> {
		self.0.write_all(buf).map_err(bitcoin::io::Error::from)?;
		Ok(buf.len())
	}
	#[inline]
	fn flush(&mut self) -> bitcoin::io::Result<()> {
		Ok(())
	}
}

pub(crate) struct VecWriter(pub Vec<u8>);
impl Writer for VecWriter {
	fn write_all(&mut self, buf: &[u8]) -> Result<(), std::io::Error> {
		self.0.extend_from_slice(buf);
		Ok(())
	}
	fn size_hint(&mut self, size: usize) {
		self.0.reserve_exact(size);
	}
}

/// Writer that only tracks the amount of data written - useful if you need to calculate the length
/// of some data when serialized but don't yet need the full data.
pub(crate) struct LengthCalculatingWriter(pub usize);
impl Writer for LengthCalculatingWriter {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), std::io::Error> {
		self.0 += buf.len();
		Ok(())
	}
	#[inline]
	fn size_hint(&mut self, _size: usize) {}
}

/// Essentially [`std::io::Take`] but a bit simpler and with a method to walk the underlying stream
/// forward to ensure we always consume exactly the fixed length specified.
pub(crate) struct FixedLengthReader<'a, R: Read> {
	read: &'a mut R,
	bytes_read: u64,
	total_bytes: u64,
}
impl<'a, R: Read> FixedLengthReader<'a, R> {
	pub fn new(read: &'a mut R, total_bytes: u64) -> Self {
		Self { read, bytes_read: 0, total_bytes }
	}

	pub fn eat_remaining(&mut self) -> Result<(), DecodeError> {
		std::io::copy(self, &mut std::io::sink()).map_err(|_| DecodeError::ShortRead)?;
		if self.bytes_read != self.total_bytes {
			Err(DecodeError::ShortRead)
		} else {
			Ok(())
		}
	}
}
impl<'a, R: Read> Read for FixedLengthReader<'a, R> {
	#[inline]
	fn read(&mut self, dest: &mut [u8]) -> Result<usize, std::io::Error> {
		if self.total_bytes == self.bytes_read {
			Ok(0)
		} else {
			let read_len = cmp::min(dest.len() as u64, self.total_bytes - self.bytes_read);
			match self.read.read(&mut dest[0..(read_len as usize)]) {
				Ok(v) => {
					self.bytes_read += v as u64;
					Ok(v)
				},
				Err(e) => Err(e),
			}
		}
	}
}

/// A trait that various types implement allowing them to be written out to a [`Writer`].
pub trait Writeable {
	/// Writes `self` out to the given [`Writer`].
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error>;

	/// Writes `self` out to a `Vec<u8>`.
	fn encode(&self) -> Vec<u8> {
		let mut msg = VecWriter(Vec::new());
		self.write(&mut msg).unwrap();
		msg.0
	}

	/// Gets the length of this object after it has been serialized. This can be overridden to
	/// optimize cases where we prepend an object with its length.
	fn serialized_length(&self) -> usize {
		let mut len_calc = LengthCalculatingWriter(0);
		self.write(&mut len_calc).expect("No in-memory data may fail to serialize");
		len_calc.0
	}
}

/// A trait that various types implement allowing them to be read in from a [`Read`].
pub trait Readable
where
	Self: Sized,
{
	/// Reads a `Self` in from the given [`Read`].
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

/// A trait that various higher-level types implement allowing them to be read in from a [`Read`]
/// given some additional set of arguments which is required to deserialize.
pub trait ReadableArgs<P>
where
	Self: Sized,
{
	/// Reads a `Self` in from the given [`Read`].
	fn read<R: Read>(reader: &mut R, params: P) -> Result<Self, DecodeError>;
}

/// A trait that various types implement allowing them to (maybe) be read in from a [`Read`].
/// `None` indicates the read value is to be ignored (eg an odd, unknown serialization variant).
pub trait MaybeReadable
where
	Self: Sized,
{
	/// Reads a `Self` in from the given [`Read`].
	fn read<R: Read>(reader: &mut R) -> Result<Option<Self>, DecodeError>;
}

impl<T: Readable> MaybeReadable for T {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<Option<T>, DecodeError> {
		Ok(Some(Readable::read(reader)?))
	}
}

/// Lightning TLV uses a custom variable-length integer called `BigSize`. It is similar to
/// Bitcoin's variable-length integers except that it is serialized in big-endian instead of
/// little-endian.
///
/// Like Bitcoin's variable-length integer, it exhibits ambiguity in that certain values can be
/// encoded in several different ways, which we must check for at deserialization-time.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BigSize(pub u64);
impl Writeable for BigSize {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		match self.0 {
			0..=0xFC => (self.0 as u8).write(writer),
			0xFD..=0xFFFF => {
				0xFDu8.write(writer)?;
				(self.0 as u16).write(writer)
			},
			0x10000..=0xFFFFFFFF => {
				0xFEu8.write(writer)?;
				(self.0 as u32).write(writer)
			},
			_ => {
				0xFFu8.write(writer)?;
				self.0.write(writer)
			},
		}
	}
}
impl Readable for BigSize {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<BigSize, DecodeError> {
		let n: u8 = Readable::read(reader)?;
		match n {
			0xFF => {
				let x: u64 = Readable::read(reader)?;
				if x < 0x100000000 {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x))
				}
			},
			0xFE => {
				let x: u32 = Readable::read(reader)?;
				if x < 0x10000 {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x as u64))
				}
			},
			0xFD => {
				let x: u16 = Readable::read(reader)?;
				if x < 0xFD {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x as u64))
				}
			},
			n => Ok(BigSize(n as u64)),
		}
	}
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $len: expr) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
				writer.write_all(&self.to_be_bytes())
			}
		}
		impl Readable for $val_type {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(<$val_type>::from_be_bytes(buf))
			}
		}
	};
}

impl_writeable_primitive!(u16, 2);
impl_writeable_primitive!(u32, 4);
impl_writeable_primitive!(u64, 8);
impl_writeable_primitive!(i64, 8);

impl Writeable for u8 {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		writer.write_all(&[*self])
	}
}
impl Readable for u8 {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<u8, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

impl Writeable for bool {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		writer.write_all(&[if *self { 1 } else { 0 }])
	}
}
impl Readable for bool {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<bool, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		if buf[0] != 0 && buf[0] != 1 {
			return Err(DecodeError::InvalidValue);
		}
		Ok(buf[0] == 1)
	}
}

// () is used as the unit value of presence-only TLV records.
impl Writeable for () {
	#[inline]
	fn write<W: Writer>(&self, _writer: &mut W) -> Result<(), std::io::Error> {
		Ok(())
	}
}
impl Readable for () {
	#[inline]
	fn read<R: Read>(_reader: &mut R) -> Result<(), DecodeError> {
		Ok(())
	}
}

macro_rules! impl_array {
	($size:expr) => {
		impl Writeable for [u8; $size] {
			#[inline]
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				w.write_all(self)
			}
		}
		impl Readable for [u8; $size] {
			#[inline]
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let mut buf = [0u8; $size];
				r.read_exact(&mut buf)?;
				Ok(buf)
			}
		}
	};
}

impl_array!(16); // for HMAC halves
impl_array!(32); // for channel id, payment hash, secrets
impl_array!(33); // for PublicKey
impl_array!(64); // for Signature
impl_array!(1300); // for OnionPacket.hop_data

impl Writeable for Vec<u8> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u16).write(w)?;
		w.write_all(&self)
	}
}
impl Readable for Vec<u8> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let mut ret = vec![0; len as usize];
		r.read_exact(&mut ret)?;
		Ok(ret)
	}
}

impl Writeable for String {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u16).write(w)?;
		w.write_all(self.as_bytes())
	}
}
impl Readable for String {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let v: Vec<u8> = Readable::read(r)?;
		let ret = String::from_utf8(v).map_err(|_| DecodeError::InvalidValue)?;
		Ok(ret)
	}
}

impl Writeable for Vec<Signature> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u16).write(w)?;
		for e in self.iter() {
			e.write(w)?;
		}
		Ok(())
	}
}
impl Readable for Vec<Signature> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let byte_size = (len as usize)
			.checked_mul(COMPACT_SIGNATURE_SIZE)
			.ok_or(DecodeError::BadLengthDescriptor)?;
		if byte_size > MAX_BUF_SIZE {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let mut ret = Vec::with_capacity(len as usize);
		for _ in 0..len {
			ret.push(Readable::read(r)?);
		}
		Ok(ret)
	}
}

impl Writeable for Vec<Witness> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u16).write(w)?;
		for witness in self.iter() {
			(witness.serialized_length() as u16).write(w)?;
			witness.write(w)?;
		}
		Ok(())
	}
}
impl Readable for Vec<Witness> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let num_witnesses = <u16 as Readable>::read(r)? as usize;
		let mut witnesses = Vec::with_capacity(cmp::min(num_witnesses, MAX_BUF_SIZE / 4));
		for _ in 0..num_witnesses {
			// Even the smallest witness (a single empty element) takes at least two bytes.
			let witness_len = <u16 as Readable>::read(r)? as u64;
			if witness_len < 2 {
				return Err(DecodeError::InvalidValue);
			}
			let mut witness_reader = FixedLengthReader::new(r, witness_len);
			let witness: Witness = Readable::read(&mut witness_reader)?;
			witness_reader.eat_remaining()?;
			witnesses.push(witness);
		}
		Ok(witnesses)
	}
}

impl Writeable for ScriptBuf {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u16).write(w)?;
		w.write_all(self.as_bytes())
	}
}
impl Readable for ScriptBuf {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len = <u16 as Readable>::read(r)? as usize;
		let mut buf = vec![0; len];
		r.read_exact(&mut buf)?;
		Ok(ScriptBuf::from(buf))
	}
}

impl Writeable for PublicKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.serialize().write(w)
	}
	#[inline]
	fn serialized_length(&self) -> usize {
		PUBLIC_KEY_SIZE
	}
}
impl Readable for PublicKey {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; PUBLIC_KEY_SIZE] = Readable::read(r)?;
		match PublicKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for SecretKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		let mut ser = [0; SECRET_KEY_SIZE];
		ser.copy_from_slice(&self[..]);
		ser.write(w)
	}
	#[inline]
	fn serialized_length(&self) -> usize {
		SECRET_KEY_SIZE
	}
}
impl Readable for SecretKey {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; SECRET_KEY_SIZE] = Readable::read(r)?;
		match SecretKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for Signature {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.serialize_compact().write(w)
	}
	#[inline]
	fn serialized_length(&self) -> usize {
		COMPACT_SIGNATURE_SIZE
	}
}
impl Readable for Signature {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; COMPACT_SIGNATURE_SIZE] = Readable::read(r)?;
		match Signature::from_compact(&buf) {
			Ok(sig) => Ok(sig),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

macro_rules! impl_writeable_hash {
	($hash_type:ty) => {
		impl Writeable for $hash_type {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				w.write_all(&self[..])
			}
		}
		impl Readable for $hash_type {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let buf: [u8; 32] = Readable::read(r)?;
				Ok(<$hash_type>::from_byte_array(buf))
			}
		}
	};
}
impl_writeable_hash!(Txid);
impl_writeable_hash!(BlockHash);

impl<T: Writeable> Writeable for Option<T> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		match *self {
			None => 0u8.write(w)?,
			Some(ref data) => {
				1u8.write(w)?;
				data.write(w)?;
			},
		}
		Ok(())
	}
}
impl<T: Readable> Readable for Option<T> {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(None),
			1 => Ok(Some(Readable::read(r)?)),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

/// Adapts a [`std::io::Read`] into the [`bitcoin::io::BufRead`] consensus decoding requires.
/// The single-byte buffer keeps this trivially correct; the decoder only uses `BufRead` to avoid
/// double-buffering, falling back to `read_exact` for everything that matters.
pub(crate) struct ConsensusReadAdapter<'a, R: Read> {
	inner: &'a mut R,
	byte: [u8; 1],
	have_byte: bool,
}

impl<'a, R: Read> ConsensusReadAdapter<'a, R> {
	pub fn new(inner: &'a mut R) -> Self {
		Self { inner, byte: [0], have_byte: false }
	}
}

impl<'a, R: Read> bitcoin::io::Read for ConsensusReadAdapter<'a, R> {
	fn read(&mut self, dest: &mut [u8]) -> bitcoin::io::Result<usize> {
		if self.have_byte && !dest.is_empty() {
			dest[0] = self.byte[0];
			self.have_byte = false;
			return Ok(1);
		}
		self.inner.read(dest).map_err(|e| e.into())
	}
}

impl<'a, R: Read> bitcoin::io::BufRead for ConsensusReadAdapter<'a, R> {
	fn fill_buf(&mut self) -> bitcoin::io::Result<&[u8]> {
		if !self.have_byte {
			let read = self.inner.read(&mut self.byte).map_err(bitcoin::io::Error::from)?;
			self.have_byte = read == 1;
		}
		if self.have_byte {
			Ok(&self.byte[..])
		} else {
			Ok(&[])
		}
	}
	fn consume(&mut self, amount: usize) {
		if amount > 0 {
			debug_assert!(self.have_byte && amount == 1);
			self.have_byte = false;
		}
	}
}

macro_rules! impl_consensus_ser {
	($bitcoin_type:ty) => {
		impl Writeable for $bitcoin_type {
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
				match self.consensus_encode(&mut WriterWriteAdaptor(writer)) {
					Ok(_) => Ok(()),
					Err(e) => Err(e.into()),
				}
			}
		}
		impl Readable for $bitcoin_type {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				match consensus::encode::Decodable::consensus_decode(&mut ConsensusReadAdapter::new(r)) {
					Ok(t) => Ok(t),
					Err(consensus::encode::Error::Io(ref e))
						if e.kind() == bitcoin::io::ErrorKind::UnexpectedEof =>
					{
						Err(DecodeError::ShortRead)
					},
					Err(_) => Err(DecodeError::InvalidValue),
				}
			}
		}
	};
}
impl_consensus_ser!(Transaction);
impl_consensus_ser!(TxOut);
impl_consensus_ser!(Witness);

impl<A: Writeable, B: Writeable> Writeable for (A, B) {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.0.write(w)?;
		self.1.write(w)
	}
}
impl<A: Readable, B: Readable> Readable for (A, B) {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let a: A = Readable::read(r)?;
		let b: B = Readable::read(r)?;
		Ok((a, b))
	}
}

/// A [`Transaction`] wrapper for transactions which are relayed inside other messages and thus
/// must serialize to no more than 65535 bytes.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TransactionU16LenLimited(Transaction);

impl TransactionU16LenLimited {
	/// Constructs a new `TransactionU16LenLimited` from a [`Transaction`] only if its serialized
	/// length is <= `u16::MAX`.
	pub fn new(transaction: Transaction) -> Result<Self, ()> {
		if transaction.serialized_length() > u16::MAX as usize {
			Err(())
		} else {
			Ok(Self(transaction))
		}
	}

	/// Consumes this `TransactionU16LenLimited` and returns its contained [`Transaction`].
	pub fn into_transaction(self) -> Transaction {
		self.0
	}

	/// Returns a reference to the contained [`Transaction`].
	pub fn as_transaction(&self) -> &Transaction {
		&self.0
	}
}

impl Writeable for TransactionU16LenLimited {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.0.serialized_length() as u16).write(w)?;
		self.0.write(w)
	}
}
impl Readable for TransactionU16LenLimited {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len = <u16 as Readable>::read(r)?;
		let mut tx_reader = FixedLengthReader::new(r, len as u64);
		let tx: Transaction = Readable::read(&mut tx_reader)?;
		if tx_reader.bytes_read != tx_reader.total_bytes {
			Err(DecodeError::BadLengthDescriptor)
		} else {
			Ok(Self(tx))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn bigsize_encoding_decoding() {
		let values = vec![0, 252, 253, 65535, 65536, 4294967295, 4294967296, u64::MAX];
		let bytes = vec![
			"00", "fc", "fd00fd", "fdffff", "fe00010000", "feffffffff", "ff0000000100000000",
			"ffffffffffffffffff",
		];
		for i in 0..values.len() {
			let mut stream = Cursor::new(::hex::decode(bytes[i]).unwrap());
			assert_eq!(<super::BigSize as Readable>::read(&mut stream).unwrap().0, values[i]);
			let mut stream = VecWriter(Vec::new());
			BigSize(values[i]).write(&mut stream).unwrap();
			assert_eq!(stream.0, ::hex::decode(bytes[i]).unwrap());
		}
		let err_bytes = vec![
			"fd00fc", "fe0000ffff", "ff00000000ffffffff", "fd00", "feffff", "ffffffffff", "fd",
			"fe", "ff", "",
		];
		for i in 0..err_bytes.len() {
			let mut stream = Cursor::new(::hex::decode(err_bytes[i]).unwrap());
			if i < 3 {
				assert_eq!(<super::BigSize as Readable>::read(&mut stream).err(), Some(DecodeError::InvalidValue));
			} else {
				assert_eq!(<super::BigSize as Readable>::read(&mut stream).err(), Some(DecodeError::ShortRead));
			}
		}
	}

	#[test]
	fn fixed_length_reader_eats_remaining() {
		let buf = ::hex::decode("deadbeef1badbeef").unwrap();
		let mut cursor = Cursor::new(&buf);
		let mut reader = FixedLengthReader::new(&mut cursor, 6);
		let read: u32 = Readable::read(&mut reader).unwrap();
		assert_eq!(read, 0xdeadbeef);
		reader.eat_remaining().unwrap();
		let trailing: u16 = Readable::read(&mut cursor).unwrap();
		assert_eq!(trailing, 0xbeef);
	}
}
