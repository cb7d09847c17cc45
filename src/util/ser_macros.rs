// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Some macros that implement [`Readable`]/[`Writeable`] traits for lightning messages.
//! They also handle serialization and deserialization of TLVs.
//!
//! [`Readable`]: crate::util::ser::Readable
//! [`Writeable`]: crate::util::ser::Writeable

/// Writes out a single TLV record's value, if present.
macro_rules! _encode_tlv {
	($stream: expr, $type: expr, $field: expr, required) => {
		$crate::util::ser::BigSize($type).write($stream)?;
		$crate::util::ser::BigSize($field.serialized_length() as u64).write($stream)?;
		$field.write($stream)?;
	};
	($stream: expr, $type: expr, $field: expr, option) => {
		if let Some(ref field) = $field {
			$crate::util::ser::BigSize($type).write($stream)?;
			$crate::util::ser::BigSize(field.serialized_length() as u64).write($stream)?;
			field.write($stream)?;
		}
	};
}

/// Writes out a suffix to an object as a length-prefixed TLV stream which contains potentially
/// none of the fields. Fields must be given in ascending type order.
macro_rules! encode_tlv_stream {
	($stream: expr, {$(($type: expr, $field: expr, $fieldty: tt)),* $(,)*}) => { {
		#[allow(unused_imports)]
		use $crate::util::ser::Writeable;
		$(
			_encode_tlv!($stream, $type, $field, $fieldty);
		)*
		#[allow(unused_mut, unused_variables, unused_assignments)]
		#[cfg(debug_assertions)]
		{
			let mut last_seen: Option<u64> = None;
			$(
				if let Some(t) = last_seen {
					debug_assert!(t < $type, "TLV types must be strictly increasing");
				}
				last_seen = Some($type);
			)*
		}
	} }
}

/// Reads one TLV record's value into the destination field.
macro_rules! _decode_tlv {
	($reader: expr, $field: ident, required) => {
		$field = Some($crate::util::ser::Readable::read(&mut $reader)?);
	};
	($reader: expr, $field: ident, option) => {
		$field = Some($crate::util::ser::Readable::read(&mut $reader)?);
	};
}

/// Reads a TLV stream (until the end of the given reader) into a set of pre-declared
/// `Option<..>`-typed locals. Checks type monotonicity and rejects unknown even types.
macro_rules! decode_tlv_stream {
	($stream: expr, {$(($type: expr, $field: ident, $fieldty: tt)),* $(,)*}) => { {
		use $crate::ln::msgs::DecodeError;
		let mut last_seen_type: Option<u64> = None;
		'tlv_read: loop {
			// First decode the type of this TLV, stopping cleanly if we've hit the end of the
			// stream. A type which begins mid-way through and then hits the end is a real error.
			let first: u8 = {
				let mut buf = [0u8; 1];
				match std::io::Read::read($stream, &mut buf) {
					Ok(0) => break 'tlv_read,
					Ok(_) => buf[0],
					Err(_) => return Err(DecodeError::ShortRead),
				}
			};
			let typ: u64 = match first {
				0xFF => <u64 as $crate::util::ser::Readable>::read($stream)?,
				0xFE => <u32 as $crate::util::ser::Readable>::read($stream)? as u64,
				0xFD => <u16 as $crate::util::ser::Readable>::read($stream)? as u64,
				n => n as u64,
			};

			// Types must appear in strictly-ascending order
			if let Some(t) = last_seen_type {
				if typ <= t {
					return Err(DecodeError::InvalidValue);
				}
			}
			last_seen_type = Some(typ);

			let length: $crate::util::ser::BigSize = $crate::util::ser::Readable::read($stream)?;
			let mut s = $crate::util::ser::FixedLengthReader::new($stream, length.0);
			match typ {
				$($type => {
					_decode_tlv!(s, $field, $fieldty);
				},)*
				t if t % 2 == 0 => {
					return Err(DecodeError::UnknownRequiredFeature);
				},
				_ => {},
			}
			s.eat_remaining()?;
		}
		$(
			decode_tlv_stream!(@CHECK_REQUIRED $field, $fieldty);
		)*
	} };
	(@CHECK_REQUIRED $field: ident, required) => {
		if $field.is_none() {
			return Err(DecodeError::InvalidValue);
		}
	};
	(@CHECK_REQUIRED $field: ident, option) => {};
}

/// Implements [`Readable`]/[`Writeable`] for a struct by serializing its fields in declaration
/// order with no length or type prefixes.
///
/// [`Readable`]: crate::util::ser::Readable
/// [`Writeable`]: crate::util::ser::Writeable
macro_rules! impl_writeable {
	($st:ident, {$($field:ident),* $(,)*}) => {
		impl $crate::util::ser::Writeable for $st {
			fn write<W: $crate::util::ser::Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				#[allow(unused_imports)]
				use $crate::util::ser::Writeable as _;
				$( self.$field.write(w)?; )*
				Ok(())
			}
		}

		impl $crate::util::ser::Readable for $st {
			fn read<R: std::io::Read>(r: &mut R) -> Result<Self, $crate::ln::msgs::DecodeError> {
				Ok(Self {
					$($field: $crate::util::ser::Readable::read(r)?),*
				})
			}
		}
	}
}

/// Implements [`Readable`]/[`Writeable`] for a wire message: fixed fields in declaration order
/// followed by a TLV stream running to the end of the message.
///
/// [`Readable`]: crate::util::ser::Readable
/// [`Writeable`]: crate::util::ser::Writeable
macro_rules! impl_writeable_msg {
	($st:ident, {$($field:ident),* $(,)*}, {$(($type: expr, $tlvfield: ident, $fieldty: tt)),* $(,)*}) => {
		impl $crate::util::ser::Writeable for $st {
			fn write<W: $crate::util::ser::Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				#[allow(unused_imports)]
				use $crate::util::ser::Writeable as _;
				$( self.$field.write(w)?; )*
				encode_tlv_stream!(w, {$(($type, self.$tlvfield, $fieldty)),*});
				Ok(())
			}
		}
		impl $crate::util::ser::Readable for $st {
			fn read<R: std::io::Read>(r: &mut R) -> Result<Self, $crate::ln::msgs::DecodeError> {
				$(let $field = $crate::util::ser::Readable::read(r)?;)*
				$(let mut $tlvfield = None;)*
				decode_tlv_stream!(r, {$(($type, $tlvfield, $fieldty)),*});
				Ok(Self {
					$($field,)*
					$($tlvfield: impl_writeable_msg!(@UNWRAP $tlvfield, $fieldty),)*
				})
			}
		}
	};
	(@UNWRAP $tlvfield: ident, required) => { $tlvfield.unwrap() };
	(@UNWRAP $tlvfield: ident, option) => { $tlvfield };
}

#[cfg(test)]
mod tests {
	use crate::ln::msgs::DecodeError;
	use crate::util::ser::{Readable, VecWriter, Writeable};
	use std::io::Cursor;

	fn tlv_reader(s: &[u8]) -> Result<(u64, u32, Option<u32>), DecodeError> {
		let mut s = Cursor::new(s);
		let mut a: Option<u64> = None;
		let mut b: Option<u32> = None;
		let mut c: Option<u32> = None;
		decode_tlv_stream!(&mut s, { (2, a, required), (3, b, required), (4, c, option) });
		Ok((a.unwrap(), b.unwrap(), c))
	}

	#[test]
	fn tlv_v_short_read() {
		// We only expect a u32 for type 3 (which we are given), but the TLV format says we must
		// read the encoded length, and the length of 8 runs past the end of the stream.
		if let Err(DecodeError::ShortRead) = tlv_reader(
			&::hex::decode(concat!("0100", "0208deadbeef1badbeef", "0308deadbeef")).unwrap()[..],
		) {
		} else {
			panic!();
		}
	}

	#[test]
	fn tlv_types_out_of_order() {
		if let Err(DecodeError::InvalidValue) = tlv_reader(
			&::hex::decode(concat!("0100", "0304deadbeef", "0208deadbeef1badbeef")).unwrap()[..],
		) {
		} else {
			panic!();
		}
		// ...even if its some field we don't understand
		if let Err(DecodeError::InvalidValue) = tlv_reader(
			&::hex::decode(concat!("0208deadbeef1badbeef", "0100", "0304deadbeef")).unwrap()[..],
		) {
		} else {
			panic!();
		}
	}

	#[test]
	fn tlv_req_type_missing_or_extra() {
		// It's also bad if they included even fields we don't understand
		if let Err(DecodeError::UnknownRequiredFeature) = tlv_reader(
			&::hex::decode(concat!("0100", "0208deadbeef1badbeef", "0304deadbeef", "0600"))
				.unwrap()[..],
		) {
		} else {
			panic!();
		}
		// ... or if they're missing fields we need
		if let Err(DecodeError::InvalidValue) =
			tlv_reader(&::hex::decode(concat!("0100", "0208deadbeef1badbeef")).unwrap()[..])
		{
		} else {
			panic!();
		}
	}

	#[test]
	fn tlv_simple_good_cases() {
		assert_eq!(
			tlv_reader(&::hex::decode(concat!("0208deadbeef1badbeef", "03041bad1dea")).unwrap()[..])
				.unwrap(),
			(0xdeadbeef1badbeef, 0x1bad1dea, None)
		);
		assert_eq!(
			tlv_reader(
				&::hex::decode(concat!("0208deadbeef1badbeef", "03041bad1dea", "040401020304"))
					.unwrap()[..]
			)
			.unwrap(),
			(0xdeadbeef1badbeef, 0x1bad1dea, Some(0x01020304))
		);
	}

	#[test]
	fn tlv_write_matches_read() {
		let mut stream = VecWriter(Vec::new());
		let a: u64 = 0xdeadbeef1badbeef;
		let b: u32 = 0x1bad1dea;
		let c: Option<u32> = Some(0x01020304);
		(|| -> Result<(), std::io::Error> {
			encode_tlv_stream!(&mut stream, { (2, a, required), (3, b, required), (4, c, option) });
			Ok(())
		})()
		.unwrap();
		assert_eq!(tlv_reader(&stream.0[..]).unwrap(), (a, b, c));
	}
}
