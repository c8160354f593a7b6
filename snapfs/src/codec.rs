use std::io::{Error, ErrorKind, Result};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// On-disk and wire encoding: fixed-width little-endian integers.
const CONFIG: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

pub fn decode<T: Decode<()>>(buf: &[u8]) -> Result<T> {
	bincode::decode_from_slice(buf, CONFIG)
		.map(|(v, _)| v)
		.map_err(|e| Error::new(ErrorKind::InvalidInput, format!("failed to decode: {e}")))
}

pub fn encode<T: Encode>(val: &T, buf: &mut [u8]) -> Result<usize> {
	bincode::encode_into_slice(val, buf, CONFIG)
		.map_err(|e| Error::new(ErrorKind::InvalidInput, format!("failed to encode: {e}")))
}
