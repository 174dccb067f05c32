//! Reed-Solomon forward error correction over fixed-size shards.
//!
//! Implements the single-block encode contract described by the wire protocol: a
//! fixed number of data shards plus a percentage of parity shards, encoded with
//! `reed_solomon_erasure::{galois_8, ReedSolomon}`.

use reed_solomon_erasure::{galois_8, ReedSolomon};

/// Hard limit on data+parity shards imposed by GF(256) Reed-Solomon.
pub const DATA_SHARDS_MAX: usize = 255;

#[derive(Debug)]
pub enum FecError {
	/// `data_shards + parity_shards` would exceed [`DATA_SHARDS_MAX`]; caller drops the frame.
	TooManyShards { data_shards: usize, parity_shards: usize },
	Encode(reed_solomon_erasure::Error),
}

impl std::fmt::Display for FecError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::TooManyShards { data_shards, parity_shards } => write!(
				f,
				"too many shards: {data_shards} data + {parity_shards} parity exceeds the {DATA_SHARDS_MAX} shard limit",
			),
			Self::Encode(e) => write!(f, "reed-solomon encode failed: {e}"),
		}
	}
}

impl std::error::Error for FecError {}

/// A contiguous buffer of `(data_shards + parity_shards)` fixed-size shards.
pub struct Shards {
	pub data_shards: usize,
	pub parity_shards: usize,
	pub blocksize: usize,
	buffer: Vec<u8>,
}

impl Shards {
	pub fn total_shards(&self) -> usize {
		self.data_shards + self.parity_shards
	}

	pub fn shard(&self, index: usize) -> &[u8] {
		&self.buffer[index * self.blocksize..(index + 1) * self.blocksize]
	}

	pub fn shard_mut(&mut self, index: usize) -> &mut [u8] {
		let blocksize = self.blocksize;
		&mut self.buffer[index * blocksize..(index + 1) * blocksize]
	}
}

/// Encodes `payload` as a systematic Reed-Solomon block of fixed-size shards.
///
/// Deterministic and side-effect free; allocates exactly one contiguous buffer.
pub fn encode(payload: &[u8], blocksize: usize, fec_percentage: u8) -> Result<Shards, FecError> {
	assert!(blocksize > 0, "blocksize must be nonzero");

	let data_shards = payload.len().div_ceil(blocksize).max(1);
	let parity_shards = (data_shards * fec_percentage as usize).div_ceil(100);
	let nr_shards = data_shards + parity_shards;

	if nr_shards > DATA_SHARDS_MAX {
		return Err(FecError::TooManyShards { data_shards, parity_shards });
	}

	let mut buffer = vec![0u8; nr_shards * blocksize];
	buffer[..payload.len()].copy_from_slice(payload);

	if parity_shards > 0 {
		let encoder = ReedSolomon::<galois_8::Field>::new(data_shards, parity_shards)
			.map_err(FecError::Encode)?;
		let mut shards: Vec<&mut [u8]> = buffer.chunks_mut(blocksize).collect();
		encoder.encode(&mut shards).map_err(FecError::Encode)?;
	}

	Ok(Shards { data_shards, parity_shards, blocksize, buffer })
}
