// Copyright 2020 The Keel Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Consensus arithmetic for the proof-of-work chain: the compact difficulty
//! encoding, expected work per header and the difficulty retarget formula.
//! Everything operates on arbitrary-precision integers so the 256-bit
//! target space is exact.

use num_bigint::BigUint;

use crate::core::hash::Hash;

/// How far in the future a header timestamp may lie relative to our
/// adjusted clock, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// Number of ancestor timestamps the median-time-past rule looks at.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Factor the retarget formula clamps the observed timespan by, in both
/// directions.
pub const RETARGET_CLAMP: u32 = 4;

/// Expands the compact difficulty representation to the full 256-bit
/// target. Returns zero for negative or malformed encodings, which callers
/// must treat as invalid.
pub fn decode_compact(bits: u32) -> BigUint {
	let size = bits >> 24;
	let mantissa = bits & 0x007f_ffff;
	if bits & 0x0080_0000 != 0 {
		// sign bit set, a negative target is never valid
		return BigUint::from(0u32);
	}
	if size <= 3 {
		BigUint::from(mantissa >> (8 * (3 - size)))
	} else {
		BigUint::from(mantissa) << (8 * (size - 3)) as usize
	}
}

/// Compresses a 256-bit target back to the compact representation. Inverse
/// of `decode_compact` up to the mantissa precision loss.
pub fn encode_compact(target: &BigUint) -> u32 {
	if *target == BigUint::from(0u32) {
		return 0;
	}
	let mut size = ((target.bits() + 7) / 8) as u32;
	let mut compact = if size <= 3 {
		low_u32(target) << (8 * (3 - size))
	} else {
		low_u32(&(target.clone() >> (8 * (size - 3)) as usize))
	};
	// the mantissa's top bit doubles as a sign bit, shift it clear
	if compact & 0x0080_0000 != 0 {
		compact >>= 8;
		size += 1;
	}
	compact | (size << 24)
}

/// Expected number of hash trials represented by a header at the given
/// compact target: `2^256 / (target + 1)`. Zero for an invalid target.
pub fn work(bits: u32) -> BigUint {
	let target = decode_compact(bits);
	if target == BigUint::from(0u32) {
		return BigUint::from(0u32);
	}
	let numerator = BigUint::from(1u32) << 256;
	numerator / (target + BigUint::from(1u32))
}

/// A block hash reinterpreted as a 256-bit integer for target comparison.
pub fn hash_to_num(hash: &Hash) -> BigUint {
	BigUint::from_bytes_le(hash.to_slice())
}

/// Clamp an observed retarget timespan into the allowed window around the
/// expected one.
pub fn clamp_timespan(actual: u32, target_timespan: u32) -> u32 {
	let floor = target_timespan / RETARGET_CLAMP;
	let ceil = target_timespan * RETARGET_CLAMP;
	if actual < floor {
		floor
	} else if actual > ceil {
		ceil
	} else {
		actual
	}
}

/// The clamped-ratio difficulty adjustment: scales the previous target by
/// `actual / target_timespan`, never exceeding the network's proof-of-work
/// limit. `actual` must already be clamped.
pub fn retarget(prev_bits: u32, actual: u32, target_timespan: u32, pow_limit: &BigUint) -> u32 {
	let mut target = decode_compact(prev_bits);
	target = target * BigUint::from(actual);
	target = target / BigUint::from(target_timespan);
	if target > *pow_limit {
		target = pow_limit.clone();
	}
	encode_compact(&target)
}

// lowest 32 bits of a big integer, which must fit
fn low_u32(n: &BigUint) -> u32 {
	let bytes = n.to_bytes_le();
	let mut out: u32 = 0;
	for (i, b) in bytes.iter().take(4).enumerate() {
		out |= (*b as u32) << (8 * i);
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn compact_decode() {
		// the classic minimum-difficulty target
		assert_eq!(
			decode_compact(0x1d00ffff),
			BigUint::from(0xffffu32) << 208
		);
		// sign bit makes it invalid
		assert_eq!(decode_compact(0x1d80ffff), BigUint::from(0u32));
		// tiny sizes shift the mantissa down
		assert_eq!(decode_compact(0x01120000), BigUint::from(0x12u32));
	}

	#[test]
	fn compact_roundtrip() {
		for bits in &[0x1d00ffffu32, 0x1c7fff80, 0x207fffff, 0x1b0404cb] {
			assert_eq!(encode_compact(&decode_compact(*bits)), *bits);
		}
	}

	#[test]
	fn compact_sign_bit_normalization() {
		// 2^224 - 1 has 28 leading 0xff bytes; the top mantissa bit would
		// read as a sign, so the encoding bumps the exponent instead
		let limit = (BigUint::from(1u32) << 224) - BigUint::from(1u32);
		assert_eq!(encode_compact(&limit), 0x1d00ffff);
	}

	#[test]
	fn compact_encode_doubled() {
		let doubled = decode_compact(0x1d00ffff) * BigUint::from(2u32);
		assert_eq!(encode_compact(&doubled), 0x1d01fffe);
	}

	#[test]
	fn work_ordering() {
		// a 256 times smaller target means 256 times the expected trials
		let easy = work(0x1d00ffff);
		let hard = work(0x1c00ffff);
		assert!(hard > easy);
		assert_eq!(hard.clone() / easy, BigUint::from(256u32));
		assert_eq!(work(0x1d80ffff), BigUint::from(0u32));
	}

	#[test]
	fn timespan_clamping() {
		assert_eq!(clamp_timespan(100, 2400), 600);
		assert_eq!(clamp_timespan(2400, 2400), 2400);
		assert_eq!(clamp_timespan(100_000, 2400), 9600);
	}

	#[test]
	fn retarget_ratio() {
		let limit = BigUint::from(1u32) << 255;
		// a timespan exactly on target leaves the difficulty untouched
		assert_eq!(retarget(0x1d00ffff, 2400, 2400, &limit), 0x1d00ffff);
		// twice as slow halves the difficulty
		let halved = retarget(0x1d00ffff, 4800, 2400, &limit);
		assert_eq!(decode_compact(halved), BigUint::from(0x1fffeu32) << 208);
	}
}
