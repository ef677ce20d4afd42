// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Compute kernel executed by the server for every request.

use crate::error::RingError;

/// Base used by the offload server: every request computes `2^x mod p`.
pub const OFFLOAD_BASE: u64 = 2;

/// `base^exponent mod modulus` by square-and-multiply.
///
/// Intermediates are `u128`, so the product of two residues below `2^64`
/// never overflows. The result is always in `0..modulus`.
///
/// # Errors
/// `InvalidArgument` when `modulus` is zero.
pub fn mod_pow(base: u64, mut exponent: u64, modulus: u64) -> Result<u64, RingError> {
    if modulus == 0 {
        return Err(RingError::InvalidArgument {
            reason: "modulus must be greater than 0".to_string(),
        });
    }

    let modulus = u128::from(modulus);
    let mut base = u128::from(base) % modulus;
    let mut result = 1 % modulus;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }

    Ok(result as u64)
}
