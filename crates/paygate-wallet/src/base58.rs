//! Base58 and Base58Check encoding (Bitcoin alphabet).

use sha2::{Digest, Sha256};

use crate::error::WalletError;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Encode bytes as base58. Each leading zero byte becomes a leading `1`.
pub fn encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|&&b| b == 0).count();

    // Little-endian base58 digits of the non-zero tail.
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 138 / 100 + 1);
    for &byte in &input[zeros..] {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('1').take(zeros));
    out.extend(digits.iter().rev().map(|&d| ALPHABET[d as usize] as char));
    out
}

/// Decode a base58 string. Rejects any character outside the alphabet.
pub fn decode(input: &str) -> Result<Vec<u8>, WalletError> {
    let zeros = input.chars().take_while(|&c| c == '1').count();

    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for (position, character) in input.chars().enumerate().skip(zeros) {
        let value = ALPHABET
            .iter()
            .position(|&a| a as char == character)
            .ok_or(WalletError::InvalidBase58 {
                character,
                position,
            })?;

        let mut carry = value as u32;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

/// First four bytes of SHA256(SHA256(payload)).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Base58Check: `payload || checksum(payload)`, base58 encoded.
pub fn check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum(payload));
    encode(&data)
}

/// Decode Base58Check and verify the trailing checksum. Returns the payload.
pub fn check_decode(input: &str) -> Result<Vec<u8>, WalletError> {
    let mut data = decode(input)?;
    if data.len() < 4 {
        return Err(WalletError::ChecksumMismatch);
    }
    let split = data.len() - 4;
    if checksum(&data[..split])[..] != data[split..] {
        return Err(WalletError::ChecksumMismatch);
    }
    data.truncate(split);
    Ok(data)
}
