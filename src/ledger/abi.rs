//! Minimal EVM ABI helpers for the ERC-20 calls the adapter makes.
//!
//! Function selectors are computed from keccak256 of the canonical
//! signature rather than hard-coded. Only static words, dynamic strings,
//! and the legacy `bytes32` string encoding are handled.

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use sha3::{Digest, Keccak256};

/// `keccak256(signature)[..4]`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Full keccak256 of an event signature as a `0x`-prefixed topic.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// Parse a `0x` address into a left-padded 32-byte word.
pub fn address_word(addr: &str) -> Result<[u8; 32]> {
    let stripped = addr.trim().strip_prefix("0x").unwrap_or(addr.trim());
    let bytes = hex::decode(stripped).with_context(|| format!("Invalid address '{addr}'"))?;
    if bytes.len() != 20 {
        bail!("Address '{addr}' has wrong length: {} bytes", bytes.len());
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

/// Big-endian uint256 word holding a `u128`.
pub fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Build `0x`-hex calldata from a signature and pre-encoded static words.
pub fn encode_call(signature: &str, words: &[[u8; 32]]) -> String {
    let mut data = Vec::with_capacity(4 + words.len() * 32);
    data.extend_from_slice(&selector(signature));
    for word in words {
        data.extend_from_slice(word);
    }
    format!("0x{}", hex::encode(data))
}

fn decode_hex(data: &str) -> Result<Vec<u8>> {
    let stripped = data.trim().strip_prefix("0x").unwrap_or(data.trim());
    hex::decode(stripped).with_context(|| format!("Invalid hex return data: {data}"))
}

fn word_at(bytes: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * 32;
    bytes
        .get(start..start + 32)
        .ok_or_else(|| anyhow!("Return data too short: {} bytes, need word {index}", bytes.len()))
}

fn word_to_u128(word: &[u8]) -> Result<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        bail!("uint256 value exceeds u128");
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..32]);
    Ok(u128::from_be_bytes(buf))
}

/// Decode the first return word as an unsigned integer.
pub fn decode_uint(data: &str) -> Result<u128> {
    let bytes = decode_hex(data)?;
    word_to_u128(word_at(&bytes, 0)?)
}

pub fn decode_bool(data: &str) -> Result<bool> {
    Ok(decode_uint(data)? != 0)
}

/// Decode the first return word as an address.
pub fn decode_address(data: &str) -> Result<String> {
    let bytes = decode_hex(data)?;
    let word = word_at(&bytes, 0)?;
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

/// Decode a `string` return value, accepting the legacy `bytes32` form.
pub fn decode_string(data: &str) -> Result<String> {
    let bytes = decode_hex(data)?;
    if bytes.len() == 32 {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        return Ok(String::from_utf8_lossy(&bytes[..end]).trim().to_string());
    }
    let offset = word_to_u128(word_at(&bytes, 0)?)? as usize;
    let len_word = bytes
        .get(offset..offset + 32)
        .ok_or_else(|| anyhow!("String offset {offset} out of range"))?;
    let len = word_to_u128(len_word)? as usize;
    let body = bytes
        .get(offset + 32..offset + 32 + len)
        .ok_or_else(|| anyhow!("String length {len} out of range"))?;
    Ok(String::from_utf8_lossy(body).trim().to_string())
}

/// Parse a JSON-RPC quantity (`"0x1a"`).
pub fn parse_quantity(value: &str) -> Result<u128> {
    let stripped = value.trim().strip_prefix("0x").unwrap_or(value.trim());
    if stripped.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(stripped, 16).with_context(|| format!("Invalid quantity: {value}"))
}

pub fn to_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

/// Largest `Decimal` mantissa, 2^96 - 1.
const MAX_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

fn pow10(exp: u32) -> Result<u128> {
    10u128
        .checked_pow(exp)
        .ok_or_else(|| anyhow!("10^{exp} overflows u128"))
}

/// Raw integer units → human amount.
pub fn scale_down(raw: u128, decimals: u8) -> Result<Decimal> {
    let mut raw = raw;
    let mut scale = decimals as u32;
    // Decimal supports at most 28 fractional digits.
    if scale > 28 {
        raw /= pow10(scale - 28)?;
        scale = 28;
    }
    // Past the 96-bit mantissa, give up fractional digits until it fits.
    while raw > MAX_MANTISSA && scale > 0 {
        raw /= 10;
        scale -= 1;
    }
    if raw > MAX_MANTISSA {
        bail!("Balance {raw} exceeds the representable range");
    }
    let signed = i128::try_from(raw).context("Balance exceeds i128")?;
    let amount = Decimal::try_from_i128_with_scale(signed, scale)
        .map_err(|e| anyhow!("Balance {raw} not representable: {e}"))?;
    Ok(amount.normalize())
}

/// Human amount → raw integer units, truncating excess precision.
pub fn scale_up(amount: Decimal, decimals: u8) -> Result<u128> {
    if amount.is_sign_negative() {
        bail!("Negative amount: {amount}");
    }
    let mantissa = u128::try_from(amount.mantissa()).context("Negative mantissa")?;
    let scale = amount.scale();
    let decimals = decimals as u32;
    if decimals >= scale {
        mantissa
            .checked_mul(pow10(decimals - scale)?)
            .ok_or_else(|| anyhow!("Amount {amount} overflows raw units"))
    } else {
        Ok(mantissa / pow10(scale - decimals)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_known_selectors() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector("approve(address,uint256)"), [0x09, 0x5e, 0xa7, 0xb3]);
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_encode_transfer_call() {
        let to = address_word("0x00000000000000000000000000000000000000aa").unwrap();
        let data = encode_call("transfer(address,uint256)", &[to, uint_word(1)]);
        assert!(data.starts_with("0xa9059cbb"));
        assert_eq!(data.len(), 2 + 8 + 128);
        assert!(data.ends_with("01"));
    }

    #[test]
    fn test_address_word_rejects_bad_input() {
        assert!(address_word("0x1234").is_err());
        assert!(address_word("not-hex").is_err());
    }

    #[test]
    fn test_decode_uint_and_bool() {
        let one = format!("0x{}", hex::encode(uint_word(1)));
        assert_eq!(decode_uint(&one).unwrap(), 1);
        assert!(decode_bool(&one).unwrap());
        let zero = format!("0x{}", "0".repeat(64));
        assert!(!decode_bool(&zero).unwrap());
        assert!(decode_uint("0x").is_err());
    }

    #[test]
    fn test_decode_uint_overflow() {
        let big = format!("0x{}", "f".repeat(64));
        assert!(decode_uint(&big).is_err());
    }

    #[test]
    fn test_decode_address() {
        let word = address_word("0xAbCdEf0000000000000000000000000000001234").unwrap();
        let data = format!("0x{}", hex::encode(word));
        assert_eq!(
            decode_address(&data).unwrap(),
            "0xabcdef0000000000000000000000000000001234"
        );
    }

    #[test]
    fn test_decode_dynamic_string() {
        // offset 0x20, length 3, "TST" padded
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&uint_word(32));
        bytes.extend_from_slice(&uint_word(3));
        let mut body = [0u8; 32];
        body[..3].copy_from_slice(b"TST");
        bytes.extend_from_slice(&body);
        let data = format!("0x{}", hex::encode(bytes));
        assert_eq!(decode_string(&data).unwrap(), "TST");
    }

    #[test]
    fn test_decode_bytes32_string() {
        let mut word = [0u8; 32];
        word[..3].copy_from_slice(b"MKR");
        let data = format!("0x{}", hex::encode(word));
        assert_eq!(decode_string(&data).unwrap(), "MKR");
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(to_quantity(26), "0x1a");
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_scale_down() {
        assert_eq!(scale_down(1_500_000, 6).unwrap(), dec!(1.5));
        assert_eq!(scale_down(100 * 10u128.pow(18), 18).unwrap(), dec!(100));
        assert_eq!(scale_down(0, 18).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_scale_down_beyond_mantissa() {
        // 100 billion tokens at 18 decimals: 1e29 raw units
        let raw = 100_000_000_000 * 10u128.pow(18);
        let amount = scale_down(raw, 18).unwrap();
        assert_eq!(amount, dec!(100000000000));
        assert_eq!(scale_up(amount, 18).unwrap(), raw);

        // Only the lowest fractional digit is lost.
        let raw = 123_456_789_012_345_678_901_234_567_891u128;
        let amount = scale_down(raw, 18).unwrap();
        assert_eq!(amount, dec!(123456789012.34567890123456789));
        let back = scale_up(amount, 18).unwrap();
        assert!(back <= raw && raw - back < 10);
    }

    #[test]
    fn test_scale_down_integer_overflow() {
        assert!(scale_down(u128::MAX, 0).is_err());
    }

    #[test]
    fn test_scale_down_many_decimals() {
        // 30-decimal token: last two digits are dropped
        assert_eq!(scale_down(10u128.pow(30), 30).unwrap(), dec!(1));
    }

    #[test]
    fn test_scale_up() {
        assert_eq!(scale_up(dec!(1.5), 6).unwrap(), 1_500_000);
        assert_eq!(scale_up(dec!(100), 18).unwrap(), 100 * 10u128.pow(18));
        // Excess precision truncated
        assert_eq!(scale_up(dec!(1.2345678), 6).unwrap(), 1_234_567);
        assert!(scale_up(dec!(-1), 6).is_err());
    }
}
