//! Binary wire format of PostgreSQL `numeric`.
//!
//! A value is a header of four big-endian 16-bit words (digit count, weight,
//! sign, display scale) followed by base-10000 digits. `weight` is the
//! power of 10000 of the first digit.

use std::fmt::Write as _;

use crate::session::DbError;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

fn header(out: &mut Vec<u8>, ndigits: i16, weight: i16, sign: u16, dscale: i16) {
    out.extend_from_slice(&ndigits.to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
}

fn group(chunk: &[u8]) -> i16 {
    chunk
        .iter()
        .fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0'))
}

/// Encodes decimal text (`-12.340`, `NaN`) as a binary `numeric`.
pub(crate) fn encode_numeric(text: &str) -> Result<Vec<u8>, DbError> {
    let s = text.trim();
    let mut out = Vec::with_capacity(16);
    if s.eq_ignore_ascii_case("nan") {
        header(&mut out, 0, 0, NUMERIC_NAN, 0);
        return Ok(out);
    }

    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let digits_only = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty())
        || !digits_only(int_part)
        || !digits_only(frac_part)
    {
        return Err(DbError::conversion("numeric", text));
    }
    let dscale = i16::try_from(frac_part.len()).map_err(|_| DbError::conversion("numeric", text))?;

    let int_part = int_part.trim_start_matches('0');
    let int_digits = format!("{}{int_part}", "0".repeat((4 - int_part.len() % 4) % 4));
    let frac_digits = format!("{frac_part}{}", "0".repeat((4 - frac_part.len() % 4) % 4));

    let mut digits: Vec<i16> = int_digits.as_bytes().chunks(4).map(group).collect();
    let int_groups = digits.len();
    digits.extend(frac_digits.as_bytes().chunks(4).map(group));

    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    while digits.last() == Some(&0) {
        digits.pop();
    }

    let weight = if digits.is_empty() {
        0
    } else {
        i16::try_from(int_groups as i64 - 1 - leading as i64)
            .map_err(|_| DbError::conversion("numeric", text))?
    };
    let ndigits = i16::try_from(digits.len()).map_err(|_| DbError::conversion("numeric", text))?;
    let sign = if negative && !digits.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    header(&mut out, ndigits, weight, sign, dscale);
    for d in digits {
        out.extend_from_slice(&d.to_be_bytes());
    }
    Ok(out)
}

fn word(bytes: &[u8], at: usize) -> Result<[u8; 2], DbError> {
    bytes
        .get(at..at + 2)
        .and_then(|w| w.try_into().ok())
        .ok_or_else(|| DbError::conversion("numeric", format!("{} bytes", bytes.len())))
}

/// Decodes a binary `numeric` into decimal text with its display scale.
pub(crate) fn decode_numeric(bytes: &[u8]) -> Result<String, DbError> {
    let ndigits = i16::from_be_bytes(word(bytes, 0)?).max(0) as usize;
    let weight = i16::from_be_bytes(word(bytes, 2)?);
    let sign = u16::from_be_bytes(word(bytes, 4)?);
    let dscale = i16::from_be_bytes(word(bytes, 6)?).max(0) as usize;
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    let digits = (0..ndigits)
        .map(|i| word(bytes, 8 + i * 2).map(i16::from_be_bytes))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=i32::from(weight) {
            if i == 0 {
                let _ = write!(out, "{}", digit(i));
            } else {
                let _ = write!(out, "{:04}", digit(i));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = i32::from(weight) + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks(2)
            .map(|w| i16::from_be_bytes([w[0], w[1]]))
            .collect()
    }

    #[test]
    fn test_encode_layout() {
        // 12345.678 = 1 * 10000^1 + 2345 + 6780 * 10000^-1
        let encoded = encode_numeric("12345.678").unwrap();
        assert_eq!(words(&encoded), vec![3, 1, 0, 3, 1, 2345, 6780]);

        let encoded = encode_numeric("-0.0012").unwrap();
        assert_eq!(words(&encoded), vec![1, -1, 0x4000, 4, 12]);

        let encoded = encode_numeric("10000").unwrap();
        assert_eq!(words(&encoded), vec![1, 1, 0, 0, 1]);
    }

    #[test]
    fn test_zero_is_unsigned() {
        let encoded = encode_numeric("-0.00").unwrap();
        assert_eq!(words(&encoded), vec![0, 0, 0, 2]);
        assert_eq!(decode_numeric(&encoded).unwrap(), "0.00");
    }

    #[test]
    fn test_decode_keeps_scale() {
        for text in ["12345.678", "-0.0012", "10000", "0.5", "7", "-3.10"] {
            let encoded = encode_numeric(text).unwrap();
            assert_eq!(decode_numeric(&encoded).unwrap(), text);
        }
    }

    #[test]
    fn test_nan_and_invalid() {
        assert_eq!(decode_numeric(&encode_numeric("NaN").unwrap()).unwrap(), "NaN");
        assert!(encode_numeric("1e5").is_err());
        assert!(encode_numeric(".").is_err());
        assert!(encode_numeric("").is_err());
        assert!(decode_numeric(&[0, 1]).is_err());
    }
}
