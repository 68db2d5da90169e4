//! Arbitrary-precision token and ETH amounts.
//!
//! Amounts are persisted as decimal text; arithmetic happens on `U256`.

use alloy::primitives::U256;

use crate::AppError;

/// Parse a decimal amount string.
pub fn parse(value: &str) -> Result<U256, AppError> {
    U256::from_str_radix(value.trim(), 10)
        .map_err(|e| AppError::Decode(format!("invalid amount {value:?}: {e}")))
}

/// `a + b` on decimal strings, saturating at `U256::MAX`.
pub fn add(a: &str, b: &str) -> Result<String, AppError> {
    Ok(parse(a)?.saturating_add(parse(b)?).to_string())
}

/// `max(0, a - b)` on decimal strings.
pub fn sub_floor(a: &str, b: &str) -> Result<String, AppError> {
    Ok(parse(a)?.saturating_sub(parse(b)?).to_string())
}

/// Sum an iterator of decimal strings.
pub fn sum<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<String, AppError> {
    let mut total = U256::ZERO;
    for v in values {
        total = total.saturating_add(parse(v)?);
    }
    Ok(total.to_string())
}

pub fn is_zero(value: &str) -> bool {
    parse(value).map(|v| v.is_zero()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_beyond_u128() {
        let big = "340282366920938463463374607431768211456"; // 2^128
        assert_eq!(add(big, "1").unwrap(), "340282366920938463463374607431768211457");
        assert_eq!(sum([big, big]).unwrap(), "680564733841876926926749214863536422912");
    }

    #[test]
    fn subtraction_floors_at_zero() {
        assert_eq!(sub_floor("5", "7").unwrap(), "0");
        assert_eq!(sub_floor("7", "5").unwrap(), "2");
    }

    #[test]
    fn rejects_non_decimal() {
        assert!(parse("0x10").is_err());
        assert!(parse("-1").is_err());
        assert!(is_zero("0"));
        assert!(!is_zero("garbage"));
    }
}
