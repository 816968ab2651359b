//! Exact comparison of Kubernetes resource quantities
//!
//! `k8s_openapi` keeps quantities as opaque strings. Capacity decisions need
//! ordering, so quantities are parsed into an integer byte count. Fractional
//! results round up, matching the API server's `Quantity.Value()`.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::Error;

/// Resource name for storage capacity in requests and capacity maps
pub const RESOURCE_STORAGE: &str = "storage";

/// Integer byte count parsed from a resource quantity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageSize(i128);

impl StorageSize {
    /// Zero bytes; the value of a missing quantity
    pub const ZERO: StorageSize = StorageSize(0);

    /// Wrap an exact byte count
    pub fn from_bytes(bytes: i128) -> Self {
        Self(bytes)
    }

    /// Byte count
    pub fn bytes(&self) -> i128 {
        self.0
    }

    /// Parse a quantity string such as `10Gi`, `500M`, `1.5Ti` or `1e9`
    pub fn parse(raw: &str) -> Result<Self, Error> {
        parse_bytes(raw).map(Self)
    }

    /// Parse a `k8s_openapi` quantity
    pub fn from_quantity(quantity: &Quantity) -> Result<Self, Error> {
        Self::parse(&quantity.0)
    }

    /// Render as a plain integer quantity (`"10737418240"`)
    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.0.to_string())
    }
}

impl fmt::Display for StorageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Look up the storage entry of a requests/capacity map
///
/// A missing map or entry is zero, like an unset quantity.
pub fn storage_size(resources: Option<&BTreeMap<String, Quantity>>) -> Result<StorageSize, Error> {
    match resources.and_then(|r| r.get(RESOURCE_STORAGE)) {
        Some(quantity) => StorageSize::from_quantity(quantity),
        None => Ok(StorageSize::ZERO),
    }
}

fn parse_bytes(raw: &str) -> Result<i128, Error> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::quantity(raw, "empty quantity"));
    }

    let (negative, unsigned) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(Error::quantity(raw, "missing numeric value"));
    }
    if fraction.contains('.') {
        return Err(Error::quantity(raw, "more than one decimal point"));
    }

    let digits = format!("{whole}{fraction}");
    let mantissa: i128 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| Error::quantity(raw, "numeric value out of range"))?
    };

    let (mut numerator, mut denominator) = suffix_ratio(raw, suffix)?;
    numerator = numerator
        .checked_mul(mantissa)
        .ok_or_else(|| Error::quantity(raw, "value out of range"))?;
    denominator = pow10(fraction.len() as u32)
        .and_then(|scale| denominator.checked_mul(scale))
        .ok_or_else(|| Error::quantity(raw, "too many fractional digits"))?;

    let bytes = ceil_div(numerator, denominator);
    Ok(if negative { -bytes } else { bytes })
}

/// Multiplier of a suffix as numerator/denominator
fn suffix_ratio(raw: &str, suffix: &str) -> Result<(i128, i128), Error> {
    let ratio = match suffix {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        s if s.len() > 1 && (s.starts_with('e') || s.starts_with('E')) => {
            let exponent: i32 = s[1..]
                .parse()
                .map_err(|_| Error::quantity(raw, format!("invalid exponent {s:?}")))?;
            let scale = pow10(exponent.unsigned_abs())
                .ok_or_else(|| Error::quantity(raw, "exponent out of range"))?;
            if exponent >= 0 {
                (scale, 1)
            } else {
                (1, scale)
            }
        }
        other => return Err(Error::quantity(raw, format!("unknown suffix {other:?}"))),
    };
    Ok(ratio)
}

fn pow10(exponent: u32) -> Option<i128> {
    10i128.checked_pow(exponent)
}

fn ceil_div(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    if numerator % denominator > 0 {
        quotient + 1
    } else {
        quotient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> i128 {
        StorageSize::parse(s).expect("valid quantity").bytes()
    }

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(bytes("10Gi"), 10 * 1024 * 1024 * 1024);
        assert_eq!(bytes("5Gi"), 5 * (1 << 30));
        assert_eq!(bytes("1Ki"), 1024);
        assert_eq!(bytes("500M"), 500_000_000);
        assert_eq!(bytes("2k"), 2_000);
        assert_eq!(bytes("1073741824"), 1 << 30);
    }

    #[test]
    fn fractions_round_up() {
        assert_eq!(bytes("1.5Gi"), 3 * (1 << 29));
        assert_eq!(bytes("0.5"), 1);
        assert_eq!(bytes("1500m"), 2);
        assert_eq!(bytes(".5Ki"), 512);
    }

    #[test]
    fn decimal_exponents() {
        assert_eq!(bytes("1e9"), 1_000_000_000);
        assert_eq!(bytes("12E3"), 12_000);
        assert_eq!(bytes("5e-1"), 1);
    }

    #[test]
    fn same_capacity_in_different_notations_compares_equal() {
        let a = StorageSize::parse("1Gi").unwrap();
        let b = StorageSize::parse("1073741824").unwrap();
        let c = StorageSize::parse("1024Mi").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(StorageSize::parse("1G").unwrap() < a);
    }

    #[test]
    fn invalid_quantities_are_rejected() {
        assert!(StorageSize::parse("").is_err());
        assert!(StorageSize::parse("Gi").is_err());
        assert!(StorageSize::parse("10Gb").is_err());
        assert!(StorageSize::parse("1.2.3").is_err());
        assert!(StorageSize::parse("1e").is_err());
    }

    #[test]
    fn missing_storage_entry_is_zero() {
        assert_eq!(storage_size(None).unwrap(), StorageSize::ZERO);

        let empty = BTreeMap::new();
        assert_eq!(storage_size(Some(&empty)).unwrap(), StorageSize::ZERO);

        let map = BTreeMap::from([(RESOURCE_STORAGE.to_string(), Quantity("2Gi".to_string()))]);
        assert_eq!(storage_size(Some(&map)).unwrap().bytes(), 2 * (1 << 30));
    }

    #[test]
    fn to_quantity_renders_plain_bytes() {
        let size = StorageSize::parse("1Ki").unwrap();
        assert_eq!(size.to_quantity(), Quantity("1024".to_string()));
        assert_eq!(size.to_string(), "1024");
    }
}
