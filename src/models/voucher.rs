use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of digits in a canonical voucher code.
pub const VOUCHER_CODE_LEN: usize = 16;

/// A canonical voucher code: exactly 16 ASCII digits, no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VoucherCode(String);

impl VoucherCode {
    /// Strip all whitespace from `raw` and accept it only if what remains is
    /// exactly 16 digits.
    pub fn parse(raw: &str) -> Option<Self> {
        let stripped: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if stripped.len() == VOUCHER_CODE_LEN && stripped.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(stripped))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VoucherCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VoucherCode {
    type Error = InvalidVoucherCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(InvalidVoucherCode(value))
    }
}

impl From<VoucherCode> for String {
    fn from(code: VoucherCode) -> Self {
        code.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a 16-digit voucher code: {0:?}")]
pub struct InvalidVoucherCode(pub String);
