//! EAN/UPC validation and normalization.
//!
//! A code is *accepted* when it is numeric, has a recognized length, and its
//! check digit verifies. Stage handlers only count accepted codes toward
//! success; everything decoded is still persisted with its flags.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Supported linear symbologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, sqlx::Type)]
#[sqlx(type_name = "barcode_symbology")]
pub enum BarcodeSymbology {
    #[serde(rename = "EAN-13")]
    #[strum(serialize = "EAN-13")]
    #[sqlx(rename = "EAN-13")]
    Ean13,
    #[serde(rename = "EAN-8")]
    #[strum(serialize = "EAN-8")]
    #[sqlx(rename = "EAN-8")]
    Ean8,
    #[serde(rename = "UPC-A")]
    #[strum(serialize = "UPC-A")]
    #[sqlx(rename = "UPC-A")]
    UpcA,
    #[serde(rename = "UPC-E")]
    #[strum(serialize = "UPC-E")]
    #[sqlx(rename = "UPC-E")]
    UpcE,
    #[serde(rename = "UNKNOWN")]
    #[strum(serialize = "UNKNOWN")]
    #[sqlx(rename = "UNKNOWN")]
    Unknown,
}

/// Validation outcome for one raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationFlags {
    pub numeric_only: bool,
    pub length_valid: bool,
    pub checksum_valid: bool,
}

impl ValidationFlags {
    /// The acceptance gate used by every stage handler.
    pub fn accepted(&self) -> bool {
        self.numeric_only && self.length_valid && self.checksum_valid
    }
}

/// Detect symbology from a numeric code's length.
pub fn detect_symbology(code: &str) -> BarcodeSymbology {
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return BarcodeSymbology::Unknown;
    }
    match code.len() {
        13 => BarcodeSymbology::Ean13,
        8 => BarcodeSymbology::Ean8,
        12 => BarcodeSymbology::UpcA,
        6 | 7 => BarcodeSymbology::UpcE,
        _ => BarcodeSymbology::Unknown,
    }
}

/// Modulo-10 check with weights 1,3,1,3,… taken from the rightmost (check)
/// digit leftward. Covers EAN-13, EAN-8 and UPC-A.
pub fn checksum(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let total: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                d
            } else {
                d * 3
            }
        })
        .sum();
    total % 10 == 0
}

/// Classify a raw decoded string.
pub fn classify(raw: &str) -> (BarcodeSymbology, ValidationFlags) {
    let numeric_only = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());
    let symbology = detect_symbology(raw);
    let length_valid = symbology != BarcodeSymbology::Unknown;

    // The 6/7-digit UPC-E form carries no printed check digit, so there is
    // nothing to verify; well-formed UPC-E passes.
    let checksum_valid = match symbology {
        BarcodeSymbology::Ean13 | BarcodeSymbology::Ean8 | BarcodeSymbology::UpcA => checksum(raw),
        BarcodeSymbology::UpcE => numeric_only,
        BarcodeSymbology::Unknown => false,
    };

    (
        symbology,
        ValidationFlags {
            numeric_only,
            length_valid,
            checksum_valid,
        },
    )
}

/// Expand a 6/7-digit UPC-E code to its 12-digit UPC-A form.
///
/// The 7-digit form carries a leading number-system digit (0 or 1); the
/// 6-digit form assumes number system 0. Returns `None` for malformed input.
pub fn expand_upce(code: &str) -> Option<String> {
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (number_system, core) = match code.len() {
        6 => ('0', code),
        7 => {
            let ns = code.as_bytes()[0] as char;
            if ns != '0' && ns != '1' {
                return None;
            }
            (ns, &code[1..])
        }
        _ => return None,
    };

    let d: Vec<char> = core.chars().collect();
    let (manufacturer, product) = match d[5] {
        '0' | '1' | '2' => (
            format!("{}{}{}00", d[0], d[1], d[5]),
            format!("00{}{}{}", d[2], d[3], d[4]),
        ),
        '3' => (
            format!("{}{}{}00", d[0], d[1], d[2]),
            format!("000{}{}", d[3], d[4]),
        ),
        '4' => (
            format!("{}{}{}{}0", d[0], d[1], d[2], d[3]),
            format!("0000{}", d[4]),
        ),
        _ => (
            format!("{}{}{}{}{}", d[0], d[1], d[2], d[3], d[4]),
            format!("0000{}", d[5]),
        ),
    };

    let body = format!("{number_system}{manufacturer}{product}");
    let total: u32 = body
        .bytes()
        .enumerate()
        .map(|(i, b)| {
            let v = u32::from(b - b'0');
            if i % 2 == 0 {
                v * 3
            } else {
                v
            }
        })
        .sum();
    let check = (10 - total % 10) % 10;
    Some(format!("{body}{check}"))
}

/// Normalize a code to its canonical form for deduplication.
///
/// UPC-A gains a leading zero (EAN-13 form); UPC-E expands to UPC-A first;
/// EAN-8 stays in its 8-digit form (it is not the same product space);
/// EAN-13 passes through. Unknown codes have no canonical form.
pub fn normalize(code: &str, symbology: BarcodeSymbology) -> Option<String> {
    match symbology {
        BarcodeSymbology::Ean13 => Some(code.to_string()),
        BarcodeSymbology::Ean8 => Some(code.to_string()),
        BarcodeSymbology::UpcA => Some(format!("0{code}")),
        BarcodeSymbology::UpcE => expand_upce(code).map(|upca| format!("0{upca}")),
        BarcodeSymbology::Unknown => None,
    }
}
