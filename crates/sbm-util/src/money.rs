//! Parsing and formatting of portal money strings.
//!
//! The portal renders amounts in AR locale, e.g. `"$ 20.115.680,0000"`:
//! `.` groups thousands, `,` separates decimals, and empty / `"null"` stand
//! in for "no value". Callers keep the original string for display and use
//! the parsed value for arithmetic and persistence.

/// Parse a portal money string into a float.
///
/// ```
/// use sbm_util::money_to_f64;
/// assert_eq!(money_to_f64("$ 20.115.680,0000"), Some(20_115_680.0));
/// assert_eq!(money_to_f64("20.015.101,6000"), Some(20_015_101.6));
/// assert_eq!(money_to_f64("null"), None);
/// assert_eq!(money_to_f64(""), None);
/// ```
pub fn money_to_f64(txt: &str) -> Option<f64> {
    let s = txt.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") {
        return None;
    }

    // Strip currency symbol and any other non-numeric noise.
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    // AR locale: "." thousands, "," decimals.
    let normalized = cleaned.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok()
}

/// Quantities come with thousands separators but no currency symbol
/// (e.g. `"293.700,00"`). Same locale rules as money.
pub fn parse_quantity(txt: &str) -> Option<f64> {
    money_to_f64(txt)
}

/// Format a value in the portal's style. Display-oriented; no attempt to
/// byte-match the portal's own renderer.
pub fn money_txt(value: f64, decimals: usize) -> String {
    let formatted = format!("{value:.decimals$}");
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part),
    };

    let mut grouped = String::new();
    let bytes = digits.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && (bytes.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*b as char);
    }

    match frac_part {
        Some(f) => format!("$ {sign}{grouped},{f}"),
        None => format!("$ {sign}{grouped}"),
    }
}
