//! Consent form validation
//!
//! - CPF (Brazilian tax ID) checksum validation
//! - Full-name format rule used by the consent portal

use std::sync::OnceLock;

use regex::Regex;

/// Number of digits in a CPF, check digits included
pub const CPF_LEN: usize = 11;

/// Strip everything that is not an ASCII digit.
///
/// `"111.444.777-35"` becomes `"11144477735"`.
pub fn clean_cpf(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Format a CPF as `000.000.000-00`. Returns `None` unless the input
/// holds exactly eleven digits once cleaned.
pub fn format_cpf(raw: &str) -> Option<String> {
    let digits = clean_cpf(raw);
    if digits.len() != CPF_LEN {
        return None;
    }
    Some(format!(
        "{}.{}.{}-{}",
        &digits[0..3],
        &digits[3..6],
        &digits[6..9],
        &digits[9..11]
    ))
}

/// Full CPF validation including both check digits.
///
/// Total over any input: never panics, only answers true or false.
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() != CPF_LEN {
        return false;
    }

    // 000.000.000-00, 111.111.111-11, ... pass the checksum but are not real
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    if check_digit(&digits[..9], 10) != digits[9] {
        return false;
    }

    check_digit(&digits[..10], 11) == digits[10]
}

/// Weighted mod-11 check digit; weights run from `first_weight` down to 2.
fn check_digit(digits: &[u32], first_weight: u32) -> u32 {
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| d * (first_weight - i as u32))
        .sum();

    let remainder = sum % 11;
    if remainder < 2 {
        0
    } else {
        11 - remainder
    }
}

fn full_name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| {
        Regex::new(r"^[\p{L}´]+[ \t\n\f\r][\p{L}´ \t\n\f\r]+$").expect("full name pattern is valid")
    })
}

/// At least two runs of letters separated by ASCII whitespace. The acute
/// accent (´) is accepted; digits, other punctuation and non-ASCII spaces
/// such as U+00A0 are not.
pub fn is_valid_full_name(name: &str) -> bool {
    full_name_regex().is_match(name)
}
