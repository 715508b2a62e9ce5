use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::voucher::VoucherCode;
use crate::services::ban_list::BanSnapshot;

/// Four groups of four digits, optionally separated by whitespace.
static VOUCHER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9]{4}\s*[0-9]{4}\s*[0-9]{4}\s*[0-9]{4}\b").expect("voucher pattern compiles")
});

/// Find canonical voucher codes in `text`.
///
/// Matches are whitespace-stripped, anything that is not exactly 16 digits is
/// dropped, duplicates keep their first position, and codes present in
/// `banned` are filtered out. Rejections are silent.
pub fn extract_voucher_codes(text: &str, banned: Option<&BanSnapshot>) -> Vec<VoucherCode> {
    let mut seen = HashSet::new();
    VOUCHER_PATTERN
        .find_iter(text)
        .filter_map(|m| VoucherCode::parse(m.as_str()))
        .filter(|code| banned.map_or(true, |b| !b.contains(code.as_str())))
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

/// Trimmed, non-empty lines of every text block, first occurrence wins.
pub fn unique_lines<'a, I>(blocks: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    blocks
        .into_iter()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

/// Line-wise extraction over already split lines, deduplicated across all of
/// them. Digit runs are never joined across line boundaries.
pub fn extract_from_lines<S: AsRef<str>>(lines: &[S], banned: Option<&BanSnapshot>) -> Vec<VoucherCode> {
    let mut seen = HashSet::new();
    lines
        .iter()
        .flat_map(|line| extract_voucher_codes(line.as_ref(), banned))
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ban_list::BanList;

    fn codes(found: &[VoucherCode]) -> Vec<&str> {
        found.iter().map(VoucherCode::as_str).collect()
    }

    #[test]
    fn test_spaced_code_in_sentence() {
        let found = extract_voucher_codes("Your code: 1234 5678 9012 3456 enjoy", None);
        assert_eq!(codes(&found), ["1234567890123456"]);
    }

    #[test]
    fn test_banned_code_is_dropped() {
        let banned = BanList::from_codes(["1234123412341234"]).snapshot();
        let found = extract_voucher_codes("PIN 1234 1234 1234 1234", Some(&banned));
        assert!(found.is_empty());

        let unfiltered = extract_voucher_codes("PIN 1234 1234 1234 1234", None);
        assert_eq!(codes(&unfiltered), ["1234123412341234"]);
    }

    #[test]
    fn test_duplicates_returned_once() {
        let text = "1111 2222 3333 4444 and again 1111 2222 3333 4444 then 1111222233334444";
        let found = extract_voucher_codes(text, None);
        assert_eq!(codes(&found), ["1111222233334444"]);
    }

    #[test]
    fn test_wrong_lengths_never_returned() {
        assert!(extract_voucher_codes("123412341234123", None).is_empty());
        assert!(extract_voucher_codes("1234 1234 1234 123", None).is_empty());
        assert!(extract_voucher_codes("12341234123412345", None).is_empty());
        assert!(extract_voucher_codes("1234 1234 1234 12345", None).is_empty());
    }

    #[test]
    fn test_multiple_spaces_between_groups() {
        let found = extract_voucher_codes("code 9876   5432\t1098  7654.", None);
        assert_eq!(codes(&found), ["9876543210987654"]);
    }

    #[test]
    fn test_order_is_first_seen() {
        let found = extract_voucher_codes("5555666677778888 1111222233334444 5555666677778888", None);
        assert_eq!(codes(&found), ["5555666677778888", "1111222233334444"]);
    }

    #[test]
    fn test_unique_lines_trims_and_dedupes() {
        let lines = unique_lines(["  hello \nworld\n\n", "hello\n  \nagain"]);
        assert_eq!(lines, ["hello", "world", "again"]);
    }

    #[test]
    fn test_extract_from_lines_does_not_join_lines() {
        let lines = ["1234 5678", "9012 3456", "4444 3333 2222 1111"];
        let found = extract_from_lines(&lines, None);
        assert_eq!(codes(&found), ["4444333322221111"]);
    }

    #[test]
    fn test_extract_from_lines_dedupes_across_lines() {
        let banned = BanList::from_codes(["1234123412341234"]).snapshot();
        let lines = [
            "1111 2222 3333 4444",
            "banned 1234 1234 1234 1234",
            "again 1111222233334444",
        ];
        let found = extract_from_lines(&lines, Some(&banned));
        assert_eq!(codes(&found), ["1111222233334444"]);
    }
}
