//! Text, ISBN and year canonicalization.

use std::collections::BTreeMap;

use crate::{NormalizedRecord, RawRow, OPTIONAL_COLUMNS};

pub const YEAR_MIN: i32 = 1500;
pub const YEAR_MAX: i32 = 2035;

/// Trim and collapse internal whitespace, keeping casing.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-collapsed text, or `None` when nothing is left.
pub fn non_empty_text(input: &str) -> Option<String> {
    let collapsed = collapse_whitespace(input);
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Comparison form: whitespace-collapsed and lower-cased.
pub fn canonical_text(input: &str) -> String {
    collapse_whitespace(input).to_lowercase()
}

/// Strip everything but digits and `X`, then check length and check digit.
/// Invalid input is treated as absent.
pub fn normalize_isbn(input: &str) -> Option<String> {
    let isbn = input
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, 'x' | 'X'))
        .map(|c| c.to_ascii_uppercase())
        .collect::<String>();

    let valid = match isbn.len() {
        10 => is_valid_isbn10(&isbn),
        13 => is_valid_isbn13(&isbn),
        _ => false,
    };
    valid.then_some(isbn)
}

/// Weighted sum (10..=1) mod 11; `X` stands for 10 and only as the check digit.
pub fn is_valid_isbn10(isbn: &str) -> bool {
    let bytes = isbn.as_bytes();
    if bytes.len() != 10 {
        return false;
    }
    let mut sum = 0u32;
    for (i, b) in bytes.iter().enumerate() {
        let digit = match b {
            b'0'..=b'9' => u32::from(b - b'0'),
            b'X' if i == 9 => 10,
            _ => return false,
        };
        sum += digit * (10 - i as u32);
    }
    sum % 11 == 0
}

/// Alternating 1/3 weights mod 10.
pub fn is_valid_isbn13(isbn: &str) -> bool {
    let bytes = isbn.as_bytes();
    if bytes.len() != 13 || !bytes.iter().all(u8::is_ascii_digit) {
        return false;
    }
    let sum: u32 = bytes
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let digit = u32::from(b - b'0');
            if i % 2 == 0 {
                digit
            } else {
                digit * 3
            }
        })
        .sum();
    sum % 10 == 0
}

/// Parse a year, nulling anything outside [`YEAR_MIN`, `YEAR_MAX`].
/// Float exports of whole numbers (`"1998.0"`) are accepted.
pub fn normalize_year(input: &str) -> Option<i32> {
    let trimmed = input.trim();
    let year = match trimmed.parse::<i32>() {
        Ok(year) => year,
        Err(_) => {
            let value = trimmed.parse::<f64>().ok()?;
            if !value.is_finite() || value.fract() != 0.0 {
                return None;
            }
            value as i32
        }
    };
    (YEAR_MIN..=YEAR_MAX).contains(&year).then_some(year)
}

/// Build a [`NormalizedRecord`] from a raw row. Rows without a title yield `None`.
pub fn normalize_row(row: &RawRow) -> Option<NormalizedRecord> {
    let display_title = collapse_whitespace(row.get("title")?);
    if display_title.is_empty() {
        return None;
    }
    let display_author = row
        .get("author")
        .or_else(|| row.get("author_editor"))
        .map(collapse_whitespace)
        .unwrap_or_default();

    let raw_fields = OPTIONAL_COLUMNS
        .iter()
        .filter_map(|column| {
            row.get(column)
                .map(|value| (column.to_string(), collapse_whitespace(value)))
        })
        .collect::<BTreeMap<_, _>>();

    Some(NormalizedRecord {
        title: display_title.to_lowercase(),
        author: display_author.to_lowercase(),
        display_title,
        display_author,
        isbn: row.get("isbn").and_then(normalize_isbn),
        year: row.get("year").and_then(normalize_year),
        raw_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isbn10_check_digit() {
        assert_eq!(normalize_isbn("0306406152").as_deref(), Some("0306406152"));
        assert_eq!(normalize_isbn("0306406153"), None);
        assert_eq!(normalize_isbn("0-306-40615-2").as_deref(), Some("0306406152"));
        assert_eq!(normalize_isbn("080442957x").as_deref(), Some("080442957X"));
    }

    #[test]
    fn isbn13_check_digit() {
        assert_eq!(
            normalize_isbn("9780306406157").as_deref(),
            Some("9780306406157")
        );
        assert_eq!(normalize_isbn("9780306406158"), None);
        assert_eq!(
            normalize_isbn("ISBN 978-0-306-40615-7").as_deref(),
            Some("9780306406157")
        );
    }

    #[test]
    fn isbn_rejects_wrong_lengths_and_misplaced_x() {
        assert_eq!(normalize_isbn(""), None);
        assert_eq!(normalize_isbn("nan"), None);
        assert_eq!(normalize_isbn("12345"), None);
        assert_eq!(normalize_isbn("X306406152"), None);
        assert_eq!(normalize_isbn("978030640615X"), None);
    }

    #[test]
    fn year_policy_nulls_out_of_range() {
        assert_eq!(normalize_year("1600"), Some(1600));
        assert_eq!(normalize_year("1400"), None);
        assert_eq!(normalize_year("2100"), None);
        assert_eq!(normalize_year("1500"), Some(1500));
        assert_eq!(normalize_year("2035"), Some(2035));
        assert_eq!(normalize_year("1998.0"), Some(1998));
        assert_eq!(normalize_year("1998.5"), None);
        assert_eq!(normalize_year("circa 1900"), None);
    }

    #[test]
    fn text_is_trimmed_collapsed_and_lowercased() {
        assert_eq!(canonical_text("  The\tRust \n Book "), "the rust book");
        assert_eq!(collapse_whitespace("  The\tRust \n Book "), "The Rust Book");
        assert_eq!(non_empty_text(" a \n b ").as_deref(), Some("a b"));
        assert_eq!(non_empty_text(" \t\n "), None);
    }

    #[test]
    fn row_normalization_keeps_display_casing() {
        let row = RawRow::new()
            .with("title", "  Foo   Bar ")
            .with("author_editor", "BAZ  Qux")
            .with("isbn", "not an isbn")
            .with("year", "2100")
            .with("pages", " 320 ")
            .with("subjects", "");
        let record = normalize_row(&row).expect("record");

        assert_eq!(record.title, "foo bar");
        assert_eq!(record.display_title, "Foo Bar");
        assert_eq!(record.author, "baz qux");
        assert_eq!(record.display_author, "BAZ Qux");
        assert_eq!(record.isbn, None);
        assert_eq!(record.year, None);
        assert_eq!(record.raw("pages"), Some("320"));
        assert_eq!(record.raw("subjects"), None);
    }

    #[test]
    fn row_without_title_is_dropped() {
        assert!(normalize_row(&RawRow::new().with("author", "Someone")).is_none());
        assert!(normalize_row(&RawRow::new().with("title", "   ")).is_none());
    }
}
