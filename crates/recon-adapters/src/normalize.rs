//! Pure normalizers for loosely formatted lookup values.
//!
//! None of these fail: unusable input degrades to an empty or fallback string.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(years?|months?|days?)").expect("duration pattern compiles")
});

static FULL_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})[/-](\d{1,2})[/-](\d{4}|\d{2})$").expect("date pattern compiles")
});

static MONTH_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})[/-](\d{4})$").expect("month-year pattern compiles"));

/// Capitalize the first letter of each space-separated token and lowercase the rest.
pub fn title_case(input: &str) -> String {
    input
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Convert "N years, N months, N days" (any subset, any case) into decimal years.
///
/// Months count as 1/12 year and days as 1/365. The sum is rounded to two
/// decimals and printed without trailing zeros. Text with no recognizable
/// component comes back trimmed and unparsed.
pub fn duration_to_years(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut matched = false;
    let mut years = 0.0f64;
    for caps in DURATION_PART.captures_iter(input) {
        let Ok(amount) = caps[1].parse::<f64>() else {
            continue;
        };
        matched = true;
        let unit = caps[2].to_ascii_lowercase();
        if unit.starts_with("year") {
            years += amount;
        } else if unit.starts_with("month") {
            years += amount / 12.0;
        } else {
            years += amount / 365.0;
        }
    }

    if !matched {
        return input.trim().to_string();
    }
    format_decimal((years * 100.0).round() / 100.0)
}

fn format_decimal(value: f64) -> String {
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Normalize `MM/DD/YYYY`, `MM/YYYY` or `MM/DD/YY` (`/` or `-`) into `YYYY-MM-DD`.
///
/// Two-digit years land in the 2000s and a missing day becomes the first of
/// the month. Anything else, including impossible calendar dates, yields "".
pub fn normalize_date(input: &str) -> String {
    let input = input.trim();
    let (month, day, year) = if let Some(caps) = FULL_DATE.captures(input) {
        let year = if caps[3].len() == 2 {
            format!("20{}", &caps[3])
        } else {
            caps[3].to_string()
        };
        (caps[1].to_string(), caps[2].to_string(), year)
    } else if let Some(caps) = MONTH_YEAR.captures(input) {
        (caps[1].to_string(), "01".to_string(), caps[2].to_string())
    } else {
        return String::new();
    };

    let parsed = (
        year.parse::<i32>(),
        month.parse::<u32>(),
        day.parse::<u32>(),
    );
    match parsed {
        (Ok(y), Ok(m), Ok(d)) => NaiveDate::from_ymd_opt(y, m, d)
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}
