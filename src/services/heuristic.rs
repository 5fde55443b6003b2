//! Heuristic receipt extraction over raw OCR output.
//!
//! Four independent extractors (merchant, amount, date, tax) each produce a
//! `(value, confidence)` pair; the aggregate confidence is a fixed weighted
//! sum. The regex cascades are ordered pattern tables tried in sequence —
//! the precedence is observable behavior on ambiguous inputs, so the order
//! here is load-bearing.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::receipt::{Category, ReceiptResult};
use crate::services::providers::{OcrBlock, OcrOutput};

/// Fraction of topmost blocks considered merchant candidates.
const MERCHANT_TOP_FRACTION: f64 = 0.3;
const MERCHANT_MIN_LEN: usize = 3;
const MERCHANT_MAX_LEN: usize = 50;

const AMOUNT_MIN: f64 = 0.01;
const AMOUNT_MAX: f64 = 10_000.0;
const TAX_MIN: f64 = 0.0;
const TAX_MAX: f64 = 1_000.0;

const AMOUNT_KEYWORDS: [&str; 6] = ["total", "amount", "sum", "balance", "grand", "subtotal"];
const TAX_KEYWORDS: [&str; 6] = ["sales tax", "tax", "vat", "gst", "hst", "pst"];
const HEADER_WORDS: [&str; 4] = ["receipt", "invoice", "bill", "order"];

static PURE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static PHONE_SHAPED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[\d\s().-]{7,}$").unwrap());
static ADDRESS_SHAPED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\d+\s+[a-z]").unwrap());
static BUSINESS_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(LLC|INC|CORP|LTD|CO|COMPANY|STORE|SHOP)\b").unwrap());

/// Currency cascade: dollar-prefixed first, then bare decimal, then bare
/// integer. Tried strictly in order.
static CURRENCY_CASCADE: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"\$\s*(\d+(?:\.\d{1,2})?)").unwrap(),
        Regex::new(r"(\d+\.\d{1,2})").unwrap(),
        Regex::new(r"(\d+)").unwrap(),
    ]
});

/// How the capture groups of a date pattern map onto year/month/day.
#[derive(Clone, Copy)]
enum DateLayout {
    MonthDayYear4,
    MonthDayYear2,
    DayMonthYear4,
    YearMonthDay,
}

/// Ordered date pattern table. `MM/DD/YYYY` outranks `MM/DD/YY`, which
/// outranks the European and ISO layouts.
static DATE_PATTERNS: Lazy<Vec<(Regex, DateLayout)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").unwrap(),
            DateLayout::MonthDayYear4,
        ),
        (
            Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{2})\b").unwrap(),
            DateLayout::MonthDayYear2,
        ),
        (
            Regex::new(r"(\d{1,2})[-.](\d{1,2})[-.](\d{4})").unwrap(),
            DateLayout::DayMonthYear4,
        ),
        (
            Regex::new(r"(\d{4})[-/](\d{1,2})[-/](\d{1,2})").unwrap(),
            DateLayout::YearMonthDay,
        ),
    ]
});

/// Build a `ReceiptResult` from OCR text and block geometry.
pub fn extract(ocr: &OcrOutput, processing_time_ms: u64) -> ReceiptResult {
    let (merchant, merchant_conf) = extract_merchant(&ocr.blocks);
    let (amount, amount_conf) = extract_amount(&ocr.text);
    let (date, date_conf) = extract_date(&ocr.text);
    let (tax_amount, tax_conf) = extract_tax(&ocr.text);

    let confidence = aggregate_confidence(merchant_conf, amount_conf, date_conf, tax_conf);

    tracing::debug!(
        merchant = %merchant,
        amount,
        %date,
        ?tax_amount,
        confidence,
        "Heuristic extraction complete"
    );

    ReceiptResult {
        merchant: Some(merchant),
        amount: Some(round2(amount)),
        tax_amount: tax_amount.map(round2),
        tax_type: None,
        tax_rate: None,
        date: Some(date),
        time: None,
        category: Category::Uncategorized,
        notes: None,
        confidence,
        processing_time_ms,
    }
}

/// Weighted sum over the four extractors, rounded to 2 decimals.
pub fn aggregate_confidence(merchant: f64, amount: f64, date: f64, tax: f64) -> f64 {
    round2(0.3 * merchant + 0.4 * amount + 0.2 * date + 0.1 * tax)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Merchant: best-scoring candidate among the topmost 30% of blocks.
pub fn extract_merchant(blocks: &[OcrBlock]) -> (String, f64) {
    if blocks.is_empty() {
        return ("Unknown Merchant".to_string(), 0.1);
    }

    let mut sorted: Vec<&OcrBlock> = blocks.iter().collect();
    sorted.sort_by(|a, b| a.top.partial_cmp(&b.top).unwrap_or(std::cmp::Ordering::Equal));

    let top_count = ((sorted.len() as f64 * MERCHANT_TOP_FRACTION).ceil() as usize).max(1);
    let total = sorted.len() as f64;

    let mut best: Option<(String, f64)> = None;
    for (index, block) in sorted.iter().take(top_count).enumerate() {
        let text = block.text.trim();
        if !is_merchant_candidate(text) {
            continue;
        }

        let mut score = 0.5;
        if BUSINESS_SUFFIX.is_match(text) {
            score += 0.3;
        }
        if text.chars().count() > 3 && text == text.to_uppercase() {
            score += 0.2;
        }
        // Earliness bonus: the first block on the receipt gets the full
        // 0.2, tapering linearly toward 0 further down.
        score += 0.2 * (1.0 - index as f64 / total);
        let score = score.min(1.0);

        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((text.to_string(), score));
        }
    }

    match best {
        Some(found) => found,
        // Nothing survived filtering: the topmost block is still the best
        // guess for a merchant line.
        None => (sorted[0].text.trim().to_string(), 0.3),
    }
}

fn is_merchant_candidate(text: &str) -> bool {
    let char_len = text.chars().count();
    if char_len < MERCHANT_MIN_LEN || char_len > MERCHANT_MAX_LEN {
        return false;
    }
    if PURE_DIGITS.is_match(text) {
        return false;
    }
    if PHONE_SHAPED.is_match(text) && text.chars().filter(char::is_ascii_digit).count() >= 7 {
        return false;
    }
    if ADDRESS_SHAPED.is_match(text) {
        return false;
    }
    if HEADER_WORDS.contains(&text.to_lowercase().as_str()) {
        return false;
    }
    true
}

/// First currency match within `[min, max]` in cascade order, or `None`.
fn cascade_first(text: &str, min: f64, max: f64) -> Option<f64> {
    for pattern in CURRENCY_CASCADE.iter() {
        for capture in pattern.captures_iter(text) {
            if let Ok(value) = capture[1].parse::<f64>() {
                if (min..=max).contains(&value) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Amount: keyword-anchored line search first, whole-text maximum second.
pub fn extract_amount(text: &str) -> (f64, f64) {
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if !AMOUNT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            continue;
        }
        // Totals are often printed on the line after the keyword.
        let next = lines.get(i + 1).copied().unwrap_or("");
        let window = format!("{line} {next}");
        if let Some(value) = cascade_first(&window, AMOUNT_MIN, AMOUNT_MAX) {
            return (value, 0.9);
        }
    }

    // No keyword anchor: the largest in-range value anywhere in the text.
    for pattern in CURRENCY_CASCADE.iter() {
        let candidates: Vec<f64> = pattern
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<f64>().ok())
            .filter(|v| (AMOUNT_MIN..=AMOUNT_MAX).contains(v))
            .collect();
        if let Some(max) = candidates.into_iter().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }) {
            return (max, 0.5);
        }
    }

    (0.01, 0.1)
}

fn normalize_date(layout: DateLayout, captures: &regex::Captures<'_>) -> Option<String> {
    let (year, month, day) = match layout {
        DateLayout::MonthDayYear4 => (
            captures[3].parse::<u32>().ok()?,
            captures[1].parse::<u32>().ok()?,
            captures[2].parse::<u32>().ok()?,
        ),
        DateLayout::MonthDayYear2 => {
            let short = captures[3].parse::<u32>().ok()?;
            let year = if short < 50 { 2000 + short } else { 1900 + short };
            (
                year,
                captures[1].parse::<u32>().ok()?,
                captures[2].parse::<u32>().ok()?,
            )
        }
        DateLayout::DayMonthYear4 => (
            captures[3].parse::<u32>().ok()?,
            captures[2].parse::<u32>().ok()?,
            captures[1].parse::<u32>().ok()?,
        ),
        DateLayout::YearMonthDay => (
            captures[1].parse::<u32>().ok()?,
            captures[2].parse::<u32>().ok()?,
            captures[3].parse::<u32>().ok()?,
        ),
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}"))
}

fn first_date_in(text: &str) -> Option<String> {
    for (pattern, layout) in DATE_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            if let Some(date) = normalize_date(*layout, &captures) {
                return Some(date);
            }
        }
    }
    None
}

/// Date: keyword-anchored line search, whole-text scan, today fallback.
pub fn extract_date(text: &str) -> (String, f64) {
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if !lower.contains("date") && !lower.contains("time") {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        let window = format!("{line} {next}");
        if let Some(date) = first_date_in(&window) {
            return (date, 0.8);
        }
    }

    if let Some(date) = first_date_in(text) {
        return (date, 0.5);
    }

    (
        Local::now().date_naive().format("%Y-%m-%d").to_string(),
        0.3,
    )
}

/// Tax: first in-range currency match on a tax-keyword line. Zero is a
/// legitimate printed tax; a receipt without any tax line is a confident
/// "no tax", not a miss.
pub fn extract_tax(text: &str) -> (Option<f64>, f64) {
    for line in text.lines() {
        let lower = line.to_lowercase();
        if !TAX_KEYWORDS.iter().any(|k| lower.contains(k)) {
            continue;
        }
        if let Some(value) = cascade_first(line, TAX_MIN, TAX_MAX) {
            return (Some(value), 0.7);
        }
    }
    (None, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(texts: &[&str]) -> Vec<OcrBlock> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| OcrBlock {
                text: t.to_string(),
                top: i as f32 * 10.0,
            })
            .collect()
    }

    #[test]
    fn test_amount_keyword_anchored() {
        let (value, conf) = extract_amount("STORE\nTOTAL $50.00\nThank you");
        assert_eq!(value, 50.0);
        assert_eq!(conf, 0.9);
    }

    #[test]
    fn test_amount_keyword_value_on_next_line() {
        let (value, conf) = extract_amount("GRAND TOTAL\n$123.45");
        assert_eq!(value, 123.45);
        assert_eq!(conf, 0.9);
    }

    #[test]
    fn test_amount_whole_text_maximum() {
        let text = "Item 1: $10.00\nItem 2: $25.50\nItem 3: $65.75";
        let (value, conf) = extract_amount(text);
        assert_eq!(value, 65.75);
        assert_eq!(conf, 0.5);
    }

    #[test]
    fn test_amount_nothing_found() {
        let (value, conf) = extract_amount("thank you for visiting");
        assert_eq!(value, 0.01);
        assert_eq!(conf, 0.1);
    }

    #[test]
    fn test_amount_out_of_range_skipped() {
        // 99999.99 exceeds the plausible ceiling, the bare total is used.
        let (value, conf) = extract_amount("TOTAL $99999.99\nsub 12.00");
        assert_eq!(value, 12.0);
        assert_eq!(conf, 0.9);
    }

    #[test]
    fn test_merchant_prefers_business_suffix() {
        let b = blocks(&[
            "ACME STORE LLC",
            "123 Main Street",
            "555-123-4567",
            "item a",
            "item b",
            "item c",
            "item d",
            "item e",
            "item f",
            "TOTAL 4.00",
        ]);
        let (merchant, conf) = extract_merchant(&b);
        assert_eq!(merchant, "ACME STORE LLC");
        // 0.5 base + 0.3 suffix + 0.2 all-caps + 0.2 earliest, capped at 1.0
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn test_merchant_filters_header_and_phone() {
        let b = blocks(&["Receipt", "555-123-4567", "Corner Bakery", "x", "y", "z", "w", "v", "u", "t"]);
        let (merchant, _) = extract_merchant(&b);
        assert_eq!(merchant, "Corner Bakery");
    }

    #[test]
    fn test_merchant_fallback_to_first_block() {
        let b = blocks(&["42", "abc street continues here but is way way way too long for a name"]);
        let (merchant, conf) = extract_merchant(&b);
        assert_eq!(merchant, "42");
        assert_eq!(conf, 0.3);
    }

    #[test]
    fn test_merchant_length_counts_chars_not_bytes() {
        // 46 chars but 52 bytes; must still fit under the 50-char cap.
        let name = "PÂTISSERIE CRÈME BRÛLÉE ÉLÉGANCE GOURMANDE SAS";
        assert!(name.chars().count() <= 50 && name.len() > 50);

        let b = blocks(&[name]);
        let (merchant, conf) = extract_merchant(&b);
        assert_eq!(merchant, name);
        // Scored as a candidate, not the 0.3 first-block fallback.
        assert!(conf > 0.3);
    }

    #[test]
    fn test_merchant_no_blocks() {
        let (merchant, conf) = extract_merchant(&[]);
        assert_eq!(merchant, "Unknown Merchant");
        assert_eq!(conf, 0.1);
    }

    #[test]
    fn test_date_keyword_anchored_us_format() {
        let (date, conf) = extract_date("Date: 03/15/2024\nTOTAL 4.00");
        assert_eq!(date, "2024-03-15");
        assert_eq!(conf, 0.8);
    }

    #[test]
    fn test_date_two_digit_year_windows() {
        let (date, _) = extract_date("Date 12/31/24");
        assert_eq!(date, "2024-12-31");
        let (date, _) = extract_date("Date 12/31/99");
        assert_eq!(date, "1999-12-31");
    }

    #[test]
    fn test_date_european_format() {
        let (date, conf) = extract_date("some header\n15.03.2024 line");
        assert_eq!(date, "2024-03-15");
        assert_eq!(conf, 0.5);
    }

    #[test]
    fn test_date_iso_format_whole_text() {
        let (date, conf) = extract_date("printed 2024/03/15");
        assert_eq!(date, "2024-03-15");
        assert_eq!(conf, 0.5);
    }

    #[test]
    fn test_date_rejects_impossible_month() {
        // 13/40/2024 fails validation; falls through to today.
        let (date, conf) = extract_date("Date: 13/40/2024");
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(date, today);
        assert_eq!(conf, 0.3);
    }

    #[test]
    fn test_tax_line_match() {
        let (tax, conf) = extract_tax("Subtotal 40.00\nSales Tax $3.20\nTotal 43.20");
        assert_eq!(tax, Some(3.2));
        assert_eq!(conf, 0.7);
    }

    #[test]
    fn test_zero_tax_line_is_reported() {
        let (tax, conf) = extract_tax("Subtotal 12.00\nTAX $0.00\nTOTAL $12.00");
        assert_eq!(tax, Some(0.0));
        assert_eq!(conf, 0.7);

        let (tax, conf) = extract_tax("TAX 0");
        assert_eq!(tax, Some(0.0));
        assert_eq!(conf, 0.7);
    }

    #[test]
    fn test_no_tax_is_confident() {
        let (tax, conf) = extract_tax("TOTAL $50.00\nThank you");
        assert_eq!(tax, None);
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn test_aggregate_confidence_weighting() {
        assert_eq!(aggregate_confidence(1.0, 1.0, 1.0, 1.0), 1.0);
        assert_eq!(aggregate_confidence(0.5, 0.9, 0.8, 1.0), 0.77);
    }

    #[test]
    fn test_full_extraction() {
        let ocr = OcrOutput {
            text: "CORNER DELI\nDate: 03/15/2024\nSandwich 8.50\nTax $0.75\nTOTAL $9.25".to_string(),
            blocks: blocks(&[
                "CORNER DELI",
                "Date: 03/15/2024",
                "Sandwich 8.50",
                "Tax $0.75",
                "TOTAL $9.25",
            ]),
        };
        let result = extract(&ocr, 350);
        assert_eq!(result.merchant.as_deref(), Some("CORNER DELI"));
        assert_eq!(result.amount, Some(9.25));
        assert_eq!(result.tax_amount, Some(0.75));
        assert_eq!(result.date.as_deref(), Some("2024-03-15"));
        assert_eq!(result.category, Category::Uncategorized);
        assert_eq!(result.processing_time_ms, 350);
    }
}
