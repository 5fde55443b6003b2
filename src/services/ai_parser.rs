use chrono::{Duration, Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::receipt::{Category, ReceiptResult, TaxType};

const MAX_MERCHANT_LEN: usize = 100;
const MAX_NOTES_LEN: usize = 500;

/// Amounts above this are almost certainly mis-read decimals; flagged, not
/// rejected.
const SUSPICIOUS_AMOUNT: f64 = 100_000.0;

/// Receipt fields as the AI reply carries them, before validation.
///
/// Monetary and confidence fields are kept as raw JSON values because the
/// models routinely return numbers as strings; coercion happens during
/// validation and sanitization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawReceiptFields {
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub tax_amount: Option<Value>,
    #[serde(default)]
    pub tax_type: Option<String>,
    #[serde(default)]
    pub tax_rate: Option<Value>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub confidence: Option<Value>,
}

/// Outcome of rule-based validation: hard errors fail the parse, soft
/// warnings are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The two failure modes callers branch on: nothing parseable in the reply
/// vs. parseable JSON with invalid required fields.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("AI response extraction failed: no JSON object found")]
    Extraction,

    #[error("invalid receipt data: {0}")]
    Validation(String),
}

/// Coerce a JSON number or numeric string to f64.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse::<f64>().ok(),
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Pull the receipt JSON out of a raw AI reply.
///
/// Strips markdown code fences, then takes the greedy first-`{`-to-last-`}`
/// span. Returns `None` when no object is present or the span is not valid
/// JSON.
pub fn extract_json(raw: &str) -> Option<RawReceiptFields> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

/// Apply the hard/soft rule list to extracted fields.
pub fn validate(fields: &RawReceiptFields) -> ValidationReport {
    let mut report = ValidationReport::default();

    // ── Merchant ─────────────────────────────────────────────────────
    match &fields.merchant {
        Some(m) if !m.trim().is_empty() => {
            if m.trim().len() > MAX_MERCHANT_LEN {
                report
                    .warnings
                    .push(format!("Merchant name is unusually long ({} chars)", m.trim().len()));
            }
        }
        _ => report.errors.push("Merchant name is required".to_string()),
    }

    // ── Amount ───────────────────────────────────────────────────────
    let amount = match &fields.amount {
        None => {
            report.errors.push("Amount is required".to_string());
            None
        }
        Some(v) => match as_number(v) {
            None => {
                report.errors.push("Amount must be a number".to_string());
                None
            }
            Some(a) if a <= 0.0 => {
                report.errors.push("Amount must be positive".to_string());
                None
            }
            Some(a) => {
                if a > SUSPICIOUS_AMOUNT {
                    report
                        .warnings
                        .push(format!("Amount {a:.2} is unusually large"));
                }
                Some(a)
            }
        },
    };

    // ── Tax ──────────────────────────────────────────────────────────
    if let Some(v) = &fields.tax_amount {
        if let Some(tax) = as_number(v) {
            if tax < 0.0 {
                report.errors.push("Tax amount cannot be negative".to_string());
            } else if let Some(a) = amount {
                if tax > a {
                    report
                        .errors
                        .push("Tax amount cannot exceed total amount".to_string());
                }
            }
        }
    }

    if let Some(v) = &fields.tax_rate {
        if let Some(rate) = as_number(v) {
            if !(0.0..=100.0).contains(&rate) {
                report
                    .errors
                    .push("Tax rate must be between 0 and 100".to_string());
            }
        }
    }

    // ── Date ─────────────────────────────────────────────────────────
    if let Some(date) = &fields.date {
        match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(parsed) => {
                // One day of slack for timezone skew between device and vendor.
                let tomorrow = Local::now().date_naive() + Duration::days(1);
                if parsed > tomorrow {
                    report
                        .errors
                        .push(format!("Date {date} is in the future"));
                }
            }
            Err(_) => report
                .errors
                .push(format!("Date {date} is not a valid YYYY-MM-DD date")),
        }
    }

    // ── Soft checks ──────────────────────────────────────────────────
    if let Some(v) = &fields.confidence {
        match as_number(v) {
            Some(c) if !(0.0..=1.0).contains(&c) => report
                .warnings
                .push(format!("Confidence {c} outside [0, 1]")),
            Some(c) if c < 0.5 => report
                .warnings
                .push(format!("Low extraction confidence: {c}")),
            _ => {}
        }
    }

    if let Some(category) = &fields.category {
        if Category::from_raw(category).is_none() {
            report
                .warnings
                .push(format!("Unknown category '{category}'"));
        }
    }

    if let Some(time) = &fields.time {
        if NaiveTime::parse_from_str(time, "%H:%M:%S").is_err() {
            report
                .warnings
                .push(format!("Time '{time}' is not HH:MM:SS"));
        }
    }

    report
}

/// Normalize already-valid fields into canonical storage form.
pub fn sanitize(fields: &RawReceiptFields) -> ReceiptResult {
    let merchant = fields.merchant.as_deref().map(|m| {
        let collapsed = m.split_whitespace().collect::<Vec<_>>().join(" ");
        truncate_chars(&collapsed, MAX_MERCHANT_LEN)
    });

    let amount = fields.amount.as_ref().and_then(as_number).map(round2);
    let tax_amount = fields.tax_amount.as_ref().and_then(as_number).map(round2);
    let tax_rate = fields.tax_rate.as_ref().and_then(as_number);
    let tax_type = fields.tax_type.as_deref().map(TaxType::from_raw);

    let date = match fields.date.as_deref() {
        None => Some(Local::now().date_naive().format("%Y-%m-%d").to_string()),
        Some(raw) => Some(reformat_date(raw)),
    };

    let time = fields.time.as_deref().map(reformat_time);

    let category = fields
        .category
        .as_deref()
        .and_then(Category::from_raw)
        .unwrap_or_default();

    let confidence = fields
        .confidence
        .as_ref()
        .and_then(as_number)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    let notes = fields
        .notes
        .as_deref()
        .map(|n| truncate_chars(n.trim(), MAX_NOTES_LEN));

    ReceiptResult {
        merchant,
        amount,
        tax_amount,
        tax_type,
        tax_rate,
        date,
        time,
        category,
        notes,
        confidence,
        processing_time_ms: 0,
    }
}

/// Reformat a date string to `YYYY-MM-DD`, leaving unparseable input as-is.
fn reformat_date(raw: &str) -> String {
    const FORMATS: [&str; 5] = ["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];
    for format in FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(raw.trim(), format) {
            return parsed.format("%Y-%m-%d").to_string();
        }
    }
    raw.to_string()
}

/// Zero-pad a time string to `HH:MM:SS` when parseable, leave as-is
/// otherwise.
fn reformat_time(raw: &str) -> String {
    const FORMATS: [&str; 2] = ["%H:%M:%S", "%H:%M"];
    for format in FORMATS {
        if let Ok(parsed) = NaiveTime::parse_from_str(raw.trim(), format) {
            return parsed.format("%H:%M:%S").to_string();
        }
    }
    raw.to_string()
}

/// Full pipeline: extract → validate → sanitize.
///
/// The two failure modes stay distinguishable: `ParseError::Extraction`
/// when no JSON is found, `ParseError::Validation` (aggregating every
/// violated rule) when required fields are invalid.
pub fn parse_and_validate(raw: &str, processing_time_ms: u64) -> Result<ReceiptResult, ParseError> {
    let fields = extract_json(raw).ok_or(ParseError::Extraction)?;

    let report = validate(&fields);
    for warning in &report.warnings {
        warn!(warning = %warning, "Receipt validation warning");
    }
    if !report.is_valid() {
        return Err(ParseError::Validation(report.errors.join("; ")));
    }

    let mut result = sanitize(&fields);
    result.processing_time_ms = processing_time_ms;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawReceiptFields {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_extract_json_idempotent_on_clean_json() {
        let fields = RawReceiptFields {
            merchant: Some("Corner Cafe".to_string()),
            amount: Some(serde_json::json!(12.75)),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&fields).unwrap();
        assert_eq!(extract_json(&serialized).unwrap(), fields);
    }

    #[test]
    fn test_extract_json_strips_fences() {
        let reply = "```json\n{\"merchant\":\"Cafe\",\"amount\":5.0}\n```";
        let fields = extract_json(reply).unwrap();
        assert_eq!(fields.merchant.as_deref(), Some("Cafe"));
    }

    #[test]
    fn test_extract_json_surrounding_prose() {
        let reply = "Here is the receipt data: {\"merchant\":\"Cafe\",\"amount\":5.0} Hope that helps!";
        assert!(extract_json(reply).is_some());
    }

    #[test]
    fn test_extract_json_no_object() {
        assert!(extract_json("sorry, I could not read the image").is_none());
        assert!(extract_json("{merchant: broken").is_none());
    }

    #[test]
    fn test_validate_requires_merchant_and_amount() {
        let report = validate(&raw("{}"));
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("Merchant")));
        assert!(report.errors.iter().any(|e| e.contains("Amount")));
    }

    #[test]
    fn test_validate_tax_exceeds_amount() {
        let report = validate(&raw(
            r#"{"merchant":"Test Store","amount":50,"tax_amount":60}"#,
        ));
        assert!(report
            .errors
            .contains(&"Tax amount cannot exceed total amount".to_string()));
    }

    #[test]
    fn test_validate_rejects_non_numeric_amount() {
        let report = validate(&raw(r#"{"merchant":"A Shop","amount":"a lot"}"#));
        assert!(report.errors.contains(&"Amount must be a number".to_string()));
    }

    #[test]
    fn test_validate_accepts_string_amount() {
        let report = validate(&raw(r#"{"merchant":"A Shop","amount":"42.10"}"#));
        assert!(report.is_valid());
    }

    #[test]
    fn test_validate_future_date() {
        let next_year = Local::now().date_naive() + Duration::days(365);
        let json = format!(
            r#"{{"merchant":"A Shop","amount":10,"date":"{}"}}"#,
            next_year.format("%Y-%m-%d")
        );
        let report = validate(&raw(&json));
        assert!(report.errors.iter().any(|e| e.contains("future")));
    }

    #[test]
    fn test_validate_soft_warnings_do_not_fail() {
        let report = validate(&raw(
            r#"{"merchant":"A Shop","amount":10,"confidence":0.2,"category":"spaceships","time":"9:5"}"#,
        ));
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn test_sanitize_normalizes_fields() {
        let result = sanitize(&raw(
            r#"{"merchant":"  The   Corner   Cafe ","amount":12.756,"tax_type":"sales tax","category":"Restaurant","time":"9:05"}"#,
        ));
        assert_eq!(result.merchant.as_deref(), Some("The Corner Cafe"));
        assert_eq!(result.amount, Some(12.76));
        assert_eq!(result.tax_type, Some(TaxType::Sales));
        assert_eq!(result.category, Category::FoodDining);
        assert_eq!(result.time.as_deref(), Some("09:05:00"));
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_sanitize_defaults_date_to_today() {
        let result = sanitize(&raw(r#"{"merchant":"Cafe","amount":5}"#));
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(result.date.as_deref(), Some(today.as_str()));
    }

    #[test]
    fn test_sanitize_reformats_date() {
        let result = sanitize(&raw(
            r#"{"merchant":"Cafe","amount":5,"date":"03/15/2024"}"#,
        ));
        assert_eq!(result.date.as_deref(), Some("2024-03-15"));
    }

    #[test]
    fn test_sanitize_unknown_tax_type_maps_to_other() {
        let result = sanitize(&raw(
            r#"{"merchant":"Cafe","amount":5,"tax_type":"city surcharge"}"#,
        ));
        assert_eq!(result.tax_type, Some(TaxType::Other));
    }

    #[test]
    fn test_parse_and_validate_fenced_reply() {
        let reply =
            "```json\n{\"merchant\":\"The Italian Kitchen\",\"amount\":87.50,\"date\":\"2024-03-15\"}\n```";
        let result = parse_and_validate(reply, 1200).unwrap();
        assert_eq!(result.merchant.as_deref(), Some("The Italian Kitchen"));
        assert_eq!(result.amount, Some(87.5));
        assert_eq!(result.date.as_deref(), Some("2024-03-15"));
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.processing_time_ms, 1200);
    }

    #[test]
    fn test_parse_and_validate_failure_modes_distinguishable() {
        let extraction = parse_and_validate("no json here", 0).unwrap_err();
        assert!(matches!(extraction, ParseError::Extraction));

        let validation = parse_and_validate(r#"{"amount":-4}"#, 0).unwrap_err();
        match validation {
            ParseError::Validation(msg) => {
                assert!(msg.contains("Merchant name is required"));
                assert!(msg.contains("Amount must be positive"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_notes_truncated() {
        let long_notes = "x".repeat(600);
        let json = format!(r#"{{"merchant":"Cafe","amount":5,"notes":"{long_notes}"}}"#);
        let result = sanitize(&raw(&json));
        assert_eq!(result.notes.unwrap().len(), 500);
    }
}
