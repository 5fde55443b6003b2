use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Vision-AI vendors a receipt can be sent to, plus the offline OCR sentinel.
///
/// A job that completes through the fallback path has its `service_id`
/// rewritten to `Ocr` so consumers can tell AI and OCR provenance apart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceId {
    OpenAi,
    Gemini,
    Mistral,
    /// On-device OCR fallback.
    Ocr,
}

/// Tax regimes recognized on receipts. Unrecognized strings map to `Other`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaxType {
    Vat,
    Gst,
    Hst,
    Pst,
    Sales,
    Other,
}

impl TaxType {
    /// Map a raw tax-type string (any case, AI- or OCR-sourced) to the
    /// closed set. Unrecognized values become `Other`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "VAT" => TaxType::Vat,
            "GST" => TaxType::Gst,
            "HST" => TaxType::Hst,
            "PST" => TaxType::Pst,
            "SALES" | "SALES TAX" | "SALES_TAX" => TaxType::Sales,
            _ => TaxType::Other,
        }
    }
}

/// Expense categories, stored as fixed integer codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    Uncategorized,
    FoodDining,
    Groceries,
    Transportation,
    Fuel,
    Accommodation,
    Entertainment,
    OfficeSupplies,
    Other,
}

impl Category {
    /// Fixed integer code for persistence and downstream expense records.
    pub fn code(self) -> u8 {
        match self {
            Category::Uncategorized => 0,
            Category::FoodDining => 1,
            Category::Groceries => 2,
            Category::Transportation => 3,
            Category::Fuel => 4,
            Category::Accommodation => 5,
            Category::Entertainment => 6,
            Category::OfficeSupplies => 7,
            Category::Other => 8,
        }
    }

    /// Map a raw category name (any case) to a code. Unrecognized or absent
    /// names fall back to `Uncategorized`.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "uncategorized" => Some(Category::Uncategorized),
            "food_dining" | "food & dining" | "food" | "dining" | "restaurant" => {
                Some(Category::FoodDining)
            }
            "groceries" | "grocery" => Some(Category::Groceries),
            "transportation" | "transport" | "travel" => Some(Category::Transportation),
            "fuel" | "gas" => Some(Category::Fuel),
            "accommodation" | "lodging" | "hotel" => Some(Category::Accommodation),
            "entertainment" => Some(Category::Entertainment),
            "office_supplies" | "office supplies" | "office" => Some(Category::OfficeSupplies),
            "other" => Some(Category::Other),
            _ => None,
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Uncategorized
    }
}

/// Structured expense data extracted from one receipt image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,

    /// Positive total, rounded to 2 decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_type: Option<TaxType>,

    /// Percentage in [0, 100].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_rate: Option<f64>,

    /// `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// `HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    pub category: Category,

    /// Free-form notes, capped at 500 chars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Heuristic [0, 1] estimate of extraction correctness.
    pub confidence: f64,

    pub processing_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_type_lookup() {
        assert_eq!(TaxType::from_raw("vat"), TaxType::Vat);
        assert_eq!(TaxType::from_raw(" Sales Tax "), TaxType::Sales);
        assert_eq!(TaxType::from_raw("municipal levy"), TaxType::Other);
    }

    #[test]
    fn test_category_codes_stable() {
        assert_eq!(Category::Uncategorized.code(), 0);
        assert_eq!(Category::from_raw("Restaurant"), Some(Category::FoodDining));
        assert_eq!(Category::from_raw("does-not-exist"), None);
    }

    #[test]
    fn test_service_id_roundtrip() {
        let json = serde_json::to_string(&ServiceId::OpenAi).unwrap();
        assert_eq!(json, "\"open_ai\"");
        let back: ServiceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServiceId::OpenAi);
    }
}
