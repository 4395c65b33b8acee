//! Deterministic validation of accumulated extraction state.
//!
//! No model involvement: schema completeness, date ordering, and format
//! conformance only. Violations are returned as concrete, self-contained
//! messages because they are fed back to the model verbatim on the next
//! round.

use crate::types::FieldMap;
use chrono::NaiveDate;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Delisting categories the extraction schema recognizes.
pub const DELIST_TYPES: &[&str] = &[
    "MERGE",
    "RECODE",
    "VOLUNTARY",
    "TENDER",
    "FORCE_FIN",
    "FORCE_TRADE",
    "FORCE_FRAUD",
    "FORCE_NORM",
];

/// One concrete validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn ratio_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^1:\d+(\.\d+)?$").expect("valid regex"))
}

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{6}$").expect("valid regex"))
}

/// A field counts as present when it exists and is neither null nor a
/// missing-value marker.
fn present<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    match fields.get(key) {
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s == "NaN" || s == "null" {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

/// Validate the accumulated state against the extraction schema.
///
/// An empty result means the state is submittable.
pub fn validate(fields: &FieldMap, delist_date: NaiveDate) -> Vec<Violation> {
    let mut violations = Vec::new();

    let delist_type = match present(fields, "delist_type") {
        Some(t) if DELIST_TYPES.contains(&t) => Some(t),
        Some(t) => {
            violations.push(Violation::new(
                "delist_type",
                format!("unknown value '{t}', expected one of {DELIST_TYPES:?}"),
            ));
            None
        }
        None => {
            violations.push(Violation::new("delist_type", "required field is missing"));
            None
        }
    };

    match present(fields, "first_notice_date") {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => {
                if date >= delist_date {
                    violations.push(Violation::new(
                        "first_notice_date",
                        format!(
                            "{date} is not strictly before the delisting date {delist_date}; \
                             use the first announcement that made the delisting certain, \
                             not the delisting itself"
                        ),
                    ));
                }
            }
            Err(_) => violations.push(Violation::new(
                "first_notice_date",
                format!("'{raw}' is not a YYYY-MM-DD date"),
            )),
        },
        None => violations.push(Violation::new(
            "first_notice_date",
            "required field is missing",
        )),
    }

    // Successor fields are mandatory for share-swap outcomes; without them a
    // backtest values the position at zero after the swap.
    if matches!(delist_type, Some("MERGE") | Some("RECODE")) {
        match present(fields, "successor_code") {
            Some(code) if code_re().is_match(code) => {}
            Some(code) => violations.push(Violation::new(
                "successor_code",
                format!("'{code}' is not a 6-digit security code"),
            )),
            None => violations.push(Violation::new(
                "successor_code",
                "required for MERGE/RECODE delistings",
            )),
        }

        if present(fields, "successor_name").is_none() {
            violations.push(Violation::new(
                "successor_name",
                "required for MERGE/RECODE delistings",
            ));
        }

        match present(fields, "swap_ratio") {
            Some(ratio) if ratio_re().is_match(ratio) => {
                if delist_type == Some("RECODE") && ratio != "1:1" {
                    violations.push(Violation::new(
                        "swap_ratio",
                        format!("RECODE swaps are always 1:1, got '{ratio}'"),
                    ));
                }
            }
            Some(ratio) => violations.push(Violation::new(
                "swap_ratio",
                format!("'{ratio}' does not match the 1:X.XXXX format"),
            )),
            None => violations.push(Violation::new(
                "swap_ratio",
                "required for MERGE/RECODE delistings",
            )),
        }

        match present(fields, "swap_completion_date") {
            Some(raw) if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() => {}
            Some(raw) => violations.push(Violation::new(
                "swap_completion_date",
                format!("'{raw}' is not a YYYY-MM-DD date"),
            )),
            None => violations.push(Violation::new(
                "swap_completion_date",
                "required for MERGE/RECODE delistings",
            )),
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delist_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2015, 5, 20).unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_valid_merge_state_passes() {
        let state = fields(&[
            ("delist_type", "MERGE"),
            ("first_notice_date", "2014-08-01"),
            ("successor_code", "601919"),
            ("successor_name", "中国远洋"),
            ("swap_ratio", "1:0.1339"),
            ("swap_completion_date", "2015-06-01"),
        ]);
        assert!(validate(&state, delist_date()).is_empty());
    }

    #[test]
    fn test_force_delisting_needs_no_successor() {
        let state = fields(&[
            ("delist_type", "FORCE_FIN"),
            ("first_notice_date", "2014-04-30"),
        ]);
        assert!(validate(&state, delist_date()).is_empty());
    }

    #[test]
    fn test_missing_required_fields_reported() {
        let state = fields(&[("delist_type", "MERGE")]);
        let violations = validate(&state, delist_date());

        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"first_notice_date"));
        assert!(fields.contains(&"successor_code"));
        assert!(fields.contains(&"swap_ratio"));
        assert!(fields.contains(&"swap_completion_date"));
    }

    #[test]
    fn test_notice_date_must_predate_delisting() {
        let state = fields(&[
            ("delist_type", "VOLUNTARY"),
            ("first_notice_date", "2015-05-20"),
        ]);
        let violations = validate(&state, delist_date());
        assert!(violations.iter().any(|v| v.field == "first_notice_date"));
    }

    #[test]
    fn test_nan_marker_counts_as_missing() {
        let state = fields(&[
            ("delist_type", "MERGE"),
            ("first_notice_date", "2014-08-01"),
            ("successor_code", "NaN"),
            ("successor_name", "NaN"),
            ("swap_ratio", "NaN"),
            ("swap_completion_date", "NaN"),
        ]);
        let violations = validate(&state, delist_date());
        assert_eq!(violations.len(), 4);
    }

    #[test]
    fn test_recode_ratio_must_be_one_to_one() {
        let state = fields(&[
            ("delist_type", "RECODE"),
            ("first_notice_date", "2014-08-01"),
            ("successor_code", "600150"),
            ("successor_name", "中国船舶"),
            ("swap_ratio", "1:0.5000"),
            ("swap_completion_date", "2015-06-01"),
        ]);
        let violations = validate(&state, delist_date());
        assert!(violations.iter().any(|v| v.field == "swap_ratio"));
    }

    #[test]
    fn test_bad_ratio_format_reported() {
        let state = fields(&[
            ("delist_type", "MERGE"),
            ("first_notice_date", "2014-08-01"),
            ("successor_code", "601919"),
            ("successor_name", "中国远洋"),
            ("swap_ratio", "0.1339:1"),
            ("swap_completion_date", "2015-06-01"),
        ]);
        let violations = validate(&state, delist_date());
        assert!(violations.iter().any(|v| v.field == "swap_ratio"));
    }

    #[test]
    fn test_unknown_delist_type_reported() {
        let state = fields(&[
            ("delist_type", "BANKRUPT"),
            ("first_notice_date", "2014-08-01"),
        ]);
        let violations = validate(&state, delist_date());
        assert!(violations.iter().any(|v| v.field == "delist_type"));
    }
}
