//! Core data model for the delisting analysis pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Six-digit exchange security code, zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyCode(pub String);

impl CompanyCode {
    /// Normalize a raw code to the canonical zero-padded 6-digit form.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        Self(format!("{trimmed:0>6}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier assigned to an announcement by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnouncementId(pub String);

impl fmt::Display for AnnouncementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reporting period classified from an announcement title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Annual,
    SemiAnnual,
    FirstQuarter,
    ThirdQuarter,
    ForecastIncrease,
    ForecastDecrease,
    ForecastLoss,
    ForecastTurnaround,
    Other,
}

impl PeriodType {
    /// Classify from the announcement title.
    ///
    /// Forecast subtypes are matched before regular-report keywords because
    /// forecast titles often also contain the report year.
    pub fn classify(title: &str) -> Self {
        if title.contains("预增") {
            return PeriodType::ForecastIncrease;
        }
        if title.contains("预减") {
            return PeriodType::ForecastDecrease;
        }
        if title.contains("预亏") {
            return PeriodType::ForecastLoss;
        }
        if title.contains("扭亏") {
            return PeriodType::ForecastTurnaround;
        }
        if title.contains("半年") || title.contains("中期") {
            return PeriodType::SemiAnnual;
        }
        if title.contains("第一季") || title.contains("一季") {
            return PeriodType::FirstQuarter;
        }
        if title.contains("第三季") || title.contains("三季") {
            return PeriodType::ThirdQuarter;
        }
        if title.contains("年度报告") || title.contains("年报") {
            return PeriodType::Annual;
        }
        PeriodType::Other
    }
}

/// One document reference returned by the upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub id: AnnouncementId,
    pub code: CompanyCode,
    pub company_name: String,
    pub title: String,
    pub publish_date: NaiveDate,
    pub period: PeriodType,
    /// Document locator resolvable by the document provider.
    pub url: String,
}

/// One page of the paginated source response. Ephemeral; consumed
/// immediately by the reconciling fetcher.
#[derive(Debug, Clone)]
pub struct FetchPage {
    pub page_num: u32,
    pub has_more: bool,
    /// The source's self-reported total record count. Known to fluctuate
    /// between requests on the same backend; never used to drive traversal.
    pub total_hint: usize,
    pub records: Vec<AnnouncementRecord>,
}

/// Accumulated extraction fields, merged round over round.
///
/// `BTreeMap` keeps serialization deterministic so re-runs produce
/// byte-identical ledger entries.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Processing state of a task item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
    Failed,
}

/// One company/delisting case to analyze.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub code: CompanyCode,
    pub name: String,
    /// Date boundary: no fact may be sourced from a document published on or
    /// after this date.
    pub delist_date: NaiveDate,
    /// Extraction fields accumulated across agent rounds.
    #[serde(default)]
    pub fields: FieldMap,
}

impl TaskItem {
    pub fn new(code: CompanyCode, name: impl Into<String>, delist_date: NaiveDate) -> Self {
        Self {
            code,
            name: name.into(),
            delist_date,
            fields: FieldMap::new(),
        }
    }

    /// Merge an `updated_state` payload into the accumulated fields.
    ///
    /// Field-wise overwrite, later rounds win. Nulls and empty strings are
    /// ignored so a model cannot erase previously extracted facts by
    /// omission.
    pub fn merge_fields(&mut self, updated: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in updated {
            match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) if s.is_empty() || s == "null" => continue,
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Terminal result of running the agent loop for one task item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// The model declared SUBMIT and the state passed validation.
    Submitted { fields: FieldMap },
    /// The model declared the information unobtainable (historical gaps).
    Skipped { reason: String },
    /// The round budget ran out. Partial state is retained, never discarded.
    Exhausted { partial: FieldMap },
}

impl ExtractionOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, ExtractionOutcome::Submitted { .. })
    }
}

/// Durable record of a task item's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub status: TaskStatus,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_company_code_zero_pads() {
        assert_eq!(CompanyCode::new("1").as_str(), "000001");
        assert_eq!(CompanyCode::new("600519").as_str(), "600519");
        assert_eq!(CompanyCode::new(" 2594 ").as_str(), "002594");
    }

    #[test]
    fn test_period_classification() {
        assert_eq!(PeriodType::classify("2008年年度报告"), PeriodType::Annual);
        assert_eq!(PeriodType::classify("2009年半年度报告"), PeriodType::SemiAnnual);
        assert_eq!(PeriodType::classify("2010年第一季度报告"), PeriodType::FirstQuarter);
        assert_eq!(PeriodType::classify("2010年第三季度报告"), PeriodType::ThirdQuarter);
        assert_eq!(PeriodType::classify("2011年度业绩预增公告"), PeriodType::ForecastIncrease);
        assert_eq!(PeriodType::classify("2011年度业绩预减公告"), PeriodType::ForecastDecrease);
        assert_eq!(PeriodType::classify("2012年度业绩预亏公告"), PeriodType::ForecastLoss);
        assert_eq!(PeriodType::classify("2012年度扭亏为盈公告"), PeriodType::ForecastTurnaround);
        assert_eq!(PeriodType::classify("关于重大资产重组的公告"), PeriodType::Other);
    }

    #[test]
    fn test_forecast_wins_over_annual_keyword() {
        // "2011年度业绩预增" contains both the year marker and the forecast
        // keyword; the forecast subtype must win.
        assert_eq!(
            PeriodType::classify("2011年年度业绩预增公告"),
            PeriodType::ForecastIncrease
        );
    }

    #[test]
    fn test_merge_fields_later_rounds_win() {
        let mut item = TaskItem::new(
            CompanyCode::new("600001"),
            "test",
            NaiveDate::from_ymd_opt(2015, 6, 1).unwrap(),
        );

        let round1 = serde_json::json!({"delist_type": "MERGE", "swap_ratio": "1:0.5000"});
        item.merge_fields(round1.as_object().unwrap());
        let round2 = serde_json::json!({"swap_ratio": "1:0.1339", "ignored": null, "empty": ""});
        item.merge_fields(round2.as_object().unwrap());

        assert_eq!(item.fields["delist_type"], "MERGE");
        assert_eq!(item.fields["swap_ratio"], "1:0.1339");
        assert!(!item.fields.contains_key("ignored"));
        assert!(!item.fields.contains_key("empty"));
    }
}
