//! Paginated announcement source.
//!
//! The trait is the contract the reconciling fetcher needs: a page of
//! records, a "more pages" flag, and a total-count hint. The hint's
//! unreliability is a property of the interface; callers must never drive
//! traversal with it.

use crate::error::FetchError;
use crate::types::{AnnouncementId, AnnouncementRecord, CompanyCode, FetchPage, PeriodType};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Page size requested from the source.
const PAGE_SIZE: u32 = 30;

/// Query parameters for one company's announcement listing.
#[derive(Debug, Clone)]
pub struct AnnouncementQuery {
    pub code: CompanyCode,
    /// Source-side category filter (e.g. regular reports, delisting
    /// notices).
    pub category: String,
    /// Inclusive publish-date window, `YYYY-MM-DD~YYYY-MM-DD`.
    pub date_range: String,
    /// Optional full-text keyword (used by the agent's SEARCH_MORE action).
    pub keyword: Option<String>,
}

impl AnnouncementQuery {
    pub fn new(code: CompanyCode, category: impl Into<String>, date_range: impl Into<String>) -> Self {
        Self {
            code,
            category: category.into(),
            date_range: date_range.into(),
            keyword: None,
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }
}

/// Trait for paginated announcement sources (to allow mocking).
#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    /// Fetch one page. Implementations own their short per-page retry
    /// budget; an error here means that budget is already exhausted.
    async fn fetch_page(&self, query: &AnnouncementQuery, page_num: u32)
        -> Result<FetchPage, FetchError>;
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(rename = "totalAnnouncement")]
    total_announcement: Option<usize>,
    #[serde(rename = "hasMore")]
    has_more: Option<bool>,
    announcements: Option<Vec<RawAnnouncement>>,
}

#[derive(Debug, Deserialize)]
struct RawAnnouncement {
    #[serde(rename = "announcementId")]
    announcement_id: Option<String>,
    #[serde(rename = "announcementTitle")]
    announcement_title: Option<String>,
    #[serde(rename = "announcementTime")]
    announcement_time: Option<i64>,
    #[serde(rename = "secCode")]
    sec_code: Option<String>,
    #[serde(rename = "secName")]
    sec_name: Option<String>,
    #[serde(rename = "adjunctUrl")]
    adjunct_url: Option<String>,
}

/// HTTP client for the cninfo announcement-history endpoint.
pub struct CninfoSource {
    http_client: reqwest::Client,
    base_url: String,
    static_url: String,
    retries: u32,
    retry_delay: Duration,
}

impl CninfoSource {
    pub const DEFAULT_BASE_URL: &'static str = "http://www.cninfo.com.cn/new/hisAnnouncement/query";
    pub const DEFAULT_STATIC_URL: &'static str = "http://static.cninfo.com.cn";

    pub fn new(timeout: Duration, retries: u32, retry_delay: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Contract(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            static_url: Self::DEFAULT_STATIC_URL.to_string(),
            retries,
            retry_delay,
        })
    }

    /// Point at a different endpoint (mirrors, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn form_params(&self, query: &AnnouncementQuery, page_num: u32) -> Vec<(&'static str, String)> {
        vec![
            ("pageNum", page_num.to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
            ("column", "szse".to_string()),
            ("tabName", "fulltext".to_string()),
            ("plate", "sz;sh".to_string()),
            ("searchkey", query.keyword.clone().unwrap_or_default()),
            ("secid", String::new()),
            ("stock", query.code.as_str().to_string()),
            ("category", query.category.clone()),
            ("trade", String::new()),
            ("seDate", query.date_range.clone()),
            ("sortName", "code".to_string()),
            ("sortType", "asc".to_string()),
            ("isHLtitle", "false".to_string()),
        ]
    }

    async fn request_page(
        &self,
        query: &AnnouncementQuery,
        page_num: u32,
    ) -> anyhow::Result<RawPage> {
        let response = self
            .http_client
            .post(&self.base_url)
            .header("Accept", "*/*")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            )
            .form(&self.form_params(query, page_num))
            .send()
            .await?
            .error_for_status()?;

        let raw: RawPage = response.json().await?;
        Ok(raw)
    }

    fn convert(&self, query: &AnnouncementQuery, page_num: u32, raw: RawPage)
        -> Result<FetchPage, FetchError> {
        let total_hint = raw.total_announcement.ok_or_else(|| {
            FetchError::Contract(format!(
                "page {page_num} for {} missing totalAnnouncement",
                query.code
            ))
        })?;
        let has_more = raw.has_more.ok_or_else(|| {
            FetchError::Contract(format!("page {page_num} for {} missing hasMore", query.code))
        })?;

        let mut records = Vec::new();
        for item in raw.announcements.unwrap_or_default() {
            match self.convert_record(item) {
                Ok(record) => records.push(record),
                Err(e) => return Err(FetchError::Contract(e.to_string())),
            }
        }

        Ok(FetchPage {
            page_num,
            has_more,
            total_hint,
            records,
        })
    }

    fn convert_record(&self, item: RawAnnouncement) -> anyhow::Result<AnnouncementRecord> {
        let id = item
            .announcement_id
            .ok_or_else(|| anyhow!("announcement missing announcementId"))?;
        let title_raw = item
            .announcement_title
            .ok_or_else(|| anyhow!("announcement {id} missing title"))?;
        let time_ms = item
            .announcement_time
            .ok_or_else(|| anyhow!("announcement {id} missing announcementTime"))?;
        let sec_code = item
            .sec_code
            .ok_or_else(|| anyhow!("announcement {id} missing secCode"))?;
        let adjunct = item
            .adjunct_url
            .ok_or_else(|| anyhow!("announcement {id} missing adjunctUrl"))?;

        let title = clean_title(&title_raw);
        let publish_date = publish_date_from_millis(time_ms)
            .ok_or_else(|| anyhow!("announcement {id} has invalid timestamp {time_ms}"))?;

        Ok(AnnouncementRecord {
            id: AnnouncementId(id),
            code: CompanyCode::new(&sec_code),
            company_name: item.sec_name.unwrap_or_default(),
            period: PeriodType::classify(&title),
            title,
            publish_date,
            url: format!("{}/{}", self.static_url, adjunct),
        })
    }
}

#[async_trait]
impl AnnouncementSource for CninfoSource {
    async fn fetch_page(
        &self,
        query: &AnnouncementQuery,
        page_num: u32,
    ) -> Result<FetchPage, FetchError> {
        let mut last_error = None;

        for attempt in 1..=self.retries {
            match self.request_page(query, page_num).await {
                Ok(raw) => return self.convert(query, page_num, raw),
                Err(e) => {
                    warn!(
                        company = %query.code,
                        page = page_num,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "page request failed"
                    );
                    last_error = Some(e);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(FetchError::Page {
            company: query.code.to_string(),
            page_num,
            source: last_error.unwrap_or_else(|| anyhow!("retry budget was zero")),
        })
    }
}

/// Strip markup and normalize an announcement title.
fn clean_title(raw: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"));
    re.replace_all(raw.trim(), "").replace('：', "")
}

/// The source reports publish time as epoch milliseconds in exchange-local
/// time (UTC+8). The calendar date in that zone is the publish date.
fn publish_date_from_millis(millis: i64) -> Option<chrono::NaiveDate> {
    let shanghai = FixedOffset::east_opt(8 * 3600)?;
    let utc = DateTime::from_timestamp_millis(millis)?;
    Some(utc.with_timezone(&shanghai).date_naive())
}
