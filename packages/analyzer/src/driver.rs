//! Batch driver.
//!
//! Walks the task list sequentially, one company at a time. Every failure
//! mode is localized to the item that hit it: the item is checkpointed as
//! failed and the batch moves on. Already-checkpointed items are skipped so
//! an interrupted batch resumes where it stopped.

use crate::agent::{AgentLoop, AnnouncementSearcher};
use crate::checkpoint::CheckpointStore;
use crate::completion::{ChatBackend, CompletionClient};
use crate::error::FetchError;
use crate::fetcher::ReconcilingFetcher;
use crate::provider::DocumentProvider;
use crate::source::{AnnouncementQuery, AnnouncementSource};
use crate::types::{AnnouncementRecord, CompanyCode, ExtractionOutcome, TaskItem, TaskStatus};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{error, info, warn};

/// Fields written to the output sheet, in column order.
const OUTPUT_FIELDS: &[&str] = &[
    "delist_type",
    "delist_reason",
    "first_notice_date",
    "successor_code",
    "successor_name",
    "swap_ratio",
    "swap_completion_date",
    "source_title",
    "source_url",
];

/// Load the task list from a CSV sheet.
///
/// Column headers are matched by alias so both exported Chinese sheets and
/// plain English ones load without preprocessing.
pub fn load_tasks(path: &Path) -> Result<Vec<TaskItem>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening task sheet {}", path.display()))?;

    let headers = reader.headers().context("reading task sheet header")?.clone();
    let find = |aliases: &[&str]| -> Option<usize> {
        headers
            .iter()
            .position(|h| aliases.contains(&h.trim()))
    };

    let code_idx = find(&["code", "股票代码", "证券代码"])
        .context("task sheet has no company-code column")?;
    let name_idx = find(&["name", "股票简称", "证券简称", "公司简称"]);
    let date_idx = find(&["delist_date", "退市日期", "终止上市日期"])
        .context("task sheet has no delisting-date column")?;

    let mut tasks = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading task sheet row {}", line + 2))?;
        let code_raw = row.get(code_idx).unwrap_or_default().trim();
        if code_raw.is_empty() {
            continue;
        }
        let date_raw = row.get(date_idx).unwrap_or_default().trim();
        let delist_date = parse_sheet_date(date_raw).with_context(|| {
            format!("row {}: unparseable delisting date '{date_raw}'", line + 2)
        })?;
        let name = name_idx
            .and_then(|i| row.get(i))
            .unwrap_or_default()
            .trim()
            .to_string();

        tasks.push(TaskItem::new(CompanyCode::new(code_raw), name, delist_date));
    }

    if tasks.is_empty() {
        bail!("task sheet {} contains no usable rows", path.display());
    }
    Ok(tasks)
}

fn parse_sheet_date(raw: &str) -> Result<NaiveDate> {
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(date);
        }
    }
    bail!("'{raw}' matches no supported date format")
}

/// Append-only CSV result sheet; the header is written once when the file
/// is created.
pub struct ResultWriter {
    writer: csv::Writer<std::fs::File>,
}

impl ResultWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let write_header = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening output sheet {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            let mut header = vec!["code", "name", "delist_date", "status"];
            header.extend_from_slice(OUTPUT_FIELDS);
            writer.write_record(&header).context("writing output header")?;
            writer.flush()?;
        }
        Ok(Self { writer })
    }

    pub fn append(&mut self, task: &TaskItem, status: TaskStatus) -> Result<()> {
        let status_text = serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        let mut row = vec![
            task.code.to_string(),
            task.name.clone(),
            task.delist_date.to_string(),
            status_text,
        ];
        for field in OUTPUT_FIELDS {
            let value = match task.fields.get(*field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            row.push(value);
        }
        self.writer.write_record(&row).context("appending output row")?;
        self.writer.flush().context("flushing output sheet")?;
        Ok(())
    }
}

/// Outcome counters for one batch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub exhausted: usize,
    pub failed: usize,
    pub resumed: usize,
}

/// Per-batch knobs carried from the configuration.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub lookback_days: i64,
    pub max_rounds: u32,
    pub max_doc_len: usize,
    /// Stop after this many newly processed items.
    pub limit: Option<usize>,
}

pub struct BatchDriver<'a, S, B, P> {
    fetcher: &'a ReconcilingFetcher<S>,
    completion: &'a CompletionClient<B>,
    provider: &'a P,
    checkpoints: &'a mut CheckpointStore,
    options: DriverOptions,
}

/// SEARCH_MORE handler: a keyword query over the same company and window,
/// run through the reconciling fetcher so search results meet the same
/// completeness bar as the base listing.
struct KeywordSearcher<'a, S> {
    fetcher: &'a ReconcilingFetcher<S>,
    base: AnnouncementQuery,
}

#[async_trait]
impl<S: AnnouncementSource> AnnouncementSearcher for KeywordSearcher<'_, S> {
    async fn search(&self, keyword: &str) -> Result<Vec<AnnouncementRecord>, FetchError> {
        let query = self.base.clone().with_keyword(keyword);
        self.fetcher.fetch_all(&query).await
    }
}

impl<'a, S, B, P> BatchDriver<'a, S, B, P>
where
    S: AnnouncementSource,
    B: ChatBackend,
    P: DocumentProvider,
{
    pub fn new(
        fetcher: &'a ReconcilingFetcher<S>,
        completion: &'a CompletionClient<B>,
        provider: &'a P,
        checkpoints: &'a mut CheckpointStore,
        options: DriverOptions,
    ) -> Self {
        Self {
            fetcher,
            completion,
            provider,
            checkpoints,
            options,
        }
    }

    /// Process the task list sequentially, appending each terminal outcome
    /// to the output sheet.
    pub async fn run(&mut self, tasks: Vec<TaskItem>, output: &mut ResultWriter) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let total = tasks.len();

        for (index, mut task) in tasks.into_iter().enumerate() {
            if self.checkpoints.is_done(&task.code) {
                summary.resumed += 1;
                continue;
            }
            if let Some(limit) = self.options.limit {
                if summary.processed >= limit {
                    info!(limit, "item limit reached, stopping batch");
                    break;
                }
            }

            info!(
                company = %task.code,
                name = %task.name,
                position = index + 1,
                total,
                "processing company"
            );
            summary.processed += 1;
            self.checkpoints.mark_in_progress(&task.code)?;

            match self.run_item(&mut task).await {
                Ok(outcome) => {
                    let status = match &outcome {
                        ExtractionOutcome::Submitted { .. } => {
                            summary.submitted += 1;
                            self.checkpoints.mark_done(&task.code, task.fields.clone())?;
                            TaskStatus::Done
                        }
                        ExtractionOutcome::Skipped { reason } => {
                            summary.skipped += 1;
                            self.checkpoints.mark_skipped(&task.code, reason.clone())?;
                            TaskStatus::Skipped
                        }
                        ExtractionOutcome::Exhausted { .. } => {
                            summary.exhausted += 1;
                            self.checkpoints.mark_failed(
                                &task.code,
                                task.fields.clone(),
                                "round budget exhausted".to_string(),
                            )?;
                            TaskStatus::Failed
                        }
                    };
                    output.append(&task, status)?;
                }
                Err(e) => {
                    error!(company = %task.code, error = %e, "company failed, continuing batch");
                    summary.failed += 1;
                    self.checkpoints.mark_failed(
                        &task.code,
                        task.fields.clone(),
                        e.to_string(),
                    )?;
                    output.append(&task, TaskStatus::Failed)?;
                }
            }
        }

        info!(
            processed = summary.processed,
            submitted = summary.submitted,
            skipped = summary.skipped,
            exhausted = summary.exhausted,
            failed = summary.failed,
            resumed = summary.resumed,
            "batch complete"
        );
        Ok(summary)
    }

    async fn run_item(&self, task: &mut TaskItem) -> Result<ExtractionOutcome> {
        let window_start = task.delist_date - ChronoDuration::days(self.options.lookback_days);
        let query = AnnouncementQuery::new(
            task.code.clone(),
            String::new(),
            format!("{}~{}", window_start, task.delist_date),
        );

        let announcements = self
            .fetcher
            .fetch_all(&query)
            .await
            .with_context(|| format!("fetching announcements for {}", task.code))?;

        if announcements.is_empty() {
            warn!(company = %task.code, "no announcements in window");
        }

        let searcher = KeywordSearcher {
            fetcher: self.fetcher,
            base: query,
        };
        let agent = AgentLoop::new(
            self.completion,
            self.provider,
            &searcher,
            self.options.max_rounds,
            self.options.max_doc_len,
        );

        let outcome = agent
            .run(task, announcements)
            .await
            .with_context(|| format!("running extraction for {}", task.code))?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionError;
    use crate::roster::ModelRoster;
    use crate::types::FetchPage;
    use llm_client::LlmError;
    use std::io::Write as _;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct EmptySource {
        /// Companies whose fetch must fail.
        failing: Vec<CompanyCode>,
    }

    #[async_trait]
    impl AnnouncementSource for EmptySource {
        async fn fetch_page(
            &self,
            query: &AnnouncementQuery,
            page_num: u32,
        ) -> Result<FetchPage, FetchError> {
            if self.failing.contains(&query.code) {
                return Err(FetchError::Page {
                    company: query.code.to_string(),
                    page_num,
                    source: anyhow::anyhow!("scripted outage"),
                });
            }
            Ok(FetchPage {
                page_num,
                has_more: false,
                total_hint: 0,
                records: Vec::new(),
            })
        }
    }

    /// Backend that always skips, counting invocations per company batch.
    struct SkippingBackend {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ChatBackend for SkippingBackend {
        async fn chat(&self, _model: &str, _system: &str, _user: &str) -> Result<String, LlmError> {
            *self.calls.lock().unwrap() += 1;
            Ok(r#"{"action": "SKIP", "action_params": {"reason": "no records"}}"#.to_string())
        }

        async fn list_models(&self) -> Result<Vec<String>, LlmError> {
            Ok(vec!["model-a".to_string()])
        }
    }

    struct NoDocs;

    #[async_trait]
    impl DocumentProvider for NoDocs {
        async fn extract_text(&self, locator: &str) -> Result<String, ConversionError> {
            Err(ConversionError {
                locator: locator.to_string(),
                message: "not used in this test".into(),
            })
        }
    }

    fn completion(backend: SkippingBackend) -> CompletionClient<SkippingBackend> {
        let roster = Arc::new(ModelRoster::new(&["model-a".to_string()], &[]));
        CompletionClient::new(backend, roster, 1).with_backoff_base(Duration::ZERO)
    }

    fn options() -> DriverOptions {
        DriverOptions {
            lookback_days: 540,
            max_rounds: 8,
            max_doc_len: 6_000,
            limit: None,
        }
    }

    fn task(code: &str) -> TaskItem {
        TaskItem::new(
            CompanyCode::new(code),
            format!("公司{code}"),
            NaiveDate::from_ymd_opt(2015, 5, 20).unwrap(),
        )
    }

    #[test]
    fn test_load_tasks_with_chinese_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "股票代码,股票简称,退市日期").unwrap();
        writeln!(file, "601299,中国北车,2015-05-20").unwrap();
        writeln!(file, "38,深大通,2001/06/15").unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].code.as_str(), "601299");
        assert_eq!(tasks[0].name, "中国北车");
        assert_eq!(tasks[1].code.as_str(), "000038");
        assert_eq!(
            tasks[1].delist_date,
            NaiveDate::from_ymd_opt(2001, 6, 15).unwrap()
        );
    }

    #[test]
    fn test_load_tasks_rejects_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        std::fs::write(&path, "code,name\n601299,中国北车\n").unwrap();
        assert!(load_tasks(&path).is_err());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = CheckpointStore::open(dir.path().join("progress.json")).unwrap();
        for code in ["000001", "000002", "000003"] {
            checkpoints
                .mark_skipped(&CompanyCode::new(code), "prior run".into())
                .unwrap();
        }

        let source = EmptySource { failing: vec![] };
        let fetcher = ReconcilingFetcher::new(source, Duration::ZERO, 10);
        let client = completion(SkippingBackend {
            calls: Mutex::new(0),
        });
        let provider = NoDocs;
        let mut output = ResultWriter::open(&dir.path().join("out.csv")).unwrap();

        let tasks = vec![
            task("000001"),
            task("000002"),
            task("000003"),
            task("000004"),
            task("000005"),
        ];
        let mut driver =
            BatchDriver::new(&fetcher, &client, &provider, &mut checkpoints, options());
        let summary = driver.run(tasks, &mut output).await.unwrap();

        assert_eq!(summary.resumed, 3);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_localized_to_one_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = CheckpointStore::open(dir.path().join("progress.json")).unwrap();

        let source = EmptySource {
            failing: vec![CompanyCode::new("000001")],
        };
        let fetcher = ReconcilingFetcher::new(source, Duration::ZERO, 10);
        let client = completion(SkippingBackend {
            calls: Mutex::new(0),
        });
        let provider = NoDocs;
        let mut output = ResultWriter::open(&dir.path().join("out.csv")).unwrap();

        let tasks = vec![task("000001"), task("000002")];
        let mut driver =
            BatchDriver::new(&fetcher, &client, &provider, &mut checkpoints, options());
        let summary = driver.run(tasks, &mut output).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        // Failed items stay retryable across runs, and the in-progress mark
        // written at pickup is overwritten by the terminal status.
        assert!(!checkpoints.is_done(&CompanyCode::new("000001")));
        assert_eq!(
            checkpoints.status(&CompanyCode::new("000001")),
            crate::types::TaskStatus::Failed
        );
        assert!(checkpoints.is_done(&CompanyCode::new("000002")));
    }

    #[tokio::test]
    async fn test_limit_caps_newly_processed_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = CheckpointStore::open(dir.path().join("progress.json")).unwrap();

        let source = EmptySource { failing: vec![] };
        let fetcher = ReconcilingFetcher::new(source, Duration::ZERO, 10);
        let client = completion(SkippingBackend {
            calls: Mutex::new(0),
        });
        let provider = NoDocs;
        let mut output = ResultWriter::open(&dir.path().join("out.csv")).unwrap();

        let mut opts = options();
        opts.limit = Some(1);
        let tasks = vec![task("000001"), task("000002"), task("000003")];
        let mut driver = BatchDriver::new(&fetcher, &client, &provider, &mut checkpoints, opts);
        let summary = driver.run(tasks, &mut output).await.unwrap();

        assert_eq!(summary.processed, 1);
    }

    #[test]
    fn test_output_sheet_appends_without_duplicate_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let mut writer = ResultWriter::open(&path).unwrap();
        let mut item = task("601299");
        item.fields
            .insert("delist_type".into(), serde_json::json!("MERGE"));
        writer.append(&item, TaskStatus::Done).unwrap();
        drop(writer);

        let mut writer = ResultWriter::open(&path).unwrap();
        writer.append(&task("000038"), TaskStatus::Skipped).unwrap();
        drop(writer);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("delist_type").count(), 1); // header only once
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("601299"));
        assert!(content.contains("MERGE"));
        assert!(content.contains("000038"));
    }
}
