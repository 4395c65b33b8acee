//! Prompt construction for the extraction rounds.

use crate::types::{AnnouncementRecord, TaskItem};

/// Protocol and schema instructions, identical every round. Round-specific
/// material goes into the user prompt.
pub const SYSTEM_PROMPT: &str = r#"You are a financial-data analyst reconstructing the terminal event of a delisted Chinese A-share company from its exchange announcements. Announcement titles and documents are in Chinese.

Fill these fields (use "NaN" when a field does not apply):
- delist_type: one of MERGE (absorbed via share swap), RECODE (relisted under a new code, 1:1), VOLUNTARY, TENDER (delisted after a tender offer), FORCE_FIN (forced, financial criteria), FORCE_TRADE (forced, trading criteria), FORCE_FRAUD (forced, fraud), FORCE_NORM (forced, other rule violations)
- delist_reason: one sentence, in Chinese, citing the announcement it came from
- first_notice_date: YYYY-MM-DD, the publish date of the FIRST announcement that made the delisting outcome certain (board resolution passed, offer declared unconditional). Not the suspension notice, not the delisting day itself.
- successor_code: 6-digit code of the surviving/new security (MERGE and RECODE only)
- successor_name: name of the surviving/new security (MERGE and RECODE only)
- swap_ratio: "1:X.XXXX", shares of the successor received per delisted share (MERGE and RECODE only; RECODE is always "1:1")
- swap_completion_date: YYYY-MM-DD when swapped shares became tradable (MERGE and RECODE only)

Every reply must be a single JSON object, nothing else:
{
  "thought": "<your reasoning, brief>",
  "updated_state": { <fields you can now fill or correct, omit the rest> },
  "action": "READ_DOC" | "SEARCH_MORE" | "SUBMIT" | "SKIP",
  "action_params": { "announcement_id": "<id>" } | { "keyword": "<term>" } | { "reason": "<why>" }
}

Rules:
- READ_DOC fetches the full text of one listed announcement by its id. Prefer titles mentioning 换股 / 合并 / 吸收合并 / 要约 / 终止上市.
- SEARCH_MORE runs one extra title search when the listing seems to lack the decisive announcement.
- SUBMIT only when every applicable field is filled from document evidence.
- SKIP only when the decisive announcements demonstrably do not exist in the archive.
- Never guess values. A field you cannot evidence stays unset or "NaN"."#;

/// Per-round context delivered alongside the accumulated state.
pub struct RoundContext<'a> {
    /// Violations or action results carried over from the previous round,
    /// passed through verbatim.
    pub feedback: &'a [String],
    /// Document text obtained by the previous round's READ_DOC, if any.
    pub document: Option<&'a str>,
    pub round: u32,
    pub max_rounds: u32,
}

pub fn build_user_prompt(
    task: &TaskItem,
    announcements: &[AnnouncementRecord],
    ctx: &RoundContext<'_>,
) -> String {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str(&format!(
        "Company: {} ({}), delisted on {}. Round {} of {}.\n\n",
        task.name, task.code, task.delist_date, ctx.round, ctx.max_rounds
    ));

    prompt.push_str("Current extracted state:\n");
    let state = serde_json::to_string_pretty(&task.fields)
        .unwrap_or_else(|_| "{}".to_string());
    prompt.push_str(&state);
    prompt.push_str("\n\n");

    if !ctx.feedback.is_empty() {
        prompt.push_str("Problems with your previous round that you must address:\n");
        for line in ctx.feedback {
            prompt.push_str("- ");
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Available announcements ({}), newest last:\n",
        announcements.len()
    ));
    for record in announcements {
        prompt.push_str(&format!(
            "[{}] {} {}\n",
            record.id, record.publish_date, record.title
        ));
    }
    prompt.push('\n');

    if let Some(doc) = ctx.document {
        prompt.push_str("Document text from your READ_DOC request:\n---\n");
        prompt.push_str(doc);
        prompt.push_str("\n---\n\n");
    }

    prompt.push_str("Reply with one JSON object per the protocol.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnnouncementId, CompanyCode, PeriodType};
    use chrono::NaiveDate;

    fn task() -> TaskItem {
        TaskItem::new(
            CompanyCode::new("601299"),
            "中国北车",
            NaiveDate::from_ymd_opt(2015, 5, 20).unwrap(),
        )
    }

    fn record(id: &str, title: &str) -> AnnouncementRecord {
        AnnouncementRecord {
            id: AnnouncementId(id.to_string()),
            code: CompanyCode::new("601299"),
            company_name: "中国北车".to_string(),
            title: title.to_string(),
            publish_date: NaiveDate::from_ymd_opt(2014, 12, 31).unwrap(),
            period: PeriodType::Other,
            url: format!("http://static.example.com/{id}.pdf"),
        }
    }

    #[test]
    fn test_prompt_lists_announcements_and_state() {
        let mut task = task();
        task.fields.insert(
            "delist_type".into(),
            serde_json::Value::String("MERGE".into()),
        );
        let announcements = vec![record("1200135642", "关于换股合并的公告")];

        let prompt = build_user_prompt(
            &task,
            &announcements,
            &RoundContext {
                feedback: &[],
                document: None,
                round: 1,
                max_rounds: 8,
            },
        );

        assert!(prompt.contains("中国北车"));
        assert!(prompt.contains("1200135642"));
        assert!(prompt.contains("关于换股合并的公告"));
        assert!(prompt.contains("\"delist_type\": \"MERGE\""));
    }

    #[test]
    fn test_feedback_appears_verbatim() {
        let feedback = vec![
            "first_notice_date: required field is missing".to_string(),
            "swap_ratio: '0.5:1' does not match the 1:X.XXXX format".to_string(),
        ];
        let prompt = build_user_prompt(
            &task(),
            &[],
            &RoundContext {
                feedback: &feedback,
                document: None,
                round: 2,
                max_rounds: 8,
            },
        );

        for line in &feedback {
            assert!(prompt.contains(line.as_str()));
        }
    }

    #[test]
    fn test_document_block_included_when_present() {
        let prompt = build_user_prompt(
            &task(),
            &[],
            &RoundContext {
                feedback: &[],
                document: Some("换股比例为1:0.1339"),
                round: 3,
                max_rounds: 8,
            },
        );
        assert!(prompt.contains("换股比例为1:0.1339"));
    }
}
