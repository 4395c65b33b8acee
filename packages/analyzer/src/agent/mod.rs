//! Bounded extraction-validation-correction loop.
//!
//! One loop run handles one delisted company. Each round sends the
//! accumulated state plus round context to a model, merges the proposed
//! state update, validates deterministically, and either terminates or
//! carries feedback into the next round. The round budget bounds cost per
//! item regardless of model behavior.

mod prompt;
mod reply;
mod validate;

pub use prompt::{build_user_prompt, RoundContext, SYSTEM_PROMPT};
pub use reply::{AgentAction, ModelReply};
pub use validate::{validate, Violation, DELIST_TYPES};

use crate::completion::{ChatBackend, CompletionClient};
use crate::error::{CompletionError, FetchError};
use crate::provider::{slice_by_keywords, DocumentProvider};
use crate::types::{AnnouncementId, AnnouncementRecord, ExtractionOutcome, TaskItem};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Follow-up keyword search capability, backed by the reconciling fetcher
/// in production.
#[async_trait]
pub trait AnnouncementSearcher: Send + Sync {
    async fn search(&self, keyword: &str) -> Result<Vec<AnnouncementRecord>, FetchError>;
}

/// Loop phase. Terminal variants carry what the caller needs; working
/// variants carry what the next round needs.
#[derive(Debug)]
enum LoopState {
    Drafting {
        feedback: Vec<String>,
        document: Option<String>,
    },
    /// Transient phase between merging a proposed state and deciding where
    /// the round lands.
    Validating {
        submit: bool,
    },
    Correcting {
        violations: Vec<Violation>,
    },
    Submitted,
    Skipped {
        reason: String,
    },
    Exhausted,
}

impl LoopState {
    fn name(&self) -> &'static str {
        match self {
            LoopState::Drafting { .. } => "drafting",
            LoopState::Validating { .. } => "validating",
            LoopState::Correcting { .. } => "correcting",
            LoopState::Submitted => "submitted",
            LoopState::Skipped { .. } => "skipped",
            LoopState::Exhausted => "exhausted",
        }
    }

    /// Resolve the VALIDATING phase against the checker's verdict.
    ///
    /// A clean SUBMIT terminates; any violation enters correction; a clean
    /// non-submit round simply drafts on.
    fn after_validation(self, violations: Vec<Violation>) -> LoopState {
        let submit = matches!(self, LoopState::Validating { submit: true });
        match (submit, violations.is_empty()) {
            (true, true) => LoopState::Submitted,
            (_, false) => LoopState::Correcting { violations },
            (false, true) => LoopState::Drafting {
                feedback: Vec::new(),
                document: None,
            },
        }
    }

    /// Collapse a post-validation state into feedback lines for the next
    /// round. Violations are rendered verbatim.
    fn into_feedback(self) -> Vec<String> {
        match self {
            LoopState::Correcting { violations } => {
                violations.iter().map(|v| v.to_string()).collect()
            }
            LoopState::Drafting { feedback, .. } => feedback,
            _ => Vec::new(),
        }
    }
}

pub struct AgentLoop<'a, B, P, F> {
    completion: &'a CompletionClient<B>,
    provider: &'a P,
    searcher: &'a F,
    max_rounds: u32,
    max_doc_len: usize,
}

impl<'a, B, P, F> AgentLoop<'a, B, P, F>
where
    B: ChatBackend,
    P: DocumentProvider,
    F: AnnouncementSearcher,
{
    pub fn new(
        completion: &'a CompletionClient<B>,
        provider: &'a P,
        searcher: &'a F,
        max_rounds: u32,
        max_doc_len: usize,
    ) -> Self {
        Self {
            completion,
            provider,
            searcher,
            max_rounds: max_rounds.max(1),
            max_doc_len,
        }
    }

    /// Run the loop for one company.
    ///
    /// Only an empty model roster aborts the run; every other failure mode
    /// consumes a round and continues. When the budget runs out the partial
    /// state is returned, never discarded.
    pub async fn run(
        &self,
        task: &mut TaskItem,
        announcements: Vec<AnnouncementRecord>,
    ) -> Result<ExtractionOutcome, CompletionError> {
        // No fact may come from a document published on or after the
        // delisting date; look-ahead documents never reach the prompt.
        let mut pool = filter_and_index(announcements, task);

        let mut state = LoopState::Drafting {
            feedback: Vec::new(),
            document: None,
        };

        for round in 1..=self.max_rounds {
            // Rounds only start from a drafting or correcting state;
            // anything else means the loop is finished.
            let (feedback, document) = match state {
                LoopState::Drafting { feedback, document } => (feedback, document),
                LoopState::Correcting { violations } => {
                    (violations.iter().map(|v| v.to_string()).collect(), None)
                }
                _ => break,
            };

            let ctx = RoundContext {
                feedback: &feedback,
                document: document.as_deref(),
                round,
                max_rounds: self.max_rounds,
            };
            let records: Vec<&AnnouncementRecord> = pool.values().collect();
            let user_prompt = build_user_prompt_from_refs(task, &records, &ctx);

            let (model, value) = match self.completion.complete_failover(SYSTEM_PROMPT, &user_prompt).await
            {
                Ok(ok) => ok,
                Err(CompletionError::NoModels) => return Err(CompletionError::NoModels),
                Err(e) => {
                    warn!(company = %task.code, round, error = %e, "round produced no reply");
                    state = LoopState::Drafting { feedback, document };
                    continue;
                }
            };

            let reply = match ModelReply::from_value(value) {
                Ok(reply) => reply,
                Err(e) => {
                    state = LoopState::Drafting {
                        feedback: vec![format!("ERROR: {e}")],
                        document: None,
                    };
                    continue;
                }
            };

            if let Some(thought) = reply.thought.as_deref() {
                debug!(company = %task.code, round, model = %model, thought, "model round");
            }

            let proposed_update = reply
                .updated_state
                .as_ref()
                .map(|m| !m.is_empty())
                .unwrap_or(false);
            if let Some(updated) = &reply.updated_state {
                task.merge_fields(updated);
            }

            let action = match reply.action() {
                Ok(action) => action,
                Err(e) => {
                    state = LoopState::Drafting {
                        feedback: vec![format!("ERROR: {e}")],
                        document: None,
                    };
                    continue;
                }
            };

            let submit = matches!(action, AgentAction::Submit);
            state = if proposed_update || submit {
                let validating = LoopState::Validating { submit };
                validating.after_validation(validate(&task.fields, task.delist_date))
            } else {
                LoopState::Drafting {
                    feedback: Vec::new(),
                    document: None,
                }
            };

            state = match action {
                AgentAction::Submit => match state {
                    LoopState::Submitted => {
                        info!(company = %task.code, round, model = %model, "submission accepted");
                        LoopState::Submitted
                    }
                    rejected => {
                        info!(
                            company = %task.code,
                            round,
                            state = rejected.name(),
                            "submission rejected, entering correction"
                        );
                        rejected
                    }
                },
                AgentAction::Skip { reason } => LoopState::Skipped { reason },
                AgentAction::ReadDoc { announcement_id } => {
                    let mut feedback = state.into_feedback();
                    let document = self
                        .read_document(task, &pool, &announcement_id, &mut feedback)
                        .await;
                    LoopState::Drafting { feedback, document }
                }
                AgentAction::SearchMore { keyword } => {
                    let mut feedback = state.into_feedback();
                    self.search_more(task, &mut pool, &keyword, &mut feedback)
                        .await;
                    LoopState::Drafting {
                        feedback,
                        document: None,
                    }
                }
            };

            match state {
                LoopState::Submitted => {
                    return Ok(ExtractionOutcome::Submitted {
                        fields: task.fields.clone(),
                    })
                }
                LoopState::Skipped { reason } => {
                    info!(company = %task.code, round, reason = %reason, "company skipped");
                    return Ok(ExtractionOutcome::Skipped { reason });
                }
                ref next => debug!(company = %task.code, round, state = next.name(), "round complete"),
            }
        }

        state = LoopState::Exhausted;
        warn!(
            company = %task.code,
            rounds = self.max_rounds,
            state = state.name(),
            fields = task.fields.len(),
            "round budget exhausted, keeping partial state"
        );
        Ok(ExtractionOutcome::Exhausted {
            partial: task.fields.clone(),
        })
    }

    /// Resolve a READ_DOC request into sliced document text, or feedback
    /// when the document cannot be served.
    async fn read_document(
        &self,
        task: &mut TaskItem,
        pool: &BTreeMap<AnnouncementId, AnnouncementRecord>,
        announcement_id: &str,
        feedback: &mut Vec<String>,
    ) -> Option<String> {
        let Some(record) = pool.get(&AnnouncementId(announcement_id.to_string())) else {
            feedback.push(format!(
                "ERROR: announcement id '{announcement_id}' is not in the listed set"
            ));
            return None;
        };

        match self.provider.extract_text(&record.url).await {
            Ok(text) => {
                // Record provenance alongside the extracted facts.
                task.fields.insert(
                    "source_title".to_string(),
                    serde_json::Value::String(record.title.clone()),
                );
                task.fields.insert(
                    "source_url".to_string(),
                    serde_json::Value::String(record.url.clone()),
                );
                Some(slice_by_keywords(&text, self.max_doc_len))
            }
            Err(e) => {
                warn!(company = %task.code, announcement = %announcement_id, error = %e, "document unavailable");
                feedback.push(format!(
                    "ERROR: document '{announcement_id}' is unavailable ({e}); choose another announcement"
                ));
                None
            }
        }
    }

    /// Resolve a SEARCH_MORE request, merging date-admissible hits into the
    /// working pool.
    async fn search_more(
        &self,
        task: &TaskItem,
        pool: &mut BTreeMap<AnnouncementId, AnnouncementRecord>,
        keyword: &str,
        feedback: &mut Vec<String>,
    ) {
        match self.searcher.search(keyword).await {
            Ok(hits) => {
                let mut added = 0usize;
                for record in hits {
                    if record.publish_date >= task.delist_date {
                        continue;
                    }
                    if pool.insert(record.id.clone(), record).is_none() {
                        added += 1;
                    }
                }
                info!(company = %task.code, keyword, added, "keyword search merged");
                feedback.push(format!(
                    "SEARCH_RESULT: keyword '{keyword}' added {added} new announcements to the list"
                ));
            }
            Err(e) => {
                warn!(company = %task.code, keyword, error = %e, "keyword search failed");
                feedback.push(format!("ERROR: keyword search '{keyword}' failed ({e})"));
            }
        }
    }
}

/// Drop look-ahead records and index by id for stable ordering and O(log n)
/// READ_DOC lookup.
fn filter_and_index(
    announcements: Vec<AnnouncementRecord>,
    task: &TaskItem,
) -> BTreeMap<AnnouncementId, AnnouncementRecord> {
    let total = announcements.len();
    let pool: BTreeMap<AnnouncementId, AnnouncementRecord> = announcements
        .into_iter()
        .filter(|r| r.publish_date < task.delist_date)
        .map(|r| (r.id.clone(), r))
        .collect();
    if pool.len() < total {
        debug!(
            company = %task.code,
            dropped = total - pool.len(),
            "look-ahead announcements excluded"
        );
    }
    pool
}

fn build_user_prompt_from_refs(
    task: &TaskItem,
    records: &[&AnnouncementRecord],
    ctx: &RoundContext<'_>,
) -> String {
    let mut owned: Vec<AnnouncementRecord> = records.iter().map(|r| (*r).clone()).collect();
    owned.sort_by(|a, b| (a.publish_date, &a.id).cmp(&(b.publish_date, &b.id)));
    build_user_prompt(task, &owned, ctx)
}
