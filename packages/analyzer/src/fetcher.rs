//! Reconciling fetcher.
//!
//! The upstream listing is served by multiple backend nodes that disagree
//! with each other: the declared total count fluctuates between requests
//! and a stale page count can hide the true last page. Treating any single
//! response as authoritative silently loses or duplicates records.
//!
//! The fetcher therefore runs full passes over all pages, driven only by
//! the per-page "more pages" flag, unions records across passes keyed by
//! announcement id, and converges when the unique count equals the maximum
//! total-count hint observed anywhere. Non-convergence within the pass
//! budget is a hard integrity failure, never a partial result.

use crate::error::FetchError;
use crate::source::{AnnouncementQuery, AnnouncementSource};
use crate::types::{AnnouncementId, AnnouncementRecord};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accumulated reconciliation state across passes.
struct PassState {
    seen: BTreeMap<AnnouncementId, AnnouncementRecord>,
    max_hint: usize,
}

/// Fetcher that reconciles an inconsistent paginated source into a
/// complete, deduplicated record set.
pub struct ReconcilingFetcher<S> {
    source: S,
    page_delay: Duration,
    max_passes: u32,
}

impl<S: AnnouncementSource> ReconcilingFetcher<S> {
    pub fn new(source: S, page_delay: Duration, max_passes: u32) -> Self {
        Self {
            source,
            page_delay,
            max_passes,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch the complete record set for one query.
    ///
    /// Returns records sorted by publish date then id, so identical sources
    /// yield identical output across runs.
    pub async fn fetch_all(
        &self,
        query: &AnnouncementQuery,
    ) -> Result<Vec<AnnouncementRecord>, FetchError> {
        let mut state = PassState {
            seen: BTreeMap::new(),
            max_hint: 0,
        };

        for pass in 1..=self.max_passes {
            self.run_pass(query, &mut state).await?;

            let unique = state.seen.len();

            if state.max_hint == 0 && state.seen.is_empty() {
                debug!(company = %query.code, "source reports no announcements");
                return Ok(Vec::new());
            }

            if unique > state.max_hint {
                // More unique records than the source ever claimed to hold:
                // the id space itself is inconsistent and no number of
                // passes can fix that.
                return Err(FetchError::Integrity {
                    company: query.code.to_string(),
                    unique,
                    max_hint: state.max_hint,
                    passes: pass as usize,
                });
            }

            if unique == state.max_hint {
                if pass > 1 {
                    info!(
                        company = %query.code,
                        pass,
                        unique,
                        "record set complete after additional passes"
                    );
                }
                let mut records: Vec<_> = state.seen.into_values().collect();
                records.sort_by(|a, b| {
                    (a.publish_date, &a.id).cmp(&(b.publish_date, &b.id))
                });
                return Ok(records);
            }

            warn!(
                company = %query.code,
                pass,
                unique,
                max_hint = state.max_hint,
                missing = state.max_hint - unique,
                "pass incomplete, retrying"
            );
            tokio::time::sleep(self.page_delay).await;
        }

        Err(FetchError::Integrity {
            company: query.code.to_string(),
            unique: state.seen.len(),
            max_hint: state.max_hint,
            passes: self.max_passes as usize,
        })
    }

    /// One full traversal of all pages. Traversal is driven by the
    /// "more pages" flag alone; the total hint is only recorded.
    async fn run_pass(
        &self,
        query: &AnnouncementQuery,
        state: &mut PassState,
    ) -> Result<(), FetchError> {
        let mut page_num = 1;
        let mut seen_this_pass: HashSet<AnnouncementId> = HashSet::new();

        loop {
            let page = self.source.fetch_page(query, page_num).await?;

            state.max_hint = state.max_hint.max(page.total_hint);

            if page.records.is_empty() {
                break;
            }

            let page_ids: HashSet<AnnouncementId> =
                page.records.iter().map(|r| r.id.clone()).collect();

            for record in page.records {
                state.seen.entry(record.id.clone()).or_insert(record);
            }

            // A page made up entirely of ids already seen in this pass means
            // the pagination is cycling; finish the pass instead of looping.
            if page_ids.is_subset(&seen_this_pass) {
                debug!(company = %query.code, page = page_num, "page fully duplicated, ending pass");
                break;
            }
            seen_this_pass.extend(page_ids);

            if !page.has_more {
                break;
            }

            page_num += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(())
    }
}
