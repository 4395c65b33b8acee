//! Model reply protocol.
//!
//! Every round the model must answer with one JSON object:
//!
//! ```json
//! {
//!   "thought": "...",
//!   "updated_state": { "delist_type": "MERGE", ... },
//!   "action": "READ_DOC",
//!   "action_params": { "announcement_id": "1200135642" }
//! }
//! ```
//!
//! Parsing is deliberately forgiving about extras and strict about the
//! action contract; a reply that names no usable action is reported back to
//! the model instead of crashing the round.

use serde::Deserialize;
use serde_json::Value;

/// Raw reply shape as deserialized from the completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelReply {
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub updated_state: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_params: Option<Value>,
}

/// Action the model chose for this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    /// Request the text of one announcement by id.
    ReadDoc { announcement_id: String },
    /// Request an additional keyword search against the source.
    SearchMore { keyword: String },
    /// Declare the accumulated state complete.
    Submit,
    /// Declare the information unobtainable for this company.
    Skip { reason: String },
}

impl ModelReply {
    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| format!("reply is not a valid object: {e}"))
    }

    /// Resolve the declared action, validating its parameters.
    pub fn action(&self) -> Result<AgentAction, String> {
        let param = |key: &str| -> Option<String> {
            self.action_params
                .as_ref()
                .and_then(|p| p.get(key))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        match self.action.as_deref().map(str::trim) {
            Some("READ_DOC") => param("announcement_id")
                .map(|announcement_id| AgentAction::ReadDoc { announcement_id })
                .ok_or_else(|| "READ_DOC requires action_params.announcement_id".to_string()),
            Some("SEARCH_MORE") => param("keyword")
                .map(|keyword| AgentAction::SearchMore { keyword })
                .ok_or_else(|| "SEARCH_MORE requires action_params.keyword".to_string()),
            Some("SUBMIT") => Ok(AgentAction::Submit),
            Some("SKIP") => Ok(AgentAction::Skip {
                reason: param("reason").unwrap_or_else(|| "no reason given".to_string()),
            }),
            Some(other) => Err(format!(
                "unknown action '{other}', expected READ_DOC, SEARCH_MORE, SUBMIT or SKIP"
            )),
            None => Err("reply declares no action".to_string()),
        }
    }
}
