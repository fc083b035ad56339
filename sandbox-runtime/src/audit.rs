//! Append-only audit trail of gateway-mediated requests.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::util::{now_ts, truncate_chars};

/// Prompts are stored truncated to this many characters.
pub const AUDIT_PROMPT_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub agent_id: String,
    pub timestamp: u64,
    pub prompt: String,
    pub tokens_used: u64,
    pub success: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(
        agent_id: &str,
        prompt: &str,
        model: &str,
        tokens_used: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            timestamp: now_ts(),
            prompt: truncate_chars(prompt, AUDIT_PROMPT_CHARS),
            tokens_used,
            success: error.is_none(),
            model: model.to_string(),
            error,
        }
    }
}

/// Capped ring of audit records; the oldest entry is evicted first.
pub struct AuditLog {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, record: AuditRecord) {
        if record.success {
            tracing::debug!(agent_id = %record.agent_id, tokens = record.tokens_used, model = %record.model, "audit");
        } else {
            tracing::warn!(
                agent_id = %record.agent_id,
                model = %record.model,
                error = record.error.as_deref().unwrap_or_default(),
                "audit: request failed"
            );
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent `n` records, newest last.
    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn for_agent(&self, agent_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
