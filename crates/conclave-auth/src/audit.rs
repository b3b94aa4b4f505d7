use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conclave_crypto::{decrypt_with_password, encrypt_with_password, hmac_sha256_hex, EncryptedPayload};
use conclave_types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_event_id: Option<String>,
    pub hmac: String,
}

/// Everything the caller supplies; ids, chaining, and the HMAC are filled in
/// by the log.
#[derive(Debug, Clone, Default)]
pub struct AuditEventInput {
    pub event_type: String,
    pub severity: Option<AuditSeverity>,
    pub user_id: Option<String>,
    pub resource: Option<ResourceRef>,
    pub action: Option<String>,
    pub result: Option<AuditResult>,
    pub source: Option<String>,
    pub details: Option<Value>,
    pub error: Option<String>,
}

impl AuditEventInput {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource = Some(ResourceRef {
            resource_type: resource_type.into(),
            id: id.into(),
        });
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failure(mut self, error: impl Into<String>) -> Self {
        self.result = Some(AuditResult::Failure);
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    pub max_entries: usize,
    /// Live entries roll into an archive block at this size.
    pub archive_after: usize,
    pub min_severity: AuditSeverity,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            archive_after: 5_000,
            min_severity: AuditSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<String>,
    pub min_severity: Option<AuditSeverity>,
    pub user_id: Option<String>,
    pub resource_type: Option<String>,
    pub result: Option<AuditResult>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    /// Event ids whose HMAC or chain link failed.
    pub broken: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExportDoc {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub events: Vec<AuditEvent>,
    #[serde(default)]
    pub archived: Vec<Vec<AuditEvent>>,
}

struct Inner {
    events: VecDeque<AuditEvent>,
    archived: Vec<Vec<AuditEvent>>,
    last_event_id: Option<String>,
}

/// Append-only HMAC-chained audit log. The whole append (id assignment,
/// chain link, HMAC, push) happens under one lock so the chain is strictly
/// serialized.
pub struct AuditLog {
    key: Vec<u8>,
    config: AuditLogConfig,
    inner: Mutex<Inner>,
}

impl AuditLog {
    pub fn new(key: impl Into<Vec<u8>>, config: AuditLogConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                archived: Vec::new(),
                last_event_id: None,
            }),
        }
    }

    fn canonical_string(event: &AuditEvent) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            event.id,
            event.event_type,
            event.timestamp.timestamp_millis(),
            event.user_id.as_deref().unwrap_or(""),
            event.result.as_str(),
            event.previous_event_id.as_deref().unwrap_or(""),
            event
                .details
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "null".to_string()),
        )
    }

    fn compute_hmac(&self, event: &AuditEvent) -> String {
        hmac_sha256_hex(&self.key, Self::canonical_string(event).as_bytes())
    }

    /// Returns the assigned event id, or None when the severity floor
    /// filtered the entry.
    pub fn log(&self, input: AuditEventInput) -> Option<String> {
        let severity = input.severity.unwrap_or(AuditSeverity::Info);
        if severity < self.config.min_severity {
            return None;
        }
        let mut inner = self.inner.lock().expect("audit log poisoned");
        let mut event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            event_type: input.event_type,
            severity,
            timestamp: Utc::now(),
            user_id: input.user_id,
            resource: input.resource,
            action: input.action,
            result: input.result.unwrap_or(AuditResult::Success),
            source: input.source,
            details: input.details,
            error: input.error,
            previous_event_id: inner.last_event_id.clone(),
            hmac: String::new(),
        };
        event.hmac = self.compute_hmac(&event);
        let id = event.id.clone();
        inner.last_event_id = Some(id.clone());
        inner.events.push_back(event);

        if inner.events.len() >= self.config.archive_after {
            let block: Vec<AuditEvent> = inner.events.drain(..).collect();
            inner.archived.push(block);
        }
        // Ring bound: shed the oldest archive blocks beyond the cap.
        loop {
            let total: usize =
                inner.events.len() + inner.archived.iter().map(Vec::len).sum::<usize>();
            if total <= self.config.max_entries || inner.archived.is_empty() {
                break;
            }
            inner.archived.remove(0);
        }
        Some(id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("audit log poisoned");
        inner.events.len() + inner.archived.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let inner = self.inner.lock().expect("audit log poisoned");
        inner
            .archived
            .iter()
            .flatten()
            .chain(inner.events.iter())
            .filter(|event| {
                if let Some(event_type) = &query.event_type {
                    if &event.event_type != event_type {
                        return false;
                    }
                }
                if let Some(min) = query.min_severity {
                    if event.severity < min {
                        return false;
                    }
                }
                if let Some(user_id) = &query.user_id {
                    if event.user_id.as_ref() != Some(user_id) {
                        return false;
                    }
                }
                if let Some(resource_type) = &query.resource_type {
                    match &event.resource {
                        Some(resource) if &resource.resource_type == resource_type => {}
                        _ => return false,
                    }
                }
                if let Some(result) = query.result {
                    if event.result != result {
                        return false;
                    }
                }
                if let Some(from) = query.from {
                    if event.timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = query.to {
                    if event.timestamp > to {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Recompute every HMAC and re-walk the chain.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let inner = self.inner.lock().expect("audit log poisoned");
        let ordered: Vec<&AuditEvent> = inner
            .archived
            .iter()
            .flatten()
            .chain(inner.events.iter())
            .collect();
        verify_events(&self.key, &ordered)
    }

    pub fn export(&self) -> AuditExportDoc {
        let inner = self.inner.lock().expect("audit log poisoned");
        AuditExportDoc {
            version: 1,
            exported_at: Utc::now(),
            events: inner.events.iter().cloned().collect(),
            archived: inner.archived.clone(),
        }
    }

    pub fn export_encrypted(&self, password: &str) -> Result<EncryptedPayload> {
        let doc = self.export();
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| Error::Internal(format!("audit export serialization failed: {e}")))?;
        encrypt_with_password(&bytes, password)
    }

    /// Replace the log contents with an export after verifying it. A failed
    /// verification aborts the import, records a Critical event, and lists
    /// the broken event ids.
    pub fn import(&self, doc: AuditExportDoc) -> Result<()> {
        if doc.version != 1 {
            return Err(Error::InvalidInput(format!(
                "unsupported audit export version {}",
                doc.version
            )));
        }
        let ordered: Vec<&AuditEvent> = doc
            .archived
            .iter()
            .flatten()
            .chain(doc.events.iter())
            .collect();
        let report = verify_events(&self.key, &ordered);
        if !report.valid {
            let broken = report.broken.join(", ");
            self.log(
                AuditEventInput::new("audit.import.rejected")
                    .severity(AuditSeverity::Critical)
                    .failure(format!("HMAC verification failed for: {broken}")),
            );
            return Err(Error::Integrity(format!(
                "audit import rejected; events failing HMAC verification: {broken}"
            )));
        }

        let mut inner = self.inner.lock().expect("audit log poisoned");
        inner.last_event_id = doc
            .events
            .last()
            .or_else(|| doc.archived.iter().flatten().last())
            .map(|event| event.id.clone());
        inner.events = doc.events.into();
        inner.archived = doc.archived;
        Ok(())
    }

    pub fn import_encrypted(&self, payload: &EncryptedPayload, password: &str) -> Result<()> {
        let bytes = decrypt_with_password(payload, password)?;
        let doc: AuditExportDoc = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInput(format!("invalid audit export: {e}")))?;
        self.import(doc)
    }
}

fn verify_events(key: &[u8], ordered: &[&AuditEvent]) -> IntegrityReport {
    let mut broken = Vec::new();
    let mut previous: Option<&str> = None;
    for (index, event) in ordered.iter().enumerate() {
        let mut copy = (*event).clone();
        copy.hmac = String::new();
        let expected = hmac_sha256_hex(key, AuditLog::canonical_string(&copy).as_bytes());
        // The oldest retained event may point at an entry the ring already
        // shed, so only interior links are checked.
        let chain_ok = index == 0 || event.previous_event_id.as_deref() == previous;
        if expected != event.hmac || !chain_ok {
            broken.push(event.id.clone());
        }
        previous = Some(event.id.as_str());
    }
    IntegrityReport {
        valid: broken.is_empty(),
        broken,
    }
}
