use super::{stamp, InstanceHeader, InstanceLog, LogEntry, LogRecord};
use crate::error::{Result, WorkflowError};
use crate::template::WorkflowTemplate;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// In-process log, used by tests and by embedders that do not need
/// durability.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<HashMap<Uuid, (InstanceHeader, Vec<LogEntry>)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceLog for MemoryLog {
    fn create(&self, header: &InstanceHeader, template: &WorkflowTemplate) -> Result<LogEntry> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let started = LogRecord::Started {
            template: template.clone(),
        };
        let mut entries = stamp(header.id, 1, vec![started]);
        let entry = entries.remove(0);
        inner.insert(header.id, (header.clone(), vec![entry.clone()]));
        Ok(entry)
    }

    fn append(&self, instance: Uuid, records: Vec<LogRecord>) -> Result<Vec<LogEntry>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (_, log) = inner
            .get_mut(&instance)
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance.to_string()))?;
        let next = log.last().map_or(1, |e| e.seq + 1);
        let entries = stamp(instance, next, records);
        log.extend(entries.iter().cloned());
        Ok(entries)
    }

    fn entries(&self, instance: Uuid) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&instance)
            .map(|(_, log)| log.clone())
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance.to_string()))
    }

    fn instances(&self) -> Result<Vec<InstanceHeader>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut headers: Vec<InstanceHeader> = inner.values().map(|(h, _)| h.clone()).collect();
        headers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(headers)
    }
}
