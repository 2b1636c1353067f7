use crate::domain::{EventSeverity, EventType};

/// Narrowing criteria for `EventBus::poll`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events with sequence strictly after this one.
    pub since: Option<u64>,
    pub types: Option<Vec<EventType>>,
    pub severities: Option<Vec<EventSeverity>>,
    pub task_id: Option<String>,
    pub prd_id: Option<String>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn since(seq: u64) -> Self {
        Self {
            since: Some(seq),
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: Vec<EventType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_severities(mut self, severities: Vec<EventSeverity>) -> Self {
        self.severities = Some(severities);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_prd_id(mut self, prd_id: impl Into<String>) -> Self {
        self.prd_id = Some(prd_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
