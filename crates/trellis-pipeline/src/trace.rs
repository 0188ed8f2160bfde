use serde::Serialize;

/// One diagnostic line emitted by a pipeline stage. Collected for the
/// context-preview report; never interpreted by the pipeline itself.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub stage: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceBuffer {
    events: Vec<TraceEvent>,
}

impl TraceBuffer {
    pub fn push(&mut self, stage: &'static str, detail: impl Into<String>) {
        self.events.push(TraceEvent {
            stage,
            detail: detail.into(),
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
