use crate::probe::ProbeError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("model not found: {0}")]
    UnknownModel(String),

    #[error("a model switch is already in progress")]
    ResourceBusy,

    #[error(
        "insufficient GPU memory: {required_gb:.1}GB required, {available_gb:.1}GB available, {freed_gb:.1}GB freeable"
    )]
    InsufficientMemory {
        required_gb: f64,
        available_gb: f64,
        freed_gb: f64,
    },

    #[error("process control failed for {model}: {source}")]
    ProcessControl {
        model: String,
        #[source]
        source: ProbeError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn process_control(model: impl Into<String>, source: ProbeError) -> Self {
        Self::ProcessControl {
            model: model.into(),
            source,
        }
    }
}
