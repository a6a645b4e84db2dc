//! Refusal reasons for queue admission

use thiserror::Error;

use crate::providers::SourceKey;
use crate::queue::task::ActionKind;

/// Why a factory declined to enqueue a task.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("show {key} is already tracked")]
    AlreadyTracked { key: SourceKey },

    #[error("show {key} is not tracked")]
    UnknownShow { key: SourceKey },

    #[error("an add for {key} is already queued")]
    AlreadyAdding { key: SourceKey },

    #[error("{kind} for {key} is already queued")]
    AlreadyQueued { kind: ActionKind, key: SourceKey },

    #[error("a source switch for {key} is pending; {kind} is not allowed until it settles")]
    SwitchPending { kind: ActionKind, key: SourceKey },

    #[error("{kind} for {key} is queued or running; a source switch is not allowed until it finishes")]
    ActionInProgress { kind: ActionKind, key: SourceKey },

    #[error("another pending switch already targets {target}")]
    DuplicateSwitch { target: SourceKey },

    #[error("no pending source switch found for {key}")]
    UnknownSwitch { key: SourceKey },

    #[error("a watched-state sync is already queued or running")]
    SyncInFlight,

    #[error("failed to persist queue state")]
    Persist(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Source;

    #[test]
    fn test_messages_name_the_show() {
        let key = SourceKey::new(Source::TvMaze, 82);
        let err = QueueError::SwitchPending {
            kind: ActionKind::Update,
            key,
        };
        let message = err.to_string();
        assert!(message.contains("tvmaze:82"));
        assert!(message.contains("update"));
    }
}
