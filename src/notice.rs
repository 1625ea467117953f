//! User-visible notices.
//!
//! Failures in this crate never propagate to the host. They end up as a state
//! value plus, optionally, one of these notices on the [`NoticeBus`].

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// Classification of a failure surfaced to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Probe, join or read timed out or the adapter failed. Retried on the next poll.
    TransientNetwork,
    /// The device rejected a file operation. Not retried.
    DeviceCommand,
    /// Durable write or read failed. In-memory state is kept.
    Persistence,
    /// No wireless adapter. Connectivity degrades to IP probing.
    ConfigurationMissing,
}

impl FailureKind {
    fn level(self) -> NoticeLevel {
        match self {
            FailureKind::TransientNetwork | FailureKind::Persistence => NoticeLevel::Warning,
            FailureKind::DeviceCommand => NoticeLevel::Error,
            FailureKind::ConfigurationMissing => NoticeLevel::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub kind: Option<FailureKind>,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            kind: None,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            kind: None,
            message: message.into(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            level: kind.level(),
            kind: Some(kind),
            message: message.into(),
        }
    }
}

/// Fan-out of notices to whoever displays them.
#[derive(Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(Self::CAPACITY)
    }
}

impl NoticeBus {
    const CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Log and broadcast a notice. Having no subscriber is not an error.
    pub fn publish(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => error!("{}", notice.message),
            NoticeLevel::Warning => warn!("{}", notice.message),
            NoticeLevel::Success | NoticeLevel::Info => info!("{}", notice.message),
        }

        let _ = self.tx.send(notice);
    }
}
