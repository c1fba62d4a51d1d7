use std::time::Duration;

/// MessageBusError はメッセージバス操作に関するエラーを表す。
#[derive(Debug, thiserror::Error)]
pub enum MessageBusError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("publish failed (code {code}): {reason}")]
    PublishFailed { code: i32, reason: String },

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("request cancelled")]
    RequestCancelled,

    #[error("handler fault: {0}")]
    HandlerFaulted(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("bus is shut down")]
    BusShutdown,
}

impl MessageBusError {
    /// エラーコード不明のトランスポート障害から PublishFailed を生成する。
    pub fn publish_failed(reason: impl Into<String>) -> Self {
        Self::PublishFailed {
            code: -1,
            reason: reason.into(),
        }
    }
}
