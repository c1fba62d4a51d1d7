//! rdkafka FutureProducer を使ったレコード送出。

use std::time::Duration;

use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::error::MessageBusError;
use crate::transport::OutboundRecord;

use super::config::KafkaSettings;

/// KafkaBusProducer は全発行呼び出しで共有されるプロデューサーラッパー。
/// キー・パーティションは OutboundRecord の内容をそのまま反映し、
/// パーティション未指定の場合はブローカー側のパーティショナーに委譲する。
pub(crate) struct KafkaBusProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaBusProducer {
    /// 新しい KafkaBusProducer を作成する。
    pub(crate) fn new(settings: &KafkaSettings) -> Result<Self, MessageBusError> {
        let mut config = settings.base_client_config();
        config.set("message.timeout.ms", settings.message_timeout_ms.to_string());
        config.set("acks", "all");

        let producer: FutureProducer = config
            .create()
            .map_err(|e| MessageBusError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            producer,
            message_timeout: Duration::from_millis(settings.message_timeout_ms),
        })
    }

    /// レコードを送出して配送レポートを待つ。
    pub(crate) async fn publish(&self, record: OutboundRecord) -> Result<(), MessageBusError> {
        let mut future_record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&record.topic).payload(&record.payload);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if record.partition >= 0 {
            future_record = future_record.partition(record.partition);
        }
        if !record.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                });
            }
            future_record = future_record.headers(headers);
        }

        self.producer
            .send(future_record, self.message_timeout)
            .await
            .map_err(|(err, _)| MessageBusError::PublishFailed {
                code: err.rdkafka_error_code().map(|c| c as i32).unwrap_or(-1),
                reason: err.to_string(),
            })?;

        Ok(())
    }

    /// 未配送のレコードをフラッシュする。
    pub(crate) fn flush(&self) -> Result<(), MessageBusError> {
        use rdkafka::producer::Producer;
        self.producer
            .flush(Duration::from_secs(5))
            .map_err(|e| MessageBusError::publish_failed(e.to_string()))
    }
}
