//! Kafka トランスポート。
//!
//! 共有プロデューサーとグループ単位のコンシューマードライバーを所有し、
//! オフセットは明示的コミットのみで前進する（auto commit は無効）。

mod config;
mod consumer;
mod producer;

pub use config::{KafkaSettings, KafkaSettingsBuilder, SaslSettings};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::MessageBusError;
use crate::processor::GroupConsumerPlan;
use crate::transport::{MessageTransport, OutboundRecord};

use consumer::KafkaGroupConsumer;
use producer::KafkaBusProducer;

/// KafkaTransport はバスの Kafka 実装。プロデューサーは構築時に 1 度
/// だけ作成され、全発行呼び出しで共有される。
pub(crate) struct KafkaTransport {
    producer: KafkaBusProducer,
    consumers: Mutex<Vec<Arc<KafkaGroupConsumer>>>,
}

impl KafkaTransport {
    /// プロデューサーと購読計画ごとのグループコンシューマーを起動する。
    pub(crate) fn start(
        settings: &KafkaSettings,
        plans: Vec<GroupConsumerPlan>,
    ) -> Result<Arc<Self>, MessageBusError> {
        let producer = KafkaBusProducer::new(settings)?;
        let transport = Arc::new(Self {
            producer,
            consumers: Mutex::new(Vec::new()),
        });

        let as_dyn: Arc<dyn MessageTransport> = transport.clone();
        let publisher = Arc::downgrade(&as_dyn);

        for plan in plans {
            let consumer = KafkaGroupConsumer::start(settings, plan, publisher.clone())?;
            if let Ok(mut consumers) = transport.consumers.lock() {
                consumers.push(consumer);
            }
        }

        Ok(transport)
    }
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    async fn publish(&self, record: OutboundRecord) -> Result<(), MessageBusError> {
        self.producer.publish(record).await
    }

    async fn shutdown(&self) -> Result<(), MessageBusError> {
        let consumers: Vec<Arc<KafkaGroupConsumer>> = match self.consumers.lock() {
            Ok(mut consumers) => consumers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for consumer in consumers {
            consumer.stop().await;
        }
        self.producer.flush()
    }
}
