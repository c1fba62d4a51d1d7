use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MessageBusError;
use crate::resolver::HandlerResolver;
use crate::transport::{InboundRecord, OutboundRecord};

pub(crate) const DEFAULT_CHECKPOINT_COUNT: u64 = 10;
pub(crate) const DEFAULT_CHECKPOINT_DURATION: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_INSTANCES: usize = 1;

/// 型消去済みのメッセージディスパッチ。デシリアライズ・ハンドラー解決・
/// 呼び出しまでを行い、リクエストハンドラーの場合は返信レコードを返す。
pub(crate) type DispatchFuture =
    Pin<Box<dyn Future<Output = Result<Option<OutboundRecord>, MessageBusError>> + Send>>;
pub(crate) type DispatchFn =
    Arc<dyn Fn(Arc<dyn HandlerResolver>, InboundRecord) -> DispatchFuture + Send + Sync>;

/// 型消去済みのキーセレクター。登録型と一致しない場合は None。
pub(crate) type KeySelector = Arc<dyn Fn(&dyn Any) -> Option<Vec<u8>> + Send + Sync>;
/// 型消去済みのパーティションセレクター。
pub(crate) type PartitionSelector = Arc<dyn Fn(&dyn Any) -> Option<i32> + Send + Sync>;

/// レスポンス処理の失敗時に呼ばれるフック。
pub type ResponseFaultHook = Arc<dyn Fn(&MessageBusError) + Send + Sync>;

/// ProducerRegistration はメッセージ型と送信先トピックの対応を表す。
#[derive(Clone)]
pub(crate) struct ProducerRegistration {
    pub type_name: &'static str,
    pub topic: String,
    pub key_selector: Option<KeySelector>,
    pub partition_selector: Option<PartitionSelector>,
    /// この型をリクエストとして送信する際のデフォルトタイムアウト
    pub request_timeout: Option<Duration>,
}

/// ハンドラー種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Subscriber,
    RequestHandler,
}

/// ConsumerRegistration はトピック・グループとハンドラーの対応を表す。
#[derive(Clone)]
pub(crate) struct ConsumerRegistration {
    pub message_type: &'static str,
    pub handler_type: &'static str,
    pub topic: String,
    pub group: String,
    pub kind: HandlerKind,
    /// パーティションごとの同時実行ハンドラー数
    pub instances: usize,
    pub checkpoint_count: u64,
    pub checkpoint_duration: Duration,
    pub dispatch: DispatchFn,
}

/// RequestResponseSettings はレスポンス受信側の設定を表す。
#[derive(Clone)]
pub(crate) struct RequestResponseSettings {
    pub reply_topic: String,
    pub group: String,
    pub default_timeout: Duration,
    pub checkpoint_count: u64,
    pub checkpoint_duration: Duration,
    pub fault_hook: Option<ResponseFaultHook>,
}

/// BusSettings は構築後に変化しないバスのルーティングテーブル。
pub(crate) struct BusSettings {
    pub instance_id: Option<String>,
    pub producers: HashMap<TypeId, ProducerRegistration>,
    pub consumers: Vec<ConsumerRegistration>,
    pub request_response: Option<RequestResponseSettings>,
}

impl BusSettings {
    /// 登録内容の整合性を検証する。
    pub(crate) fn validate(&self) -> Result<(), MessageBusError> {
        for producer in self.producers.values() {
            if producer.topic.is_empty() {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "publisher registration for {} has an empty topic",
                    producer.type_name
                )));
            }
        }

        let mut seen = HashSet::new();
        let mut group_topics: HashMap<&str, HashSet<&str>> = HashMap::new();
        for consumer in &self.consumers {
            if consumer.topic.is_empty() {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "consumer registration for {} has an empty topic",
                    consumer.message_type
                )));
            }
            if consumer.group.is_empty() {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "consumer registration for {} has an empty group",
                    consumer.message_type
                )));
            }
            if consumer.instances == 0 {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "consumer registration for {} must have an instance count of at least 1",
                    consumer.message_type
                )));
            }
            if !seen.insert((
                consumer.topic.as_str(),
                consumer.group.as_str(),
                consumer.message_type,
            )) {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "duplicate consumer registration for {} on topic {} in group {}",
                    consumer.message_type, consumer.topic, consumer.group
                )));
            }
            if !group_topics
                .entry(consumer.group.as_str())
                .or_default()
                .insert(consumer.topic.as_str())
            {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "consumers in group {} must target different topics",
                    consumer.group
                )));
            }
        }

        if let Some(rr) = &self.request_response {
            if rr.reply_topic.is_empty() || rr.group.is_empty() {
                return Err(MessageBusError::InvalidConfiguration(
                    "request/response requires a reply topic and a group".to_string(),
                ));
            }
            let collides = self
                .consumers
                .iter()
                .any(|c| c.group == rr.group && c.topic == rr.reply_topic);
            if collides {
                return Err(MessageBusError::InvalidConfiguration(format!(
                    "request/response group {} and topic {} collide with a consumer registration",
                    rr.group, rr.reply_topic
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_dispatch() -> DispatchFn {
        Arc::new(|_, _| Box::pin(async { Ok(None) }))
    }

    fn consumer(topic: &str, group: &str, message_type: &'static str) -> ConsumerRegistration {
        ConsumerRegistration {
            message_type,
            handler_type: "test::Handler",
            topic: topic.to_string(),
            group: group.to_string(),
            kind: HandlerKind::Subscriber,
            instances: 1,
            checkpoint_count: DEFAULT_CHECKPOINT_COUNT,
            checkpoint_duration: DEFAULT_CHECKPOINT_DURATION,
            dispatch: noop_dispatch(),
        }
    }

    fn settings(consumers: Vec<ConsumerRegistration>) -> BusSettings {
        BusSettings {
            instance_id: None,
            producers: HashMap::new(),
            consumers,
            request_response: None,
        }
    }

    #[test]
    fn test_valid_settings() {
        let s = settings(vec![
            consumer("orders", "billing", "OrderCreated"),
            consumer("shipments", "billing", "ShipmentCreated"),
        ]);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let s = settings(vec![consumer("", "billing", "OrderCreated")]);
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_empty_group_rejected() {
        let s = settings(vec![consumer("orders", "", "OrderCreated")]);
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_zero_instances_rejected() {
        let mut reg = consumer("orders", "billing", "OrderCreated");
        reg.instances = 0;
        let s = settings(vec![reg]);
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let s = settings(vec![
            consumer("orders", "billing", "OrderCreated"),
            consumer("orders", "billing", "OrderCreated"),
        ]);
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_same_group_same_topic_rejected() {
        let s = settings(vec![
            consumer("orders", "billing", "OrderCreated"),
            consumer("orders", "billing", "OrderCancelled"),
        ]);
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_request_response_collision_rejected() {
        let mut s = settings(vec![consumer("replies", "api", "OrderCreated")]);
        s.request_response = Some(RequestResponseSettings {
            reply_topic: "replies".to_string(),
            group: "api".to_string(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            checkpoint_count: DEFAULT_CHECKPOINT_COUNT,
            checkpoint_duration: DEFAULT_CHECKPOINT_DURATION,
            fault_hook: None,
        });
        assert!(matches!(
            s.validate().unwrap_err(),
            MessageBusError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_request_response_distinct_group_accepted() {
        let mut s = settings(vec![consumer("orders", "billing", "OrderCreated")]);
        s.request_response = Some(RequestResponseSettings {
            reply_topic: "replies".to_string(),
            group: "api".to_string(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            checkpoint_count: DEFAULT_CHECKPOINT_COUNT,
            checkpoint_duration: DEFAULT_CHECKPOINT_DURATION,
            fault_hook: None,
        });
        assert!(s.validate().is_ok());
    }
}
