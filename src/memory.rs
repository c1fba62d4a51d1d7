use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::MessageBusError;
use crate::processor::{
    CommitLog, CommitSink, GroupConsumerPlan, PartitionAssignment, PartitionEvent, ProcessorContext,
};
use crate::transport::{InboundRecord, MessageTransport, OutboundRecord};

/// MemorySettings はインメモリトランスポートの設定を表す。
#[derive(Debug, Clone)]
pub struct MemorySettings {
    default_partitions: usize,
    topic_partitions: HashMap<String, usize>,
    queue_depth: usize,
}

impl MemorySettings {
    /// デフォルト設定で新しい MemorySettings を生成する。
    /// default_partitions: 1, queue_depth: 256
    pub fn new() -> Self {
        Self {
            default_partitions: 1,
            topic_partitions: HashMap::new(),
            queue_depth: 256,
        }
    }

    /// トピックのデフォルトパーティション数を設定する（ビルダーパターン）。
    pub fn default_partitions(mut self, partitions: usize) -> Self {
        self.default_partitions = partitions;
        self
    }

    /// 特定トピックのパーティション数を設定する（ビルダーパターン）。
    pub fn topic_partitions(mut self, topic: impl Into<String>, partitions: usize) -> Self {
        self.topic_partitions.insert(topic.into(), partitions);
        self
    }

    /// パーティションワーカーの取り込みキュー長を設定する（ビルダーパターン）。
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    fn partitions_for(&self, topic: &str) -> usize {
        self.topic_partitions
            .get(topic)
            .copied()
            .unwrap_or(self.default_partitions)
            .max(1)
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryPartition {
    next_offset: AtomicI64,
    subscribers: Mutex<Vec<tokio::sync::mpsc::Sender<PartitionEvent>>>,
}

struct MemoryTopic {
    partitions: Vec<MemoryPartition>,
    round_robin: AtomicUsize,
}

impl MemoryTopic {
    fn new(partition_count: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|_| MemoryPartition {
                next_offset: AtomicI64::new(0),
                subscribers: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            partitions,
            round_robin: AtomicUsize::new(0),
        }
    }
}

/// インメモリのコミット台帳。
struct MemoryCommitSink {
    log: CommitLog,
}

#[async_trait]
impl CommitSink for MemoryCommitSink {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessageBusError> {
        if self.log.advance(topic, partition, offset) {
            tracing::debug!(topic = %topic, partition, offset, "offset committed");
        }
        Ok(())
    }
}

/// MemoryTransport は Kafka と同じレコード・オフセット・コミットの形を
/// 持つインプロセストランスポート。テストとローカル実行に使う。
pub(crate) struct MemoryTransport {
    settings: MemorySettings,
    topics: Mutex<HashMap<String, Arc<MemoryTopic>>>,
    commits: Arc<MemoryCommitSink>,
    assignments: Mutex<Vec<PartitionAssignment>>,
}

impl MemoryTransport {
    /// トランスポートを構築し、購読計画ごとのパーティションワーカーを起動する。
    pub(crate) fn start(
        settings: MemorySettings,
        plans: Vec<GroupConsumerPlan>,
    ) -> Result<Arc<Self>, MessageBusError> {
        let transport = Arc::new(Self {
            settings,
            topics: Mutex::new(HashMap::new()),
            commits: Arc::new(MemoryCommitSink {
                log: CommitLog::new(),
            }),
            assignments: Mutex::new(Vec::new()),
        });

        let as_dyn: Arc<dyn MessageTransport> = transport.clone();
        let publisher = Arc::downgrade(&as_dyn);

        for plan in plans {
            let context = ProcessorContext {
                publisher: publisher.clone(),
                commits: transport.commits.clone(),
            };
            for topic_name in &plan.topics {
                let topic = transport.ensure_topic(topic_name)?;
                for partition in 0..topic.partitions.len() {
                    match (plan.factory)(topic_name, partition as i32, &context) {
                        Some(processor) => {
                            let assignment = PartitionAssignment::start(
                                processor,
                                transport.settings.queue_depth,
                            );
                            if let Ok(mut subscribers) =
                                topic.partitions[partition].subscribers.lock()
                            {
                                subscribers.push(assignment.tx.clone());
                            }
                            if let Ok(mut assignments) = transport.assignments.lock() {
                                assignments.push(assignment);
                            }
                        }
                        None => tracing::warn!(
                            group = %plan.group,
                            topic = %topic_name,
                            "no processor for subscribed topic"
                        ),
                    }
                }
            }
            tracing::info!(group = %plan.group, topics = ?plan.topics, "memory group consumer subscribed");
        }

        Ok(transport)
    }

    fn ensure_topic(&self, name: &str) -> Result<Arc<MemoryTopic>, MessageBusError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| MessageBusError::publish_failed("topic table lock poisoned"))?;
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTopic::new(self.settings.partitions_for(name))));
        Ok(topic.clone())
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn publish(&self, record: OutboundRecord) -> Result<(), MessageBusError> {
        let topic = self.ensure_topic(&record.topic)?;
        let partition_count = topic.partitions.len();

        let index = if record.partition >= 0 {
            let index = record.partition as usize;
            if index >= partition_count {
                return Err(MessageBusError::PublishFailed {
                    code: -1,
                    reason: format!(
                        "partition {} out of range for topic {} ({} partitions)",
                        record.partition, record.topic, partition_count
                    ),
                });
            }
            index
        } else if let Some(key) = &record.key {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partition_count as u64) as usize
        } else {
            topic.round_robin.fetch_add(1, Ordering::Relaxed) % partition_count
        };

        let partition = &topic.partitions[index];
        let offset = partition.next_offset.fetch_add(1, Ordering::SeqCst);
        let inbound = InboundRecord {
            topic: record.topic.clone(),
            partition: index as i32,
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        };

        let subscribers: Vec<_> = partition
            .subscribers
            .lock()
            .map_err(|_| MessageBusError::publish_failed("subscriber list lock poisoned"))?
            .clone();
        for subscriber in subscribers {
            if subscriber
                .send(PartitionEvent::Record(inbound.clone()))
                .await
                .is_err()
            {
                tracing::debug!(topic = %inbound.topic, "subscriber channel closed");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MessageBusError> {
        let assignments: Vec<PartitionAssignment> = match self.assignments.lock() {
            Ok(mut assignments) => assignments.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for assignment in assignments {
            assignment.revoke().await;
        }
        if let Ok(topics) = self.topics.lock() {
            for topic in topics.values() {
                for partition in &topic.partitions {
                    if let Ok(mut subscribers) = partition.subscribers.lock() {
                        subscribers.clear();
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::PartitionProcessor;
    use crate::transport::PARTITION_ANY;
    use std::time::Duration;

    struct RecordingProcessor {
        topic: String,
        partition: i32,
        seen: Arc<Mutex<Vec<(i32, i64, Vec<u8>)>>>,
    }

    #[async_trait]
    impl PartitionProcessor for RecordingProcessor {
        fn topic(&self) -> &str {
            &self.topic
        }

        fn partition(&self) -> i32 {
            self.partition
        }

        async fn on_message(&self, record: InboundRecord) {
            self.seen
                .lock()
                .unwrap()
                .push((record.partition, record.offset, record.payload));
        }

        async fn on_partition_end_reached(&self) {}

        async fn on_partition_revoked(&self) {}
    }

    fn recording_plan(
        topic: &str,
        seen: Arc<Mutex<Vec<(i32, i64, Vec<u8>)>>>,
    ) -> GroupConsumerPlan {
        let topic_name = topic.to_string();
        GroupConsumerPlan {
            group: "test-group".to_string(),
            topics: vec![topic_name.clone()],
            factory: Arc::new(move |topic, partition, _| {
                Some(Arc::new(RecordingProcessor {
                    topic: topic.to_string(),
                    partition,
                    seen: seen.clone(),
                }) as Arc<dyn PartitionProcessor>)
            }),
        }
    }

    fn record(topic: &str, partition: i32, key: Option<Vec<u8>>, payload: &[u8]) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key,
            partition,
            payload: payload.to_vec(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_explicit_partition_routing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let settings = MemorySettings::new().topic_partitions("t", 2);
        let transport =
            MemoryTransport::start(settings, vec![recording_plan("t", seen.clone())]).unwrap();

        transport.publish(record("t", 1, None, b"a")).await.unwrap();
        transport.publish(record("t", 0, None, b"b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(1, 0, b"a".to_vec())));
        assert!(seen.contains(&(0, 0, b"b".to_vec())));
    }

    #[tokio::test]
    async fn test_key_routing_is_stable() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let settings = MemorySettings::new().topic_partitions("t", 4);
        let transport =
            MemoryTransport::start(settings, vec![recording_plan("t", seen.clone())]).unwrap();

        for _ in 0..3 {
            transport
                .publish(record("t", PARTITION_ANY, Some(b"user-1".to_vec()), b"x"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let first_partition = seen[0].0;
        assert!(seen.iter().all(|(p, _, _)| *p == first_partition));
        // 同一パーティション内でオフセットは単調増加
        let offsets: Vec<i64> = seen.iter().map(|(_, o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_round_robin_without_key() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let settings = MemorySettings::new().topic_partitions("t", 2);
        let transport =
            MemoryTransport::start(settings, vec![recording_plan("t", seen.clone())]).unwrap();

        transport
            .publish(record("t", PARTITION_ANY, None, b"a"))
            .await
            .unwrap();
        transport
            .publish(record("t", PARTITION_ANY, None, b"b"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        let partitions: std::collections::HashSet<i32> = seen.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(partitions.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_partition_rejected() {
        let transport = MemoryTransport::start(MemorySettings::new(), Vec::new()).unwrap();
        let result = transport.publish(record("t", 5, None, b"a")).await;
        assert!(matches!(
            result.unwrap_err(),
            MessageBusError::PublishFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = MemoryTransport::start(
            MemorySettings::new(),
            vec![recording_plan("t", seen.clone())],
        )
        .unwrap();

        transport.shutdown().await.unwrap();
        transport
            .publish(record("t", PARTITION_ANY, None, b"a"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
