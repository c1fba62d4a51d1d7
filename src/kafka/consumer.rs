//! rdkafka StreamConsumer を使ったグループコンシューマー。
//!
//! グループごとに 1 つのドライバーを所有し、リバランスで割り当てられた
//! パーティションごとにプロセッサーを生成する。オフセットコミットは
//! コミットコントローラー経由でのみ発行され、パーティション単位で
//! 単調増加する。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::MessageBusError;
use crate::processor::{
    CommitLog, CommitSink, GroupConsumerPlan, PartitionAssignment, PartitionEvent,
    ProcessorContext, ProcessorFactory,
};
use crate::transport::{InboundRecord, MessageTransport};

use super::config::KafkaSettings;

type Assignments = Arc<Mutex<HashMap<(String, i32), PartitionAssignment>>>;

/// リバランスコールバックで割り当てテーブルを管理するコンシューマー
/// コンテキスト。コールバックはドライバーのポーリングスレッドから
/// 同期的に呼ばれるため、割り当てテーブルは同期ロックで守る。
pub(crate) struct BusConsumerContext {
    group: String,
    assignments: Assignments,
    factory: ProcessorFactory,
    processor_context: OnceLock<ProcessorContext>,
    queue_depth: usize,
    runtime: tokio::runtime::Handle,
}

impl ClientContext for BusConsumerContext {}

impl ConsumerContext for BusConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            let mut revoked = Vec::new();
            if let Ok(mut assignments) = self.assignments.lock() {
                for element in partitions.elements() {
                    let key = (element.topic().to_string(), element.partition());
                    if let Some(assignment) = assignments.remove(&key) {
                        revoked.push(assignment);
                    }
                }
            }
            if revoked.is_empty() {
                return;
            }
            tracing::info!(group = %self.group, count = revoked.len(), "partitions revoked");
            // 実行中のハンドラーが完了するまでリバランスの完了を遅らせる。
            // 新しい所有者が先に進んだオフセットをこちらがコミットしない
            // ための順序付け。マルチスレッドランタイムが前提。
            let runtime = self.runtime.clone();
            tokio::task::block_in_place(|| {
                runtime.block_on(async {
                    for assignment in revoked {
                        assignment.revoke().await;
                    }
                })
            });
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let Some(context) = self.processor_context.get() else {
                    return;
                };
                let _guard = self.runtime.enter();
                for element in partitions.elements() {
                    let topic = element.topic().to_string();
                    let partition = element.partition();
                    match (self.factory)(&topic, partition, context) {
                        Some(processor) => {
                            tracing::info!(
                                group = %self.group,
                                topic = %topic,
                                partition,
                                "partition assigned"
                            );
                            let assignment =
                                PartitionAssignment::start(processor, self.queue_depth);
                            if let Ok(mut assignments) = self.assignments.lock() {
                                assignments.insert((topic, partition), assignment);
                            }
                        }
                        None => tracing::warn!(
                            group = %self.group,
                            topic = %topic,
                            partition,
                            "no processor for assigned topic"
                        ),
                    }
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                tracing::error!(group = %self.group, error = %e, "rebalance error")
            }
        }
    }
}

/// KafkaCommitSink はコンシューマードライバーへの明示的コミット経路。
/// プロセッサーからは弱参照で届くため、ドライバー破棄後のコミットは
/// 単に無視される。
pub(crate) struct KafkaCommitSink {
    consumer: Weak<StreamConsumer<BusConsumerContext>>,
    log: CommitLog,
}

impl KafkaCommitSink {
    fn new(consumer: Weak<StreamConsumer<BusConsumerContext>>) -> Self {
        Self {
            consumer,
            log: CommitLog::new(),
        }
    }
}

#[async_trait]
impl CommitSink for KafkaCommitSink {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessageBusError> {
        let Some(consumer) = self.consumer.upgrade() else {
            tracing::debug!(topic = %topic, partition, "consumer closed, commit skipped");
            return Ok(());
        };
        if !self.log.advance(topic, partition, offset) {
            return Ok(());
        }
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| {
                MessageBusError::publish_failed(format!("offset commit failed: {}", e))
            })?;
        consumer
            .commit(&list, rdkafka::consumer::CommitMode::Async)
            .map_err(|e| {
                MessageBusError::publish_failed(format!("offset commit failed: {}", e))
            })?;
        tracing::debug!(topic = %topic, partition, offset, "offset committed");
        Ok(())
    }
}

/// KafkaGroupConsumer は 1 コンシューマーグループ分のドライバーと
/// ポーリングワーカーを所有する。
pub(crate) struct KafkaGroupConsumer {
    group: String,
    consumer: Arc<StreamConsumer<BusConsumerContext>>,
    assignments: Assignments,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaGroupConsumer {
    /// ドライバーを作成してトピックを購読し、ポーリングワーカーを起動する。
    pub(crate) fn start(
        settings: &KafkaSettings,
        plan: GroupConsumerPlan,
        publisher: Weak<dyn MessageTransport>,
    ) -> Result<Arc<Self>, MessageBusError> {
        let assignments: Assignments = Arc::new(Mutex::new(HashMap::new()));
        let context = BusConsumerContext {
            group: plan.group.clone(),
            assignments: assignments.clone(),
            factory: plan.factory,
            processor_context: OnceLock::new(),
            queue_depth: settings.queue_depth,
            runtime: tokio::runtime::Handle::current(),
        };

        let mut config = settings.base_client_config();
        config.set("group.id", &plan.group);
        config.set("enable.auto.commit", "false");
        config.set("enable.partition.eof", "true");
        config.set("session.timeout.ms", settings.session_timeout_ms.to_string());
        config.set("auto.offset.reset", &settings.auto_offset_reset);

        let consumer: StreamConsumer<BusConsumerContext> = config
            .create_with_context(context)
            .map_err(|e| MessageBusError::InvalidConfiguration(e.to_string()))?;
        let consumer = Arc::new(consumer);

        let sink = Arc::new(KafkaCommitSink::new(Arc::downgrade(&consumer)));
        let _ = consumer.context().processor_context.set(ProcessorContext {
            publisher,
            commits: sink,
        });

        let topics: Vec<&str> = plan.topics.iter().map(|t| t.as_str()).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| MessageBusError::InvalidConfiguration(e.to_string()))?;

        tracing::info!(group = %plan.group, topics = ?plan.topics, "kafka group consumer subscribed");

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Self::poll_loop(
            consumer.clone(),
            assignments.clone(),
            cancel.clone(),
            plan.group.clone(),
        ));

        Ok(Arc::new(Self {
            group: plan.group,
            consumer,
            assignments,
            cancel,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// ポーリングとディスパッチのループ。レコードは (トピック,
    /// パーティション) で割り当て済みワーカーへ引き渡す。
    async fn poll_loop(
        consumer: Arc<StreamConsumer<BusConsumerContext>>,
        assignments: Assignments,
        cancel: CancellationToken,
        group: String,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = consumer.recv() => match result {
                    Ok(message) => {
                        let record = InboundRecord {
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                            key: message.key().map(|k| k.to_vec()),
                            payload: message.payload().unwrap_or_default().to_vec(),
                            headers: extract_headers(&message),
                        };
                        let key = (record.topic.clone(), record.partition);
                        let tx = assignments
                            .lock()
                            .ok()
                            .and_then(|a| a.get(&key).map(|assignment| assignment.tx.clone()));
                        match tx {
                            Some(tx) => {
                                if tx.send(PartitionEvent::Record(record)).await.is_err() {
                                    tracing::warn!(
                                        group = %group,
                                        topic = %key.0,
                                        partition = key.1,
                                        "partition worker stopped, record dropped"
                                    );
                                }
                            }
                            None => tracing::warn!(
                                group = %group,
                                topic = %key.0,
                                partition = key.1,
                                "record for unassigned partition dropped"
                            ),
                        }
                    }
                    Err(KafkaError::PartitionEOF(partition)) => {
                        let txs: Vec<_> = assignments
                            .lock()
                            .map(|a| {
                                a.iter()
                                    .filter(|((_, p), _)| *p == partition)
                                    .map(|(_, assignment)| assignment.tx.clone())
                                    .collect()
                            })
                            .unwrap_or_default();
                        for tx in txs {
                            let _ = tx.send(PartitionEvent::EndOfPartition).await;
                        }
                    }
                    Err(e) => tracing::error!(group = %group, error = %e, "kafka consumer error"),
                }
            }
        }
    }

    /// ポーリングを止め、割り当て中のパーティションを解放する。
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        let drained: Vec<PartitionAssignment> = match self.assignments.lock() {
            Ok(mut assignments) => assignments.drain().map(|(_, a)| a).collect(),
            Err(_) => Vec::new(),
        };
        for assignment in drained {
            assignment.revoke().await;
        }
        self.consumer.unsubscribe();
        tracing::info!(group = %self.group, "kafka group consumer stopped");
    }
}

impl Drop for KafkaGroupConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn extract_headers(message: &rdkafka::message::BorrowedMessage<'_>) -> Vec<(String, Vec<u8>)> {
    let mut headers = Vec::new();
    if let Some(borrowed) = message.headers() {
        for i in 0..borrowed.count() {
            let header = borrowed.get(i);
            headers.push((
                header.key.to_string(),
                header.value.map(|v| v.to_vec()).unwrap_or_default(),
            ));
        }
    }
    headers
}
