use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::checkpoint::CheckpointTrigger;
use crate::correlation::PendingRequestRegistry;
use crate::envelope::MessageHeaders;
use crate::error::MessageBusError;
use crate::resolver::HandlerResolver;
use crate::settings::{ConsumerRegistration, DispatchFn, RequestResponseSettings, ResponseFaultHook};
use crate::transport::{InboundRecord, MessageTransport};

/// 割り当て解除時に実行中ハンドラーの完了を待つ猶予時間。
const REVOKE_GRACE: Duration = Duration::from_secs(10);

/// CommitSink はオフセットコミットの発行先インターフェース。
/// パーティションプロセッサーはこの経路以外でコミットを発行しない。
#[async_trait]
pub(crate) trait CommitSink: Send + Sync {
    /// 指定オフセットまでの処理完了を記録する。
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), MessageBusError>;
}

/// CommitLog はパーティションごとのコミット済みオフセット台帳。
/// 単調増加のみを受け付ける。
#[derive(Default)]
pub(crate) struct CommitLog {
    committed: std::sync::Mutex<HashMap<(String, i32), i64>>,
}

impl CommitLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// オフセットが前回コミットより前進している場合のみ記録して true を返す。
    pub(crate) fn advance(&self, topic: &str, partition: i32, offset: i64) -> bool {
        let mut committed = match self.committed.lock() {
            Ok(committed) => committed,
            Err(_) => return false,
        };
        match committed.get(&(topic.to_string(), partition)) {
            Some(&last) if offset <= last => false,
            _ => {
                committed.insert((topic.to_string(), partition), offset);
                true
            }
        }
    }

}

/// OffsetTracker はパーティション内の完了順コミット可否を追跡する。
/// ハンドラーが並行実行されても、先行する全オフセットが完了するまで
/// そのオフセットはコミット対象にならない。
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    first: Option<i64>,
    highest: i64,
    in_flight: BTreeSet<i64>,
}

impl OffsetTracker {
    /// オフセットのディスパッチ開始を記録する。
    pub(crate) fn begin(&mut self, offset: i64) {
        if self.first.is_none() {
            self.first = Some(offset);
        }
        self.highest = self.highest.max(offset);
        self.in_flight.insert(offset);
    }

    /// オフセットの処理完了を記録する。
    pub(crate) fn finish(&mut self, offset: i64) {
        self.in_flight.remove(&offset);
    }

    /// コミット可能な最大オフセットを返す。まだ何も完了していない場合は None。
    pub(crate) fn committable(&self) -> Option<i64> {
        let first = self.first?;
        match self.in_flight.iter().next() {
            None => Some(self.highest),
            Some(&lowest) if lowest > first => Some(lowest - 1),
            Some(_) => None,
        }
    }
}

/// チェックポイント判定とオフセット追跡をまとめたパーティション状態。
struct CheckpointState {
    tracker: OffsetTracker,
    trigger: CheckpointTrigger,
    revoked: bool,
}

impl CheckpointState {
    fn new(checkpoint_count: u64, checkpoint_duration: Duration) -> Self {
        Self {
            tracker: OffsetTracker::default(),
            trigger: CheckpointTrigger::new(checkpoint_count, checkpoint_duration),
            revoked: false,
        }
    }

    fn begin(&mut self, offset: i64) {
        self.tracker.begin(offset);
    }

    /// 処理完了を記録し、トリガーが発火した場合はコミット対象オフセットを返す。
    fn complete(&mut self, offset: i64) -> Option<i64> {
        self.tracker.finish(offset);
        if self.revoked {
            return None;
        }
        if self.trigger.increment() {
            self.tracker.committable()
        } else {
            None
        }
    }

    /// パーティション終端での強制フラッシュ。トリガーをリセットする。
    fn flush(&mut self) -> Option<i64> {
        self.trigger.reset();
        if self.revoked {
            None
        } else {
            self.tracker.committable()
        }
    }

    fn revoke(&mut self) {
        self.revoked = true;
        self.trigger.reset();
    }
}

/// PartitionProcessor は割り当てられた 1 パーティションのレコードを
/// ハンドラー呼び出しへ変換し、チェックポイントを管理する。
#[async_trait]
pub(crate) trait PartitionProcessor: Send + Sync {
    fn topic(&self) -> &str;
    fn partition(&self) -> i32;

    /// レコードを 1 件処理する。
    async fn on_message(&self, record: InboundRecord);

    /// パーティション終端に到達した。コミット可能なオフセットをフラッシュする。
    async fn on_partition_end_reached(&self);

    /// パーティションの割り当てが解除された。実行中の処理を待ち、
    /// 以後のコミットを止める。
    async fn on_partition_revoked(&self);
}

/// ConsumerProcessor は購読・リクエストハンドラー登録向けの
/// パーティションプロセッサー。
pub(crate) struct ConsumerProcessor {
    topic: String,
    partition: i32,
    dispatch: DispatchFn,
    resolver: Arc<dyn HandlerResolver>,
    publisher: Weak<dyn MessageTransport>,
    limiter: Arc<Semaphore>,
    state: Arc<Mutex<CheckpointState>>,
    commits: Arc<dyn CommitSink>,
    tasks: Mutex<JoinSet<()>>,
}

impl ConsumerProcessor {
    pub(crate) fn new(
        topic: impl Into<String>,
        partition: i32,
        registration: &ConsumerRegistration,
        resolver: Arc<dyn HandlerResolver>,
        context: &ProcessorContext,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            dispatch: registration.dispatch.clone(),
            resolver,
            publisher: context.publisher.clone(),
            limiter: Arc::new(Semaphore::new(registration.instances)),
            state: Arc::new(Mutex::new(CheckpointState::new(
                registration.checkpoint_count,
                registration.checkpoint_duration,
            ))),
            commits: context.commits.clone(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }
}

#[async_trait]
impl PartitionProcessor for ConsumerProcessor {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn on_message(&self, record: InboundRecord) {
        let offset = record.offset;
        // パーティション内の順序はここで決まる。許可証を取得してから
        // タスクを起動するため、投入順はレコード順と一致する。
        let permit = match self.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        {
            let mut state = self.state.lock().await;
            if state.revoked {
                return;
            }
            state.begin(offset);
        }

        let dispatch = (self.dispatch)(self.resolver.clone(), record);
        let topic = self.topic.clone();
        let partition = self.partition;
        let state = self.state.clone();
        let commits = self.commits.clone();
        let publisher = self.publisher.clone();

        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            // 許可証は完了記録まで保持する。解放が早いと後続メッセージの
            // 記録と順序が入れ替わる。
            let _permit = permit;
            match dispatch.await {
                Ok(Some(reply)) => match publisher.upgrade() {
                    Some(transport) => {
                        if let Err(e) = transport.publish(reply).await {
                            tracing::error!(
                                error = %e,
                                topic = %topic,
                                partition,
                                offset,
                                "failed to publish reply"
                            );
                        }
                    }
                    None => {
                        tracing::warn!(topic = %topic, partition, "transport closed, reply dropped")
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        topic = %topic,
                        partition,
                        offset,
                        "message dispatch failed"
                    );
                }
            }

            let commit_to = {
                let mut state = state.lock().await;
                state.complete(offset)
            };
            if let Some(commit_offset) = commit_to {
                if let Err(e) = commits.commit(&topic, partition, commit_offset).await {
                    tracing::error!(error = %e, topic = %topic, partition, "offset commit failed");
                }
            }
        });
    }

    async fn on_partition_end_reached(&self) {
        let commit_to = { self.state.lock().await.flush() };
        if let Some(offset) = commit_to {
            if let Err(e) = self.commits.commit(&self.topic, self.partition, offset).await {
                tracing::error!(
                    error = %e,
                    topic = %self.topic,
                    partition = self.partition,
                    "offset commit failed at partition end"
                );
            }
        }
    }

    async fn on_partition_revoked(&self) {
        {
            self.state.lock().await.revoke();
        }
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(REVOKE_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                "revocation grace period elapsed with handlers in flight"
            );
            tasks.abort_all();
        }
    }
}

/// ResponseProcessor はレスポンストピックのレコードを保留中リクエストの
/// 台帳へ配送するパーティションプロセッサー。レスポンスは再試行しない。
pub(crate) struct ResponseProcessor {
    topic: String,
    partition: i32,
    registry: Arc<PendingRequestRegistry>,
    fault_hook: Option<ResponseFaultHook>,
    state: Mutex<CheckpointState>,
    commits: Arc<dyn CommitSink>,
}

impl ResponseProcessor {
    pub(crate) fn new(
        topic: impl Into<String>,
        partition: i32,
        settings: &RequestResponseSettings,
        registry: Arc<PendingRequestRegistry>,
        context: &ProcessorContext,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            registry,
            fault_hook: settings.fault_hook.clone(),
            state: Mutex::new(CheckpointState::new(
                settings.checkpoint_count,
                settings.checkpoint_duration,
            )),
            commits: context.commits.clone(),
        }
    }
}

#[async_trait]
impl PartitionProcessor for ResponseProcessor {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn on_message(&self, record: InboundRecord) {
        let offset = record.offset;
        {
            let mut state = self.state.lock().await;
            if state.revoked {
                return;
            }
            state.begin(offset);
        }

        let headers = MessageHeaders::from_transport(&record.headers);
        if let Err(e) = self.registry.on_response_arrived(headers, record.payload) {
            tracing::error!(
                error = %e,
                topic = %self.topic,
                partition = self.partition,
                offset,
                "response dispatch failed"
            );
            if let Some(hook) = &self.fault_hook {
                hook(&e);
            }
        }

        let commit_to = { self.state.lock().await.complete(offset) };
        if let Some(commit_offset) = commit_to {
            if let Err(e) = self
                .commits
                .commit(&self.topic, self.partition, commit_offset)
                .await
            {
                tracing::error!(error = %e, topic = %self.topic, partition = self.partition, "offset commit failed");
            }
        }
    }

    async fn on_partition_end_reached(&self) {
        let commit_to = { self.state.lock().await.flush() };
        if let Some(offset) = commit_to {
            if let Err(e) = self.commits.commit(&self.topic, self.partition, offset).await {
                tracing::error!(
                    error = %e,
                    topic = %self.topic,
                    partition = self.partition,
                    "offset commit failed at partition end"
                );
            }
        }
    }

    async fn on_partition_revoked(&self) {
        self.state.lock().await.revoke();
    }
}

/// プロセッサー構築時に渡される能力ハンドル。返信の送出先と
/// コミットの発行先のみを公開し、所有参照は持たない。
pub(crate) struct ProcessorContext {
    pub publisher: Weak<dyn MessageTransport>,
    pub commits: Arc<dyn CommitSink>,
}

/// トピックとパーティションからプロセッサーを生成するファクトリー。
/// 未知のトピックには None を返す。
pub(crate) type ProcessorFactory =
    Arc<dyn Fn(&str, i32, &ProcessorContext) -> Option<Arc<dyn PartitionProcessor>> + Send + Sync>;

/// GroupConsumerPlan は 1 コンシューマーグループ分の購読内容を表す。
pub(crate) struct GroupConsumerPlan {
    pub group: String,
    pub topics: Vec<String>,
    pub factory: ProcessorFactory,
}

/// パーティションワーカーへ渡すイベント。
pub(crate) enum PartitionEvent {
    Record(InboundRecord),
    EndOfPartition,
}

/// PartitionAssignment は割り当て中のパーティションと、その取り込み
/// キュー・ワーカーを表す。割り当て解除で破棄される。
pub(crate) struct PartitionAssignment {
    processor: Arc<dyn PartitionProcessor>,
    pub(crate) tx: mpsc::Sender<PartitionEvent>,
    worker: JoinHandle<()>,
}

impl PartitionAssignment {
    /// プロセッサーと取り込みワーカーを起動する。
    pub(crate) fn start(processor: Arc<dyn PartitionProcessor>, queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(queue_depth);
        let dispatcher = processor.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PartitionEvent::Record(record) => dispatcher.on_message(record).await,
                    PartitionEvent::EndOfPartition => dispatcher.on_partition_end_reached().await,
                }
            }
        });
        Self {
            processor,
            tx,
            worker,
        }
    }

    /// 取り込みを止め、実行中のハンドラーを待ってからプロセッサーへ
    /// 割り当て解除を通知する。キューに残ったレコードは破棄される
    /// （次の所有者が再配信を受ける）。
    pub(crate) async fn revoke(self) {
        self.worker.abort();
        let _ = self.worker.await;
        tracing::debug!(
            topic = %self.processor.topic(),
            partition = self.processor.partition(),
            "partition assignment dropped"
        );
        self.processor.on_partition_revoked().await;
    }
}
