use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::correlation::PendingRequestRegistry;
use crate::envelope::MessageHeaders;
use crate::error::MessageBusError;
use crate::handler::{RequestHandler, Subscriber};
#[cfg(feature = "kafka")]
use crate::kafka::{KafkaSettings, KafkaTransport};
use crate::memory::{MemorySettings, MemoryTransport};
use crate::processor::{
    ConsumerProcessor, GroupConsumerPlan, PartitionProcessor, ProcessorFactory, ResponseProcessor,
};
use crate::resolver::{HandlerRegistry, HandlerResolver};
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::settings::{
    BusSettings, ConsumerRegistration, DispatchFn, HandlerKind, KeySelector, PartitionSelector,
    ProducerRegistration, RequestResponseSettings, ResponseFaultHook, DEFAULT_CHECKPOINT_COUNT,
    DEFAULT_CHECKPOINT_DURATION, DEFAULT_INSTANCES, DEFAULT_REQUEST_TIMEOUT,
};
use crate::transport::{MessageTransport, OutboundRecord, PARTITION_ANY};

/// 使用するトランスポートの選択。
pub enum TransportSettings {
    /// Kafka トランスポート
    #[cfg(feature = "kafka")]
    Kafka(KafkaSettings),
    /// インメモリトランスポート（テスト・ローカル実行向け）
    Memory(MemorySettings),
}

/// ProducerBuilder はメッセージ型ごとの発行設定を構築する。
pub struct ProducerBuilder<T> {
    topic: String,
    key_selector: Option<KeySelector>,
    partition_selector: Option<PartitionSelector>,
    request_timeout: Option<Duration>,
    _message: PhantomData<fn(&T)>,
}

impl<T: Serialize + Send + Sync + 'static> ProducerBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            topic: String::new(),
            key_selector: None,
            partition_selector: None,
            request_timeout: None,
            _message: PhantomData,
        }
    }

    /// 送信先トピックを設定する。
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// レコードキーをメッセージから導出するセレクターを設定する。
    pub fn key_selector(
        mut self,
        selector: impl Fn(&T) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.key_selector = Some(Arc::new(move |message: &dyn Any| {
            message.downcast_ref::<T>().map(&selector)
        }));
        self
    }

    /// 送信先パーティションをメッセージから導出するセレクターを設定する。
    /// 負の値を返した場合はトランスポート側のパーティショナーに委譲する。
    pub fn partition_selector(
        mut self,
        selector: impl Fn(&T) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.partition_selector = Some(Arc::new(move |message: &dyn Any| {
            message.downcast_ref::<T>().map(&selector)
        }));
        self
    }

    /// この型をリクエストとして送信する際のデフォルトタイムアウトを設定する。
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub(crate) fn into_registration(self) -> ProducerRegistration {
        ProducerRegistration {
            type_name: std::any::type_name::<T>(),
            topic: self.topic,
            key_selector: self.key_selector,
            partition_selector: self.partition_selector,
            request_timeout: self.request_timeout,
        }
    }
}

/// ConsumerBuilder はコンシューマー登録の共通設定を構築する。
pub struct ConsumerBuilder {
    topic: String,
    group: String,
    instances: usize,
    checkpoint_count: u64,
    checkpoint_duration: Duration,
}

impl ConsumerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            topic: String::new(),
            group: String::new(),
            instances: DEFAULT_INSTANCES,
            checkpoint_count: DEFAULT_CHECKPOINT_COUNT,
            checkpoint_duration: DEFAULT_CHECKPOINT_DURATION,
        }
    }

    /// 購読するトピックを設定する。
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// コンシューマーグループを設定する。
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// パーティションごとの同時実行ハンドラー数を設定する。
    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// チェックポイント発火までの処理件数を設定する。
    pub fn checkpoint_count(mut self, count: u64) -> Self {
        self.checkpoint_count = count;
        self
    }

    /// チェックポイント発火までの経過時間を設定する。
    pub fn checkpoint_duration(mut self, duration: Duration) -> Self {
        self.checkpoint_duration = duration;
        self
    }
}

/// RequestResponseBuilder はレスポンス受信側の設定を構築する。
pub struct RequestResponseBuilder {
    reply_topic: String,
    group: String,
    default_timeout: Duration,
    checkpoint_count: u64,
    checkpoint_duration: Duration,
    fault_hook: Option<ResponseFaultHook>,
}

impl RequestResponseBuilder {
    pub(crate) fn new() -> Self {
        Self {
            reply_topic: String::new(),
            group: String::new(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            checkpoint_count: DEFAULT_CHECKPOINT_COUNT,
            checkpoint_duration: DEFAULT_CHECKPOINT_DURATION,
            fault_hook: None,
        }
    }

    /// レスポンスを受信するトピックを設定する。
    pub fn reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = topic.into();
        self
    }

    /// レスポンス受信用のコンシューマーグループを設定する。
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// バス全体のデフォルトリクエストタイムアウトを設定する。
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// チェックポイント発火までの処理件数を設定する。
    pub fn checkpoint_count(mut self, count: u64) -> Self {
        self.checkpoint_count = count;
        self
    }

    /// チェックポイント発火までの経過時間を設定する。
    pub fn checkpoint_duration(mut self, duration: Duration) -> Self {
        self.checkpoint_duration = duration;
        self
    }

    /// レスポンス処理の失敗時に呼ばれるフックを設定する。
    pub fn on_fault(mut self, hook: impl Fn(&MessageBusError) + Send + Sync + 'static) -> Self {
        self.fault_hook = Some(Arc::new(hook));
        self
    }

    fn into_settings(self) -> RequestResponseSettings {
        RequestResponseSettings {
            reply_topic: self.reply_topic,
            group: self.group,
            default_timeout: self.default_timeout,
            checkpoint_count: self.checkpoint_count,
            checkpoint_duration: self.checkpoint_duration,
            fault_hook: self.fault_hook,
        }
    }
}

/// MessageBusBuilder はバスの登録内容を構築する。
/// 登録はすべて build() で一括検証され、構築後は変更できない。
pub struct MessageBusBuilder<S: MessageSerializer = JsonSerializer> {
    serializer: Arc<S>,
    instance_id: Option<String>,
    producers: HashMap<TypeId, ProducerRegistration>,
    consumers: Vec<ConsumerRegistration>,
    request_response: Option<RequestResponseSettings>,
    resolver: Option<Arc<dyn HandlerResolver>>,
    transport: Option<TransportSettings>,
    errors: Vec<String>,
}

impl MessageBusBuilder<JsonSerializer> {
    /// デフォルトの JSON シリアライザーでビルダーを生成する。
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl Default for MessageBusBuilder<JsonSerializer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MessageSerializer> MessageBusBuilder<S> {
    /// 任意のシリアライザーでビルダーを生成する。
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            serializer: Arc::new(serializer),
            instance_id: None,
            producers: HashMap::new(),
            consumers: Vec::new(),
            request_response: None,
            resolver: None,
            transport: None,
            errors: Vec::new(),
        }
    }

    /// インスタンス識別子を設定する（ログ用の参考情報）。
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// ハンドラーインスタンスの取得先を設定する。
    pub fn resolver(mut self, resolver: Arc<dyn HandlerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 使用するトランスポートを設定する。
    pub fn transport(mut self, transport: TransportSettings) -> Self {
        self.transport = Some(transport);
        self
    }

    /// メッセージ型の発行先を登録する。
    pub fn produce<T: Serialize + Send + Sync + 'static>(
        mut self,
        configure: impl FnOnce(ProducerBuilder<T>) -> ProducerBuilder<T>,
    ) -> Self {
        let producer = configure(ProducerBuilder::new());
        if self
            .producers
            .insert(TypeId::of::<T>(), producer.into_registration())
            .is_some()
        {
            self.errors.push(format!(
                "duplicate publisher registration for {}",
                std::any::type_name::<T>()
            ));
        }
        self
    }

    /// 購読ハンドラーを登録する。
    pub fn subscribe_to<H: Subscriber>(
        mut self,
        configure: impl FnOnce(ConsumerBuilder) -> ConsumerBuilder,
    ) -> Self {
        let consumer = configure(ConsumerBuilder::new());
        let serializer = self.serializer.clone();
        let dispatch: DispatchFn = Arc::new(move |resolver, record| {
            let serializer = serializer.clone();
            Box::pin(async move {
                let message: H::Message = serializer.deserialize(&record.payload)?;
                let handler = resolver.resolve::<H>().ok_or_else(|| {
                    MessageBusError::InvalidConfiguration(format!(
                        "no handler instance registered for {}",
                        std::any::type_name::<H>()
                    ))
                })?;
                handler.on_message(message, &record.topic).await?;
                Ok(None)
            })
        });
        self.consumers.push(ConsumerRegistration {
            message_type: std::any::type_name::<H::Message>(),
            handler_type: std::any::type_name::<H>(),
            topic: consumer.topic,
            group: consumer.group,
            kind: HandlerKind::Subscriber,
            instances: consumer.instances,
            checkpoint_count: consumer.checkpoint_count,
            checkpoint_duration: consumer.checkpoint_duration,
            dispatch,
        });
        self
    }

    /// リクエストハンドラーを登録する。レスポンス（またはフォールト）は
    /// リクエストのエンベロープが指す返信先トピックへ発行される。
    pub fn handle<H: RequestHandler>(
        mut self,
        configure: impl FnOnce(ConsumerBuilder) -> ConsumerBuilder,
    ) -> Self {
        let consumer = configure(ConsumerBuilder::new());
        let serializer = self.serializer.clone();
        let dispatch: DispatchFn = Arc::new(move |resolver, record| {
            let serializer = serializer.clone();
            Box::pin(async move {
                let headers = MessageHeaders::from_transport(&record.headers);
                let (correlation_id, reply_to) = match (headers.correlation_id, headers.reply_to) {
                    (Some(id), Some(reply_to)) => (id, reply_to),
                    _ => {
                        tracing::warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            "request without correlation headers, skipping"
                        );
                        return Ok(None);
                    }
                };
                let request: H::Request = serializer.deserialize(&record.payload)?;
                let handler = resolver.resolve::<H>().ok_or_else(|| {
                    MessageBusError::InvalidConfiguration(format!(
                        "no handler instance registered for {}",
                        std::any::type_name::<H>()
                    ))
                })?;
                let reply = match handler.handle(request).await {
                    Ok(response) => OutboundRecord {
                        topic: reply_to,
                        key: None,
                        partition: PARTITION_ANY,
                        payload: serializer.serialize(&response)?,
                        headers: MessageHeaders::reply(correlation_id).to_transport(),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, topic = %record.topic, "request handler fault");
                        OutboundRecord {
                            topic: reply_to,
                            key: None,
                            partition: PARTITION_ANY,
                            payload: Vec::new(),
                            headers: MessageHeaders::fault_reply(correlation_id, e.to_string())
                                .to_transport(),
                        }
                    }
                };
                Ok(Some(reply))
            })
        });
        self.consumers.push(ConsumerRegistration {
            message_type: std::any::type_name::<H::Request>(),
            handler_type: std::any::type_name::<H>(),
            topic: consumer.topic,
            group: consumer.group,
            kind: HandlerKind::RequestHandler,
            instances: consumer.instances,
            checkpoint_count: consumer.checkpoint_count,
            checkpoint_duration: consumer.checkpoint_duration,
            dispatch,
        });
        self
    }

    /// リクエスト/レスポンスのレスポンス受信側を設定する。
    pub fn expect_request_responses(
        mut self,
        configure: impl FnOnce(RequestResponseBuilder) -> RequestResponseBuilder,
    ) -> Self {
        let settings = configure(RequestResponseBuilder::new()).into_settings();
        if self.request_response.replace(settings).is_some() {
            self.errors
                .push("request/response configured more than once".to_string());
        }
        self
    }

    /// 登録内容を検証し、バスを構築して起動する。
    /// Tokio ランタイム上で呼び出す必要がある。
    pub fn build(self) -> Result<MessageBus<S>, MessageBusError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(MessageBusError::InvalidConfiguration(error));
        }

        let settings = BusSettings {
            instance_id: self.instance_id,
            producers: self.producers,
            consumers: self.consumers,
            request_response: self.request_response,
        };
        settings.validate()?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None if settings.consumers.is_empty() => {
                Arc::new(HandlerRegistry::new()) as Arc<dyn HandlerResolver>
            }
            None => {
                return Err(MessageBusError::InvalidConfiguration(
                    "a handler resolver is required when consumers are registered".to_string(),
                ))
            }
        };

        let registry = Arc::new(PendingRequestRegistry::new());
        let plans = build_group_plans(&settings, &resolver, &registry);

        let transport_settings = self.transport.ok_or_else(|| {
            MessageBusError::InvalidConfiguration("no transport configured".to_string())
        })?;
        let transport: Arc<dyn MessageTransport> = match transport_settings {
            TransportSettings::Memory(memory) => MemoryTransport::start(memory, plans)?,
            #[cfg(feature = "kafka")]
            TransportSettings::Kafka(kafka) => KafkaTransport::start(&kafka, plans)?,
        };

        let cancel = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(cancel.child_token());

        for consumer in &settings.consumers {
            tracing::debug!(
                topic = %consumer.topic,
                group = %consumer.group,
                handler = consumer.handler_type,
                kind = ?consumer.kind,
                "consumer registered"
            );
        }
        tracing::info!(
            instance_id = settings.instance_id.as_deref().unwrap_or("-"),
            publishers = settings.producers.len(),
            consumers = settings.consumers.len(),
            "message bus started"
        );

        Ok(MessageBus::from_parts(
            settings,
            self.serializer,
            transport,
            registry,
            cancel,
            Some(sweeper),
        ))
    }
}

/// 登録内容をコンシューマーグループ単位の購読計画へ変換する。
/// レスポンストピックはトピック単位でプロセッサー種別を切り替える。
fn build_group_plans(
    settings: &BusSettings,
    resolver: &Arc<dyn HandlerResolver>,
    registry: &Arc<PendingRequestRegistry>,
) -> Vec<GroupConsumerPlan> {
    enum TopicSpec {
        Consumer(ConsumerRegistration),
        Response(RequestResponseSettings),
    }

    let mut groups: HashMap<String, HashMap<String, TopicSpec>> = HashMap::new();
    for consumer in &settings.consumers {
        groups
            .entry(consumer.group.clone())
            .or_default()
            .insert(consumer.topic.clone(), TopicSpec::Consumer(consumer.clone()));
    }
    if let Some(rr) = &settings.request_response {
        groups
            .entry(rr.group.clone())
            .or_default()
            .insert(rr.reply_topic.clone(), TopicSpec::Response(rr.clone()));
    }

    groups
        .into_iter()
        .map(|(group, topics)| {
            let topic_names: Vec<String> = topics.keys().cloned().collect();
            let resolver = resolver.clone();
            let registry = registry.clone();
            let factory: ProcessorFactory = Arc::new(move |topic, partition, context| {
                topics.get(topic).map(|spec| match spec {
                    TopicSpec::Consumer(registration) => Arc::new(ConsumerProcessor::new(
                        topic,
                        partition,
                        registration,
                        resolver.clone(),
                        context,
                    ))
                        as Arc<dyn PartitionProcessor>,
                    TopicSpec::Response(rr) => Arc::new(ResponseProcessor::new(
                        topic,
                        partition,
                        rr,
                        registry.clone(),
                        context,
                    ))
                        as Arc<dyn PartitionProcessor>,
                })
            });
            GroupConsumerPlan {
                group,
                topics: topic_names,
                factory,
            }
        })
        .collect()
}
