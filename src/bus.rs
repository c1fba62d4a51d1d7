use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationId, PendingRequestRegistry};
use crate::envelope::MessageHeaders;
use crate::error::MessageBusError;
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::settings::{BusSettings, ProducerRegistration};
use crate::transport::{MessageTransport, OutboundRecord, PARTITION_ANY};

/// SendOptions は send 呼び出し単位の設定を表す。
#[derive(Default)]
pub struct SendOptions {
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// この呼び出しのタイムアウトを設定する。型別・バス全体の
    /// デフォルトより優先される。
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// キャンセル用トークンを設定する。
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

struct BusInner<S: MessageSerializer> {
    serializer: Arc<S>,
    settings: BusSettings,
    transport: Arc<dyn MessageTransport>,
    registry: Arc<PendingRequestRegistry>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl<S: MessageSerializer> Drop for BusInner<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.registry.fail_all_shutdown();
    }
}

/// MessageBus は発行・購読・リクエスト/レスポンスの公開 API を提供する。
/// Publish / Send / シャットダウンは並行呼び出しに対して安全で、
/// クローンはバスの共有ハンドルとして振る舞う。
pub struct MessageBus<S: MessageSerializer = JsonSerializer> {
    inner: Arc<BusInner<S>>,
}

impl<S: MessageSerializer> Clone for MessageBus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: MessageSerializer> std::fmt::Debug for MessageBus<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus").finish()
    }
}

impl MessageBus<JsonSerializer> {
    /// デフォルトの JSON シリアライザーでビルダーを取得する。
    pub fn builder() -> crate::builder::MessageBusBuilder<JsonSerializer> {
        crate::builder::MessageBusBuilder::new()
    }
}

impl<S: MessageSerializer> MessageBus<S> {
    pub(crate) fn from_parts(
        settings: BusSettings,
        serializer: Arc<S>,
        transport: Arc<dyn MessageTransport>,
        registry: Arc<PendingRequestRegistry>,
        cancel: CancellationToken,
        sweeper: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                serializer,
                settings,
                transport,
                registry,
                cancel,
                sweeper: Mutex::new(sweeper),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// メッセージを登録済みのトピックへ発行する。
    pub async fn publish<T: Serialize + Send + Sync + 'static>(
        &self,
        message: &T,
    ) -> Result<(), MessageBusError> {
        let registration = self.registration_for::<T>()?;
        let topic = registration.topic.clone();
        self.publish_record(message, Some(registration), topic, Vec::new())
            .await
    }

    /// メッセージを指定トピックへ発行する。発行登録があればその
    /// キー・パーティションセレクターが適用される。
    pub async fn publish_to<T: Serialize + Send + Sync + 'static>(
        &self,
        message: &T,
        topic: &str,
    ) -> Result<(), MessageBusError> {
        let registration = self.inner.settings.producers.get(&TypeId::of::<T>());
        self.publish_record(message, registration, topic.to_string(), Vec::new())
            .await
    }

    /// リクエストを送信してレスポンスを待つ。
    pub async fn send<Req, Resp>(&self, request: &Req) -> Result<Resp, MessageBusError>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned,
    {
        self.send_with_options(request, SendOptions::default())
            .await
    }

    /// タイムアウト・キャンセルを指定してリクエストを送信する。
    /// タイムアウトは呼び出し時指定 > 型別デフォルト > バス全体の
    /// デフォルトの順で決まる。
    pub async fn send_with_options<Req, Resp>(
        &self,
        request: &Req,
        options: SendOptions,
    ) -> Result<Resp, MessageBusError>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned,
    {
        self.ensure_running()?;
        let request_response = self.inner.settings.request_response.as_ref().ok_or_else(|| {
            MessageBusError::InvalidConfiguration("request/response is not configured".to_string())
        })?;
        let registration = self.registration_for::<Req>()?;
        let timeout = options
            .timeout
            .or(registration.request_timeout)
            .unwrap_or(request_response.default_timeout);

        if let Some(token) = &options.cancellation {
            if token.is_cancelled() {
                return Err(MessageBusError::RequestCancelled);
            }
        }

        let correlation_id = CorrelationId::new();
        let expires_at = chrono::Utc::now().timestamp_millis() + timeout.as_millis() as i64;
        let headers = MessageHeaders::request(
            correlation_id.as_str(),
            request_response.reply_topic.as_str(),
            expires_at,
        );
        let payload = self.inner.serializer.serialize(request)?;
        let record = build_record(
            request,
            Some(registration),
            registration.topic.clone(),
            payload,
            headers.to_transport(),
        );

        let mut receiver =
            self.inner
                .registry
                .register(&correlation_id, Instant::now() + timeout, timeout);

        if let Err(e) = self.inner.transport.publish(record).await {
            self.inner.registry.remove(correlation_id.as_str());
            return Err(e);
        }

        let result = match &options.cancellation {
            Some(token) => {
                tokio::select! {
                    result = &mut receiver => result,
                    _ = token.cancelled() => {
                        if self.inner.registry.remove(correlation_id.as_str()) {
                            return Err(MessageBusError::RequestCancelled);
                        }
                        // レスポンスは既に確定している
                        receiver.await
                    }
                }
            }
            None => receiver.await,
        };

        let payload = result.map_err(|_| MessageBusError::BusShutdown)??;
        self.inner.serializer.deserialize::<Resp>(&payload)
    }

    /// バスを停止する。グループコンシューマーの停止、プロデューサーの
    /// クローズ、保留中リクエストの失敗通知の順に行う。冪等。
    pub async fn shutdown(&self) -> Result<(), MessageBusError> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("message bus shutting down");
        if let Err(e) = self.inner.transport.shutdown().await {
            tracing::warn!(error = %e, "transport shutdown reported an error");
        }
        self.inner.cancel.cancel();
        let sweeper = self.inner.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.inner.registry.fail_all_shutdown();
        Ok(())
    }

    /// 保留中リクエストの件数を返す。
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    async fn publish_record<T: Serialize + Send + Sync + 'static>(
        &self,
        message: &T,
        registration: Option<&ProducerRegistration>,
        topic: String,
        headers: Vec<(String, Vec<u8>)>,
    ) -> Result<(), MessageBusError> {
        self.ensure_running()?;
        let payload = self.inner.serializer.serialize(message)?;
        let record = build_record(message, registration, topic, payload, headers);
        self.inner.transport.publish(record).await
    }

    fn registration_for<T: 'static>(&self) -> Result<&ProducerRegistration, MessageBusError> {
        self.inner
            .settings
            .producers
            .get(&TypeId::of::<T>())
            .ok_or_else(|| {
                MessageBusError::InvalidConfiguration(format!(
                    "no publisher registration for {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    fn ensure_running(&self) -> Result<(), MessageBusError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(MessageBusError::BusShutdown);
        }
        Ok(())
    }
}

/// 発行登録のセレクターを適用して送信レコードを組み立てる。
fn build_record<T: Send + Sync + 'static>(
    message: &T,
    registration: Option<&ProducerRegistration>,
    topic: String,
    payload: Vec<u8>,
    headers: Vec<(String, Vec<u8>)>,
) -> OutboundRecord {
    let any: &dyn Any = message;
    let key = registration
        .and_then(|r| r.key_selector.as_ref())
        .and_then(|selector| selector(any));
    let partition = registration
        .and_then(|r| r.partition_selector.as_ref())
        .and_then(|selector| selector(any))
        .unwrap_or(PARTITION_ANY);
    OutboundRecord {
        topic,
        key,
        partition,
        payload,
        headers,
    }
}
