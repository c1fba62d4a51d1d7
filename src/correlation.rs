use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::envelope::MessageHeaders;
use crate::error::MessageBusError;

/// 期限切れ掃き出しの周期。リクエストタイムアウトの分解能を決める。
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// CorrelationId はリクエストとレスポンスを対応付ける相関 ID を表す。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// 新しい CorrelationId を UUID v4 で生成する。
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// 既存の文字列から CorrelationId を生成する。
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// 文字列として取得する。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 保留中リクエストの完了通知チャネル。成功時はレスポンスのペイロード、
/// 失敗時はエラーを運ぶ。
type ReplySender = oneshot::Sender<Result<Vec<u8>, MessageBusError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Vec<u8>, MessageBusError>>;

struct PendingEntry {
    deadline: Instant,
    timeout: Duration,
    reply: ReplySender,
}

/// PendingRequestRegistry は相関 ID をキーとする保留中リクエストの台帳。
/// 送信時に登録され、レスポンス到着・タイムアウト・キャンセル・
/// シャットダウンのいずれかで除去される。
#[derive(Default)]
pub(crate) struct PendingRequestRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequestRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 保留中リクエストを登録し、完了を待つ受信側を返す。
    pub(crate) fn register(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        timeout: Duration,
    ) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            deadline,
            timeout,
            reply: tx,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.as_str().to_string(), entry);
        }
        rx
    }

    /// 相関 ID に対応するリクエストをレスポンスで解決する。
    /// 未登録（タイムアウト済み等）の場合は false。
    pub(crate) fn try_resolve(&self, id: &str, payload: Vec<u8>) -> bool {
        match self.take(id) {
            Some(entry) => {
                let _ = entry.reply.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// 相関 ID に対応するリクエストをエラーで失敗させる。
    pub(crate) fn try_fail(&self, id: &str, error: MessageBusError) -> bool {
        match self.take(id) {
            Some(entry) => {
                let _ = entry.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// 相関 ID のエントリーを通知なしで除去する（キャンセル用）。
    /// エントリーが存在した場合は true。
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// 期限を過ぎたエントリーを全て RequestTimeout で失敗させ、件数を返す。
    pub(crate) fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingEntry> = match self.entries.lock() {
            Ok(mut entries) => {
                let ids: Vec<String> = entries
                    .iter()
                    .filter(|(_, e)| e.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter().filter_map(|id| entries.remove(id)).collect()
            }
            Err(_) => Vec::new(),
        };
        let count = expired.len();
        for entry in expired {
            let _ = entry
                .reply
                .send(Err(MessageBusError::RequestTimeout(entry.timeout)));
        }
        count
    }

    /// 残っている全エントリーを BusShutdown で失敗させる。
    pub(crate) fn fail_all_shutdown(&self) {
        let drained: Vec<PendingEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };
        for entry in drained {
            let _ = entry.reply.send(Err(MessageBusError::BusShutdown));
        }
    }

    /// 保留中リクエストの件数を返す。
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// レスポンスプロセッサーから呼ばれ、到着したレスポンスを
    /// 対応する保留中リクエストへ配送する。相関 ID を欠くレスポンスは
    /// エラー、タイムアウト後に届いた遅延レスポンスは破棄して成功扱い。
    pub(crate) fn on_response_arrived(
        &self,
        headers: MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), MessageBusError> {
        let id = headers.correlation_id.ok_or_else(|| {
            MessageBusError::SerializationFailed("response without correlation id".to_string())
        })?;
        let known = match headers.fault {
            Some(message) => self.try_fail(&id, MessageBusError::HandlerFaulted(message)),
            None => self.try_resolve(&id, payload),
        };
        if !known {
            tracing::debug!(correlation_id = %id, "late reply dropped");
        }
        Ok(())
    }

    /// 期限切れ掃き出しのバックグラウンドタスクを起動する。
    pub(crate) fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = registry.sweep_expired(Instant::now());
                        if expired > 0 {
                            tracing::debug!(expired, "pending requests timed out");
                        }
                    }
                }
            }
        })
    }

    fn take(&self, id: &str) -> Option<PendingEntry> {
        self.entries.lock().ok().and_then(|mut e| e.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_correlation_id_unique() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_correlation_id_from_string() {
        let id = CorrelationId::from_string("req-abc-123");
        assert_eq!(id.as_str(), "req-abc-123");
        assert_eq!(format!("{}", id), "req-abc-123");
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = PendingRequestRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(&id, Instant::now() + Duration::from_secs(30), Duration::from_secs(30));

        assert!(registry.try_resolve(id.as_str(), b"response".to_vec()));
        assert_eq!(registry.len(), 0);

        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload, b"response");
    }

    #[tokio::test]
    async fn test_register_and_fail() {
        let registry = PendingRequestRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(&id, Instant::now() + Duration::from_secs(30), Duration::from_secs(30));

        assert!(registry.try_fail(id.as_str(), MessageBusError::HandlerFaulted("boom".to_string())));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(MessageBusError::HandlerFaulted(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_returns_false() {
        let registry = PendingRequestRegistry::new();
        assert!(!registry.try_resolve("unknown", Vec::new()));
        assert!(!registry.try_fail("unknown", MessageBusError::RequestCancelled));
    }

    #[tokio::test]
    async fn test_sweep_expired_fails_with_timeout() {
        let registry = PendingRequestRegistry::new();
        let id = CorrelationId::new();
        let timeout = Duration::from_millis(500);
        let rx = registry.register(&id, Instant::now(), timeout);

        let swept = registry.sweep_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(swept, 1);
        assert_eq!(registry.len(), 0);

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(MessageBusError::RequestTimeout(t)) if t == timeout));
    }

    #[tokio::test]
    async fn test_sweep_keeps_unexpired_entries() {
        let registry = PendingRequestRegistry::new();
        let id = CorrelationId::new();
        let _rx = registry.register(
            &id,
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs(60),
        );

        let swept = registry.sweep_expired(Instant::now());
        assert_eq!(swept, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_shutdown() {
        let registry = PendingRequestRegistry::new();
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        let rx1 = registry.register(&id1, Instant::now() + Duration::from_secs(30), Duration::from_secs(30));
        let rx2 = registry.register(&id2, Instant::now() + Duration::from_secs(30), Duration::from_secs(30));

        registry.fail_all_shutdown();
        assert_eq!(registry.len(), 0);

        assert!(matches!(rx1.await.unwrap(), Err(MessageBusError::BusShutdown)));
        assert!(matches!(rx2.await.unwrap(), Err(MessageBusError::BusShutdown)));
    }

    #[tokio::test]
    async fn test_on_response_arrived_resolves_pending() {
        let registry = PendingRequestRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(&id, Instant::now() + Duration::from_secs(30), Duration::from_secs(30));

        let headers = MessageHeaders::reply(id.as_str());
        registry.on_response_arrived(headers, b"ok".to_vec()).unwrap();

        assert_eq!(rx.await.unwrap().unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_on_response_arrived_without_correlation_id() {
        let registry = PendingRequestRegistry::new();
        let result = registry.on_response_arrived(MessageHeaders::default(), Vec::new());
        assert!(matches!(
            result.unwrap_err(),
            MessageBusError::SerializationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_sweeper_times_out_pending_request() {
        let registry = Arc::new(PendingRequestRegistry::new());
        let token = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(token.clone());

        let id = CorrelationId::new();
        let timeout = Duration::from_millis(50);
        let rx = registry.register(&id, Instant::now() + timeout, timeout);

        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MessageBusError::RequestTimeout(_))));

        token.cancel();
        let _ = sweeper.await;
    }
}
