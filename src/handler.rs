use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MessageBusError;

/// Subscriber は一方向メッセージの購読インターフェース。
/// エラーを返した場合はログに記録され、パーティションの処理は継続する。
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// 購読するメッセージ型。
    type Message: DeserializeOwned + Send + 'static;

    /// 受信したメッセージを処理する。
    async fn on_message(&self, message: Self::Message, topic: &str) -> Result<(), MessageBusError>;
}

/// RequestHandler はリクエスト/レスポンスのサーバー側インターフェース。
/// エラーを返した場合はフォールトレスポンスとして送信元に返される。
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// 処理するリクエスト型。
    type Request: DeserializeOwned + Send + 'static;
    /// 返却するレスポンス型。
    type Response: Serialize + Send + Sync + 'static;

    /// リクエストを処理してレスポンスを返す。
    async fn handle(&self, request: Self::Request) -> Result<Self::Response, MessageBusError>;
}
