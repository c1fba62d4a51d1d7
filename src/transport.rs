use async_trait::async_trait;

use crate::error::MessageBusError;

/// パーティション未指定を表す値。トランスポート側のパーティショナーに委譲する。
pub const PARTITION_ANY: i32 = -1;

/// OutboundRecord はトランスポートへ送信するレコードを表す。
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// 送信先トピック名
    pub topic: String,
    /// レコードキー（パーティショニングに使用）
    pub key: Option<Vec<u8>>,
    /// 送信先パーティション。PARTITION_ANY でトランスポートに委譲
    pub partition: i32,
    /// シリアライズ済みペイロード
    pub payload: Vec<u8>,
    /// トランスポートヘッダー
    pub headers: Vec<(String, Vec<u8>)>,
}

/// InboundRecord はトランスポートから受信したレコードを表す。
#[derive(Debug, Clone)]
pub struct InboundRecord {
    /// 受信元トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// レコードキー
    pub key: Option<Vec<u8>>,
    /// ペイロード
    pub payload: Vec<u8>,
    /// トランスポートヘッダー
    pub headers: Vec<(String, Vec<u8>)>,
}

/// MessageTransport はレコードの送出とライフサイクルを担うインターフェース。
/// コンシューマーの起動はトランスポート構築時に行われ、このトレイトは
/// ホットパスの送出とシャットダウンのみを公開する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// レコードを送出する。トランスポートが受理した時点で完了する。
    async fn publish(&self, record: OutboundRecord) -> Result<(), MessageBusError>;

    /// コンシューマーを停止し、送出側をフラッシュして閉じる。
    async fn shutdown(&self) -> Result<(), MessageBusError>;
}
