use serde::{Deserialize, Serialize};

use crate::error::MessageBusError;

/// 相関 ID を運ぶトランスポートヘッダーのキー。
pub const HEADER_CORRELATION_ID: &str = "correlation_id";
/// レスポンス送信先トピックを運ぶトランスポートヘッダーのキー。
pub const HEADER_REPLY_TO: &str = "reply_to";
/// リクエストの有効期限（エポックミリ秒）を運ぶトランスポートヘッダーのキー。
pub const HEADER_EXPIRES_AT: &str = "expires_at";
/// ハンドラーフォールトのメッセージを運ぶトランスポートヘッダーのキー。
pub const HEADER_FAULT: &str = "fault";

/// MessageHeaders はリクエスト/レスポンスの相関メタデータを表すエンベロープ。
/// ペイロード本体には手を付けず、トランスポートのメッセージヘッダーとして
/// 運ばれる。ヘッダー非対応のトランスポートには長さプレフィックス付きで
/// 本体の先頭に埋め込む。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// リクエストとレスポンスを対応付ける相関 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// レスポンスを期待するトピック（リクエストのみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// 送信側の期限（エポックミリ秒、参考情報）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// ハンドラーフォールトのメッセージ（フォールトレスポンスのみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl MessageHeaders {
    /// リクエスト用のエンベロープを生成する。
    pub fn request(
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            expires_at: Some(expires_at),
            fault: None,
        }
    }

    /// 成功レスポンス用のエンベロープを生成する。
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            expires_at: None,
            fault: None,
        }
    }

    /// フォールトレスポンス用のエンベロープを生成する。
    pub fn fault_reply(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            expires_at: None,
            fault: Some(message.into()),
        }
    }

    /// トランスポートヘッダーのリストへ変換する。
    pub fn to_transport(&self) -> Vec<(String, Vec<u8>)> {
        let mut headers = Vec::new();
        if let Some(id) = &self.correlation_id {
            headers.push((HEADER_CORRELATION_ID.to_string(), id.as_bytes().to_vec()));
        }
        if let Some(reply_to) = &self.reply_to {
            headers.push((HEADER_REPLY_TO.to_string(), reply_to.as_bytes().to_vec()));
        }
        if let Some(expires_at) = self.expires_at {
            headers.push((
                HEADER_EXPIRES_AT.to_string(),
                expires_at.to_string().into_bytes(),
            ));
        }
        if let Some(fault) = &self.fault {
            headers.push((HEADER_FAULT.to_string(), fault.as_bytes().to_vec()));
        }
        headers
    }

    /// トランスポートヘッダーのリストから復元する。
    /// 不明なキーは無視し、壊れた値は未設定として扱う。
    pub fn from_transport(headers: &[(String, Vec<u8>)]) -> Self {
        let mut parsed = Self::default();
        for (key, value) in headers {
            match key.as_str() {
                HEADER_CORRELATION_ID => {
                    parsed.correlation_id = String::from_utf8(value.clone()).ok();
                }
                HEADER_REPLY_TO => {
                    parsed.reply_to = String::from_utf8(value.clone()).ok();
                }
                HEADER_EXPIRES_AT => {
                    parsed.expires_at = std::str::from_utf8(value)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok());
                }
                HEADER_FAULT => {
                    parsed.fault = String::from_utf8(value.clone()).ok();
                }
                _ => {}
            }
        }
        parsed
    }

    /// ヘッダー非対応トランスポート向けに、ヘッダーブロックを
    /// 長さプレフィックス付きで本体の先頭へ埋め込む。
    pub fn encode_framed(&self, payload: &[u8]) -> Result<Vec<u8>, MessageBusError> {
        let block = serde_json::to_vec(self)
            .map_err(|e| MessageBusError::SerializationFailed(e.to_string()))?;
        let mut framed = Vec::with_capacity(4 + block.len() + payload.len());
        framed.extend_from_slice(&(block.len() as u32).to_be_bytes());
        framed.extend_from_slice(&block);
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// encode_framed で生成したバイト列からエンベロープと本体を取り出す。
    pub fn decode_framed(bytes: &[u8]) -> Result<(Self, Vec<u8>), MessageBusError> {
        if bytes.len() < 4 {
            return Err(MessageBusError::SerializationFailed(
                "framed message too short".to_string(),
            ));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[..4]);
        let block_len = u32::from_be_bytes(len_bytes) as usize;
        if bytes.len() < 4 + block_len {
            return Err(MessageBusError::SerializationFailed(
                "framed header block truncated".to_string(),
            ));
        }
        let headers: Self = serde_json::from_slice(&bytes[4..4 + block_len])
            .map_err(|e| MessageBusError::SerializationFailed(e.to_string()))?;
        Ok((headers, bytes[4 + block_len..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_roundtrip() {
        let headers = MessageHeaders::request("corr-001", "orders.reply.v1", 1_700_000_000_000);
        let transport = headers.to_transport();
        let parsed = MessageHeaders::from_transport(&transport);
        assert_eq!(parsed, headers);
    }

    #[test]
    fn test_fault_reply_headers() {
        let headers = MessageHeaders::fault_reply("corr-002", "order not found");
        let transport = headers.to_transport();
        let parsed = MessageHeaders::from_transport(&transport);
        assert_eq!(parsed.correlation_id.as_deref(), Some("corr-002"));
        assert_eq!(parsed.fault.as_deref(), Some("order not found"));
        assert!(parsed.reply_to.is_none());
    }

    #[test]
    fn test_from_transport_ignores_unknown_keys() {
        let raw = vec![
            (HEADER_CORRELATION_ID.to_string(), b"corr-003".to_vec()),
            ("trace_id".to_string(), b"abc".to_vec()),
        ];
        let parsed = MessageHeaders::from_transport(&raw);
        assert_eq!(parsed.correlation_id.as_deref(), Some("corr-003"));
        assert!(parsed.reply_to.is_none());
    }

    #[test]
    fn test_from_transport_tolerates_broken_expiry() {
        let raw = vec![(HEADER_EXPIRES_AT.to_string(), b"not a number".to_vec())];
        let parsed = MessageHeaders::from_transport(&raw);
        assert!(parsed.expires_at.is_none());
    }

    #[test]
    fn test_framed_roundtrip() {
        let headers = MessageHeaders::request("corr-004", "reply.v1", 42);
        let framed = headers.encode_framed(b"payload bytes").unwrap();
        let (parsed, body) = MessageHeaders::decode_framed(&framed).unwrap();
        assert_eq!(parsed, headers);
        assert_eq!(body, b"payload bytes");
    }

    #[test]
    fn test_decode_framed_too_short() {
        let result = MessageHeaders::decode_framed(&[0, 0]);
        assert!(matches!(
            result.unwrap_err(),
            MessageBusError::SerializationFailed(_)
        ));
    }

    #[test]
    fn test_decode_framed_truncated_block() {
        let mut bytes = (100u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let result = MessageHeaders::decode_framed(&bytes);
        assert!(matches!(
            result.unwrap_err(),
            MessageBusError::SerializationFailed(_)
        ));
    }
}
