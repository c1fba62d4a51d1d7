use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MessageBusError;

/// MessageSerializer はメッセージ本体のバイト列変換インターフェース。
/// バスはエンベロープヘッダー以外のペイロードを解釈せず、変換は全て
/// この実装に委譲する。
pub trait MessageSerializer: Send + Sync + 'static {
    /// メッセージをバイト列へシリアライズする。
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MessageBusError>;

    /// バイト列からメッセージをデシリアライズする。
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MessageBusError>;
}

/// JsonSerializer は serde_json を使ったデフォルト実装。
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MessageBusError> {
        serde_json::to_vec(value).map_err(|e| MessageBusError::SerializationFailed(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MessageBusError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessageBusError::SerializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        amount: u64,
    }

    #[test]
    fn test_json_roundtrip() {
        let serializer = JsonSerializer;
        let value = Sample {
            id: "order-1".to_string(),
            amount: 1200,
        };
        let bytes = serializer.serialize(&value).unwrap();
        let parsed: Sample = serializer.deserialize(&bytes).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_deserialize_invalid_payload() {
        let serializer = JsonSerializer;
        let result: Result<Sample, _> = serializer.deserialize(b"not json");
        assert!(matches!(
            result.unwrap_err(),
            MessageBusError::SerializationFailed(_)
        ));
    }
}
