use serde::{Deserialize, Serialize};

use crate::error::MessageBusError;

/// KafkaSettings は Kafka トランスポートの接続設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSettings {
    /// Kafka ブローカーアドレスのリスト（例: ["kafka:9092"]）
    pub brokers: Vec<String>,
    /// セキュリティプロトコル（PLAINTEXT / SSL / SASL_PLAINTEXT / SASL_SSL）
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// SASL 認証設定
    #[serde(default)]
    pub sasl: SaslSettings,
    /// コンシューマーセッションタイムアウト（ミリ秒）
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// コミット済みオフセットが無い場合の開始位置（earliest / latest）
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// プロデューサーの配送タイムアウト（ミリ秒）
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// パーティションワーカーの取り込みキュー長
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// rdkafka へそのまま渡す追加プロパティ
    #[serde(default)]
    pub properties: Vec<(String, String)>,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_message_timeout_ms() -> u64 {
    30000
}

fn default_queue_depth() -> usize {
    256
}

/// SaslSettings は SASL 認証の設定を表す。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaslSettings {
    #[serde(default)]
    pub mechanism: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl KafkaSettings {
    /// ビルダーを取得する。
    pub fn builder() -> KafkaSettingsBuilder {
        KafkaSettingsBuilder::default()
    }

    /// ブローカーアドレスをカンマ区切り文字列で返す（rdkafka の bootstrap.servers 用）。
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// プロデューサー・コンシューマー共通の rdkafka 設定を組み立てる。
    pub(crate) fn base_client_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = rdkafka::config::ClientConfig::new();
        config.set("bootstrap.servers", self.bootstrap_servers());
        config.set("security.protocol", &self.security_protocol);
        if !self.sasl.mechanism.is_empty() {
            config.set("sasl.mechanism", &self.sasl.mechanism);
            config.set("sasl.username", &self.sasl.username);
            config.set("sasl.password", &self.sasl.password);
        }
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

/// KafkaSettingsBuilder は KafkaSettings のビルダー。
#[derive(Default)]
pub struct KafkaSettingsBuilder {
    brokers: Vec<String>,
    security_protocol: Option<String>,
    sasl: Option<SaslSettings>,
    session_timeout_ms: Option<u64>,
    auto_offset_reset: Option<String>,
    message_timeout_ms: Option<u64>,
    queue_depth: Option<usize>,
    properties: Vec<(String, String)>,
}

impl KafkaSettingsBuilder {
    /// ブローカーアドレスを設定する。
    pub fn brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = brokers;
        self
    }

    /// セキュリティプロトコルを設定する。
    pub fn security_protocol(mut self, protocol: &str) -> Self {
        self.security_protocol = Some(protocol.to_string());
        self
    }

    /// SASL 認証設定を設定する。
    pub fn sasl(mut self, sasl: SaslSettings) -> Self {
        self.sasl = Some(sasl);
        self
    }

    /// セッションタイムアウト（ミリ秒）を設定する。
    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = Some(ms);
        self
    }

    /// コミット済みオフセットが無い場合の開始位置を設定する。
    pub fn auto_offset_reset(mut self, reset: &str) -> Self {
        self.auto_offset_reset = Some(reset.to_string());
        self
    }

    /// プロデューサーの配送タイムアウト（ミリ秒）を設定する。
    pub fn message_timeout_ms(mut self, ms: u64) -> Self {
        self.message_timeout_ms = Some(ms);
        self
    }

    /// パーティションワーカーの取り込みキュー長を設定する。
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// rdkafka へそのまま渡す追加プロパティを設定する。
    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    /// KafkaSettings を構築する。ブローカーが未設定の場合はエラーを返す。
    pub fn build(self) -> Result<KafkaSettings, MessageBusError> {
        if self.brokers.is_empty() {
            return Err(MessageBusError::InvalidConfiguration(
                "at least one broker must be specified".to_string(),
            ));
        }
        Ok(KafkaSettings {
            brokers: self.brokers,
            security_protocol: self
                .security_protocol
                .unwrap_or_else(default_security_protocol),
            sasl: self.sasl.unwrap_or_default(),
            session_timeout_ms: self
                .session_timeout_ms
                .unwrap_or_else(default_session_timeout_ms),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(default_auto_offset_reset),
            message_timeout_ms: self
                .message_timeout_ms
                .unwrap_or_else(default_message_timeout_ms),
            queue_depth: self.queue_depth.unwrap_or_else(default_queue_depth),
            properties: self.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_servers_single() {
        let settings = KafkaSettings::builder()
            .brokers(vec!["kafka:9092".to_string()])
            .build()
            .unwrap();
        assert_eq!(settings.bootstrap_servers(), "kafka:9092");
    }

    #[test]
    fn test_bootstrap_servers_multiple() {
        let settings = KafkaSettings::builder()
            .brokers(vec!["kafka-0:9092".to_string(), "kafka-1:9092".to_string()])
            .build()
            .unwrap();
        assert_eq!(settings.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
    }

    #[test]
    fn test_builder_requires_brokers() {
        let err = KafkaSettings::builder().build().unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"brokers": ["kafka:9092"]}"#;
        let settings: KafkaSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.security_protocol, "PLAINTEXT");
        assert_eq!(settings.session_timeout_ms, 30000);
        assert_eq!(settings.auto_offset_reset, "earliest");
        assert_eq!(settings.queue_depth, 256);
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
brokers:
  - "kafka-0.messaging.svc.cluster.local:9092"
security_protocol: "SASL_SSL"
sasl:
  mechanism: "SCRAM-SHA-512"
  username: "bus"
  password: "secret"
"#;
        let settings: KafkaSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.brokers.len(), 1);
        assert_eq!(settings.sasl.mechanism, "SCRAM-SHA-512");
    }

    #[test]
    fn test_builder_with_properties() {
        let settings = KafkaSettings::builder()
            .brokers(vec!["kafka:9092".to_string()])
            .session_timeout_ms(10000)
            .property("fetch.min.bytes", "1024")
            .build()
            .unwrap();
        assert_eq!(settings.session_timeout_ms, 10000);
        assert_eq!(
            settings.properties,
            vec![("fetch.min.bytes".to_string(), "1024".to_string())]
        );
    }
}
