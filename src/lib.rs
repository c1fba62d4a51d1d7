//! k1s0-message-bus: トランスポート抽象化メッセージバスライブラリ。
//!
//! Kafka・インメモリトランスポートの上に、一方向の pub/sub と
//! 相関 ID 付きのリクエスト/レスポンスを提供する。メッセージ型・
//! トピック・ハンドラーの対応は MessageBusBuilder で登録し、
//! build() で一括検証される。

pub mod builder;
pub mod bus;
mod checkpoint;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod handler;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
mod processor;
pub mod resolver;
pub mod serializer;
mod settings;
pub mod transport;

pub use builder::{
    ConsumerBuilder, MessageBusBuilder, ProducerBuilder, RequestResponseBuilder, TransportSettings,
};
pub use bus::{MessageBus, SendOptions};
pub use correlation::CorrelationId;
pub use envelope::MessageHeaders;
pub use error::MessageBusError;
pub use handler::{RequestHandler, Subscriber};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaSettings, SaslSettings};
pub use memory::MemorySettings;
pub use resolver::{HandlerRegistry, HandlerResolver};
pub use serializer::{JsonSerializer, MessageSerializer};
pub use settings::ResponseFaultHook;
pub use transport::{InboundRecord, MessageTransport, OutboundRecord, PARTITION_ANY};

#[cfg(feature = "mock")]
pub use transport::MockMessageTransport;
