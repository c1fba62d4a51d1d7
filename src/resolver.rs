use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// HandlerResolver はハンドラー型からインスタンスを取得するインターフェース。
/// DI コンテナを持つアプリケーションはこのトレイトでコンテナを接続する。
pub trait HandlerResolver: Send + Sync + 'static {
    /// 型 ID からハンドラーインスタンスを取得する。未登録の場合は None。
    fn resolve_any(&self, type_id: TypeId, type_name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl dyn HandlerResolver {
    /// 型付きでハンドラーインスタンスを取得する。
    pub fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        self.resolve_any(TypeId::of::<H>(), std::any::type_name::<H>())
            .and_then(|instance| instance.downcast::<H>().ok())
    }
}

/// HandlerRegistry は型 ID をキーとする単純な HandlerResolver 実装。
/// コンテナを使わないアプリケーション・テスト向け。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    /// 空の HandlerRegistry を生成する。
    pub fn new() -> Self {
        Self::default()
    }

    /// ハンドラーインスタンスを登録する（ビルダーパターン）。
    pub fn register<H: Send + Sync + 'static>(self, handler: H) -> Self {
        self.register_arc(Arc::new(handler))
    }

    /// 共有済みのハンドラーインスタンスを登録する（ビルダーパターン）。
    pub fn register_arc<H: Send + Sync + 'static>(mut self, handler: Arc<H>) -> Self {
        self.handlers
            .insert(TypeId::of::<H>(), handler as Arc<dyn Any + Send + Sync>);
        self
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve_any(&self, type_id: TypeId, _type_name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handlers.get(&type_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler {
        prefix: String,
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = HandlerRegistry::new().register(EchoHandler {
            prefix: "echo:".to_string(),
        });
        let resolver: Arc<dyn HandlerResolver> = Arc::new(registry);

        let handler = resolver.resolve::<EchoHandler>().unwrap();
        assert_eq!(handler.prefix, "echo:");
    }

    #[test]
    fn test_resolve_unregistered_returns_none() {
        let resolver: Arc<dyn HandlerResolver> = Arc::new(HandlerRegistry::new());
        assert!(resolver.resolve::<EchoHandler>().is_none());
    }

    #[test]
    fn test_register_arc_shares_instance() {
        let instance = Arc::new(EchoHandler {
            prefix: "shared".to_string(),
        });
        let resolver: Arc<dyn HandlerResolver> =
            Arc::new(HandlerRegistry::new().register_arc(instance.clone()));

        let resolved = resolver.resolve::<EchoHandler>().unwrap();
        assert!(Arc::ptr_eq(&instance, &resolved));
    }
}
