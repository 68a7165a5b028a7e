use std::sync::{Arc, LazyLock};

use nalu_bus::Session;
use tokio::sync::RwLock;

static PLAYER: LazyLock<RwLock<Option<Arc<Session>>>> = LazyLock::new(|| RwLock::new(None));

pub(crate) async fn set_session(session: Arc<Session>) {
    if let Some(previous) = PLAYER.write().await.replace(session) {
        previous.stop();
    }
}

pub(crate) async fn current_session() -> Option<Arc<Session>> {
    PLAYER.read().await.clone()
}

pub(crate) async fn take_session() -> Option<Arc<Session>> {
    PLAYER.write().await.take()
}
