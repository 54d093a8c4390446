use std::env;
use std::sync::Arc;

use backend::{app, AppState, LogSink, MemoryStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let store = if let Ok(path) = env::var("PERSIST_PATH") {
        MemoryStore::with_persistence(path).await
    } else {
        MemoryStore::new()
    };
    let state = AppState::new(Arc::new(store), Arc::new(LogSink));
    let app = app(state);

    tracing::info!("listening on 0.0.0.0:3000");
    axum::serve(
        tokio::net::TcpListener::bind("0.0.0.0:3000")
            .await
            .expect("bind"),
        app,
    )
    .await
    .expect("server error");
}
