mod types;
mod service;

pub mod error;
pub mod logging;
pub mod model;
pub mod ml;
pub mod routes;

pub use error::{ClassifierError, ResourceKind, Result};
pub use service::{top1, ClassifierService, ModelState};
pub use types::ClassificationResult;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;

use model::{AppConfig, InitMode};
use routes::AppState;

/// 設定に従ってモデルを準備し、HTTPサーバーを起動する
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("Dish Detector v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    tokio::fs::create_dir_all(&config.server.upload_dir).await?;

    let service = Arc::new(ClassifierService::from_config(&config));

    if config.init_mode == InitMode::Eager {
        let init_service = service.clone();
        tokio::task::spawn_blocking(move || init_service.initialize())
            .await
            .map_err(|e| anyhow::anyhow!("初期化タスクが異常終了しました: {}", e))??;
    }

    let state = Arc::new(AppState::new(service.clone(), &config.server.upload_dir));
    let shutdown = state.shutdown.clone();
    let app = routes::router(state, &config.server);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("サーバーを起動します: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // 遅延初期化で構成不一致が判明した場合は異常終了
    if let Some(reason) = service.fatal_error() {
        anyhow::bail!("モデル構成が一致しません: {}", reason);
    }

    tracing::info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal(shutdown: Arc<Notify>) {
    tokio::select! {
        _ = shutdown.notified() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Ctrl+C の待機に失敗しました: {}", e);
                shutdown.notified().await;
            }
        }
    }
}
