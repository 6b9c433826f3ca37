//! Racine de composition du serveur IM
//!
//! Ordre de démarrage: .env → configuration → logging → PostgreSQL
//! (migrations optionnelles) → Redis → registre, services, pool de push →
//! routeur axum → serve avec arrêt gracieux. Tous les collaborateurs sont
//! construits une fois ici et passés par référence; aucun singleton.

use im_server::config::{LogFormat, LoggingConfig};
use im_server::{
    api, AppState, AsyncPusher, Dispatcher, IdAllocator, ImCache, ImError, IngestService,
    ReadService, SequenceGenerator, ServerConfig, Storage, WsServer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ImError> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    let _log_guard = init_logging(&config.logging);

    info!("🚀 Démarrage du serveur IM...");
    info!(config = %config, "⚙️ Configuration chargée");

    // ═══════════════════════════════════════════════════════════════════
    // COLLABORATEURS
    // ═══════════════════════════════════════════════════════════════════

    let storage = Storage::connect(&config.database).await?;
    if config.database.auto_migrate {
        storage.migrate().await?;
    }

    let cache = ImCache::connect(&config.cache).await?;
    let ids = Arc::new(IdAllocator::new(config.id.node_id));
    let sequence = SequenceGenerator::new(cache.clone());

    let ws = Arc::new(WsServer::new(&config.ws));
    let ingest = Arc::new(IngestService::new(
        storage.clone(),
        cache.clone(),
        Arc::clone(&ids),
        sequence.clone(),
        &config.cache,
        &config.chat,
    ));
    let read = Arc::new(ReadService::new(
        storage.clone(),
        cache.clone(),
        &config.cache,
        &config.chat,
    ));
    let pusher = Arc::new(AsyncPusher::new(&config.push, Arc::clone(&ws)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&ingest),
        Arc::clone(&read),
        Arc::clone(&pusher),
    ));

    let state = AppState {
        ws: Arc::clone(&ws),
        dispatcher,
        ingest,
        read,
    };
    let app = api::router(state);

    // ═══════════════════════════════════════════════════════════════════
    // SERVE
    // ═══════════════════════════════════════════════════════════════════

    let listener = TcpListener::bind(config.server.bind_addr)
        .await
        .map_err(|e| ImError::configuration_error(&format!("Bind error: {}", e)))?;

    info!("✅ Serveur démarré sur http://{}", config.server.bind_addr);
    info!("📊 Endpoints disponibles:");
    info!("   - GET  /health                     - Vérification de santé");
    info!("   - GET  /ws                         - Connexion WebSocket");
    info!("   - POST /v1/chat/send               - Envoi de message");
    info!("   - GET  /v1/chat/conversation/list  - Liste de conversations");
    info!("   - POST /v1/chat/msg/history/list   - Historique paginé");
    info!("   - POST /v1/chat/report/msg/read    - Report de lecture");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ImError::internal_error(format!("Server error: {}", e)))?;

    // Drainage borné du pool; les travaux non drainés sont abandonnés
    pusher.shutdown().await;

    info!("👋 Serveur arrêté");
    Ok(())
}

/// Attend SIGINT ou SIGTERM pour l'arrêt gracieux
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "❌ Installation du handler SIGTERM échouée"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 SIGINT reçu"),
        _ = terminate => info!("🛑 SIGTERM reçu"),
    }
}

/// Initialise tracing; retourne le guard du writer non bloquant quand la
/// sortie est un fichier tournant
fn init_logging(cfg: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    for directive in &cfg.filters {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    match &cfg.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "im-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            match cfg.format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init(),
                LogFormat::Pretty => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
                LogFormat::Compact => tracing_subscriber::fmt()
                    .compact()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
            }
            Some(guard)
        }
        None => {
            match cfg.format {
                LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
                LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
                LogFormat::Compact => tracing_subscriber::fmt()
                    .compact()
                    .with_env_filter(filter)
                    .init(),
            }
            None
        }
    }
}
