use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use payment_orders as api;
use api::gateway::{HttpPaymentGateway, PaymentGateway};
use api::repositories::{
    InMemoryPaymentOrderRepository, PaymentOrderRepository, SeaOrmPaymentOrderRepository,
};
use api::services::case_provisioner::{CaseProvisioner, HttpCaseProvisioner, InMemoryCaseProvisioner};
use api::services::order_manager::{OrderManager, OrderSettings};
use api::services::price_catalog::{InMemoryPriceCatalog, PriceCatalog};
use api::services::reconciler::{Reconciler, ReconcilerSettings};
use api::webhooks::PaymentWebhookHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Order store
    let mut db = None;
    let repository: Arc<dyn PaymentOrderRepository> = if cfg.uses_in_memory_storage() {
        warn!("Using in-memory order store; orders are lost on restart");
        Arc::new(InMemoryPaymentOrderRepository::new())
    } else {
        let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
        if cfg.auto_migrate {
            api::db::run_migrations(&db_pool).await.map_err(|e| {
                error!("Failed running migrations: {}", e);
                e
            })?;
        }
        let db_arc = Arc::new(db_pool);
        db = Some(db_arc.clone());
        Arc::new(SeaOrmPaymentOrderRepository::new(db_arc))
    };

    // Gateway client, constructed once and injected
    let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpPaymentGateway::new(cfg.gateway.settings())?);

    let provisioner: Arc<dyn CaseProvisioner> = match cfg.provisioning.case_service_url.clone() {
        Some(url) => {
            info!("Case provisioning via {}", url);
            Arc::new(HttpCaseProvisioner::new(
                url,
                cfg.provisioning.case_service_token.clone(),
                Duration::from_secs(cfg.provisioning.timeout_secs),
            )?)
        }
        None => {
            warn!("No case service configured; cases are provisioned in memory");
            Arc::new(InMemoryCaseProvisioner::new())
        }
    };

    let catalog: Arc<dyn PriceCatalog> = match cfg.catalog_path.as_deref() {
        Some(path) => Arc::new(InMemoryPriceCatalog::from_json_file(path)?),
        None => {
            warn!("No price catalog configured; every order creation will be rejected");
            Arc::new(InMemoryPriceCatalog::new())
        }
    };

    let manager = OrderManager::new(
        repository,
        gateway.clone(),
        provisioner,
        catalog,
        OrderSettings::from(&cfg),
    );
    let reconciler = Arc::new(Reconciler::new(manager.clone(), ReconcilerSettings::from(&cfg)));
    let webhook_handler = PaymentWebhookHandler::new(gateway, manager.clone());

    // Background reconciliation
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if cfg.reconciler.enabled {
        Some(reconciler.clone().spawn(shutdown_rx))
    } else {
        info!("Background reconciliation disabled");
        None
    };

    let state = api::AppState {
        manager,
        reconciler,
        webhook_handler,
        db,
    };
    let app = api::build_router(state, &cfg);

    let ip: std::net::IpAddr = cfg.host.parse()?;
    let addr = SocketAddr::new(ip, cfg.port);
    info!("payment-orders listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            error!("reconciliation worker ended abnormally: {}", e);
        }
    }
    info!("payment-orders stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
