use clap::Parser;
use dotenvy::dotenv;
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use topup_reconciler::application::reconciler::ReconciliationProcessor;
use topup_reconciler::application::topup::TopUpService;
use topup_reconciler::config::SettingsArgs;
use topup_reconciler::domain::order::PaymentMethod;
use topup_reconciler::domain::ports::{OrderStoreRef, QuotaLedgerRef};
use topup_reconciler::gateway::Gateways;
use topup_reconciler::infrastructure::http_ledger::HttpQuotaLedger;
use topup_reconciler::infrastructure::in_memory::{InMemoryOrderStore, InMemoryQuotaLedger, InMemoryUserGroups};
use topup_reconciler::interfaces::http::{AppState, router};

#[derive(Parser)]
#[command(author, version, about = "Alipay and WeChat Pay top-up server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TOPUP_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Path to persistent order database (optional). If provided, uses RocksDB.
    #[arg(long, env = "TOPUP_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Balance service endpoint credited when a payment completes. Without it
    /// credits are only kept in memory.
    #[arg(long, env = "TOPUP_LEDGER_URL")]
    ledger_url: Option<String>,

    /// Validate the configuration, print which providers are enabled and exit
    #[arg(long)]
    check: bool,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();
    let cli = Cli::parse();

    let settings = cli.settings.into_settings().into_diagnostic()?;
    let gateways = Arc::new(Gateways::from_settings(&settings).into_diagnostic()?);

    if cli.check {
        for method in [PaymentMethod::Alipay, PaymentMethod::Wechat] {
            let state = if gateways.is_configured(method) {
                "enabled"
            } else {
                "disabled"
            };
            println!("{method}: {state}");
        }
        return Ok(());
    }

    let orders = open_order_store(cli.db_path)?;
    let ledger: QuotaLedgerRef = match cli.ledger_url {
        Some(url) => {
            let ledger = HttpQuotaLedger::new(&url, settings.ledger_timeout).into_diagnostic()?;
            info!("Crediting quota through {}", ledger.endpoint());
            Arc::new(ledger)
        }
        None => {
            warn!("No ledger URL configured, credits are kept in memory only");
            Arc::new(InMemoryQuotaLedger::new())
        }
    };

    let reconciler = ReconciliationProcessor::new(orders.clone(), ledger, settings.pricing.conversion)
        .with_ledger_timeout(settings.ledger_timeout);
    let users = InMemoryUserGroups::from(settings.user_groups);
    let topup = TopUpService::new(
        orders,
        Arc::new(users),
        gateways.clone(),
        settings.pricing,
        settings.server_address,
    );
    let state = AppState {
        topup: Arc::new(topup),
        reconciler: Arc::new(reconciler),
        gateways,
    };

    let listener = tokio::net::TcpListener::bind(cli.listen).await.into_diagnostic()?;
    info!("🚀️ Listening on {}", cli.listen);
    axum::serve(listener, router(state)).await.into_diagnostic()?;
    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_order_store(db_path: Option<PathBuf>) -> Result<OrderStoreRef> {
    use topup_reconciler::infrastructure::rocksdb::RocksDbOrderStore;

    match db_path {
        Some(path) => {
            info!("Storing orders in {}", path.display());
            Ok(Arc::new(RocksDbOrderStore::open(path).into_diagnostic()?))
        }
        None => Ok(Arc::new(InMemoryOrderStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_order_store(db_path: Option<PathBuf>) -> Result<OrderStoreRef> {
    if let Some(path) = db_path {
        warn!(
            "Built without the storage-rocksdb feature, ignoring {}. Orders are kept in memory.",
            path.display()
        );
    }
    Ok(Arc::new(InMemoryOrderStore::new()))
}
