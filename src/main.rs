use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use keyrelay::clock;
use keyrelay::config::GatewayConfig;
use keyrelay::conversation_manager::ConversationManager;
use keyrelay::ingress::IngressRateLimiter;
use keyrelay::key_registry::{KeyRegistry, KeySource};
use keyrelay::key_selector::KeySelector;
use keyrelay::provider::OpenAiCompatibleClient;
use keyrelay::quota::{QuotaManager, QuotaStore};
use keyrelay::quota_memory::MemoryQuotaStore;
use keyrelay::quota_redis::RedisQuotaStore;
use keyrelay::redis_pool::RedisPool;
use keyrelay::request_router::RequestRouter;
use keyrelay::secrets::EnvSecretStore;
use keyrelay::server::{config_routes, AppState};
use keyrelay::util::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "keyrelay",
    about = "Rate-limited multi-key LLM routing gateway",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "KEYRELAY_BIND_ADDR")]
    bind: Option<String>,

    /// Key registry file (JSON or YAML)
    #[arg(short, long, env = "KEYRELAY_KEYS_PATH")]
    keys: Option<PathBuf>,

    /// Redis URL for shared quotas and conversations; omit for in-process state
    #[arg(long, env = "KEYRELAY_REDIS_URL")]
    redis_url: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    // Env files must be loaded before clap reads its env fallbacks.
    init_tracing();
    let args = Args::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(keys) = args.keys {
        config.keys_path = keys;
    }
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url;
    }

    let clock = clock::system();

    let pool = match &config.redis_url {
        Some(url) => {
            let pool = RedisPool::connect(url, config.redis_pool_max)
                .with_context(|| format!("invalid redis url {}", url))?;
            if !pool.ping().await.unwrap_or(false) {
                warn!("redis at {} is not reachable yet; quota checks degrade until it is", url);
            }
            Some(pool)
        }
        None => {
            info!("no redis url configured; quotas and conversations are process-local");
            None
        }
    };

    let quota_store: Arc<dyn QuotaStore> = match &pool {
        Some(pool) => Arc::new(RedisQuotaStore::new(pool.clone())),
        None => Arc::new(MemoryQuotaStore::new(clock.clone())),
    };
    let quota = Arc::new(QuotaManager::new(
        quota_store.clone(),
        clock.clone(),
        config.quota_prefix.clone(),
        config.quota_policy,
    ));

    let registry = Arc::new(
        KeyRegistry::load(KeySource::File(config.keys_path.clone()))
            .with_context(|| format!("failed to load keys from {}", config.keys_path.display()))?,
    );
    let selector = Arc::new(KeySelector::new(
        registry,
        quota,
        Arc::new(EnvSecretStore::default()),
    ));

    let mut conversation_config = config.conversations.clone();
    if pool.is_none() && conversation_config.backend == "redis" {
        warn!("conversation backend redis requested without a redis url; using memory");
        conversation_config.backend = "memory".to_string();
    }
    let conversations = Arc::new(
        ConversationManager::new(conversation_config, clock.clone(), pool.clone())
            .await
            .context("failed to initialise conversation store")?,
    );

    let provider = Arc::new(OpenAiCompatibleClient::new().context("failed to build http client")?);
    let router = Arc::new(RequestRouter::new(
        selector,
        provider,
        Some(conversations),
        config.router.clone(),
    ));
    let ingress = Arc::new(IngressRateLimiter::new(
        quota_store,
        clock,
        config.ingress.clone(),
    ));

    let state = AppState::new(router, ingress);
    info!(
        bind = %config.bind_addr,
        redis = config.redis_url.is_some(),
        "keyrelay listening"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(config_routes)
    })
    .bind(&config.bind_addr)
    .with_context(|| format!("failed to bind {}", config.bind_addr))?
    .run()
    .await?;

    Ok(())
}
