pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod util;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let store = Arc::new(credential::store::CredentialStore::new(&cfg.data_dir));
    if let Err(e) = store.load().await {
        tracing::warn!("加载 credentials.json 失败: {e:#}");
    }

    let mut registry = executor::ExecutorRegistry::new();
    registry.insert(Arc::new(
        executor::claude::ClaudeExecutor::new(&cfg).context("初始化 claude 执行器失败")?,
    ));
    registry.insert(Arc::new(
        executor::gemini::GeminiExecutor::new(&cfg).context("初始化 gemini 执行器失败")?,
    ));
    registry.insert(Arc::new(
        executor::codex::CodexExecutor::new(&cfg).context("初始化 codex 执行器失败")?,
    ));

    let pool = Arc::new(pool::CredentialPool::new(
        store.clone(),
        registry,
        pool::SelectStrategy::parse(&cfg.select_strategy),
        cfg.retry_count,
        cfg.max_retry_wait_ms,
    ));
    let loaded = pool.load_from_store().await;
    tracing::info!("已装载 {loaded} 条凭证");

    let fallback_cfg = Arc::new(fallback::FallbackConfig::new(&cfg.data_dir));
    if let Err(e) = fallback_cfg.load().await {
        tracing::warn!("加载 fallback.json 失败: {e:#}");
    }
    // watcher 句柄需存活到进程结束，drop 即停止监听。
    let _watcher = match fallback::spawn_watcher(fallback_cfg.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("启动 fallback 配置监听失败: {e:#}");
            None
        }
    };

    let state = Arc::new(gateway::handler::AppState {
        cfg: cfg.clone(),
        pool,
        fallback: fallback_cfg,
    });

    let app = Router::new()
        .route("/health", get(gateway::handler::handle_health))
        .route("/v1/models", get(gateway::handler::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(gateway::handler::handle_chat_completions),
        )
        .route("/v1/messages", post(gateway::handler::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(gateway::handler::handle_count_tokens),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 默认把依赖库日志控制在 warn（避免噪声），但确保本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把关键调试日志过滤掉。
    // DEBUG 非 off 时本项目日志提升到 debug（配合请求/响应详细输出）。
    let own_level = if cfg.log_level() == logging::LogLevel::Off {
        "info"
    } else {
        "debug"
    };

    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new(format!("warn,any2api={own_level}"))
    } else if env.contains("any2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},any2api={own_level}"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
