use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hpcserve::cli::{apply_overrides, format_dry_run, Args};
use hpcserve::config::load_config;
use hpcserve::orchestrator::Orchestrator;
use hpcserve::recipe::{RecipeCatalog, RecipeResolver};
use hpcserve::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn,hpcserve=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let mut config = load_config(args.config.as_deref()).context("Failed to load config")?;
    apply_overrides(&mut config, &args);

    // Dry-run mode: print the resolved setup and exit
    if args.dry_run {
        let catalog = RecipeCatalog::load_dir(&config.recipes_dir_path())
            .context("Failed to load recipes")?;
        println!("{}", format_dry_run(&config, &catalog.names(), &args));
        return Ok(());
    }

    let addr = format!("{}:{}", config.gateway.bind_addr, config.gateway.port);
    let orchestrator = Arc::new(
        Orchestrator::from_config(config)
            .await
            .context("Failed to start orchestrator")?,
    );
    orchestrator.start().await;

    let app = create_router(AppState::new(orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  GET  /api/v1/status                   - Gateway status");
    info!("  GET  /api/v1/targets                  - Prometheus service discovery");
    info!("  *    /api/v1/services[/{{id}}[/status]] - Services");
    info!("  *    /api/v1/service-groups[/{{id}}]    - Replica groups");
    info!("  POST /api/v1/vllm/{{id}}/{{prompt,chat}}  - Inference");
    info!("  *    /api/v1/vector-db/{{id}}/{{*path}}   - Vector database");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    orchestrator.shutdown().await;
    served.context("Server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
