#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use helm_audit::NewAuditEntry;
use helm_config::HelmConfig;
use helm_control::ControlPlaneClient;
use helm_core::AuditEventType;
use helm_daemon::{AppState, build_app};
use helm_provider::{ModelGateway, OpenAiCompatClient, ProviderClient, default_base_url};
use helm_runtime::Orchestrator;
use helm_store::Store;
use helm_tenancy::{ClaimNames, OpsVerifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "helm-daemon", version, about = "Governed agent execution runtime")]
struct Args {
    /// Bind address. The port from HELM_PORT applies when unset.
    #[arg(long)]
    bind: Option<String>,

    /// Workspace id this runtime serves.
    #[arg(long, default_value = "default")]
    workspace_id: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("helm=debug,helm_daemon=debug,helm_runtime=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("helm=info,helm_daemon=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = HelmConfig::from_env();
    for warning in config.validate() {
        warn!(%warning, "configuration warning");
    }

    // Store failure at startup is fatal: exit non-zero.
    let store = Store::open(Path::new(&config.store_path))
        .with_context(|| format!("open store at {}", config.store_path))?;

    let gateway = Arc::new(build_gateway(&config));
    let control = Arc::new(ControlPlaneClient::new(&config.control_plane_url));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        &args.workspace_id,
        store,
        Arc::clone(&gateway),
        Arc::clone(&control) as Arc<dyn helm_arbiter::ToolBackend>,
        Arc::clone(&control),
    ));

    let ops_verifier = build_ops_verifier(&config);
    if ops_verifier.is_none() {
        warn!("ops auth unconfigured; /ops routes will refuse requests");
    }

    orchestrator.audit().record_or_log(
        &NewAuditEntry::new("system", AuditEventType::SystemStartup)
            .payload(serde_json::json!({"workspace_id": args.workspace_id})),
    );

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        control,
        ops_verifier,
        started: Instant::now(),
    });
    let app = build_app(state);

    let bind = args
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.port));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, workspace = %args.workspace_id, "helm-daemon listening");

    // SIGTERM / ctrl-c: stop accepting, drain in-flight, audit shutdown.
    let shutdown_orchestrator = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining");
            shutdown_orchestrator.audit().record_or_log(&NewAuditEntry::new(
                "system",
                AuditEventType::SystemShutdown,
            ));
        })
        .await
        .context("serve")
}

fn build_gateway(config: &HelmConfig) -> ModelGateway {
    let mut gateway = ModelGateway::new(
        config.retry,
        config.model_tiers.clone(),
        config.default_provider.clone(),
    );
    for (provider, key) in &config.provider_keys {
        let Some(base_url) = default_base_url(provider) else {
            warn!(provider, "no base URL known for provider; skipping");
            continue;
        };
        gateway.register(Arc::new(OpenAiCompatClient::new(provider, base_url, key))
            as Arc<dyn ProviderClient>);
        info!(provider, "provider registered");
    }
    gateway
}

fn build_ops_verifier(config: &HelmConfig) -> Option<OpsVerifier> {
    let claims = ClaimNames {
        role: config.ops_auth.role_claim.clone(),
        tenant: config.ops_auth.tenant_claim.clone(),
        workspace: config.ops_auth.workspace_claim.clone(),
        allowed_tenants: config.ops_auth.allowed_tenants_claim.clone(),
    };
    // Shared-secret deployments fall back to the agent JWT secret; public-key
    // deployments load the issuer's PEM from disk via HELM_OPS_JWKS_URL
    // pointing at a local file fetched by the operator's provisioning.
    if let Some(jwks) = &config.ops_auth.jwks_url
        && let Some(path) = jwks.strip_prefix("file://")
        && let Ok(pem) = std::fs::read(path)
    {
        match OpsVerifier::from_rsa_pem(
            &pem,
            config.ops_auth.issuer.as_deref(),
            config.ops_auth.audience.as_deref(),
            claims,
        ) {
            Ok(verifier) => return Some(verifier),
            Err(e) => {
                warn!(error = %e, "ops RSA key rejected; falling back to shared secret");
            }
        }
    }
    let secret = config.jwt_secret.as_deref()?;
    Some(OpsVerifier::from_secret(
        secret.as_bytes(),
        config.ops_auth.issuer.as_deref(),
        config.ops_auth.audience.as_deref(),
        ClaimNames {
            role: config.ops_auth.role_claim.clone(),
            tenant: config.ops_auth.tenant_claim.clone(),
            workspace: config.ops_auth.workspace_claim.clone(),
            allowed_tenants: config.ops_auth.allowed_tenants_claim.clone(),
        },
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
