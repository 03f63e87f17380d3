use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use contravider::config::Config;
use contravider::AppState;
use contravider_providers::{GitOracle, RevisionOracle, SigningKey, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long open connections may take to finish after a shutdown signal.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Serve test variants of a CSAF provider, materialized from the branches
/// of a git repository.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The configuration file. Without it, contraviderd.toml is read if it
    /// exists, built-in defaults are used otherwise.
    #[arg(long, short = 'c', env = "CONTRAVIDER_CONFIG")]
    config: Option<PathBuf>,

    /// The address to listen on, overriding web.host and web.port.
    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    contravider_tracing::TracingBuilder::default()
        .level(cfg.log.level)
        .json(cfg.log.json)
        .source(cfg.log.source)
        .log_file(cfg.log.file.clone())
        .build()?;

    let key = Arc::new(
        SigningKey::load(&cfg.signing.key, cfg.signing.passphrase.as_deref()).await?,
    );
    info!(key_id = %key.key_id(), fingerprint = %key.fingerprint(), "loaded signing key");

    let oracle = Arc::new(GitOracle::new(
        &cfg.providers.git_url,
        &cfg.providers.workdir,
        &cfg.providers.default_branch,
        cfg.providers.git_timeout,
    )?);
    oracle
        .ensure_checkouts(&cfg.providers.profiles.all_branches())
        .await?;

    let (system, actor) = System::new(
        cfg.system_config(),
        cfg.providers.profiles.clone(),
        oracle,
        key,
    )?;
    let token = CancellationToken::new();
    let actor = tokio::spawn(actor.run(token.clone()));

    let app = contravider::gen_router().with_state(AppState::new(system));

    match cfg.web.tls() {
        Some((cert_file, key_file))
            if cli.listen_args.listen_address.is_none()
                && !Path::new(&cfg.web.host).is_absolute() =>
        {
            serve_tls(app, &cfg, cert_file, key_file).await?
        }
        Some(_) => {
            warn!("ignoring web.cert_file and web.key_file, TLS needs a TCP address from web.host");
            serve(app, &cfg, cli.listen_args).await?
        }
        None => serve(app, &cfg, cli.listen_args).await?,
    }

    token.cancel();
    actor.await?;

    Ok(())
}

async fn serve(
    app: Router,
    cfg: &Config,
    listen_args: tokio_listener::ListenerAddressLFlag,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listen_address = match listen_args.listen_address {
        Some(listen_address) => listen_address,
        None => cfg.listen_address().await?,
    };

    let listener = tokio_listener::Listener::bind(
        &listen_address,
        &Default::default(),
        &listen_args.listener_options,
    )
    .await?;

    info!(listen_address=%listen_address, "starting daemon");

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn serve_tls(
    app: Router,
    cfg: &Config,
    cert_file: &Path,
    key_file: &Path,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let tls = RustlsConfig::from_pem_file(cert_file, key_file).await?;
    let addr = cfg.socket_address().await?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(GRACE_PERIOD));
        }
    });

    info!(listen_address = %addr, "starting daemon with TLS");

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(err = %e, "unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutting down");
}
