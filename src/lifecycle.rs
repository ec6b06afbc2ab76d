//! Boot sequence, signal handling, and graceful shutdown (§4 intro, §5,
//! §6 Signals): load metadata, spawn projects, warm the certificate cache,
//! start the listeners, then start the supervisor's background timers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::meta::{DomainCollection, ProjectCollection};
use crate::router::Router;
use crate::supervisor::Supervisor;
use crate::tls::TlsMaterializer;

/// The handles an administrative REST facade bolted on outside this crate
/// would need; this crate stops at providing the seam (§1's "thin CRUD
/// facade... not specified here").
pub struct AdminContext {
    pub domains: Arc<DomainCollection>,
    pub projects: Arc<ProjectCollection>,
    pub supervisor: Arc<Supervisor>,
    pub tls: Arc<TlsMaterializer>,
}

/// A fully booted instance: listeners and background timers are running.
/// Dropping this without calling `shutdown` leaks the spawned tasks and
/// leaves backend processes running; callers should always shut down
/// explicitly.
pub struct Service {
    pub admin: AdminContext,
    background: tokio::task::JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Service {
    /// Stops the listeners and background timers, then gracefully stops
    /// every running backend.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.background.abort_all();
        while self.background.join_next().await.is_some() {}
        self.admin.supervisor.stop_all().await;
    }
}

/// Loads metadata, spawns projects, warms the certificate cache, and
/// starts the HTTP/HTTPS listeners plus the supervisor/renewal timers.
/// Returns once everything is up; does not wait for a shutdown signal.
pub async fn boot(config: Config) -> anyhow::Result<Service> {
    let config = Arc::new(config);
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.projects_dir())?;
    std::fs::create_dir_all(&config.sockets_dir)?;
    std::fs::create_dir_all(crate::tls::webroot_challenge_dir(&config))?;

    let domains = Arc::new(DomainCollection::open(config.domains_db_path())?);
    let projects = Arc::new(ProjectCollection::open(
        config.projects_db_path(),
        config.projects_dir(),
        &config.sockets_dir,
    )?);
    let supervisor = Supervisor::new(Arc::clone(&config), Arc::clone(&projects));
    let tls = TlsMaterializer::new(Arc::clone(&config));

    tracing::info!("starting backend processes");
    supervisor.start_all().await;

    let ssl_hostnames: Vec<String> = domains
        .list()
        .into_iter()
        .filter(|d| d.ssl_enabled)
        .map(|d| d.hostname)
        .collect();
    tls.warm(&ssl_hostnames).await;

    let router = Router::new(Arc::clone(&domains), Arc::clone(&projects), Arc::clone(&supervisor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = tokio::task::JoinSet::new();

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let http_tls = Arc::clone(&tls);
    background.spawn(async move {
        if let Err(err) = crate::http_listener::serve(http_addr, http_tls).await {
            tracing::error!(%err, "HTTP listener exited with an error");
        }
    });

    let https_addr: SocketAddr = ([0, 0, 0, 0], config.https_port).into();
    let https_tls = Arc::clone(&tls);
    let https_router = Arc::clone(&router);
    let https_shutdown = shutdown_rx.clone();
    background.spawn(async move {
        if let Err(err) =
            run_https_listener(https_addr, https_tls, https_router, https_shutdown).await
        {
            tracing::error!(%err, "HTTPS listener exited with an error");
        }
    });

    let health_supervisor = Arc::clone(&supervisor);
    let health_interval = config.health_check_interval;
    background.spawn(async move {
        health_supervisor.run_health_check_loop(health_interval).await;
    });

    let renewal_tls = Arc::clone(&tls);
    background.spawn(async move {
        renewal_tls.run_renewal_loop().await;
    });

    Ok(Service {
        admin: AdminContext {
            domains,
            projects,
            supervisor,
            tls,
        },
        background,
        shutdown_tx,
    })
}

/// Boots the service, blocks until `SIGTERM`/`SIGINT`, then tears down.
/// This is the sequence the binary entry point drives; an external admin
/// layer that wants the running `AdminContext` should call `boot` directly
/// and own the shutdown sequence itself.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let service = boot(config).await?;
    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, tearing down");
    service.shutdown().await;
    Ok(())
}

/// Binds the HTTPS listener regardless of whether any certificate is
/// loaded yet. Each accepted connection pulls a fresh `ServerConfig` from
/// the materializer's live cache before the TLS handshake, rather than
/// capturing one `TlsAcceptor` for the listener's whole lifetime — this is
/// what lets the listener serve the zero-to-one cert transition (first
/// `TlsMaterializer::issue()` call, no restart required) as well as later
/// rotations, with the same mechanism.
async fn run_https_listener(
    addr: SocketAddr,
    tls: Arc<TlsMaterializer>,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTPS listener starting");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = accepted?;
                let tls = Arc::clone(&tls);
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    let server_config = match tls.server_config().await {
                        Some(cfg) => cfg,
                        None => {
                            tracing::debug!("no certificate loaded yet; dropping connection");
                            return;
                        }
                    };
                    let acceptor = TlsAcceptor::from(server_config);
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::debug!(%err, "tls handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |req| {
                        let router = Arc::clone(&router);
                        async move { Ok::<_, Infallible>(router.route(req, remote_addr, "https").await) }
                    });
                    if let Err(err) = Http::new()
                        .serve_connection(tls_stream, service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!(%err, "https connection closed with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("HTTPS listener stopping");
                return Ok(());
            }
        }
    }
}

/// Waits for the first `SIGTERM`/`SIGINT`. `run` only calls this once, so
/// the "subsequent signals are logged and ignored" half of §5's
/// idempotent-shutdown requirement falls out for free: once this future
/// resolves, the signal streams are dropped and `run` is already
/// committed to tearing down.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
