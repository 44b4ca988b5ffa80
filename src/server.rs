//! Listener lifecycle for the gateway

use crate::error::BindError;
use crate::resolver::Resolver;
use crate::router::GatewayRouter;
use crate::session::SessionOpener;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The gateway HTTP server.
///
/// Closing the server stops the accept loop and then closes every cached
/// session.
pub struct GatewayServer<R: Resolver, O: SessionOpener> {
    router: Arc<GatewayRouter<R, O>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<R: Resolver, O: SessionOpener> GatewayServer<R, O> {
    pub fn new(router: GatewayRouter<R, O>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            router: Arc::new(router),
            shutdown_tx,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn router(&self) -> &Arc<GatewayRouter<R, O>> {
        &self.router
    }

    /// Address the server is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind `host:port` and start accepting connections.
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned. A
    /// closed server cannot listen again.
    pub async fn listen(&self, port: u16, host: &str) -> Result<SocketAddr, BindError> {
        if self.is_closed() {
            return Err(BindError::Closed);
        }
        if self.accept_task.lock().is_some() {
            return Err(BindError::AlreadyListening);
        }
        if host.is_empty() {
            return Err(BindError::InvalidAddress(format!(":{}", port)));
        }

        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BindError::Io { addr: addr.clone(), source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError::Io { addr, source })?;

        let mut accept_task = self.accept_task.lock();
        if accept_task.is_some() {
            return Err(BindError::AlreadyListening);
        }
        if self.is_closed() {
            return Err(BindError::Closed);
        }

        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let router = Arc::clone(&self.router);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *accept_task = Some(tokio::spawn(accept_loop(listener, router, shutdown_rx)));
        *self.local_addr.lock() = Some(local_addr);

        Ok(local_addr)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop accepting connections, then close every cached session.
    ///
    /// Safe to call without a prior `listen` and more than once.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);

        let accept_task = self.accept_task.lock().take();
        if let Some(handle) = accept_task {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop ended abnormally");
            }
        }

        self.router.cache().close().await;
        info!("Gateway closed");
    }
}

async fn accept_loop<R: Resolver, O: SessionOpener>(
    listener: TcpListener,
    router: Arc<GatewayRouter<R, O>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow() {
        return;
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, addr, router, false).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Gateway no longer accepting connections");
                    break;
                }
            }
        }
    }
}

/// Serve HTTP on an accepted stream.
///
/// `encrypted` marks streams that arrived over TLS, so a TLS front end can
/// hand decrypted streams to the gateway and still get `https` redirects.
pub async fn serve_connection<S, R, O>(
    stream: S,
    addr: SocketAddr,
    router: Arc<GatewayRouter<R, O>>,
    encrypted: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: Resolver,
    O: SessionOpener,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, hyper::Error>(router.handle(req, addr, encrypted).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
