//! Relay accept loop
//!
//! Accepts client connections and runs one [`Session`] per connection in its
//! own task. A session failure never stops the loop.

use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;

use crate::capture::CaptureSink;
use crate::common::{bind_listener, drain_tasks, Result, ShutdownSignal};
use crate::config::{AdmissionPolicy, TapConfig};
use crate::tls::{TlsIdentity, TlsTerminator, UpstreamConnector};
use super::session::{Session, SessionId, SessionReport};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Immutable state shared by every session
pub struct RelayContext {
    pub config: Arc<TapConfig>,
    pub terminator: TlsTerminator,
    pub connector: UpstreamConnector,
}

impl RelayContext {
    /// Assemble a context from already built parts
    pub fn new(config: Arc<TapConfig>, terminator: TlsTerminator, connector: UpstreamConnector) -> Self {
        Self { config, terminator, connector }
    }

    /// Load the identity and build both TLS endpoints from the configuration
    pub fn from_config(config: Arc<TapConfig>) -> Result<Self> {
        let identity = TlsIdentity::load(&config.identity()?)?;
        match identity.fingerprint() {
            Ok(fingerprint) => info!("Identity fingerprint: {}", fingerprint),
            Err(e) => warn!("Unable to compute identity fingerprint: {}", e),
        }
        let terminator = TlsTerminator::new(&identity, config.handshake_timeout())?;
        let connector = UpstreamConnector::new(
            config.upstream(),
            config.upstream_ca_file.as_deref(),
            config.handshake_timeout(),
        )?;
        Ok(Self::new(config, terminator, connector))
    }
}

/// TLS interception relay server
pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    /// Bind `relay_listen`
    pub fn bind(ctx: Arc<RelayContext>) -> Result<Self> {
        let listener = bind_listener(ctx.config.relay_listen)?;
        Ok(Self::from_listener(listener, ctx))
    }

    /// Serve on an existing listener
    pub fn from_listener(listener: TcpListener, ctx: Arc<RelayContext>) -> Self {
        Self { listener, ctx }
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then drain in-flight sessions
    ///
    /// Sessions still running after the grace period are aborted.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let RelayServer { listener, ctx } = self;
        let config = Arc::clone(&ctx.config);
        let slots = Arc::new(Semaphore::new(config.max_sessions));
        let mut tasks: JoinSet<SessionReport> = JoinSet::new();
        let mut next_id: u64 = 0;

        info!(
            "Relay listening on {} for {} (max {} sessions, {} admission, {} mode)",
            listener.local_addr()?,
            ctx.connector.target(),
            config.max_sessions,
            config.admission,
            config.relay_mode
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                reap(joined);
            }

            // Queue admission holds off accepting until a slot is free
            let queued = match config.admission {
                AdmissionPolicy::Queue => tokio::select! {
                    _ = shutdown.wait() => break,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                AdmissionPolicy::Reject => None,
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit: OwnedSemaphorePermit = match queued {
                Some(permit) => permit,
                None => match Arc::clone(&slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Rejecting connection from {}: {} sessions active", peer, config.max_sessions);
                        counter!("companion_tap.sessions.rejected").increment(1);
                        drop(stream);
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            next_id += 1;
            let id = SessionId(next_id);
            let capture = CaptureSink::for_session(config.capture_prefix.as_deref(), id);
            let ctx = Arc::clone(&ctx);

            info!("Session {} accepted from {}", id, peer);
            counter!("companion_tap.sessions.accepted").increment(1);
            gauge!("companion_tap.sessions.active").increment(1.0);

            tasks.spawn(async move {
                let _permit = permit;
                let report = Session::new(id, peer, capture).run(&ctx, stream).await;
                gauge!("companion_tap.sessions.active").decrement(1.0);
                report
            });
        }

        drop(listener);
        drain_tasks(tasks, config.shutdown_grace(), "relay session").await;
        Ok(())
    }
}

fn reap(joined: std::result::Result<SessionReport, JoinError>) {
    match joined {
        Ok(report) => {
            if let Err(e) = &report.result {
                counter!("companion_tap.sessions.failed", "stage" => report.final_stage.to_string())
                    .increment(1);
                debug!("Session {} ({}) ended after {:?}: {}", report.id, report.peer, report.duration, e);
            }
        }
        Err(e) if e.is_panic() => error!("Session task panicked: {}", e),
        Err(e) => debug!("Session task cancelled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::shutdown_channel;
    use crate::tls::identity::tests::self_signed;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn context(config: TapConfig) -> Arc<RelayContext> {
        let (cert, key) = self_signed("relay.test");
        let identity = TlsIdentity::from_pem(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();
        let config = Arc::new(config);
        let terminator = TlsTerminator::new(&identity, config.handshake_timeout()).unwrap();
        let connector = UpstreamConnector::new(config.upstream(), None, config.handshake_timeout()).unwrap();
        Arc::new(RelayContext::new(config, terminator, connector))
    }

    /// Config whose upstream refuses connections
    async fn unreachable_upstream() -> TapConfig {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);
        TapConfig {
            upstream_host: "upstream.test".to_string(),
            upstream_port: addr.port(),
            upstream_connect_addr: Some(addr),
            handshake_timeout_ms: 1_000,
            shutdown_grace_secs: 1,
            ..TapConfig::default()
        }
    }

    #[tokio::test]
    async fn test_failed_upstream_closes_client_and_loop_continues() {
        let ctx = context(unreachable_upstream().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RelayServer::from_listener(listener, ctx);
        let addr = server.local_addr().unwrap();
        let (trigger, signal) = shutdown_channel();
        let handle = tokio::spawn(server.run(signal));

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 16];
            let n = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(n, 0, "client must only see its connection close");
        }

        trigger.trigger();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let ctx = context(unreachable_upstream().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RelayServer::from_listener(listener, ctx);
        let addr = server.local_addr().unwrap();
        let (trigger, signal) = shutdown_channel();
        let handle = tokio::spawn(server.run(signal));

        trigger.trigger();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
