//! Companion Tap command line tool
//!
//! Runs the TLS interception relay and, when configured, the companion frame
//! server until Ctrl+C.

use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use companion_tap::common::{init_logger, parse_socket_addr, shutdown_channel, Result, TapError};
use companion_tap::config::{
    AdmissionPolicy, ConfigBuilder, Password, RelayMode, TapConfig, CONFIG_FILE_ENV, ENV_PREFIX,
};
use companion_tap::frame::{FrameServer, LogFrames};
use companion_tap::relay::{RelayContext, RelayServer};
use companion_tap::{APP_NAME, VERSION};

/// Companion Tap: TLS interception relay with per-session capture
///
/// Flags override `COMPANION_TAP_*` environment variables, which override
/// the configuration file.
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[clap(long, env = CONFIG_FILE_ENV)]
    config_file: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[clap(long)]
    print_config: bool,

    /// Address the relay listens on
    #[clap(long, value_parser = socket_addr)]
    relay_listen: Option<SocketAddr>,

    /// Upstream hostname, used for SNI and certificate verification
    #[clap(long)]
    upstream_host: Option<String>,

    /// Upstream port
    #[clap(long)]
    upstream_port: Option<u16>,

    /// Address to dial instead of resolving the upstream hostname
    #[clap(long, value_parser = socket_addr)]
    upstream_connect_addr: Option<SocketAddr>,

    /// Extra CA bundle trusted for the upstream
    #[clap(long)]
    upstream_ca_file: Option<PathBuf>,

    /// PEM certificate chain presented to clients
    #[clap(long)]
    cert: Option<PathBuf>,

    /// PEM private key for --cert
    #[clap(long)]
    key: Option<PathBuf>,

    /// PKCS#12 bundle presented to clients
    #[clap(long)]
    pkcs12: Option<PathBuf>,

    /// Password for --pkcs12
    #[clap(long)]
    pkcs12_password: Option<String>,

    /// Capture artifact prefix; the session id is appended
    #[clap(long)]
    capture_prefix: Option<String>,

    /// Relay strategy (duplex, alternating)
    #[clap(long)]
    relay_mode: Option<RelayMode>,

    /// Maximum bytes per relay read
    #[clap(long)]
    chunk_size: Option<usize>,

    /// Per read/write timeout in milliseconds
    #[clap(long)]
    io_timeout_ms: Option<u64>,

    /// Connect and handshake timeout in milliseconds
    #[clap(long)]
    handshake_timeout_ms: Option<u64>,

    /// Maximum concurrent relay sessions
    #[clap(long)]
    max_sessions: Option<usize>,

    /// Behaviour at the session limit (queue, reject)
    #[clap(long)]
    admission: Option<AdmissionPolicy>,

    /// Address the frame server listens on
    #[clap(long, value_parser = socket_addr)]
    frame_listen: Option<SocketAddr>,

    /// Largest accepted frame payload in bytes
    #[clap(long)]
    max_frame_len: Option<usize>,

    /// Maximum concurrent frame connections
    #[clap(long)]
    max_frame_connections: Option<usize>,

    /// Close a frame connection idle for this many milliseconds
    #[clap(long)]
    frame_idle_timeout_ms: Option<u64>,

    /// Seconds to wait for in-flight sessions on shutdown
    #[clap(long)]
    shutdown_grace_secs: Option<u64>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,
}

/// Accepts `ip:port` or `host:port`
fn socket_addr(value: &str) -> std::result::Result<SocketAddr, String> {
    parse_socket_addr(value).map_err(|e| e.to_string())
}

impl Args {
    /// Apply the flags that were given on top of `config`
    fn apply(self, config: &mut TapConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        fn set_some<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        set(&mut config.relay_listen, self.relay_listen);
        set(&mut config.upstream_host, self.upstream_host);
        set(&mut config.upstream_port, self.upstream_port);
        set_some(&mut config.upstream_connect_addr, self.upstream_connect_addr);
        set_some(&mut config.upstream_ca_file, self.upstream_ca_file);
        set_some(&mut config.cert, self.cert);
        set_some(&mut config.key, self.key);
        set_some(&mut config.pkcs12, self.pkcs12);
        set_some(&mut config.pkcs12_password, self.pkcs12_password.map(Password::new));
        set_some(&mut config.capture_prefix, self.capture_prefix);
        set(&mut config.relay_mode, self.relay_mode);
        set(&mut config.chunk_size, self.chunk_size);
        set(&mut config.io_timeout_ms, self.io_timeout_ms);
        set(&mut config.handshake_timeout_ms, self.handshake_timeout_ms);
        set(&mut config.max_sessions, self.max_sessions);
        set(&mut config.admission, self.admission);
        set_some(&mut config.frame_listen, self.frame_listen);
        set(&mut config.max_frame_len, self.max_frame_len);
        set(&mut config.max_frame_connections, self.max_frame_connections);
        set(&mut config.frame_idle_timeout_ms, self.frame_idle_timeout_ms);
        set(&mut config.shutdown_grace_secs, self.shutdown_grace_secs);
        set(&mut config.log_level, self.log_level);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config_file {
        builder = builder.with_file(path);
    }
    let mut config = builder.with_env(ENV_PREFIX).build()?;

    let print_config = args.print_config;
    args.apply(&mut config);

    if print_config {
        let mut shown = config.clone();
        if shown.pkcs12_password.is_some() {
            shown.pkcs12_password = Some(Password::new("********"));
        }
        let json = serde_json::to_string_pretty(&shown)
            .map_err(|e| TapError::Config(format!("Failed to render configuration: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    config.validate()?;
    let config = Arc::new(config);
    info!("Relay listen address: {}", config.relay_listen);
    info!("Upstream: {}", config.upstream());
    match &config.capture_prefix {
        Some(prefix) => info!("Capturing sessions to {}<session id>", prefix),
        None => info!("Session capture disabled"),
    }

    let ctx = Arc::new(RelayContext::from_config(Arc::clone(&config))?);
    let (trigger, signal) = shutdown_channel();

    let relay = RelayServer::bind(ctx)?;
    let relay_task = tokio::spawn(relay.run(signal.clone()));

    let frame_task = match config.frame_listen {
        Some(_) => {
            let frames = FrameServer::bind(&config, Arc::new(LogFrames))?;
            Some(tokio::spawn(frames.run(signal)))
        }
        None => {
            info!("Frame server disabled");
            None
        }
    };

    info!("Companion tap ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    trigger.trigger();

    let mut result = finish("relay", relay_task).await;
    if let Some(task) = frame_task {
        result = result.and(finish("frame server", task).await);
    }
    info!("Stopped");
    result
}

async fn finish(name: &str, task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} stopped with error: {}", name, e);
            Err(e)
        }
        Err(e) => {
            error!("{} task failed: {}", name, e);
            Err(TapError::Io(std::io::Error::other(e)))
        }
    }
}
