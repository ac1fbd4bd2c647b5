// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS XRCE Agent
//!
//! Standalone agent serving DDS-XRCE clients over UDP or TCP. Without an object
//! model attached it terminates sessions and streams and logs every
//! delivered message, which is enough to exercise a client's transport.
//!
//! # Usage
//!
//! ```bash
//! # Default port (2019)
//! hdds-xrce-agent
//!
//! # Custom port and config
//! hdds-xrce-agent --port 8888 --config agent.toml
//!
//! # TCP clients (2-byte length framing)
//! hdds-xrce-agent --tcp
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hdds_xrce_agent::{
    Agent, AgentConfig, CloseReason, ObjectRouter, SessionId, StreamEvent, StreamId,
    TcpTransport, UdpTransport, XrceTransport,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// HDDS XRCE Agent - bridge for resource-constrained DDS clients
#[derive(Parser, Debug)]
#[command(name = "hdds-xrce-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on [default: 2019]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address, 0.0.0.0 for all interfaces [default: 0.0.0.0]
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Accept TCP connections instead of UDP datagrams
    #[arg(long)]
    tcp: bool,

    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reliable stream window (1-16)
    #[arg(long)]
    window: Option<u16>,

    /// Idle session timeout in milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line flags override the config file.
    fn apply_overrides(&self, config: &mut AgentConfig) {
        if let Some(bind) = self.bind {
            config.bind_address.set_ip(bind);
        }
        if let Some(port) = self.port {
            config.bind_address.set_port(port);
        }
        if let Some(window) = self.window {
            config.window_size = window;
        }
        if let Some(idle) = self.idle_timeout_ms {
            config.session_idle_timeout_ms = idle;
        }
    }
}

/// Router that only logs what reaches it.
struct LogRouter;

impl ObjectRouter for LogRouter {
    fn session_created(&self, session: SessionId) {
        info!(%session, "client connected");
    }

    fn deliver(&self, session: SessionId, stream: StreamId, message: Vec<u8>) {
        tracing::debug!(%session, %stream, len = message.len(), "message delivered");
    }

    fn session_closed(&self, session: SessionId, reason: CloseReason) {
        info!(%session, %reason, "client disconnected");
    }

    fn stream_event(&self, session: SessionId, event: &StreamEvent) {
        tracing::debug!(%session, ?event, "stream event");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            AgentConfig::from_file(path)?
        }
        None => AgentConfig::default(),
    };
    args.apply_overrides(&mut config);
    config.validate()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       HDDS XRCE Agent v{}                     |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    let proto = if args.tcp { "tcp" } else { "udp" };
    info!("|  Bind:     {:38} |", format!("{}://{}", proto, config.bind_address));
    info!("|  Window:   {:38} |", config.window_size);
    info!("|  Sessions: {:38} |", config.max_sessions);
    info!(
        "|  Idle:     {:38} |",
        format!("{}ms", config.session_idle_timeout_ms)
    );
    info!("+----------------------------------------------------+");

    let transport: Arc<dyn XrceTransport> = if args.tcp {
        Arc::new(TcpTransport::bind(config.bind_address)?)
    } else {
        Arc::new(UdpTransport::bind(config.bind_address)?)
    };
    let agent = Agent::new(config, transport, Arc::new(LogRouter))?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, closing sessions...");
        shutdown.cancel();
    });

    agent.run(cancel).await?;
    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_flags_override_config_file() {
        let mut config = AgentConfig::from_toml_str(
            "bind_address = \"127.0.0.1:7400\"\nwindow_size = 4\n",
        )
        .expect("parse");
        let args = Args::try_parse_from(["hdds-xrce-agent", "--port", "8888", "--config", "a.toml"])
            .expect("args");
        args.apply_overrides(&mut config);
        assert_eq!(config.bind_address, SocketAddr::from(([127, 0, 0, 1], 8888)));
        assert_eq!(config.window_size, 4);

        let args = Args::try_parse_from(["hdds-xrce-agent", "--bind", "10.0.0.2", "--tcp"])
            .expect("args");
        args.apply_overrides(&mut config);
        assert_eq!(config.bind_address, SocketAddr::from(([10, 0, 0, 2], 8888)));
        assert!(args.tcp);
    }
}
