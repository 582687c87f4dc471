use std::{net::SocketAddr, path::PathBuf, process::exit, time::Duration};

use clap::Parser;
use protocol_openssh::{default_authorized_keys_path, default_host_key_path, load_or_create_host_key, AuthorizedKeys};
use ssh_tunnel_server::{describe_metrics, run_document_server, DnsRelay, DocumentServerConfig, TunnelLimits, TunnelServer, TunnelServerConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SSH server which only offers tunnels: direct-tcpip to reach out and tcpip-forward to listen on behalf of the client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP address for serving SSH connections
    #[arg(env, long, default_value = "0.0.0.0:2222")]
    listen_addr: SocketAddr,

    /// Host private key, generated as Ed25519 when missing. Defaults to ~/.config/ssh-tunnel/ssh_host_ed25519_key
    #[arg(env, long)]
    host_key: Option<PathBuf>,

    /// OpenSSH authorized_keys file. Defaults to ~/.ssh/authorized_keys
    #[arg(env, long)]
    authorized_keys: Option<PathBuf>,

    /// direct-tcpip requests to this host are answered by the embedded SOCKS5 server
    #[arg(env, long)]
    socks_route_host: Option<String>,

    /// Timeout for outbound dials, no timeout when unset
    #[arg(env, long)]
    dial_timeout_ms: Option<u64>,

    /// Close SSH connections idle for this long, never when unset
    #[arg(env, long)]
    inactivity_timeout_secs: Option<u64>,

    /// Max concurrent SSH connections
    #[arg(env, long)]
    max_connections: Option<usize>,

    /// Max concurrent direct-tcpip channels per SSH connection
    #[arg(env, long)]
    max_channels_per_connection: Option<usize>,

    /// Max concurrent tcpip-forward listeners per SSH connection
    #[arg(env, long)]
    max_forwards_per_connection: Option<usize>,

    /// UDP address of the DNS relay answering A/AAAA queries with this host's resolver
    #[arg(env, long, default_value = "0.0.0.0:53530")]
    dns_addr: SocketAddr,

    /// Disable the DNS relay
    #[arg(env, long)]
    no_dns: bool,

    /// TCP address for serving documents over HTTP
    #[arg(env, long, default_value = "0.0.0.0:2223")]
    doc_listener: SocketAddr,

    /// URL base path of served documents
    #[arg(env, long, default_value = "/pac")]
    doc_base_path: String,

    /// Document (PAC file) to serve, can be repeated. The HTTP server only starts when at least one is given
    #[arg(long = "doc")]
    docs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    let args: Args = Args::parse();
    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
    describe_metrics();

    let host_key_path = args.host_key.unwrap_or_else(default_host_key_path);
    let host_key = match load_or_create_host_key(&host_key_path) {
        Ok(key) => key,
        Err(e) => {
            log::error!("[Main] host key error: {e}");
            exit(1);
        }
    };
    let authorized_keys_path = args.authorized_keys.unwrap_or_else(default_authorized_keys_path);
    let authorizer = match AuthorizedKeys::load(&authorized_keys_path) {
        Ok(keys) => keys,
        Err(e) => {
            log::error!("[Main] authorized keys error: {e}");
            exit(1);
        }
    };
    if authorizer.is_empty() {
        log::warn!("[Main] {} has no keys, every login will be rejected", authorized_keys_path.display());
    }

    let cfg = TunnelServerConfig {
        listen_addr: args.listen_addr,
        host_key,
        authorizer,
        dial_timeout: args.dial_timeout_ms.map(Duration::from_millis),
        inactivity_timeout: args.inactivity_timeout_secs.map(Duration::from_secs),
        socks_route_host: args.socks_route_host,
        limits: TunnelLimits {
            max_connections: args.max_connections,
            max_channels_per_connection: args.max_channels_per_connection,
            max_forwards_per_connection: args.max_forwards_per_connection,
        },
    };
    let server = match TunnelServer::new(cfg).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("[Main] start server error: {e}");
            exit(1);
        }
    };

    let docs = DocumentServerConfig {
        listen_addr: args.doc_listener,
        base_path: args.doc_base_path,
        files: args.docs,
    };
    tokio::spawn(async move {
        if let Err(e) = run_document_server(docs).await {
            log::error!("[Main] document server error: {e}");
        }
    });

    let dns = if args.no_dns {
        None
    } else {
        match DnsRelay::bind(args.dns_addr).await {
            Ok(relay) => Some(tokio::spawn(async move {
                if let Err(e) = relay.run().await {
                    log::error!("[Main] dns relay error: {e}");
                }
            })),
            Err(e) => {
                log::error!("[Main] dns relay bind {} error: {e}", args.dns_addr);
                None
            }
        }
    };

    tokio::select! {
        res = server.run() => {
            if let Err(e) = res {
                log::error!("[Main] server stopped: {e}");
                exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("[Main] shutdown");
        }
    }
    if let Some(dns) = dns {
        dns.abort();
    }
}
