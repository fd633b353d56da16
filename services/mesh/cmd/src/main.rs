//! Mesh node binary.
//!
//! Runs a TCP control plane, or a node built on the embedded runtime that
//! either echoes every inbound stream or sends one message and prints the
//! reply. Nodes are driven through the same flat surface a language binding
//! would use.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mesh_embed::{Api, MeshRuntime, NodeLogFormatter, RuntimeConfig, Status, LOOPBACK_USER};
use mesh_session::{ControlPlane, ControlServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Mesh node on the embedded runtime
#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Mesh node, echo server and control plane")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a control plane over TCP
    Control {
        /// Listen address, e.g. 0.0.0.0:7400
        #[arg(long, default_value = "127.0.0.1:7400")]
        listen: SocketAddr,

        /// Accepted auth key (repeatable); the mesh is open when none is given
        #[arg(long = "auth-key")]
        auth_keys: Vec<String>,
    },

    /// Join the mesh and echo every inbound stream
    Echo {
        #[command(flatten)]
        node: NodeArgs,

        /// Virtual port to listen on
        #[arg(long, default_value_t = 7)]
        port: u16,

        /// Also start the loopback proxy and print its credentials
        #[arg(long)]
        loopback: bool,
    },

    /// Join the mesh, send one message and print the reply
    Send {
        #[command(flatten)]
        node: NodeArgs,

        /// Network kind (tcp, tcp4, tcp6, udp, udp4, udp6)
        #[arg(long, default_value = "tcp")]
        network: String,

        /// Target, e.g. web:7 or 100.64.0.1:7
        target: String,

        /// Message to send
        message: String,
    },
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    /// Requested hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Control plane URL, e.g. tcp://127.0.0.1:7400
    #[arg(long)]
    control_url: Option<String>,

    /// Auth key presented when joining
    #[arg(long)]
    auth_key: Option<String>,

    /// State directory; keeps the node identity across restarts
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Leave no membership behind on exit
    #[arg(long)]
    ephemeral: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mesh_node={}", args.log_level).parse()?)
        .add_directive(format!("mesh_embed={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(NodeLogFormatter::new("mesh"))
        .init();

    info!("Starting mesh node v{}", mesh_embed::VERSION);

    match args.command {
        Command::Control { listen, auth_keys } => run_control(listen, auth_keys),
        Command::Echo {
            node,
            port,
            loopback,
        } => {
            let api = Arc::new(node_api(&args.config)?);
            run_echo(api, &node, port, loopback)
        }
        Command::Send {
            node,
            network,
            target,
            message,
        } => {
            let api = node_api(&args.config)?;
            run_send(&api, &node, &network, &target, &message)
        }
    }
}

fn node_api(config_path: &Path) -> anyhow::Result<Api> {
    let config = RuntimeConfig::load_from_file(config_path);
    let runtime = MeshRuntime::with_config(config).context("failed to build mesh runtime")?;
    Ok(Api::with_runtime(runtime))
}

fn run_control(listen: SocketAddr, auth_keys: Vec<String>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let signals = ShutdownSignals::install()?;
        let plane = if auth_keys.is_empty() {
            warn!("No auth keys configured; any node may join");
            Arc::new(ControlPlane::new())
        } else {
            info!("Control plane accepts {} auth key(s)", auth_keys.len());
            Arc::new(ControlPlane::with_auth_keys(auth_keys))
        };

        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind control listener on {}", listen))?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(ControlServer::serve(listener, plane, shutdown_rx));

        signals.recv().await;
        let _ = shutdown_tx.send(true);
        server.await??;
        Ok(())
    })
}

/// SIGTERM and SIGINT handlers
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    /// Install both handlers; must run inside a tokio runtime
    fn install() -> anyhow::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
            _ = self.sigint.recv() => info!("Received SIGINT signal, shutting down"),
        }
    }
}

/// Close `server` once a shutdown signal arrives, unblocking its accept loop
fn close_on_shutdown(api: Arc<Api>, server: u64) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    let signals = {
        let _guard = rt.enter();
        ShutdownSignals::install()?
    };

    thread::spawn(move || {
        rt.block_on(signals.recv());
        api.close(server);
    });
    Ok(())
}

/// Fail with the recorded message unless `status` is Ok
fn check(api: &Api, handle: u64, op: &str, status: Status) -> anyhow::Result<()> {
    if status.is_ok() {
        return Ok(());
    }
    bail!("{} failed ({:?}): {}", op, status, api.err_msg(handle))
}

fn bring_up(api: &Api, node: &NodeArgs) -> anyhow::Result<u64> {
    let server = api.new_server();

    if let Some(hostname) = &node.hostname {
        check(api, server, "set_hostname", api.set_hostname(server, hostname))?;
    }
    if let Some(url) = &node.control_url {
        check(api, server, "set_control_url", api.set_control_url(server, url))?;
    }
    if let Some(key) = &node.auth_key {
        check(api, server, "set_authkey", api.set_authkey(server, key))?;
    }
    if let Some(dir) = &node.dir {
        let dir = dir.to_str().context("state directory must be valid UTF-8")?;
        check(api, server, "set_dir", api.set_dir(server, dir))?;
    }
    check(api, server, "set_ephemeral", api.set_ephemeral(server, node.ephemeral))?;

    check(api, server, "start", api.start(server))?;
    check(api, server, "up", api.up(server))?;

    let (ips, status) = api.getips(server);
    check(api, server, "getips", status)?;
    info!("Node is up at {}", ips);
    Ok(server)
}

fn run_echo(api: Arc<Api>, node: &NodeArgs, port: u16, loopback: bool) -> anyhow::Result<()> {
    let server = bring_up(&api, node)?;
    close_on_shutdown(api.clone(), server)?;

    if loopback {
        let (addr, credential, status) = api.loopback(server);
        check(&api, server, "loopback", status)?;
        println!("socks5://{}:{}@{}", LOOPBACK_USER, credential, addr);
    }

    let (listener, status) = api.listen(server, "tcp", &format!(":{}", port));
    check(&api, server, "listen", status)?;
    let (addr, _) = api.listener_addr(listener);
    info!("Echoing on {}", addr);

    loop {
        let (conn, status) = api.accept(listener);
        if status == Status::Cancelled {
            info!("Echo listener closed");
            break;
        }
        check(&api, listener, "accept", status)?;

        let api = api.clone();
        thread::spawn(move || echo(&api, conn));
    }

    api.close(server);
    Ok(())
}

fn echo(api: &Api, conn: u64) {
    let (peer, _) = api.remote_addr(conn);
    debug!("Echo stream from {}", peer);

    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0usize;
    loop {
        let (n, status) = api.read(conn, &mut buf);
        if !status.is_ok() {
            debug!("Echo read from {} ended: {}", peer, api.err_msg(conn));
            break;
        }
        if n == 0 {
            break;
        }
        if api.write(conn, &buf[..n]).1 != Status::Ok {
            debug!("Echo write to {} failed: {}", peer, api.err_msg(conn));
            break;
        }
        total += n;
    }

    api.close(conn);
    info!("Echo stream from {} closed after {} bytes", peer, total);
}

fn run_send(api: &Api, node: &NodeArgs, network: &str, target: &str, message: &str) -> anyhow::Result<()> {
    let server = bring_up(api, node)?;

    let (conn, status) = api.dial(server, network, target);
    check(api, server, "dial", status)?;
    let (local, _) = api.local_addr(conn);
    info!("Connected to {} from {}", target, local);

    let (_, status) = api.write(conn, message.as_bytes());
    check(api, conn, "write", status)?;

    let mut reply = Vec::with_capacity(message.len());
    let mut buf = vec![0u8; 16 * 1024];
    while reply.len() < message.len() {
        let (n, status) = api.read(conn, &mut buf);
        check(api, conn, "read", status)?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    println!("{}", String::from_utf8_lossy(&reply));

    api.close(server);
    Ok(())
}
