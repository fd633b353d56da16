//! Loopback proxy: a SOCKS5 endpoint on 127.0.0.1 that opens streams through
//! a node's mesh session.
//!
//! Clients authenticate with username/password (RFC 1929). The username is
//! always [`LOOPBACK_USER`]; the password is the proxy credential. Only the
//! CONNECT command is served.

use crate::engine::{EngineError, EngineSession, Network};
use crate::error::{MeshError, Result};
use anyhow::{bail, Context};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::instrument::WithSubscriber;
use tracing::{debug, info};

/// Username expected by the proxy
pub const LOOPBACK_USER: &str = "mesh";

const CREDENTIAL_LEN: usize = 32;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Where the proxy listens and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    /// `127.0.0.1:<port>`
    pub addr: String,
    /// Password for [`LOOPBACK_USER`]
    pub credential: String,
}

/// A running proxy; stops when dropped
pub(crate) struct Loopback {
    info: LoopbackInfo,
    task: JoinHandle<()>,
}

impl Loopback {
    /// Bind the proxy and start serving; must run inside the runtime
    pub(crate) async fn start(session: Arc<dyn EngineSession>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| MeshError::Network(format!("loopback bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| MeshError::Network(format!("loopback address: {}", e)))?;

        let credential: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CREDENTIAL_LEN)
            .map(char::from)
            .collect();

        let task = tokio::spawn(
            serve(listener, session, Arc::from(credential.as_str())).with_current_subscriber(),
        );
        info!(component = "loopback", "Loopback proxy listening on {}", addr);

        Ok(Self {
            info: LoopbackInfo {
                addr: addr.to_string(),
                credential,
            },
            task,
        })
    }

    pub(crate) fn info(&self) -> &LoopbackInfo {
        &self.info
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        // Dropping the serve task's JoinSet aborts every client as well.
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, session: Arc<dyn EngineSession>, credential: Arc<str>) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session = session.clone();
                    let credential = credential.clone();
                    clients.spawn(
                        async move {
                            if let Err(e) = handle_client(stream, session, &credential).await {
                                debug!(component = "loopback", "Proxy client {} failed: {:#}", peer, e);
                            }
                        }
                        .with_current_subscriber(),
                    );
                }
                Err(e) => {
                    debug!(component = "loopback", "Proxy accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = clients.join_next() => {}
        }
    }
}

async fn handle_client(
    mut client: TcpStream,
    session: Arc<dyn EngineSession>,
    credential: &str,
) -> anyhow::Result<()> {
    negotiate_auth(&mut client, credential).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await.context("read request")?;
    let [version, command, _reserved, atyp] = request;
    if version != SOCKS_VERSION {
        bail!("unsupported SOCKS version {}", version);
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).context("domain name is not UTF-8")?
        }
        other => {
            send_reply(&mut client, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            bail!("unsupported address type {}", other);
        }
    };
    let port = client.read_u16().await?;

    if command != CMD_CONNECT {
        send_reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        bail!("unsupported command {}", command);
    }

    let target = format!("{}:{}", host, port);
    let mut opened = match session.dial(Network::Tcp, &target).await {
        Ok(opened) => opened,
        Err(e) => {
            let code = match e {
                EngineError::InvalidAddr(_) => REPLY_HOST_UNREACHABLE,
                _ => REPLY_CONNECTION_REFUSED,
            };
            send_reply(&mut client, code).await?;
            return Err(e).with_context(|| format!("dial {}", target));
        }
    };
    send_reply(&mut client, REPLY_SUCCEEDED).await?;
    debug!(component = "loopback", "Proxying to {}", target);

    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut opened.stream).await?;
    debug!(
        component = "loopback",
        "Proxy to {} finished ({} bytes up, {} bytes down)", target, up, down
    );
    Ok(())
}

async fn negotiate_auth(client: &mut TcpStream, credential: &str) -> anyhow::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await.context("read greeting")?;
    if greeting[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version {}", greeting[0]);
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USER_PASS) {
        client.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        bail!("client offered no username/password method");
    }
    client.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

    let version = client.read_u8().await?;
    if version != AUTH_VERSION {
        bail!("unsupported auth version {}", version);
    }
    let user_len = client.read_u8().await? as usize;
    let mut user = vec![0u8; user_len];
    client.read_exact(&mut user).await?;
    let pass_len = client.read_u8().await? as usize;
    let mut pass = vec![0u8; pass_len];
    client.read_exact(&mut pass).await?;

    if user != LOOPBACK_USER.as_bytes() || pass != credential.as_bytes() {
        client.write_all(&[AUTH_VERSION, 0x01]).await?;
        bail!("bad proxy credentials");
    }
    client.write_all(&[AUTH_VERSION, 0x00]).await?;
    Ok(())
}

async fn send_reply(client: &mut TcpStream, code: u8) -> std::io::Result<()> {
    // Bound address is always reported as 0.0.0.0:0.
    client
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MeshEngine, NodeConfig};
    use tokio::sync::mpsc;

    async fn node(engine: &MeshEngine, name: &str) -> Arc<dyn EngineSession> {
        let session = engine
            .start(NodeConfig {
                dir: None,
                hostname: name.to_string(),
                auth_key: None,
                control_url: "local://proxy".to_string(),
                ephemeral: true,
            })
            .await
            .unwrap();
        session.up().await.unwrap();
        session
    }

    async fn authenticate(addr: &str, user: &str, pass: &str) -> (TcpStream, u8) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, METHOD_USER_PASS]);

        let mut auth = vec![AUTH_VERSION, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream.write_all(&auth).await.unwrap();
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        (stream, status[1])
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let engine = MeshEngine::default();
        let server = node(&engine, "web").await;
        let client = node(&engine, "laptop").await;

        let (tx, mut rx) = mpsc::channel(1);
        let _binding = server.listen(Network::Tcp, ":80", tx).await.unwrap();

        let proxy = Loopback::start(client).await.unwrap();
        let info = proxy.info().clone();
        assert!(info.addr.starts_with("127.0.0.1:"));
        assert_eq!(info.credential.len(), CREDENTIAL_LEN);
        assert!(info.credential.chars().all(|c| c.is_ascii_alphanumeric()));

        let (mut stream, status) = authenticate(&info.addr, LOOPBACK_USER, &info.credential).await;
        assert_eq!(status, 0);

        let mut request = vec![5, CMD_CONNECT, 0, ATYP_DOMAIN, 3];
        request.extend_from_slice(b"web");
        request.extend_from_slice(&80u16.to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCEEDED);

        stream.write_all(b"GET /").await.unwrap();
        let mut accepted = rx.recv().await.unwrap();
        let mut got = [0u8; 5];
        accepted.stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GET /");
    }

    #[tokio::test]
    async fn test_wrong_credential_refused() {
        let engine = MeshEngine::default();
        let client = node(&engine, "laptop").await;
        let proxy = Loopback::start(client).await.unwrap();

        let (_stream, status) = authenticate(&proxy.info().addr, LOOPBACK_USER, "guess").await;
        assert_eq!(status, 1);
    }

    #[tokio::test]
    async fn test_bind_command_refused() {
        let engine = MeshEngine::default();
        let client = node(&engine, "laptop").await;
        let proxy = Loopback::start(client).await.unwrap();
        let info = proxy.info().clone();

        let (mut stream, _) = authenticate(&info.addr, LOOPBACK_USER, &info.credential).await;
        stream
            .write_all(&[5, 0x02, 0, ATYP_IPV4, 100, 64, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_proxy_keeps_serving_after_abandoned_clients() {
        let engine = MeshEngine::default();
        let client = node(&engine, "laptop").await;
        let proxy = Loopback::start(client).await.unwrap();
        let info = proxy.info().clone();

        for _ in 0..8 {
            drop(TcpStream::connect(&info.addr).await.unwrap());
        }

        let (_stream, status) = authenticate(&info.addr, LOOPBACK_USER, &info.credential).await;
        assert_eq!(status, 0);
        assert!(!proxy.task.is_finished());
    }
}
