//! Socket primitives.
//!
//! Connect with timeout (directly or through a SOCKS5 proxy), name lookup,
//! listener binding, and the [`Transport`] / [`SocketHandle`] pair through
//! which peer connections touch their socket.

use crate::netaddr::{canonical_addr, parse_numeric, split_host_port};
use crate::{NetworkError, NetworkResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to wait for each SOCKS5 reply.
pub const SOCKS5_RECV_TIMEOUT: Duration = Duration::from_secs(20);

const LISTEN_BACKLOG: i32 = 128;

/// Non-blocking byte transport under a peer connection.
pub trait Transport: Send + Sync + 'static {
    /// Write without blocking; `WouldBlock` when the socket is full.
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Read without blocking; `Ok(0)` on orderly close.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Resolve once the socket is ready for `interest`.
    fn ready(self: Arc<Self>, interest: Interest) -> BoxFuture<'static, io::Result<Ready>>;

    /// Shut down both directions. Safe to call from any thread.
    fn shutdown(&self);
}

/// TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Self { stream }
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok().map(canonical_addr)
    }
}

impl Transport for TcpTransport {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn ready(self: Arc<Self>, interest: Interest) -> BoxFuture<'static, io::Result<Ready>> {
        async move { self.stream.ready(interest).await }.boxed()
    }

    fn shutdown(&self) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}

/// Owning handle to a peer's transport; closes exactly once.
///
/// The transport is only reachable through [`SocketHandle::get`], which
/// returns `None` once the handle is closed.
pub struct SocketHandle {
    inner: Mutex<Option<Arc<dyn Transport>>>,
}

impl SocketHandle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Mutex::new(Some(transport)),
        }
    }

    /// Transport, unless closed.
    pub fn get(&self) -> Option<Arc<dyn Transport>> {
        self.inner.lock().clone()
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Close the transport. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        let transport = self.inner.lock().take();
        match transport {
            Some(transport) => {
                transport.shutdown();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Run `fut` unless cancelled or timed out first.
async fn interruptible<T, F>(
    fut: F,
    limit: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> NetworkResult<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NetworkError::Interrupted),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(NetworkError::Io(e)),
            Err(_) => Err(NetworkError::Timeout(what.to_string())),
        },
    }
}

/// Open a TCP connection with a timeout.
pub async fn connect_direct(
    addr: SocketAddr,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> NetworkResult<TcpStream> {
    let stream = interruptible(TcpStream::connect(addr), connect_timeout, cancel, "connect")
        .await
        .map_err(|e| match e {
            NetworkError::Interrupted => NetworkError::Interrupted,
            other => NetworkError::ConnectionFailed(format!("{}: {}", addr, other)),
        })?;
    debug!(addr = %addr, "Connected");
    Ok(stream)
}

/// A SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy address.
    pub addr: SocketAddr,
    /// Use fresh credentials per connection so the proxy isolates streams.
    pub randomize_credentials: bool,
}

/// RFC1929 username and password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

static CREDENTIALS_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ProxyConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            randomize_credentials: false,
        }
    }

    fn credentials(&self) -> Option<ProxyCredentials> {
        if !self.randomize_credentials {
            return None;
        }
        let n = CREDENTIALS_COUNTER.fetch_add(1, Ordering::Relaxed);
        Some(ProxyCredentials {
            username: n.to_string(),
            password: n.to_string(),
        })
    }
}

/// Human-readable SOCKS5 reply code.
pub fn socks5_error_string(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "protocol error",
        0x08 => "address type not supported",
        _ => "unknown",
    }
}

mod socks {
    pub const VERSION: u8 = 0x05;
    pub const NOAUTH: u8 = 0x00;
    pub const USER_PASS: u8 = 0x02;
    pub const USER_PASS_VERSION: u8 = 0x01;
    pub const CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAINNAME: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
}

async fn recv_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> NetworkResult<()> {
    interruptible(stream.read_exact(buf), SOCKS5_RECV_TIMEOUT, cancel, "proxy reply")
        .await
        .map(|_| ())
}

fn proxy_err(msg: impl Into<String>) -> NetworkError {
    NetworkError::ProxyTargetUnreachable(msg.into())
}

/// Ask a connected SOCKS5 proxy to open a stream to `host:port`.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<&ProxyCredentials>,
    cancel: &CancellationToken,
) -> NetworkResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.len() > 255 {
        return Err(proxy_err("Hostname too long"));
    }

    let greeting: &[u8] = match auth {
        Some(_) => &[socks::VERSION, 0x02, socks::NOAUTH, socks::USER_PASS],
        None => &[socks::VERSION, 0x01, socks::NOAUTH],
    };
    stream.write_all(greeting).await?;

    let mut method = [0u8; 2];
    recv_exact(stream, &mut method, cancel).await?;
    if method[0] != socks::VERSION {
        return Err(proxy_err("Proxy failed to initialize"));
    }
    match (method[1], auth) {
        (socks::NOAUTH, _) => {}
        (socks::USER_PASS, Some(creds)) => {
            if creds.username.len() > 255 || creds.password.len() > 255 {
                return Err(proxy_err("Proxy username or password too long"));
            }
            let mut req = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
            req.push(socks::USER_PASS_VERSION);
            req.push(creds.username.len() as u8);
            req.extend_from_slice(creds.username.as_bytes());
            req.push(creds.password.len() as u8);
            req.extend_from_slice(creds.password.as_bytes());
            stream.write_all(&req).await?;
            debug!("SOCKS5 sending proxy authentication");

            let mut reply = [0u8; 2];
            recv_exact(stream, &mut reply, cancel).await?;
            if reply != [socks::USER_PASS_VERSION, 0x00] {
                return Err(proxy_err("Proxy authentication unsuccessful"));
            }
        }
        _ => return Err(proxy_err("Proxy requested wrong authentication method")),
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[socks::VERSION, socks::CONNECT, 0x00, socks::ATYP_DOMAINNAME]);
    req.push(host.len() as u8);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    recv_exact(stream, &mut head, cancel).await?;
    if head[0] != socks::VERSION {
        return Err(proxy_err("Proxy failed to accept request"));
    }
    if head[1] != 0x00 {
        // Failures to connect to a peer that are not proxy errors.
        return Err(proxy_err(format!(
            "Proxy error: {}",
            socks5_error_string(head[1])
        )));
    }
    if head[2] != 0x00 {
        return Err(proxy_err("Malformed proxy response"));
    }

    let addr_len = match head[3] {
        socks::ATYP_IPV4 => 4,
        socks::ATYP_IPV6 => 16,
        socks::ATYP_DOMAINNAME => {
            let mut len = [0u8; 1];
            recv_exact(stream, &mut len, cancel).await?;
            len[0] as usize
        }
        _ => return Err(proxy_err("Malformed proxy response")),
    };
    // Bound address and port, discarded.
    let mut rest = vec![0u8; addr_len + 2];
    recv_exact(stream, &mut rest, cancel).await?;
    debug!(host = %host, port, "SOCKS5 connected");
    Ok(())
}

/// Connect to `host:port` through a SOCKS5 proxy.
///
/// Failure to reach the proxy itself is [`NetworkError::ProxyFailed`] and
/// must not count against the destination.
pub async fn connect_through_proxy(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> NetworkResult<TcpStream> {
    let mut stream = match connect_direct(proxy.addr, connect_timeout, cancel).await {
        Ok(stream) => stream,
        Err(NetworkError::Interrupted) => return Err(NetworkError::Interrupted),
        Err(e) => {
            warn!(proxy = %proxy.addr, error = %e, "Failed to connect to proxy");
            return Err(NetworkError::ProxyFailed(e.to_string()));
        }
    };
    let creds = proxy.credentials();
    socks5_handshake(&mut stream, host, port, creds.as_ref(), cancel).await?;
    Ok(stream)
}

/// Resolve `name` to socket addresses, numeric forms first.
///
/// Returns at most `max_results` addresses. Without `allow_dns`, only
/// numeric hosts resolve.
pub async fn lookup(
    name: &str,
    default_port: u16,
    allow_dns: bool,
    max_results: usize,
    dns_timeout: Duration,
) -> NetworkResult<Vec<SocketAddr>> {
    if let Some(addr) = parse_numeric(name, default_port) {
        return Ok(vec![addr]);
    }
    if !allow_dns {
        return Err(NetworkError::InvalidAddress(format!(
            "Name lookup disabled: {}",
            name
        )));
    }

    let (host, port) = split_host_port(name);
    let port = port.unwrap_or(default_port);
    let target = (host.clone(), port);

    let result = tokio::time::timeout(
        dns_timeout,
        tokio::task::spawn_blocking(move || {
            target.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
        }),
    )
    .await;

    let addrs = match result {
        Ok(Ok(Ok(addrs))) => addrs,
        Ok(Ok(Err(e))) => return Err(NetworkError::InvalidAddress(format!("{}: {}", host, e))),
        Ok(Err(e)) => {
            return Err(NetworkError::InvalidAddress(format!(
                "Task join error: {}",
                e
            )))
        }
        Err(_) => return Err(NetworkError::Timeout(format!("DNS lookup of {}", host))),
    };

    let mut out: Vec<SocketAddr> = addrs.into_iter().map(canonical_addr).collect();
    out.dedup();
    out.truncate(max_results);
    Ok(out)
}

/// First address `name` resolves to.
pub async fn lookup_one(
    name: &str,
    default_port: u16,
    allow_dns: bool,
    dns_timeout: Duration,
) -> NetworkResult<SocketAddr> {
    lookup(name, default_port, allow_dns, 1, dns_timeout)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::InvalidAddress(format!("No addresses for {}", name)))
}

/// Bind a non-blocking listener with address reuse.
///
/// IPv6 listeners are v6-only so an IPv4 listener can share the port.
pub fn bind_listener(addr: SocketAddr) -> NetworkResult<TcpListener> {
    let bind_err = |e: io::Error| {
        NetworkError::BindFailed(format!("Unable to bind to {} on this computer: {}", addr, e))
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_socket_handle_closes_once() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let (client, accepted) = tokio::join!(
            connect_direct(addr, Duration::from_secs(5), &cancel),
            listener.accept()
        );
        let client = client.unwrap();
        let (_server, _) = accepted.unwrap();

        let handle = SocketHandle::new(Arc::new(TcpTransport::new(client)));
        assert!(handle.is_open());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.get().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
            listener.local_addr().unwrap()
        };
        let cancel = CancellationToken::new();
        let res = connect_direct(addr, Duration::from_secs(5), &cancel).await;
        assert!(matches!(res, Err(NetworkError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // TEST-NET-1 never answers.
        let res = connect_direct("192.0.2.1:7890".parse().unwrap(), Duration::from_secs(5), &cancel).await;
        assert!(matches!(res, Err(NetworkError::Interrupted)));
    }

    #[tokio::test]
    async fn test_socks5_handshake_with_auth() {
        let (mut client, mut proxy) = duplex(1024);
        let cancel = CancellationToken::new();
        let creds = ProxyCredentials {
            username: "user".into(),
            password: "pass".into(),
        };

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, 0, 2]);
            proxy.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 11];
            proxy.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[..], b"\x01\x04user\x04pass");
            proxy.write_all(&[1, 0]).await.unwrap();

            let mut req = [0u8; 5 + 11 + 2];
            proxy.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..5], &[5, 1, 0, 3, 11]);
            assert_eq!(&req[5..16], b"example.org");
            assert_eq!(&req[16..], &7890u16.to_be_bytes());

            proxy.write_all(&[5, 0, 0, 1, 1, 2, 3, 4, 0x1e, 0xd2]).await.unwrap();
        });

        socks5_handshake(&mut client, "example.org", 7890, Some(&creds), &cancel)
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_reply_error() {
        let (mut client, mut proxy) = duplex(1024);
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[5, 0]).await.unwrap();
            let mut req = [0u8; 5 + 4 + 2];
            proxy.read_exact(&mut req).await.unwrap();
            proxy.write_all(&[5, 5, 0, 1]).await.unwrap();
        });

        let err = socks5_handshake(&mut client, "host", 1, None, &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(!err.is_proxy_failure());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_numeric_without_dns() {
        let addrs = lookup("1.2.3.4", 7890, false, 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addrs, vec!["1.2.3.4:7890".parse().unwrap()]);
        assert!(lookup("example.org", 7890, false, 10, Duration::from_secs(1))
            .await
            .is_err());
    }
}
