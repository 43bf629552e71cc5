/*!
 * Prologix-style GPIB-Ethernet bridge.
 *
 * The bridge accepts bus traffic and `++` directives on a single byte
 * stream. Directives are terminated by LF; device payloads are forwarded
 * verbatim. With `++auto 1` the bridge addresses the instrument to talk right
 * after each write, so a query is simply a write followed by a read.
 */
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use labbus_core::config::ControllerConfig;

use crate::address::BusAddress;
use crate::channel::{read_exact_bytes, read_until_terminator, BusChannel, ChannelConnector};
use crate::command::{StatusByte, Terminator};
use crate::controller::Controller;
use crate::error::{BusError, Result};

/// Lowest read timeout the bridge accepts, in milliseconds
const MIN_BRIDGE_READ_TMO_MS: u128 = 1;

/// Highest read timeout the bridge accepts, in milliseconds
const MAX_BRIDGE_READ_TMO_MS: u128 = 3000;

/// Quiet period that ends a drain of stale input
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Bus channel speaking the Prologix directive protocol over any byte stream
///
/// A read that times out leaves its late reply on the stream. The channel
/// remembers this and discards pending input before the next write or serial
/// poll, so a reply is never handed to the command that follows.
#[derive(Debug)]
pub struct PrologixChannel<S> {
    stream: BufStream<S>,
    read_timeout: Duration,
    drain_window: Duration,
    stale: bool,
}

impl<S> PrologixChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an open stream
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            read_timeout,
            drain_window: DEFAULT_DRAIN_WINDOW,
            stale: false,
        }
    }

    /// Override how long the stream must stay quiet for a drain to finish
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Discard input left over from a timed-out read
    ///
    /// Reads and drops bytes, buffered ones first, until the stream has been
    /// quiet for the drain window.
    async fn drain_stale(&mut self) -> Result<()> {
        if !self.stale {
            return Ok(());
        }
        let mut discard = [0u8; 256];
        let mut discarded = 0usize;
        loop {
            match timeout(self.drain_window, self.stream.read(&mut discard)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        self.stale = false;
        if discarded > 0 {
            debug!(discarded, "Discarded stale bridge input");
        }
        Ok(())
    }

    /// Send one `++` directive
    async fn directive(&mut self, directive: &str) -> Result<()> {
        trace!(directive, "Bridge directive");
        self.stream.write_all(directive.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn address_argument(address: BusAddress) -> String {
        address.to_string()
    }
}

#[async_trait]
impl<S> BusChannel for PrologixChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn initialize(&mut self) -> Result<()> {
        let read_tmo = self
            .read_timeout
            .as_millis()
            .clamp(MIN_BRIDGE_READ_TMO_MS, MAX_BRIDGE_READ_TMO_MS);
        self.directive("++mode 1").await?;
        self.directive("++auto 1").await?;
        self.directive("++eoi 1").await?;
        self.directive(&format!("++read_tmo_ms {}", read_tmo)).await?;
        debug!(read_tmo_ms = read_tmo as u64, "Bridge initialized in controller mode");
        Ok(())
    }

    async fn switch_address(&mut self, address: BusAddress) -> Result<()> {
        self.directive(&format!("++addr {}", Self::address_argument(address)))
            .await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.drain_stale().await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_until(&mut self, terminator: Terminator) -> Result<Vec<u8>> {
        let read = read_until_terminator(&mut self.stream, terminator);
        timed_read(&mut self.stale, self.read_timeout, "read", read).await
    }

    async fn read_exact(&mut self, count: usize) -> Result<Vec<u8>> {
        let read = read_exact_bytes(&mut self.stream, count);
        timed_read(&mut self.stale, self.read_timeout, "read", read).await
    }

    async fn serial_poll(&mut self, address: BusAddress) -> Result<StatusByte> {
        self.drain_stale().await?;
        self.directive(&format!("++spoll {}", Self::address_argument(address)))
            .await?;
        let read = read_until_terminator(&mut self.stream, Terminator::Lf);
        let reply = timed_read(&mut self.stale, self.read_timeout, "serial poll", read).await?;
        let text = String::from_utf8_lossy(&reply);
        text.trim()
            .parse::<u8>()
            .map(StatusByte)
            .map_err(|e| BusError::io(format!("Malformed serial poll reply {:?}: {}", text, e)))
    }

    async fn interface_clear(&mut self) -> Result<()> {
        self.directive("++ifc").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.directive("++rst").await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.flush().await?;
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Bound a bridge read by `read_timeout`; a timeout sets `stale`
async fn timed_read<T, F>(stale: &mut bool, read_timeout: Duration, what: &str, read: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout(read_timeout, read).await {
        Ok(result) => result,
        Err(_) => {
            *stale = true;
            Err(BusError::timed_out_after(what, read_timeout))
        }
    }
}

/// Opens TCP connections to a network bridge
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Bridge host name or IP address
    pub host: String,
    /// Bridge TCP port
    pub port: u16,
    /// Limit for establishing the connection
    pub connect_timeout: Duration,
    /// Limit for each read
    pub read_timeout: Duration,
    /// Connection attempts before giving up
    pub attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl TcpConnector {
    /// Create a connector with default timeouts
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Create a connector from a `[[controllers]]` entry
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            attempts: config.connect_attempts,
            retry_delay: config.retry_delay(),
        }
    }

    async fn connect_once(&self, endpoint: &str) -> Result<TcpStream> {
        match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(stream) => stream.map_err(|e| BusError::io(format!("Connect to {} failed: {}", endpoint, e))),
            Err(_) => Err(BusError::timed_out_after(&format!("connect to {}", endpoint), self.connect_timeout)),
        }
    }
}

#[async_trait]
impl ChannelConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn BusChannel>> {
        let endpoint = self.endpoint();
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        let stream = loop {
            match self.connect_once(&endpoint).await {
                Ok(stream) => break stream,
                Err(e) if attempt < attempts => {
                    warn!(%endpoint, attempt, attempts, "Bridge connection failed, retrying: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        stream.set_nodelay(true)?;
        info!(%endpoint, "Connected to bridge");
        Ok(Box::new(PrologixChannel::new(stream, self.read_timeout)))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hands out a single pre-opened stream as a Prologix channel
///
/// Useful when the transport is not a plain TCP connection, for example a
/// tunnelled socket or an in-memory stream. Only the first `connect`
/// succeeds.
#[derive(Debug)]
pub struct StreamConnector<S> {
    stream: Mutex<Option<S>>,
    label: String,
    read_timeout: Duration,
}

impl<S> StreamConnector<S> {
    /// Wrap `stream`
    pub fn new<L: Into<String>>(label: L, stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            label: label.into(),
            read_timeout,
        }
    }
}

#[async_trait]
impl<S> ChannelConnector for StreamConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn connect(&self) -> Result<Box<dyn BusChannel>> {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BusError::io(format!("{} has already been used", self.label)))?;
        Ok(Box::new(PrologixChannel::new(stream, self.read_timeout)))
    }

    fn endpoint(&self) -> String {
        self.label.clone()
    }
}

impl Controller {
    /// Create a controller for a network bridge described by `config`
    pub fn network(config: &ControllerConfig) -> Self {
        Controller::new(config.name.clone(), TcpConnector::from_config(config))
    }
}
