use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use nonzero_ext::nonzero;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::stream::Dispatcher;
use crate::{Error, Result};

/// Connection-level configuration shared by every session spawned
/// from one listener.
#[derive(Clone, Debug)]
pub struct Builder {
    /// The name of the server.
    pub name: String,
    ///The local address the server listens on.
    pub laddr: SocketAddr,
    ///The maximum length of the TCP connection queue.
    pub backlog: i32,
    ///Sets the value of the TCP_NODELAY option on this socket.
    pub nodelay: bool,
    ///Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    ///Whether to enable the SO_REUSEPORT option.
    pub reuseport: Option<bool>,
    ///Maximum allowed mqtt message length, default: 1M
    pub max_packet_size: u32,

    ///Minimum allowable keepalive value for mqtt connection,
    ///less than this value will reject the connection(MQTT V3),
    ///less than this value will set keepalive to this value in CONNACK (MQTT V5),
    ///default: 0, unit: seconds
    pub min_keepalive: u16,
    ///Maximum allowable keepalive value for mqtt connection,
    ///greater than this value will reject the connection(MQTT V3),
    ///greater than this value will set keepalive to this value in CONNACK (MQTT V5),
    ///default value: 65535, unit: seconds
    pub max_keepalive: u16,
    ///A value of zero indicates disabling the keep-alive feature, where the server
    ///doesn't need to disconnect due to client inactivity, default: true
    pub allow_zero_keepalive: bool,
    ///# > 0.5, Keepalive * backoff * 2, Default: 0.75
    pub keepalive_backoff: f32,
    ///Flight window size. The flight window is used to store the unanswered QoS 1 and QoS 2 messages
    pub max_inflight: NonZeroU16,
    ///Handshake timeout.
    pub handshake_timeout: Duration,
    ///Send timeout.
    pub send_timeout: Duration,
    ///Maximum length of message queue
    pub max_mqueue_len: usize,
    ///Maximum length of client ID allowed, Default: 65535
    pub max_clientid_len: usize,
    ///The maximum level at which clients are allowed to subscribe to topics.
    ///0 means unlimited. default value: 0
    pub max_topic_levels: usize,
    ///Session timeout, default value: 2 hours
    pub session_expiry_interval: Duration,
    ///QoS 1/2 message retry interval, 0 means no resend
    pub message_retry_interval: Duration,
    ///Message expiration time, 0 means no expiration, default value: 5 minutes
    pub message_expiry_interval: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 1883)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1024 * 1024,

            min_keepalive: 0,
            max_keepalive: 65535,
            allow_zero_keepalive: true,
            keepalive_backoff: 0.75,
            max_inflight: nonzero!(16u16),
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_mqueue_len: 1000,
            max_clientid_len: 65535,
            max_topic_levels: 0,
            session_expiry_interval: Duration::from_secs(2 * 60 * 60),
            message_retry_interval: Duration::from_secs(20),
            message_expiry_interval: Duration::from_secs(5 * 60),
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn reuseport(mut self, reuseport: Option<bool>) -> Self {
        self.reuseport = reuseport;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn min_keepalive(mut self, min_keepalive: u16) -> Self {
        self.min_keepalive = min_keepalive;
        self
    }

    pub fn max_keepalive(mut self, max_keepalive: u16) -> Self {
        self.max_keepalive = max_keepalive;
        self
    }

    pub fn allow_zero_keepalive(mut self, allow_zero_keepalive: bool) -> Self {
        self.allow_zero_keepalive = allow_zero_keepalive;
        self
    }

    pub fn keepalive_backoff(mut self, keepalive_backoff: f32) -> Self {
        self.keepalive_backoff = keepalive_backoff;
        self
    }

    pub fn max_inflight(mut self, max_inflight: NonZeroU16) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn max_mqueue_len(mut self, max_mqueue_len: usize) -> Self {
        self.max_mqueue_len = max_mqueue_len;
        self
    }

    pub fn max_clientid_len(mut self, max_clientid_len: usize) -> Self {
        self.max_clientid_len = max_clientid_len;
        self
    }

    pub fn max_topic_levels(mut self, max_topic_levels: usize) -> Self {
        self.max_topic_levels = max_topic_levels;
        self
    }

    pub fn session_expiry_interval(mut self, session_expiry_interval: Duration) -> Self {
        self.session_expiry_interval = session_expiry_interval;
        self
    }

    pub fn message_retry_interval(mut self, message_retry_interval: Duration) -> Self {
        self.message_retry_interval = message_retry_interval;
        self
    }

    pub fn message_expiry_interval(mut self, message_expiry_interval: Duration) -> Self {
        self.message_expiry_interval = message_expiry_interval;
        self
    }

    /// Clamps a keepalive requested in CONNECT to the configured bounds,
    /// in seconds. Zero stays zero when allowed, otherwise the minimum
    /// (or 60s when no minimum is set) applies.
    pub fn clamp_keepalive(&self, keep_alive: u16) -> u16 {
        if keep_alive == 0 {
            if self.allow_zero_keepalive {
                return 0;
            }
            return if self.min_keepalive > 0 { self.min_keepalive } else { 60 };
        }
        keep_alive.clamp(self.min_keepalive.max(1), self.max_keepalive)
    }

    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_nonblocking(true)?;

        #[cfg(not(windows))]
        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        #[cfg(not(windows))]
        if let Some(reuseport) = self.reuseport {
            builder.set_reuse_port(reuseport)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let l = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        log::info!("Starting {} Listening on {}", self.name, self.laddr);
        Ok(Listener { cfg: Arc::new(self), l })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    l: TcpListener,
}

impl Listener {
    pub async fn accept(&self) -> Result<Dispatcher<TcpStream>> {
        let (socket, remote_addr) = self.l.accept().await?;
        if let Err(e) = socket.set_nodelay(self.cfg.nodelay) {
            return Err(Error::from(e));
        }
        Ok(Dispatcher::new(socket, remote_addr, self.cfg.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_keepalive() {
        let cfg = Builder::new().min_keepalive(10).max_keepalive(120);
        assert_eq!(cfg.clamp_keepalive(60), 60);
        assert_eq!(cfg.clamp_keepalive(5), 10);
        assert_eq!(cfg.clamp_keepalive(600), 120);
        assert_eq!(cfg.clamp_keepalive(0), 0);

        let cfg = Builder::new().min_keepalive(10).allow_zero_keepalive(false);
        assert_eq!(cfg.clamp_keepalive(0), 10);

        let cfg = Builder::new().allow_zero_keepalive(false);
        assert_eq!(cfg.clamp_keepalive(0), 60);
    }
}
