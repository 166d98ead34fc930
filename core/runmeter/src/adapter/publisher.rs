//! Publisher side of the adapter protocol, used by the adapter processes.
//!
//! An [`AdapterServer`] accepts subscribers and broadcasts the readings given to
//! its [`Publisher`]. Readings that are published while nobody is subscribed are
//! lost: they are never replayed to a new subscriber.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::broadcast,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, MessageBody, MessageEnum, MessageStream, PROTOCOL_VERSION, Welcome, WireReading};
use crate::measurement::{PowerKind, Stamp};

/// Number of readings that can be buffered for a slow subscriber.
const BROADCAST_CAPACITY: usize = 1024;

/// Default interval between two heartbeats, when there is no reading to send.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Publishes readings to the subscribers of an [`AdapterServer`].
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<WireReading>,
}

impl Publisher {
    /// Sends a reading to every subscriber, and returns the number of subscribers.
    pub fn publish(&self, reading: WireReading) -> usize {
        self.tx.send(reading).unwrap_or(0)
    }

    /// Publishes a value stamped with the current time.
    pub fn publish_now(&self, source_id: &str, value: f64, kind: PowerKind) -> usize {
        let now = crate::measurement::Timestamp::now();
        self.publish(WireReading {
            source_id: source_id.to_owned(),
            stamp: Stamp::Timestamp(now.to_unix_micros()),
            value,
            kind,
        })
    }

    /// Number of active subscribers.
    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Accepts the subscriptions of the hubs.
pub struct AdapterServer {
    name: String,
    sources: Vec<String>,
    heartbeat: Duration,
    listener: TcpListener,
    tx: broadcast::Sender<WireReading>,
    cancel_token: CancellationToken,
}

impl AdapterServer {
    /// Binds a new server to the given address.
    ///
    /// `name` and `sources` are announced to the subscribers.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        name: impl Into<String>,
        sources: Vec<String>,
        cancel_token: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            name: name.into(),
            sources,
            heartbeat: DEFAULT_HEARTBEAT,
            listener,
            tx,
            cancel_token,
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn publisher(&self) -> Publisher {
        Publisher { tx: self.tx.clone() }
    }

    fn start_serving(&self, tcp_stream: TcpStream, remote_addr: SocketAddr) {
        log::info!("New incoming connection from {remote_addr}");
        let subscriber = Subscriber {
            name: self.name.clone(),
            sources: self.sources.clone(),
            heartbeat: self.heartbeat,
            tcp: MessageStream::new(tcp_stream),
            tx: self.tx.clone(),
            cancel_token: self.cancel_token.child_token(),
        };
        tokio::spawn(async move {
            if let Err(e) = subscriber.serve().await {
                log::error!("Error in the connection to subscriber {remote_addr}: {e:?}");
            }
            log::info!("Subscriber disconnected: {remote_addr}");
        });
    }

    pub fn accept_loop(self) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel_token.cancelled() => {
                        break;
                    }
                    incoming = self.listener.accept() => {
                        match incoming {
                            Ok((tcp_stream, remote_addr)) => {
                                self.start_serving(tcp_stream, remote_addr);
                            },
                            Err(e) => {
                                log::error!("unexpected error in async TCP listener: {e:?}");
                            }
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

struct Subscriber {
    name: String,
    sources: Vec<String>,
    heartbeat: Duration,
    tcp: MessageStream<TcpStream>,
    /// Used to subscribe to the readings once the handshake is done.
    tx: broadcast::Sender<WireReading>,
    cancel_token: CancellationToken,
}

impl Subscriber {
    fn message(&self, content: MessageEnum) -> MessageBody {
        MessageBody {
            sender: self.name.clone(),
            content,
        }
    }

    /// Answers the subscription. Returns `false` if the subscriber is not compatible.
    async fn handshake(&mut self) -> Result<bool, protocol::Error> {
        let msg = self.tcp.read_message().await?;
        let subscribe = match msg.content {
            MessageEnum::Subscribe(subscribe) => subscribe,
            other => {
                log::warn!("Expected a subscription from {}, got {other:?}", msg.sender);
                return Ok(false);
            }
        };
        let accept = subscribe.protocol_version == PROTOCOL_VERSION;
        if accept {
            log::info!(
                "Subscriber {} ({}) is compatible, protocol version {}",
                msg.sender,
                subscribe.client,
                subscribe.protocol_version
            );
        } else {
            log::warn!(
                "Subscriber {} uses protocol version {}, incompatible with version {PROTOCOL_VERSION}. Rejecting.",
                msg.sender,
                subscribe.protocol_version
            );
        }
        let welcome = self.message(MessageEnum::Welcome(Welcome {
            accept,
            protocol_version: PROTOCOL_VERSION,
            sources: self.sources.clone(),
        }));
        self.tcp.write_message(&welcome).await?;
        Ok(accept)
    }

    async fn serve(mut self) -> anyhow::Result<()> {
        if !self.handshake().await? {
            self.tcp.shutdown().await?;
            return Ok(());
        }
        let mut rx = self.tx.subscribe();
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                r = tokio::time::timeout(self.heartbeat, rx.recv()) => r,
            };
            let content = match received {
                Ok(Ok(reading)) => MessageEnum::Reading(reading),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    log::warn!("{n} readings were lost because the subscriber was too slow!");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_idle) => MessageEnum::Heartbeat,
            };
            let msg = self.message(content);
            match self.tcp.write_message(&msg).await {
                Ok(()) => (),
                Err(protocol::Error::Io(e)) if is_disconnection(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn is_disconnection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpStream;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::adapter::protocol::Subscribe;

    async fn subscribe(addr: SocketAddr, protocol_version: u32) -> anyhow::Result<(MessageStream<TcpStream>, Welcome)> {
        let mut stream = MessageStream::new(TcpStream::connect(addr).await?);
        stream
            .write_message(&MessageBody {
                sender: String::from("test-hub"),
                content: MessageEnum::Subscribe(Subscribe {
                    client: String::from("test"),
                    protocol_version,
                }),
            })
            .await?;
        let answer = stream.read_message().await?;
        assert_eq!(answer.sender, "test-adapter");
        match answer.content {
            MessageEnum::Welcome(welcome) => Ok((stream, welcome)),
            other => panic!("unexpected answer {other:?}"),
        }
    }

    async fn wait_for_subscribers(publisher: &Publisher, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.subscribers() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber should be registered");
    }

    #[tokio::test]
    async fn broadcast_readings() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let cancel = CancellationToken::new();
        let server = AdapterServer::bind("127.0.0.1:0", "test-adapter", vec![String::from("gpu")], cancel.clone())
            .await?
            .with_heartbeat(Duration::from_millis(20));
        let addr = server.local_addr()?;
        let publisher = server.publisher();
        tokio::spawn(server.accept_loop());

        // nobody listens yet: this reading is lost
        assert_eq!(publisher.publish_now("gpu", 1.0, PowerKind::Watts), 0);

        let (mut a, welcome) = subscribe(addr, PROTOCOL_VERSION).await?;
        assert!(welcome.accept);
        assert_eq!(welcome.sources, vec![String::from("gpu")]);
        let (mut b, _) = subscribe(addr, PROTOCOL_VERSION).await?;
        wait_for_subscribers(&publisher, 2).await;

        let reading = WireReading {
            source_id: String::from("gpu"),
            stamp: Stamp::Sequence(7),
            value: 42.0,
            kind: PowerKind::Watts,
        };
        assert_eq!(publisher.publish(reading.clone()), 2);

        for stream in [&mut a, &mut b] {
            loop {
                let msg = stream.read_message().await?;
                match msg.content {
                    MessageEnum::Heartbeat => continue,
                    MessageEnum::Reading(r) => {
                        assert_eq!(r, reading);
                        break;
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
        }

        // idle: heartbeats only
        let msg = a.read_message().await?;
        assert_eq!(msg.content, MessageEnum::Heartbeat);
        cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn incompatible_subscriber() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let server = AdapterServer::bind("127.0.0.1:0", "test-adapter", vec![], cancel.clone()).await?;
        let addr = server.local_addr()?;
        let publisher = server.publisher();
        tokio::spawn(server.accept_loop());

        let (mut stream, welcome) = subscribe(addr, PROTOCOL_VERSION + 1).await?;
        assert!(!welcome.accept);
        assert!(matches!(stream.read_message().await, Err(protocol::Error::Disconnected)));
        assert_eq!(publisher.subscribers(), 0);
        cancel.cancel();
        Ok(())
    }
}
