//! Connections to the power adapters.
//!
//! The hub runs one task per configured adapter. Each task connects to its
//! adapter, subscribes to its readings, validates them and forwards them to the
//! merger. Connection failures are retried with an exponential backoff; when
//! the retries are exhausted, the adapter's sources are reported as unavailable
//! and the rest of the run continues without them.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::SendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    self, MessageBody, MessageEnum, MessageStream, PROTOCOL_VERSION, Subscribe, WireReading,
};
use super::reading::{Anomaly, MAX_SOURCE_ID_LEN, ReadingValidator};
use super::retry::{ExponentialRetryPolicy, RetryState};
use crate::config::{AdapterConfig, Config};
use crate::error::AdapterUnavailableError;
use crate::measurement::Timestamp;
use crate::merger::{MergeEvent, lock};
use crate::record::{AdapterSession, Liveness};

/// Settings shared by all the connections.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Name sent to the adapters.
    pub client_name: String,
    pub connect_timeout: Duration,
    pub liveness_timeout: Duration,
    pub retry: ExponentialRetryPolicy,
}

impl HubSettings {
    pub fn from_config(config: &Config) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown"));
        Self {
            client_name: format!("runmeter@{hostname}"),
            connect_timeout: config.connect_timeout,
            liveness_timeout: config.liveness_timeout,
            retry: ExponentialRetryPolicy::from(&config.retry),
        }
    }
}

/// The state of the connection to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConnection {
    pub address: String,
    /// Name announced by the adapter.
    pub name: Option<String>,
    /// Sources announced by the adapter.
    pub sources: Vec<String>,
    /// When the last message was received.
    pub last_seen: Option<Timestamp>,
    pub reconnects: u32,
    pub liveness: Liveness,
}

impl AdapterConnection {
    fn new(address: String) -> Self {
        Self {
            address,
            name: None,
            sources: Vec::new(),
            last_seen: None,
            reconnects: 0,
            liveness: Liveness::Connecting,
        }
    }

    pub fn session(&self) -> AdapterSession {
        AdapterSession {
            address: self.address.clone(),
            name: self.name.clone(),
            sources: self.sources.clone(),
            reconnects: self.reconnects,
            liveness: self.liveness,
        }
    }
}

/// Manages the connections to the power adapters.
pub struct PowerAdapterHub {
    settings: HubSettings,
    connections: Vec<(AdapterConfig, Arc<Mutex<AdapterConnection>>)>,
}

impl PowerAdapterHub {
    pub fn new(settings: HubSettings, adapters: Vec<AdapterConfig>) -> Self {
        let connections = adapters
            .into_iter()
            .map(|adapter| {
                let state = AdapterConnection::new(adapter.address.clone());
                (adapter, Arc::new(Mutex::new(state)))
            })
            .collect();
        Self { settings, connections }
    }

    /// Starts one connection task per adapter, on the given runtime.
    ///
    /// Returns the name and handle of each task.
    pub fn spawn(
        &self,
        rt: &tokio::runtime::Handle,
        tx: &mpsc::Sender<MergeEvent>,
        cancel_token: &CancellationToken,
    ) -> Vec<(String, JoinHandle<()>)> {
        self.connections
            .iter()
            .map(|(adapter, state)| {
                let link = AdapterLink {
                    adapter: adapter.clone(),
                    settings: self.settings.clone(),
                    state: state.clone(),
                    tx: tx.clone(),
                    cancel_token: cancel_token.child_token(),
                    validator: ReadingValidator::new(),
                };
                let name = format!("connection to adapter {}", adapter.address);
                (name, rt.spawn(link.run()))
            })
            .collect()
    }

    /// Returns the current state of every connection.
    pub fn connections(&self) -> Vec<AdapterConnection> {
        self.connections.iter().map(|(_, state)| lock(state).clone()).collect()
    }
}

enum Subscription {
    Accepted(MessageStream<TcpStream>),
    /// The adapter refused the subscription, retrying is useless.
    Rejected(String),
}

/// Why a session with an adapter ended.
enum SessionEnd {
    Cancelled,
    /// The connection was lost, it can be retried.
    Lost(String),
}

/// The connection task of one adapter.
struct AdapterLink {
    adapter: AdapterConfig,
    settings: HubSettings,
    state: Arc<Mutex<AdapterConnection>>,
    tx: mpsc::Sender<MergeEvent>,
    cancel_token: CancellationToken,
    validator: ReadingValidator,
}

impl AdapterLink {
    fn run(mut self) -> impl Future<Output = ()> + Send {
        async move {
            let address = self.adapter.address.clone();
            let mut retry = RetryState::new(&self.settings.retry);
            let mut connected = false;
            let mut failure: Option<String> = None;
            let mut last_error = String::from("never connected");

            loop {
                self.set_liveness(Liveness::Connecting);
                let attempt = tokio::select! {
                    biased;
                    _ = self.cancel_token.cancelled() => break,
                    res = self.subscribe() => res,
                };
                match attempt {
                    Ok(Subscription::Accepted(stream)) => {
                        if connected {
                            lock(&self.state).reconnects += 1;
                        }
                        connected = true;
                        retry.reset();
                        match self.receive_loop(stream).await {
                            SessionEnd::Cancelled => break,
                            SessionEnd::Lost(reason) => {
                                log::warn!("Lost connection to adapter {address}: {reason}");
                                last_error = reason;
                            }
                        }
                    }
                    Ok(Subscription::Rejected(reason)) => {
                        log::error!("Adapter {address} rejected the subscription: {reason}");
                        failure = Some(reason);
                        break;
                    }
                    Err(e) => {
                        log::debug!("failed to connect to adapter {address}: {e:#}");
                        last_error = format!("{e:#}");
                    }
                }

                if !retry.can_retry() {
                    log::warn!(
                        "Giving up on adapter {address} after {} retries: {last_error}",
                        retry.retries()
                    );
                    failure = Some(last_error.clone());
                    break;
                }
                log::debug!("retrying to connect to adapter {address} in {:?}", retry.delay());
                tokio::select! {
                    biased;
                    _ = self.cancel_token.cancelled() => break,
                    _ = retry.after_attempt() => (),
                }
            }

            // an adapter that never answered is unavailable, even if it was still retrying
            if failure.is_none() && !connected {
                failure = Some(last_error);
            }
            if let Some(reason) = failure {
                self.set_liveness(Liveness::Unavailable);
                let err = AdapterUnavailableError {
                    address: address.clone(),
                    sources: self.adapter.expected_sources(),
                    reason,
                };
                log::warn!("{err}");
                let _ = self.tx.send(MergeEvent::Degraded(err.into())).await;
            }
            let session = lock(&self.state).session();
            let _ = self.tx.send(MergeEvent::AdapterSession(session)).await;
            log::debug!("connection task of adapter {address} stopped");
        }
    }

    fn set_liveness(&self, liveness: Liveness) {
        lock(&self.state).liveness = liveness;
    }

    /// Connects to the adapter and subscribes to its readings.
    async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let address = self.adapter.address.as_str();
        let timeout = self.settings.connect_timeout;
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow::anyhow!("connection timed out after {timeout:?}"))??;
        tcp.set_nodelay(true)?;
        let mut stream = MessageStream::new(tcp);

        stream
            .write_message(&MessageBody {
                sender: self.settings.client_name.clone(),
                content: MessageEnum::Subscribe(Subscribe {
                    client: format!("runmeter v{}", crate::VERSION),
                    protocol_version: PROTOCOL_VERSION,
                }),
            })
            .await?;
        let response = stream
            .read_timeout(timeout)
            .await
            .map_err(|_| anyhow::anyhow!("no answer to the subscription after {timeout:?}"))??;

        let welcome = match response.content {
            MessageEnum::Welcome(welcome) => welcome,
            other => anyhow::bail!("unexpected answer to the subscription: {other:?}"),
        };
        if !welcome.accept {
            return Ok(Subscription::Rejected(String::from("subscription refused")));
        }
        if welcome.protocol_version != PROTOCOL_VERSION {
            return Ok(Subscription::Rejected(format!(
                "incompatible protocol version {} (expected {PROTOCOL_VERSION})",
                welcome.protocol_version
            )));
        }
        log::info!(
            "Connected to adapter {} ({address}), protocol version {}, sources: {:?}",
            response.sender,
            welcome.protocol_version,
            welcome.sources
        );
        let mut state = lock(&self.state);
        state.name = Some(response.sender);
        state.sources = welcome.sources;
        state.liveness = Liveness::Live;
        state.last_seen = Some(Timestamp::now());
        drop(state);
        Ok(Subscription::Accepted(stream))
    }

    async fn receive_loop(&mut self, mut stream: MessageStream<TcpStream>) -> SessionEnd {
        let liveness_timeout = self.settings.liveness_timeout;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return SessionEnd::Cancelled,
                res = stream.read_timeout(liveness_timeout) => res,
            };
            let message = match received {
                Ok(Ok(msg)) => msg,
                Err(_elapsed) => {
                    let mut state = lock(&self.state);
                    if state.liveness != Liveness::Stale {
                        log::warn!(
                            "Adapter {} sent nothing for {liveness_timeout:?}, marking it as stale",
                            state.address
                        );
                        state.liveness = Liveness::Stale;
                    }
                    continue;
                }
                Ok(Err(protocol::Error::Serde(e))) => {
                    log::debug!("malformed message from adapter {}: {e}", self.adapter.address);
                    let event = MergeEvent::Anomaly {
                        source_id: None,
                        anomaly: Anomaly::Malformed(e.to_string()),
                    };
                    if self.tx.send(event).await.is_err() {
                        return SessionEnd::Cancelled;
                    }
                    continue;
                }
                Ok(Err(protocol::Error::Disconnected)) => {
                    return SessionEnd::Lost(String::from("adapter disconnected"));
                }
                Ok(Err(protocol::Error::Io(e))) => return SessionEnd::Lost(e.to_string()),
            };

            {
                let mut state = lock(&self.state);
                state.last_seen = Some(Timestamp::now());
                state.liveness = Liveness::Live;
            }
            match message.content {
                MessageEnum::Reading(reading) => {
                    if self.forward(reading).await.is_err() {
                        return SessionEnd::Cancelled;
                    }
                }
                MessageEnum::Heartbeat => (),
                other => log::debug!("ignoring unexpected message from adapter: {other:?}"),
            }
        }
    }

    async fn forward(&mut self, reading: WireReading) -> Result<(), SendError<MergeEvent>> {
        let valid_id = !reading.source_id.is_empty() && reading.source_id.len() <= MAX_SOURCE_ID_LEN;
        let source_id = valid_id.then(|| reading.source_id.clone());
        let checked = self.validator.check(reading, Timestamp::now());
        if let Some(anomaly) = checked.anomaly {
            self.tx.send(MergeEvent::Anomaly { source_id, anomaly }).await?;
        }
        if let Some(reading) = checked.reading {
            self.tx.send(MergeEvent::Reading(reading)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::adapter::protocol::Welcome;
    use crate::measurement::{Measure, PowerKind, Stamp};
    use crate::record::Degradation;

    fn settings() -> HubSettings {
        HubSettings {
            client_name: String::from("hub-test"),
            connect_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(5),
            retry: ExponentialRetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2,
            },
        }
    }

    fn link(adapter: AdapterConfig, tx: mpsc::Sender<MergeEvent>, cancel: &CancellationToken) -> AdapterLink {
        AdapterLink {
            state: Arc::new(Mutex::new(AdapterConnection::new(adapter.address.clone()))),
            adapter,
            settings: settings(),
            tx,
            cancel_token: cancel.child_token(),
            validator: ReadingValidator::new(),
        }
    }

    fn welcome(accept: bool, protocol_version: u32) -> MessageBody {
        MessageBody {
            sender: String::from("fake"),
            content: MessageEnum::Welcome(Welcome {
                accept,
                protocol_version,
                sources: vec![String::from("gpu")],
            }),
        }
    }

    fn reading(seq: u64, value: f64) -> MessageBody {
        MessageBody {
            sender: String::from("fake"),
            content: MessageEnum::Reading(WireReading {
                source_id: String::from("gpu"),
                stamp: Stamp::Sequence(seq),
                value,
                kind: PowerKind::Watts,
            }),
        }
    }

    /// Accepts a subscriber and answers its subscription.
    async fn accept(listener: &TcpListener, welcome: MessageBody) -> anyhow::Result<MessageStream<TcpStream>> {
        let (socket, _) = listener.accept().await?;
        let mut stream = MessageStream::new(socket);
        let subscribe = stream.read_message().await?;
        assert!(matches!(subscribe.content, MessageEnum::Subscribe(_)));
        stream.write_message(&welcome).await?;
        Ok(stream)
    }

    async fn free_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn unreachable_adapter() {
        let _ = env_logger::builder().is_test(true).try_init();
        let address = free_address().await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let adapter = AdapterConfig::new(&address).with_sources(["psu"]);
        tokio::time::timeout(Duration::from_secs(10), link(adapter, tx, &cancel).run())
            .await
            .expect("the retries should be exhausted");

        match rx.recv().await {
            Some(MergeEvent::Degraded(Degradation::AdapterUnavailable { address: a, sources, .. })) => {
                assert_eq!(a, address);
                assert_eq!(sources, vec![String::from("psu")]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Some(MergeEvent::AdapterSession(session)) => assert_eq!(session.liveness, Liveness::Unavailable),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn readings_are_checked() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let server = tokio::spawn(async move {
            let mut stream = accept(&listener, welcome(true, PROTOCOL_VERSION)).await?;
            stream.write_message(&reading(1, 10.0)).await?;
            stream.write_message(&reading(1, 10.0)).await?;
            stream.write_message(&reading(4, 12.0)).await?;
            stream.write_frame(&[0xff, 0xff, 0xff]).await?;
            stream.write_message(&reading(5, f64::NAN)).await?;
            stream
                .write_message(&MessageBody {
                    sender: String::from("fake"),
                    content: MessageEnum::Heartbeat,
                })
                .await?;
            // wait for the hub to leave
            let _ = stream.read_message().await;
            Ok::<_, anyhow::Error>(())
        });

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(link(AdapterConfig::new(&address), tx, &cancel).run());

        let mut events = Vec::new();
        while events.len() < 6 {
            events.push(rx.recv().await.expect("the link should be running"));
        }
        cancel.cancel();
        task.await?;
        server.await??;

        let gpu = Some(String::from("gpu"));
        assert!(matches!(&events[0], MergeEvent::Reading(r) if r.measure == Measure::Watts(10.0)));
        assert_eq!(
            events[1],
            MergeEvent::Anomaly {
                source_id: gpu.clone(),
                anomaly: Anomaly::Duplicate
            }
        );
        assert_eq!(
            events[2],
            MergeEvent::Anomaly {
                source_id: gpu.clone(),
                anomaly: Anomaly::Missing(2)
            }
        );
        assert!(matches!(&events[3], MergeEvent::Reading(r) if r.stamp == Stamp::Sequence(4)));
        assert!(matches!(&events[4], MergeEvent::Anomaly { source_id: None, anomaly: Anomaly::Malformed(_) }));
        assert!(matches!(&events[5], MergeEvent::Anomaly { source_id: Some(_), anomaly: Anomaly::Malformed(_) }));

        match rx.recv().await {
            Some(MergeEvent::AdapterSession(session)) => {
                assert_eq!(session.name.as_deref(), Some("fake"));
                assert_eq!(session.sources, vec![String::from("gpu")]);
                assert_eq!(session.reconnects, 0);
                assert_eq!(session.liveness, Liveness::Live);
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn incompatible_adapter() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let server = tokio::spawn(async move {
            let _stream = accept(&listener, welcome(true, PROTOCOL_VERSION + 1)).await?;
            Ok::<_, anyhow::Error>(())
        });

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        link(AdapterConfig::new(&address), tx, &cancel).run().await;
        server.await??;

        match rx.recv().await {
            Some(MergeEvent::Degraded(Degradation::AdapterUnavailable { sources, reason, .. })) => {
                assert_eq!(sources, vec![address]);
                assert!(reason.contains("protocol version"), "{reason}");
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn reconnects_after_disconnection() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let server = tokio::spawn(async move {
            let mut first = accept(&listener, welcome(true, PROTOCOL_VERSION)).await?;
            first.write_message(&reading(1, 10.0)).await?;
            first.shutdown().await?;
            drop(first);

            let mut second = accept(&listener, welcome(true, PROTOCOL_VERSION)).await?;
            second.write_message(&reading(2, 11.0)).await?;
            let _ = second.read_message().await;
            Ok::<_, anyhow::Error>(())
        });

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(link(AdapterConfig::new(&address), tx, &cancel).run());

        let mut readings = Vec::new();
        while readings.len() < 2 {
            match rx.recv().await {
                Some(MergeEvent::Reading(r)) => readings.push(r.stamp),
                Some(other) => panic!("unexpected event {other:?}"),
                None => panic!("the link stopped early"),
            }
        }
        cancel.cancel();
        task.await?;
        server.await??;

        assert_eq!(readings, vec![Stamp::Sequence(1), Stamp::Sequence(2)]);
        match rx.recv().await {
            Some(MergeEvent::AdapterSession(session)) => assert_eq!(session.reconnects, 1),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn silent_adapter_is_stale() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let server = tokio::spawn(async move {
            let mut stream = accept(&listener, welcome(true, PROTOCOL_VERSION)).await?;
            let _ = stream.read_message().await;
            Ok::<_, anyhow::Error>(())
        });

        let mut settings = settings();
        settings.liveness_timeout = Duration::from_millis(30);
        let hub = PowerAdapterHub::new(settings, vec![AdapterConfig::new(&address)]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let tasks = hub.spawn(&tokio::runtime::Handle::current(), &tx, &cancel);
        drop(tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.connections()[0].liveness, Liveness::Stale);

        cancel.cancel();
        for (_, task) in tasks {
            task.await?;
        }
        server.await??;
        assert!(matches!(rx.recv().await, Some(MergeEvent::AdapterSession(_))));
        assert!(rx.recv().await.is_none());
        Ok(())
    }
}
