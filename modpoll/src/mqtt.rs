use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::{
    select,
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;

/// Inbound messages waiting for the bridge loop. When full, the newest
/// message is dropped.
pub const INBOUND_QUEUE_CAPACITY: usize = 1000;

/// Requests waiting for the event loop. Publishes that don't fit are dropped.
pub const REQUEST_QUEUE_CAPACITY: usize = 100;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// What the bridge needs from a pub/sub broker connection.
#[async_trait]
pub trait PubSubClient: Send {
    /// Subscribes now if connected, and again after every reconnect.
    async fn subscribe(&mut self, filter: &str) -> crate::Result<()>;

    async fn publish(&mut self, message: Message) -> crate::Result<()>;

    /// Next inbound message; `None` once the connection is gone for good.
    async fn recv(&mut self) -> Option<Message>;

    fn is_connected(&self) -> bool;

    /// Disconnects. Calling it again does nothing.
    async fn close(&mut self);
}

pub fn qos(level: u8) -> crate::Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(format!("Invalid MQTT QoS level {other}").into()),
    }
}

pub fn random_client_id() -> String {
    format!("{}-{:08x}", env!("CARGO_PKG_NAME"), rand::random::<u32>())
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub credentials: Option<(String, String)>,
    pub qos: QoS,
    pub tls: bool,
    pub ca_certs: Option<PathBuf>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: None,
            credentials: None,
            qos: QoS::AtMostOnce,
            tls: false,
            ca_certs: None,
            keep_alive: Duration::from_secs(60),
        }
    }

    pub fn options(&self) -> crate::Result<MqttOptions> {
        let client_id = self.client_id.clone().unwrap_or_else(random_client_id);
        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(self.keep_alive);
        // Brokers only queue for us across reconnects when QoS asks for it.
        options.set_clean_session(self.qos == QoS::AtMostOnce);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }
        if self.tls || self.ca_certs.is_some() {
            self.set_tls(&mut options)?;
        }
        Ok(options)
    }

    #[cfg(feature = "tls")]
    fn set_tls(&self, options: &mut MqttOptions) -> crate::Result<()> {
        use rumqttc::{TlsConfiguration, Transport};

        let transport = match &self.ca_certs {
            Some(path) => Transport::tls_with_config(TlsConfiguration::Simple {
                ca: std::fs::read(path)?,
                alpn: None,
                client_auth: None,
            }),
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    fn set_tls(&self, _options: &mut MqttOptions) -> crate::Result<()> {
        Err("MQTT over TLS requires the `tls` feature".into())
    }
}

/// A [`PubSubClient`] on rumqttc. The event loop runs on its own task and
/// only ever touches the connection flag, the subscription list and the
/// inbound queue.
pub struct Client {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Receiver<Message>,
    event_loop: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(settings: &MqttSettings, shutdown: Shutdown) -> crate::Result<Self> {
        let options = settings.options()?;
        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %options.client_id(),
            "Connecting to MQTT broker"
        );

        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let (tx, inbound) = channel(INBOUND_QUEUE_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        let driver = EventLoopDriver {
            event_loop,
            client: client.clone(),
            qos: settings.qos,
            connected: connected.clone(),
            subscriptions: subscriptions.clone(),
            tx,
            shutdown,
        };

        Ok(Self {
            client,
            qos: settings.qos,
            connected,
            subscriptions,
            inbound,
            event_loop: Some(tokio::spawn(driver.run())),
        })
    }
}

#[async_trait]
impl PubSubClient for Client {
    async fn subscribe(&mut self, filter: &str) -> crate::Result<()> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(filter.to_owned());
        }
        if self.is_connected() {
            self.client.try_subscribe(filter, self.qos)?;
        }
        Ok(())
    }

    async fn publish(&mut self, message: Message) -> crate::Result<()> {
        if self.qos == QoS::AtMostOnce && !self.is_connected() {
            debug!(topic = %message.topic, "Not connected, skipping publish");
            return Ok(());
        }
        // Never wait on the request queue: while the broker is away nothing
        // drains it.
        let payload = message.payload.to_vec();
        match self.client.try_publish(&message.topic, self.qos, false, payload) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => {
                warn!(topic = %message.topic, "MQTT request queue full, dropping message");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        let Some(mut event_loop) = self.event_loop.take() else {
            return;
        };

        if self.is_connected() {
            if let Err(error) = self.client.disconnect().await {
                debug!(%error, "Disconnect request failed");
            }
            if tokio::time::timeout(RECONNECT_BACKOFF, &mut event_loop)
                .await
                .is_ok()
            {
                info!("Disconnected from MQTT broker");
                return;
            }
        }
        event_loop.abort();
        self.connected.store(false, Ordering::Release);
        info!("Disconnected from MQTT broker");
    }
}

/// Hands `message` to the bridge loop without waiting. Returns `false` once
/// the receiving side is gone.
fn enqueue(tx: &Sender<Message>, message: Message) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(topic = %message.topic, "Inbound queue full, dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

struct EventLoopDriver {
    event_loop: EventLoop,
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    tx: Sender<Message>,
    shutdown: Shutdown,
}

impl EventLoopDriver {
    async fn run(mut self) {
        loop {
            let event = self.event_loop.poll().await;
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    self.connected.store(true, Ordering::Release);
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, payload = ?publish.payload, "Received");
                    let message = Message::new(publish.topic, publish.payload);
                    if !enqueue(&self.tx, message) {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(error) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        warn!(%error, "Lost connection to MQTT broker");
                    } else {
                        debug!(%error, "MQTT connection attempt failed");
                    }
                    select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    fn resubscribe(&self) {
        let Ok(subscriptions) = self.subscriptions.lock() else {
            return;
        };
        for filter in subscriptions.iter() {
            debug!(%filter, "Subscribing");
            if let Err(error) = self.client.try_subscribe(filter, self.qos) {
                warn!(%filter, %error, "Subscribe failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory broker connection for the bridge tests.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    pub struct FakePubSub {
        pub subscriptions: Vec<String>,
        pub published: Vec<Message>,
        pub inbound: VecDeque<Message>,
        pub connected: bool,
        pub closed: usize,
    }

    #[async_trait]
    impl PubSubClient for FakePubSub {
        async fn subscribe(&mut self, filter: &str) -> crate::Result<()> {
            self.subscriptions.push(filter.to_owned());
            Ok(())
        }

        async fn publish(&mut self, message: Message) -> crate::Result<()> {
            self.published.push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Message> {
            match self.inbound.pop_front() {
                Some(message) => Some(message),
                None => std::future::pending().await,
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) {
            self.closed += 1;
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn qos_levels() {
    assert_eq!(qos(0).unwrap(), QoS::AtMostOnce);
    assert_eq!(qos(2).unwrap(), QoS::ExactlyOnce);
    assert!(qos(3).is_err());
}

#[test]
fn options_from_settings() {
    let mut settings = MqttSettings::new("broker.local", 1883);
    settings.credentials = Some(("user".into(), "secret".into()));
    settings.qos = QoS::AtLeastOnce;
    settings.client_id = Some("meter-bridge".into());

    let options = settings.options().unwrap();
    assert_eq!(options.broker_address(), ("broker.local".to_owned(), 1883));
    assert_eq!(options.client_id(), "meter-bridge");
    assert_eq!(options.keep_alive(), Duration::from_secs(60));
    assert!(!options.clean_session());
    assert_eq!(
        options.credentials(),
        Some(("user".to_owned(), "secret".to_owned()))
    );
}

#[test]
fn random_client_ids() {
    let id = random_client_id();
    assert!(id.starts_with("modpoll-"));
    assert_eq!(id.len(), "modpoll-".len() + 8);
    assert!(MqttSettings::new("h", 1).options().unwrap().clean_session());
}

#[tokio::test]
async fn qos0_publishes_are_skipped_while_disconnected() {
    let (_tx, rx) = tokio::sync::broadcast::channel::<()>(1);
    // Nothing listens on port 1, so the client never connects.
    let settings = MqttSettings::new("127.0.0.1", 1);
    let mut client = Client::connect(&settings, Shutdown::new(rx)).unwrap();
    assert!(!client.is_connected());
    client
        .publish(Message::new("modpoll/x/data", "{}"))
        .await
        .unwrap();
    client.close().await;
    client.close().await;
}

#[tokio::test]
async fn publishes_never_wait_for_an_absent_broker() {
    let (_tx, rx) = tokio::sync::broadcast::channel::<()>(1);
    let mut settings = MqttSettings::new("127.0.0.1", 1);
    settings.qos = QoS::AtLeastOnce;
    let mut client = Client::connect(&settings, Shutdown::new(rx)).unwrap();

    let publishes = async {
        for i in 0..REQUEST_QUEUE_CAPACITY * 2 {
            let message = Message::new(format!("modpoll/m{i}/data"), "{}");
            client.publish(message).await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(5), publishes)
        .await
        .expect("publish blocked on the request queue");
    client.close().await;
}

#[test]
fn full_inbound_queue_drops_the_newest_message() {
    let (tx, mut rx) = channel(INBOUND_QUEUE_CAPACITY);
    for i in 0..=INBOUND_QUEUE_CAPACITY {
        assert!(enqueue(&tx, Message::new(i.to_string(), "{}")));
    }

    let mut kept = vec![];
    while let Ok(message) = rx.try_recv() {
        kept.push(message.topic);
    }
    assert_eq!(kept.len(), INBOUND_QUEUE_CAPACITY);
    assert_eq!(kept.first().map(String::as_str), Some("0"));
    assert_eq!(kept.last().map(String::as_str), Some("999"));

    drop(rx);
    assert!(!enqueue(&tx, Message::new("late", "{}")));
}
