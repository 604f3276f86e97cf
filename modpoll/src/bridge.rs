use std::{future::Future, path::PathBuf, time::Duration};

use chrono::Utc;
use tokio::{
    sync::broadcast,
    time::{interval, interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    dispatch,
    modbus::{Device, ModbusTransport},
    mqtt::{Message, PubSubClient},
    publish::{self, PublishOptions},
    scheduler::{self, CycleOptions},
    shutdown::Shutdown,
    topic::TopicRouter,
};

#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Time between the starts of two poll cycles.
    pub rate: Duration,
    pub cycle: CycleOptions,
    /// Run a single cycle, then stop.
    pub once: bool,
    /// Don't print the snapshot table after each cycle.
    pub daemon: bool,
    /// Wait before the first cycle.
    pub delay: Duration,
    /// Diagnostics period; zero turns diagnostics off.
    pub diagnostics_rate: Duration,
    pub export: Option<PathBuf>,
    pub publish: PublishOptions,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            rate: Duration::from_secs(10),
            cycle: CycleOptions::default(),
            once: false,
            daemon: false,
            delay: Duration::ZERO,
            diagnostics_rate: Duration::ZERO,
            export: None,
            publish: PublishOptions::default(),
        }
    }
}

struct Mqtt<P> {
    client: P,
    router: TopicRouter,
}

/// Owns every piece of runtime state: the devices, the Modbus transport and
/// the optional broker connection. Only the bridge loop touches them.
pub struct Bridge<T, P> {
    devices: Vec<Device>,
    transport: T,
    mqtt: Option<Mqtt<P>>,
    options: BridgeOptions,
    shutdown: Shutdown,
    closed: bool,
}

/// Creates the shutdown channel shared by the bridge and the MQTT client.
pub fn shutdown_channel() -> (broadcast::Sender<()>, Shutdown) {
    let (notify_shutdown, rx) = broadcast::channel(1);
    (notify_shutdown, Shutdown::new(rx))
}

/// Runs `bridge` until it stops on its own (`once`) or `signal` completes.
///
/// On the signal, the bridge is told to stop and is then given the chance
/// to finish its in-flight request and close its connections.
pub async fn run<T, P>(
    bridge: &mut Bridge<T, P>,
    notify_shutdown: broadcast::Sender<()>,
    signal: impl Future,
) -> crate::Result<()>
where
    T: ModbusTransport,
    P: PubSubClient,
{
    let bridge_run = bridge.run();
    tokio::pin!(bridge_run);

    let res = tokio::select! {
        res = &mut bridge_run => res,
        _ = signal => {
            info!("Shutting down");
            // Nobody listening means everything already stopped.
            let _ = notify_shutdown.send(());
            bridge_run.await
        }
    };

    if let Err(err) = &res {
        error!(cause = %err, "Bridge error");
    }
    res
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_message<P: PubSubClient>(mqtt: &mut Option<Mqtt<P>>) -> Option<Message> {
    match mqtt {
        Some(mqtt) => mqtt.client.recv().await,
        None => std::future::pending().await,
    }
}

impl<T, P> Bridge<T, P>
where
    T: ModbusTransport,
    P: PubSubClient,
{
    pub fn new(
        devices: Vec<Device>,
        transport: T,
        options: BridgeOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            devices,
            transport,
            mqtt: None,
            options,
            shutdown,
            closed: false,
        }
    }

    pub fn with_mqtt(mut self, client: P, router: TopicRouter) -> Self {
        self.mqtt = Some(Mqtt { client, router });
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub async fn run(&mut self) -> crate::Result<()> {
        info!(devices = self.devices.len(), "Starting up");

        let res = self.run_loop().await;
        self.close().await;
        res
    }

    async fn run_loop(&mut self) -> crate::Result<()> {
        if let Some(mqtt) = &mut self.mqtt {
            let filter = mqtt.router.subscribe.subscription_filter();
            info!(%filter, "Listening for write commands");
            mqtt.client.subscribe(&filter).await?;
        }

        if !self.options.delay.is_zero() {
            info!(delay = ?self.options.delay, "Delaying first poll");
            if !self.shutdown.sleep(self.options.delay).await {
                return Ok(());
            }
        }

        let mut poll = interval(self.options.rate);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let rate = self.options.diagnostics_rate;
        let mut diagnostics = (!rate.is_zero() && self.mqtt.is_some()).then(|| {
            let mut diagnostics = interval_at(Instant::now() + rate, rate);
            diagnostics.set_missed_tick_behavior(MissedTickBehavior::Delay);
            diagnostics
        });

        let mut inbound_open = true;
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.cycle().await;
                    if self.options.once {
                        debug!("Single cycle done");
                        break;
                    }
                }
                _ = next_tick(&mut diagnostics) => self.publish_diagnostics().await,
                message = next_message(&mut self.mqtt), if inbound_open => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        warn!("Inbound message stream closed");
                        inbound_open = false;
                    }
                },
                _ = self.shutdown.recv() => break,
            }

            if self.shutdown.is_shutdown() {
                break;
            }
        }

        Ok(())
    }

    /// One poll cycle followed by snapshot, publish and export.
    async fn cycle(&mut self) {
        let report = scheduler::poll_cycle(
            &mut self.devices,
            &mut self.transport,
            &mut self.shutdown,
            &self.options.cycle,
        )
        .await;
        if report.interrupted {
            return;
        }

        let now = Utc::now();
        if !self.options.daemon {
            println!("{}\n", publish::snapshot(&self.devices));
        }

        if let Some(mqtt) = &mut self.mqtt {
            for device in &self.devices {
                let messages =
                    publish::device_messages(device, &mqtt.router, &self.options.publish, now);
                let messages = match messages {
                    Ok(messages) => messages,
                    Err(error) => {
                        warn!(device = %device.name, %error, "Unable to build payload");
                        continue;
                    }
                };
                for message in messages {
                    let topic = message.topic.clone();
                    match mqtt.client.publish(message).await {
                        Ok(()) => debug!(%topic, "Published"),
                        Err(error) => warn!(%topic, %error, "Publish failed"),
                    }
                }
            }
        }

        if let Some(path) = &self.options.export {
            let timestamp = self.options.publish.timestamp;
            if let Err(error) = publish::export(&self.devices, path, timestamp, now) {
                warn!(path = %path.display(), %error, "Export failed");
            }
        }
    }

    async fn publish_diagnostics(&mut self) {
        let Some(mqtt) = &mut self.mqtt else {
            return;
        };
        for device in &self.devices {
            let result = match publish::diagnostics_message(device, &mqtt.router) {
                Ok(message) => mqtt.client.publish(message).await,
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(device = %device.name, %error, "Unable to publish diagnostics");
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        let Some(mqtt) = &self.mqtt else {
            return;
        };
        debug!(topic = %message.topic, "Write command received");
        // Failures are logged by the dispatcher and never stop the loop.
        let _ = dispatch::dispatch(
            &self.devices,
            &mqtt.router.subscribe,
            &message.topic,
            &message.payload,
            &mut self.transport,
        )
        .await;
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.transport.close().await;
        if let Some(mqtt) = &mut self.mqtt {
            mqtt.client.close().await;
        }
        info!("Stopped");
    }
}

#[cfg(test)]
use crate::{
    modbus::{
        transport::fake::{Call, FakeTransport},
        FunctionCode, RawData,
    },
    mqtt::fake::FakePubSub,
};
#[cfg(test)]
use pretty_assertions::assert_eq;
#[cfg(test)]
use serde_json::json;

#[cfg(test)]
fn meter() -> Vec<Device> {
    crate::config::parse_rows(
        crate::config::tokenize(
            "device,Meter1,1
poll,holding_register,100,4,BE_BE
ref,Voltage,100,float32,r,V,1.0
ref,Current,102,float32,r,A,0.1
",
        )
        .unwrap(),
    )
}

#[cfg(test)]
fn meter_words() -> Result<RawData, crate::modbus::TransportError> {
    Ok(RawData::Words(vec![0x4348, 0x0000, 0x41C8, 0x0000]))
}

#[cfg(test)]
fn quiet() -> BridgeOptions {
    BridgeOptions {
        daemon: true,
        rate: Duration::from_secs(3600),
        cycle: CycleOptions {
            interval: Duration::ZERO,
            autoremove: false,
        },
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn once_mode_polls_publishes_exports_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("values.json");
    let (notify, shutdown) = shutdown_channel();
    let options = BridgeOptions {
        once: true,
        export: Some(export.clone()),
        ..quiet()
    };
    let mut bridge = Bridge::new(
        meter(),
        FakeTransport::default().respond(meter_words()),
        options,
        shutdown,
    )
    .with_mqtt(FakePubSub::default(), TopicRouter::default());

    run(&mut bridge, notify, std::future::pending::<()>()).await.unwrap();

    let mqtt = bridge.mqtt.as_ref().unwrap();
    assert_eq!(mqtt.client.subscriptions, vec!["modpoll/+/set"]);
    assert_eq!(mqtt.client.published.len(), 1);
    assert_eq!(mqtt.client.published[0].topic, "modpoll/Meter1/data");
    let payload: serde_json::Value =
        serde_json::from_slice(&mqtt.client.published[0].payload).unwrap();
    assert_eq!(payload, json!({"Voltage|V": 200.0, "Current|A": 2.5}));
    assert_eq!(mqtt.client.closed, 1);

    assert_eq!(
        bridge.transport.calls,
        vec![
            Call::Connect,
            Call::Read(1, FunctionCode::ReadHoldingRegisters, 100, 4),
            Call::Close,
            Call::Close,
        ]
    );

    let exported: serde_json::Value =
        serde_json::from_slice(&std::fs::read(export).unwrap()).unwrap();
    assert_eq!(exported, json!({"Meter1": {"Voltage": 200.0, "Current": 2.5}}));
}

#[tokio::test(start_paused = true)]
async fn inbound_write_commands_are_dispatched() {
    let (notify, shutdown) = shutdown_channel();
    let mut client = FakePubSub::default();
    client.inbound.push_back(Message::new(
        "modpoll/Meter1/set",
        r#"{"object_type":"coil","address":5,"value":1}"#,
    ));
    client.inbound.push_back(Message::new("modpoll/Unknown/set", "{}"));
    let mut bridge = Bridge::new(
        meter(),
        FakeTransport::default().respond(meter_words()),
        quiet(),
        shutdown,
    )
    .with_mqtt(client, TopicRouter::default());

    run(&mut bridge, notify, tokio::time::sleep(Duration::from_secs(10)))
        .await
        .unwrap();

    let writes: Vec<_> = bridge
        .transport
        .calls
        .iter()
        .filter(|c| matches!(c, Call::WriteCoil(..)))
        .collect();
    assert_eq!(writes, vec![&Call::WriteCoil(1, 5, true)]);
    assert_eq!(bridge.transport.reads(), 1);
    assert_eq!(bridge.mqtt.as_ref().unwrap().client.closed, 1);
    assert_eq!(bridge.transport.calls.last(), Some(&Call::Close));
}

#[tokio::test(start_paused = true)]
async fn diagnostics_follow_their_own_rate() {
    let (notify, shutdown) = shutdown_channel();
    let options = BridgeOptions {
        diagnostics_rate: Duration::from_secs(5),
        ..quiet()
    };
    let mut bridge = Bridge::new(
        meter(),
        FakeTransport::default().respond(meter_words()),
        options,
        shutdown,
    )
    .with_mqtt(FakePubSub::default(), TopicRouter::default());

    run(&mut bridge, notify, tokio::time::sleep(Duration::from_secs(12)))
        .await
        .unwrap();

    let published = &bridge.mqtt.as_ref().unwrap().client.published;
    let diagnostics: Vec<_> = published
        .iter()
        .filter(|m| m.topic == "modpoll/Meter1/diagnostics")
        .collect();
    assert_eq!(diagnostics.len(), 2);
    let payload: serde_json::Value = serde_json::from_slice(&diagnostics[1].payload).unwrap();
    assert_eq!(
        payload,
        json!({"poll_count": 1, "error_count": 0, "last_poll_success": true})
    );
}

#[tokio::test(start_paused = true)]
async fn polls_at_a_fixed_rate_until_shutdown() {
    let (notify, shutdown) = shutdown_channel();
    let options = BridgeOptions {
        rate: Duration::from_secs(10),
        ..quiet()
    };
    let mut bridge: Bridge<_, FakePubSub> =
        Bridge::new(meter(), FakeTransport::default(), options, shutdown);

    run(&mut bridge, notify, tokio::time::sleep(Duration::from_secs(35)))
        .await
        .unwrap();

    // Cycles start at 0, 10, 20 and 30 seconds.
    assert_eq!(bridge.transport.reads(), 4);
    assert_eq!(bridge.devices()[0].error_count, 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_delay_skips_polling() {
    let (notify, shutdown) = shutdown_channel();
    let options = BridgeOptions {
        delay: Duration::from_secs(3600),
        ..quiet()
    };
    let mut bridge = Bridge::new(meter(), FakeTransport::default(), options, shutdown)
        .with_mqtt(FakePubSub::default(), TopicRouter::default());

    run(&mut bridge, notify, tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(bridge.transport.calls, vec![Call::Close]);
    assert_eq!(bridge.mqtt.as_ref().unwrap().client.closed, 1);
}
