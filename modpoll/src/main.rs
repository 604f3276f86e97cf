use std::{path::PathBuf, time::Duration};

use clap::Parser;
use modpoll::{
    bridge::{self, Bridge, BridgeOptions},
    config,
    modbus::connection::{default_modbus_port, Connection, ModbusProto, Parity},
    mqtt::{self, MqttSettings},
    publish::{PublishOptions, TimestampPrecision},
    scheduler::CycleOptions,
    topic::{
        TopicRouter, DEFAULT_DIAGNOSTICS_PATTERN, DEFAULT_PUBLISH_PATTERN,
        DEFAULT_SUBSCRIBE_PATTERN,
    },
    Error, Result,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Seconds (`0.5`) or a humantime duration (`500ms`, `1m`).
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(seconds) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string());
    }
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[clap(
    name = "modpoll",
    version,
    author,
    about = "Polls Modbus devices and bridges their values to and from MQTT"
)]
struct Cli {
    /// Device configuration: local paths or http(s) URLs, parsed in order
    #[clap(short = 'f', long = "config", value_name = "LOCATION", required = true, num_args = 1..)]
    config: Vec<String>,

    /// Don't print the value table after each poll
    #[clap(short, long)]
    daemon: bool,

    /// Time between poll cycles
    #[clap(short, long, default_value = "10", value_parser = parse_duration)]
    rate: Duration,

    /// Poll once, then exit
    #[clap(short = '1', long)]
    once: bool,

    /// Pause between two reads
    #[clap(long, default_value = "0.5", value_parser = parse_duration)]
    interval: Duration,

    #[clap(long, value_name = "HOST", group = "transport")]
    tcp: Option<String>,

    #[clap(long, default_value_t = default_modbus_port())]
    tcp_port: u16,

    #[clap(long, value_name = "HOST", group = "transport")]
    udp: Option<String>,

    #[clap(long, default_value_t = default_modbus_port())]
    udp_port: u16,

    /// Serial device, e.g. /dev/ttyUSB0
    #[clap(long, value_name = "TTY", group = "transport")]
    rtu: Option<String>,

    #[clap(long, default_value_t = 9600)]
    rtu_baud: u32,

    #[clap(long, value_enum, default_value_t)]
    rtu_parity: Parity,

    /// Modbus request timeout
    #[clap(long, default_value = "3", value_parser = parse_duration)]
    timeout: Duration,

    /// Write the latest values to FILE as JSON after every poll
    #[clap(short = 'o', long, value_name = "FILE")]
    export: Option<PathBuf>,

    #[clap(long)]
    mqtt_host: Option<String>,

    #[clap(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Defaults to a random `modpoll-<hex>` id
    #[clap(long)]
    mqtt_clientid: Option<String>,

    /// Deprecated: publish to PREFIX/<device> and listen on PREFIX/<device>/set
    #[clap(long, value_name = "PREFIX")]
    mqtt_topic_prefix: Option<String>,

    #[clap(long, default_value = DEFAULT_PUBLISH_PATTERN)]
    mqtt_publish_topic_pattern: String,

    #[clap(long, default_value = DEFAULT_SUBSCRIBE_PATTERN)]
    mqtt_subscribe_topic_pattern: String,

    #[clap(long, default_value = DEFAULT_DIAGNOSTICS_PATTERN)]
    mqtt_diagnostics_topic_pattern: String,

    #[clap(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    mqtt_qos: u8,

    #[clap(long, env = "MQTT_USER")]
    mqtt_user: Option<String>,

    #[clap(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_pass: Option<String>,

    #[clap(long)]
    mqtt_use_tls: bool,

    /// CA certificates (PEM) for the broker; implies --mqtt-use-tls
    #[clap(long, value_name = "PATH")]
    mqtt_cacerts: Option<PathBuf>,

    /// Publish every value to its own topic
    #[clap(long)]
    mqtt_single: bool,

    /// Only publish values that changed since the previous poll
    #[clap(long)]
    mqtt_on_change: bool,

    /// Diagnostics period; 0 disables diagnostics
    #[clap(long, default_value = "0", value_parser = parse_duration)]
    diagnostics_rate: Duration,

    /// Stop polling a range after 3 consecutive failures
    #[clap(long)]
    autoremove: bool,

    /// Overridden by RUST_LOG
    #[clap(
        long,
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    loglevel: String,

    /// Add a timestamp to every payload
    #[clap(long)]
    timestamp: bool,

    #[clap(long, value_enum, default_value_t)]
    timestamp_precision: TimestampPrecision,

    /// Wait before the first poll
    #[clap(long, default_value = "0", value_parser = parse_duration)]
    delay: Duration,
}

impl Cli {
    fn modbus_proto(&self) -> Result<ModbusProto> {
        let proto = if let Some(host) = &self.tcp {
            ModbusProto::Tcp {
                host: host.clone(),
                port: self.tcp_port,
            }
        } else if let Some(host) = &self.udp {
            ModbusProto::Udp {
                host: host.clone(),
                port: self.udp_port,
            }
        } else if let Some(tty) = &self.rtu {
            ModbusProto::Rtu {
                tty: tty.clone(),
                baud_rate: self.rtu_baud,
                parity: self.rtu_parity,
            }
        } else {
            return Err(Error::NoTransport);
        };
        proto.check_supported()?;
        Ok(proto)
    }

    fn topic_router(&self) -> Result<TopicRouter> {
        match &self.mqtt_topic_prefix {
            Some(prefix) => {
                warn!("--mqtt-topic-prefix is deprecated, use the topic pattern options instead");
                TopicRouter::with_prefix(prefix, &self.mqtt_diagnostics_topic_pattern)
            }
            None => TopicRouter::new(
                &self.mqtt_publish_topic_pattern,
                &self.mqtt_subscribe_topic_pattern,
                &self.mqtt_diagnostics_topic_pattern,
            ),
        }
    }

    fn mqtt_settings(&self, host: &str) -> Result<MqttSettings> {
        Ok(MqttSettings {
            client_id: self.mqtt_clientid.clone(),
            credentials: self
                .mqtt_user
                .clone()
                .map(|user| (user, self.mqtt_pass.clone().unwrap_or_default())),
            qos: mqtt::qos(self.mqtt_qos)?,
            tls: self.mqtt_use_tls,
            ca_certs: self.mqtt_cacerts.clone(),
            ..MqttSettings::new(host, self.mqtt_port)
        })
    }

    fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            rate: self.rate,
            cycle: CycleOptions {
                interval: self.interval,
                autoremove: self.autoremove,
            },
            once: self.once,
            daemon: self.daemon,
            delay: self.delay,
            diagnostics_rate: self.diagnostics_rate,
            export: self.export.clone(),
            publish: PublishOptions {
                single: self.mqtt_single,
                on_change: self.mqtt_on_change,
                timestamp: self.timestamp.then_some(self.timestamp_precision),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.loglevel));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let proto = args.modbus_proto()?;
    let router = args.topic_router()?;
    let devices = config::load(&args.config).await?;

    let (notify_shutdown, shutdown) = bridge::shutdown_channel();
    let transport = Connection::new(proto, args.timeout);
    let mut bridge = Bridge::new(devices, transport, args.bridge_options(), shutdown.clone());

    if let Some(host) = &args.mqtt_host {
        let client = mqtt::Client::connect(&args.mqtt_settings(host)?, shutdown)?;
        bridge = bridge.with_mqtt(client, router);
    }

    bridge::run(&mut bridge, notify_shutdown, tokio::signal::ctrl_c()).await
}

#[test]
fn durations() {
    assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
    assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
    assert_eq!(parse_duration("1m 30s"), Ok(Duration::from_secs(90)));
    assert!(parse_duration("-1").is_err());
    assert!(parse_duration("soon").is_err());
}

#[test]
fn cli_is_consistent() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}

#[test]
fn transports_are_exclusive() {
    let both = ["modpoll", "-f", "a.csv", "--tcp", "h", "--rtu", "/dev/tty0"];
    assert!(Cli::try_parse_from(both).is_err());

    let rtu = ["modpoll", "-f", "a.csv", "--rtu", "/dev/tty0", "--rtu-parity", "even"];
    let cli = Cli::try_parse_from(rtu).unwrap();
    assert_eq!(
        cli.modbus_proto().unwrap(),
        ModbusProto::Rtu {
            tty: "/dev/tty0".into(),
            baud_rate: 9600,
            parity: Parity::Even
        }
    );

    let cli = Cli::try_parse_from(["modpoll", "-f", "a.csv"]).unwrap();
    assert!(matches!(cli.modbus_proto(), Err(Error::NoTransport)));

    let cli = Cli::try_parse_from(["modpoll", "-f", "a.csv", "--udp", "h"]).unwrap();
    assert!(matches!(cli.modbus_proto(), Err(Error::UnsupportedTransport("udp"))));
}

#[test]
fn options_from_flags() {
    let cli = Cli::try_parse_from([
        "modpoll",
        "-f",
        "a.csv",
        "b.csv",
        "--tcp",
        "10.0.0.5",
        "-r",
        "2s",
        "-1",
        "--timestamp",
        "--timestamp-precision",
        "milliseconds",
        "--mqtt-topic-prefix",
        "plant",
    ])
    .unwrap();
    assert_eq!(cli.config, vec!["a.csv", "b.csv"]);

    let options = cli.bridge_options();
    assert_eq!(options.rate, Duration::from_secs(2));
    assert!(options.once);
    assert_eq!(options.cycle.interval, Duration::from_millis(500));
    assert_eq!(options.publish.timestamp, Some(TimestampPrecision::Milliseconds));

    let router = cli.topic_router().unwrap();
    assert_eq!(router.subscribe.expand("m1"), "plant/m1/set");
}
