use core::convert::TryInto;
use std::{
    io::{ErrorKind, Read as _, Write as _},
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use chrono_tz::Tz;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use serde::Serialize;

use homelink_common::{
    envelope::{decode_json, encode_json},
    topics::{self, InboundTopic},
    trigger_envelope, AddressTable, AlarmEngine, AlarmStore, BlobStore, ControllerConfig,
    CountdownTimer, Envelope, LedService, Mailbox, NetworkConfig, Router, StoreError, SunTimes,
    TaskId, TimerError, ENVELOPE_SIZE,
};

use crate::{
    clock::{monotonic_ms, now_in_timezone, resolve_timezone},
    replies::PendingReplies,
};

const CONFIG_NAMESPACE: &str = "homelink";
const CONFIG_KEY: &str = "config_json";
const MAX_HTTP_BODY: usize = 2048;
const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type TaskMailbox = SyncSender<Envelope>;
type Waiters = PendingReplies<SyncSender<Envelope>>;

/// Blob store over the default NVS partition; one NVS namespace per store namespace.
#[derive(Clone)]
struct NvsBlobStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsBlobStore {
    fn open(&self, namespace: &str, key: &str) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|err| StoreError::backend(namespace, key, err.to_string()))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn load_config(&self) -> anyhow::Result<ControllerConfig> {
        let _guard = self.guard();
        let nvs = self.open(CONFIG_NAMESPACE, CONFIG_KEY)?;
        let mut buffer = vec![0_u8; 2048];
        match nvs.get_str(CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<ControllerConfig>(value)?),
            None => Ok(ControllerConfig::default()),
        }
    }
}

impl BlobStore for NvsBlobStore {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.guard();
        let nvs = self.open(namespace, key)?;
        let wrap = |err: esp_idf_svc::sys::EspError| StoreError::backend(namespace, key, err.to_string());
        let Some(len) = nvs.blob_len(key).map_err(wrap)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len];
        Ok(nvs.get_blob(key, &mut buffer).map_err(wrap)?.map(<[u8]>::to_vec))
    }

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut nvs = self.open(namespace, key)?;
        nvs.set_blob(key, bytes)
            .map_err(|err| StoreError::backend(namespace, key, err.to_string()))
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut nvs = self.open(namespace, key)?;
        nvs.remove(key)
            .map(|_| ())
            .map_err(|err| StoreError::backend(namespace, key, err.to_string()))
    }
}

/// One-shot `esp_timer` whose callback posts the trigger envelope.
struct EspCountdown {
    timer: EspTimer<'static>,
}

impl EspCountdown {
    fn new(service: &EspTaskTimerService, mailbox: TaskMailbox) -> anyhow::Result<Self> {
        let timer = service.timer(move || {
            let _ = mailbox.try_deliver(trigger_envelope());
        })?;
        Ok(Self { timer })
    }
}

impl CountdownTimer for EspCountdown {
    fn start(&mut self, seconds: u32) -> Result<(), TimerError> {
        self.stop()?;
        self.timer
            .after(Duration::from_secs(u64::from(seconds)))
            .map_err(|err| TimerError(err.to_string()))
    }

    fn stop(&mut self) -> Result<(), TimerError> {
        self.timer
            .cancel()
            .map(|_| ())
            .map_err(|err| TimerError(err.to_string()))
    }
}

/// Blocking relay-and-wait for one transport.
#[derive(Clone)]
struct Ingress {
    router: Router<TaskMailbox>,
    pending: Arc<Waiters>,
    timeout: Duration,
}

impl Ingress {
    fn new(router: Router<TaskMailbox>, timeout: Duration) -> Self {
        Self {
            router,
            pending: Arc::new(Waiters::new()),
            timeout,
        }
    }

    fn request(&self, command: Envelope) -> Envelope {
        self.request_with_id(command, None)
    }

    fn request_with_id(&self, mut command: Envelope, transmission_id: Option<u8>) -> Envelope {
        command.from = self.router.id().raw();
        if !command.op().is_request() {
            return command.error_reply("invalid request type");
        }

        let (tx, rx) = sync_channel(1);
        let allocated = match transmission_id {
            Some(id) => self.pending.register(id, tx).map(|()| id),
            None => self.pending.allocate(tx),
        };
        let transmission_id = match allocated {
            Ok(id) => id,
            Err(err) => {
                warn!("{}: cannot correlate request: {err}", self.router.id());
                return command.error_reply("too many requests in flight");
            }
        };
        command.transmission_id = transmission_id;

        if let Err(err) = self.router.relay(command.clone(), transmission_id) {
            self.pending.take(transmission_id);
            return command.error_reply(err.status_text());
        }

        match rx.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(_) => {
                self.pending.take(transmission_id);
                debug!("{}: no reply for transmission {transmission_id}", self.router.id());
                command.error_reply("reply timeout")
            }
        }
    }

    fn post(&self, command: Envelope) {
        if let Err(err) = self.router.relay(command, 0) {
            warn!("{}: fire-and-forget relay failed: {err}", self.router.id());
        }
    }
}

struct Mailboxes {
    table: Arc<AddressTable<TaskMailbox>>,
    tcp: Receiver<Envelope>,
    alarm: Receiver<Envelope>,
    alarm_self: TaskMailbox,
    cloud: Receiver<Envelope>,
    led: Receiver<Envelope>,
    http: Receiver<Envelope>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsBlobStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        ControllerConfig::default()
    });
    config.sanitize();
    let tz = resolve_timezone(&config.timezone);
    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, timezone {}",
        config.network.wifi_ssid,
        config.network.mqtt_host,
        config.network.mqtt_port,
        tz.name()
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let mailboxes = build_address_table(config.mailbox_depth)?;
    let table = Arc::clone(&mailboxes.table);
    let timeout = Duration::from_millis(config.reply_timeout_ms);

    spawn_led_task(Router::new(Arc::clone(&table), TaskId::Led), mailboxes.led)?;

    let alarms = AlarmStore::load(store, config.alarm_capacity)
        .context("failed to load alarm store")?;
    let timer_service = EspTaskTimerService::new()?;
    let timer = EspCountdown::new(&timer_service, mailboxes.alarm_self)?;
    let sun: Arc<dyn SunTimes> = Arc::new(config.location.solar_calculator());
    let engine = AlarmEngine::new(
        Router::new(Arc::clone(&table), TaskId::Alarm),
        alarms,
        timer,
        sun,
    );
    let alarm_rx = mailboxes.alarm;
    let alarm_thread = thread::Builder::new()
        .name("alarm".into())
        .stack_size(12 * 1024)
        .spawn(move || -> anyhow::Result<()> {
            let mut engine = engine;
            engine.init(now_in_timezone(tz))?;
            while let Ok(command) = alarm_rx.recv() {
                engine.handle(&command, now_in_timezone(tz))?;
            }
            Ok(())
        })?;

    let tcp_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Tcp), timeout);
    spawn_egress("tcp", Arc::clone(&tcp_ingress.pending), mailboxes.tcp)?;
    spawn_tcp_listener(config.tcp_port, tcp_ingress)?;

    let cloud_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Cloud), timeout);
    spawn_egress("cloud", Arc::clone(&cloud_ingress.pending), mailboxes.cloud)?;
    let _mqtt = if config.network.cloud_enabled() {
        let (client, conn) = create_mqtt_client(&config.network)?;
        let client = Arc::new(Mutex::new(client));
        subscribe_topics(&client, &config.network.device_id)?;
        spawn_mqtt_receiver(
            cloud_ingress,
            config.network.device_id.clone(),
            conn,
            Arc::clone(&client),
        )?;
        Some(client)
    } else {
        info!("cloud bridge disabled: no mqtt host configured");
        None
    };

    let http_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Http), timeout);
    spawn_egress("http", Arc::clone(&http_ingress.pending), mailboxes.http)?;
    let server = create_http_server(http_ingress, tz)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _timer_service = timer_service;

    match alarm_thread.join() {
        Ok(Ok(())) => Err(anyhow!("alarm mailbox closed")),
        Ok(Err(err)) => {
            error!("alarm engine stopped: {err:#}");
            Err(err)
        }
        Err(_) => Err(anyhow!("alarm thread panicked")),
    }
}

fn build_address_table(depth: usize) -> anyhow::Result<Mailboxes> {
    let mut table = AddressTable::with_capacity(TaskId::ALL.len())?;
    let (tcp, tcp_rx) = sync_channel(depth);
    let (alarm, alarm_rx) = sync_channel(depth);
    let (cloud, cloud_rx) = sync_channel(depth);
    let (led, led_rx) = sync_channel(depth);
    let (http, http_rx) = sync_channel(depth);

    let alarm_self = alarm.clone();
    let entries = [
        (TaskId::Tcp, tcp),
        (TaskId::Alarm, alarm),
        (TaskId::Cloud, cloud),
        (TaskId::Led, led),
        (TaskId::Http, http),
    ];
    for (slot, (id, mailbox)) in entries.into_iter().enumerate() {
        table
            .insert(slot, id.raw(), mailbox, id.route_flags())
            .with_context(|| format!("failed to register {id}"))?;
    }

    Ok(Mailboxes {
        table: Arc::new(table),
        tcp: tcp_rx,
        alarm: alarm_rx,
        alarm_self,
        cloud: cloud_rx,
        led: led_rx,
        http: http_rx,
    })
}

fn spawn_led_task(router: Router<TaskMailbox>, rx: Receiver<Envelope>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("led".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let mut service = LedService::new(router);
            while let Ok(command) = rx.recv() {
                service.handle(&command, monotonic_ms());
            }
        })?;
    Ok(())
}

fn spawn_egress(
    name: &'static str,
    pending: Arc<Waiters>,
    rx: Receiver<Envelope>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("{name}-egress"))
        .stack_size(4 * 1024)
        .spawn(move || {
            while let Ok(reply) = rx.recv() {
                match pending.take(reply.transmission_id) {
                    Some(waiter) => {
                        let _ = waiter.try_send(reply);
                    }
                    None => debug!("{name}: discarding late or unsolicited reply {:?}", reply),
                }
            }
        })?;
    Ok(())
}

fn spawn_tcp_listener(port: u16, ingress: Ingress) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("failed to bind command listener on port {port}"))?;
    info!("command listener on tcp port {port}");

    thread::Builder::new()
        .name("tcp-accept".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("tcp accept failed: {err}");
                        continue;
                    }
                };
                let ingress = ingress.clone();
                let spawned = thread::Builder::new()
                    .name("tcp-conn".into())
                    .stack_size(8 * 1024)
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ingress) {
                            warn!("tcp connection dropped: {err:#}");
                        }
                    });
                if let Err(err) = spawned {
                    warn!("failed to spawn tcp connection thread: {err}");
                }
            }
        })?;
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ingress: &Ingress) -> anyhow::Result<()> {
    let mut frame = [0_u8; ENVELOPE_SIZE];
    loop {
        match stream.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let reply = ingress.request(Envelope::from_bytes(&frame)?);
        stream.write_all(&reply.to_bytes())?;
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts: {err:#}")),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.device_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, device_id: &str) -> anyhow::Result<()> {
    let filters = [
        topics::device_bound_filter(device_id),
        topics::TOPIC_DIRECT_METHODS.to_string(),
    ];

    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for filter in &filters {
        mqtt.subscribe(filter, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    ingress: Ingress,
    device_id: String,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };
                    if !matches!(details, Details::Complete) || data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!("dropping partial or oversized MQTT payload on {topic}");
                        continue;
                    }
                    if let Some((reply_topic, payload)) =
                        handle_mqtt_message(&ingress, &device_id, topic, data)
                    {
                        let published = mqtt
                            .lock()
                            .map_err(|_| anyhow!("mqtt client lock poisoned"))
                            .and_then(|mut client| {
                                client
                                    .publish(&reply_topic, QoS::AtMostOnce, false, &payload)
                                    .map_err(Into::into)
                            });
                        if let Err(err) = published {
                            warn!("cloud: reply publish failed: {err:#}");
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt, &device_id) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })?;
    Ok(())
}

fn handle_mqtt_message(
    ingress: &Ingress,
    device_id: &str,
    topic: &str,
    data: &[u8],
) -> Option<(String, Vec<u8>)> {
    match topics::classify(topic, device_id)? {
        InboundTopic::DeviceBound => {
            match Envelope::from_prefix(data) {
                Ok(command) if !data.is_empty() && command.op().is_request() => ingress.post(command),
                Ok(_) => warn!("cloud: device-bound message is not a request"),
                Err(err) => warn!("cloud: device-bound message dropped: {err}"),
            }
            None
        }
        InboundTopic::DirectMethod { method, rid } => {
            debug!("cloud: direct method {method} rid={rid}");
            let reply = match decode_json(data) {
                Ok(command) => {
                    let transmission_id = (rid % 256) as u8;
                    ingress.request_with_id(command, (transmission_id != 0).then_some(transmission_id))
                }
                Err(err) => {
                    warn!("cloud: direct method rid={rid} has a malformed payload: {err}");
                    Envelope::default().error_reply("malformed envelope")
                }
            };
            let payload = encode_json(&reply).ok()?;
            let status = topics::direct_method_status(reply.op());
            Some((topics::direct_method_reply_topic(status, rid), payload))
        }
    }
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    timezone: &'static str,
    now_epoch: i64,
    local_time: String,
    weekday: String,
}

fn create_http_server(ingress: Ingress, tz: Tz) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler("/api/time", Method::Get, move |req| {
        let local = now_in_timezone(tz);
        let status = TimeStatus {
            timezone: tz.name(),
            now_epoch: Utc::now().timestamp(),
            local_time: local.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            weekday: local.format("%A").to_string(),
        };
        write_json(req, &status)
    })?;

    server.fn_handler("/api/command", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let raw: Vec<u8> = match serde_json::from_slice(&body) {
            Ok(raw) => raw,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };
        let command = match Envelope::from_prefix(&raw) {
            Ok(command) => command,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };
        let reply = ingress.request(command);
        write_json(req, &reply.to_bytes().to_vec())
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}
