use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use chrono_tz::Tz;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use homelink_common::{
    AddressTable, AlarmEngine, AlarmStore, BlobStore, ControllerConfig, CountdownTimer, Envelope,
    LedService, Router, SunTimes, TaskId,
};

use crate::{
    clock::{monotonic_ms, now_in_timezone, resolve_timezone},
    cloud::{self, CloudBridge},
    files::{self, FileBlobStore},
    http::{self, HttpState},
    ingress::{spawn_egress, Ingress},
    mailbox::TaskMailbox,
    tcp,
    timer::TokioCountdown,
};

struct Mailboxes {
    table: Arc<AddressTable<TaskMailbox>>,
    tcp: mpsc::Receiver<Envelope>,
    alarm: mpsc::Receiver<Envelope>,
    alarm_self: TaskMailbox,
    cloud: mpsc::Receiver<Envelope>,
    led: mpsc::Receiver<Envelope>,
    http: mpsc::Receiver<Envelope>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = files::data_dir();
    let config = files::load_config(&data_dir);
    let tz = resolve_timezone(&config.timezone);
    info!(
        "controller starting: data dir {}, timezone {}",
        data_dir.display(),
        tz.name()
    );

    let mailboxes = build_address_table(config.mailbox_depth)?;
    let table = Arc::clone(&mailboxes.table);
    let timeout = Duration::from_millis(config.reply_timeout_ms);

    spawn_led_task(Router::new(Arc::clone(&table), TaskId::Led), mailboxes.led);

    let alarms = AlarmStore::load(FileBlobStore::new(&data_dir), config.alarm_capacity)
        .context("failed to load alarm store")?;
    let sun: Arc<dyn SunTimes> = Arc::new(config.location.solar_calculator());
    let timer = TokioCountdown::new(Handle::current(), mailboxes.alarm_self);
    let engine = AlarmEngine::new(
        Router::new(Arc::clone(&table), TaskId::Alarm),
        alarms,
        timer,
        sun,
    );
    let (stop_alarms, alarm_shutdown) = oneshot::channel();
    let mut alarm_task = tokio::spawn(run_alarm_loop(engine, mailboxes.alarm, alarm_shutdown, tz));

    let tcp_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Tcp), timeout);
    spawn_egress("tcp", tcp_ingress.pending(), mailboxes.tcp);

    let cloud_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Cloud), timeout);
    spawn_egress("cloud", cloud_ingress.pending(), mailboxes.cloud);
    start_cloud(&config, cloud_ingress);

    let http_ingress = Ingress::new(Router::new(Arc::clone(&table), TaskId::Http), timeout);
    spawn_egress("http", http_ingress.pending(), mailboxes.http);
    let app = http::router(HttpState {
        ingress: http_ingress,
        timezone: tz,
    });

    let tcp_listener = tcp::bind(config.tcp_port).await?;
    let http_listener = bind_http(config.http_port).await?;
    info!("diagnostics listening on http://0.0.0.0:{}", config.http_port);

    tokio::select! {
        result = &mut alarm_task => {
            result.context("alarm task aborted")??;
            warn!("alarm mailbox closed");
            return Ok(());
        }
        result = tcp::serve(tcp_listener, tcp_ingress) => result?,
        result = axum::serve(http_listener, app).into_future() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    // The engine holds senders to its own mailbox, so it has to be told to stop.
    let _ = stop_alarms.send(());
    alarm_task.await.context("alarm task aborted")??;
    Ok(())
}

/// Serves the alarm mailbox until `shutdown` fires or every sender is gone.
/// Command handling may block on persistence, so it runs on a blocking-capable worker.
async fn run_alarm_loop<S, T>(
    mut engine: AlarmEngine<TaskMailbox, S, T>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
    tz: Tz,
) -> anyhow::Result<()>
where
    S: BlobStore,
    T: CountdownTimer,
{
    tokio::task::block_in_place(|| engine.init(now_in_timezone(tz)))?;
    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                tokio::task::block_in_place(|| engine.handle(&command, now_in_timezone(tz)))?;
            }
            _ = &mut shutdown => {
                info!("alarm engine stopping");
                break;
            }
        }
    }
    Ok(())
}

fn build_address_table(depth: usize) -> anyhow::Result<Mailboxes> {
    let mut table = AddressTable::with_capacity(TaskId::ALL.len())?;
    let (tcp, tcp_rx) = TaskMailbox::channel(depth);
    let (alarm, alarm_rx) = TaskMailbox::channel(depth);
    let (cloud, cloud_rx) = TaskMailbox::channel(depth);
    let (led, led_rx) = TaskMailbox::channel(depth);
    let (http, http_rx) = TaskMailbox::channel(depth);

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

fn spawn_led_task(router: Router<TaskMailbox>, mut rx: mpsc::Receiver<Envelope>) {
    tokio::spawn(async move {
        let mut service = LedService::new(router);
        while let Some(command) = rx.recv().await {
            service.handle(&command, monotonic_ms());
        }
    });
}

fn start_cloud(config: &ControllerConfig, ingress: Ingress) {
    if !config.network.cloud_enabled() {
        info!("cloud bridge disabled: no mqtt host configured");
        return;
    }
    info!(
        "cloud bridge connecting to {}:{} as {}",
        config.network.mqtt_host, config.network.mqtt_port, config.network.device_id
    );
    let (mqtt, eventloop) = cloud::connect(&config.network);
    let bridge = CloudBridge::new(ingress, config.network.device_id.clone());
    cloud::spawn_mqtt_loop(bridge, mqtt, eventloop);
}

async fn bind_http(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostics server at {addr}"))
}

#[cfg(test)]
mod tests {
    use homelink_common::{
        AddressError, Mailbox, MemoryBlobStore, Operation, RouteFlags, SolarCalculator,
    };

    use super::*;

    #[test]
    fn every_task_is_registered_with_its_flags() {
        let mailboxes = build_address_table(2).unwrap();
        for id in TaskId::ALL {
            let (mailbox, flags) = mailboxes.table.lookup(id.raw()).unwrap();
            assert!(mailbox.is_open());
            assert_eq!(flags, id.route_flags());
        }
        assert!(mailboxes.table.lookup(0).is_err());
        assert_eq!(
            mailboxes.table.lookup(TaskId::Tcp.raw()).unwrap().1,
            RouteFlags::ONLY_REPLY
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alarm_loop_stops_on_shutdown_while_senders_live() {
        let mailboxes = build_address_table(4).unwrap();
        let table = Arc::clone(&mailboxes.table);
        let alarms = AlarmStore::load(Arc::new(MemoryBlobStore::new()), 4).unwrap();
        let engine = AlarmEngine::new(
            Router::new(Arc::clone(&table), TaskId::Alarm),
            alarms,
            TokioCountdown::new(Handle::current(), mailboxes.alarm_self),
            Arc::new(SolarCalculator::new(52.5, 13.4, 0.0)) as Arc<dyn SunTimes>,
        );
        let (stop, shutdown) = oneshot::channel();
        let task = tokio::spawn(run_alarm_loop(engine, mailboxes.alarm, shutdown, Tz::UTC));

        // Commands are still served before shutdown.
        let mut tcp_rx = mailboxes.tcp;
        let mut list = homelink_common::engine::request::list().unwrap();
        list.from = TaskId::Tcp.raw();
        table.lookup(TaskId::Alarm.raw()).unwrap().0.try_deliver(list).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), tcp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.op(), Operation::Response);

        stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("alarm loop kept running after shutdown");
        assert!(result.unwrap().is_ok());
        assert!(table.lookup(TaskId::Alarm.raw()).unwrap().0.is_open());
    }

    #[test]
    fn closed_mailboxes_cannot_be_registered() {
        let mut table = AddressTable::with_capacity(1).unwrap();
        let (mailbox, mut rx) = TaskMailbox::channel(1);
        rx.close();

        assert_eq!(
            table.insert(0, TaskId::Led.raw(), mailbox, RouteFlags::NONE),
            Err(AddressError::InvalidMailbox(TaskId::Led))
        );
        assert!(table.lookup(TaskId::Led.raw()).is_err());
    }
}
