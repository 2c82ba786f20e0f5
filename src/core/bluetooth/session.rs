//! Session owner task
//! All application requests and driver events are serialized onto one task
//! that owns the `BluetoothManager`. Callers talk to it through a clonable
//! `SessionHandle` and observe it through snapshots and notifications.

use std::pin::Pin;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::commands::{CommandExecutor, RadioDriver};
use crate::core::bluetooth::constants::NOTIFICATION_CAPACITY;
use crate::core::bluetooth::error::SessionError;
use crate::core::bluetooth::events::DriverEvent;
use crate::core::bluetooth::manager::{BluetoothManager, Effects};
use crate::core::bluetooth::types::{
    ConnectionState, PeripheralId, SessionNotification, SessionSnapshot,
};

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    StartScan {
        filter: Option<Vec<Uuid>>,
        reply: Reply<Result<(), SessionError>>,
    },
    StopScan(Reply<()>),
    Connect {
        peripheral: PeripheralId,
        reply: Reply<Result<(), SessionError>>,
    },
    Disconnect(Reply<()>),
    Reset(Reply<()>),
    Snapshot(Reply<SessionSnapshot>),
}

/// A clonable handle that sends requests to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SessionHandle {
    /// Spawns the session task. `events` is the receiving half of the channel
    /// whose sink was handed to `driver`.
    pub fn spawn<D>(
        config: &SessionConfig,
        driver: D,
        events: mpsc::Receiver<DriverEvent>,
    ) -> (Self, JoinHandle<()>)
    where
        D: RadioDriver + 'static,
    {
        let manager = BluetoothManager::new(config);
        let (tx, commands) = mpsc::channel(config.channel_capacity.max(1));
        let (snapshot_tx, snapshots) = watch::channel(manager.snapshot());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let task = SessionTask {
            manager,
            executor: CommandExecutor::new(driver),
            commands,
            events,
            snapshot_tx,
            notifications: notifications.clone(),
            cooldown_period: Duration::from_secs(config.error_cooldown_secs),
            cooldown: None,
        };
        let join = tokio::spawn(task.run());
        info!("Bluetooth session started.");

        (
            Self {
                tx,
                snapshots,
                notifications,
            },
            join,
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub async fn start_scan(&self, filter: Option<Vec<Uuid>>) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StartScan { filter, reply })
            .await?
    }

    pub async fn stop_scan(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::StopScan).await
    }

    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Connect { peripheral, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Disconnect).await
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Reset).await
    }

    /// Current state, read through the session task
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(SessionCommand::Snapshot).await
    }

    /// Resolves once the published connection state is `state`
    pub async fn wait_for_connection(&self, state: ConnectionState) -> Result<(), SessionError> {
        let mut snapshots = self.subscribe();
        snapshots
            .wait_for(|s| s.connection_state == state)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Latest published snapshot; changes whenever a notification is emitted
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }
}

struct SessionTask<D: RadioDriver> {
    manager: BluetoothManager,
    executor: CommandExecutor<D>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Receiver<DriverEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
    cooldown_period: Duration,
    /// Pending `Error` cooldown and the epoch it clears
    cooldown: Option<(u64, Pin<Box<Sleep>>)>,
}

impl<D: RadioDriver> SessionTask<D> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                Some(event) = self.events.recv() => {
                    let fx = self.manager.handle_event(event);
                    self.apply(fx).await;
                }
                epoch = wait_cooldown(&mut self.cooldown) => {
                    self.cooldown = None;
                    let fx = self.manager.cooldown_elapsed(epoch);
                    self.apply(fx).await;
                }
            }
        }
        info!("Bluetooth session stopped.");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartScan { filter, reply } => {
                let result = match self.manager.start_scan(filter) {
                    Ok(fx) => {
                        self.apply(fx).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::StopScan(reply) => {
                let fx = self.manager.stop_scan();
                self.apply(fx).await;
                let _ = reply.send(());
            }
            SessionCommand::Connect { peripheral, reply } => {
                let result = match self.manager.connect(peripheral) {
                    Ok(fx) => {
                        self.apply(fx).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect(reply) => {
                let fx = self.manager.disconnect();
                self.apply(fx).await;
                let _ = reply.send(());
            }
            SessionCommand::Reset(reply) => {
                let fx = self.manager.reset();
                self.apply(fx).await;
                let _ = reply.send(());
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.manager.snapshot());
            }
        }
    }

    /// Issues driver primitives, arms the cooldown and publishes changes.
    /// Primitives the driver refuses are fed back until the state settles.
    async fn apply(&mut self, fx: Effects) {
        let mut pending = Some(fx);
        while let Some(fx) = pending.take() {
            if let Some(epoch) = fx.cooldown {
                debug!("Scheduling error cooldown #{} in {:?}", epoch, self.cooldown_period);
                self.cooldown = Some((epoch, Box::pin(sleep(self.cooldown_period))));
            }

            let rejected = self.executor.execute(fx.commands).await;
            let mut follow_up = Effects::default();
            for (command, error) in rejected {
                follow_up.merge(self.manager.command_failed(command, &error));
            }

            self.publish(fx.notifications);
            if !follow_up.is_empty() {
                pending = Some(follow_up);
            }
        }
    }

    fn publish(&mut self, notifications: Vec<SessionNotification>) {
        if notifications.is_empty() {
            return;
        }
        self.snapshot_tx.send_replace(self.manager.snapshot());
        for notification in notifications {
            // No subscribers is fine
            let _ = self.notifications.send(notification);
        }
    }
}

async fn wait_cooldown(cooldown: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match cooldown {
        Some((epoch, timer)) => {
            timer.as_mut().await;
            *epoch
        }
        None => std::future::pending::<u64>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::core::bluetooth::commands::DriverCommand;
    use crate::core::bluetooth::commands::testing::RecordingDriver;
    use crate::core::bluetooth::events::{Advertisement, CentralEvent, EventSink, driver_channel};
    use crate::core::bluetooth::types::{AdvertisementPayload, RadioState, ScanState};

    async fn started() -> (SessionHandle, EventSink, Arc<RecordingDriver>) {
        let config = SessionConfig::default();
        let (sink, events) = driver_channel(config.channel_capacity);
        let driver = Arc::new(RecordingDriver::default());
        let (handle, _join) = SessionHandle::spawn(&config, driver.clone(), events);
        sink.send(CentralEvent::StateChanged(RadioState::PoweredOn))
            .await
            .unwrap();
        handle
            .subscribe()
            .wait_for(|s| s.powered_on)
            .await
            .unwrap();
        (handle, sink, driver)
    }

    async fn discover(handle: &SessionHandle, sink: &EventSink, address: &str) -> PeripheralId {
        sink.send(CentralEvent::Advertisement(Advertisement {
            address: address.into(),
            name: None,
            rssi: -42,
            payload: AdvertisementPayload::new(),
        }))
        .await
        .unwrap();
        let mut snapshots = handle.subscribe();
        let snapshot = snapshots
            .wait_for(|s| s.peripherals.iter().any(|p| p.address.as_str() == address))
            .await
            .unwrap();
        snapshot
            .peripherals
            .iter()
            .find(|p| p.address.as_str() == address)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn scan_and_connect_issue_driver_primitives() {
        let (handle, sink, driver) = started().await;
        handle.start_scan(None).await.unwrap();
        let id = discover(&handle, &sink, "AA:BB").await;

        handle.connect(id).await.unwrap();
        assert_eq!(
            driver.take(),
            vec![
                DriverCommand::StartScan {
                    services: vec![],
                    allow_duplicates: true
                },
                DriverCommand::Connect("AA:BB".into()),
            ]
        );
        assert_eq!(
            handle.connect(id).await,
            Err(SessionError::ConnectionBusy(ConnectionState::Connecting))
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.target, Some(id));
        assert_eq!(snapshot.scan_state, ScanState::Searching);
    }

    #[tokio::test]
    async fn scan_is_rejected_while_radio_is_off() {
        let config = SessionConfig::default();
        let (_sink, events) = driver_channel(config.channel_capacity);
        let (handle, _join) =
            SessionHandle::spawn(&config, Arc::new(RecordingDriver::default()), events);
        assert_eq!(
            handle.start_scan(None).await,
            Err(SessionError::RadioPoweredOff)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_error_clears_after_cooldown() {
        let (handle, sink, _driver) = started().await;
        handle.start_scan(None).await.unwrap();
        let id = discover(&handle, &sink, "AA:BB").await;
        handle.connect(id).await.unwrap();

        let mut snapshots = handle.subscribe();
        sink.send(CentralEvent::ConnectFailed {
            address: "AA:BB".into(),
            reason: Some("refused".into()),
        })
        .await
        .unwrap();
        snapshots
            .wait_for(|s| s.connection_state == ConnectionState::Error)
            .await
            .unwrap();
        let failed_at = Instant::now();

        snapshots
            .wait_for(|s| s.connection_state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(failed_at.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_makes_cooldown_a_no_op() {
        let (handle, sink, _driver) = started().await;
        handle.start_scan(None).await.unwrap();
        let id = discover(&handle, &sink, "AA:BB").await;
        handle.connect(id).await.unwrap();
        sink.send(CentralEvent::ConnectFailed {
            address: "AA:BB".into(),
            reason: None,
        })
        .await
        .unwrap();
        handle
            .subscribe()
            .wait_for(|s| s.connection_state == ConnectionState::Error)
            .await
            .unwrap();

        handle.disconnect().await.unwrap();
        handle.connect(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection_state, ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_enters_error_and_recovers() {
        let (handle, sink, driver) = started().await;
        handle.start_scan(None).await.unwrap();
        let id = discover(&handle, &sink, "unreachable").await;
        driver.take();

        handle.connect(id).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection_state, ConnectionState::Error);
        assert_eq!(snapshot.target, None);
        assert!(snapshot.last_error.is_some());
        // The teardown that follows a failed connect is still issued
        assert_eq!(
            driver.take(),
            vec![DriverCommand::Disconnect("unreachable".into())]
        );

        handle
            .subscribe()
            .wait_for(|s| s.connection_state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(
            handle.connect(id).await,
            Ok(()),
            "a refused connect must not leave the session busy"
        );
        assert_eq!(
            handle.snapshot().await.unwrap().connection_state,
            ConnectionState::Error
        );
    }

    #[tokio::test]
    async fn disconnect_resolves_once_the_driver_confirms() {
        let (handle, sink, driver) = started().await;
        handle.start_scan(None).await.unwrap();
        let id = discover(&handle, &sink, "AA:BB").await;
        handle.connect(id).await.unwrap();
        sink.send(CentralEvent::Connected {
            address: "AA:BB".into(),
        })
        .await
        .unwrap();
        handle
            .wait_for_connection(ConnectionState::ServicesDiscovering)
            .await
            .unwrap();

        handle.disconnect().await.unwrap();
        assert!(driver.take().contains(&DriverCommand::Disconnect("AA:BB".into())));
        // The link is not down until the driver says so
        assert_eq!(
            handle.snapshot().await.unwrap().connection_state,
            ConnectionState::ServicesDiscovering
        );

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .wait_for_connection(ConnectionState::Disconnected)
                    .await
            }
        });
        sink.send(CentralEvent::Disconnected {
            address: "AA:BB".into(),
            reason: None,
        })
        .await
        .unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn notifications_follow_state_changes() {
        let (handle, sink, _driver) = started().await;
        let mut notifications = handle.notifications();
        handle.start_scan(None).await.unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            SessionNotification::ScanStateChanged(ScanState::Searching)
        );

        discover(&handle, &sink, "AA:BB").await;
        assert_eq!(
            notifications.recv().await.unwrap(),
            SessionNotification::PeripheralListChanged
        );
    }
}
