//! Application state management
//! This module wires the radio driver to the session task.

use anyhow::Result;
use log::info;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::bluetooth::{BluestDriver, driver_channel};
use crate::core::SessionHandle;

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    /// Handle to the running bluetooth session
    pub session: SessionHandle,
    session_task: JoinHandle<()>,
}

impl AppState {
    /// Opens the default adapter and spawns the session task on it
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing bluetooth session...");
        let (sink, events) = driver_channel(config.session.channel_capacity);
        let driver = BluestDriver::new(sink).await?;
        let (session, session_task) = SessionHandle::spawn(&config.session, driver, events);
        Ok(Self {
            config,
            session,
            session_task,
        })
    }

    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Stops the session task
    pub fn shutdown(self) {
        self.session_task.abort();
        info!("Bluetooth session stopped.");
    }
}
