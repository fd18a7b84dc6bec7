use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::listing::{parse_device_listing, ListedDevice};
use crate::model::{Device, DeviceStatus};
use crate::settings::Settings;
use crate::tool::{ToolInvocation, ToolRunner};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub reconnected: Vec<String>,
    pub disconnected: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.reconnected.is_empty() && self.disconnected.is_empty()
    }
}

struct Monitor {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    runner: Arc<dyn ToolRunner>,
    capture_tool: PathBuf,
    enumeration_timeout: Duration,
    poll_interval: Duration,
    monitor: Mutex<Option<Monitor>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.read().len())
            .field("capture_tool", &self.capture_tool)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(settings: &Settings, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            runner,
            capture_tool: settings.capture_tool.clone(),
            enumeration_timeout: settings.enumeration_timeout(),
            poll_interval: settings.poll_interval(),
            monitor: Mutex::new(None),
        }
    }

    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return false;
        }

        let (stop, stop_rx) = mpsc::channel::<()>();
        let registry = Arc::downgrade(self);
        let interval = self.poll_interval;
        let thread = thread::spawn(move || {
            info!(?interval, "scanner monitoring started");
            let mut wait = Duration::ZERO;
            loop {
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => match registry.upgrade() {
                        Some(registry) => {
                            registry.refresh();
                        }
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                wait = interval;
            }
            info!("scanner monitoring stopped");
        });

        *monitor = Some(Monitor { stop, thread });
        true
    }

    pub fn stop(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.stop.send(());
            // The last strong reference can be released by the monitor thread itself.
            if monitor.thread.thread().id() == thread::current().id() {
                return;
            }
            if monitor.thread.join().is_err() {
                warn!("scanner monitor thread panicked");
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn refresh(&self) -> ReconcileSummary {
        let invocation = ToolInvocation::new(&self.capture_tool).arg("-L");
        let listing = match self.runner.run(&invocation, self.enumeration_timeout) {
            Ok(output) if output.success => Some(parse_device_listing(&output.stdout)),
            Ok(output) => {
                warn!(error = %output.diagnostic(), "failed to detect scanners");
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to detect scanners");
                None
            }
        };

        let summary = match listing {
            Some(listed) => self.reconcile(&listed, Utc::now()),
            None => self.mark_all_disconnected(),
        };
        log_transitions(&summary);
        summary
    }

    pub fn reconcile(&self, listed: &[ListedDevice], now: DateTime<Utc>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut seen = HashSet::new();
        let mut devices = self.write();

        for item in listed {
            if !seen.insert(item.address.as_str()) {
                continue;
            }
            match devices.get_mut(&item.address) {
                Some(device) => {
                    if !device.connected {
                        summary.reconnected.push(item.address.clone());
                    }
                    device.name = item.name.clone();
                    device.connected = true;
                    device.status = DeviceStatus::Connected;
                    device.last_seen = device.last_seen.max(now);
                }
                None => {
                    devices.insert(
                        item.address.clone(),
                        Device {
                            name: item.name.clone(),
                            address: item.address.clone(),
                            connected: true,
                            status: DeviceStatus::Connected,
                            last_seen: now,
                        },
                    );
                    summary.added.push(item.address.clone());
                }
            }
        }

        for (address, device) in devices.iter_mut() {
            if device.connected && !seen.contains(address.as_str()) {
                device.connected = false;
                device.status = DeviceStatus::Disconnected;
                summary.disconnected.push(address.clone());
            }
        }
        summary.disconnected.sort();
        summary
    }

    pub fn mark_all_disconnected(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for (address, device) in self.write().iter_mut() {
            if device.connected {
                device.connected = false;
                device.status = DeviceStatus::Disconnected;
                summary.disconnected.push(address.clone());
            }
        }
        summary.disconnected.sort();
        summary
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices = self.read().values().cloned().collect::<Vec<_>>();
        sort_by_name(&mut devices);
        devices
    }

    pub fn list_connected(&self) -> Vec<Device> {
        let mut devices = self
            .read()
            .values()
            .filter(|device| device.connected)
            .cloned()
            .collect::<Vec<_>>();
        sort_by_name(&mut devices);
        devices
    }

    pub fn get(&self, address: &str) -> Option<Device> {
        self.read().get(address).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sort_by_name(devices: &mut [Device]) {
    devices.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.address.cmp(&b.address))
    });
}

fn log_transitions(summary: &ReconcileSummary) {
    for address in &summary.added {
        info!(device = %address, "new scanner detected");
    }
    for address in &summary.reconnected {
        info!(device = %address, "scanner reconnected");
    }
    for address in &summary.disconnected {
        info!(device = %address, "scanner disconnected");
    }
    if summary.is_empty() {
        debug!("scanner poll: no changes");
    }
}
