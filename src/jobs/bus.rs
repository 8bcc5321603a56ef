//! systemd user-bus plumbing
//!
//! Client proxies for org.freedesktop.systemd1 plus the seam the job
//! manager talks through, so the launch protocol can be exercised
//! without a running bus.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use super::JobError;

pub(crate) const SYSTEMD_BUS_NAME: &str = "org.freedesktop.systemd1";
pub(crate) const SYSTEMD_SERVICE_IFACE: &str = "org.freedesktop.systemd1.Service";
const UNIT_EXISTS_ERROR: &str = "org.freedesktop.systemd1.UnitExists";

const FOCUS_PATH: &str = "/com/canonical/UbuntuAppLaunch";
const FOCUS_IFACE: &str = "com.canonical.UbuntuAppLaunch";

/// One row of the ListUnits reply
type UnitListEntry = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn subscribe(&self) -> zbus::Result<()>;

    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: Vec<(String, Value<'_>)>,
        aux: Vec<(String, Vec<(String, Value<'_>)>)>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reset_failed_unit(&self, name: &str) -> zbus::Result<()>;

    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn list_units(&self) -> zbus::Result<Vec<UnitListEntry>>;

    #[zbus(signal)]
    fn unit_new(&self, id: String, unit: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    fn unit_removed(&self, id: String, unit: OwnedObjectPath) -> zbus::Result<()>;
}

/// Signals the worker cares about, in a bus-independent shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    UnitNew { name: String, path: String },
    UnitRemoved { name: String, path: String },
    /// A service property change; only the Result entry matters here
    ServiceChange { path: String, result: Option<String> },
}

/// Properties of the transient unit about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientProperties {
    pub exec_start: Vec<String>,
    pub remain_after_exit: bool,
    pub service_type: String,
    pub working_directory: Option<String>,
    /// `NAME=value` strings
    pub environment: Vec<String>,
}

/// Everything the job manager asks of the service manager
#[async_trait]
pub trait SystemdBus: Send + Sync {
    async fn subscribe(&self) -> Result<(), JobError>;

    /// Returns the job object path
    async fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: TransientProperties,
    ) -> Result<String, JobError>;

    async fn stop_unit(&self, name: &str, mode: &str) -> Result<(), JobError>;

    async fn reset_failed_unit(&self, name: &str) -> Result<(), JobError>;

    async fn get_unit(&self, name: &str) -> Result<String, JobError>;

    /// Returns (unit name, job path) pairs
    async fn list_units(&self) -> Result<Vec<(String, String)>, JobError>;

    async fn service_main_pid(&self, unit_path: &str) -> Result<u32, JobError>;

    async fn service_control_group(&self, unit_path: &str) -> Result<String, JobError>;

    /// Hand a fresh URL list to an already-running instance
    async fn second_exec(
        &self,
        pid: u32,
        appid: &str,
        instance: &str,
        urls: &[String],
    ) -> Result<(), JobError>;
}

/// Path of the user-bus socket
pub fn user_bus_path() -> String {
    match std::env::var("UBUNTU_APP_LAUNCH_SYSTEMD_PATH") {
        Ok(path) if !path.is_empty() => path,
        _ => format!("/run/user/{}/bus", nix::unistd::getuid()),
    }
}

fn map_zbus(err: zbus::Error) -> JobError {
    if let zbus::Error::MethodError(ref name, ref message, _) = err {
        if name.as_str() == UNIT_EXISTS_ERROR {
            return JobError::UnitExists(message.clone().unwrap_or_default());
        }
    }
    JobError::Bus(err.to_string())
}

fn map_fdo(err: zbus::fdo::Error) -> JobError {
    JobError::Bus(err.to_string())
}

/// Look an argv head up through PATH the way the service manager will
fn find_in_path(command: &str) -> String {
    if command.contains('/') {
        return command.to_string();
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(command);
            if candidate.is_file() {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    log::debug!("Unable to find '{}' in PATH", command);
    command.to_string()
}

/// The real bus, talking to the systemd user instance
pub struct ZbusSystemd {
    connection: zbus::Connection,
    manager: SystemdManagerProxy<'static>,
}

impl ZbusSystemd {
    /// Connect to the user bus and start pumping signals
    ///
    /// Prefers the user-bus socket; falls back to the session bus, which
    /// is mostly useful for testing.
    pub async fn connect() -> Result<(Self, mpsc::Receiver<BusEvent>), JobError> {
        let bus_path = user_bus_path();
        let connection = if std::path::Path::new(&bus_path).exists() {
            zbus::connection::Builder::address(format!("unix:path={}", bus_path).as_str())
                .map_err(map_zbus)?
                .build()
                .await
                .map_err(map_zbus)?
        } else {
            log::debug!("Using session bus for systemd user bus");
            zbus::Connection::session().await.map_err(map_zbus)?
        };

        let manager = SystemdManagerProxy::new(&connection)
            .await
            .map_err(map_zbus)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_events(manager.clone(), connection.clone(), tx));

        Ok((
            Self {
                connection,
                manager,
            },
            rx,
        ))
    }
}

/// Forward unit and property signals into the worker's event channel
async fn pump_events(
    manager: SystemdManagerProxy<'static>,
    connection: zbus::Connection,
    tx: mpsc::Sender<BusEvent>,
) {
    let mut unit_new = match manager.receive_unit_new().await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Unable to watch UnitNew: {}", e);
            return;
        }
    };
    let mut unit_removed = match manager.receive_unit_removed().await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Unable to watch UnitRemoved: {}", e);
            return;
        }
    };
    let mut properties = match service_properties_stream(&connection).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Unable to watch PropertiesChanged: {}", e);
            return;
        }
    };

    loop {
        let event = tokio::select! {
            signal = unit_new.next() => match signal {
                Some(signal) => signal.args().ok().map(|args| BusEvent::UnitNew {
                    name: args.id.clone(),
                    path: args.unit.to_string(),
                }),
                None => break,
            },
            signal = unit_removed.next() => match signal {
                Some(signal) => signal.args().ok().map(|args| BusEvent::UnitRemoved {
                    name: args.id.clone(),
                    path: args.unit.to_string(),
                }),
                None => break,
            },
            message = properties.next() => match message {
                Some(Ok(message)) => parse_properties_changed(&message),
                Some(Err(e)) => {
                    log::debug!("Dropping unreadable bus message: {}", e);
                    None
                }
                None => break,
            },
        };

        if let Some(event) = event {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
}

/// Stream of PropertiesChanged signals for systemd service units
async fn service_properties_stream(
    connection: &zbus::Connection,
) -> zbus::Result<zbus::MessageStream> {
    let rule = zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .arg(0, SYSTEMD_SERVICE_IFACE)?
        .build();
    zbus::MessageStream::for_match_rule(rule, connection, Some(64)).await
}

/// Pull the Result entry out of a PropertiesChanged signal
fn parse_properties_changed(message: &zbus::Message) -> Option<BusEvent> {
    let header = message.header();
    let path = header.path()?.to_string();

    let (iface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        message.body().deserialize().ok()?;
    if iface != SYSTEMD_SERVICE_IFACE {
        return None;
    }

    let result = changed
        .get("Result")
        .and_then(|value| value.downcast_ref::<&str>().ok())
        .map(String::from);

    Some(BusEvent::ServiceChange { path, result })
}

impl ZbusSystemd {
    async fn service_property(&self, unit_path: &str, name: &str) -> Result<OwnedValue, JobError> {
        let path = ObjectPath::try_from(unit_path.to_string()).map_err(|e| {
            JobError::Bus(format!("invalid unit path '{}': {}", unit_path, e))
        })?;
        let proxy = zbus::fdo::PropertiesProxy::builder(&self.connection)
            .destination(SYSTEMD_BUS_NAME)
            .map_err(map_zbus)?
            .path(path)
            .map_err(map_zbus)?
            .build()
            .await
            .map_err(map_zbus)?;
        let iface = zbus::names::InterfaceName::try_from(SYSTEMD_SERVICE_IFACE)
            .map_err(|e| JobError::Bus(e.to_string()))?;
        proxy.get(iface, name).await.map_err(map_fdo)
    }
}

#[async_trait]
impl SystemdBus for ZbusSystemd {
    async fn subscribe(&self) -> Result<(), JobError> {
        self.manager.subscribe().await.map_err(map_zbus)
    }

    async fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: TransientProperties,
    ) -> Result<String, JobError> {
        let mut wire: Vec<(String, Value<'_>)> = Vec::new();

        if !properties.exec_start.is_empty() {
            let path = find_in_path(&properties.exec_start[0]);
            let entries = vec![(path, properties.exec_start.clone(), false)];
            wire.push((
                "ExecStart".to_string(),
                Value::Array(zbus::zvariant::Array::from(entries)),
            ));
        }
        wire.push((
            "RemainAfterExit".to_string(),
            Value::from(properties.remain_after_exit),
        ));
        wire.push(("Type".to_string(), Value::from(properties.service_type)));
        if let Some(dir) = properties.working_directory {
            wire.push(("WorkingDirectory".to_string(), Value::from(dir)));
        }
        wire.push((
            "Environment".to_string(),
            Value::Array(zbus::zvariant::Array::from(properties.environment)),
        ));

        let job = self
            .manager
            .start_transient_unit(name, mode, wire, Vec::new())
            .await
            .map_err(map_zbus)?;
        Ok(job.to_string())
    }

    async fn stop_unit(&self, name: &str, mode: &str) -> Result<(), JobError> {
        self.manager
            .stop_unit(name, mode)
            .await
            .map(|_| ())
            .map_err(map_zbus)
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<(), JobError> {
        self.manager.reset_failed_unit(name).await.map_err(map_zbus)
    }

    async fn get_unit(&self, name: &str) -> Result<String, JobError> {
        self.manager
            .get_unit(name)
            .await
            .map(|path| path.to_string())
            .map_err(map_zbus)
    }

    async fn list_units(&self) -> Result<Vec<(String, String)>, JobError> {
        let units = self.manager.list_units().await.map_err(map_zbus)?;
        Ok(units
            .into_iter()
            .map(|entry| (entry.0, entry.9.to_string()))
            .collect())
    }

    async fn service_main_pid(&self, unit_path: &str) -> Result<u32, JobError> {
        let value = self.service_property(unit_path, "MainPID").await?;
        u32::try_from(value).map_err(|e| JobError::Bus(format!("unexpected MainPID: {}", e)))
    }

    async fn service_control_group(&self, unit_path: &str) -> Result<String, JobError> {
        let value = self.service_property(unit_path, "ControlGroup").await?;
        String::try_from(value)
            .map_err(|e| JobError::Bus(format!("unexpected ControlGroup: {}", e)))
    }

    async fn second_exec(
        &self,
        pid: u32,
        appid: &str,
        instance: &str,
        urls: &[String],
    ) -> Result<(), JobError> {
        self.connection
            .emit_signal(
                None::<zbus::names::BusName<'_>>,
                FOCUS_PATH,
                FOCUS_IFACE,
                "UnityFocus",
                &(appid, instance, urls, pid),
            )
            .await
            .map_err(map_zbus)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Everything the mock saw, in call order
    #[derive(Debug, Clone, PartialEq)]
    pub enum BusCall {
        Subscribe,
        StartTransientUnit {
            name: String,
            mode: String,
            properties: TransientProperties,
        },
        StopUnit {
            name: String,
            mode: String,
        },
        ResetFailedUnit(String),
        GetUnit(String),
        ListUnits,
        SecondExec {
            pid: u32,
            appid: String,
            instance: String,
            urls: Vec<String>,
        },
    }

    /// Scriptable in-process stand-in for the systemd bus
    #[derive(Default)]
    pub struct MockBus {
        pub calls: Mutex<Vec<BusCall>>,
        /// Replies for StartTransientUnit, popped per call
        pub start_replies: Mutex<VecDeque<Result<String, JobError>>>,
        /// Unit name to object path, used by GetUnit
        pub unit_paths: Mutex<HashMap<String, String>>,
        /// Unit object path to MainPID
        pub main_pids: Mutex<HashMap<String, u32>>,
        /// Unit object path to ControlGroup
        pub control_groups: Mutex<HashMap<String, String>>,
        /// ListUnits reply as (name, job path)
        pub listed: Mutex<Vec<(String, String)>>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record(&self, call: BusCall) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<BusCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SystemdBus for MockBus {
        async fn subscribe(&self) -> Result<(), JobError> {
            self.record(BusCall::Subscribe);
            Ok(())
        }

        async fn start_transient_unit(
            &self,
            name: &str,
            mode: &str,
            properties: TransientProperties,
        ) -> Result<String, JobError> {
            self.record(BusCall::StartTransientUnit {
                name: name.to_string(),
                mode: mode.to_string(),
                properties,
            });
            self.start_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("/org/freedesktop/systemd1/job/1".to_string()))
        }

        async fn stop_unit(&self, name: &str, mode: &str) -> Result<(), JobError> {
            self.record(BusCall::StopUnit {
                name: name.to_string(),
                mode: mode.to_string(),
            });
            Ok(())
        }

        async fn reset_failed_unit(&self, name: &str) -> Result<(), JobError> {
            self.record(BusCall::ResetFailedUnit(name.to_string()));
            Ok(())
        }

        async fn get_unit(&self, name: &str) -> Result<String, JobError> {
            self.record(BusCall::GetUnit(name.to_string()));
            self.unit_paths
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| JobError::Bus(format!("no such unit: {}", name)))
        }

        async fn list_units(&self) -> Result<Vec<(String, String)>, JobError> {
            self.record(BusCall::ListUnits);
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn service_main_pid(&self, unit_path: &str) -> Result<u32, JobError> {
            self.main_pids
                .lock()
                .unwrap()
                .get(unit_path)
                .copied()
                .ok_or_else(|| JobError::Bus(format!("no MainPID for {}", unit_path)))
        }

        async fn service_control_group(&self, unit_path: &str) -> Result<String, JobError> {
            self.control_groups
                .lock()
                .unwrap()
                .get(unit_path)
                .cloned()
                .ok_or_else(|| JobError::Bus(format!("no ControlGroup for {}", unit_path)))
        }

        async fn second_exec(
            &self,
            pid: u32,
            appid: &str,
            instance: &str,
            urls: &[String],
        ) -> Result<(), JobError> {
            self.record(BusCall::SecondExec {
                pid,
                appid: appid.to_string(),
                instance: instance.to_string(),
                urls: urls.to_vec(),
            });
            Ok(())
        }
    }
}
