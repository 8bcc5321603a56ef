//! Process-wide registry
//!
//! The registry owns the app stores, the signal fan-out, and the worker
//! thread that talks to the systemd user instance. There is one shared
//! instance per process, initialized on first use and shut down
//! explicitly.

mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;

use crate::appid::{AppID, AppIdError};
use crate::jobs::handshake::{StartingEvent, StartingSignal};
use crate::jobs::{
    EnvList, FailureKind, InstanceHandle, JobError, JobSignals, JobsHandle, LaunchMode,
    LaunchRequest, UnitInfo, APPLICATION_JOBS,
};
use crate::stores::{self, AppRecord, AppStore, StoreError, StoreEvent};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    AppId(#[from] AppIdError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),
}

pub struct Registry {
    stores: Vec<AppStore>,
    jobs: JobsHandle,
    signals: JobSignals,
    starting: Arc<StartingSignal>,
    store_events: broadcast::Sender<StoreEvent>,
    worker: Mutex<worker::Worker>,
}

static REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    /// The process-wide instance, created on first call
    pub fn get() -> Arc<Registry> {
        REGISTRY.get_or_init(Registry::new).clone()
    }

    /// A standalone registry over the default stores
    pub fn new() -> Arc<Registry> {
        Self::with_stores(stores::default_stores())
    }

    /// A standalone registry over explicit stores
    pub fn with_stores(stores: Vec<AppStore>) -> Arc<Registry> {
        let signals = JobSignals::new();
        let starting = Arc::new(StartingSignal::new());
        let (worker, jobs) = worker::Worker::spawn(signals.clone(), starting.clone());
        Self::assemble(stores, signals, starting, worker, jobs)
    }

    #[cfg(test)]
    pub(crate) fn with_bus(
        stores: Vec<AppStore>,
        bus: Arc<dyn crate::jobs::bus::SystemdBus>,
        events: tokio::sync::mpsc::Receiver<crate::jobs::bus::BusEvent>,
    ) -> Arc<Registry> {
        let signals = JobSignals::new();
        let starting = Arc::new(StartingSignal::new());
        let (worker, jobs) =
            worker::Worker::spawn_with_bus(signals.clone(), starting.clone(), bus, events);
        Self::assemble(stores, signals, starting, worker, jobs)
    }

    fn assemble(
        stores: Vec<AppStore>,
        signals: JobSignals,
        starting: Arc<StartingSignal>,
        worker: worker::Worker,
        jobs: JobsHandle,
    ) -> Arc<Registry> {
        let (store_events, _) = broadcast::channel(64);
        Arc::new(Registry {
            stores,
            jobs,
            signals,
            starting,
            store_events,
            worker: Mutex::new(worker),
        })
    }

    /// Turn a user-supplied hint into a verified AppID
    ///
    /// A full three-part id is verified as-is. With fewer fields the
    /// missing ones are wildcards: each store may complete them, picking
    /// the newest version it advertises for the package/app pair.
    pub async fn find_app(&self, hint: &str) -> Result<AppID, RegistryError> {
        let tokens: Vec<&str> = hint.split('_').collect();
        match tokens.as_slice() {
            [package, app, version] => {
                let appid = AppID::new(package, app, version)?;
                stores::verify_in_order(&self.stores, &appid).await?;
                Ok(appid)
            }
            [package, app] => self.resolve_wildcard(package, app, hint).await,
            [app] if !app.is_empty() => self.resolve_wildcard("", app, hint).await,
            [_] => Err(AppIdError::Empty.into()),
            _ => Err(AppIdError::TooManyFields(hint.to_string()).into()),
        }
    }

    async fn resolve_wildcard(
        &self,
        package: &str,
        app: &str,
        hint: &str,
    ) -> Result<AppID, RegistryError> {
        for store in &self.stores {
            if let Some(appid) = store.resolve(package, app).await {
                return Ok(appid);
            }
        }
        Err(StoreError::NotFound(hint.to_string()).into())
    }

    /// Resolve an AppID to its launchable record
    pub async fn verify_app(&self, appid: &AppID) -> Result<AppRecord, RegistryError> {
        Ok(stores::verify_in_order(&self.stores, appid).await?)
    }

    /// Every application any store advertises, first store wins
    pub async fn list_apps(&self) -> Vec<AppRecord> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for store in &self.stores {
            for record in store.list().await {
                if seen.insert(record.appid.clone()) {
                    records.push(record);
                }
            }
        }
        records
    }

    /// Launch an application
    pub async fn launch(
        &self,
        appid: &AppID,
        urls: &[String],
    ) -> Result<InstanceHandle, RegistryError> {
        self.launch_mode(appid, urls, LaunchMode::Standard).await
    }

    /// Launch an application with testing hooks enabled
    pub async fn launch_test(
        &self,
        appid: &AppID,
        urls: &[String],
    ) -> Result<InstanceHandle, RegistryError> {
        self.launch_mode(appid, urls, LaunchMode::Test).await
    }

    async fn launch_mode(
        &self,
        appid: &AppID,
        urls: &[String],
        mode: LaunchMode,
    ) -> Result<InstanceHandle, RegistryError> {
        let record = stores::verify_in_order(&self.stores, appid).await?;
        let job = record.store.job().to_string();
        // Applications are single-instance; a second launch of the same
        // unit is routed to the running one.
        let instance = String::new();

        let getenv = record_env(&record);
        let request = LaunchRequest {
            appid: appid.clone(),
            job: job.clone(),
            instance: instance.clone(),
            urls: urls.to_vec(),
            mode,
            getenv,
        };

        match self.jobs.launch(request).await {
            Ok(info) => Ok(InstanceHandle::new(info, urls.to_vec(), self.jobs.clone())),
            // Shutdown raced the call; hand back the handle anyway
            Err(JobError::Cancelled) => Ok(InstanceHandle::new(
                UnitInfo::new(&job, &appid.to_string(), &instance),
                urls.to_vec(),
                self.jobs.clone(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// A handle to an instance launched earlier
    pub async fn existing(
        &self,
        appid: &AppID,
        urls: &[String],
    ) -> Result<InstanceHandle, RegistryError> {
        let record = stores::verify_in_order(&self.stores, appid).await?;
        Ok(InstanceHandle::new(
            UnitInfo::new(record.store.job(), &appid.to_string(), ""),
            urls.to_vec(),
            self.jobs.clone(),
        ))
    }

    /// Handles for every running instance of one application
    pub async fn instances(&self, appid: &AppID) -> Result<Vec<InstanceHandle>, RegistryError> {
        let record = stores::verify_in_order(&self.stores, appid).await?;
        let infos = match self
            .jobs
            .instances(&appid.to_string(), record.store.job())
            .await
        {
            Ok(infos) => infos,
            Err(JobError::Cancelled) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(infos
            .into_iter()
            .map(|info| InstanceHandle::new(info, Vec::new(), self.jobs.clone()))
            .collect())
    }

    /// Rendered AppIDs of every running application
    pub async fn running_app_ids(&self) -> Vec<String> {
        let jobs = APPLICATION_JOBS.iter().map(|j| j.to_string()).collect();
        self.jobs.running_app_ids(jobs).await.unwrap_or_default()
    }

    pub fn observe_job_started(&self) -> broadcast::Receiver<UnitInfo> {
        self.signals.subscribe_started()
    }

    pub fn observe_job_stopped(&self) -> broadcast::Receiver<UnitInfo> {
        self.signals.subscribe_stopped()
    }

    pub fn observe_job_failed(&self) -> broadcast::Receiver<(UnitInfo, FailureKind)> {
        self.signals.subscribe_failed()
    }

    /// Watch applications about to start; holding the receiver also
    /// drops the launch handshake wait to zero.
    pub fn observe_app_starting(&self) -> broadcast::Receiver<StartingEvent> {
        self.starting.observe()
    }

    /// Discovery events merged across the stores
    pub fn observe_store_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.store_events.subscribe()
    }

    /// Rescan every store, forwarding any discovery delta to observers
    pub async fn rescan_stores(&self) -> Vec<StoreEvent> {
        let mut delta = Vec::new();
        for store in &self.stores {
            delta.extend(store.rescan().await);
        }
        for event in &delta {
            let _ = self.store_events.send(event.clone());
        }
        delta
    }

    /// Stop the worker; queued operations complete with Cancelled
    pub fn shutdown(&self) {
        self.worker.lock().unwrap().shutdown();
    }
}

/// Base environment for launching one record
fn record_env(record: &AppRecord) -> Box<dyn FnOnce() -> EnvList + Send> {
    let record = record.clone();
    Box::new(move || {
        let mut env: EnvList = record.extra_env.into_iter().collect();
        env.push(("APP_EXEC".to_string(), record.exec_template));
        if let Some(profile) = record.apparmor_profile {
            env.push(("APP_EXEC_POLICY".to_string(), profile));
        }
        if let Some(dir) = record.working_dir {
            env.push(("APP_DIR".to_string(), dir.display().to_string()));
        }
        env
    })
}
