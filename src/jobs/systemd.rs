//! systemd job management
//!
//! Owns the map of live units and drives the transient-unit launch
//! protocol. Everything here runs on the registry worker, so the map is
//! only ever touched from one thread and RPCs are naturally serialized.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::bus::{BusEvent, SystemdBus, TransientProperties};
use super::env::{self, LaunchEnvParams};
use super::handshake::StartingSignal;
use super::{
    parse_unit, unit_name, FailureKind, JobError, JobSignals, LaunchRequest, UnitData, UnitInfo,
    APPLICATION_JOBS,
};

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/systemd";

pub(crate) struct SystemdJobs {
    bus: Arc<dyn SystemdBus>,
    units: HashMap<UnitInfo, UnitData>,
    signals: JobSignals,
    starting: Arc<StartingSignal>,
    cgroup_root: PathBuf,
    no_reset: bool,
}

impl SystemdJobs {
    pub fn new(
        bus: Arc<dyn SystemdBus>,
        signals: JobSignals,
        starting: Arc<StartingSignal>,
    ) -> Self {
        let cgroup_root = match std::env::var("UBUNTU_APP_LAUNCH_SYSTEMD_CGROUP_ROOT") {
            Ok(root) if !root.is_empty() => PathBuf::from(root),
            _ => PathBuf::from(DEFAULT_CGROUP_ROOT),
        };
        let no_reset = std::env::var_os("UBUNTU_APP_LAUNCH_SYSTEMD_NO_RESET").is_some();
        Self::with_options(bus, signals, starting, cgroup_root, no_reset)
    }

    pub fn with_options(
        bus: Arc<dyn SystemdBus>,
        signals: JobSignals,
        starting: Arc<StartingSignal>,
        cgroup_root: PathBuf,
        no_reset: bool,
    ) -> Self {
        Self {
            bus,
            units: HashMap::new(),
            signals,
            starting,
            cgroup_root,
            no_reset,
        }
    }

    /// Subscribe to manager signals and pick up the units already running
    pub async fn connect(&mut self) {
        match self.bus.subscribe().await {
            Ok(()) => log::debug!("Subscribed to systemd"),
            Err(JobError::Cancelled) => {}
            Err(e) => log::warn!("Unable to subscribe to systemd: {}", e),
        }

        match self.bus.list_units().await {
            Ok(units) => {
                for (name, job_path) in units {
                    if parse_unit(&name).is_err() {
                        continue;
                    }
                    if let Err(e) = self.unit_new(&name, &job_path).await {
                        log::debug!("Skipping listed unit '{}': {}", name, e);
                    }
                }
            }
            Err(JobError::Cancelled) => {}
            Err(e) => log::warn!("Unable to list systemd units: {}", e),
        }
    }

    /// React to one bus signal
    pub async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::UnitNew { name, path } => {
                if parse_unit(&name).is_err() {
                    log::debug!("Unable to parse unit: {}", name);
                    return;
                }
                match self.unit_new(&name, &path).await {
                    Ok(_) => {}
                    Err(e @ JobError::DuplicateUnit(_)) => log::debug!("{}", e),
                    Err(e) => log::warn!("{}", e),
                }
            }
            BusEvent::UnitRemoved { name, .. } => match parse_unit(&name) {
                Ok(info) => self.unit_removed(&info),
                Err(_) => log::debug!("Unable to parse unit: {}", name),
            },
            BusEvent::ServiceChange { path, result } => {
                self.service_change(&path, result.as_deref()).await;
            }
        }
    }

    /// Track a newly announced unit and tell the world about it
    pub async fn unit_new(&mut self, name: &str, job_path: &str) -> Result<UnitInfo, JobError> {
        if job_path == "/" {
            return Err(JobError::MalformedUnit(format!(
                "job path for unit '{}' is '/' so it likely failed",
                name
            )));
        }

        let info = parse_unit(name)?;
        if self.units.contains_key(&info) {
            return Err(JobError::DuplicateUnit(name.to_string()));
        }

        log::debug!("New unit: {}", name);
        self.units.insert(
            info.clone(),
            UnitData {
                job_path: job_path.to_string(),
                unit_path: None,
            },
        );

        // Resolve the unit's object path before anyone can query it
        match self.bus.get_unit(name).await {
            Ok(path) => {
                if let Some(data) = self.units.get_mut(&info) {
                    data.unit_path = Some(path);
                }
            }
            Err(e) => {
                self.units.remove(&info);
                return Err(JobError::Bus(format!(
                    "unable to get unit path for '{}': {}",
                    name, e
                )));
            }
        }

        self.signals.emit_started(&info);
        Ok(info)
    }

    /// Forget a removed unit; removals for unknown units are ignored
    pub fn unit_removed(&mut self, info: &UnitInfo) {
        if self.units.remove(info).is_some() {
            self.signals.emit_stopped(info);
        } else {
            log::debug!("Removal of a unit we never saw: {:?}", info);
        }
    }

    /// Dispatch a service property change into a failure event
    pub async fn service_change(&mut self, path: &str, result: Option<&str>) {
        let Some(result) = result else {
            return;
        };
        if result == "success" {
            return;
        }

        let Some(info) = self
            .units
            .iter()
            .find(|(_, data)| data.unit_path.as_deref() == Some(path))
            .map(|(info, _)| info.clone())
        else {
            return;
        };

        // Clear the failed state so the unit can be started again
        self.reset_unit(&info).await;

        let kind = if result == "exit-code" {
            FailureKind::StartFailure
        } else {
            FailureKind::Crash
        };
        self.signals.emit_failed(&info, kind);
    }

    async fn reset_unit(&self, info: &UnitInfo) {
        if self.no_reset {
            return;
        }
        let name = unit_name(info);
        match self.bus.reset_failed_unit(&name).await {
            Ok(()) => log::debug!("Reset failed unit: {}", name),
            Err(JobError::Cancelled) => {}
            Err(e) => log::warn!("Unable to reset failed unit: {}", e),
        }
    }

    /// Create the transient unit for one launch
    pub async fn launch(&mut self, req: LaunchRequest) -> Result<UnitInfo, JobError> {
        if req.appid.is_empty() {
            return Err(JobError::EmptyAppId);
        }

        let appid_str = req.appid.to_string();
        let is_application = APPLICATION_JOBS.contains(&req.job.as_str());
        let info = UnitInfo::new(&req.job, &appid_str, &req.instance);
        let name = unit_name(&info);

        log::debug!("Initializing launch for: {}", appid_str);

        let handshake = if is_application {
            Some(self.starting.begin(&appid_str, &req.instance))
        } else {
            None
        };

        let process_env: Vec<(String, String)> = std::env::vars().collect();
        let mut env = env::assemble(
            (req.getenv)(),
            &LaunchEnvParams {
                appid: &req.appid,
                urls: &req.urls,
                mode: req.mode,
                process_env: &process_env,
                runtime_dir: &env::user_runtime_dir(),
                launcher_pid: std::process::id(),
            },
        );

        let exec = env::find_env(&env, "APP_EXEC").unwrap_or_default().to_string();
        if exec.is_empty() {
            log::warn!("Application exec line is empty");
        }
        let uris = env::find_env(&env, "APP_URIS").unwrap_or_default().to_string();
        log::debug!("Exec line: {}", exec);
        log::debug!("App URIs:  {}", uris);

        let argv = match crate::exec::parse_exec(&exec, &uris) {
            Ok(argv) => argv,
            Err(e) => {
                log::warn!("Unable to expand exec line '{}': {}", exec, e);
                Vec::new()
            }
        };
        let policy = env::find_env(&env, "APP_EXEC_POLICY").map(String::from);
        let argv = crate::exec::wrap_apparmor(argv, policy.as_deref());

        // An empty APP_DIR means no working directory at all
        let working_directory = env::find_env(&env, "APP_DIR")
            .filter(|dir| !dir.is_empty())
            .map(String::from);

        env::strip_private(&mut env);

        let wire_size = env::env_wire_size(&env);
        log::debug!("Environment length: {}", wire_size);
        if wire_size > env::ENV_PROPERTY_LIMIT {
            log::warn!(
                "Environment for '{}' is {} bytes, over the {} byte property limit",
                appid_str,
                wire_size,
                env::ENV_PROPERTY_LIMIT
            );
        }

        let environment = env
            .iter()
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let properties = TransientProperties {
            exec_start: argv,
            remain_after_exit: false,
            service_type: "oneshot".to_string(),
            working_directory,
            environment,
        };

        if let Some(handshake) = handshake {
            handshake.wait().await;
        }

        log::debug!("Asking systemd to start task for: {}", appid_str);
        match self
            .bus
            .start_transient_unit(&name, "replace", properties)
            .await
        {
            Ok(_job_path) => {}
            Err(JobError::UnitExists(_)) => {
                log::debug!("Unit '{}' exists, passing URLs to the running instance", name);
                self.second_exec(&info, &req.urls).await;
            }
            Err(JobError::Cancelled) => {}
            Err(e) => log::warn!("Unable to emit event to start application: {}", e),
        }

        Ok(info)
    }

    /// Deliver a fresh URL list to the instance already running
    async fn second_exec(&self, info: &UnitInfo, urls: &[String]) {
        let pid = self.primary_pid(info).await;
        if pid == 0 {
            log::warn!("No primary PID for '{}', unable to deliver URLs", info.appid);
            return;
        }
        match self
            .bus
            .second_exec(pid, &info.appid, &info.instance, urls)
            .await
        {
            Ok(()) | Err(JobError::Cancelled) => {}
            Err(e) => log::warn!("Unable to send URLs to running instance: {}", e),
        }
    }

    pub fn unit_path(&self, info: &UnitInfo) -> Option<String> {
        self.units.get(info).and_then(|data| data.unit_path.clone())
    }

    /// MainPID of a unit, zero when the unit is gone
    pub async fn primary_pid(&self, info: &UnitInfo) -> u32 {
        let Some(path) = self.unit_path(info) else {
            return 0;
        };
        match self.bus.service_main_pid(&path).await {
            Ok(pid) => pid,
            Err(JobError::Cancelled) => 0,
            Err(e) => {
                log::warn!("Unable to get PID for '{}': {}", unit_name(info), e);
                0
            }
        }
    }

    /// Every process in the unit's control group
    pub async fn pids(&self, info: &UnitInfo) -> Vec<u32> {
        let Some(path) = self.unit_path(info) else {
            return Vec::new();
        };
        let group = match self.bus.service_control_group(&path).await {
            Ok(group) => group,
            Err(JobError::Cancelled) => return Vec::new(),
            Err(e) => {
                log::warn!(
                    "Unable to get control group for '{}': {}",
                    unit_name(info),
                    e
                );
                return Vec::new();
            }
        };

        let tasks = cgroup_tasks_path(&self.cgroup_root, &group);
        log::debug!("Getting PIDs from {}", tasks.display());
        read_task_pids(&tasks).await
    }

    pub async fn stop(&self, info: &UnitInfo) -> Result<(), JobError> {
        let name = unit_name(info);
        self.bus
            .stop_unit(&name, "replace-irreversibly")
            .await
            .map_err(|e| match e {
                JobError::Cancelled => JobError::Cancelled,
                other => JobError::Bus(format!("unable to stop '{}': {}", name, other)),
            })
    }

    /// Units of one app under one job
    pub fn instances_of(&self, appid: &str, job: &str) -> Vec<UnitInfo> {
        let instances: Vec<UnitInfo> = self
            .units
            .keys()
            .filter(|info| info.job == job && info.appid == appid)
            .cloned()
            .collect();
        log::debug!("Found {} instances for AppID '{}'", instances.len(), appid);
        instances
    }

    /// Rendered AppIDs of everything running under the given jobs
    pub fn running_app_ids(&self, jobs: &[String]) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .units
            .keys()
            .filter(|info| jobs.iter().any(|job| *job == info.job))
            .map(|info| info.appid.clone())
            .collect();
        ids.into_iter().collect()
    }
}

fn cgroup_tasks_path(root: &Path, group: &str) -> PathBuf {
    root.join(group.trim_start_matches('/')).join("tasks")
}

/// Read the newline-separated PID list of a cgroup
///
/// The group vanishes when the last process exits, so a missing file is
/// an empty list rather than an error.
async fn read_task_pids(path: &Path) -> Vec<u32> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .filter(|pid| *pid != 0)
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            log::warn!("Unable to read cgroup PID list: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::bus::mock::{BusCall, MockBus};
    use super::super::{EnvList, LaunchMode};
    use super::*;
    use crate::appid::AppID;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_test_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!("/tmp/ual-jobs-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn jobs_with(bus: Arc<MockBus>) -> SystemdJobs {
        SystemdJobs::with_options(
            bus,
            JobSignals::new(),
            Arc::new(StartingSignal::new()),
            PathBuf::from("/nonexistent-cgroup-root"),
            false,
        )
    }

    fn base_env(list: &[(&str, &str)]) -> Box<dyn FnOnce() -> EnvList + Send> {
        let env: EnvList = list
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(move || env)
    }

    fn launch_request(
        appid: AppID,
        urls: &[&str],
        env: &[(&str, &str)],
    ) -> LaunchRequest {
        LaunchRequest {
            appid,
            job: "application-legacy".to_string(),
            instance: "1".to_string(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            mode: LaunchMode::Standard,
            getenv: base_env(env),
        }
    }

    fn start_call(bus: &MockBus) -> (String, String, TransientProperties) {
        bus.calls()
            .into_iter()
            .find_map(|call| match call {
                BusCall::StartTransientUnit {
                    name,
                    mode,
                    properties,
                } => Some((name, mode, properties)),
                _ => None,
            })
            .expect("no StartTransientUnit call recorded")
    }

    #[tokio::test]
    async fn test_launch_starts_confined_unit() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());

        let appid = AppID::new("", "foo", "").unwrap();
        let req = LaunchRequest {
            instance: "".to_string(),
            ..launch_request(
                appid,
                &["file:///tmp/x"],
                &[
                    ("APP_EXEC", "/usr/bin/foo %u"),
                    ("APP_EXEC_POLICY", "foo_profile"),
                ],
            )
        };
        let info = jobs.launch(req).await.unwrap();

        assert_eq!(info.appid, "foo");
        let (name, mode, properties) = start_call(&bus);
        assert_eq!(name, "ubuntu-app-launch--application-legacy--foo--.service");
        assert_eq!(mode, "replace");
        assert_eq!(
            properties.exec_start,
            vec!["aa-exec", "-p", "foo_profile", "/usr/bin/foo", "file:///tmp/x"]
        );
        assert_eq!(properties.service_type, "oneshot");
        assert!(!properties.remain_after_exit);
        assert!(properties.working_directory.is_none());

        // Identity went along, bookkeeping did not
        assert!(properties.environment.iter().any(|e| e == "APP_ID=foo"));
        assert!(!properties
            .environment
            .iter()
            .any(|e| e.starts_with("APP_EXEC=")));
        assert!(!properties
            .environment
            .iter()
            .any(|e| e.starts_with("APP_URIS=")));
        assert!(!properties
            .environment
            .iter()
            .any(|e| e.starts_with("APP_LAUNCHER_PID=")));
    }

    #[tokio::test]
    async fn test_launch_unconfined_app_not_wrapped() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());

        let appid = AppID::new("", "foo", "").unwrap();
        let req = launch_request(
            appid,
            &[],
            &[("APP_EXEC", "/usr/bin/foo"), ("APP_EXEC_POLICY", "unconfined")],
        );
        jobs.launch(req).await.unwrap();

        let (_, _, properties) = start_call(&bus);
        assert_eq!(properties.exec_start, vec!["/usr/bin/foo"]);
    }

    #[tokio::test]
    async fn test_launch_sets_working_directory() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());

        let appid = AppID::new("", "foo", "").unwrap();
        let req = launch_request(
            appid,
            &[],
            &[("APP_EXEC", "/usr/bin/foo"), ("APP_DIR", "/var/lib/foo")],
        );
        jobs.launch(req).await.unwrap();

        let (_, _, properties) = start_call(&bus);
        assert_eq!(properties.working_directory.as_deref(), Some("/var/lib/foo"));
        assert!(!properties
            .environment
            .iter()
            .any(|e| e.starts_with("APP_DIR=")));
    }

    #[tokio::test]
    async fn test_launch_empty_app_dir_means_no_working_directory() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());

        let appid = AppID::new("", "foo", "").unwrap();
        let req = launch_request(
            appid,
            &[],
            &[("APP_EXEC", "/usr/bin/foo"), ("APP_DIR", "")],
        );
        jobs.launch(req).await.unwrap();

        let (_, _, properties) = start_call(&bus);
        assert!(properties.working_directory.is_none());
    }

    #[tokio::test]
    async fn test_launch_empty_appid_rejected() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());

        let req = launch_request(AppID::default(), &[], &[("APP_EXEC", "/bin/true")]);
        assert!(matches!(
            jobs.launch(req).await,
            Err(JobError::EmptyAppId)
        ));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unit_exists_triggers_second_exec() {
        let bus = Arc::new(MockBus::new());
        bus.start_replies
            .lock()
            .unwrap()
            .push_back(Err(JobError::UnitExists("already running".to_string())));
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );
        bus.main_pids.lock().unwrap().insert("/unit/foo".to_string(), 4321);

        let mut jobs = jobs_with(bus.clone());
        let mut started = jobs.signals.subscribe_started();

        // The first invocation is already tracked
        jobs.unit_new(
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "/job/1",
        )
        .await
        .unwrap();
        assert!(started.try_recv().is_ok());

        let appid = AppID::new("", "foo", "").unwrap();
        let req = launch_request(appid, &["file:///doc"], &[("APP_EXEC", "/usr/bin/foo %u")]);
        jobs.launch(req).await.unwrap();

        let second = bus
            .calls()
            .into_iter()
            .find_map(|call| match call {
                BusCall::SecondExec { pid, appid, urls, .. } => Some((pid, appid, urls)),
                _ => None,
            })
            .expect("second exec not invoked");
        assert_eq!(second.0, 4321);
        assert_eq!(second.1, "foo");
        assert_eq!(second.2, vec!["file:///doc"]);

        // No second start announcement for the same unit
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unit_new_duplicate_dropped() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut started = jobs.signals.subscribe_started();

        let name = "ubuntu-app-launch--application-legacy--foo--1.service";
        jobs.unit_new(name, "/job/1").await.unwrap();
        assert!(matches!(
            jobs.unit_new(name, "/job/2").await,
            Err(JobError::DuplicateUnit(_))
        ));

        // Exactly one announcement, and the original data survived
        assert!(started.try_recv().is_ok());
        assert!(started.try_recv().is_err());
        let info = parse_unit(name).unwrap();
        assert_eq!(jobs.units.get(&info).unwrap().job_path, "/job/1");
    }

    #[tokio::test]
    async fn test_unit_new_rejects_failed_job_path() {
        let bus = Arc::new(MockBus::new());
        let mut jobs = jobs_with(bus.clone());
        assert!(jobs
            .unit_new(
                "ubuntu-app-launch--application-legacy--foo--1.service",
                "/"
            )
            .await
            .is_err());
        assert!(jobs.units.is_empty());
    }

    #[tokio::test]
    async fn test_unit_removed_emits_once() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut stopped = jobs.signals.subscribe_stopped();

        let name = "ubuntu-app-launch--application-legacy--foo--1.service";
        let info = jobs.unit_new(name, "/job/1").await.unwrap();

        jobs.unit_removed(&info);
        assert!(stopped.try_recv().is_ok());

        // A second removal is spurious and quiet
        jobs.unit_removed(&info);
        assert!(stopped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_dispatch_exit_code() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut failed = jobs.signals.subscribe_failed();

        let info = jobs
            .unit_new(
                "ubuntu-app-launch--application-legacy--foo--1.service",
                "/job/1",
            )
            .await
            .unwrap();

        jobs.service_change("/unit/foo", Some("exit-code")).await;
        let (event_info, kind) = failed.try_recv().unwrap();
        assert_eq!(event_info, info);
        assert_eq!(kind, FailureKind::StartFailure);

        // The unit got its failed state cleared
        assert!(bus.calls().iter().any(|call| matches!(
            call,
            BusCall::ResetFailedUnit(name)
                if name == "ubuntu-app-launch--application-legacy--foo--1.service"
        )));
    }

    #[tokio::test]
    async fn test_failure_dispatch_crash() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut failed = jobs.signals.subscribe_failed();

        jobs.unit_new(
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "/job/1",
        )
        .await
        .unwrap();

        jobs.service_change("/unit/foo", Some("signal")).await;
        let (_, kind) = failed.try_recv().unwrap();
        assert_eq!(kind, FailureKind::Crash);
    }

    #[tokio::test]
    async fn test_failure_dispatch_ignores_success_and_strangers() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut failed = jobs.signals.subscribe_failed();

        jobs.unit_new(
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "/job/1",
        )
        .await
        .unwrap();

        jobs.service_change("/unit/foo", Some("success")).await;
        jobs.service_change("/unit/foo", None).await;
        jobs.service_change("/unit/unrelated", Some("exit-code")).await;
        assert!(failed.try_recv().is_err());
        assert!(!bus
            .calls()
            .iter()
            .any(|call| matches!(call, BusCall::ResetFailedUnit(_))));
    }

    #[tokio::test]
    async fn test_no_reset_suppresses_reset_calls() {
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = SystemdJobs::with_options(
            bus.clone(),
            JobSignals::new(),
            Arc::new(StartingSignal::new()),
            PathBuf::from("/nonexistent"),
            true,
        );
        let mut failed = jobs.signals.subscribe_failed();

        jobs.unit_new(
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "/job/1",
        )
        .await
        .unwrap();
        jobs.service_change("/unit/foo", Some("exit-code")).await;

        assert!(failed.try_recv().is_ok());
        assert!(!bus
            .calls()
            .iter()
            .any(|call| matches!(call, BusCall::ResetFailedUnit(_))));
    }

    #[tokio::test]
    async fn test_connect_enumerates_existing_units() {
        let bus = Arc::new(MockBus::new());
        bus.listed.lock().unwrap().extend([
            (
                "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
                "/job/1".to_string(),
            ),
            ("dbus.service".to_string(), "/job/2".to_string()),
        ]);
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );

        let mut jobs = jobs_with(bus.clone());
        let mut started = jobs.signals.subscribe_started();
        jobs.connect().await;

        assert_eq!(jobs.units.len(), 1);
        assert_eq!(started.try_recv().unwrap().appid, "foo");
        assert!(bus.calls().contains(&BusCall::Subscribe));
    }

    #[tokio::test]
    async fn test_primary_pid_zero_when_unit_gone() {
        let bus = Arc::new(MockBus::new());
        let jobs = jobs_with(bus);
        let info = UnitInfo::new("application-legacy", "gone", "1");
        assert_eq!(jobs.primary_pid(&info).await, 0);
    }

    #[tokio::test]
    async fn test_pids_read_from_cgroup() {
        let root = unique_test_dir();
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );
        bus.control_groups
            .lock()
            .unwrap()
            .insert("/unit/foo".to_string(), "/ual/foo".to_string());

        fs::create_dir_all(root.join("ual/foo")).unwrap();
        fs::write(root.join("ual/foo/tasks"), "100\n200\n\n300\n").unwrap();

        let mut jobs = SystemdJobs::with_options(
            bus.clone(),
            JobSignals::new(),
            Arc::new(StartingSignal::new()),
            root,
            false,
        );
        let info = jobs
            .unit_new(
                "ubuntu-app-launch--application-legacy--foo--1.service",
                "/job/1",
            )
            .await
            .unwrap();

        assert_eq!(jobs.pids(&info).await, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_pids_tolerate_vanished_cgroup() {
        let root = unique_test_dir();
        let bus = Arc::new(MockBus::new());
        bus.unit_paths.lock().unwrap().insert(
            "ubuntu-app-launch--application-legacy--foo--1.service".to_string(),
            "/unit/foo".to_string(),
        );
        bus.control_groups
            .lock()
            .unwrap()
            .insert("/unit/foo".to_string(), "/ual/already-gone".to_string());

        let mut jobs = SystemdJobs::with_options(
            bus.clone(),
            JobSignals::new(),
            Arc::new(StartingSignal::new()),
            root,
            false,
        );
        let info = jobs
            .unit_new(
                "ubuntu-app-launch--application-legacy--foo--1.service",
                "/job/1",
            )
            .await
            .unwrap();

        assert!(jobs.pids(&info).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_uses_irreversible_mode() {
        let bus = Arc::new(MockBus::new());
        let jobs = jobs_with(bus.clone());
        let info = UnitInfo::new("application-legacy", "foo", "1");
        jobs.stop(&info).await.unwrap();

        assert!(bus.calls().iter().any(|call| matches!(
            call,
            BusCall::StopUnit { name, mode }
                if name == "ubuntu-app-launch--application-legacy--foo--1.service"
                    && mode == "replace-irreversibly"
        )));
    }

    #[tokio::test]
    async fn test_instances_and_running_app_ids() {
        let bus = Arc::new(MockBus::new());
        for name in [
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "ubuntu-app-launch--application-legacy--foo--2.service",
            "ubuntu-app-launch--application-legacy--bar--1.service",
            "ubuntu-app-launch--application-snap--pkg_app_1--1.service",
        ] {
            bus.unit_paths
                .lock()
                .unwrap()
                .insert(name.to_string(), format!("/unit{}", name.len()));
        }

        let mut jobs = jobs_with(bus.clone());
        for (idx, name) in [
            "ubuntu-app-launch--application-legacy--foo--1.service",
            "ubuntu-app-launch--application-legacy--foo--2.service",
            "ubuntu-app-launch--application-legacy--bar--1.service",
            "ubuntu-app-launch--application-snap--pkg_app_1--1.service",
        ]
        .iter()
        .enumerate()
        {
            jobs.unit_new(name, &format!("/job/{}", idx)).await.unwrap();
        }

        let instances = jobs.instances_of("foo", "application-legacy");
        assert_eq!(instances.len(), 2);

        let running = jobs.running_app_ids(&[
            "application-legacy".to_string(),
            "application-snap".to_string(),
        ]);
        assert_eq!(running, vec!["bar", "foo", "pkg_app_1"]);

        let legacy_only = jobs.running_app_ids(&["application-legacy".to_string()]);
        assert_eq!(legacy_only, vec!["bar", "foo"]);
    }
}
