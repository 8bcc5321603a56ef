//! Transient-unit job management
//!
//! Applications run as transient systemd units on the user bus. A unit
//! is named
//!
//! ```text
//! ubuntu-app-launch--<job>--<appid>--<instance>.service
//! ```
//!
//! and the registry worker keeps a map of every such unit it has seen,
//! translating unit add/remove/property signals into job lifecycle
//! events.

pub mod bus;
pub mod env;
pub mod handshake;
pub mod instance;
pub(crate) mod systemd;

pub use instance::InstanceHandle;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::appid::AppID;

const UNIT_PREFIX: &str = "ubuntu-app-launch--";
const UNIT_SUFFIX: &str = ".service";

/// Jobs whose units are full applications (as opposed to helpers)
pub const APPLICATION_JOBS: &[&str] = &["application-legacy", "application-snap"];

/// How a launch should behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Standard,
    /// Testing hooks are injected into the app's environment
    Test,
}

/// Why a job stopped abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The app exited with a failing status
    StartFailure,
    /// The app was killed or dumped core
    Crash,
}

/// Key identifying one unit the launcher owns
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitInfo {
    pub job: String,
    /// Rendered AppID
    pub appid: String,
    pub instance: String,
}

impl UnitInfo {
    pub fn new(job: &str, appid: &str, instance: &str) -> Self {
        Self {
            job: job.to_string(),
            appid: appid.to_string(),
            instance: instance.to_string(),
        }
    }
}

/// What we know about a live unit
///
/// `unit_path` stays unset between the unit's announcement and the
/// GetUnit reply that resolves its object path.
#[derive(Debug, Clone, Default)]
pub struct UnitData {
    pub job_path: String,
    pub unit_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Unable to parse unit name: {0}")]
    MalformedUnit(String),

    #[error("Empty application id")]
    EmptyAppId,

    #[error("Duplicate unit, not really new: {0}")]
    DuplicateUnit(String),

    #[error("Unit already exists: {0}")]
    UnitExists(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bus error: {0}")]
    Bus(String),
}

/// Format the unit name for a unit we own
pub fn unit_name(info: &UnitInfo) -> String {
    format!(
        "{}{}--{}--{}{}",
        UNIT_PREFIX, info.job, info.appid, info.instance, UNIT_SUFFIX
    )
}

/// Parse a unit name, accepting only our naming grammar
///
/// The appid may itself contain `-`, so the split anchors on the first
/// and the last `--` of the body. An appid that would sit flush against
/// a delimiter has no unambiguous parse and is rejected.
pub fn parse_unit(name: &str) -> Result<UnitInfo, JobError> {
    let malformed = || JobError::MalformedUnit(name.to_string());

    let body = name
        .strip_prefix(UNIT_PREFIX)
        .and_then(|b| b.strip_suffix(UNIT_SUFFIX))
        .ok_or_else(malformed)?;

    let first = body.find("--").ok_or_else(malformed)?;
    let last = body.rfind("--").ok_or_else(malformed)?;
    if last <= first {
        return Err(malformed());
    }

    let job = &body[..first];
    let appid = &body[first + 2..last];
    let instance = &body[last + 2..];

    if job.is_empty() || appid.is_empty() {
        return Err(malformed());
    }
    if appid.starts_with('-') || appid.ends_with('-') {
        return Err(malformed());
    }
    if !instance.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    Ok(UnitInfo::new(job, appid, instance))
}

/// Lifecycle signal fan-out
#[derive(Clone)]
pub struct JobSignals {
    started: broadcast::Sender<UnitInfo>,
    stopped: broadcast::Sender<UnitInfo>,
    failed: broadcast::Sender<(UnitInfo, FailureKind)>,
}

impl JobSignals {
    pub fn new() -> Self {
        let (started, _) = broadcast::channel(64);
        let (stopped, _) = broadcast::channel(64);
        let (failed, _) = broadcast::channel(64);
        Self {
            started,
            stopped,
            failed,
        }
    }

    pub fn subscribe_started(&self) -> broadcast::Receiver<UnitInfo> {
        self.started.subscribe()
    }

    pub fn subscribe_stopped(&self) -> broadcast::Receiver<UnitInfo> {
        self.stopped.subscribe()
    }

    pub fn subscribe_failed(&self) -> broadcast::Receiver<(UnitInfo, FailureKind)> {
        self.failed.subscribe()
    }

    pub(crate) fn emit_started(&self, info: &UnitInfo) {
        log::debug!("Job started: {:?}", info);
        let _ = self.started.send(info.clone());
    }

    pub(crate) fn emit_stopped(&self, info: &UnitInfo) {
        log::debug!("Job stopped: {:?}", info);
        let _ = self.stopped.send(info.clone());
    }

    pub(crate) fn emit_failed(&self, info: &UnitInfo, kind: FailureKind) {
        log::debug!("Job failed ({:?}): {:?}", kind, info);
        let _ = self.failed.send((info.clone(), kind));
    }
}

impl Default for JobSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment as ordered name/value pairs
pub type EnvList = Vec<(String, String)>;

/// Everything the worker needs to start one unit
pub(crate) struct LaunchRequest {
    pub appid: AppID,
    pub job: String,
    pub instance: String,
    pub urls: Vec<String>,
    pub mode: LaunchMode,
    /// Produces the base environment for the unit
    pub getenv: Box<dyn FnOnce() -> EnvList + Send>,
}

/// Operations posted to the registry worker
pub(crate) enum Op {
    Launch {
        req: LaunchRequest,
        reply: oneshot::Sender<Result<UnitInfo, JobError>>,
    },
    PrimaryPid {
        info: UnitInfo,
        reply: oneshot::Sender<Result<u32, JobError>>,
    },
    Pids {
        info: UnitInfo,
        reply: oneshot::Sender<Result<Vec<u32>, JobError>>,
    },
    Stop {
        info: UnitInfo,
        reply: oneshot::Sender<Result<(), JobError>>,
    },
    Instances {
        appid: String,
        job: String,
        reply: oneshot::Sender<Result<Vec<UnitInfo>, JobError>>,
    },
    RunningAppIds {
        jobs: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, JobError>>,
    },
}

/// Posting side of the worker's operation queue
#[derive(Clone)]
pub struct JobsHandle {
    tx: mpsc::Sender<Op>,
}

impl JobsHandle {
    pub(crate) fn new(tx: mpsc::Sender<Op>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, JobError>>) -> Op,
    ) -> Result<T, JobError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| JobError::Cancelled)?;
        reply_rx.await.map_err(|_| JobError::Cancelled)?
    }

    pub(crate) async fn launch(&self, req: LaunchRequest) -> Result<UnitInfo, JobError> {
        self.call(|reply| Op::Launch { req, reply }).await
    }

    pub(crate) async fn primary_pid(&self, info: &UnitInfo) -> Result<u32, JobError> {
        let info = info.clone();
        self.call(|reply| Op::PrimaryPid { info, reply }).await
    }

    pub(crate) async fn pids(&self, info: &UnitInfo) -> Result<Vec<u32>, JobError> {
        let info = info.clone();
        self.call(|reply| Op::Pids { info, reply }).await
    }

    pub(crate) async fn stop(&self, info: &UnitInfo) -> Result<(), JobError> {
        let info = info.clone();
        self.call(|reply| Op::Stop { info, reply }).await
    }

    pub(crate) async fn instances(
        &self,
        appid: &str,
        job: &str,
    ) -> Result<Vec<UnitInfo>, JobError> {
        let appid = appid.to_string();
        let job = job.to_string();
        self.call(|reply| Op::Instances { appid, job, reply }).await
    }

    pub(crate) async fn running_app_ids(&self, jobs: Vec<String>) -> Result<Vec<String>, JobError> {
        self.call(|reply| Op::RunningAppIds { jobs, reply }).await
    }
}
