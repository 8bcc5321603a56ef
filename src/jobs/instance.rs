//! Live reference to a launched unit
//!
//! A handle outlives the unit it points at; queries on a gone unit
//! return empty results rather than errors.

use super::{JobError, JobsHandle, UnitInfo};

pub struct InstanceHandle {
    info: UnitInfo,
    urls: Vec<String>,
    jobs: JobsHandle,
}

impl InstanceHandle {
    pub(crate) fn new(info: UnitInfo, urls: Vec<String>, jobs: JobsHandle) -> Self {
        Self { info, urls, jobs }
    }

    pub fn appid(&self) -> &str {
        &self.info.appid
    }

    pub fn job(&self) -> &str {
        &self.info.job
    }

    pub fn instance(&self) -> &str {
        &self.info.instance
    }

    /// The URLs this invocation was started with
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn unit_info(&self) -> &UnitInfo {
        &self.info
    }

    /// Main process of the unit, zero when it is gone
    pub async fn primary_pid(&self) -> u32 {
        self.jobs.primary_pid(&self.info).await.unwrap_or(0)
    }

    /// Every process in the unit's control group
    pub async fn pids(&self) -> Vec<u32> {
        self.jobs.pids(&self.info).await.unwrap_or_default()
    }

    /// Stop the unit, without allowing anything to replace the stop job
    pub async fn stop(&self) -> Result<(), JobError> {
        match self.jobs.stop(&self.info).await {
            Err(JobError::Cancelled) => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("info", &self.info)
            .field("urls", &self.urls)
            .finish()
    }
}
