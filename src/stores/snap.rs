//! Snap package store
//!
//! Applications installed as snaps. snapd exports one desktop file per
//! app, named `<package>_<app>.desktop`, and the installed revisions sit
//! under the snap root with a `current` symlink pointing at the active
//! one. The revision doubles as the version field of the AppID.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::broadcast;

use super::{AppRecord, Discovery, StoreError, StoreEvent, StoreId};
use crate::appid::AppID;
use crate::keyfile::{self, KeyFile};

const DESKTOP_GROUP: &str = "Desktop Entry";
const SNAPD_DESKTOP_DIR: &str = "/var/lib/snapd/desktop/applications";
const SNAP_ROOT: &str = "/snap";

pub struct SnapStore {
    desktop_dir: PathBuf,
    snap_root: PathBuf,
    discovery: Discovery,
}

impl SnapStore {
    pub fn new() -> Self {
        Self::with_dirs(PathBuf::from(SNAPD_DESKTOP_DIR), PathBuf::from(SNAP_ROOT))
    }

    pub fn with_dirs(desktop_dir: PathBuf, snap_root: PathBuf) -> Self {
        Self {
            desktop_dir,
            snap_root,
            discovery: Discovery::new(),
        }
    }

    async fn load_desktop(&self, package: &str, app: &str) -> Option<KeyFile> {
        let path = self
            .desktop_dir
            .join(format!("{}_{}.desktop", package, app));
        let keyfile = keyfile::load_keyfile(&path).await.ok()?;
        if keyfile.has_key(DESKTOP_GROUP, "Exec") {
            Some(keyfile)
        } else {
            log::debug!("Snap desktop file '{}' is not usable", path.display());
            None
        }
    }

    /// Revision the `current` symlink points at
    async fn current_revision(&self, package: &str) -> Option<String> {
        let link = self.snap_root.join(package).join("current");
        let target = tokio::fs::read_link(&link).await.ok()?;
        target
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
    }

    /// Lexically-newest installed revision of a package
    async fn newest_revision(&self, package: &str) -> Option<String> {
        let mut revisions: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(self.snap_root.join(package)).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if name != "current" {
                revisions.push(name);
            }
        }
        revisions.into_iter().max()
    }

    fn record_from_keyfile(&self, appid: AppID, keyfile: &KeyFile) -> AppRecord {
        let snap_dir = self.snap_root.join(&appid.package).join("current");
        let mut extra_env = HashMap::new();
        extra_env.insert("SNAP".to_string(), snap_dir.display().to_string());
        AppRecord {
            store: StoreId::Snap,
            exec_template: keyfile
                .get(DESKTOP_GROUP, "Exec")
                .unwrap_or_default()
                .to_string(),
            working_dir: None,
            // Snaps run under the label snapd generated for them
            apparmor_profile: Some(format!("snap.{}.{}", appid.package, appid.app_name)),
            extra_env,
            appid,
        }
    }

    fn owns(appid: &AppID) -> bool {
        !appid.package.is_empty() && !appid.app_name.is_empty() && !appid.version.is_empty()
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.desktop_dir).await {
            Ok(entries) => entries,
            Err(_) => return records,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(basename) = super::legacy::desktop_basename(&entry.path()) else {
                continue;
            };
            let Some((package, app)) = basename.split_once('_') else {
                continue;
            };
            let Some(revision) = self.current_revision(package).await else {
                continue;
            };
            let Ok(appid) = AppID::new(package, app, &revision) else {
                continue;
            };
            if let Some(keyfile) = self.load_desktop(package, app).await {
                records.push(self.record_from_keyfile(appid, &keyfile));
            }
        }
        records
    }

    pub async fn has_app(&self, appid: &AppID) -> bool {
        self.verify(appid).await.is_ok()
    }

    pub async fn verify(&self, appid: &AppID) -> Result<AppRecord, StoreError> {
        if !Self::owns(appid) {
            return Err(StoreError::NotFound(appid.to_string()));
        }
        // The version must name an installed revision
        let installed = self.snap_root.join(&appid.package).join(&appid.version);
        if !installed.is_dir() {
            return Err(StoreError::NotFound(appid.to_string()));
        }
        match self.load_desktop(&appid.package, &appid.app_name).await {
            Some(keyfile) => Ok(self.record_from_keyfile(appid.clone(), &keyfile)),
            None => Err(StoreError::NotFound(appid.to_string())),
        }
    }

    pub async fn resolve(&self, package: &str, app: &str) -> Option<AppID> {
        if package.is_empty() {
            return None;
        }
        self.load_desktop(package, app).await?;
        let revision = match self.current_revision(package).await {
            Some(revision) => revision,
            None => self.newest_revision(package).await?,
        };
        AppID::new(package, app, &revision).ok()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.discovery.subscribe()
    }

    pub async fn rescan(&self) -> Vec<StoreEvent> {
        let current = self.list().await.into_iter().map(|r| r.appid).collect();
        self.discovery.diff(current)
    }
}

impl Default for SnapStore {
    fn default() -> Self {
        Self::new()
    }
}
