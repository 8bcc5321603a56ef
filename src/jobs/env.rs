//! Launch environment assembly
//!
//! The environment shipped with a transient unit is built up from the
//! store's base environment, selected variables copied from the launcher
//! process, and the launch parameters. Private bookkeeping variables are
//! stripped before the unit is created.

use super::{EnvList, LaunchMode};
use crate::appid::AppID;

/// Variables never shipped to the application
pub const STRIPPED_VARS: &[&str] = &[
    "APP_DIR",
    "APP_URIS",
    "APP_EXEC",
    "APP_EXEC_POLICY",
    "APP_LAUNCHER_PID",
    "INSTANCE_ID",
    "MIR_SERVER_PLATFORM_PATH",
    "MIR_SERVER_PROMPT_FILE",
    "MIR_SERVER_HOST_SOCKET",
    "UBUNTU_APP_LAUNCH_OOM_HELPER",
    "UBUNTU_APP_LAUNCH_LEGACY_ROOT",
];

/// Per-property size limit of the service manager
pub const ENV_PROPERTY_LIMIT: usize = 1024 * 1024;

pub fn find_env<'a>(env: &'a EnvList, name: &str) -> Option<&'a str> {
    env.iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

pub fn remove_env(env: &mut EnvList, name: &str) {
    if let Some(pos) = env.iter().position(|(key, _)| key == name) {
        env.remove(pos);
    }
}

/// Copy one variable from the launcher process, first value wins
pub fn copy_env(env: &mut EnvList, name: &str, process_env: &[(String, String)]) {
    if find_env(env, name).is_some() {
        log::debug!("Already a value set for '{}', ignoring", name);
        return;
    }
    match process_env.iter().find(|(key, _)| key == name) {
        Some((_, value)) => env.push((name.to_string(), value.clone())),
        None => log::debug!("Unable to copy environment '{}'", name),
    }
}

/// Copy every launcher variable whose name starts with a prefix
pub fn copy_env_prefix(env: &mut EnvList, prefix: &str, process_env: &[(String, String)]) {
    for (name, _) in process_env.iter().filter(|(key, _)| key.starts_with(prefix)) {
        copy_env(env, name, process_env);
    }
}

/// Size of the Environment= property as it goes over the wire
///
/// Each entry costs its name, its value, two quotes and a separating
/// space; the first entry has no separator.
pub fn env_wire_size(env: &EnvList) -> usize {
    let mut len = "Environment=".len();
    for (key, value) in env {
        len += 3 + key.len() + value.len();
    }
    len.saturating_sub(1)
}

/// Join URLs into a single shell-quoted string
pub fn quote_uris(urls: &[String]) -> String {
    let mut quoted = Vec::with_capacity(urls.len());
    for url in urls {
        match shlex::try_quote(url) {
            Ok(escaped) => quoted.push(escaped.into_owned()),
            Err(_) => log::warn!("Unable to escape URL: {}", url),
        }
    }
    quoted.join(" ")
}

/// The per-user runtime directory
pub fn user_runtime_dir() -> String {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => dir,
        _ => format!("/run/user/{}", nix::unistd::getuid()),
    }
}

/// Inputs for one launch's environment
pub struct LaunchEnvParams<'a> {
    pub appid: &'a AppID,
    pub urls: &'a [String],
    pub mode: LaunchMode,
    /// Snapshot of the launcher process environment
    pub process_env: &'a [(String, String)],
    pub runtime_dir: &'a str,
    pub launcher_pid: u32,
}

/// Build the full launch environment on top of the store's base
pub fn assemble(base: EnvList, params: &LaunchEnvParams<'_>) -> EnvList {
    let mut env = base;

    env.push(("APP_ID".to_string(), params.appid.to_string()));
    env.push((
        "APP_LAUNCHER_PID".to_string(),
        params.launcher_pid.to_string(),
    ));

    copy_env(&mut env, "DISPLAY", params.process_env);
    for prefix in ["DBUS_", "MIR_", "UBUNTU_APP_LAUNCH_"] {
        copy_env_prefix(&mut env, prefix, params.process_env);
    }

    // Unpackaged apps have no other way to find their session context,
    // unless we are confined inside a snap ourselves.
    let in_snap = params.process_env.iter().any(|(key, _)| key == "SNAP");
    if !in_snap && params.appid.package.is_empty() {
        copy_env_prefix(&mut env, "QT_", params.process_env);
        copy_env_prefix(&mut env, "XDG_", params.process_env);
    }

    // The shell's platform is not an application platform
    if matches!(
        find_env(&env, "QT_QPA_PLATFORM"),
        Some("mirserver") | Some("ubuntumirclient")
    ) {
        remove_env(&mut env, "QT_QPA_PLATFORM");
        env.push(("QT_QPA_PLATFORM".to_string(), "wayland".to_string()));
    }

    if find_env(&env, "MIR_SOCKET").is_none() {
        env.push((
            "MIR_SOCKET".to_string(),
            format!("{}/mir_socket", params.runtime_dir),
        ));
    }

    if !params.urls.is_empty() {
        env.push(("APP_URIS".to_string(), quote_uris(params.urls)));
    }

    if params.mode == LaunchMode::Test {
        env.push(("QT_LOAD_TESTABILITY".to_string(), "1".to_string()));
    }

    env
}

/// Strip the bookkeeping variables before the unit is created
pub fn strip_private(env: &mut EnvList) {
    for name in STRIPPED_VARS {
        remove_env(env, name);
    }
}
