//! desktop-exec - Print the command line for a desktop application
//!
//! Locates an application's desktop file the way the legacy launcher
//! does, expands the Exec= template against an optional URI list, and
//! prints the resulting command line. Exits non-zero when the desktop
//! file cannot be found or lacks an Exec= key.

use clap::Parser;

use ubuntu_app_launch::exec;
use ubuntu_app_launch::stores::LegacyStore;
use ubuntu_app_launch::AppID;

#[derive(Parser)]
#[command(name = "desktop-exec")]
#[command(about = "Print the exec line for a desktop application")]
struct Args {
    /// Application id (the desktop file basename)
    app_id: String,

    /// Space-separated, shell-quoted URI list
    uri_list: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    let appid = match AppID::parse(&args.app_id) {
        Ok(appid) => appid,
        Err(e) => {
            eprintln!("desktop-exec: {}", e);
            std::process::exit(1);
        }
    };

    let store = LegacyStore::new();
    let record = match store.verify(&appid).await {
        Ok(record) => record,
        Err(e) => {
            eprintln!("desktop-exec: {}", e);
            std::process::exit(1);
        }
    };

    let uris = args.uri_list.unwrap_or_default();
    let argv = match exec::parse_exec(&record.exec_template, &uris) {
        Ok(argv) => argv,
        Err(e) => {
            eprintln!("desktop-exec: {}", e);
            std::process::exit(1);
        }
    };

    let line = argv.join(" ");
    match record.apparmor_profile {
        Some(profile) => println!("aa-exec -p \"{}\" -- {}", profile, line),
        None => println!("{}", line),
    }
}
