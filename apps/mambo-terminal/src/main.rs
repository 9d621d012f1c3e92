mod bridge;
mod commands;
mod config;
mod logging;
mod printer;
mod render;
mod state;

use std::{
    io::Write as _,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use bridge::{TerminalBridge, UiUpdateCallback};
use chat_platform::{DeviceProfile, FileKeyValueStore};
use chat_supabase::{SupabaseBackend, SupabaseBackendConfig, spawn_runtime};
use commands::{HELP_TEXT, UserInput};
use config::MamboConfig;
use printer::TerminalPrinter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting mambo-terminal");

    let config = match MamboConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("mambo-terminal: {err}");
            return ExitCode::FAILURE;
        }
    };

    let backend = match config.project().and_then(|project| {
        SupabaseBackend::new(SupabaseBackendConfig {
            project,
            tenor_api_key: config.tenor_api_key.clone(),
            geo_url: Some(config.geo_url.clone()),
        })
    }) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            error!(error = %err, "failed to build backend");
            eprintln!("mambo-terminal: {err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = spawn_runtime(backend, device_profile(&config));

    let printer = Arc::new(Mutex::new(TerminalPrinter::new()));
    let ui_update: UiUpdateCallback = Arc::new(move |update| {
        let rendered = printer
            .lock()
            .expect("printer lock poisoned while rendering")
            .render(&update);
        if let Some(text) = rendered {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    });
    let bridge = TerminalBridge::spawn(&config, runtime, ui_update);

    println!("{HELP_TEXT}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed reading stdin");
                break;
            }
        };
        match commands::parse(&line) {
            Ok(UserInput::Quit) => break,
            Ok(UserInput::Help) => println!("{HELP_TEXT}"),
            Ok(input) => bridge.handle_input(input).await,
            Err(message) => bridge.show_error(message),
        }
    }

    info!("mambo-terminal exiting");
    ExitCode::SUCCESS
}

/// Preferences live in a JSON file; with `os-keyring` the session moves to the
/// OS credential store.
fn device_profile(config: &MamboConfig) -> DeviceProfile {
    let prefs = Arc::new(FileKeyValueStore::new(config.device_store_path()));

    #[cfg(feature = "os-keyring")]
    {
        use chat_platform::{OsKeyringStore, ScopedStore};

        let secrets = ScopedStore::new(OsKeyringStore::new("mambo"), config.supabase_url.clone());
        DeviceProfile::new(prefs, Arc::new(secrets))
    }

    #[cfg(not(feature = "os-keyring"))]
    {
        DeviceProfile::single_store(prefs)
    }
}
