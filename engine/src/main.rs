//! Dockyard - Entry Point
//!
//! Command line front of the deployment engine. Operates on projects that
//! already exist in the configured state directory.

use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context};
use colored::Colorize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};

use dockyard::app::options::AppOptions;
use dockyard::app::projects::ProjectManager;
use dockyard::app::state::AppState;
use dockyard::deploy::shell::TerminalSize;
use dockyard::filesys::file::File;
use dockyard::logs::{init_logging, LogOptions};
use dockyard::models::project::Upn;
use dockyard::storage::settings::{Settings, DEFAULT_SETTINGS_PATH};
use dockyard::utils::version_info;

/// Flags that are never image tag overrides
const RESERVED_FLAGS: &[&str] = &[
    "config", "version", "state", "redeploy", "token", "logs", "service", "render", "delete",
    "shell",
];

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Unable to render version: {}", e),
        }
        return;
    }

    if let Err(e) = run(cli_args).await {
        error!("{:#}", e);
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli_args: HashMap<String, String>) -> anyhow::Result<()> {
    // Retrieve the settings file
    let settings_path = cli_args
        .get("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_SETTINGS_PATH);
    let settings = Settings::load(&File::new(settings_path)).await?;

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = init_logging(log_options)?;

    let options = AppOptions::from_settings(&settings);
    info!("Running Dockyard with options: {:?}", options);
    let manager = ProjectManager::new(AppState::init(options).await?);

    if let Some(upn) = cli_args.get("state") {
        return print_state(&manager, &Upn::from(upn.as_str())).await;
    }

    if let Some(upn) = cli_args.get("render") {
        let yaml = manager.render(&Upn::from(upn.as_str())).await?;
        print!("{}", yaml);
        return Ok(());
    }

    if let Some(upn) = cli_args.get("logs") {
        let service = cli_args
            .get("service")
            .context("--logs requires --service=<service>")?;
        return follow_logs(&manager, &Upn::from(upn.as_str()), service).await;
    }

    if let Some(upn) = cli_args.get("shell") {
        let service = cli_args
            .get("service")
            .context("--shell requires --service=<service>")?;
        return attach_shell(&manager, &Upn::from(upn.as_str()), service).await;
    }

    if let Some(upn) = cli_args.get("redeploy") {
        let token = cli_args
            .get("token")
            .context("--redeploy requires --token=<access token>")?;
        let mut tags: Vec<(String, String)> = cli_args
            .iter()
            .filter(|(key, _)| !RESERVED_FLAGS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        tags.sort();

        let project = manager
            .redeploy_from_hook(&Upn::from(upn.as_str()), token, &tags)
            .await?;
        println!(
            "{} {} ({} services)",
            "deployed".green().bold(),
            project.upn(),
            project.services.len()
        );
        return Ok(());
    }

    if let Some(upn) = cli_args.get("delete") {
        manager.delete(&Upn::from(upn.as_str())).await?;
        println!("{} {}", "deleted".yellow().bold(), upn);
        return Ok(());
    }

    bail!("nothing to do; use --state, --render, --logs, --shell, --redeploy or --delete")
}

async fn print_state(manager: &ProjectManager, upn: &Upn) -> anyhow::Result<()> {
    let states = manager.container_state(upn).await?;
    if states.is_empty() {
        println!("{} has no containers", upn);
        return Ok(());
    }

    let mut services: Vec<_> = states.into_iter().collect();
    services.sort_by(|a, b| a.0.cmp(&b.0));
    for (service, state) in services {
        let label = if state.is_active() {
            state.state.green()
        } else {
            state.state.red()
        };
        println!("{:<32} {:<10} {}", service, label, state.status);
    }
    Ok(())
}

async fn follow_logs(manager: &ProjectManager, upn: &Upn, service: &str) -> anyhow::Result<()> {
    let stream = manager.stream_logs(upn, service).await?;
    let (mut lines, handle) = stream.into_channel(64);
    let mut failure = None;

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(Ok(line)) => println!("{}", line),
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, closing log stream...");
                break;
            }
        }
    }

    // Closing the receiver ends the stream task and its process
    drop(lines);
    if let Err(e) = handle.await {
        bail!("log stream task failed: {}", e);
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn attach_shell(manager: &ProjectManager, upn: &Upn, service: &str) -> anyhow::Result<()> {
    let session = manager
        .open_shell(upn, service, TerminalSize::default())
        .await?;
    let (input, mut output, exit) = session.into_parts();

    // Stdin EOF closes the input, which ends the shell
    let stdin_pump = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if input.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Unable to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = output.recv().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    stdin_pump.abort();

    exit.await.context("shell task failed")??;
    Ok(())
}
