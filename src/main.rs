mod adb_client;
mod analyzer;
mod axml;
mod broker;
mod bundle;
mod cli;
mod config;
mod error;
mod executor;
mod installer;
mod logbuf;
mod pkcs7;
mod session;
mod shell;
mod su_client;

use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use colored::*;
use inquire::{InquireError, Select, Text};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use adb_client::AdbClient;
use bundle::PackageFormat;
use broker::{BrokerKind, LocalShell, PrivilegeBroker, PrivilegeStatus};
use cli::{Cli, Commands, ModeAction};
use config::Settings;
use error::InstallError;
use executor::{CommandExecutor, CommandResult, PrivilegedExecutor};
use installer::{Installer, WriteMode};
use logbuf::{LogBuffer, LogBufferLayer, LogEvent};
use shell::ShellSession;
use su_client::SuClient;

fn init_logging(verbose: bool, logs: &LogBuffer) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .with(LogBufferLayer::new(logs.clone()).with_filter(LevelFilter::DEBUG))
        .init();
}

fn build_broker(kind: BrokerKind, settings: &Settings) -> Result<Arc<dyn PrivilegeBroker>> {
    match kind {
        BrokerKind::Adb => {
            let client = AdbClient::new(settings.device.clone(), settings.installer.clone());
            if client.device.is_some() || client.adb_path.is_none() {
                return Ok(Arc::new(client));
            }
            let devices = client.get_device_list()?;
            let client = if devices.len() > 1 {
                let device_select = Select::new("Select device:", devices).prompt()?;
                client.with_device(device_select.serial)
            } else {
                client
            };
            Ok(Arc::new(client))
        }
        BrokerKind::Root => Ok(Arc::new(SuClient::new())),
        BrokerKind::Local => Ok(Arc::new(LocalShell)),
    }
}

fn status_hint(broker: &dyn PrivilegeBroker, status: PrivilegeStatus) -> String {
    match status {
        PrivilegeStatus::NotInstalled => format!("{} is not available on this system", broker.name()),
        PrivilegeStatus::NotRunning => format!("{} is installed but not responding", broker.name()),
        PrivilegeStatus::NotAuthorized => format!("{} did not grant elevated access", broker.name()),
        PrivilegeStatus::VersionTooLow => format!("{} is too old, please update it", broker.name()),
        PrivilegeStatus::Authorized => format!("{} is ready", broker.name()),
    }
}

fn ensure_authorized(broker: &dyn PrivilegeBroker) -> Result<()> {
    let status = broker::probe(broker);
    if status.is_usable() {
        return Ok(());
    }
    eprintln!("{}", status_hint(broker, status).yellow());
    Err(InstallError::BrokerUnavailable(status).into())
}

fn print_result(result: &CommandResult) {
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr.red());
    }
    match result.exit_code {
        Some(0) => {}
        Some(code) => println!("{}", format!("[Process completed with exit code {}]", code).yellow()),
        None => println!("{}", "[Process terminated]".yellow()),
    }
}

fn print_recent_logs(logs: &LogBuffer) {
    let lines = logs.snapshot();
    if lines.is_empty() {
        return;
    }
    eprintln!("{}", "\nInstall log".bold().underline().yellow());
    for line in lines {
        eprintln!("{}", line.dimmed());
    }
}

fn install(
    broker: Arc<dyn PrivilegeBroker>,
    settings: &Settings,
    file: std::path::PathBuf,
    stage: bool,
    logs: &LogBuffer,
) -> Result<()> {
    ensure_authorized(broker.as_ref())?;
    let executor = PrivilegedExecutor::new(broker);
    let mut options = settings.install_options();
    options.installer = executor.capabilities().installer_identity;
    let mut installer = Installer::new(executor).with_staging_dir(&settings.staging_dir);
    if stage || settings.staged_writes {
        installer = installer.with_write_mode(WriteMode::Staged);
    }
    let installer = Arc::new(installer);

    ctrlc::set_handler(|| {
        eprintln!("{}", "An install session cannot be interrupted, waiting for it to finish...".yellow());
    })?;

    println!("{} {}", "Installing".green(), file.display().to_string().cyan());
    println!("{} {}", "Write mode:".yellow(), installer.write_mode());
    if PackageFormat::detect(&file).is_bundle() {
        println!("{} {}", "APKs in bundle:".yellow(), bundle::count_apks(&file)?);
    }
    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let task = installer::spawn_install(installer, file, options, settings.extraction_dir());
        task.finish(|progress| println!("{}", progress.to_string().blue())).await
    });
    match outcome {
        Ok(report) => {
            println!("{} {}", "✓".green(), report.message.green());
            Ok(())
        }
        Err(e) => {
            print_recent_logs(logs);
            Err(e.into())
        }
    }
}

fn show_status(broker: &dyn PrivilegeBroker) {
    let status = broker::probe(broker);
    println!("{}", "\nPrivilege Broker".bold().underline().yellow());
    println!("{}: {}", "Broker".cyan(), broker.name().green());
    let status_text = if status.is_usable() { status.to_string().green() } else { status.to_string().red() };
    println!("{}: {}", "Status".cyan(), status_text);
    if status != PrivilegeStatus::NotInstalled {
        let version = match broker.version() {
            Ok(Some(version)) => version.to_string(),
            Ok(None) => "unknown".to_string(),
            Err(e) => format!("unavailable ({})", e.message),
        };
        println!("{}: {}", "Version".cyan(), version.green());
    }
    let caps = broker.capabilities();
    let write_mode = WriteMode::negotiate(&caps, false);
    println!("{}: {}", "Write Mode".cyan(), write_mode.to_string().green());
    println!(
        "{}: {}",
        "Installer".cyan(),
        caps.installer_identity.unwrap_or_else(|| "(broker itself)".to_string()).green()
    );
    println!("{}", status_hint(broker, status).dimmed());
}

fn interactive_shell(broker: Arc<dyn PrivilegeBroker>, logs: &LogBuffer) -> Result<()> {
    let prompt = format!("{}$", broker.name());
    let mut session = ShellSession::new(broker);
    let mut log_events = logs.subscribe();
    println!("{}", "Type 'help' for command list, 'exit' to leave".dimmed());
    loop {
        let mut warnings = 0;
        for event in logbuf::pending(&mut log_events) {
            match event {
                LogEvent::Added(line) if line.contains("[WARN]") || line.contains("[ERROR]") => warnings += 1,
                LogEvent::Added(_) => {}
                LogEvent::Cleared => warnings = 0,
            }
        }
        if warnings > 0 {
            println!("{}", format!("[{} new warnings, type 'log' to view]", warnings).dimmed());
        }
        let line = match Text::new(&prompt).prompt() {
            Ok(line) => line,
            Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => break,
            Err(e) => return Err(e.into()),
        };
        let command = match line.trim() {
            "" => continue,
            "exit" | "quit" => break,
            "help" => {
                println!("{}", "Quick commands".bold().underline().yellow());
                for (label, command) in shell::QUICK_COMMANDS {
                    println!("  {:<20} {}", command.cyan(), label);
                }
                println!("  {:<20} {}", "history [-c]".cyan(), "Show or clear command history");
                println!("  {:<20} {}", "!!".cyan(), "Repeat the last command");
                println!("  {:<20} {}", "reset".cyan(), "Restart the shell session");
                println!("  {:<20} {}", "log [-c]".cyan(), "Show or clear recent log lines");
                continue;
            }
            "history" => {
                for (i, command) in session.history().all().iter().enumerate() {
                    println!("{:>4}  {}", i + 1, command);
                }
                continue;
            }
            "history -c" => {
                session.history_mut().clear();
                continue;
            }
            "reset" => {
                if session.is_alive() {
                    session.reset();
                    println!("{}", "[Session reset]".yellow());
                }
                continue;
            }
            "log" => {
                for line in logs.snapshot() {
                    println!("{}", line.dimmed());
                }
                continue;
            }
            "log -c" => {
                logs.clear();
                continue;
            }
            "!!" => match session.history_mut().previous() {
                Some(last) => last.to_string(),
                None => continue,
            },
            other => other.to_string(),
        };
        match session.run(&command) {
            Ok(result) => print_result(&result),
            Err(e) => eprintln!("{} {}", "Error:".red(), e),
        }
    }
    Ok(())
}

fn mode(action: Option<ModeAction>) -> Result<()> {
    let path = Settings::default_path()?;
    let mut settings = Settings::load_from(&path)?;
    match action {
        None | Some(ModeAction::Show) => {
            println!("{}: {}", "Broker".cyan(), settings.broker.to_string().green());
            return Ok(());
        }
        Some(ModeAction::Set { kind }) => settings.broker = kind,
        Some(ModeAction::Switch) => {
            settings.switch_broker();
        }
    }
    settings.save_to(&path)?;
    println!("{} {}", "Broker set to".green(), settings.broker.to_string().cyan());
    Ok(())
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    let logs = LogBuffer::default();
    init_logging(cli.verbose, &logs);

    let mut settings = Settings::load_from(&Settings::default_path()?)?;
    if let Some(device) = cli.device {
        settings.device = Some(device);
    }
    let kind = cli.broker.unwrap_or(settings.broker);

    match cli.command {
        Commands::Install { file, no_replace, no_grant, user, stage } => {
            if no_replace {
                settings.replace_existing = false;
            }
            if no_grant {
                settings.grant_permissions = false;
            }
            if user.is_some() {
                settings.user = user;
            }
            let broker = build_broker(kind, &settings)?;
            install(broker, &settings, file, stage, &logs)
        }
        Commands::Info { file } => {
            println!("{}", "Analyzing package...".yellow());
            analyzer::analyze(&file)?.print();
            Ok(())
        }
        Commands::Status => {
            println!("{}", "Checking privilege broker...".yellow());
            let broker = build_broker(kind, &settings)?;
            show_status(broker.as_ref());
            Ok(())
        }
        Commands::Shell { command } => {
            let broker = build_broker(kind, &settings)?;
            if kind != BrokerKind::Local {
                ensure_authorized(broker.as_ref())?;
            }
            match command {
                Some(command) => {
                    let executor = PrivilegedExecutor::new(broker);
                    print_result(&shell::run_once(&executor, &command)?);
                    Ok(())
                }
                None => interactive_shell(broker, &logs),
            }
        }
        Commands::Mode { action } => mode(action),
    }
}

fn main() {
    match real_main() {
        Ok(()) => {},
        Err(e) => {
            if let Some(inquire_err) = e.downcast_ref::<inquire::InquireError>() {
                if matches!(inquire_err, inquire::InquireError::OperationInterrupted) {
                    std::process::exit(0);
                }
            }
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
