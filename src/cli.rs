//! Contains CLI argument parsing structs and enums.
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use crate::broker::BrokerKind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Privilege broker to use instead of the configured one
    #[arg(long, global = true, value_enum)]
    pub broker: Option<BrokerKind>,
    /// Serial of the adb device to use
    #[arg(short, long, global = true)]
    pub device: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install an APK, XAPK, APKS or APKM file
    Install {
        /// Path to the package file
        file: PathBuf,
        /// Fail instead of replacing an installed package
        #[arg(long)]
        no_replace: bool,
        /// Don't grant runtime permissions at install time
        #[arg(long)]
        no_grant: bool,
        /// Install for this user id
        #[arg(long)]
        user: Option<u32>,
        /// Copy each APK to the device's staging directory before writing it
        #[arg(long)]
        stage: bool,
    },
    /// Show info for a local APK, XAPK, APKS or APKM file
    Info {
        /// Path to the package file to analyze
        file: PathBuf,
    },
    /// Show the privilege broker's status
    Status,
    /// Run a command through the broker, or open an interactive shell
    Shell {
        /// Command to run once; omit for an interactive session
        command: Option<String>,
    },
    /// Show or change the configured broker
    Mode {
        #[command(subcommand)]
        action: Option<ModeAction>,
    },
}

#[derive(Subcommand)]
pub enum ModeAction {
    /// Print the configured broker
    Show,
    /// Use the given broker from now on
    Set {
        #[arg(value_enum)]
        kind: BrokerKind,
    },
    /// Swap between adb and root
    Switch,
}
