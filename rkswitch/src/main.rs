//! `rkswitch`: manage versioned overlay products.
//!
//! Roots come from `SWITCH_PRODUCTS_ROOT` / `SWITCH_STORAGE_ROOT` unless
//! overridden on the command line. See `libswitch::config` for the remaining
//! environment variables. Logging follows `RUST_LOG`.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use libswitch::config::{PRODUCTS_ROOT_ENV, STORAGE_ROOT_ENV};
use libswitch::{Switch, SwitchConfig, VersionInfo};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rkswitch", version, about = "Versioned copy-on-write products on overlayfs")]
struct Cli {
    /// Directory holding the live product directories [env: SWITCH_PRODUCTS_ROOT]
    #[arg(long, global = true)]
    products_root: Option<String>,

    /// Directory holding version layers [env: SWITCH_STORAGE_ROOT]
    #[arg(long, global = true)]
    storage_root: Option<String>,

    /// Increase log verbosity (-v info, -vv debug) when RUST_LOG is unset
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Create an empty version
    Create { product: String, version: String },
    /// Create a version holding a flattened copy of PARENT
    Duplicate {
        product: String,
        version: String,
        parent: String,
    },
    /// Delete a version that is neither mounted nor a parent
    Delete { product: String, version: String },
    /// Create an empty version layered on top of PARENT
    Derive {
        product: String,
        version: String,
        parent: String,
    },
    /// Flatten inherited content into the version and drop its parent
    Detach { product: String, version: String },
    /// Mount a version onto the product directory
    Select { product: String, version: String },
    /// Unmount the product directory
    Unselect { product: String },
    /// Print the selected version
    Which { product: String },
    /// Fold pending writes into the version's content
    Commit { product: String, version: String },
    /// Discard pending writes
    Undo { product: String, version: String },
    /// List versions with their parents and mount state
    List {
        product: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SwitchConfig> {
    let config = SwitchConfig::from_lookup(|key| {
        let flag = match key {
            PRODUCTS_ROOT_ENV => cli.products_root.clone(),
            STORAGE_ROOT_ENV => cli.storage_root.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })?;
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let switch = Switch::new(config);

    match cli.command {
        Command::Create { product, version } => switch.create(&product, &version)?,
        Command::Duplicate {
            product,
            version,
            parent,
        } => switch.duplicate(&product, &version, &parent)?,
        Command::Delete { product, version } => switch.delete(&product, &version)?,
        Command::Derive {
            product,
            version,
            parent,
        } => switch.derive(&product, &version, &parent)?,
        Command::Detach { product, version } => switch.detach(&product, &version)?,
        Command::Select { product, version } => switch.select(&product, &version)?,
        Command::Unselect { product } => switch.unselect(&product)?,
        Command::Which { product } => {
            if let Some(version) = switch.which(&product)? {
                println!("{version}");
            }
        }
        Command::Commit { product, version } => switch.commit(&product, &version)?,
        Command::Undo { product, version } => switch.undo(&product, &version)?,
        Command::List { product, json } => {
            let versions = switch.list(&product)?;
            if json {
                let out = serde_json::to_string_pretty(&versions)
                    .context("Failed to serialize version list")?;
                println!("{out}");
            } else {
                for info in &versions {
                    println!("{}", format_version(info));
                }
            }
        }
    }
    Ok(())
}

fn format_version(info: &VersionInfo) -> String {
    let marker = if info.selected {
        '*'
    } else if info.mounted {
        '+'
    } else {
        ' '
    };
    match &info.parent {
        Some(parent) => format!("{marker} {} <- {parent}", info.name),
        None => format!("{marker} {}", info.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        let cases: Vec<(Vec<&str>, Command)> = vec![
            (
                vec!["create", "app", "v1"],
                Command::Create {
                    product: "app".into(),
                    version: "v1".into(),
                },
            ),
            (
                vec!["duplicate", "app", "v2", "v1"],
                Command::Duplicate {
                    product: "app".into(),
                    version: "v2".into(),
                    parent: "v1".into(),
                },
            ),
            (
                vec!["derive", "app", "v2", "v1"],
                Command::Derive {
                    product: "app".into(),
                    version: "v2".into(),
                    parent: "v1".into(),
                },
            ),
            (
                vec!["unselect", "app"],
                Command::Unselect {
                    product: "app".into(),
                },
            ),
            (
                vec!["list", "app", "--json"],
                Command::List {
                    product: "app".into(),
                    json: true,
                },
            ),
        ];

        for (args, expected) in cases {
            let cli = Cli::try_parse_from(std::iter::once("rkswitch").chain(args.clone()))
                .unwrap_or_else(|e| panic!("{args:?}: {e}"));
            assert_eq!(cli.command, expected);
        }
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["rkswitch", "create", "app"]).is_err());
        assert!(Cli::try_parse_from(["rkswitch", "frobnicate", "app"]).is_err());
        assert!(Cli::try_parse_from(["rkswitch"]).is_err());
    }

    #[test]
    fn root_flags_are_global() {
        let cli = Cli::try_parse_from([
            "rkswitch",
            "which",
            "app",
            "--products-root",
            "/p",
            "--storage-root",
            "/s",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.products_root, std::path::PathBuf::from("/p"));
        assert_eq!(config.storage_root, std::path::PathBuf::from("/s"));
    }

    #[test]
    fn version_lines() {
        let info = VersionInfo {
            name: "v2".into(),
            parent: Some("v1".into()),
            selected: true,
            mounted: true,
        };
        assert_eq!(format_version(&info), "* v2 <- v1");

        let info = VersionInfo {
            name: "v1".into(),
            parent: None,
            selected: false,
            mounted: true,
        };
        assert_eq!(format_version(&info), "+ v1");
    }
}
