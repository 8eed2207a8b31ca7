//! Thin command-line front-end for the multipath reconciliation core.
//!
//! This binary is explicitly not a reimplementation of the daemon's event
//! loop: it points the engine at a config file/dir pair and a serialized,
//! point-in-time path inventory, runs exactly one coalesce-and-reconcile
//! pass against an in-memory fake device-mapper client, and prints the
//! resulting actions. It exists for testing and demonstration without a
//! live kernel.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use mpath_core::config::Config;
use mpath_core::configure::coalesce_paths;
use mpath_core::dm::FakeDmClient;
use mpath_core::path::Path as MPath;
use mpath_core::multipath::Vectors;
use mpath_core::store::{bindings_store, wwids_store};

/// Run one reconciliation pass over a static path inventory.
#[derive(Debug, Parser)]
#[command(name = "mpathctl", version, about)]
struct Opts {
    /// Main `multipath.conf`-style config file. Builtin defaults are used
    /// if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of overlay config snippets, applied after `--config` in
    /// filename order.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// JSON file describing the discovered paths for this pass (see
    /// [`PathInput`]). Required; there is no live kernel discovery here.
    #[arg(long)]
    paths: PathBuf,

    /// Directory to hold the wwids/bindings on-disk stores for this run.
    /// A fresh temporary directory is used if omitted.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Resolve configuration and print the planned actions without
    /// touching the (fake) device-mapper client.
    #[arg(long)]
    dry_run: bool,

    /// Reload every map's target table even if nothing else changed.
    #[arg(long)]
    force_reload: bool,

    /// Preserve the currently loaded hwhandler instead of reloading on a
    /// hwhandler-only change.
    #[arg(long)]
    retain_hwhandler: bool,

    /// Increase log verbosity; repeatable (`-v`, `-vv`, `-vvv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// One entry of the static, point-in-time path inventory consumed by
/// `--paths`. This is a deliberately simple input DTO, distinct from the
/// engine's own [`mpath_core::path::Path`], which carries non-serializable
/// checker/prioritizer handles.
#[derive(Debug, Deserialize)]
struct PathInput {
    dev: String,
    major: u32,
    minor: u32,
    #[serde(default = "default_host")]
    host: i32,
    #[serde(default)]
    channel: i32,
    #[serde(default)]
    target: i32,
    #[serde(default)]
    lun: i64,
    vendor: String,
    product: String,
    #[serde(default)]
    rev: String,
    #[serde(default)]
    serial: String,
    wwid: String,
    size: u64,
    #[serde(default)]
    marginal: bool,
}

fn default_host() -> i32 {
    mpath_core::path::ScsiAddress::NO_HOST
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "mpathctl=info,mpath_core=info",
        1 => "mpathctl=debug,mpath_core=debug",
        _ => "mpathctl=trace,mpath_core=trace",
    };
    mpath_utils::init_tracing(default_level);
}

fn load_config(opts: &Opts) -> Result<Config> {
    let mut config = Config::builtin_defaults();
    let main_contents = match &opts.config {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?,
        None => String::new(),
    };

    let mut overlay_owned = Vec::new();
    if let Some(dir) = &opts.config_dir {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("reading config directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        for path in entries {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading overlay file {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            overlay_owned.push((name, contents));
        }
    }
    let overlay_refs: Vec<(&str, &str)> = overlay_owned
        .iter()
        .map(|(name, contents)| (name.as_str(), contents.as_str()))
        .collect();

    let warnings = config.load(&main_contents, &overlay_refs);
    for w in &warnings {
        tracing::warn!(%w, "discarded config entry");
    }
    Ok(config)
}

fn load_inventory(path: &std::path::Path) -> Result<Vec<PathInput>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading path inventory {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing path inventory {}", path.display()))
}

fn build_vectors(config: &Config, inventory: Vec<PathInput>) -> Vectors {
    let mut vectors = Vectors::new();
    for input in inventory {
        let mut p = MPath::new(input.dev, (input.major, input.minor));
        p.sg_id.host = input.host;
        p.sg_id.channel = input.channel;
        p.sg_id.target = input.target;
        p.sg_id.lun = input.lun;
        p.vendor = input.vendor;
        p.product = input.product;
        p.rev = input.rev;
        p.serial = input.serial;
        p.wwid = input.wwid;
        p.size = input.size;
        p.marginal = input.marginal;
        p.state = mpath_core::path::PathState::Up;
        p.hwe = config.match_hwe(&p.vendor, &p.product, &p.rev);
        vectors.paths.insert(p);
    }
    vectors
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let config = load_config(&opts)?;
    let inventory = load_inventory(&opts.paths)?;
    let mut vectors = build_vectors(&config, inventory);

    let state_dir = match &opts.state_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("creating state dir {}", dir.display()))?;
            dir.clone()
        }
        None => {
            let dir = std::env::temp_dir().join(format!("mpathctl-{}", std::process::id()));
            fs::create_dir_all(&dir)?;
            dir
        }
    };
    let wwids = wwids_store(state_dir.join("wwids"));
    let bindings = bindings_store(state_dir.join("bindings"));
    let dm_client = FakeDmClient::new();

    let outcomes = coalesce_paths(
        &mut vectors,
        &config,
        &dm_client,
        &wwids,
        &bindings,
        opts.force_reload,
        opts.retain_hwhandler,
        opts.dry_run,
    );

    for outcome in &outcomes {
        let Some(map) = vectors.maps.get(outcome.map) else {
            continue;
        };
        println!("{}: {:?} -> {:?}", map.alias, outcome.action, outcome.result);
    }
    if outcomes.is_empty() {
        println!("no maps to reconcile");
    }

    Ok(())
}
