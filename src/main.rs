// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use avoidzones::config::{Settings, OSRM_ARTIFACT_EXTENSIONS};
use avoidzones::jobs::{CommandPipeline, JobRunner, JobStatus, NoPipeline, PenalizeJob, Pipeline};
use avoidzones::osm::{FileFormat, LocationIndexMode};
use avoidzones::penalize::{self, PenaltyFactors};
use avoidzones::scorer::{self, ScoreMode};
use avoidzones::store::{Version, VersionSelector, VersionStore};
use avoidzones::table;
use avoidzones::zones::ZoneIndex;

#[derive(Debug, thiserror::Error)]
#[error("{0}: {1}")]
struct FileError(PathBuf, #[source] avoidzones::Error);

#[derive(Parser)]
#[command(version, about = "Avoid-zone penalties for OpenStreetMap road networks and routes")]
struct Cli {
    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a FeatureCollection of avoid zones and activate it
    Apply {
        /// GeoJSON FeatureCollection with Polygon or MultiPolygon features
        config: PathBuf,

        #[command(flatten)]
        activation: Activation,
    },

    /// Activate a previously stored version
    Revert {
        /// Version to activate: "latest", "vN" or "N"
        version: VersionSelector,

        #[command(flatten)]
        activation: Activation,
    },

    /// Print a stored version
    Show {
        /// Version to print: "latest", "vN" or "N"
        #[arg(default_value = "latest")]
        version: VersionSelector,
    },

    /// List stored versions, newest first
    List,

    /// Delete all but the newest versions
    Cleanup {
        /// Number of versions to keep; 0 keeps everything
        #[arg(long, env = "AVOIDZONES_KEEP_COUNT")]
        keep: Option<usize>,
    },

    /// Convert avoid zones into a routing profile table
    Project {
        config: PathBuf,

        /// Output Lua file; printed to stdout if not provided
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Tag ways of an OSM file inside or touching avoid zones
    Penalize {
        /// Input OSM file (.osm, .osm.gz or .osm.bz2)
        input: PathBuf,

        /// GeoJSON avoid zones
        zones: PathBuf,

        /// Output OSM file
        output: PathBuf,

        #[command(flatten)]
        options: PenalizeArgs,
    },

    /// Score GeoJSON LineString routes against avoid zones
    Score {
        /// GeoJSON avoid zones
        zones: PathBuf,

        /// GeoJSON routes - LineString features
        routes: PathBuf,

        /// "filter" drops routes crossing any zone, "penalize" orders routes by overlap
        #[arg(long, default_value = "penalize")]
        mode: ScoreMode,
    },
}

#[derive(clap::Args)]
struct Activation {
    /// Store a new version even if an identical one exists
    #[arg(long)]
    no_dedupe: bool,

    /// Only store the version and write the zone table
    #[arg(long)]
    skip_penalize: bool,

    /// Preprocessing command run after penalizing, "{dataset}" is replaced by
    /// the penalized file path. May be repeated.
    #[arg(long = "stage", value_name = "COMMAND")]
    stages: Vec<String>,

    /// Command restarting the routing engine after successful preprocessing
    #[arg(long, value_name = "COMMAND")]
    restart: Option<String>,

    /// Time limit of every preprocessing stage, in seconds
    #[arg(long, value_name = "SECONDS")]
    stage_timeout: Option<u64>,

    #[command(flatten)]
    options: PenalizeArgs,
}

#[derive(clap::Args)]
struct PenalizeArgs {
    /// Node location store: dense_mmap_array or flex_mem
    #[arg(long, env = "AVOIDZONES_LOCATION_STORE")]
    location_store: Option<LocationIndexMode>,

    /// Factor of ways inside avoid zones
    #[arg(long, env = "AVOIDZONES_INSIDE_FACTOR")]
    inside_factor: Option<f64>,

    /// Factor of ways touching avoid zones
    #[arg(long, env = "AVOIDZONES_TOUCH_FACTOR")]
    touch_factor: Option<f64>,

    /// Format of the input file, detected from contents and extension by default
    #[arg(long)]
    input_format: Option<FileFormat>,
}

impl PenalizeArgs {
    fn options(&self, settings: &Settings) -> penalize::Options {
        penalize::Options {
            factors: PenaltyFactors {
                inside: self.inside_factor.unwrap_or(settings.inside_factor),
                touching: self.touch_factor.unwrap_or(settings.touch_factor),
            },
            location_mode: self.location_store.unwrap_or(settings.location_mode),
            input_format: self.input_format.unwrap_or_default(),
            output_format: FileFormat::Unknown,
        }
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut logger = colog::default_builder();
    logger.filter_level(if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    logger.init();

    let settings = Settings::from_env()?;
    let store = VersionStore::new(&settings.history_dir);

    match cli.command {
        Command::Apply { config, activation } => {
            let config = read_json(&config)?;
            let (version, is_new) = store.save(&config, !activation.no_dedupe)?;
            activate(&settings, &config, &activation)?;
            print_json(&json!({
                "version": version,
                "filename": version.filename(),
                "is_new": is_new,
            }))?;
        }

        Command::Revert {
            version,
            activation,
        } => {
            let config = store.load(version)?;
            activate(&settings, &config, &activation)?;
            print_json(&json!({"status": "reverted", "version": selected(&store, version)?}))?;
        }

        Command::Show { version } => print_json(&store.load(version)?)?,

        Command::List => print_json(&store.list()?)?,

        Command::Cleanup { keep } => {
            let deleted = store.cleanup(keep.unwrap_or(settings.keep_count))?;
            print_json(&json!({ "deleted": deleted }))?;
        }

        Command::Project { config, output } => match output {
            Some(output) => {
                if !table::write_table_file(&config, &output) {
                    return Err(format!("failed to write {}", output.display()).into());
                }
            }
            None => print!("{}", table::project_file(&config)),
        },

        Command::Penalize {
            input,
            zones,
            output,
            options,
        } => {
            let stats = penalize::penalize(&input, &zones, &output, &options.options(&settings))?;
            print_json(&stats)?;
        }

        Command::Score {
            zones,
            routes,
            mode,
        } => {
            let zones = ZoneIndex::from_file(&zones).map_err(|e| FileError(zones, e))?;
            let routes = scorer::parse_routes(&read_json(&routes)?);
            let scored = mode.apply(routes, &zones, |r| &r.line);
            print_json(&scored)?;
        }
    }

    Ok(())
}

/// Makes a configuration the active one: writes the zone table for the routing profile,
/// and (unless skipped) rewrites the road network in a background job, waiting for it to finish.
fn activate(settings: &Settings, config: &Value, activation: &Activation) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = settings.latest_zones.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&settings.latest_zones, serde_json::to_string_pretty(config)?)?;

    // The table is best-effort, activation continues without it
    table::write_table_file(&settings.latest_zones, &settings.zone_table_path);

    if activation.skip_penalize {
        return Ok(());
    }

    let runner = JobRunner::new(pipeline(activation));
    runner.submit(PenalizeJob {
        input: settings.input_dataset.clone(),
        zone_config: settings.latest_zones.clone(),
        output: settings.output_dataset.clone(),
        options: activation.options.options(settings),
    })?;

    match runner.wait() {
        JobStatus::Succeeded { stats, .. } => {
            log::info!(
                "{} written ({} ways inside, {} touching avoid zones)",
                settings.output_dataset.display(),
                stats.inside,
                stats.touching
            );
            Ok(())
        }
        JobStatus::Failed { error, .. } => Err(error.into()),
        JobStatus::Idle | JobStatus::Running { .. } => Err("penalizer job was lost".into()),
    }
}

fn pipeline(activation: &Activation) -> Box<dyn Pipeline> {
    if activation.stages.is_empty() && activation.restart.is_none() {
        return Box::new(NoPipeline);
    }

    let split = |command: &str| command.split_whitespace().map(str::to_string).collect::<Vec<_>>();
    Box::new(CommandPipeline {
        stages: activation.stages.iter().map(|s| split(s)).collect(),
        artifact_extensions: if activation.stages.is_empty() {
            Vec::new()
        } else {
            OSRM_ARTIFACT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
        },
        restart: activation.restart.as_deref().map(split),
        stage_timeout: activation.stage_timeout.map(Duration::from_secs),
    })
}

fn selected(store: &VersionStore, selector: VersionSelector) -> avoidzones::Result<Version> {
    match selector {
        VersionSelector::Exact(v) => Ok(v),
        VersionSelector::Latest => store
            .latest()?
            .ok_or_else(|| avoidzones::Error::NotFound("no versions stored".to_string())),
    }
}

fn read_json(path: &Path) -> Result<Value, FileError> {
    fs::read(path)
        .map_err(avoidzones::Error::from)
        .and_then(|data| serde_json::from_slice(&data).map_err(avoidzones::Error::from))
        .map_err(|e| FileError(path.to_path_buf(), e))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
