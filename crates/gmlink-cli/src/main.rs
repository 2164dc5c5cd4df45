use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gmlink_core::WorldOrigin;
use gmlink_storage::LinkReader;
use gmlink_sync::{ArtifactId, LinkBuilder, LinkConfig};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gmlink")]
#[command(about = "Link CityGML buildings to OSM buildings")]
struct Cli {
    /// YAML configuration file; GMLINK_* variables and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Overrides {
    /// GeoPackage file, or a directory holding one.
    #[arg(long, global = true)]
    gpkg: Option<PathBuf>,
    #[arg(long, global = true)]
    gml_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    out_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    search_radius_m: Option<f64>,
    #[arg(long, global = true)]
    grid_cell_m: Option<f64>,
    #[arg(long, global = true, requires = "min_n")]
    min_e: Option<f64>,
    #[arg(long, global = true, requires = "min_e")]
    min_n: Option<f64>,
    #[arg(long, global = true)]
    scene_snapshot: Option<PathBuf>,
    /// Allow GML centroids from the scene snapshot when no CityGML folder is set.
    #[arg(long, global = true)]
    allow_scene_fallback: bool,
}

impl Overrides {
    fn apply(self, config: &mut LinkConfig) {
        if let Some(gpkg) = self.gpkg {
            config.gpkg_path = Some(gpkg);
        }
        if let Some(dir) = self.gml_dir {
            config.gml_dir = Some(dir);
        }
        if let Some(dir) = self.out_dir {
            config.out_dir = dir;
        }
        if let Some(radius) = self.search_radius_m {
            config.search_radius_m = radius;
        }
        if let Some(cell) = self.grid_cell_m {
            config.grid_cell_m = cell;
        }
        if let (Some(min_e), Some(min_n)) = (self.min_e, self.min_n) {
            config.world_origin = WorldOrigin::new(min_e, min_n);
        }
        if let Some(snapshot) = self.scene_snapshot {
            config.scene_snapshot = Some(snapshot);
        }
        if self.allow_scene_fallback {
            config.allow_scene_fallback = true;
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ForceTarget {
    Osm,
    Gml,
    Link,
}

impl From<ForceTarget> for ArtifactId {
    fn from(target: ForceTarget) -> Self {
        match target {
            ForceTarget::Osm => ArtifactId::OsmDb,
            ForceTarget::Gml => ArtifactId::GmlDb,
            ForceTarget::Link => ArtifactId::LinkDb,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build or refresh the OSM, GML and link databases.
    Build {
        /// Rebuild this artifact and everything downstream of it.
        #[arg(long, value_enum)]
        force: Vec<ForceTarget>,
    },
    /// Show which artifacts would be rebuilt, and why.
    Plan,
    /// Print the link row of one GML building as JSON.
    Lookup {
        #[arg(long)]
        tile: String,
        #[arg(long)]
        building_idx: i64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = LinkConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    tracing::debug!(config = ?config, "loaded configuration");

    match cli.command {
        Commands::Build { force } => {
            let builder = force
                .into_iter()
                .fold(LinkBuilder::new(config)?, |b, target| b.force(target.into()));
            let artifacts = builder.ensure_link_dbs().await?;
            let summary = artifacts.summary;
            println!("osm_db:  {}", artifacts.osm_db.display());
            println!("gml_db:  {}", artifacts.gml_db.display());
            println!("link_db: {}", artifacts.link_db.display());
            println!("report:  {}", artifacts.report.display());
            for rebuilt in &artifacts.rebuilt {
                println!("rebuilt {} ({})", rebuilt.id, rebuilt.reason);
            }
            println!(
                "tiles={} buildings={} matched={} unmatched={} suspicious={} match_rate={:.1}%",
                summary.tiles,
                summary.gml_buildings,
                summary.matched,
                summary.unmatched,
                summary.suspicious,
                summary.match_rate() * 100.0
            );
        }
        Commands::Plan => {
            for step in LinkBuilder::new(config)?.plan()? {
                match &step.reason {
                    Some(reason) => println!("{:<8} rebuild  {}  ({reason})", step.id, step.path.display()),
                    None => println!("{:<8} ok       {}", step.id, step.path.display()),
                }
            }
        }
        Commands::Lookup { tile, building_idx } => {
            let read = config.read_options();
            let paths = LinkBuilder::new(config)?.paths()?;
            let reader = LinkReader::open(&paths.link_db, &read)
                .await
                .with_context(|| format!("opening {}", paths.link_db.display()))?;
            let row = reader.get(&tile, building_idx).await;
            reader.close().await;
            let Some(row) = row? else {
                bail!("no link row for tile `{tile}` building {building_idx}");
            };
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
    }

    Ok(())
}
