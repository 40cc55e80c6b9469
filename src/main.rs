use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use padus_tiles::builder::TileBuilder;
use padus_tiles::config::Config;
use padus_tiles::etl;
use padus_tiles::mbtiles::TileStore;
use padus_tiles::server::{self, StoreHandle};

#[derive(Parser, Debug)]
#[command(name = "padus-tiles", about = "Land-ownership vector tiles: prepare, build and serve")]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, default_value = "padus-tiles.toml")]
    config: PathBuf,

    /// Source dataset (overrides etl.input)
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Tile artifact (overrides tiles.artifact_path)
    #[arg(long, global = true)]
    artifact: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate, classify and dissolve the source; write the bulk export
    Prepare,
    /// Prepare, then build and publish the tile artifact
    Build,
    /// Serve tiles from the published artifact
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print artifact metadata and per-zoom tile counts
    Inspect,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_file_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;
    if let Some(input) = &cli.input {
        config.etl.input = input.clone();
    }
    if let Some(artifact) = &cli.artifact {
        config.tiles.artifact_path = artifact.clone();
    }
    if let Command::Serve { bind: Some(bind) } = &cli.command {
        config.server.bind = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

fn inspect(config: &Config) -> Result<()> {
    let store = TileStore::open(&config.tiles.artifact_path)?;
    let metadata = store.metadata();
    println!("artifact:  {}", store.path().display());
    println!("name:      {}", metadata.name);
    println!("format:    {}", metadata.format);
    println!("zooms:     {}..={}", metadata.min_zoom, metadata.max_zoom);
    println!(
        "bounds:    {:.6},{:.6},{:.6},{:.6}",
        metadata.bounds[0], metadata.bounds[1], metadata.bounds[2], metadata.bounds[3]
    );
    for layer in &metadata.vector_layers {
        println!("layer:     {} z{}..={}", layer.id, layer.minzoom, layer.maxzoom);
    }
    let mut total = 0;
    for (z, count) in store.zoom_counts()? {
        println!("z{:<2}       {} tiles", z, count);
        total += count;
    }
    println!("total:     {} tiles", total);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Prepare => {
            let etl_config = config.etl.clone();
            tokio::task::spawn_blocking(move || etl::run(&etl_config)).await??;
        }
        Command::Build => {
            let etl_config = config.etl.clone();
            let tiles_config = config.tiles.clone();
            let summary = tokio::task::spawn_blocking(move || -> Result<_> {
                let output = etl::run(&etl_config)?;
                let summary = TileBuilder::new(tiles_config).build(&output.features, &output.dissolved)?;
                Ok(summary)
            })
            .await??;
            info!("Build complete:\n{}", summary);
        }
        Command::Serve { .. } => {
            let store = match StoreHandle::open(&config.tiles.artifact_path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Refusing to serve: {}", e);
                    return Err(e.into());
                }
            };
            server::serve(&config.server, store, config.etl.export_path.clone()).await?;
        }
        Command::Inspect => inspect(&config)?,
    }

    Ok(())
}
