use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use visual_runtime_core::{AppConfig, DisplayList, PluginLoader, Visualiser, VisualError};

fn main() -> visual_runtime_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Units { dir } => list_units(&config, &dir),
        Commands::Schema { dir, identity } => print_schema(&config, &dir, &identity),
        Commands::Run {
            plugins,
            preset,
            frames,
            width,
            height,
        } => run_headless(config, plugins, preset.as_deref(), frames, (width, height)),
    }
}

fn discover(config: &AppConfig, dir: &Path) -> visual_runtime_core::Result<PluginLoader> {
    let mut loader = PluginLoader::new(&config.plugins);
    let loaded = loader.discover(dir)?;
    tracing::info!(path = %dir.display(), loaded, "plugins discovered");
    Ok(loader)
}

fn list_units(config: &AppConfig, dir: &Path) -> visual_runtime_core::Result<()> {
    let loader = discover(config, dir)?;
    for identity in loader.identities() {
        println!("{identity}");
    }
    for (source, message) in loader.errors() {
        tracing::warn!(%source, %message, "unit unavailable");
    }
    Ok(())
}

fn print_schema(config: &AppConfig, dir: &Path, identity: &str) -> visual_runtime_core::Result<()> {
    let loader = discover(config, dir)?;
    let handle = loader
        .lookup(identity)
        .ok_or_else(|| VisualError::msg(format!("no unit named `{identity}`")))?;
    let schema = handle.config_schema(Instant::now());
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn run_headless(
    mut config: AppConfig,
    plugins: PathBuf,
    preset: Option<&Path>,
    frames: u64,
    (width, height): (u32, u32),
) -> visual_runtime_core::Result<()> {
    config.plugins.directory = plugins;
    let mut visualiser = Visualiser::new(config);
    if let Some(preset) = preset {
        visualiser.load_preset(preset, Instant::now())?;
    }

    let mut surface = DisplayList::new(width, height);
    let start = Instant::now();
    let interval = visualiser.scheduler().frame_interval();
    for frame in 0..frames {
        let now = start + interval.mul_f64(frame as f64);
        let report = visualiser.render_frame(&mut surface, now);
        if let Some(fps) = report.fps {
            tracing::info!(fps, "frame rate");
        }
        surface.take_commands();
    }

    for (source, message) in visualiser.errors() {
        tracing::warn!(%source, %message, "unit error");
    }
    visualiser.shutdown(None);

    println!(
        "{} frames, active unit `{}`, {} fps",
        visualiser.frame_count(),
        visualiser.active_identity(),
        visualiser
            .fps()
            .map_or_else(|| "n/a".to_string(), |fps| fps.to_string())
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Hot-reloadable, audio-reactive visual runtime", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every unit discovered in a plugin directory.
    Units {
        dir: PathBuf,
    },
    /// Print the configuration schema of one unit as JSON.
    Schema {
        dir: PathBuf,
        identity: String,
    },
    /// Render frames against an offscreen display list.
    Run {
        #[arg(long)]
        plugins: PathBuf,
        /// Preset file or bundle directory to apply first.
        #[arg(long)]
        preset: Option<PathBuf>,
        #[arg(long, default_value_t = 220)]
        frames: u64,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 360)]
        height: u32,
    },
}
