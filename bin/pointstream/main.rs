//! Builds synthetic point cloud containers and streams them with simulated clients.

use pointstream::cloud::core::geometry::Aabb;
use pointstream::cloud::core::glam::DVec3;
use pointstream::cloud::source::{OpenMode, SourceRegistry};
use pointstream::cloud::{ContainerBuilder, PointSet, ViewDistance};
use pointstream::{Config, Engine};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pointstream")]
#[command(about = "Point cloud voxel streaming")]
struct Args {
    /// RON configuration file. Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes a container holding a synthetic terrain scan.
    Build {
        output: PathBuf,
        #[arg(long, default_value_t = 200_000)]
        points: usize,
    },
    /// Streams a container to clients orbiting over it.
    Stream {
        /// Data source URL, e.g. a path or `file://path`.
        url: String,
        #[arg(long, default_value_t = 2)]
        clients: u32,
        #[arg(long, default_value_t = 16)]
        frames: u32,
        #[arg(long, default_value_t = 4.0)]
        detail: f64,
        /// Overrides the cache ceiling.
        #[arg(long)]
        ceiling_mib: Option<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let path = path.to_string_lossy();
            Config::read_file(&path).with_context(|| format!("Failed to read config {}", path))?
        }
        None => Config::default(),
    };
    config.validate().context("Invalid config")?;

    match args.command {
        Command::Build { output, points } => build(&config, &output, points),
        Command::Stream {
            url,
            clients,
            frames,
            detail,
            ceiling_mib,
        } => {
            let mut config = config;
            if let Some(mib) = ceiling_mib {
                config.cache.ceiling_bytes = mib << 20;
            }
            stream(config, &url, clients, frames, detail)
        }
    }
}

/// Rolling terrain sampled on a low-discrepancy sequence, colored by height.
fn terrain(n: usize) -> PointSet {
    const G1: f64 = 0.754_877_666_246_692_7;
    const G2: f64 = 0.569_840_290_998_053_3;

    let mut positions = Vec::with_capacity(n);
    let mut rgb = Vec::with_capacity(n);
    let mut intensity = Vec::with_capacity(n);
    for i in 0..n {
        let x = (0.5 + G1 * i as f64).fract() * 100.0;
        let y = (0.5 + G2 * i as f64).fract() * 100.0;
        let z = 6.0 * (x / 13.0).sin() * (y / 17.0).cos() + 0.05 * (i % 7) as f64;
        let shade = ((z + 6.5) / 13.0 * 255.0).clamp(0.0, 255.0) as u8;
        positions.push(DVec3::new(x, y, z));
        rgb.push([shade / 2, shade, 255 - shade]);
        intensity.push((i % 4096) as u16);
    }
    PointSet::new(positions).with_rgb(rgb).with_intensity(intensity)
}

fn build(config: &Config, output: &Path, points: usize) -> Result<()> {
    let url = output.to_string_lossy();
    let mut sink = SourceRegistry::default()
        .open(&url, OpenMode::Create)
        .with_context(|| format!("Failed to create {}", url))?;
    let summary = ContainerBuilder::new(config.build)
        .write(&terrain(points), &mut *sink)
        .context("Failed to build container")?;
    sink.close();

    println!(
        "Wrote {}: {} points in {} voxels ({} leaves), {} bytes",
        url, summary.total_points, summary.voxels, summary.leaf_voxels, summary.bytes
    );
    Ok(())
}

fn stream(config: Config, url: &str, clients: u32, frames: u32, detail: f64) -> Result<()> {
    let engine = Engine::open(config, &SourceRegistry::default(), url)
        .with_context(|| format!("Failed to open {}", url))?;
    let bounds = *engine.tree().root_bounds();
    let center = bounds.center();
    let orbit = bounds.size().max_element() * 0.35;

    let observer = |client: u32, frame: u32| {
        let phase = TAU * (client as f64 / clients.max(1) as f64 + frame as f64 / frames.max(1) as f64);
        center + DVec3::new(orbit * phase.cos(), orbit * phase.sin(), 0.0)
    };

    let ids: Vec<_> = (0..clients)
        .map(|c| engine.connect(ViewDistance::new(observer(c, 0), detail)))
        .collect();

    for frame in 0..frames {
        let mut visited = 0;
        let mut queued = 0;
        let mut coalesced = 0;
        for (c, &client) in ids.iter().enumerate() {
            let eye = observer(c as u32, frame);
            engine.set_policy(client, ViewDistance::new(eye, detail))?;
            let area = Aabb::new(eye - DVec3::splat(orbit), eye + DVec3::splat(orbit));
            let report = engine.query(client, &area)?;
            visited += report.visited;
            queued += report.queued;
            coalesced += report.coalesced;
        }
        engine.wait_idle(Duration::from_secs(5));
        let pump = engine.pump();
        println!(
            "frame {:>3}: visited {:>5}, queued {:>4}, coalesced {:>4} | resident {:>5} ({:>8} KiB), evicted {:>3}{}",
            frame,
            visited,
            queued,
            coalesced,
            pump.cache.resident_payloads,
            pump.cache.resident_bytes >> 10,
            pump.reclaim.evicted(),
            if pump.reclaim.is_over_ceiling() { " (over ceiling)" } else { "" }
        );
    }

    let stats = engine.scheduler().stats();
    println!(
        "fetches: {} completed, {} coalesced, {} cancelled, {} retried, {} failed, {} us average",
        stats.completed,
        stats.coalesced,
        stats.cancelled,
        stats.retried,
        stats.failed,
        stats.average_fetch_us
    );
    for client in ids {
        engine.disconnect(client);
    }
    let cache = engine.teardown();
    println!(
        "cache: {} inserts, {} superseded, {} coarsened, {} evictions ({} KiB), {} over-ceiling events",
        cache.inserts,
        cache.superseded,
        cache.coarsened,
        cache.evictions,
        cache.evicted_bytes >> 10,
        cache.over_ceiling_events
    );
    Ok(())
}
