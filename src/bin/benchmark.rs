//! Grouped aggregation benchmark over synthetic session output.
//!
//! Run with: cargo run --release --bin benchmark -- [records] [iterations]
//!
//! Engine settings come from SHOAL_* environment variables; RUST_LOG
//! controls logging (default: shoal=info).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal::{
    EngineConfig, FeatureColumn, FeatureTable, FilterDescriptor, GroupRequest, Relation, StatsEngine, Summary,
    ValueStoreBuilder,
};

const NODE_TYPES: &[&str] = &["gas", "coal", "wind", "solar", "hydro", "nuclear", "storage"];
const REGIONS: &[&str] = &["north", "south", "east", "west", "central"];
const TAGS: &[&str] = &["peaker", "baseload", "coastal", "retired", "expansion"];

fn generate(records: usize, rng: &mut StdRng) -> Result<(shoal::ValueStore, FeatureTable), Box<dyn std::error::Error>> {
    let capacity: Vec<f64> = (0..records).map(|_| rng.gen_range(10.0..1500.0)).collect();
    let output: Vec<f64> = capacity.iter().map(|c| c * rng.gen_range(0.0..1.0)).collect();
    let cost: Vec<f64> = (0..records)
        .map(|_| if rng.gen_bool(0.02) { f64::NAN } else { rng.gen_range(5.0..120.0) })
        .collect();
    let year: Vec<Option<f64>> = (0..records)
        .map(|_| Some(2020.0 + 5.0 * rng.gen_range(0..6) as f64))
        .collect();

    let node_types: Vec<Option<&str>> = (0..records)
        .map(|_| Some(NODE_TYPES[rng.gen_range(0..NODE_TYPES.len())]))
        .collect();
    let regions: Vec<Option<&str>> = (0..records)
        .map(|_| {
            if rng.gen_bool(0.01) {
                None
            } else {
                Some(REGIONS[rng.gen_range(0..REGIONS.len())])
            }
        })
        .collect();
    let tags: Vec<Vec<&str>> = (0..records)
        .map(|_| TAGS.iter().copied().filter(|_| rng.gen_bool(0.2)).collect())
        .collect();

    let store = ValueStoreBuilder::new()
        .column("capacity_mw", capacity)
        .column("output_mw", output)
        .column("cost", cost)
        .build()?;
    let features = FeatureTable::new(records)
        .with_column("node_type", FeatureColumn::categorical(&node_types))?
        .with_column("region", FeatureColumn::categorical(&regions))?
        .with_column("year", FeatureColumn::numeric(year))?
        .with_column("tags", FeatureColumn::tags(&tags))?;

    Ok((store, features))
}

struct Timing {
    samples: Vec<Duration>,
}

impl Timing {
    fn mean(&self) -> Duration {
        self.samples.iter().sum::<Duration>() / self.samples.len().max(1) as u32
    }

    fn percentile(&self, p: f64) -> Duration {
        let mut sorted = self.samples.clone();
        sorted.sort();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx).copied().unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "shoal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let records: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(200_000);
    let iterations: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(5);

    // Results are compared across runs, so never cache them here
    let config = EngineConfig {
        cache_capacity: 0,
        ..EngineConfig::from_env()
    };

    println!("Shoal Benchmark");
    println!("===============");
    println!("Records:         {}", records);
    println!("Iterations:      {}", iterations);
    println!("Workers:         {}", config.worker_threads);
    println!("Threshold:       {}", config.parallel_threshold);
    println!();

    let mut rng = StdRng::seed_from_u64(7);
    let start = Instant::now();
    let (store, features) = generate(records, &mut rng)?;
    println!("Generated data in {:?} ({} bytes of statistics)", start.elapsed(), store.memory_usage());
    println!();

    let engine = StatsEngine::new(store, features, config)?;

    let workloads: Vec<(&str, GroupRequest)> = vec![
        (
            "pick by node type",
            GroupRequest::new("output_mw").group_by("node_type"),
        ),
        (
            "capacity factor by region/type",
            GroupRequest::new("output_mw / capacity_mw * 100")
                .group_by("region")
                .group_by("node_type")
                .summary(Summary::Mean),
        ),
        (
            "share of group output",
            GroupRequest::new("output_mw / groupSum(output_mw)")
                .group_by("region")
                .summary(Summary::Max),
        ),
        (
            "filtered cost p90",
            GroupRequest::new("cost * output_mw")
                .group_by_all(&["region", "year"])
                .filter(FilterDescriptor::feature("tags", Relation::Exc, vec!["retired"]))
                .filter(FilterDescriptor::stat("capacity_mw", Relation::Gte, 100.0))
                .summary(Summary::Percentile(90.0)),
        ),
    ];

    for (name, request) in &workloads {
        print!("{:<32}", name);
        let mut timing = Timing { samples: Vec::with_capacity(iterations) };
        let mut leaves = 0;
        let mut degraded = false;

        for _ in 0..iterations {
            let run_start = Instant::now();
            let result = engine.run(request).await?;
            timing.samples.push(run_start.elapsed());
            leaves = result.leaf_count();
            degraded = result.is_degraded();
        }

        println!(
            "leaves={:<5} mean={:?} p50={:?} max={:?}{}",
            leaves,
            timing.mean(),
            timing.percentile(0.5),
            timing.percentile(1.0),
            if degraded { " (degraded)" } else { "" }
        );
    }

    if let Some(stats) = engine.pool_stats() {
        println!();
        println!(
            "Worker pool: {} threads, {} jobs completed, {} timed out",
            stats.threads, stats.completed, stats.timed_out
        );
    }

    Ok(())
}
