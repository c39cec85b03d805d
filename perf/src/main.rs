use clap::Parser;
use kestrel::internal::anchor::resolve_with_threshold;
use kestrel::reexports::hifitime::TimeUnits;
use kestrel::*;
use rand::Rng;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of directives in the generated plan
    #[arg(short, long)]
    num_activities: usize,

    /// Fraction of directives anchored to an earlier directive
    #[arg(short, long, default_value_t = 0.8)]
    anchored: f64,

    /// Chunk size below which anchor resolution stops splitting
    #[arg(short, long, default_value_t = 400)]
    threshold: usize,

    /// How many times each measurement is repeated
    #[arg(short, long, default_value_t = 5)]
    repeats: usize,
}

fn random_plan(args: &Args) -> Schedule {
    let mut rng = rand::rng();
    (0..args.num_activities as u64)
        .map(|n| {
            let activity = SerializedActivity::without_arguments("Noop");
            let directive =
                ActivityDirective::new(rng.random_range(-60i64..3600).seconds(), activity);
            let directive = if n > 0 && rng.random_bool(args.anchored) {
                directive.anchored_to(ActivityDirectiveId::new(rng.random_range(0..n)), rng.random())
            } else {
                directive
            };
            (ActivityDirectiveId::new(n), directive)
        })
        .collect()
}

fn time<T>(repeats: usize, mut f: impl FnMut() -> Result<T>) -> Result<Duration> {
    let start = Instant::now();
    for _ in 0..repeats {
        f()?;
    }
    let per_run = start.elapsed() / repeats.max(1) as u32;
    Ok(Duration::from_total_nanoseconds(per_run.as_nanos() as i128))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=warn,perf=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let plan = random_plan(&args);
    let plan_duration = 1.days();

    let sequential = time(args.repeats, || {
        Ok(resolve_with_threshold(&plan, plan_duration, usize::MAX)?)
    })?;
    let parallel = time(args.repeats, || {
        Ok(resolve_with_threshold(&plan, plan_duration, args.threshold)?)
    })?;
    tracing::info!(
        directives = args.num_activities,
        %sequential,
        %parallel,
        "anchor resolution"
    );

    let sequential_result = resolve_with_threshold(&plan, plan_duration, usize::MAX)?;
    let parallel_result = resolve_with_threshold(&plan, plan_duration, args.threshold)?;
    if sequential_result != parallel_result {
        bail!("parallel resolution disagrees with sequential resolution");
    }
    println!(
        "Resolved {} directives: sequential {sequential}, parallel {parallel}",
        sequential_result.len()
    );

    Ok(())
}
