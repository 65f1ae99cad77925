use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use llm_fleet_sim::metrics::{print_table, write_csv, MetricsSummary};
use llm_fleet_sim::simulator::ClassParams;
use llm_fleet_sim::{OutputSizeEstimate, RoutingPolicy, SimConfig, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about = "Discrete-event simulator for a load-balanced LLM inference fleet")]
struct Args {
    /// Number of servers in the fleet
    #[arg(long, default_value_t = 6)]
    number_of_servers: usize,

    /// Requests to generate per SLO class, per run
    #[arg(long, default_value_t = 2500)]
    no_of_messages: usize,

    /// Routing policies to compare, comma-separated, or "all"
    #[arg(long, default_value = "random")]
    routing_type: String,

    /// Arrival rates for the latency-critical (class 1 / "lo") traffic,
    /// comma-separated; index `i` pairs with `--rates-hi`'s index `i` to form
    /// one scenario
    #[arg(long, default_value = "10,20,30")]
    rates_lo: String,

    /// Arrival rates for the best-effort (class 2 / "hi") traffic, comma-
    /// separated, parallel to `--rates-lo`
    #[arg(long, default_value = "10,20,30")]
    rates_hi: String,

    /// Mean/std prompt and output sizes for class 1 ("lo")
    #[arg(long, default_value_t = 202.0)]
    mean_request_size_1: f64,
    #[arg(long, default_value_t = 20.0)]
    std_request_size_1: f64,
    #[arg(long, default_value_t = 179.0)]
    mean_output_size_1: f64,
    #[arg(long, default_value_t = 17.0)]
    std_output_size_1: f64,
    #[arg(long, default_value_t = 0.025)]
    target_latency_lo: f64,
    #[arg(long, default_value = "lo")]
    prefix_latency_lo: String,

    /// Mean/std prompt and output sizes for class 2 ("hi")
    #[arg(long, default_value_t = 202.0)]
    mean_request_size_2: f64,
    #[arg(long, default_value_t = 20.0)]
    std_request_size_2: f64,
    #[arg(long, default_value_t = 179.0)]
    mean_output_size_2: f64,
    #[arg(long, default_value_t = 17.0)]
    std_output_size_2: f64,
    #[arg(long, default_value_t = 0.5)]
    target_latency_hi: f64,
    #[arg(long, default_value = "hi")]
    prefix_latency_hi: String,

    /// Pending-token occupancy, averaged over the fleet, at which arrivals
    /// queue instead of routing directly; `+inf` disables queueing
    #[arg(long, default_value_t = f64::INFINITY)]
    queueing_perc: f64,

    /// How a candidate's not-yet-known output length is estimated for the
    /// per-token latency formulas used by `leastlatency`/`smart`
    #[arg(long, default_value = "mean")]
    estimated_output_size: String,

    /// Per-class admission queue capacity before late requests are dropped
    #[arg(long, default_value_t = 256)]
    max_prefill_queue_size: usize,

    /// Drop the oldest queued request once a class queue exceeds capacity,
    /// instead of letting it grow unbounded
    #[arg(long)]
    drop_late_requests: bool,

    /// Optional TOML file overriding the batching/KV configuration table
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed; omit for a fresh seed sourced from entropy each run
    #[arg(long)]
    seed: Option<u64>,

    /// Write the summary table to this CSV path
    #[arg(long, default_value = "result.csv")]
    output_file: PathBuf,

    /// Suppress the human-readable table, only emit CSV
    #[arg(short, long)]
    quiet: bool,
}

fn parse_routing_types(s: &str) -> Vec<RoutingPolicy> {
    if s == "all" {
        return vec![
            RoutingPolicy::Random,
            RoutingPolicy::Least,
            RoutingPolicy::LeastPseudo,
            RoutingPolicy::LeastLatency,
            RoutingPolicy::Smart,
        ];
    }
    s.split(',').filter_map(|name| RoutingPolicy::from_name(name.trim())).collect()
}

fn parse_rates(flag: &str, s: &str) -> anyhow::Result<Vec<f64>> {
    s.split(',')
        .map(|rate| rate.trim().parse::<f64>().with_context(|| format!("parsing {flag} entry")))
        .collect()
}

/// §7 Configuration errors: missing/inconsistent rate lists, negative sizes,
/// or `queueing_perc` outside `[0, ∞]`, checked before a single event is
/// scheduled.
fn validate_args(args: &Args, rates_lo: &[f64], rates_hi: &[f64]) -> anyhow::Result<()> {
    if rates_lo.is_empty() || rates_hi.is_empty() {
        anyhow::bail!("--rates-lo and --rates-hi must each name at least one arrival rate");
    }
    if rates_lo.len() != rates_hi.len() {
        anyhow::bail!(
            "--rates-lo and --rates-hi must have the same length ({} vs {})",
            rates_lo.len(),
            rates_hi.len()
        );
    }
    for (flag, rates) in [("--rates-lo", rates_lo), ("--rates-hi", rates_hi)] {
        if rates.iter().any(|&r| r < 0.0 || !r.is_finite()) {
            anyhow::bail!("{flag} entries must be finite and non-negative");
        }
    }
    if args.queueing_perc < 0.0 {
        anyhow::bail!("--queueing-perc must be within [0, inf]");
    }
    for (name, value) in [
        ("--mean-request-size-1", args.mean_request_size_1),
        ("--std-request-size-1", args.std_request_size_1),
        ("--mean-output-size-1", args.mean_output_size_1),
        ("--std-output-size-1", args.std_output_size_1),
        ("--mean-request-size-2", args.mean_request_size_2),
        ("--std-request-size-2", args.std_request_size_2),
        ("--mean-output-size-2", args.mean_output_size_2),
        ("--std-output-size-2", args.std_output_size_2),
    ] {
        if value < 0.0 {
            anyhow::bail!("{name} must be non-negative");
        }
    }
    if args.number_of_servers == 0 {
        anyhow::bail!("--number-of-servers must be > 0");
    }
    if OutputSizeEstimate::from_name(&args.estimated_output_size).is_none() {
        anyhow::bail!("--estimated-output-size must be one of: mean, p95");
    }
    Ok(())
}

fn build_classes(args: &Args, rate_lo: f64, rate_hi: f64) -> Vec<ClassParams> {
    vec![
        ClassParams {
            prefix: args.prefix_latency_lo.clone(),
            rate: rate_lo,
            input_mean: args.mean_request_size_1,
            input_std: args.std_request_size_1,
            output_mean: args.mean_output_size_1,
            output_std: args.std_output_size_1,
            target_latency: args.target_latency_lo,
            lora: None,
        },
        ClassParams {
            prefix: args.prefix_latency_hi.clone(),
            rate: rate_hi,
            input_mean: args.mean_request_size_2,
            input_std: args.std_request_size_2,
            output_mean: args.mean_output_size_2,
            output_std: args.std_output_size_2,
            target_latency: args.target_latency_hi,
            lora: None,
        },
    ]
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    cfg.validate()?;

    let routing_types = parse_routing_types(&args.routing_type);
    let rates_lo = parse_rates("--rates-lo", &args.rates_lo)?;
    let rates_hi = parse_rates("--rates-hi", &args.rates_hi)?;
    validate_args(&args, &rates_lo, &rates_hi)?;
    let estimated_output_size = OutputSizeEstimate::from_name(&args.estimated_output_size)
        .expect("validated by validate_args");

    if !args.quiet {
        println!("LLM fleet simulator");
        println!("====================");
        println!("Servers: {}", args.number_of_servers);
        println!("Messages per class per run: {}", args.no_of_messages);
        println!(
            "Routing policies: {:?}",
            routing_types.iter().map(|p| p.name()).collect::<Vec<_>>()
        );
        println!("Rates (lo): {:?}", rates_lo);
        println!("Rates (hi): {:?}", rates_hi);
        println!();
    }

    let mut summaries: Vec<MetricsSummary> = Vec::new();
    let total_runs = routing_types.len() * rates_lo.len();
    let mut run_idx = 0;

    for policy in &routing_types {
        for (rate_index, (&rate_lo, &rate_hi)) in rates_lo.iter().zip(rates_hi.iter()).enumerate() {
            run_idx += 1;
            if !args.quiet {
                println!("[{run_idx}/{total_runs}] {} @ rates lo={rate_lo} hi={rate_hi}", policy.name());
            }

            let classes = build_classes(&args, rate_lo, rate_hi);
            let seed = args.seed.unwrap_or_else(|| rate_index as u64 ^ (run_idx as u64) << 32);

            let sim = Simulator::new(
                cfg.clone(),
                args.number_of_servers,
                *policy,
                classes,
                args.no_of_messages,
                rate_index,
                args.queueing_perc,
                args.max_prefill_queue_size,
                args.drop_late_requests,
                estimated_output_size,
                seed,
            );

            let summary = sim.run()?;
            summaries.push(summary);
        }
    }

    if !args.quiet {
        print_table(&summaries);
    }

    let file = File::create(&args.output_file)
        .with_context(|| format!("creating output file {}", args.output_file.display()))?;
    let mut writer = BufWriter::new(file);
    write_csv(&mut writer, &summaries).context("writing CSV output")?;

    if !args.quiet {
        println!("Results written to: {}", args.output_file.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
