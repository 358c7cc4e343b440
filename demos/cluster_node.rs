use bytemuck::{cast_slice, Zeroable};
use clap::Parser;
use cluster_sort::{
    bind, count_bucket_distribution, disk_dirs_for_inputs, run, shuffle, ClusterConfig, Config,
    NodeContext, Record, ShuffleReceipt, SortScope, Sorter,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
// use tracing_chrome::ChromeLayerBuilder;
// use tracing_subscriber::prelude::*;

/// Runs one node of a cluster-wide sort. Start the same command on every node listed in the cluster file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// This node's line number (from 0) in the cluster file.
    #[clap(short = 'i', long)]
    node_id: usize,
    /// One `host:port` per line.
    #[clap(short = 'c', long)]
    cluster_file: PathBuf,
    /// Local input files. Each file's directory is taken as a separate disk unless `--disk` is given.
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
    #[clap(short = 'd', long = "disk")]
    disks: Vec<PathBuf>,
    /// Overwrite every input with this many random records first.
    #[clap(short = 'g', long)]
    generate: Option<usize>,
    /// Only sort the buckets that start within this many records of the global order.
    #[clap(long)]
    first_records: Option<u64>,
    /// Fixes the bucket count instead of deriving it from `--records-per-node` and `--memory-bytes`.
    #[clap(long)]
    buckets_per_node: Option<usize>,
    /// The most records any node holds. Must be the same on every node.
    #[clap(long)]
    records_per_node: Option<u64>,
    /// Memory each node devotes to the sort. Must be the same on every node.
    #[clap(long)]
    memory_bytes: Option<u64>,
    /// Stream the sorted records to a `client_sink` listening here.
    #[clap(long)]
    client: Option<SocketAddr>,
    /// Print how the local inputs spread over the buckets, then exit.
    #[clap(long)]
    count_only: bool,
    #[clap(long)]
    shuffle_only: bool,
    /// Sort the output of an earlier `--shuffle-only` run.
    #[clap(long)]
    sort_only: bool,
}

fn generate_input(path: &PathBuf, num_records: usize, rng: &mut SmallRng) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut batch = vec![Record::zeroed(); 4096];
    let mut remaining = num_records;
    while remaining > 0 {
        let n = remaining.min(batch.len());
        for r in &mut batch[..n] {
            r.key = rng.gen();
            rng.fill(&mut r.payload[..]);
        }
        writer.write_all(cast_slice(&batch[..n]))?;
        remaining -= n;
    }
    writer.flush()
}

fn main() {
    let args = Args::parse();

    env_logger::init();
    // let (chrome_layer, _guard) = ChromeLayerBuilder::new().build();
    // tracing_subscriber::registry().with(chrome_layer).init();

    if let Some(n) = args.generate {
        let mut rng = SmallRng::from_entropy();
        for path in &args.inputs {
            generate_input(path, n, &mut rng).unwrap();
            log::info!("Wrote {n} random records to {}", path.display());
        }
    }

    let cluster = ClusterConfig::from_file(&args.cluster_file).unwrap();
    let disks = if args.disks.is_empty() {
        disk_dirs_for_inputs(&args.inputs).unwrap()
    } else {
        args.disks.clone()
    };
    let config = Config {
        buckets_per_node: args.buckets_per_node,
        records_per_node: args
            .records_per_node
            .or_else(|| args.generate.map(|n| (n * args.inputs.len()) as u64)),
        memory_bytes: args.memory_bytes,
        client_addr: args.client,
        ..Config::default()
    };
    let ctx = NodeContext::new(args.node_id, &cluster, args.inputs.clone(), disks, config).unwrap();
    let scope = args
        .first_records
        .map_or(SortScope::All, SortScope::FirstRecords);

    if args.count_only {
        let mut totals = vec![0; ctx.map().buckets()];
        for path in ctx.inputs() {
            let counts = count_bucket_distribution(path, ctx.map()).unwrap();
            totals.iter_mut().zip(counts).for_each(|(t, c)| *t += c);
        }
        for (bucket, count) in totals.iter().enumerate() {
            println!("{bucket}\t{count}");
        }
        return;
    }

    if args.sort_only && args.shuffle_only {
        log::error!("--sort-only and --shuffle-only are mutually exclusive");
        return;
    }
    if args.sort_only {
        let receipt = ShuffleReceipt::from_markers(&ctx).unwrap();
        Sorter::run(&ctx, &receipt, scope).unwrap();
        return;
    }

    let listener = bind(&ctx).unwrap();
    if args.shuffle_only {
        ctx.log_layout();
        let receipt = shuffle(&ctx, listener).unwrap();
        log::info!("{:?}", receipt.stats());
        return;
    }

    let (receipt, sorted) = run(&ctx, listener, scope).unwrap();
    let records: u64 = sorted.iter().map(|s| s.records).sum();
    log::info!(
        "Done: read {} local records, sorted {records} records",
        receipt.stats().records_read
    );
}
