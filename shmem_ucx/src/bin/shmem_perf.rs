//! One-sided transport microbenchmarks. PEs run as threads over the
//! loopback fabric.

use std::sync::Barrier;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shmem_ucx::test_utils::SymmetricHeap;
use shmem_ucx::{
    ContextOptions, InMemoryRendezvous, LoopbackFabric, LoopbackNetwork, Rendezvous, ThreadLevel,
    Transport, TransportConfig, TransportError,
};

type Shmem = Transport<LoopbackFabric, InMemoryRendezvous>;

#[derive(Parser, Debug, Clone)]
#[command(name = "shmem_perf")]
#[command(about = "Put bandwidth and get latency over the one-sided transport")]
struct Cli {
    /// Number of PEs
    #[arg(short = 'n', long, default_value = "2")]
    pes: usize,

    /// Issuing threads per PE, one context each
    #[arg(short = 't', long, default_value = "1")]
    threads: usize,

    /// Smallest message size in bytes
    #[arg(long, default_value = "8")]
    min_size: usize,

    /// Largest message size in bytes
    #[arg(long, default_value = "65536")]
    max_size: usize,

    /// Measured iterations per size
    #[arg(short = 'i', long, default_value = "1000")]
    iterations: usize,

    /// Unmeasured iterations per size
    #[arg(short = 'w', long, default_value = "100")]
    warmup: usize,

    /// put_nbi calls between quiets
    #[arg(long, default_value = "64")]
    window: usize,

    /// Background progress interval in microseconds (0 = no progress thread)
    #[arg(long, default_value = "0")]
    progress_interval_us: u64,

    /// Abort the whole run if it has not finished after this many seconds
    #[arg(long)]
    kill_after_secs: Option<u64>,

    #[command(subcommand)]
    bench: BenchCmd,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum BenchCmd {
    /// Windowed put_nbi + quiet from even PEs to their odd neighbour
    PutBw,
    /// get_nbi + quiet per message from PE 0 to PE 1
    GetLatency,
}

struct Row {
    size: usize,
    value: f64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.pes < 2 {
        eprintln!("--pes must be at least 2");
        std::process::exit(2);
    }
    if cli.min_size == 0 || cli.min_size > cli.max_size {
        eprintln!("need 0 < --min-size <= --max-size");
        std::process::exit(2);
    }

    if let Some(secs) = cli.kill_after_secs {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            eprintln!("shmem_perf: still running after {secs}s, aborting");
            std::process::abort();
        });
    }

    let network = LoopbackNetwork::new();
    let handles: Vec<_> = InMemoryRendezvous::group(cli.pes)
        .into_iter()
        .map(|rdv| {
            let network = network.clone();
            let cli = cli.clone();
            std::thread::Builder::new()
                .name(format!("pe-{}", rdv.rank()))
                .spawn(move || run_pe(&cli, rdv, network).unwrap_or_else(|e| e.raise()))
        })
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap_or_else(|e| {
            TransportError::Allocation {
                what: "PE thread",
                source: e,
            }
            .raise()
        });

    let unit = match cli.bench {
        BenchCmd::PutBw => "MB/s",
        BenchCmd::GetLatency => "us/op",
    };
    println!("{:>10} {:>12}", "size", unit);
    for (rank, handle) in handles.into_iter().enumerate() {
        let rows = match handle.join() {
            Ok(rows) => rows,
            Err(_) => {
                eprintln!("PE {rank} panicked");
                std::process::exit(1);
            }
        };
        if rank == 0 {
            for row in rows {
                println!("{:>10} {:>12.2}", row.size, row.value);
            }
        }
    }
}

fn sizes(cli: &Cli) -> Vec<usize> {
    std::iter::successors(Some(cli.min_size), |s| s.checked_mul(2))
        .take_while(|&s| s <= cli.max_size)
        .collect()
}

fn fence(shmem: &Shmem) -> Result<(), TransportError> {
    shmem
        .rendezvous()
        .fence()
        .map_err(|source| TransportError::Rendezvous {
            pe: shmem.rank(),
            key: "fence",
            source,
        })
}

fn run_pe(
    cli: &Cli,
    rdv: InMemoryRendezvous,
    network: LoopbackNetwork,
) -> Result<Vec<Row>, TransportError> {
    let threads = cli.threads.max(1);
    let heap = SymmetricHeap::new(cli.max_size * threads, 4096)?;

    let mut config = TransportConfig::from_env()?;
    if threads > 1 {
        config = config.with_thread_level(ThreadLevel::Multiple);
    }
    if cli.progress_interval_us > 0 {
        config = config.with_progress_interval(Duration::from_micros(cli.progress_interval_us));
    }

    let shmem = Transport::bootstrap(config, rdv, heap.layout(), network)?;
    tracing::info!(rank = shmem.rank(), mode = ?shmem.thread_mode(), "PE ready");

    let mut rows = Vec::new();
    for size in sizes(cli) {
        fence(&shmem)?;
        let value = match cli.bench {
            BenchCmd::PutBw => put_bw(cli, &shmem, &heap, size, threads)?,
            BenchCmd::GetLatency => get_latency(cli, &shmem, &heap, size, threads)?,
        };
        if let Some(value) = value {
            rows.push(Row { size, value });
        }
    }

    fence(&shmem)?;
    shmem.finalize()?;
    Ok(rows)
}

/// MB/s on sending PEs, `None` on receivers.
fn put_bw(
    cli: &Cli,
    shmem: &Shmem,
    heap: &SymmetricHeap,
    size: usize,
    threads: usize,
) -> Result<Option<f64>, TransportError> {
    let rank = shmem.rank();
    if rank % 2 == 1 || rank + 1 >= shmem.world_size() {
        return Ok(None);
    }
    let peer = rank + 1;
    let window = cli.window.max(1);

    let elapsed = std::thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                s.spawn(move || -> Result<Duration, TransportError> {
                    let ctx = shmem.create_context(ContextOptions::PRIVATE);
                    let src = vec![t as u8; size];
                    let dest = heap.data.at(t * cli.max_size);

                    let run = |iterations: usize| -> Result<Duration, TransportError> {
                        let start = Instant::now();
                        let mut issued = 0;
                        while issued < iterations {
                            let burst = window.min(iterations - issued);
                            for _ in 0..burst {
                                // `src` lives until the quiet below.
                                unsafe { shmem.put_nbi(&ctx, dest, &src, peer)? };
                            }
                            shmem.quiet(&ctx)?;
                            issued += burst;
                        }
                        Ok(start.elapsed())
                    };
                    run(cli.warmup)?;
                    let elapsed = run(cli.iterations)?;
                    shmem.destroy_context(ctx)?;
                    Ok(elapsed)
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| std::process::abort()))
            .try_fold(Duration::ZERO, |acc, d| d.map(|d| acc.max(d)))
    })?;

    let bytes = (size * cli.iterations * threads) as f64;
    Ok(Some(bytes / elapsed.as_secs_f64().max(f64::EPSILON) / 1e6))
}

/// Microseconds per get on PE 0, `None` elsewhere.
///
/// Every thread streams `get_nbi` + quiet on its own context; the clock
/// starts once all threads have quieted their warmup.
fn get_latency(
    cli: &Cli,
    shmem: &Shmem,
    heap: &SymmetricHeap,
    size: usize,
    threads: usize,
) -> Result<Option<f64>, TransportError> {
    if shmem.rank() != 0 {
        return Ok(None);
    }
    let warmed_up = Barrier::new(threads);

    let elapsed = std::thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let warmed_up = &warmed_up;
                s.spawn(move || -> Result<Duration, TransportError> {
                    let ctx = shmem.create_context(ContextOptions::PRIVATE);
                    let source = heap.data.as_ptr();
                    let mut dst = vec![0u8; size];

                    let get = |dst: &mut [u8]| -> Result<(), TransportError> {
                        // `dst` is not touched again before the quiet.
                        unsafe { shmem.get_nbi(&ctx, dst, source, 1)? };
                        shmem.quiet(&ctx)
                    };
                    let warmup = (0..cli.warmup).try_for_each(|_| get(&mut dst));
                    warmed_up.wait();
                    warmup?;

                    let start = Instant::now();
                    for _ in 0..cli.iterations {
                        get(&mut dst)?;
                    }
                    let elapsed = start.elapsed();
                    shmem.destroy_context(ctx)?;
                    Ok(elapsed)
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| std::process::abort()))
            .try_fold(Duration::ZERO, |acc, d| d.map(|d| acc.max(d)))
    })?;

    Ok(Some(
        elapsed.as_secs_f64() * 1e6 / cli.iterations.max(1) as f64,
    ))
}
