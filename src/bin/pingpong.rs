//! Request/reply demo over the UDP driver.
//!
//! Run with:
//! ```bash
//! # Terminal 1: echo server
//! cargo run --bin pingpong --features demo-bin -- --bind 127.0.0.1:5800
//!
//! # Terminal 2: client
//! cargo run --bin pingpong --features demo-bin -- \
//!     --bind 127.0.0.1:0 --connect 127.0.0.1:5800 -i 10000 -s 64
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use homa::{OpState, Transport, TransportConfig, UdpDriver};

#[derive(Parser, Debug)]
#[command(name = "pingpong")]
#[command(about = "UDP request/reply demo")]
struct Args {
    /// Local socket address to bind
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Server address to send requests to; echo server mode if absent
    #[arg(long)]
    connect: Option<String>,

    /// Number of request/reply iterations
    #[arg(short, long, default_value = "10000")]
    iterations: u64,

    /// Request payload size in bytes
    #[arg(short = 's', long, default_value = "64")]
    size: usize,

    /// Transport identifier
    #[arg(long, default_value = "1")]
    transport_id: u64,

    /// Maximum UDP payload size
    #[arg(long, default_value = "1400")]
    mtu: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let driver = Arc::new(UdpDriver::new(args.bind.as_str(), args.mtu)?);
    println!("bound to {}", driver.local_socket_addr());

    match &args.connect {
        Some(remote) => run_client(driver, remote, &args),
        None => run_server(driver, &args),
    }
}

/// Echo every request payload back as the reply.
fn run_server(driver: Arc<UdpDriver>, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Transport::new(driver, args.transport_id, TransportConfig::default());
    println!("echo server running; ctrl-c to stop");
    loop {
        transport.poll();
        while let Some(op) = transport.receive_op() {
            let payload = op.payload().expect("received op without payload");
            op.append(&payload)?;
            transport.send_reply(&op);
            transport.release_op(op);
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

fn run_client(
    driver: Arc<UdpDriver>,
    remote: &str,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = driver.intern_socket_addr(remote.parse()?);
    let transport = Transport::new(
        Arc::clone(&driver) as Arc<dyn homa::Driver>,
        args.transport_id,
        TransportConfig::default(),
    );
    let payload = vec![0x5a_u8; args.size];

    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut total_latency = Duration::ZERO;
    let started = Instant::now();

    for _ in 0..args.iterations {
        let op = transport.alloc_op();
        op.append(&payload)?;
        let begin = Instant::now();
        transport.send_request(&op, server);

        loop {
            transport.poll();
            match op.state() {
                OpState::Completed => {
                    completed += 1;
                    total_latency += begin.elapsed();
                    break;
                }
                OpState::Failed => {
                    failed += 1;
                    break;
                }
                _ => std::thread::sleep(Duration::from_micros(10)),
            }
        }
        transport.release_op(op);
    }

    let elapsed = started.elapsed();
    println!(
        "{} completed, {} failed in {:.3}s ({:.0} ops/s)",
        completed,
        failed,
        elapsed.as_secs_f64(),
        completed as f64 / elapsed.as_secs_f64()
    );
    if completed > 0 {
        println!(
            "mean round-trip: {:.1} us",
            total_latency.as_secs_f64() * 1e6 / completed as f64
        );
    }
    Ok(())
}
