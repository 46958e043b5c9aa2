// Copyright 2025-2026 Aurora Radar Group

mod dspcore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use ar_comms::{wire, SequenceRequest, ZmqSink};
use ar_config::SiteConfig;
use ar_gpu::probe;

use crate::dspcore::{BackendSel, DspCore, SequenceOutput};

#[derive(Parser, Debug)]
#[command(name = "rxdsp")]
#[command(about = "HF radar receive-side decimation server")]
struct Cli {
    /// Site configuration file (JSON)
    #[arg(short = 'c', long, default_value = "config.json")]
    config: String,

    /// Override the ack channel endpoint
    #[arg(long)]
    ack_endpoint: Option<String>,

    /// Override the timing channel endpoint
    #[arg(long)]
    timing_endpoint: Option<String>,

    /// Override the sequence-request endpoint
    #[arg(long)]
    request_endpoint: Option<String>,

    /// List compute devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Disable the GPU backend (host processing only)
    #[arg(long)]
    no_gpu: bool,

    /// Verbose start-up output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn print_devices() {
    for (i, dev) in probe::probe().iter().enumerate() {
        let bandwidth = dev
            .memory_bandwidth_gbps()
            .map(|b| format!(", {:.0} GB/s", b))
            .unwrap_or_default();
        eprintln!(
            "  [{}] {} ({} threads/block, {} KiB shared, warp {}{})",
            i,
            dev.name,
            dev.max_threads_per_block,
            dev.shared_mem_per_block / 1024,
            dev.warp_size,
            bandwidth
        );
    }
}

fn backend_selection(no_gpu: bool) -> BackendSel {
    #[cfg(feature = "cuda")]
    {
        if !no_gpu {
            match ar_gpu::cuda::CudaContext::new(0) {
                Ok(ctx) => return BackendSel::Cuda(Arc::new(ctx)),
                Err(e) => log::warn!("GPU backend unavailable ({}), using host", e),
            }
        }
    }
    let _ = no_gpu;
    BackendSel::Host
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list_devices {
        print_devices();
        return;
    }

    let mut config = match SiteConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(ep) = cli.ack_endpoint {
        config.ack_endpoint = ep;
    }
    if let Some(ep) = cli.timing_endpoint {
        config.timing_endpoint = ep;
    }
    if let Some(ep) = cli.request_endpoint {
        config.request_endpoint = ep;
    }

    if cli.verbose {
        log::info!("rxdsp starting");
        log::info!(
            "antennas: {} main + {} interferometer",
            config.main_antenna_count,
            config.intf_antenna_count
        );
        log::info!("request channel: {}", config.request_endpoint);
    }

    let devices = probe::probe();
    let dev = devices[0].clone();
    log::info!("compute device: {}", dev.name);

    let sel = backend_selection(cli.no_gpu);

    let sink = match ZmqSink::new(&config.ack_endpoint, &config.timing_endpoint) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    // Downstream handoff for the beamforming stage. Until that stage is
    // attached the blocks are consumed and accounted here.
    let (output_tx, output_rx) = crossbeam::channel::unbounded::<SequenceOutput>();
    std::thread::spawn(move || {
        for block in output_rx.iter() {
            log::debug!(
                "sequence {}: {} freqs x {} antennas x {} samples ready",
                block.sequence_num,
                block.num_freqs,
                block.num_antennas,
                block.samples_per_stream
            );
        }
    });

    let ctx = zmq::Context::new();
    let requests = match ctx.socket(zmq::PULL) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: zmq PULL socket: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = requests.bind(&config.request_endpoint) {
        eprintln!("error: bind {}: {}", config.request_endpoint, e);
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    }) {
        log::warn!("failed to set Ctrl-C handler: {}", e);
    }

    log::info!("listening for sequences on {}", config.request_endpoint);
    while running.load(Ordering::SeqCst) {
        match requests.poll(zmq::POLLIN, 200) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                log::error!("request poll failed: {}", e);
                break;
            }
        }
        let frame = match requests.recv_bytes(0) {
            Ok(f) => f,
            Err(e) => {
                log::error!("request recv failed: {}", e);
                continue;
            }
        };
        let request = match wire::unframe(&frame).and_then(SequenceRequest::decode) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("dropped undecodable request: {}", e);
                continue;
            }
        };

        // Admission failures already reported the sentinel; the instance
        // otherwise owns itself until its finalisation worker tears it
        // down, so the handle can be dropped here.
        match DspCore::submit(
            &request,
            &config,
            &dev,
            sink.clone(),
            Some(output_tx.clone()),
            sel.clone(),
        ) {
            Ok(core) => log::debug!("sequence {} running", core.sequence_num()),
            Err(e) => log::warn!("sequence {} rejected: {}", request.sequence_num, e),
        }
    }

    log::info!("rxdsp stopped");
}
