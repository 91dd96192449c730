use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::*;
use testrunner::{ProbeCapacity, ProbeFailure, ProbeReport, ProbeResult, ProbeStep};
use x68k_scsi_core::x68k::scsi::iocs::{CommandOutcome, IocsError, ScsiIocs};
use x68k_scsi_core::x68k::scsi::port::BusKind;
use x68k_scsi_core::x68k::scsi::system::ScsiSystem;

/// Mounts a disk image on an emulated SCSI bus and probes it through the
/// controller registers.
#[derive(Parser)]
struct Args {
    /// Hard disk image
    image: PathBuf,

    /// SCSI ID of the disk (0 - 6)
    #[arg(long, default_value_t = 0)]
    id: usize,

    /// Bus to attach the disk to
    #[arg(long, default_value = "external")]
    bus: BusKind,

    /// Blocks to read from LBA 0
    #[arg(long, default_value_t = 1)]
    blocks: u16,

    /// Transfer data through the DMA handshake
    #[arg(long)]
    dma: bool,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

fn record(
    report: &mut ProbeReport,
    name: &str,
    outcome: Result<CommandOutcome, IocsError>,
) -> Option<CommandOutcome> {
    let (result, data, outcome) = match outcome {
        Ok(o) => {
            let result = if o.is_good() {
                ProbeResult::Pass
            } else {
                ProbeResult::CheckCondition(o.status)
            };
            let data = (!o.data.is_empty()).then(|| hex::encode_upper(&o.data));
            (result, data, Some(o))
        }
        Err(e) => {
            error!("{}: {}", name, e);
            (
                ProbeResult::Failed(ProbeFailure::Protocol(e.to_string())),
                None,
                None,
            )
        }
    };
    info!("{}: {:?}", name, result);
    report.steps.push(ProbeStep {
        name: name.to_string(),
        result,
        data,
    });
    outcome
}

fn ascii_field(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_end().to_string()
}

fn probe(iocs: &mut ScsiIocs, args: &Args, report: &mut ProbeReport) {
    let id = args.id;

    // A freshly mounted medium reports UNIT ATTENTION once
    let tur = record(report, "TEST UNIT READY", iocs.test_unit_ready(id));
    if tur.is_some_and(|o| !o.is_good()) {
        record(report, "REQUEST SENSE", iocs.request_sense(id, 18));
        record(report, "TEST UNIT READY", iocs.test_unit_ready(id));
    }

    if let Some(inq) = record(report, "INQUIRY", iocs.inquiry(id, 36)) {
        if inq.data.len() >= 32 {
            report.vendor = Some(ascii_field(&inq.data[8..16]));
            report.product = Some(ascii_field(&inq.data[16..32]));
        }
    }

    match iocs.read_capacity(id) {
        Ok((outcome, capacity)) => {
            report.capacity = capacity.map(|(last_lba, block_len)| ProbeCapacity {
                last_lba,
                block_len,
            });
            record(report, "READ CAPACITY", Ok(outcome));
        }
        Err(e) => {
            record(report, "READ CAPACITY", Err(e));
        }
    }

    record(report, "MODE SENSE", iocs.mode_sense(id, 0x3F, 0xFF));
    record(report, "READ(10)", iocs.read10(id, 0, args.blocks));
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut system = ScsiSystem::new();
    system.set_enabled(args.bus, true);
    system
        .mount_hdd(args.bus, args.id, &args.image)
        .context("Cannot mount image")?;

    let mut report = ProbeReport {
        image: args.image.display().to_string(),
        bus: args.bus.to_string(),
        id: args.id,
        ..Default::default()
    };

    {
        let mut iocs = ScsiIocs::new(system.port_mut(args.bus)).with_dma(args.dma);
        probe(&mut iocs, &args, &mut report);
    }
    system.unmount(args.bus, args.id);

    let json = serde_json::to_string_pretty(&report)?;
    match &args.out {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }

    if !report.passed() {
        warn!("Probe of {} did not pass", args.image.display());
    }
    Ok(())
}
