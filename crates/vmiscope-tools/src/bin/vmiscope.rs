//! Command-line introspection tools.
//!
//! Opens a session on a VM through any registered backend and pauses it,
//! dumps registers or memory, or streams intercepted events.
//!
//! # Usage
//!
//! ```bash
//! # Pause a VM for two seconds
//! vmiscope --vm-name win10 pause --duration-ms 2000
//!
//! # Dump the registers of vCPU 1 as JSON
//! vmiscope --vm-name win10 regs --vcpu 1 --json
//!
//! # Dump physical memory, unmapped frames zero-filled
//! vmiscope --vm-name win10 mem-scan --output win10.raw
//!
//! # Stream CR3 writes on every vCPU until Ctrl+C
//! vmiscope --vm-name win10 cr-events --cr cr3
//!
//! # Revoke execute rights on all memory and report 100 execution faults
//! vmiscope --vm-name win10 mem-events --count 100
//!
//! # Snapshot the VM and record 500 CR3 writes for later replay
//! vmiscope --vm-name win10 record --output win10.json --count 500
//!
//! # Replay a recording
//! vmiscope --backend replay --recording win10.json cr-events
//! ```

use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use vmiscope::api::{CommonInitParams, ReplayInitParams, TrapClass};
use vmiscope::driver::registered_backends;
use vmiscope::memory::scan_pages;
use vmiscope::verified::registers::SNAPSHOT_MSRS;
use vmiscope::{
    Access, BackendId, BackendSelector, CrType, DriverError, Event, EventKind, EventReply,
    InitParams, InterceptType, PaddedMemory, Recorder, Vmi, PAGE_SHIFT,
};

/// How long one listen call blocks before the stop flag is checked again.
const LISTEN_SLICE: Duration = Duration::from_millis(1000);

#[derive(Parser)]
#[command(name = "vmiscope")]
#[command(about = "Hypervisor-agnostic VM introspection tools")]
#[command(version)]
struct Cli {
    /// Backend: auto, a backend name (dummy, replay, ...) or a numeric id.
    #[arg(short, long, global = true, default_value = "auto")]
    backend: String,

    /// Name of the VM to introspect.
    #[arg(long, global = true)]
    vm_name: Option<String>,

    /// Recording for the replay backend.
    #[arg(long, global = true)]
    recording: Option<PathBuf>,

    /// Load initialization parameters from a JSON file.
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    /// Backend extension `key=value`; a trailing `!` marks it required.
    #[arg(long = "ext", global = true, value_parser = parse_extension)]
    extensions: Vec<ExtensionArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pause the VM for a while, then resume it.
    Pause {
        #[arg(short, long, default_value = "1000")]
        duration_ms: u64,
    },

    /// Dump the registers of one vCPU.
    Regs {
        #[arg(long, default_value = "0")]
        vcpu: u16,

        /// Print JSON instead of the debug layout.
        #[arg(long)]
        json: bool,
    },

    /// Read every page of guest memory.
    MemScan {
        /// Write a raw dump here, unreadable frames zero-filled.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stream control register writes.
    CrEvents {
        /// Registers to watch (comma-separated): cr0, cr3, cr4.
        #[arg(long, value_delimiter = ',', default_value = "cr3")]
        cr: Vec<String>,

        #[command(flatten)]
        limit: Limit,
    },

    /// Stream MSR writes.
    MsrEvents {
        /// MSR indices to watch (comma-separated, hex or decimal).
        /// Defaults to the MSRs present in a register dump.
        #[arg(long, value_delimiter = ',')]
        msr: Vec<String>,

        #[command(flatten)]
        limit: Limit,
    },

    /// Stream breakpoint hits.
    BreakpointEvents {
        #[command(flatten)]
        limit: Limit,
    },

    /// Stream single-step traps.
    SinglestepEvents {
        #[command(flatten)]
        limit: Limit,
    },

    /// Stream interrupts.
    InterruptEvents {
        #[command(flatten)]
        limit: Limit,
    },

    /// Revoke execute rights on every page and stream the resulting
    /// pagefaults, granting each faulting page its rights back.
    MemEvents {
        #[command(flatten)]
        limit: Limit,
    },

    /// Snapshot the VM, then record CR3 writes into a replayable file.
    Record {
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        limit: Limit,
    },
}

#[derive(clap::Args)]
struct Limit {
    /// Stop after this many events (0 = until Ctrl+C).
    #[arg(short, long, default_value = "0")]
    count: u64,

    /// Don't print events.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone)]
struct ExtensionArg {
    key: String,
    value: String,
    required: bool,
}

fn parse_extension(arg: &str) -> Result<ExtensionArg, String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", arg))?;
    let (value, required) = match value.strip_suffix('!') {
        Some(value) => (value, true),
        None => (value, false),
    };
    if key.is_empty() {
        return Err("extension key is empty".to_string());
    }
    Ok(ExtensionArg {
        key: key.to_string(),
        value: value.to_string(),
        required,
    })
}

static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    ctrlc_simple();

    let vmi = open_session(&cli);
    match cli.command {
        Commands::Pause { duration_ms } => cmd_pause(&vmi, duration_ms),
        Commands::Regs { vcpu, json } => cmd_regs(&vmi, vcpu, json),
        Commands::MemScan { output } => cmd_mem_scan(&vmi, output),
        Commands::CrEvents { cr, limit } => {
            let intercepts = cr
                .iter()
                .map(|name| InterceptType::Cr(or_exit(parse_cr(name), "Invalid --cr")))
                .collect();
            watch(&vmi, intercepts, &limit, None, &ignore);
        }
        Commands::MsrEvents { msr, limit } => {
            let indices = if msr.is_empty() {
                SNAPSHOT_MSRS.to_vec()
            } else {
                msr.iter()
                    .map(|index| or_exit(parse_u32(index), "Invalid --msr"))
                    .collect()
            };
            let intercepts = indices.into_iter().map(InterceptType::Msr).collect();
            watch(&vmi, intercepts, &limit, None, &ignore);
        }
        Commands::BreakpointEvents { limit } => {
            watch(&vmi, vec![InterceptType::Breakpoint], &limit, None, &ignore)
        }
        Commands::SinglestepEvents { limit } => {
            watch(&vmi, vec![InterceptType::Singlestep], &limit, None, &ignore)
        }
        Commands::InterruptEvents { limit } => {
            watch(&vmi, vec![InterceptType::Interrupt], &limit, None, &ignore)
        }
        Commands::MemEvents { limit } => cmd_mem_events(&vmi, &limit),
        Commands::Record { output, limit } => {
            cmd_record(&vmi, cli.vm_name.as_deref(), output, &limit)
        }
    }
    vmi.destroy();
}

// ═══════════════════════════════════════════════════════════════════════
//  Session setup
// ═══════════════════════════════════════════════════════════════════════

fn or_exit<T, E: Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{}: {}", what, e);
            std::process::exit(1);
        }
    }
}

fn parse_u32(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("{:?} is not a number", value))
}

fn parse_cr(name: &str) -> Result<CrType, String> {
    match name.trim().to_lowercase().as_str() {
        "cr0" => Ok(CrType::Cr0),
        "cr3" => Ok(CrType::Cr3),
        "cr4" => Ok(CrType::Cr4),
        other => Err(format!("unknown control register {:?}", other)),
    }
}

fn parse_backend(value: &str) -> Result<BackendSelector, String> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(BackendSelector::Auto);
    }
    if let Some(entry) = registered_backends()
        .into_iter()
        .find(|e| e.name.eq_ignore_ascii_case(value))
    {
        return Ok(BackendSelector::Explicit(entry.id));
    }
    parse_u32(value)
        .map(|id| BackendSelector::Explicit(BackendId(id)))
        .map_err(|_| format!("unknown backend {:?}", value))
}

fn init_params(cli: &Cli) -> InitParams {
    let mut params = match &cli.params {
        Some(path) => or_exit(InitParams::load(path), "Failed to load parameters"),
        None => InitParams::default(),
    };
    if let Some(vm_name) = &cli.vm_name {
        params.common = Some(CommonInitParams {
            vm_name: vm_name.clone(),
        });
    }
    if let Some(recording) = &cli.recording {
        params.replay = Some(ReplayInitParams {
            recording: recording.clone(),
        });
    }
    for ext in &cli.extensions {
        params = params.with_extension(ext.key.clone(), ext.value.clone(), ext.required);
    }
    params
}

fn open_session(cli: &Cli) -> Vmi {
    let selector = or_exit(parse_backend(&cli.backend), "Invalid --backend");
    let params = init_params(cli);
    debug!("Parameters: {:?}", params);
    let vmi = or_exit(Vmi::init(selector, &params), "Failed to initialize");
    eprintln!(
        "Session on {} backend ({} vCPUs)",
        vmi.backend_name(),
        or_exit(vmi.vcpu_count(), "Failed to query vCPUs")
    );
    vmi
}

// ═══════════════════════════════════════════════════════════════════════
//  Commands
// ═══════════════════════════════════════════════════════════════════════

fn cmd_pause(vmi: &Vmi, duration_ms: u64) {
    or_exit(vmi.pause(), "Failed to pause");
    eprintln!("Paused for {} ms", duration_ms);
    thread::sleep(Duration::from_millis(duration_ms));
    or_exit(vmi.resume(), "Failed to resume");
    eprintln!("Resumed");
}

fn cmd_regs(vmi: &Vmi, vcpu: u16, json: bool) {
    or_exit(vmi.pause(), "Failed to pause");
    let regs = vmi.read_registers(vcpu);
    or_exit(vmi.resume(), "Failed to resume");
    let regs = or_exit(regs, "Failed to read registers");

    if json {
        println!(
            "{}",
            or_exit(serde_json::to_string_pretty(&regs), "Failed to encode")
        );
    } else {
        println!("{:#x?}", regs);
    }
}

fn cmd_mem_scan(vmi: &Vmi, output: Option<PathBuf>) {
    or_exit(vmi.pause(), "Failed to pause");
    match output {
        Some(path) => {
            let mut memory = or_exit(PaddedMemory::new(vmi), "Failed to open memory");
            let mut file = BufWriter::new(or_exit(File::create(&path), "Failed to create dump"));
            let written = io::copy(&mut memory, &mut file);
            let written = or_exit(written, "Failed to dump memory");
            eprintln!("Wrote {} bytes to {}", written, path.display());
        }
        None => {
            let mut total_bytes = 0u64;
            let summary = scan_pages(vmi, |page| total_bytes += page.data.len() as u64);
            let summary = or_exit(summary, "Scan aborted");
            println!(
                "{} pages read ({} bytes), {} pages skipped",
                summary.pages_read, total_bytes, summary.pages_skipped
            );
        }
    }
    or_exit(vmi.resume(), "Failed to resume");
}

fn cmd_record(vmi: &Vmi, vm_name: Option<&str>, output: PathBuf, limit: &Limit) {
    let vm_name = vm_name.unwrap_or("unnamed");
    let mut recorder = or_exit(Recorder::capture(vmi, vm_name), "Failed to snapshot");
    watch(
        vmi,
        vec![InterceptType::Cr(CrType::Cr3)],
        limit,
        Some(&mut recorder),
        &ignore,
    );
    let traps = recorder.trap_count();
    let recording = recorder.finish();
    or_exit(recording.save(&output), "Failed to save recording");
    eprintln!("Saved {} traps to {}", traps, output.display());
}

fn cmd_mem_events(vmi: &Vmi, limit: &Limit) {
    or_exit(vmi.pause(), "Failed to pause");
    let restricted = restrict_execute(vmi);
    or_exit(vmi.resume(), "Failed to resume");
    let restricted = or_exit(restricted, "Failed to set page access");
    eprintln!("Revoked execute rights on {} pages", restricted.len());

    watch(
        vmi,
        vec![InterceptType::Pagefault],
        limit,
        None,
        &|event| grant_faulting_access(vmi, event),
    );

    for (paddr, access) in restricted {
        if let Err(e) = vmi.set_page_access(paddr, access) {
            warn!("Failed to restore access on {:#x}: {}", paddr, e);
        }
    }
}

/// Drop `X` from every mapped page that has it. Returns the pages changed
/// with their previous rights.
fn restrict_execute(vmi: &Vmi) -> Result<Vec<(u64, Access)>, DriverError> {
    let last_frame = vmi.max_physical_address()? >> PAGE_SHIFT;
    let mut restricted = Vec::new();
    for frame in 0..=last_frame {
        let paddr = frame << PAGE_SHIFT;
        let access = match vmi.get_page_access(paddr) {
            Ok(access) => access,
            Err(DriverError::FrameNotMapped(_)) => continue,
            Err(e) => return Err(e),
        };
        if access.contains(Access::X) {
            vmi.set_page_access(paddr, access & !Access::X)?;
            restricted.push((paddr, access));
        }
    }
    Ok(restricted)
}

/// Give the faulting page the rights it was denied, then let the vCPU go.
fn grant_faulting_access(vmi: &Vmi, event: &Event) {
    if let EventKind::Pagefault { gpa, access, .. } = event.kind {
        let granted = vmi
            .get_page_access(gpa)
            .and_then(|current| vmi.set_page_access(gpa, current | access));
        if let Err(e) = granted {
            warn!("Failed to grant {} on {:#x}: {}", access, gpa, e);
        }
    }
    if let Err(e) = vmi.reply_event(event, EventReply::Continue) {
        warn!("Failed to reply to event on VCPU {}: {}", event.vcpu, e);
    }
}

fn ignore(_: &Event) {}

/// Arm `intercepts` on every vCPU, print events until the limit or a
/// signal, then disarm. `on_event` runs after each event is printed.
fn watch(
    vmi: &Vmi,
    intercepts: Vec<InterceptType>,
    limit: &Limit,
    mut recorder: Option<&mut Recorder>,
    on_event: &dyn Fn(&Event),
) {
    let vcpus = or_exit(vmi.vcpu_count(), "Failed to query vCPUs");

    // Arm while paused so no vCPU runs with a partial set.
    or_exit(vmi.pause(), "Failed to pause");
    for vcpu in 0..vcpus {
        for intercept in &intercepts {
            or_exit(
                vmi.toggle_intercept(vcpu, *intercept, true),
                "Failed to enable intercept",
            );
        }
    }
    or_exit(vmi.resume(), "Failed to resume");
    info!("Armed {} intercepts on {} vCPUs", intercepts.len(), vcpus);
    eprintln!("Listening for events (Ctrl+C to stop)...");

    let mut seen = 0u64;
    let mut by_class = [0u64; 7];
    while RUNNING.load(Ordering::Relaxed) {
        let event = match vmi.listen(LISTEN_SLICE) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("Listen error: {}", e);
                break;
            }
        };
        seen += 1;
        by_class[event.kind.class() as usize] += 1;
        if !limit.quiet {
            println!("[{:>6}] {}", seen, event);
        }
        if let Some(recorder) = recorder.as_deref_mut() {
            recorder.record(&event);
        }
        on_event(&event);
        if limit.count > 0 && seen >= limit.count {
            break;
        }
    }

    for vcpu in 0..vcpus {
        for intercept in &intercepts {
            if let Err(e) = vmi.toggle_intercept(vcpu, *intercept, false) {
                warn!("Failed to disable {} on VCPU {}: {}", intercept, vcpu, e);
            }
        }
    }

    eprintln!("\nCollected {} events", seen);
    for class in [
        TrapClass::Cr,
        TrapClass::Msr,
        TrapClass::Breakpoint,
        TrapClass::Singlestep,
        TrapClass::Interrupt,
        TrapClass::Pagefault,
    ] {
        let count = by_class[class as usize];
        if count > 0 {
            eprintln!("{:>12} {:>8}", class.to_string(), count);
        }
    }
}

/// SIGINT + SIGTERM clear [`RUNNING`] (avoids pulling in the ctrlc crate).
fn ctrlc_simple() {
    extern "C" fn handler(_: libc::c_int) {
        RUNNING.store(false, Ordering::Relaxed);
    }

    let h = handler as *const () as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }
}
