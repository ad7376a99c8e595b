use crate::command::Options;
use crate::utils::format_utils::format_bytes;
use flowprobe_common::FlowRecord;
use log::{info, warn};
use std::env;
use std::fs;
use std::io;

// ---- Startup diagnostics ----
fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn kernel_version() -> Option<String> {
    // Prefer concise output first
    if let Ok(out) = std::process::Command::new("uname").args(["-sr"]).output() {
        if let Ok(s) = String::from_utf8(out.stdout) {
            return Some(s.trim().to_string());
        }
    }
    read_first_line("/proc/version")
}

fn hostname() -> Option<String> {
    read_first_line("/proc/sys/kernel/hostname").or_else(|| read_first_line("/etc/hostname"))
}

fn mem_total_mb() -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .split_whitespace()
                .find_map(|t| t.parse().ok())
                .unwrap_or(0);
            return Some(kb / 1024);
        }
    }
    None
}

fn cpu_model_and_cores() -> (String, usize) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if let Ok(content) = fs::read_to_string("/proc/cpuinfo") {
        for line in content.lines() {
            if let Some(model) = line.strip_prefix("model name\t: ") {
                return (model.trim().to_string(), cores);
            }
            if let Some(hardware) = line.strip_prefix("Hardware\t: ") {
                // arm
                return (hardware.trim().to_string(), cores);
            }
        }
    }
    ("Unknown CPU".to_string(), cores)
}

fn current_user_ids() -> (u32, u32) {
    unsafe {
        let uid = libc::geteuid();
        let gid = libc::getegid();
        (uid as u32, gid as u32)
    }
}

/// Bytes taken by a full table: one slab header per bucket plus one record
/// per bucket when every bucket is in use.
fn table_footprint(entries: u32) -> u64 {
    let bucket = std::mem::size_of::<parking_lot::Mutex<Vec<FlowRecord>>>() as u64;
    let record = std::mem::size_of::<FlowRecord>() as u64;
    entries as u64 * (bucket + record)
}

fn log_live_interfaces(options: &Options) {
    if options.capture.iface.is_empty() {
        return;
    }
    let devices = match pcap::Device::list() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to list capture devices: {}", e);
            return;
        }
    };
    for iface in &options.capture.iface {
        match devices.iter().find(|d| &d.name == iface) {
            Some(device) => {
                let addrs: Vec<String> =
                    device.addresses.iter().map(|a| a.addr.to_string()).collect();
                info!("Interface: {} ({})", iface, addrs.join(", "));
            }
            None => warn!("Interface {} is not listed by libpcap", iface),
        }
    }
}

pub fn log_startup_info(options: &Options) {
    let app_version = env!("CARGO_PKG_VERSION");
    let (uid, gid) = current_user_ids();
    let cwd = env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()))
        .unwrap_or_default();

    let kver = kernel_version().unwrap_or_else(|| "unknown".to_string());
    let host = hostname().unwrap_or_else(|| "unknown".to_string());
    let mem_mb = mem_total_mb().unwrap_or(0);
    let (cpu_model, cores) = cpu_model_and_cores();

    info!("flowprobe v{} started", app_version);
    info!("Host: {} (uid={}, gid={})", host, uid, gid);
    info!("OS: {}", std::env::consts::OS);
    info!("Kernel: {}", kver);
    info!("Arch: {}", std::env::consts::ARCH);
    info!("CPU: {} ({} cores)", cpu_model, cores);
    info!("Memory: {} MiB", mem_mb);
    info!("Working directory: {}", cwd);
    if uid != 0 && !options.capture.iface.is_empty() {
        warn!("It is recommended to run as root to capture on live interfaces");
    }

    info!("Log level: {}", options.log_level());
    let specs = options.capture_specs();
    info!("Capture queues ({}):", specs.len());
    for spec in &specs {
        info!("  • {}", spec);
    }
    log_live_interfaces(options);

    let entries = options.entries().min(flowprobe_common::MAX_ENTRIES);
    info!(
        "Flow table: {} buckets, seed {:#010x}, up to {} when full",
        entries,
        options.hash_seed(),
        format_bytes(table_footprint(entries))
    );
    info!(
        "Ingest workers: {}{}",
        options.workers(),
        if options.pin_cores() { " (pinned)" } else { "" }
    );
    if options.workers() > cores {
        warn!(
            "{} workers requested on {} cores, workers will share CPUs",
            options.workers(),
            cores
        );
    }
    match options.api_port() {
        Some(port) => info!("HTTP API: {}:{}", options.api_bind(), port),
        None => info!("HTTP API: disabled"),
    }
}

/// Restrict the calling thread to one CPU core.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {} is beyond CPU_SETSIZE", core),
        ));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread pinning is only supported on Linux",
    ))
}
