/// What the worker tells the control server about its machine when it
/// connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub cpu: String,
    pub memory_bytes: u64,
    pub name: String,
}

impl HostInfo {
    /// Best-effort introspection of the local host.
    pub fn detect() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let model = read_cpu_model().unwrap_or_else(|| std::env::consts::ARCH.to_string());
        Self {
            cpu: format!("{cores} x {model}"),
            memory_bytes: read_total_memory().unwrap_or(0),
            name: read_hostname().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

fn read_cpu_model() -> Option<String> {
    let info = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    info.lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, model)| model.trim().to_string())
}

fn read_total_memory() -> Option<u64> {
    let info = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = info.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn read_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
