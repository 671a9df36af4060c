//! Host introspection used once at startup to fill in `register_task_runner`.
//!
//! Grounded in `task_runner.utils.host`: logical/physical CPU count and
//! total memory via the host's resource-accounting layer (`psutil` there,
//! [`sysinfo`] here); GPU count via a best-effort external probe since
//! there is no equivalent of `GPUtil` in this stack.

use sysinfo::System;

#[derive(Debug, Clone, Copy)]
pub struct CpuCount {
    pub logical: usize,
    pub physical: usize,
}

#[derive(Debug, Clone)]
pub struct GpuCount {
    pub count: usize,
    pub name: String,
}

pub fn total_memory_bytes() -> u64 {
    let mut system = System::new_all();
    system.refresh_memory();
    system.total_memory()
}

pub fn cpu_count() -> CpuCount {
    let system = System::new_all();
    CpuCount {
        logical: system.cpus().len(),
        physical: System::physical_core_count().unwrap_or_else(|| system.cpus().len()),
    }
}

/// `None` if no GPU is present or `nvidia-smi` isn't available; mirrors the
/// source returning `None` when `GPUtil.getGPUs()` is empty.
pub fn gpu_count() -> Option<GpuCount> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return None;
    }
    Some(GpuCount {
        count: names.len(),
        name: names[0].clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_count_is_at_least_one() {
        let counts = cpu_count();
        assert!(counts.logical >= 1);
    }

    #[test]
    fn total_memory_is_nonzero_on_a_real_host() {
        assert!(total_memory_bytes() > 0);
    }
}
