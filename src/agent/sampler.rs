use crate::agent::zombie::ProcessSample;
use crate::core::gpu::{Gpu, Node};
use crate::core::round2;
use anyhow::Context;
use compact_str::CompactString;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use std::collections::HashMap;
use std::time::Instant;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A sampled compute process and the local GPU it runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuProcess {
    pub gpu: u32,
    pub sample: ProcessSample,
}

/// Source of per-process GPU readings for the zombie monitor.
pub trait ProcessSampler: Send {
    fn sample(&mut self) -> anyhow::Result<Vec<GpuProcess>>;
}

/// Local GPUs through NVML.
pub struct NvmlSampler {
    nvml: Nvml,
    first_seen: HashMap<u32, Instant>,
}

impl NvmlSampler {
    pub fn init() -> anyhow::Result<Self> {
        let nvml = Nvml::init().context("NVML init failed")?;
        Ok(Self {
            nvml,
            first_seen: HashMap::new(),
        })
    }

    /// Describe the local devices as a node. Memory already in use at
    /// discovery time is counted as unmanaged.
    pub fn discover_node(
        &self,
        name: impl Into<CompactString>,
        gpu_type: Option<&str>,
    ) -> anyhow::Result<Node> {
        let count = self
            .nvml
            .device_count()
            .context("NVML device_count failed")?;

        let mut gpus = Vec::with_capacity(count as usize);
        for idx in 0..count {
            let device = self
                .nvml
                .device_by_index(idx)
                .context("NVML device_by_index failed")?;
            let memory = device
                .memory_info()
                .with_context(|| format!("NVML memory_info failed for GPU {idx}"))?;
            let gpu = Gpu::new(idx, round2(memory.total as f64 / GIB))
                .with_unmanaged(round2(memory.used as f64 / GIB));
            gpus.push(gpu);
        }

        let mut node = Node::new(name, gpus);
        if let Some(gpu_type) = gpu_type {
            node = node.with_gpu_type(gpu_type);
        }
        Ok(node)
    }
}

impl ProcessSampler for NvmlSampler {
    fn sample(&mut self) -> anyhow::Result<Vec<GpuProcess>> {
        let now = Instant::now();
        let count = self
            .nvml
            .device_count()
            .context("NVML device_count failed")?;

        let mut samples = Vec::new();
        for idx in 0..count {
            let device = self
                .nvml
                .device_by_index(idx)
                .context("NVML device_by_index failed")?;
            // Per-process utilization is not exposed everywhere; use the device's.
            let util_pct = device
                .utilization_rates()
                .map(|u| u.gpu as f64)
                .unwrap_or(0.0);
            let processes = match device.running_compute_processes() {
                Ok(processes) => processes,
                Err(e) => {
                    tracing::debug!("Cannot list processes on GPU {}: {}", idx, e);
                    continue;
                }
            };

            for process in processes {
                let used_vram_gb = match process.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes as f64 / GIB,
                    UsedGpuMemory::Unavailable => 0.0,
                };
                let Some((io_read_kb, io_write_kb)) = read_proc_io(process.pid) else {
                    continue;
                };
                let first_seen = *self.first_seen.entry(process.pid).or_insert(now);
                samples.push(GpuProcess {
                    gpu: idx,
                    sample: ProcessSample {
                        pid: process.pid,
                        used_vram_gb,
                        util_pct,
                        io_read_kb,
                        io_write_kb,
                        duration: now.duration_since(first_seen),
                    },
                });
            }
        }

        self.first_seen
            .retain(|pid, _| samples.iter().any(|s| s.sample.pid == *pid));
        Ok(samples)
    }
}

fn read_proc_io(pid: u32) -> Option<(f64, f64)> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/io")).ok()?;
    parse_proc_io(&content)
}

/// `(read_kb, write_kb)` from the storage-level counters of `/proc/<pid>/io`.
pub fn parse_proc_io(content: &str) -> Option<(f64, f64)> {
    let mut read = None;
    let mut write = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u64>().ok();
        match key.trim() {
            "read_bytes" => read = value,
            "write_bytes" => write = value,
            _ => {}
        }
    }
    Some((read? as f64 / 1024.0, write? as f64 / 1024.0))
}
