//! [`GpuMeter`] backed by `nvidia-smi`.
use super::{GpuMemorySnapshot, GpuMeter, ProbeError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const MIB_PER_GB: f64 = 1024.0;

#[derive(Debug, Clone)]
pub struct NvidiaSmiMeter {
    command: String,
    gpu_index: u32,
}

impl NvidiaSmiMeter {
    pub fn new(command: impl Into<String>, gpu_index: u32) -> Self {
        Self {
            command: command.into(),
            gpu_index,
        }
    }
}

impl Default for NvidiaSmiMeter {
    fn default() -> Self {
        Self::new("nvidia-smi", 0)
    }
}

/// Parse one `memory.used, memory.total` CSV line (MiB, no units).
fn parse_memory_line(line: &str) -> Option<GpuMemorySnapshot> {
    let mut fields = line.split(',').map(str::trim);
    let used_mib: f64 = fields.next()?.parse().ok()?;
    let total_mib: f64 = fields.next()?.parse().ok()?;
    Some(GpuMemorySnapshot::new(
        used_mib / MIB_PER_GB,
        total_mib / MIB_PER_GB,
    ))
}

#[async_trait]
impl GpuMeter for NvidiaSmiMeter {
    async fn sample(&self) -> Result<GpuMemorySnapshot, ProbeError> {
        let id = format!("--id={}", self.gpu_index);
        let output = Command::new(&self.command)
            .args([
                id.as_str(),
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::failed("gpu sample", format!("failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            return Err(ProbeError::failed(
                "gpu sample",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let snapshot = stdout
            .lines()
            .find_map(parse_memory_line)
            .ok_or_else(|| {
                ProbeError::failed("gpu sample", format!("unexpected nvidia-smi output: {:?}", stdout))
            })?;

        debug!(
            used_gb = snapshot.used_gb,
            total_gb = snapshot.total_gb,
            available_gb = snapshot.available_gb,
            "Sampled GPU memory"
        );
        Ok(snapshot)
    }
}
