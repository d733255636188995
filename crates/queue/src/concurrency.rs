//! Encoder thread planning
//!
//! Derives the `-threads` value handed to every encoder invocation from the
//! CPU core count and configuration.

use encode_queue_config::Config;

/// Thread plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderThreads {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Threads given to each encoder process
    pub threads: u32,
}

impl EncoderThreads {
    /// Derive a thread plan from configuration
    ///
    /// - An explicit non-zero `encoder.threads` wins
    /// - Otherwise cores (via num_cpus) times `target_cpu_utilization`, clamped to [0.5, 1.0]
    /// - Never less than one thread
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let threads = if cfg.encoder.threads > 0 {
            cfg.encoder.threads
        } else {
            let utilization = clamp_utilization(cfg.encoder.target_cpu_utilization);
            ((total_cores as f32) * utilization).round() as u32
        };

        Self {
            total_cores,
            threads: threads.max(1),
        }
    }
}

fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}
