use crate::errors::DomainError;
use crate::model::{FailureReason, JobResourceEnvelope, Walltime};

/// Computes the resource envelope of the next attempt from the failure of the
/// previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub multiplier: u32,
    /// Ceiling on `memory_gb * cpu_count`.
    pub max_memory_gb: u64,
    pub max_walltime: Option<Walltime>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            multiplier: 2,
            max_memory_gb: 450,
            max_walltime: None,
        }
    }
}

impl EscalationPolicy {
    /// Clamps a first-attempt envelope under the ceiling. Fails when the
    /// ceiling cannot give every cpu at least 1 GB.
    pub fn fit_baseline(
        &self,
        envelope: &JobResourceEnvelope,
    ) -> Result<JobResourceEnvelope, DomainError> {
        if self.max_memory_gb < u64::from(envelope.cpu_count) {
            return Err(DomainError::InvalidEnvelope(format!(
                "memory ceiling of {} GB cannot fit {} cpus at 1 GB each",
                self.max_memory_gb, envelope.cpu_count
            )));
        }
        let memory_gb = self.clamp_memory(envelope.memory_gb, envelope.cpu_count);
        if memory_gb != envelope.memory_gb {
            tracing::warn!(
                "Requested {} GB per cpu exceeds the {} GB ceiling for {} cpus; using {} GB",
                envelope.memory_gb,
                self.max_memory_gb,
                envelope.cpu_count,
                memory_gb
            );
        }
        Ok(JobResourceEnvelope {
            memory_gb,
            ..*envelope
        })
    }

    /// Never returns less memory or walltime than `envelope` holds.
    pub fn escalate(
        &self,
        envelope: &JobResourceEnvelope,
        reason: FailureReason,
    ) -> JobResourceEnvelope {
        let (grow_memory, grow_walltime) = match reason {
            FailureReason::WalltimeExceeded => (false, true),
            FailureReason::MemoryLimitExceeded | FailureReason::Other => (true, false),
            FailureReason::Unknown => (true, true),
        };

        let memory_gb = if grow_memory {
            let scaled = envelope
                .memory_gb
                .saturating_mul(u64::from(self.multiplier));
            self.clamp_memory(scaled, envelope.cpu_count)
                .max(envelope.memory_gb)
        } else {
            envelope.memory_gb
        };

        let walltime = if grow_walltime {
            self.clamp_walltime(envelope.walltime.scaled(self.multiplier), envelope.walltime)
        } else {
            envelope.walltime
        };

        envelope.next_attempt(memory_gb, walltime)
    }

    pub fn escalate_times(
        &self,
        envelope: &JobResourceEnvelope,
        reason: FailureReason,
        times: u32,
    ) -> JobResourceEnvelope {
        (0..times).fold(*envelope, |current, _| self.escalate(&current, reason))
    }

    /// Floors per-cpu memory so the job total stays under the ceiling.
    pub fn clamp_memory(&self, memory_gb: u64, cpu_count: u32) -> u64 {
        let cpus = u64::from(cpu_count.max(1));
        if memory_gb.saturating_mul(cpus) > self.max_memory_gb {
            (self.max_memory_gb / cpus).max(1)
        } else {
            memory_gb
        }
    }

    fn clamp_walltime(&self, scaled: Walltime, current: Walltime) -> Walltime {
        match self.max_walltime {
            Some(max) if scaled > max => max.max(current),
            _ => scaled,
        }
    }
}
