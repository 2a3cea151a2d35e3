use crate::worker::WorkerId;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nix::Error;

// Pin the calling worker thread to a CPU core
pub(crate) fn pin_thread_to_core(worker: WorkerId, core: u32) -> Result<(), Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core as usize)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    log::debug!("Pinned worker {} to core {}", worker, core);
    Ok(())
}
