pub mod log;
pub mod supervisor;

pub use supervisor::{
    ProcessEvent, ProcessEventKind, ProcessHandle, ProcessInfo, ProcessOutcome, ProcessStatus,
    ProcessSupervisor, SpawnOptions, SupervisorError,
};
