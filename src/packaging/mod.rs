//! Backend invocation: building the command and supervising the process.

pub mod command;
pub mod supervisor;

pub use command::{BuiltCommand, CommandBuildWarning, CommandBuilder};
pub use supervisor::{
    ProcessSupervisor, RunHandle, RunState, StopHandle, SupervisorError, SupervisorEvent,
};
