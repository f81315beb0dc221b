mod arguments;
mod sanitize;
mod worker_process;

pub use arguments::{WorkerContext, WorkerProcessArguments};
pub use sanitize::sanitize;
pub use worker_process::{
    ExitDisposition, ExitSignal, ProcessExit, StderrLevel, WorkerProcess, classify_stderr,
};
