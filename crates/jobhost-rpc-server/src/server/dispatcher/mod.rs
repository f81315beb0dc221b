//! Invocation dispatch: the dispatcher state machine, the channel factory it
//! draws workers from, and the per-invocation context.

pub mod factory;
mod function_dispatcher;
pub mod invocation;
pub mod state;
pub mod wait;

pub use factory::{ChannelFactory, HostEndpoint, ProcessChannelFactory};
pub use function_dispatcher::{ApplicationLifetime, DispatcherOptions, FunctionDispatcher};
pub use invocation::{
    InvocationContext, InvocationLogs, InvocationOutput, PendingInvocation, UserLog,
};
pub use state::{DispatcherState, ErrorBucket};
