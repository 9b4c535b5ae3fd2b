//! Process-communication core for driving native task executables.
//!
//! The crate owns everything between "run this task" and the child process
//! on the other end of a pipe: spawning and supervising the child
//! ([`channel`]), the length-framed 16-bit-packed wire protocol ([`wire`]),
//! classification and dispatch of the peer's slave-mode messages
//! ([`message`], [`session`]), a bounded pinnable pool of live processes
//! ([`cache`]), and the public run entry point ([`orchestrator`]). The
//! front-end's parameter store, interpreter, and graphics kernel stay
//! behind the narrow traits in [`task`], so headless embeddings and tests
//! run without any of them.

pub mod cache;
pub mod cancel;
pub mod channel;
pub mod errors;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod task;
pub mod wire;

pub use cache::{CacheListing, Launcher, PipeLauncher, ProcessCache, SharedCache};
pub use cancel::CancelToken;
pub use channel::{ByteChannel, Channel, ChannelSettings};
pub use errors::{ChannelError, ParamError, SessionError, WireError};
pub use message::{Classified, MessageKind};
pub use orchestrator::Orchestrator;
pub use session::{EnvVars, ProtocolSession, SessionSettings, SessionState};
pub use task::{
    Collaborators, FocusManager, GraphicsSink, Interpreter, NullFocus, NullGraphics, ParamValue,
    RunIo, TaskInfo,
};

#[cfg(test)]
mod tests;
