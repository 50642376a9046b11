//! The ClawLoop turn executor.
//!
//! A turn follows a small explicit state machine:
//!
//! 1. **BuildContext**: system prompt, session summary, and history
//! 2. **ModelCall**: stream from the provider, publishing text deltas
//! 3. **ToolExecuting**: run requested tools, append results, back to 2
//! 4. **Compress**: on context overflow, fold old history into the
//!    summary and retry the model call once
//! 5. **Completed** or **Failed**
//!
//! Every step is appended to the session as soon as it finishes, and the
//! number of model steps per turn is bounded.

pub mod compress;
pub mod context;
pub mod loop_runner;
pub mod session;
pub mod turn;

#[cfg(test)]
mod test_helpers;

pub use compress::{Compression, Compressor, SummarizePolicy};
pub use context::ContextBuilder;
pub use loop_runner::{AgentLoop, DIRECT_CHANNEL, DIRECT_CHAT, TurnRequest};
pub use session::{Session, SessionStore};
pub use turn::{TurnError, TurnOutcome, TurnState, is_context_overflow};
