//! The agent loop.
//!
//! A [`Turn`] is one model exchange: it streams the reply through a
//! [`Chat`], dispatches the function calls it contains against the tool
//! registry, and parks calls that need approval. A [`Session`] drives turns
//! for one user message:
//!
//! 1. **Send** the user's parts (plus any carried-over function responses)
//! 2. **Stream** text and tool-call requests back to the caller
//! 3. **Resolve** gated calls through an [`Approver`]
//! 4. **Re-invoke** with the collected function responses, until the model
//!    stops calling tools or the turn limit is reached

pub mod chat;
pub mod session;
pub mod turn;

#[cfg(test)]
mod test_support;

pub use chat::Chat;
pub use session::{Approver, AutoApprover, DEFAULT_MAX_TURNS, DenyApprover, Session, SessionSummary};
pub use turn::{PendingToolCall, ToolCallOutcome, ToolCallRequest, Turn, TurnError, TurnEvent};
