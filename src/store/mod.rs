pub mod conversation;

pub use conversation::{
    AppendOutcome, ClaimedBatch, ConversationStore, EscalationTask, MessageNote, MessageRow,
    NewTask, Role, SessionNote, SessionRow, SessionSummary, TaskStatus, TransitionRow,
};
