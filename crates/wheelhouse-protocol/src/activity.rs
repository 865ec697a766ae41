use serde::{Deserialize, Serialize};

/// What a session is doing right now, derived from its buffered event
/// window rather than tracked as separate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    /// A tool invocation has been issued and its result has not arrived.
    Tool {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The assistant is emitting response text with no tool in flight.
    Composing,
}
