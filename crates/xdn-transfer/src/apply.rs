//! Application of a statediff to replica state.

/// Deterministic function from (current state, statediff) to the new state.
///
/// The payload format belongs to the application; implementations must
/// return the same output for the same inputs on every replica.
pub trait StateApplier: Send + Sync {
    fn apply(&self, current: Option<&str>, statediff: &str) -> String;
}

/// Treats every statediff as a full snapshot that replaces the current state.
///
/// This is how migration units are built: the source replica packages its
/// whole state, so the joining replica simply adopts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceState;

impl StateApplier for ReplaceState {
    fn apply(&self, _current: Option<&str>, statediff: &str) -> String {
        statediff.to_string()
    }
}

impl<F> StateApplier for F
where
    F: Fn(Option<&str>, &str) -> String + Send + Sync,
{
    fn apply(&self, current: Option<&str>, statediff: &str) -> String {
        self(current, statediff)
    }
}
