use std::fmt;

/// Per-shard lifecycle: `PENDING -> POLLING -> FETCHING -> DONE | TIMEOUT | ERROR`.
/// `TIMEOUT` and `ERROR` are terminal and never prevent sibling shards from
/// completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardState {
    Pending,
    Polling,
    Fetching,
    Done,
    Timeout,
    Error,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ShardState::Done | ShardState::Timeout | ShardState::Error)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Pending => "PENDING",
            ShardState::Polling => "POLLING",
            ShardState::Fetching => "FETCHING",
            ShardState::Done => "DONE",
            ShardState::Timeout => "TIMEOUT",
            ShardState::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}
