//! Bounded per-deployment log tail.

use std::collections::VecDeque;

use berth_recovery::sanitize_message;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Lines kept per deployment; older lines are dropped first.
pub const LOG_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: u64,
    pub message: String,
}

pub struct LogBook {
    capacity: usize,
    lines: DashMap<String, VecDeque<LogLine>>,
}

impl Default for LogBook {
    fn default() -> Self {
        Self::new(LOG_TAIL_LINES)
    }
}

impl LogBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: DashMap::new(),
        }
    }

    /// Append a line. The message is sanitized before it is stored.
    pub fn push(&self, deployment_id: &str, at: u64, message: &str) {
        let line = LogLine {
            at,
            message: sanitize_message(message),
        };
        let mut tail = self.lines.entry(deployment_id.to_string()).or_default();
        while tail.len() >= self.capacity {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    /// Oldest first.
    pub fn tail(&self, deployment_id: &str) -> Vec<LogLine> {
        self.lines
            .get(deployment_id)
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, deployment_id: &str) {
        self.lines.remove(deployment_id);
    }
}
