//! Per-request status strings, surfaced through keep-alive chunks.

use std::sync::{Arc, Mutex};

/// A stack of human-readable status lines for one in-flight request.
///
/// Last-writer-wins; racy reads are fine, this exists only for human
/// visibility while a long inference or retrieval phase runs.
#[derive(Clone)]
pub struct ServerStatusHolder {
    stack: Arc<Mutex<Vec<String>>>,
}

impl ServerStatusHolder {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            stack: Arc::new(Mutex::new(vec![initial.into()])),
        }
    }

    /// Replaces the current (topmost) status line.
    pub fn set(&self, status: impl Into<String>) {
        if let Ok(mut stack) = self.stack.lock() {
            stack.pop();
            stack.push(status.into());
        }
    }

    pub fn push(&self, status: impl Into<String>) {
        if let Ok(mut stack) = self.stack.lock() {
            stack.push(status.into());
        }
    }

    pub fn pop(&self) {
        if let Ok(mut stack) = self.stack.lock() {
            if stack.len() > 1 {
                stack.pop();
            }
        }
    }

    pub fn get(&self) -> String {
        self.stack
            .lock()
            .ok()
            .and_then(|stack| stack.last().cloned())
            .unwrap_or_default()
    }

    /// Pushes `status` for the lifetime of the returned guard.
    pub fn scope(&self, status: impl Into<String>) -> StatusScope {
        self.push(status);
        StatusScope {
            holder: self.clone(),
        }
    }
}

/// Guard returned by [`ServerStatusHolder::scope`]; pops on drop.
pub struct StatusScope {
    holder: ServerStatusHolder,
}

impl Drop for StatusScope {
    fn drop(&mut self) {
        self.holder.pop();
    }
}
