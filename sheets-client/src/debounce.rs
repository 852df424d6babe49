//! Coalesces keystrokes into file edits.
//!
//! The first change to a file arms a timer; changes arriving before it fires
//! only replace the pending content. When the timer fires, the latest content
//! is handed to the sink once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::timer::OneShotTimer;

pub type EditSink = Arc<dyn Fn(&str, String) + Send + Sync>;

struct PendingEdit {
    content: String,
    timer: OneShotTimer,
}

struct Inner {
    delay: Duration,
    pending: Mutex<HashMap<String, PendingEdit>>,
    sink: EditSink,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingEdit>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct EditDebouncer {
    inner: Arc<Inner>,
}

impl EditDebouncer {
    pub fn new<F>(delay: Duration, sink: F) -> Self
    where
        F: Fn(&str, String) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                delay,
                pending: Mutex::new(HashMap::new()),
                sink: Arc::new(sink),
            }),
        }
    }

    /// Record the current text of `filename`.
    pub fn push(&self, filename: &str, content: String) {
        let mut pending = self.inner.pending();
        if let Some(edit) = pending.get_mut(filename) {
            edit.content = content;
            return;
        }

        let edit = PendingEdit {
            content,
            timer: OneShotTimer::new(),
        };
        let weak = Arc::downgrade(&self.inner);
        let name = filename.to_string();
        if !edit.timer.arm(self.inner.delay, move || fire(weak, &name)) {
            // No runtime to wait on; deliver right away.
            drop(pending);
            (self.inner.sink)(filename, edit.content);
            return;
        }
        pending.insert(filename.to_string(), edit);
    }

    /// Deliver the pending edit for `filename` now, if there is one.
    pub fn flush(&self, filename: &str) -> bool {
        let Some(edit) = self.inner.pending().remove(filename) else {
            return false;
        };
        edit.timer.cancel();
        (self.inner.sink)(filename, edit.content);
        true
    }

    /// Deliver every pending edit now, in name order.
    pub fn flush_all(&self) {
        let mut names: Vec<String> = self.inner.pending().keys().cloned().collect();
        names.sort();
        for name in names {
            self.flush(&name);
        }
    }

    /// Forget a pending edit without delivering it.
    pub fn discard(&self, filename: &str) -> bool {
        self.inner.pending().remove(filename).is_some()
    }

    pub fn is_pending(&self, filename: &str) -> bool {
        self.inner.pending().contains_key(filename)
    }
}

fn fire(inner: Weak<Inner>, filename: &str) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(edit) = inner.pending().remove(filename) else {
        return;
    };
    edit.timer.disarm();
    (inner.sink)(filename, edit.content);
}
