//! Task-local logging context.
//!
//! `LogScope` is a stack of frames carried on the current async task. The
//! dispatcher pushes a frame before invoking a handler and pops it before
//! firing `CommandCompleted`; anything the handler logs in between picks up
//! the innermost frame automatically. Because this rides on
//! [`tokio::task_local!`], the context is naturally scoped to one logical
//! task: a detached `tokio::spawn` inside a handler does **not** inherit the
//! parent's frames unless it explicitly pushes its own root frame first.

use std::cell::RefCell;
use std::future::Future;

use chrono::{DateTime, Utc};

tokio::task_local! {
    static LOG_STACK: RefCell<Vec<LogFrame>>;
}

/// One entry in the task-local log-scope stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFrame {
    pub name: String,
    pub operation_id: u64,
    pub step_number: Option<u64>,
    pub max_step: Option<u64>,
    pub agent_name: Option<String>,
    pub story_correlation_id: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl LogFrame {
    pub fn new(name: impl Into<String>, operation_id: u64) -> Self {
        Self {
            name: name.into(),
            operation_id,
            pushed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Build a child frame, inheriting any field left unset from `self`.
    #[must_use]
    pub fn child(&self) -> LogFrame {
        LogFrame {
            name: self.name.clone(),
            operation_id: self.operation_id,
            step_number: self.step_number,
            max_step: self.max_step,
            agent_name: self.agent_name.clone(),
            story_correlation_id: self.story_correlation_id.clone(),
            pushed_at: Some(Utc::now()),
        }
    }
}

/// Guard returned by [`LogScope::push`]; pops its frame on drop.
#[derive(Debug)]
pub struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let _ = LOG_STACK.try_with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub struct LogScope;

impl LogScope {
    /// Establish a fresh stack for the given future, seeded with `frame`.
    /// Use this once per logical task (dispatcher handler execution, or a
    /// detached follow-up that deliberately re-roots its own context).
    pub async fn root<F>(frame: LogFrame, fut: F) -> F::Output
    where
        F: Future,
    {
        LOG_STACK.scope(RefCell::new(vec![frame]), fut).await
    }

    /// Push a child frame onto the current task's stack. Must be called
    /// from within a [`LogScope::root`]-established task; outside of one
    /// this is a no-op and the returned guard pops nothing.
    pub fn push(frame: LogFrame) -> FrameGuard {
        let _ = LOG_STACK.try_with(|stack| stack.borrow_mut().push(frame));
        FrameGuard { _private: () }
    }

    /// The innermost frame visible to the current task, if any.
    #[must_use]
    pub fn current() -> Option<LogFrame> {
        LOG_STACK.try_with(|stack| stack.borrow().last().cloned()).ok().flatten()
    }

    /// Update the step counters on the innermost frame in place.
    pub fn set_step(current: Option<u64>, max: Option<u64>) {
        let _ = LOG_STACK.try_with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                frame.step_number = current;
                frame.max_step = max;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_is_none_outside_a_scope() {
        assert!(LogScope::current().is_none());
    }

    #[tokio::test]
    async fn root_frame_is_visible_inside_the_scope() {
        let frame = LogFrame::new("op", 1);
        LogScope::root(frame.clone(), async {
            let current = LogScope::current().unwrap();
            assert_eq!(current.name, "op");
            assert_eq!(current.operation_id, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn pushed_frame_inherits_unset_fields_and_pops_on_drop() {
        let mut root = LogFrame::new("op", 7);
        root.agent_name = Some("writer-a".into());
        LogScope::root(root, async {
            {
                let mut child = LogScope::current().unwrap().child();
                child.step_number = Some(2);
                let _guard = LogScope::push(child);
                let seen = LogScope::current().unwrap();
                assert_eq!(seen.agent_name.as_deref(), Some("writer-a"));
                assert_eq!(seen.step_number, Some(2));
            }
            let after = LogScope::current().unwrap();
            assert_eq!(after.step_number, None);
        })
        .await;
    }

    #[tokio::test]
    async fn detached_task_does_not_inherit_parent_frames() {
        let frame = LogFrame::new("parent", 1);
        LogScope::root(frame, async {
            let handle = tokio::spawn(async { LogScope::current() });
            let seen_in_detached_task = handle.await.unwrap();
            assert!(seen_in_detached_task.is_none());
        })
        .await;
    }
}
