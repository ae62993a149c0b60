//! Per-record commit token threaded through the pipeline.

use std::sync::Arc;

use tracing::warn;

/// Broker commit action for one record. Returns true when the offset
/// was durably committed.
pub type CommitFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Anything carrying a committable broker position: single messages and
/// batches of them.
pub trait MessageOffset {
    /// Commit the underlying offset. A non-forced commit is a no-op
    /// (returning false) once the commit has been suppressed; the
    /// underlying broker call is evaluated at most once either way.
    fn commit(&mut self, force: bool) -> bool;

    /// Opt this message out of non-forced (pipeline-driven) commits.
    /// Irreversible for the lifetime of the handle.
    fn suppress_commit(&mut self);
}

/// A consumed record plus its deferred commit capability.
///
/// The pipeline stage currently holding the message is its sole owner;
/// downstream user code may commit early and then suppress the
/// pipeline's own commit attempt at the terminal stage.
pub struct CommittableMessage<T> {
    value: T,
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    commit_fn: CommitFn,
    committed: Option<bool>,
    suppressed: bool,
}

impl<T> CommittableMessage<T> {
    pub fn new(
        value: T,
        topic: String,
        partition: i32,
        offset: i64,
        key: Option<String>,
        commit_fn: CommitFn,
    ) -> Self {
        Self {
            value,
            topic,
            partition,
            offset,
            key,
            commit_fn,
            committed: None,
            suppressed: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }
}

impl<T> MessageOffset for CommittableMessage<T> {
    fn commit(&mut self, force: bool) -> bool {
        if !force && self.suppressed {
            return false;
        }

        // Evaluate the broker commit exactly once per handle; later
        // calls observe the memoized outcome.
        match self.committed {
            Some(result) => result,
            None => {
                let result = (self.commit_fn)();
                if !result {
                    warn!(
                        topic = self.topic,
                        partition = self.partition,
                        offset = self.offset,
                        "Commit attempt failed"
                    );
                }
                self.committed = Some(result);
                result
            }
        }
    }

    fn suppress_commit(&mut self) {
        self.suppressed = true;
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CommittableMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommittableMessage")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key)
            .field("suppressed", &self.suppressed)
            .field("value", &self.value)
            .finish()
    }
}
