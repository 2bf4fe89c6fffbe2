//! Error types surfaced by the engine, either synchronously from
//! [`QueryServer::register_request`](crate::QueryServer::register_request) or
//! through a request's completion cell.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use thiserror::Error;

/// Engine error. This is `Clone` because a single execution failure is
/// delivered to every request waiting on the same action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The static binding configuration was missing or empty at startup.
    #[error("invalid binding configuration: {0}")]
    Config(String),

    /// A request was malformed and could not be registered.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// The view's wait queue refused the request.
    #[error("enqueue failed for view {view}")]
    EnqueueFailed { view: String },

    /// A queued request had no submission time and could not be ordered.
    #[error("missing submission time for request on view {view}")]
    MissingSubmissionTime { view: String },

    /// A background thread the engine needs could not be started.
    #[error("failed to start thread {thread}: {message}")]
    Spawn { thread: String, message: String },

    /// The unit of work for an action failed.
    #[error("execution of action {action} failed: {message}")]
    Execution { action: String, message: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Run `f`, turning a panic into its message. User closures run on engine
/// threads, and a panic there must not take the thread down with it.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> std::result::Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::catch_panic;

    #[test]
    fn panic_becomes_its_message() {
        assert_eq!(catch_panic(|| 3), Ok(3));
        assert_eq!(catch_panic(|| -> i32 { panic!("static") }), Err("static".to_owned()));
        assert_eq!(
            catch_panic(|| -> i32 { panic!("formatted {}", 7) }),
            Err("formatted 7".to_owned())
        );
    }
}
