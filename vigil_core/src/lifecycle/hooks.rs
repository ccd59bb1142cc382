//! Process-wide hooks: panic reporting and supervised tasks
//!
//! The panic hook is installed at most once per process and reports to
//! whichever pipeline the current target points at. The target only holds
//! a weak reference, so a torn-down pipeline is never kept alive by it.
//! Panics raised while polling a [`CatchPanics`] future are caught and
//! reported by their owner, so the hook leaves them alone.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::json;
use std::any::Any;
use std::cell::Cell;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::logging::{LogCategory, LogLevel, LogPipeline};

static INSTALL: Once = Once::new();
static SUPPRESS_DEFAULT: AtomicBool = AtomicBool::new(false);
static TARGET: Lazy<RwLock<Option<Weak<LogPipeline>>>> = Lazy::new(|| RwLock::new(None));

thread_local! {
    // Depth of CatchPanics polls on this thread
    static CAUGHT_DEPTH: Cell<usize> = Cell::new(0);
}

/// Whether a panic raised on this thread right now has an owner that catches it
pub fn panics_are_caught() -> bool {
    CAUGHT_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks a future whose panics are caught and reported by the caller
///
/// While the inner future is being polled the panic hook does not report.
/// The caller is expected to wrap this in `catch_unwind` or await it
/// through a `JoinHandle`.
pub struct CatchPanics<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchPanics<F> {
    pub fn new(future: F) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl<F: Future> Future for CatchPanics<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _depth = DepthGuard::enter();
        self.inner.as_mut().poll(cx)
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        CAUGHT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CAUGHT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Install the panic hook if it is not installed yet
///
/// `suppress_default` is updated on every call; the hook itself is only
/// installed once.
pub fn install_panic_hook(suppress_default: bool) {
    SUPPRESS_DEFAULT.store(suppress_default, Ordering::SeqCst);

    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if panics_are_caught() {
                if !SUPPRESS_DEFAULT.load(Ordering::SeqCst) {
                    previous(info);
                }
                return;
            }

            let pipeline = TARGET
                .try_read()
                .and_then(|target| target.as_ref().and_then(Weak::upgrade));

            let reported = match pipeline {
                Some(pipeline) => {
                    let message = panic_message(info.payload());
                    let location = info
                        .location()
                        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
                    let thread = std::thread::current()
                        .name()
                        .unwrap_or("<unnamed>")
                        .to_string();

                    pipeline.try_log(
                        LogLevel::Critical,
                        LogCategory::System,
                        &format!("Unhandled panic: {}", message),
                        Some(json!({ "location": location, "thread": thread })),
                    )
                }
                None => false,
            };

            if !reported || !SUPPRESS_DEFAULT.load(Ordering::SeqCst) {
                previous(info);
            }
        }));
    });
}

/// Whether the panic hook has been installed in this process
pub fn is_installed() -> bool {
    INSTALL.is_completed()
}

/// Point the hooks at a pipeline
pub fn set_target(pipeline: &Arc<LogPipeline>) {
    *TARGET.write() = Some(Arc::downgrade(pipeline));
}

/// Clear the target if it still points at `pipeline`
pub fn clear_target(pipeline: &Arc<LogPipeline>) {
    let mut target = TARGET.write();
    let points_here = target
        .as_ref()
        .map(|weak| weak.as_ptr() == Arc::as_ptr(pipeline))
        .unwrap_or(false);
    if points_here {
        *target = None;
    }
}

/// Render a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn a fallible task and report how it ended
///
/// An `Err` is logged at `error`, a panic at `critical`. Cancellation is
/// not reported. The panic is reported once, by the watcher, not by the
/// panic hook.
pub fn supervise<F, T, E>(pipeline: Weak<LogPipeline>, name: impl Into<String>, future: F) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let name = name.into();
    let task = tokio::spawn(CatchPanics::new(future));

    tokio::spawn(async move {
        let outcome = task.await;
        let pipeline = pipeline.upgrade();

        match outcome {
            Ok(Ok(_)) => debug!(task = %name, "Supervised task finished"),
            Ok(Err(e)) => {
                let message = format!("Task {} failed: {}", name, e);
                match pipeline {
                    Some(pipeline) => {
                        pipeline.log(
                            LogLevel::Error,
                            LogCategory::System,
                            &message,
                            Some(json!({ "task": name })),
                            None,
                        );
                    }
                    None => error!(task = %name, "{}", message),
                }
            }
            Err(join) if join.is_panic() => {
                let message = format!("Task {} panicked: {}", name, panic_message(join.into_panic().as_ref()));
                match pipeline {
                    Some(pipeline) => {
                        pipeline.log(
                            LogLevel::Critical,
                            LogCategory::System,
                            &message,
                            Some(json!({ "task": name })),
                            None,
                        );
                    }
                    None => error!(task = %name, "{}", message),
                }
            }
            Err(_) => debug!(task = %name, "Supervised task cancelled"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_catch_panics_marks_only_while_polling() {
        assert!(!panics_are_caught());

        let seen = CatchPanics::new(async { panics_are_caught() }).await;
        assert!(seen);
        assert!(!panics_are_caught());

        let nested = CatchPanics::new(async {
            CatchPanics::new(async {}).await;
            panics_are_caught()
        })
        .await;
        assert!(nested);
        assert!(!panics_are_caught());
    }

    #[tokio::test]
    async fn test_caught_panic_leaves_depth_balanced() {
        use futures::FutureExt;
        use std::panic::AssertUnwindSafe;

        let outcome = AssertUnwindSafe(CatchPanics::new(async {
            panic!("check exploded");
        }))
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "check exploded");
        assert!(!panics_are_caught());
    }
}
