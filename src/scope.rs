//! Ambient transaction scope propagation (`spec.md` §4.5).
//!
//! The design note in `spec.md` §9 explicitly rules out thread-local
//! globals in favour of flow-local context. `tokio::task_local!` is exactly
//! that: a value scoped to the current async task and the tasks it spawns,
//! not to the OS thread executing it, which is what "isolated per
//! concurrent request" requires once many requests share a thread pool.
//!
//! Each [`crate::backend::Backend`] implementation that wants ambient-scope
//! support declares its own task-local storage for its own `Scope`
//! associated type via [`define_ambient_scope`] (the macro exists because
//! `tokio::task_local!` needs a concrete type at its declaration site, and
//! each backend's scope type is different; see `dcb_eventstore_postgres::scope`
//! for the concrete instance built on this macro).

/// Declares task-local storage for a backend's ambient scope, plus
/// `with_scope`/`current` helpers around it.
///
/// `$key` names the generated `tokio::task_local!` static; `$ty` is the
/// scope value type (typically `Arc<tokio::sync::Mutex<_>>` so the same
/// handle can be shared and locked across nested `append` calls).
#[macro_export]
macro_rules! define_ambient_scope {
    ($key:ident, $ty:ty) => {
        tokio::task_local! {
            static $key: $ty;
        }

        /// Runs `f` with `scope` published as the ambient transaction scope
        /// for the duration of the future. Nested calls to `with_scope`
        /// replace the current value for their own subtree and restore it
        /// on exit, per `spec.md` §4.5.
        pub async fn with_scope<F, Fut, R>(scope: $ty, f: F) -> R
        where
            F: FnOnce() -> Fut,
            Fut: std::future::Future<Output = R>,
        {
            $key.scope(scope, f()).await
        }

        /// Returns the currently ambient scope, if `with_scope` is active
        /// somewhere up the current call chain.
        pub fn current() -> Option<$ty> {
            $key.try_with(Clone::clone).ok()
        }
    };
}
