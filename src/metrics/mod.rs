//! Observability for bulkquery.
//!
//! `events` holds one type per thing worth counting; `server` exposes the
//! collected metrics over HTTP.

pub mod events;
pub mod server;

pub use server::{MetricsServer, init};

/// Emit an internal event: `emit!(JobSubmitted { kind: JobKind::Query })`.
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
