//! Request spans.
//!
//! Every dispatched request gets a span carrying its request id, so events
//! from the limiter, queue, pool and breaker correlate in the logs.

use tracing::Span;
use uuid::Uuid;

use crate::queue::Priority;

pub fn request_span(id: Uuid, tenant: &str, server: &str, priority: Priority) -> Span {
    tracing::info_span!(
        "dispatch",
        request_id = %id,
        tenant = %tenant,
        server = %server,
        priority = %priority,
    )
}
