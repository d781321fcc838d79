//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of client connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active client connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "upload_requests", description = "Total upload requests")]
pub static UPLOAD_REQUESTS: Counter = Counter::new();

#[metric(name = "download_requests", description = "Total download requests")]
pub static DOWNLOAD_REQUESTS: Counter = Counter::new();

#[metric(
    name = "uploads_completed",
    description = "Uploads that reached their full file size"
)]
pub static UPLOADS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "downloads_completed",
    description = "Downloads that sent their final chunk"
)]
pub static DOWNLOADS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Sessions failed for framing or protocol violations"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
