use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{EventWeights, ServiceConfig};
use crate::record::Record;

// ---------------------------------------------------------------------------
// Synthetic hapi-style server events for local runs
// ---------------------------------------------------------------------------

const COMPONENTS: &[&str] = &[
    "ConnectionPool",
    "QueryExecutor",
    "AuthManager",
    "CacheLayer",
    "RateLimiter",
    "SessionStore",
    "JobScheduler",
    "EventBus",
];

const ACTIONS: &[&str] = &[
    "completed successfully",
    "failed after retries",
    "rejected invalid request",
    "evicted stale entry",
    "flushed pending writes",
    "timed out waiting",
    "applied migration",
    "resolved after backoff",
];

const PATHS: &[&str] = &[
    "/api/orders",
    "/api/users/{id}",
    "/api/payments",
    "/health",
    "/login",
];

const STATUS_CODES: &[u16] = &[200, 201, 204, 400, 404, 500];

const METHODS: &[&str] = &["get", "post", "put", "delete"];

const LOG_TAGS: &[&str] = &["info", "debug", "db", "cache", "auth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Request,
    Response,
    Error,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Log => "log",
            EventKind::Request => "request",
            EventKind::Response => "response",
            EventKind::Error => "error",
        }
    }
}

fn pick<'a>(list: &[&'a str], rng: &mut impl Rng) -> &'a str {
    list[rng.gen_range(0..list.len())]
}

fn generate_message(rng: &mut impl Rng) -> String {
    format!("{}: {}", pick(COMPONENTS, rng), pick(ACTIONS, rng))
}

pub fn generate_event(service: &ServiceConfig, rng: &mut impl Rng) -> Record {
    let kind = pick_kind(&service.event_weights, rng);
    let timestamp = Utc::now().timestamp_millis();
    let record = Record::new(kind.label(), timestamp);

    match kind {
        EventKind::Log => record
            .with_tags([pick(LOG_TAGS, rng), service.name.as_str()])
            .with_data(generate_message(rng)),
        EventKind::Request => record.with_data(json!({
            "id": Uuid::new_v4().to_string(),
            "method": pick(METHODS, rng),
            "path": pick(PATHS, rng),
            "message": format!("{} handled request", service.name),
            "tags": ["api", service.name],
        })),
        EventKind::Response => {
            let status = STATUS_CODES[rng.gen_range(0..STATUS_CODES.len())];
            record.with_data(json!({
                "id": Uuid::new_v4().to_string(),
                "method": pick(METHODS, rng),
                "path": pick(PATHS, rng),
                "statusCode": status,
                "responseTime": rng.gen_range(1u64..800),
            }))
        }
        EventKind::Error => record
            .with_tags(["error", service.name.as_str()])
            .with_data(json!({ "error": generate_message(rng) })),
    }
}

/// Push events for `service` into `tx` until `duration` elapses (zero means
/// forever) or the receiving side goes away.
pub async fn emit_events(service: ServiceConfig, tx: mpsc::Sender<Record>, duration: Duration) {
    let mut rng = StdRng::from_entropy();
    let start = Instant::now();
    let mean_interval_ms = 1000.0 / service.rate_per_sec;

    while duration.is_zero() || start.elapsed() < duration {
        let event = generate_event(&service, &mut rng);
        if tx.send(event).await.is_err() {
            break;
        }

        // Exponential inter-arrival time (Poisson process)
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        let delay_ms = (-mean_interval_ms * u.ln()) as u64;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

fn pick_kind(weights: &EventWeights, rng: &mut impl Rng) -> EventKind {
    let total = weights.log + weights.request + weights.response + weights.error;
    let roll: f64 = rng.gen_range(0.0..total);

    if roll < weights.log {
        EventKind::Log
    } else if roll < weights.log + weights.request {
        EventKind::Request
    } else if roll < weights.log + weights.request + weights.response {
        EventKind::Response
    } else {
        EventKind::Error
    }
}
