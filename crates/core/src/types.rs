/// Identifier of a single generation request. Doubles as the correlation id
/// threaded through error records and the `job_id` of progress events.
pub type RequestId = uuid::Uuid;

/// Identifier of a submitted batch.
pub type BatchId = uuid::Uuid;

/// Identifier of a configured provider (e.g. `"image-http"`).
pub type ProviderId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Money amounts are tracked as US dollars. Cost tracking is best-effort.
pub type Usd = f64;
