use chrono::Utc;

/// Unix seconds. Components take `now: i64` explicitly so tests pin
/// the clock; production callers pass this.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
