/// Broker-assigned job identifiers are opaque strings.
pub type JobId = String;

/// All broker timestamps are UTC milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Current UTC time in milliseconds since the Unix epoch.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(now_ms() > 1_577_836_800_000);
    }
}
