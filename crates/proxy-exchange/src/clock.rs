use time::OffsetDateTime;

/// Second plus nanosecond wall-clock stamp, as carried in `clock`/`ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: i64,
    pub ns: i64,
}

pub fn timespec_now() -> Timespec {
    let now = OffsetDateTime::now_utc();
    Timespec {
        sec: now.unix_timestamp(),
        ns: now.nanosecond() as i64,
    }
}

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn now_millis() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).max(0) as u64
}
