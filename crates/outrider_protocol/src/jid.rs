//! Job identifiers: 20-digit UTC timestamps with a microsecond field,
//! bumped when two jobs land in the same microsecond so ids stay
//! monotone-unique within a process.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static LAST_JID: Mutex<u128> = Mutex::new(0);

/// Sequence numbers for the request channel.
static SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a job id: `%Y%m%d%H%M%S%6f` in UTC.
pub fn gen() -> String {
    let stamp: u128 = Utc::now()
        .format("%Y%m%d%H%M%S%6f")
        .to_string()
        .parse()
        .unwrap_or(0);
    let mut last = LAST_JID.lock().unwrap_or_else(|e| e.into_inner());
    let jid = if stamp <= *last { *last + 1 } else { stamp };
    *last = jid;
    format!("{jid:020}")
}

/// Check whether a string looks like a job id.
pub fn is_jid(candidate: &str) -> bool {
    candidate.len() == 20 && candidate.bytes().all(|b| b.is_ascii_digit())
}

/// Next request sequence number.
pub fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jids_are_monotone_unique() {
        let a = gen();
        let b = gen();
        let c = gen();
        assert!(a < b && b < c);
        assert!(is_jid(&a) && is_jid(&b) && is_jid(&c));
    }

    #[test]
    fn jid_validation() {
        assert!(is_jid("20250101000001000000"));
        assert!(!is_jid("req"));
        assert!(!is_jid("2025010100000100000x"));
        assert!(!is_jid("202501010000010000001"));
    }
}
