// =============================================================================
// Decision Engine — debounce, cooldown, and state→decision policy
// =============================================================================
//
// Pure with respect to the store: `decide` takes the looked-up row as an
// argument rather than owning the store handle, so callers control the
// lookup (and its TTL semantics) while the engine owns only its two
// in-memory timing tables. Those tables are private and mutated only from
// the single-threaded application scheduler that calls `decide`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::codec;
use crate::store::TagRow;
use crate::types::{Decision, TagState};

/// Monotonic millisecond clock, injectable so tests don't depend on wall time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Outcome of a single `decide` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub reason: &'static str,
    pub qr: String,
    /// True if an AlarmEvent should be appended and a pulse published.
    pub should_act: bool,
}

struct Tables {
    last_seen_ms: HashMap<String, i64>,
    last_alarm_ms: HashMap<String, i64>,
}

pub struct DecisionEngine {
    clock: Box<dyn Clock>,
    tables: Mutex<Tables>,
}

impl DecisionEngine {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables {
                last_seen_ms: HashMap::new(),
                last_alarm_ms: HashMap::new(),
            }),
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Box::new(SystemClock))
    }

    /// Non-mutating peek: would a detection of `epc` right now fall inside
    /// the debounce window? Lets callers skip a decode and store lookup
    /// whose result `decide` would discard anyway; `decide` remains the
    /// single authoritative check and is always called afterwards.
    pub fn would_debounce(&self, epc: &str, debounce_ms: i64) -> bool {
        let now_ms = self.clock.now_ms();
        let tables = self.tables.lock();
        let last_seen = tables.last_seen_ms.get(epc).copied().unwrap_or(i64::MIN / 2);
        now_ms - last_seen < debounce_ms
    }

    /// Decode the EPC and classify against the already-looked-up row,
    /// applying debounce and alarm cooldown. `row` must come from a lookup
    /// performed with a TTL-consistent `now` by the caller.
    pub fn decide(
        &self,
        epc: &str,
        debounce_ms: i64,
        alarm_cooldown_ms: i64,
        pass_when_in_cart: bool,
        row: Option<&TagRow>,
    ) -> DecisionOutcome {
        let now_ms = self.clock.now_ms();
        let mut tables = self.tables.lock();

        let last_seen = tables.last_seen_ms.get(epc).copied().unwrap_or(i64::MIN / 2);
        if now_ms - last_seen < debounce_ms {
            return DecisionOutcome {
                decision: Decision::Pass,
                reason: "debounced",
                qr: String::new(),
                should_act: false,
            };
        }
        tables.last_seen_ms.insert(epc.to_string(), now_ms);

        let qr = codec::decode(epc);

        let (candidate_alarm, reason): (bool, &'static str) = match row {
            None => (true, "qr_not_found"),
            Some(r) => match r.state {
                TagState::Paid => (false, "paid"),
                TagState::InCart if pass_when_in_cart => (false, "in_cart_allowed"),
                TagState::InCart => (true, "in_cart_not_allowed"),
            },
        };

        if !candidate_alarm {
            return DecisionOutcome {
                decision: Decision::Pass,
                reason,
                qr,
                should_act: false,
            };
        }

        let last_alarm = tables.last_alarm_ms.get(epc).copied().unwrap_or(i64::MIN / 2);
        if now_ms - last_alarm < alarm_cooldown_ms {
            return DecisionOutcome {
                decision: Decision::Pass,
                reason: "alarm_cooldown",
                qr,
                should_act: false,
            };
        }
        tables.last_alarm_ms.insert(epc.to_string(), now_ms);

        DecisionOutcome {
            decision: Decision::Alarm,
            reason,
            qr,
            should_act: true,
        }
    }

    /// Drop table entries untouched for more than `max_age_ms`. Best-effort;
    /// eviction never affects correctness, only memory.
    pub fn evict_older_than(&self, max_age_ms: i64) {
        let now_ms = self.clock.now_ms();
        let mut tables = self.tables.lock();
        tables
            .last_seen_ms
            .retain(|_, ts| now_ms - *ts <= max_age_ms);
        tables
            .last_alarm_ms
            .retain(|_, ts| now_ms - *ts <= max_age_ms);
    }

    #[cfg(test)]
    pub fn table_sizes(&self) -> (usize, usize) {
        let tables = self.tables.lock();
        (tables.last_seen_ms.len(), tables.last_alarm_ms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    struct FakeClock(AtomicI64);

    impl FakeClock {
        fn new() -> Self {
            Self(AtomicI64::new(0))
        }
        fn advance(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for Arc<FakeClock> {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn in_cart_row(qr: &str) -> TagRow {
        TagRow {
            qr_code: qr.to_string(),
            state: TagState::InCart,
            order_id: Some("O1".to_string()),
            pos_id: None,
            store_id: None,
            updated_at: 0,
            expires_at: i64::MAX,
        }
    }

    fn paid_row(qr: &str) -> TagRow {
        TagRow {
            state: TagState::Paid,
            ..in_cart_row(qr)
        }
    }

    // scenario 1
    #[test]
    fn in_cart_allowed_passes_without_audit() {
        let engine = DecisionEngine::new(Box::new(FakeClock::new()));
        let row = in_cart_row("ABC1234");
        let outcome = engine.decide("A0B0C01234FFFFFFFFFF", 0, 0, true, Some(&row));
        assert_eq!(outcome.decision, Decision::Pass);
        assert_eq!(outcome.reason, "in_cart_allowed");
        assert_eq!(outcome.qr, "ABC1234");
        assert!(!outcome.should_act);
    }

    // scenario 2
    #[test]
    fn in_cart_not_allowed_alarms_and_acts() {
        let engine = DecisionEngine::new(Box::new(FakeClock::new()));
        let row = in_cart_row("ABC1234");
        let outcome = engine.decide("A0B0C01234FFFFFFFFFF", 0, 0, false, Some(&row));
        assert_eq!(outcome.decision, Decision::Alarm);
        assert_eq!(outcome.reason, "in_cart_not_allowed");
        assert_eq!(outcome.qr, "ABC1234");
        assert!(outcome.should_act);
    }

    // scenario 3
    #[test]
    fn paid_always_passes_regardless_of_pass_when_in_cart() {
        let engine = DecisionEngine::new(Box::new(FakeClock::new()));
        let row = paid_row("ABC1234");
        let outcome = engine.decide("A0B0C01234FFFFFFFFFF", 0, 0, false, Some(&row));
        assert_eq!(outcome.decision, Decision::Pass);
        assert_eq!(outcome.reason, "paid");
    }

    // scenario 4
    #[test]
    fn alarm_cooldown_suppresses_repeat_alarms_until_expiry() {
        let clock = Arc::new(FakeClock::new());
        let engine = DecisionEngine::new(Box::new(clock.clone()));

        let first = engine.decide("A0B0C0FFFF", 0, 500, false, None);
        assert_eq!(first.decision, Decision::Alarm);
        assert_eq!(first.qr, "ABC");
        assert!(first.should_act);

        clock.advance(200);
        let second = engine.decide("A0B0C0FFFF", 0, 500, false, None);
        assert_eq!(second.decision, Decision::Pass);
        assert_eq!(second.reason, "alarm_cooldown");
        assert_eq!(second.qr, "ABC");
        assert!(!second.should_act);

        clock.advance(400);
        let third = engine.decide("A0B0C0FFFF", 0, 500, false, None);
        assert_eq!(third.decision, Decision::Alarm);
        assert!(third.should_act);
    }

    #[test]
    fn debounce_suppresses_repeat_reads_and_skips_decode() {
        let clock = Arc::new(FakeClock::new());
        let engine = DecisionEngine::new(Box::new(clock.clone()));

        let first = engine.decide("A0B0C01234FFFFFFFFFF", 1000, 0, true, None);
        assert_eq!(first.decision, Decision::Alarm);

        clock.advance(500);
        let second = engine.decide("A0B0C01234FFFFFFFFFF", 1000, 0, true, None);
        assert_eq!(second.decision, Decision::Pass);
        assert_eq!(second.reason, "debounced");
        assert_eq!(second.qr, "");
    }

    #[test]
    fn would_debounce_peeks_without_mutating_state() {
        let clock = Arc::new(FakeClock::new());
        let engine = DecisionEngine::new(Box::new(clock.clone()));

        assert!(!engine.would_debounce("A0B0C0FFFF", 1000));
        // A peek alone must not refresh last_seen.
        assert!(!engine.would_debounce("A0B0C0FFFF", 1000));

        engine.decide("A0B0C0FFFF", 1000, 0, true, None);
        assert!(engine.would_debounce("A0B0C0FFFF", 1000));

        clock.advance(1000);
        assert!(!engine.would_debounce("A0B0C0FFFF", 1000));
    }

    #[test]
    fn qr_not_found_is_candidate_alarm() {
        let engine = DecisionEngine::new(Box::new(FakeClock::new()));
        let outcome = engine.decide("A0B0C01234FFFFFFFFFF", 0, 0, true, None);
        assert_eq!(outcome.decision, Decision::Alarm);
        assert_eq!(outcome.reason, "qr_not_found");
    }

    #[test]
    fn debounce_and_cooldown_do_not_interact() {
        let clock = Arc::new(FakeClock::new());
        let engine = DecisionEngine::new(Box::new(clock.clone()));

        let first = engine.decide("A0B0C0FFFF", 0, 10_000, false, None);
        assert!(first.should_act);

        clock.advance(50);
        // outside debounce window (debounce_ms=0) but inside cooldown window
        let second = engine.decide("A0B0C0FFFF", 0, 10_000, false, None);
        assert_eq!(second.reason, "alarm_cooldown");
        assert!(!second.should_act);
    }

    #[test]
    fn evict_older_than_clears_stale_entries_only() {
        let clock = Arc::new(FakeClock::new());
        let engine = DecisionEngine::new(Box::new(clock.clone()));
        engine.decide("A0B0C0FFFF", 0, 0, false, None);
        assert_eq!(engine.table_sizes(), (1, 1));

        clock.advance(3700 * 1000);
        engine.evict_older_than(3600 * 1000);
        assert_eq!(engine.table_sizes(), (0, 0));
    }
}
