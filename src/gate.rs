//! Admission gate: the Redis check-and-reserve step that runs before any
//! durable write.
//!
//! A reservation sets two markers in one Lua script:
//! - **User key**: `booking:user:{user_id}`
//! - **Table slot key**: `booking:{YYYY-MM-DD}:table{table_id}:slot:{HHMMSS}`
//!
//! Both expire together at the end of the slot's calendar day, so a marker
//! orphaned by a crashed saga stops blocking the table by the next day.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use log::debug;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

use crate::error::{ConflictKind, GateError};
use crate::models::NewBooking;

/// Second of the day (UTC) at which reservation markers expire: 23:59:59.
pub const LEASE_END_OF_DAY_SECS: u32 = 86_399;

const STATUS_OK: i64 = 0;
const STATUS_USER_BOOKED: i64 = 1;
const STATUS_TABLE_TAKEN: i64 = 2;

// KEYS[1] = user key, KEYS[2] = table slot key
// ARGV[1] = marker payload, ARGV[2] = ttl (ms)
const RESERVE_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 1
    end

    if redis.call("EXISTS", KEYS[2]) == 1 then
        return 2
    end

    redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
    redis.call("SET", KEYS[2], ARGV[1], "PX", ARGV[2])
    return 0
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateKeys {
    pub user: String,
    pub table_slot: String,
}

impl GateKeys {
    pub fn new(user_id: i64, table_id: i16, slot: DateTime<Utc>) -> Self {
        Self {
            user: format!("booking:user:{}", user_id),
            table_slot: format!(
                "booking:{}:table{}:slot:{}",
                slot.format("%Y-%m-%d"),
                table_id,
                slot.format("%H%M%S"),
            ),
        }
    }

    pub fn for_booking(booking: &NewBooking) -> Self {
        Self::new(booking.user_id, booking.table_id, booking.booking_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Conflict(ConflictKind),
}

/// Lifetime of a reservation marker: from `now` until the end of the slot's
/// calendar day. `None` when that moment has already passed.
pub fn lease_ttl(slot: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    let end_of_day = NaiveTime::from_num_seconds_from_midnight_opt(LEASE_END_OF_DAY_SECS, 0)?;
    let expires_at = slot.date_naive().and_time(end_of_day).and_utc();

    (expires_at - now).to_std().ok().filter(|ttl| !ttl.is_zero())
}

#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Atomically claim both keys, or claim neither.
    async fn reserve(&self, keys: &GateKeys, marker: &NewBooking, ttl: Duration) -> Result<Admission, GateError>;

    /// Drop both keys regardless of who set them.
    async fn release(&self, keys: &GateKeys) -> Result<(), GateError>;
}

#[derive(Clone)]
pub struct RedisGate {
    conn_manager: ConnectionManager,
    reserve_script: Script,
}

impl RedisGate {
    pub async fn connect(redis_url: &str) -> Result<Self, GateError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;

        Ok(Self {
            conn_manager,
            reserve_script: Script::new(RESERVE_SCRIPT),
        })
    }
}

#[async_trait]
impl AdmissionGate for RedisGate {
    async fn reserve(&self, keys: &GateKeys, marker: &NewBooking, ttl: Duration) -> Result<Admission, GateError> {
        let mut conn = self.conn_manager.clone();
        let payload = serde_json::to_string(marker)?;
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let status: i64 = self
            .reserve_script
            .key(&keys.user)
            .key(&keys.table_slot)
            .arg(payload)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!("Reserve {} / {} (ttl {}ms) -> {}", keys.user, keys.table_slot, ttl_ms, status);

        match status {
            STATUS_OK => Ok(Admission::Admitted),
            STATUS_USER_BOOKED => Ok(Admission::Conflict(ConflictKind::UserAlreadyBooked)),
            STATUS_TABLE_TAKEN => Ok(Admission::Conflict(ConflictKind::TableSlotTaken)),
            other => Err(GateError::UnexpectedStatus(other)),
        }
    }

    async fn release(&self, keys: &GateKeys) -> Result<(), GateError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(vec![keys.user.as_str(), keys.table_slot.as_str()]).await?;

        debug!("Released {} / {} ({} keys removed)", keys.user, keys.table_slot, removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn keys_follow_wire_format() {
        let keys = GateKeys::new(1, 5, at(19, 0));
        assert_eq!(keys.user, "booking:user:1");
        assert_eq!(keys.table_slot, "booking:2024-06-01:table5:slot:190000");
    }

    #[test]
    fn same_slot_different_users_share_table_key() {
        assert_eq!(GateKeys::new(1, 5, at(19, 0)).table_slot, GateKeys::new(2, 5, at(19, 0)).table_slot);
        assert_ne!(GateKeys::new(1, 5, at(19, 0)).table_slot, GateKeys::new(1, 5, at(20, 0)).table_slot);
    }

    #[test]
    fn slots_seconds_apart_get_distinct_table_keys() {
        let later = at(19, 0) + chrono::Duration::seconds(30);
        assert_eq!(GateKeys::new(1, 5, later).table_slot, "booking:2024-06-01:table5:slot:190030");
        assert_ne!(GateKeys::new(1, 5, at(19, 0)).table_slot, GateKeys::new(2, 5, later).table_slot);
    }

    #[test]
    fn lease_runs_until_end_of_slot_day() {
        let ttl = lease_ttl(at(19, 0), at(10, 0)).unwrap();
        // 10:00:00 -> 23:59:59
        assert_eq!(ttl, Duration::from_secs(14 * 3600 - 1));
    }

    #[test]
    fn lease_is_none_once_the_day_is_over() {
        let next_day = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap();
        assert!(lease_ttl(at(19, 0), next_day).is_none());

        let end = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap();
        assert!(lease_ttl(at(19, 0), end).is_none());
    }

    mod live {
        //! These need a Redis server at `REDIS_URL` (default localhost).

        use super::*;
        use std::sync::Arc;
        use uuid::Uuid;

        async fn gate() -> RedisGate {
            let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
            RedisGate::connect(&url).await.expect("redis should be reachable")
        }

        // Random table and user ids keep parallel runs apart.
        fn unique_booking(user_id: i64, table_id: i16) -> NewBooking {
            let day = Utc::now() + chrono::Duration::days(2);
            let slot = day.date_naive().and_hms_opt(19, 0, 0).unwrap().and_utc();
            NewBooking { user_id, table_id, booking_time: slot }
        }

        fn random_id() -> i64 {
            (Uuid::new_v4().as_u128() % 1_000_000_000) as i64 + 1
        }

        fn random_table() -> i16 {
            (random_id() % 30_000) as i16 + 1
        }

        #[tokio::test]
        #[ignore] // Requires Redis running
        async fn concurrent_reserves_admit_exactly_one() {
            let gate = Arc::new(gate().await);
            let table_id = random_table();
            let base_user = random_id();

            let mut handles = Vec::new();
            for i in 0..16 {
                let gate = gate.clone();
                let booking = unique_booking(base_user + i, table_id);
                handles.push(tokio::spawn(async move {
                    let keys = GateKeys::for_booking(&booking);
                    gate.reserve(&keys, &booking, Duration::from_secs(30)).await.unwrap()
                }));
            }

            let mut admitted = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Admission::Admitted => admitted += 1,
                    Admission::Conflict(kind) => assert_eq!(kind, ConflictKind::TableSlotTaken),
                }
            }
            assert_eq!(admitted, 1);
        }

        #[tokio::test]
        #[ignore] // Requires Redis running
        async fn second_table_same_day_is_user_conflict() {
            let gate = gate().await;
            let user = random_id();
            let first = unique_booking(user, random_table());
            let mut second = unique_booking(user, random_table());
            second.booking_time += chrono::Duration::hours(1);

            let ttl = Duration::from_secs(30);
            assert_eq!(gate.reserve(&GateKeys::for_booking(&first), &first, ttl).await.unwrap(), Admission::Admitted);
            assert_eq!(
                gate.reserve(&GateKeys::for_booking(&second), &second, ttl).await.unwrap(),
                Admission::Conflict(ConflictKind::UserAlreadyBooked)
            );

            gate.release(&GateKeys::for_booking(&first)).await.unwrap();
        }

        #[tokio::test]
        #[ignore] // Requires Redis running
        async fn expired_marker_no_longer_conflicts() {
            let gate = gate().await;
            let booking = unique_booking(random_id(), random_table());
            let keys = GateKeys::for_booking(&booking);

            assert_eq!(gate.reserve(&keys, &booking, Duration::from_millis(150)).await.unwrap(), Admission::Admitted);
            assert!(matches!(gate.reserve(&keys, &booking, Duration::from_secs(30)).await.unwrap(), Admission::Conflict(_)));

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(gate.reserve(&keys, &booking, Duration::from_secs(30)).await.unwrap(), Admission::Admitted);

            gate.release(&keys).await.unwrap();
        }

        #[tokio::test]
        #[ignore] // Requires Redis running
        async fn release_frees_keys_before_ttl() {
            let gate = gate().await;
            let booking = unique_booking(random_id(), random_table());
            let keys = GateKeys::for_booking(&booking);
            let ttl = Duration::from_secs(3600);

            assert_eq!(gate.reserve(&keys, &booking, ttl).await.unwrap(), Admission::Admitted);
            gate.release(&keys).await.unwrap();
            assert_eq!(gate.reserve(&keys, &booking, ttl).await.unwrap(), Admission::Admitted);

            gate.release(&keys).await.unwrap();
        }

        #[tokio::test]
        #[ignore] // Requires Redis running
        async fn rejected_reserve_leaves_other_key_untouched() {
            let gate = gate().await;
            let table_id = random_table();
            let holder = unique_booking(random_id(), table_id);
            let ttl = Duration::from_secs(30);
            gate.reserve(&GateKeys::for_booking(&holder), &holder, ttl).await.unwrap();

            // Different user, same table slot: the new user's key must not be set.
            let challenger = unique_booking(random_id(), table_id);
            let challenger_keys = GateKeys::for_booking(&challenger);
            assert_eq!(
                gate.reserve(&challenger_keys, &challenger, ttl).await.unwrap(),
                Admission::Conflict(ConflictKind::TableSlotTaken)
            );

            let mut conn = gate.conn_manager.clone();
            let exists: bool = conn.exists(&challenger_keys.user).await.unwrap();
            assert!(!exists);

            gate.release(&GateKeys::for_booking(&holder)).await.unwrap();
        }
    }
}
