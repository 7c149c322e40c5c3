use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-bounded exclusive-work token for multi-instance coordination.
/// Expired leases are stealable by any holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLease {
    pub lease_name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Stamped when a guarded tick completes; heartbeat source for metrics.
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl SchedulerLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder && !self.is_expired(now)
    }
}

pub const EVALUATE_LEASE: &str = "alert-evaluate";
pub const DISPATCH_LEASE: &str = "notification-dispatch";

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::SchedulerLease;

    #[test]
    fn expired_lease_is_not_held() {
        let now = Utc::now();
        let lease = SchedulerLease {
            lease_name: "alert-evaluate".to_string(),
            holder: "instance-a".to_string(),
            acquired_at: now - Duration::seconds(120),
            expires_at: now - Duration::seconds(1),
            last_tick_at: None,
        };

        assert!(lease.is_expired(now));
        assert!(!lease.held_by("instance-a", now));
    }

    #[test]
    fn unexpired_lease_is_held_only_by_its_holder() {
        let now = Utc::now();
        let lease = SchedulerLease {
            lease_name: "notification-dispatch".to_string(),
            holder: "instance-a".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(90),
            last_tick_at: Some(now),
        };

        assert!(lease.held_by("instance-a", now));
        assert!(!lease.held_by("instance-b", now));
    }
}
