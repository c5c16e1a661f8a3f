//! Concurrency groups and fixed-window rate-limit buckets.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use taskloom_types::workflow::ConcurrencyLimitStrategy;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Concurrency groups
// ---------------------------------------------------------------------------

/// What occupies a concurrency slot: a whole run (workflow-scoped groups)
/// or one task of a run (task-scoped groups).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Member {
    Run(Uuid),
    Task(Uuid, String),
}

impl Member {
    pub(crate) fn run_id(&self) -> Uuid {
        match self {
            Member::Run(id) | Member::Task(id, _) => *id,
        }
    }
}

/// One group a member must be admitted to.
#[derive(Debug, Clone)]
pub(crate) struct GroupRequest {
    pub key: String,
    pub max_runs: u32,
    pub strategy: ConcurrencyLimitStrategy,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Admission {
    /// Holds a slot in every requested group. `preempted` members lost theirs.
    Admitted { preempted: Vec<Member> },
    /// Waiting in the queue of at least one round-robin group.
    Queued,
    /// Rejected by a cancel-newest group.
    Rejected,
}

#[derive(Debug)]
struct Group {
    max_runs: usize,
    active: VecDeque<Member>,
    queued: VecDeque<Member>,
}

impl Group {
    fn is_full(&self) -> bool {
        self.active.len() >= self.max_runs
    }

    /// Whether `member` has to keep waiting: the group is full, or someone
    /// queued earlier is still waiting.
    fn blocks(&self, member: &Member) -> bool {
        if self.is_full() {
            return true;
        }
        match self.queued.iter().position(|m| m == member) {
            Some(position) => position > 0,
            None => !self.queued.is_empty(),
        }
    }
}

/// All concurrency groups known to the engine, keyed by resolved group key.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyGroups {
    groups: HashMap<String, Group>,
}

impl ConcurrencyGroups {
    /// Try to admit `member` into every group in `requests`.
    ///
    /// Requests apply conjunctively. A cancel-newest rejection takes
    /// precedence over queueing; preemption happens only once the member is
    /// sure to be admitted everywhere. Calling this again for a queued
    /// member is idempotent.
    pub(crate) fn try_admit(&mut self, member: &Member, requests: &[GroupRequest]) -> Admission {
        for request in requests {
            let group = self.group(request);
            if group.active.contains(member) {
                continue;
            }
            if request.strategy == ConcurrencyLimitStrategy::CancelNewest && group.is_full() {
                return Admission::Rejected;
            }
        }

        let mut blocked = false;
        for request in requests {
            if request.strategy != ConcurrencyLimitStrategy::GroupRoundRobin {
                continue;
            }
            let group = self.group(request);
            if group.active.contains(member) || !group.blocks(member) {
                continue;
            }
            if !group.queued.contains(member) {
                group.queued.push_back(member.clone());
            }
            blocked = true;
        }
        if blocked {
            return Admission::Queued;
        }

        let mut preempted = Vec::new();
        for request in requests {
            let group = self.group(request);
            group.queued.retain(|m| m != member);
            if group.active.contains(member) {
                continue;
            }
            // Only cancel-in-progress groups can still be full here.
            while group.is_full() {
                match group.active.pop_front() {
                    Some(oldest) => preempted.push(oldest),
                    None => break,
                }
            }
            group.active.push_back(member.clone());
        }
        preempted.dedup();
        Admission::Admitted { preempted }
    }

    /// Drop `member` from every group, active or queued.
    pub(crate) fn release(&mut self, member: &Member) {
        for group in self.groups.values_mut() {
            group.active.retain(|m| m != member);
            group.queued.retain(|m| m != member);
        }
        self.groups
            .retain(|_, g| !g.active.is_empty() || !g.queued.is_empty());
    }

    /// Drop every member belonging to `run_id`.
    pub(crate) fn release_run(&mut self, run_id: Uuid) {
        for group in self.groups.values_mut() {
            group.active.retain(|m| m.run_id() != run_id);
            group.queued.retain(|m| m.run_id() != run_id);
        }
        self.groups
            .retain(|_, g| !g.active.is_empty() || !g.queued.is_empty());
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self, key: &str) -> usize {
        self.groups.get(key).map(|g| g.active.len()).unwrap_or(0)
    }

    fn group(&mut self, request: &GroupRequest) -> &mut Group {
        let group = self
            .groups
            .entry(request.key.clone())
            .or_insert_with(|| Group {
                max_runs: request.max_runs.max(1) as usize,
                active: VecDeque::new(),
                queued: VecDeque::new(),
            });
        group.max_runs = request.max_runs.max(1) as usize;
        group
    }
}

// ---------------------------------------------------------------------------
// Rate-limit buckets
// ---------------------------------------------------------------------------

/// Units one task attempt takes from one bucket.
#[derive(Debug, Clone)]
pub(crate) struct BucketRequest {
    pub key: String,
    pub units: u32,
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Consumption {
    Granted,
    /// Not enough units left; the earliest window reset.
    Exhausted { retry_at: DateTime<Utc> },
    /// The request can never fit into the bucket.
    Impossible { key: String },
}

#[derive(Debug)]
struct Bucket {
    limit: u32,
    window: Duration,
    window_start: DateTime<Utc>,
    used: u32,
}

impl Bucket {
    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.window_start + self.window {
            self.window_start = now;
            self.used = 0;
        }
    }

    fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RateBuckets {
    buckets: HashMap<String, Bucket>,
}

impl RateBuckets {
    /// Update the limit of a bucket. The current window keeps its usage.
    pub(crate) fn configure(&mut self, key: &str, limit: u32, window: Duration, now: DateTime<Utc>) {
        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            limit,
            window,
            window_start: now,
            used: 0,
        });
        bucket.limit = limit;
        bucket.window = window;
    }

    /// Take units from every requested bucket, or from none of them.
    pub(crate) fn try_consume(
        &mut self,
        requests: &[BucketRequest],
        now: DateTime<Utc>,
    ) -> Consumption {
        let mut retry_at: Option<DateTime<Utc>> = None;
        for request in requests {
            if request.units > request.limit {
                return Consumption::Impossible {
                    key: request.key.clone(),
                };
            }
            let bucket = self.buckets.entry(request.key.clone()).or_insert(Bucket {
                limit: request.limit,
                window: request.window,
                window_start: now,
                used: 0,
            });
            bucket.limit = request.limit;
            bucket.window = request.window;
            bucket.roll(now);
            if bucket.remaining() < request.units {
                let reset = bucket.window_start + bucket.window;
                // Every exhausted bucket must have reset before a retry can pass.
                retry_at = Some(retry_at.map_or(reset, |r| r.max(reset)));
            }
        }

        if let Some(retry_at) = retry_at {
            return Consumption::Exhausted { retry_at };
        }
        for request in requests {
            if let Some(bucket) = self.buckets.get_mut(&request.key) {
                bucket.used += request.units;
            }
        }
        Consumption::Granted
    }

    #[cfg(test)]
    pub(crate) fn used(&self, key: &str) -> u32 {
        self.buckets.get(key).map(|b| b.used).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, max_runs: u32, strategy: ConcurrencyLimitStrategy) -> GroupRequest {
        GroupRequest {
            key: key.into(),
            max_runs,
            strategy,
        }
    }

    fn run(n: u128) -> Member {
        Member::Run(Uuid::from_u128(n))
    }

    #[test]
    fn cancel_in_progress_preempts_oldest() {
        let mut groups = ConcurrencyGroups::default();
        let req = [request("k", 2, ConcurrencyLimitStrategy::CancelInProgress)];
        assert_eq!(
            groups.try_admit(&run(1), &req),
            Admission::Admitted { preempted: vec![] }
        );
        groups.try_admit(&run(2), &req);
        assert_eq!(
            groups.try_admit(&run(3), &req),
            Admission::Admitted {
                preempted: vec![run(1)]
            }
        );
        assert_eq!(groups.active_count("k"), 2);
    }

    #[test]
    fn cancel_newest_rejects_newcomer() {
        let mut groups = ConcurrencyGroups::default();
        let req = [request("k", 1, ConcurrencyLimitStrategy::CancelNewest)];
        groups.try_admit(&run(1), &req);
        assert_eq!(groups.try_admit(&run(2), &req), Admission::Rejected);
        assert_eq!(groups.active_count("k"), 1);
    }

    #[test]
    fn round_robin_queues_in_order() {
        let mut groups = ConcurrencyGroups::default();
        let req = [request("k", 1, ConcurrencyLimitStrategy::GroupRoundRobin)];
        groups.try_admit(&run(1), &req);
        assert_eq!(groups.try_admit(&run(2), &req), Admission::Queued);
        assert_eq!(groups.try_admit(&run(3), &req), Admission::Queued);

        groups.release(&run(1));
        // Run 3 is behind run 2.
        assert_eq!(groups.try_admit(&run(3), &req), Admission::Queued);
        assert!(matches!(
            groups.try_admit(&run(2), &req),
            Admission::Admitted { .. }
        ));
    }

    #[test]
    fn rejection_wins_over_queueing() {
        let mut groups = ConcurrencyGroups::default();
        let reqs = [
            request("a", 1, ConcurrencyLimitStrategy::GroupRoundRobin),
            request("b", 1, ConcurrencyLimitStrategy::CancelNewest),
        ];
        groups.try_admit(&run(1), &reqs);
        assert_eq!(groups.try_admit(&run(2), &reqs), Admission::Rejected);
    }

    #[test]
    fn separate_keys_do_not_interfere() {
        let mut groups = ConcurrencyGroups::default();
        groups.try_admit(&run(1), &[request("a", 1, ConcurrencyLimitStrategy::CancelNewest)]);
        assert!(matches!(
            groups.try_admit(&run(2), &[request("b", 1, ConcurrencyLimitStrategy::CancelNewest)]),
            Admission::Admitted { .. }
        ));
    }

    #[test]
    fn release_run_drops_its_tasks() {
        let mut groups = ConcurrencyGroups::default();
        let req = [request("t", 1, ConcurrencyLimitStrategy::GroupRoundRobin)];
        let id = Uuid::from_u128(7);
        groups.try_admit(&Member::Task(id, "a".into()), &req);
        groups.release_run(id);
        assert_eq!(groups.active_count("t"), 0);
    }

    #[test]
    fn buckets_are_all_or_nothing() {
        let now = Utc::now();
        let mut buckets = RateBuckets::default();
        let window = Duration::seconds(60);
        let a = BucketRequest {
            key: "a".into(),
            units: 1,
            limit: 2,
            window,
        };
        let b = BucketRequest {
            key: "b".into(),
            units: 1,
            limit: 1,
            window,
        };
        assert_eq!(buckets.try_consume(&[a.clone(), b.clone()], now), Consumption::Granted);
        assert_eq!(
            buckets.try_consume(&[a.clone(), b.clone()], now),
            Consumption::Exhausted {
                retry_at: now + window
            }
        );
        assert_eq!(buckets.used("a"), 1);

        let later = now + window;
        assert_eq!(buckets.try_consume(&[a, b], later), Consumption::Granted);
    }

    #[test]
    fn retry_waits_for_the_latest_exhausted_bucket() {
        let now = Utc::now();
        let mut buckets = RateBuckets::default();
        let minute = BucketRequest {
            key: "per-minute".into(),
            units: 1,
            limit: 1,
            window: Duration::seconds(60),
        };
        let hour = BucketRequest {
            key: "per-hour".into(),
            units: 1,
            limit: 1,
            window: Duration::seconds(3600),
        };
        let both = [minute, hour];
        assert_eq!(buckets.try_consume(&both, now), Consumption::Granted);
        assert_eq!(
            buckets.try_consume(&both, now),
            Consumption::Exhausted {
                retry_at: now + Duration::seconds(3600)
            }
        );
        assert_eq!(
            buckets.try_consume(&both, now + Duration::seconds(60)),
            Consumption::Exhausted {
                retry_at: now + Duration::seconds(3600)
            }
        );
        assert_eq!(
            buckets.try_consume(&both, now + Duration::seconds(3600)),
            Consumption::Granted
        );
    }

    #[test]
    fn oversized_request_is_impossible() {
        let mut buckets = RateBuckets::default();
        let req = BucketRequest {
            key: "tiny".into(),
            units: 5,
            limit: 2,
            window: Duration::seconds(1),
        };
        assert_eq!(
            buckets.try_consume(&[req], Utc::now()),
            Consumption::Impossible { key: "tiny".into() }
        );
    }
}
