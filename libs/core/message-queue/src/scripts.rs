//! Lua scripts for every multi-key mutation.
//!
//! Each script guards on the source member still being present and returns 0
//! when it is already gone, so concurrent callers never duplicate a move.
//! Promotion also checks the member's score, since a recurring entry is
//! re-added under the same member with its next due time.

use strum::{AsRefStr, Display, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum QueueScript {
    /// KEYS: ready, stats. ARGV: payload, stat field
    Enqueue,
    /// KEYS: scheduled, stats. ARGV: payload, score, stat field
    Schedule,
    /// KEYS: scheduled, ready, stats.
    /// ARGV: member, expected score, delivery payload ('' drops it), next member ('' for none),
    /// next score, stat field
    Promote,
    /// KEYS: list, stats. ARGV: payload, stat field
    Release,
    /// KEYS: source list, destination list, stats. ARGV: payload, new payload, stat field
    TransferList,
    /// KEYS: source list, scheduled, stats. ARGV: payload, new payload, score, stat field
    TransferScheduled,
    /// KEYS: heartbeats, processing. ARGV: consumer id
    ReleaseConsumer,
}

impl QueueScript {
    pub fn source(&self) -> &'static str {
        match self {
            QueueScript::Enqueue => ENQUEUE,
            QueueScript::Schedule => SCHEDULE,
            QueueScript::Promote => PROMOTE,
            QueueScript::Release => RELEASE,
            QueueScript::TransferList => TRANSFER_LIST,
            QueueScript::TransferScheduled => TRANSFER_SCHEDULED,
            QueueScript::ReleaseConsumer => RELEASE_CONSUMER,
        }
    }
}

const ENQUEUE: &str = r#"
redis.call('LPUSH', KEYS[1], ARGV[1])
redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
return 1
"#;

const SCHEDULE: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HINCRBY', KEYS[2], ARGV[3], 1)
return 1
"#;

const PROMOTE: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
if ARGV[3] ~= '' then
  redis.call('LPUSH', KEYS[2], ARGV[3])
end
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[1], ARGV[5], ARGV[4])
end
redis.call('HINCRBY', KEYS[3], ARGV[6], 1)
return 1
"#;

const RELEASE: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
return 1
"#;

const TRANSFER_LIST: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[2])
redis.call('HINCRBY', KEYS[3], ARGV[3], 1)
return 1
"#;

const TRANSFER_SCHEDULED: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('HINCRBY', KEYS[3], ARGV[4], 1)
return 1
"#;

const RELEASE_CONSUMER: &str = r#"
if redis.call('LLEN', KEYS[2]) > 0 then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_script_returns_a_status() {
        for script in QueueScript::iter() {
            assert!(script.source().contains("return 1"), "{} has no success return", script);
        }
    }

    #[test]
    fn test_guarded_scripts_return_zero_when_member_gone() {
        for script in [
            QueueScript::Promote,
            QueueScript::Release,
            QueueScript::TransferList,
            QueueScript::TransferScheduled,
            QueueScript::ReleaseConsumer,
        ] {
            assert!(script.source().contains("return 0"), "{} is not guarded", script);
        }
    }

    #[test]
    fn test_promote_checks_expected_score() {
        assert!(QueueScript::Promote.source().contains("ZSCORE"));
    }
}
