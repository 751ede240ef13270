use super::{Command, Gateway, GatewayResult, Reply, ScriptArg, ScriptCall};
use crate::error::GatewayError;
use crate::scripts::QueueScript;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default, Clone)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl State {
    fn list(&mut self, key: &str) -> &mut VecDeque<String> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn lpush(&mut self, key: &str, value: &str) -> i64 {
        let list = self.list(key);
        list.push_front(value.to_string());
        list.len() as i64
    }

    /// Remove up to `count` occurrences from the head (`count == 0` removes all)
    fn lrem(&mut self, key: &str, count: i64, value: &str) -> usize {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let limit = if count <= 0 { usize::MAX } else { count as usize };
        let mut removed = 0;
        list.retain(|item| {
            if removed < limit && item == value {
                removed += 1;
                false
            } else {
                true
            }
        });
        if list.is_empty() {
            self.lists.remove(key);
        }
        removed
    }

    fn llen(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> Option<String> {
        let list = self.lists.get_mut(source)?;
        let value = list.pop_back()?;
        if list.is_empty() {
            self.lists.remove(source);
        }
        self.lpush(destination, &value);
        Some(value)
    }

    fn zadd(&mut self, key: &str, member: &str, score: i64) -> bool {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score)
            .is_none()
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.zsets.get(key)?.get(member).copied()
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    /// Members ordered by (score, member) like a Redis sorted set
    fn zsorted(&self, key: &str) -> Vec<(String, i64)> {
        let mut items: Vec<(String, i64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        items.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        items
    }

    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> GatewayResult<i64> {
        let hash = self.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| GatewayError::protocol("hash value is not an integer"))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let Some(hash) = self.hashes.get_mut(key) else {
            return false;
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    fn del(&mut self, key: &str) -> bool {
        let lists = self.lists.remove(key).is_some();
        let zsets = self.zsets.remove(key).is_some();
        let hashes = self.hashes.remove(key).is_some();
        lists || zsets || hashes
    }

    fn apply(&mut self, command: &Command) -> GatewayResult<Reply> {
        Ok(match command {
            Command::LPush { key, value } => Reply::Integer(self.lpush(key, value)),
            Command::LRem { key, count, value } => Reply::Integer(self.lrem(key, *count, value) as i64),
            Command::ZAdd { key, score, member } => Reply::Integer(self.zadd(key, member, *score) as i64),
            Command::ZRem { key, member } => Reply::Integer(self.zrem(key, member) as i64),
            Command::HSet { key, field, value } => {
                self.hset(key, field, value);
                Reply::Integer(1)
            }
            Command::HDel { key, field } => Reply::Integer(self.hdel(key, field) as i64),
            Command::HIncrBy { key, field, delta } => Reply::Integer(self.hincrby(key, field, *delta)?),
            Command::Del { key } => Reply::Integer(self.del(key) as i64),
        })
    }

    fn run_script(&mut self, call: &ScriptCall) -> GatewayResult<Reply> {
        let key = |i: usize| {
            call.keys
                .get(i)
                .map(String::as_str)
                .ok_or_else(|| GatewayError::protocol(format!("{}: missing key {}", call.script, i + 1)))
        };
        let arg = |i: usize| {
            call.args
                .get(i)
                .map(ScriptArg::as_str)
                .ok_or_else(|| GatewayError::protocol(format!("{}: missing argument {}", call.script, i + 1)))
        };
        let int_arg = |i: usize| {
            arg(i)?
                .parse::<i64>()
                .map_err(|_| GatewayError::protocol(format!("{}: argument {} is not an integer", call.script, i + 1)))
        };

        let applied = match call.script {
            QueueScript::Enqueue => {
                self.lpush(key(0)?, &arg(0)?);
                self.hincrby(key(1)?, &arg(1)?, 1)?;
                true
            }
            QueueScript::Schedule => {
                self.zadd(key(0)?, &arg(0)?, int_arg(1)?);
                self.hincrby(key(1)?, &arg(2)?, 1)?;
                true
            }
            QueueScript::Promote => {
                let member = arg(0)?;
                if self.zscore(key(0)?, &member) != Some(int_arg(1)?) {
                    return Ok(Reply::Integer(0));
                }
                self.zrem(key(0)?, &member);
                let delivery = arg(2)?;
                if !delivery.is_empty() {
                    self.lpush(key(1)?, &delivery);
                }
                let next = arg(3)?;
                if !next.is_empty() {
                    self.zadd(key(0)?, &next, int_arg(4)?);
                }
                self.hincrby(key(2)?, &arg(5)?, 1)?;
                true
            }
            QueueScript::Release => {
                if self.lrem(key(0)?, 1, &arg(0)?) == 0 {
                    return Ok(Reply::Integer(0));
                }
                self.hincrby(key(1)?, &arg(1)?, 1)?;
                true
            }
            QueueScript::TransferList => {
                if self.lrem(key(0)?, 1, &arg(0)?) == 0 {
                    return Ok(Reply::Integer(0));
                }
                self.lpush(key(1)?, &arg(1)?);
                self.hincrby(key(2)?, &arg(2)?, 1)?;
                true
            }
            QueueScript::TransferScheduled => {
                if self.lrem(key(0)?, 1, &arg(0)?) == 0 {
                    return Ok(Reply::Integer(0));
                }
                self.zadd(key(1)?, &arg(1)?, int_arg(2)?);
                self.hincrby(key(2)?, &arg(3)?, 1)?;
                true
            }
            QueueScript::ReleaseConsumer => {
                if self.llen(key(1)?) > 0 {
                    return Ok(Reply::Integer(0));
                }
                self.zrem(key(0)?, &arg(0)?);
                self.del(key(1)?);
                true
            }
        };
        Ok(Reply::Integer(applied as i64))
    }
}

fn slice_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-process gateway with the same semantics as the Redis scripts.
///
/// Every operation takes one lock, so each script and batch is atomic.
/// Transport failures can be injected with [`MemoryGateway::fail_next`] and
/// [`MemoryGateway::set_offline`].
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    pushed: Notify,
    offline: AtomicBool,
    failures: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commands fail with a transport error
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail every command until set back online
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> GatewayResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("memory gateway is offline".into()));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(GatewayError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, State>> {
        self.check()?;
        self.state
            .lock()
            .map_err(|_| GatewayError::Unavailable("memory gateway state poisoned".into()))
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn lpush(&self, key: &str, value: &str) -> GatewayResult<i64> {
        let len = self.lock()?.lpush(key, value);
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn rpop(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut state = self.lock()?;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<String>> {
        let state = self.lock()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match slice_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn llen(&self, key: &str) -> GatewayResult<usize> {
        Ok(self.lock()?.llen(key))
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> GatewayResult<usize> {
        Ok(self.lock()?.lrem(key, count as i64, value))
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> GatewayResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let moved = self.lock()?.rpoplpush(source, destination);
            if moved.is_some() {
                return Ok(moved);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> GatewayResult<bool> {
        Ok(self.lock()?.zadd(key, member, score))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        count: usize,
    ) -> GatewayResult<Vec<(String, i64)>> {
        let state = self.lock()?;
        Ok(state
            .zsorted(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .skip(offset)
            .take(count)
            .collect())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<(String, i64)>> {
        let items = self.lock()?.zsorted(key);
        Ok(match slice_range(items.len(), start, stop) {
            Some((from, to)) => items[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zcard(&self, key: &str) -> GatewayResult<usize> {
        Ok(self.lock()?.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool> {
        Ok(self.lock()?.zrem(key, member))
    }

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        Ok(self.lock()?.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        self.lock()?.hset(key, field, value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> GatewayResult<bool> {
        Ok(self.lock()?.hdel(key, field))
    }

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>> {
        Ok(self.lock()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> GatewayResult<i64> {
        self.lock()?.hincrby(key, field, delta)
    }

    async fn del(&self, key: &str) -> GatewayResult<bool> {
        Ok(self.lock()?.del(key))
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.check()
    }

    async fn eval(&self, call: ScriptCall) -> GatewayResult<Reply> {
        let reply = self.lock()?.run_script(&call)?;
        self.pushed.notify_waiters();
        Ok(reply)
    }

    async fn exec_multi(&self, commands: Vec<Command>) -> GatewayResult<Vec<Reply>> {
        let mut state = self.lock()?;
        // Apply to a scratch copy so a failing command leaves nothing behind
        let mut scratch = state.clone();
        let replies = commands
            .iter()
            .map(|command| scratch.apply(command))
            .collect::<GatewayResult<Vec<_>>>()?;
        *state = scratch;
        drop(state);
        self.pushed.notify_waiters();
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_is_fifo_through_blocking_move() {
        let gateway = MemoryGateway::new();
        gateway.lpush("ready", "a").await.unwrap();
        gateway.lpush("ready", "b").await.unwrap();

        let first = gateway
            .blocking_move("ready", "processing", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(gateway.lrange("processing", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(gateway.llen("ready").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blocking_move_times_out_when_empty() {
        let gateway = MemoryGateway::new();
        let moved = gateway
            .blocking_move("ready", "processing", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(moved.is_none());
    }

    #[tokio::test]
    async fn test_blocking_move_wakes_on_push() {
        let gateway = Arc::new(MemoryGateway::new());
        let waiter = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .blocking_move("ready", "processing", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway.lpush("ready", "late").await.unwrap();

        let moved = waiter.await.unwrap().unwrap();
        assert_eq!(moved.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_zrange_by_score_orders_and_pages() {
        let gateway = MemoryGateway::new();
        gateway.zadd("z", "c", 30).await.unwrap();
        gateway.zadd("z", "a", 10).await.unwrap();
        gateway.zadd("z", "b", 20).await.unwrap();

        let due = gateway.zrange_by_score("z", 0, 25, 0, 10).await.unwrap();
        assert_eq!(due, vec![("a".to_string(), 10), ("b".to_string(), 20)]);

        let page = gateway.zrange("z", 1, 1).await.unwrap();
        assert_eq!(page, vec![("b".to_string(), 20)]);
        assert_eq!(gateway.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_promote_script_is_guarded() {
        let gateway = MemoryGateway::new();
        gateway.zadd("scheduled", "m1", 5).await.unwrap();

        let call = ScriptCall::new(QueueScript::Promote)
            .key("scheduled")
            .key("ready")
            .key("stats")
            .arg("m1")
            .arg(5i64)
            .arg("delivery")
            .arg("")
            .arg(0i64)
            .arg("promoted");

        assert!(gateway.eval(call.clone()).await.unwrap().applied().unwrap());
        assert!(!gateway.eval(call).await.unwrap().applied().unwrap());
        assert_eq!(gateway.lrange("ready", 0, -1).await.unwrap(), vec!["delivery"]);
        assert_eq!(gateway.hget("stats", "promoted").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_promote_script_rejects_stale_score() {
        let gateway = MemoryGateway::new();
        gateway.zadd("scheduled", "cron", 5).await.unwrap();

        let promote = |score: i64| {
            ScriptCall::new(QueueScript::Promote)
                .key("scheduled")
                .key("ready")
                .key("stats")
                .arg("cron")
                .arg(score)
                .arg("delivery")
                .arg("cron")
                .arg(score + 10)
                .arg("promoted")
        };

        // Same member re-indexed at 15; a caller still holding score 5 must not move it
        assert!(gateway.eval(promote(5)).await.unwrap().applied().unwrap());
        assert!(!gateway.eval(promote(5)).await.unwrap().applied().unwrap());
        assert_eq!(gateway.llen("ready").await.unwrap(), 1);
        assert_eq!(
            gateway.zrange("scheduled", 0, -1).await.unwrap(),
            vec![("cron".to_string(), 15)]
        );
    }

    #[tokio::test]
    async fn test_release_consumer_requires_empty_list() {
        let gateway = MemoryGateway::new();
        gateway.zadd("heartbeats", "c1", 1).await.unwrap();
        gateway.lpush("processing", "m").await.unwrap();

        let call = ScriptCall::new(QueueScript::ReleaseConsumer)
            .key("heartbeats")
            .key("processing")
            .arg("c1");
        assert!(!gateway.eval(call.clone()).await.unwrap().applied().unwrap());

        gateway.lrem("processing", 1, "m").await.unwrap();
        assert!(gateway.eval(call).await.unwrap().applied().unwrap());
        assert_eq!(gateway.zcard("heartbeats").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exec_multi_is_all_or_nothing() {
        let gateway = MemoryGateway::new();
        gateway.hset("h", "text", "not-a-number").await.unwrap();

        let result = gateway
            .exec_multi(vec![
                Command::LPush { key: "l".into(), value: "x".into() },
                Command::HIncrBy { key: "h".into(), field: "text".into(), delta: 1 },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(gateway.llen("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(1);
        assert!(gateway.ping().await.unwrap_err().is_transport());
        assert!(gateway.ping().await.is_ok());

        gateway.set_offline(true);
        assert!(gateway.llen("x").await.is_err());
    }
}
