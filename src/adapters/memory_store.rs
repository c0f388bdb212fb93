//! In-Memory Fast Store
//!
//! Single-node stand-in for the fast key/value store. Implements the
//! key/value, stream and script ports over one mutex-guarded state, so a
//! script body observes and mutates the store in one indivisible step, the
//! same guarantee a server-side script evaluation provides.
//!
//! # Design
//!
//! - Expiry is lazy: an expired key is dropped when it is next touched
//! - Stream reads that find nothing park on a [`Notify`] until an append or
//!   the block deadline, whichever comes first
//! - Time is taken from `tokio::time::Instant`, so paused-clock tests work

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::fault::FaultInjector;
use crate::domain::model::{EntryId, Fields, StreamEntry};
use crate::domain::ports::{
    KeyValueStore, ReadCursor, Script, ScriptContext, ScriptRunner, StreamStore,
};
use crate::error::{Error, Result};

/// Re-poll interval for blocked pending reads.
const PENDING_REPOLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: Option<EntryId>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&self) -> EntryId {
        let ms = Utc::now().timestamp_millis().max(0) as u64;
        match self.last_id {
            Some(last) if ms <= last.ms => EntryId::new(last.ms, last.seq + 1),
            _ => EntryId::new(ms, 0),
        }
    }

    fn append(&mut self, fields: Fields) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, fields);
        self.last_id = Some(id);
        id
    }
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
    streams: HashMap<String, Stream>,
}

impl State {
    fn live_slot(&mut self, key: &str, now: Instant) -> Option<&mut Slot> {
        if self.slots.get(key).is_some_and(|s| s.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn get_str(&mut self, key: &str, now: Instant) -> Result<Option<String>> {
        match self.live_slot(key, now) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64, now: Instant) -> Result<i64> {
        if self.live_slot(key, now).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Str("0".to_string()),
                    expires_at: None,
                },
            );
        }
        let slot = self
            .slots
            .get_mut(key)
            .ok_or_else(|| Error::Internal(format!("key {} vanished", key)))?;
        match &mut slot.value {
            Value::Str(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| Error::Internal(format!("value at {} is not an integer", key)))?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            Value::Set(_) => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str, now: Instant) -> Result<&mut HashSet<String>> {
        if self.live_slot(key, now).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Internal(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::StoreUnavailable(format!(
        "NOGROUP no such consumer group '{}' for stream '{}'",
        group, stream
    ))
}

/// Script execution context over the locked state.
struct LockedContext<'a> {
    state: &'a mut State,
    now: Instant,
    appended: bool,
}

impl ScriptContext for LockedContext<'_> {
    fn get(&mut self, key: &str) -> Option<String> {
        self.state.get_str(key, self.now).ok().flatten()
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.state.incr_by(key, delta, self.now)
    }

    fn set_contains(&mut self, key: &str, member: &str) -> bool {
        match self.state.live_slot(key, self.now) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => set.contains(member),
            _ => false,
        }
    }

    fn set_add(&mut self, key: &str, member: &str) -> bool {
        match self.state.set_mut(key, self.now) {
            Ok(set) => set.insert(member.to_string()),
            Err(_) => false,
        }
    }

    fn stream_append(&mut self, stream: &str, fields: Fields) -> EntryId {
        self.appended = true;
        self.state
            .streams
            .entry(stream.to_string())
            .or_default()
            .append(fields)
    }
}

/// In-memory fast store.
#[derive(Debug, Default)]
pub struct MemoryFastStore {
    state: Mutex<State>,
    appended: Notify,
    faults: FaultInjector,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injector for simulating store outages.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Remaining time to live of a key. `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state
            .live_slot(key, now)
            .and_then(|s| s.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Whether a key exists and has not expired.
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state.lock().live_slot(key, now).is_some()
    }

    /// Number of members in a set key.
    pub fn set_len(&self, key: &str) -> usize {
        let now = Instant::now();
        match self.state.lock().live_slot(key, now) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => set.len(),
            _ => 0,
        }
    }

    fn poll_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let st = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = st;
        let grp = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut out = Vec::new();
        match cursor {
            ReadCursor::New => {
                let lower = match grp.last_delivered {
                    Some(last) => Bound::Excluded(last),
                    None => Bound::Unbounded,
                };
                let fresh = entries.range((lower, Bound::Unbounded)).take(count);
                for (id, fields) in fresh {
                    grp.pending.insert(
                        *id,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                    grp.last_delivered = Some(*id);
                    out.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: 1,
                    });
                }
            }
            ReadCursor::Pending { min_idle } => {
                for (id, pending) in grp.pending.iter_mut() {
                    if out.len() >= count {
                        break;
                    }
                    if pending.consumer != consumer
                        || now.saturating_duration_since(pending.delivered_at) < min_idle
                    {
                        continue;
                    }
                    // Entry was trimmed: nothing left to redeliver.
                    let Some(fields) = entries.get(id) else {
                        continue;
                    };
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    out.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl KeyValueStore for MemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.faults.check("get")?;
        self.state.lock().get_str(key, Instant::now())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.faults.check("set")?;
        let now = Instant::now();
        self.state.lock().slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.faults.check("set_nx")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_slot(key, now).is_some() {
            return Ok(false);
        }
        state.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.faults.check("del")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let existed = state.live_slot(key, now).is_some();
        state.slots.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.faults.check("incr")?;
        self.state.lock().incr_by(key, 1, Instant::now())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.faults.check("expire")?;
        let now = Instant::now();
        match self.state.lock().live_slot(key, now) {
            Some(slot) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.faults.check("compare_and_delete")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.get_str(key, now)?.as_deref() == Some(expected) {
            state.slots.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.faults.check("compare_and_expire")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.get_str(key, now)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        if let Some(slot) = state.slots.get_mut(key) {
            slot.expires_at = Some(now + ttl);
        }
        Ok(true)
    }
}

#[async_trait]
impl StreamStore for MemoryFastStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        self.faults.check("create_group")?;
        let mut state = self.state.lock();
        let st = state.streams.entry(stream.to_string()).or_default();
        if st.groups.contains_key(group) {
            return Ok(false);
        }
        st.groups.insert(group.to_string(), Group::default());
        Ok(true)
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId> {
        self.faults.check("append")?;
        let id = self
            .state
            .lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .append(fields);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.faults.check("read_group")?;
        let deadline = Instant::now() + block;
        loop {
            // Register interest before polling so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.poll_group(stream, group, consumer, cursor, count)?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }

            let wake_at = match cursor {
                ReadCursor::New => deadline,
                ReadCursor::Pending { .. } => deadline.min(Instant::now() + PENDING_REPOLL),
            };
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize> {
        self.faults.check("ack")?;
        let mut state = self.state.lock();
        let grp = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(ids
            .iter()
            .filter(|id| grp.pending.remove(id).is_some())
            .count())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        self.faults.check("pending_count")?;
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| no_group(stream, group))
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        self.faults.check("range")?;
        let state = self.state.lock();
        Ok(state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: 0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScriptRunner for MemoryFastStore {
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64> {
        self.faults.check(script.name)?;
        let (status, appended) = {
            let mut state = self.state.lock();
            let mut ctx = LockedContext {
                state: &mut state,
                now: Instant::now(),
                appended: false,
            };
            let status = (script.body)(&mut ctx, keys, args)?;
            (status, ctx.appended)
        };
        if appended {
            self.appended.notify_waiters();
        }
        Ok(status)
    }
}
