//! Atomic scripts over the store.
//!
//! A script is one of a closed set of named templates ([`Script`]). Each
//! template compiles, together with its arguments, into a fixed list of
//! steps (read, numeric compare, increment, set-expiry, write) that run as
//! one indivisible unit:
//!
//! - every step works on a staged copy of the touched entries, so later steps
//!   see earlier ones and nothing is visible until commit;
//! - a failed comparison ends the script as [`Outcome::Rejected`] with no
//!   effect;
//! - an internal failure (a counter that is not an integer, an overflow)
//!   aborts with [`Error::TransactionAborted`] and nothing is written.
//!
//! Single-key scripts lock only the shard of their key. Multi-key scripts
//! take the store gate exclusively. There is no await point inside a script,
//! so a caller that goes away either saw the whole script applied or none of
//! it.

use bytes::Bytes;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::store::{deadline, log_key, Store, StoreInner};

/// Named transaction templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// keys `[k]`, args `[limit, window_ms]`: fixed-window counter. Accepts
    /// and counts the call if the current count is below `limit`; the
    /// window expiry is set only when the counter is created.
    RateLimit,
    /// keys `[k1, .., kn]`, args `[limit, window_ms]`: [`Script::RateLimit`]
    /// over several counters at once, accepted only if every counter is
    /// below `limit`.
    AcquireAll,
    /// keys `[k]`, args `[delta]` or `[delta, ttl_ms]`: adds `delta` to the
    /// counter and returns the new value. A TTL is applied only when the
    /// counter has no expiry yet.
    IncrBy,
    /// keys `[k]`, args `[value]` or `[value, ttl_ms]`: replaces the value
    /// and returns the previous one.
    Swap,
    /// keys `[k]`, no args: gives one unit back to a positive counter and
    /// returns the new value; rejected when the counter is already zero.
    Release,
}

impl Script {
    pub const ALL: [Script; 5] = [
        Script::RateLimit,
        Script::AcquireAll,
        Script::IncrBy,
        Script::Swap,
        Script::Release,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Script::RateLimit => "rate_limit",
            Script::AcquireAll => "acquire_all",
            Script::IncrBy => "incr_by",
            Script::Swap => "swap",
            Script::Release => "release",
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Script {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Script::ALL
            .into_iter()
            .find(|script| script.name() == s)
            .ok_or_else(|| Error::invalid(format!("unknown script '{}'", s)))
    }
}

/// What a script returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Integer(i64),
    /// Previous value, `None` if the key was absent or expired
    Value(Option<Bytes>),
}

/// Comparison used by a numeric guard step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }
}

/// One step; `key` indexes the script's key list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Read { key: usize },
    CompareNumeric { key: usize, op: CompareOp, threshold: i64 },
    Increment { key: usize, delta: i64 },
    /// Starts the expiry clock of an entry that has none; an entry that
    /// already expires keeps its deadline (the window is fixed at creation)
    SetExpiry { key: usize, ttl: Duration },
    Write { key: usize, value: Bytes, ttl: Option<Duration> },
}

/// A template bound to its arguments, ready to run against `keys`.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    script: Script,
    arity: Arity,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy)]
enum Arity {
    One,
    AtLeastOne,
}

impl Plan {
    pub(crate) fn rate_limit(limit: i64, window: Duration) -> Result<Self> {
        validate_limit(limit)?;
        validate_ttl(window, "window")?;
        Ok(Plan {
            script: Script::RateLimit,
            arity: Arity::One,
            steps: vec![
                Step::Read { key: 0 },
                Step::CompareNumeric { key: 0, op: CompareOp::Lt, threshold: limit },
                Step::Increment { key: 0, delta: 1 },
                Step::SetExpiry { key: 0, ttl: window },
            ],
        })
    }

    pub(crate) fn acquire_all(key_count: usize, limit: i64, window: Duration) -> Result<Self> {
        validate_limit(limit)?;
        validate_ttl(window, "window")?;
        let guards = (0..key_count).flat_map(|key| {
            [
                Step::Read { key },
                Step::CompareNumeric { key, op: CompareOp::Lt, threshold: limit },
            ]
        });
        let updates = (0..key_count).flat_map(|key| {
            [
                Step::Increment { key, delta: 1 },
                Step::SetExpiry { key, ttl: window },
            ]
        });
        Ok(Plan {
            script: Script::AcquireAll,
            arity: Arity::AtLeastOne,
            steps: guards.chain(updates).collect(),
        })
    }

    pub(crate) fn incr_by(delta: i64, ttl: Option<Duration>) -> Result<Self> {
        let mut steps = vec![Step::Increment { key: 0, delta }];
        if let Some(ttl) = ttl {
            validate_ttl(ttl, "ttl")?;
            steps.push(Step::SetExpiry { key: 0, ttl });
        }
        Ok(Plan { script: Script::IncrBy, arity: Arity::One, steps })
    }

    pub(crate) fn swap(value: Bytes, ttl: Option<Duration>) -> Result<Self> {
        if let Some(ttl) = ttl {
            validate_ttl(ttl, "ttl")?;
        }
        Ok(Plan {
            script: Script::Swap,
            arity: Arity::One,
            steps: vec![Step::Read { key: 0 }, Step::Write { key: 0, value, ttl }],
        })
    }

    pub(crate) fn release() -> Self {
        Plan {
            script: Script::Release,
            arity: Arity::One,
            steps: vec![
                Step::CompareNumeric { key: 0, op: CompareOp::Gt, threshold: 0 },
                Step::Increment { key: 0, delta: -1 },
            ],
        }
    }

    /// Binds a template to string arguments
    fn parse(script: Script, key_count: usize, args: &[&str]) -> Result<Self> {
        match (script, args) {
            (Script::RateLimit, [limit, window_ms]) => {
                Plan::rate_limit(parse_int(limit, "limit")?, parse_millis(window_ms, "window_ms")?)
            }
            (Script::AcquireAll, [limit, window_ms]) => Plan::acquire_all(
                key_count,
                parse_int(limit, "limit")?,
                parse_millis(window_ms, "window_ms")?,
            ),
            (Script::IncrBy, [delta]) => Plan::incr_by(parse_int(delta, "delta")?, None),
            (Script::IncrBy, [delta, ttl_ms]) => {
                Plan::incr_by(parse_int(delta, "delta")?, Some(parse_millis(ttl_ms, "ttl_ms")?))
            }
            (Script::Swap, [value]) => Plan::swap(Bytes::copy_from_slice(value.as_bytes()), None),
            (Script::Swap, [value, ttl_ms]) => Plan::swap(
                Bytes::copy_from_slice(value.as_bytes()),
                Some(parse_millis(ttl_ms, "ttl_ms")?),
            ),
            (Script::Release, []) => Ok(Plan::release()),
            _ => Err(Error::invalid(format!(
                "script '{}' does not take {} argument(s)",
                script,
                args.len()
            ))),
        }
    }

    fn check_keys(&self, keys: &[&str]) -> Result<()> {
        match (self.arity, keys.len()) {
            (_, 0) => return Err(Error::invalid(format!("script '{}' needs a key", self.script))),
            (Arity::One, 1) | (Arity::AtLeastOne, _) => {}
            (Arity::One, n) => {
                let msg = format!("script '{}' takes one key, got {}", self.script, n);
                return Err(Error::invalid(msg));
            }
        }
        let distinct: HashSet<&str> = keys.iter().copied().collect();
        if distinct.len() != keys.len() {
            return Err(Error::invalid(format!("script '{}' got duplicate keys", self.script)));
        }
        Ok(())
    }

    fn outcome(&self, trace: Trace) -> Outcome {
        if trace.rejected {
            return Outcome::Rejected;
        }
        match self.script {
            Script::RateLimit | Script::AcquireAll => Outcome::Accepted,
            Script::IncrBy | Script::Release => Outcome::Integer(trace.counter.unwrap_or_default()),
            Script::Swap => Outcome::Value(trace.read.flatten()),
        }
    }
}

fn validate_limit(limit: i64) -> Result<()> {
    if limit <= 0 {
        return Err(Error::invalid(format!("limit must be positive, got {}", limit)));
    }
    Ok(())
}

fn validate_ttl(ttl: Duration, what: &str) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::invalid(format!("{} must be greater than zero", what)));
    }
    Ok(())
}

fn parse_int(raw: &str, what: &str) -> Result<i64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::invalid(format!("{} '{}' is not an integer", what, raw)))
}

fn parse_millis(raw: &str, what: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::invalid(format!("{} '{}' is not a non-negative integer", what, raw)))
}

/// Staged copy of one key for the duration of a script
#[derive(Debug)]
struct Slot {
    entry: Option<Entry>,
    dirty: bool,
}

impl Slot {
    fn load(entry: Option<&Entry>, now: Instant) -> Self {
        Slot {
            entry: entry.filter(|e| !e.is_expired_at(now)).cloned(),
            dirty: false,
        }
    }

    fn counter(&self) -> Result<i64> {
        match &self.entry {
            None => Ok(0),
            Some(entry) => std::str::from_utf8(entry.value())
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::aborted("value is not an integer")),
        }
    }
}

#[derive(Debug, Default)]
struct Trace {
    rejected: bool,
    read: Option<Option<Bytes>>,
    counter: Option<i64>,
}

/// Runs `steps` against the staged slots. Nothing outside `slots` is touched.
fn execute(steps: &[Step], slots: &mut [Slot], now: Instant) -> Result<Trace> {
    let mut trace = Trace::default();
    for step in steps {
        match step {
            Step::Read { key } => {
                trace.read = Some(slots[*key].entry.as_ref().map(|e| e.value().clone()));
            }
            Step::CompareNumeric { key, op, threshold } => {
                let current = slots[*key].counter()?;
                if !op.holds(current, *threshold) {
                    trace.rejected = true;
                    return Ok(trace);
                }
            }
            Step::Increment { key, delta } => {
                let slot = &mut slots[*key];
                let next = slot
                    .counter()?
                    .checked_add(*delta)
                    .ok_or_else(|| Error::aborted("increment would overflow"))?;
                let expires_at = slot.entry.as_ref().and_then(Entry::expires_at);
                slot.entry = Some(Entry::new(Bytes::from(next.to_string()), expires_at));
                slot.dirty = true;
                trace.counter = Some(next);
            }
            Step::SetExpiry { key, ttl } => {
                let slot = &mut slots[*key];
                let Some(entry) = slot.entry.as_mut() else {
                    return Err(Error::aborted("cannot set expiry on a missing key"));
                };
                if entry.expires_at().is_none() {
                    entry.set_expires_at(Some(deadline(now, *ttl)?));
                    slot.dirty = true;
                }
            }
            Step::Write { key, value, ttl } => {
                let expires_at = ttl.map(|ttl| deadline(now, ttl)).transpose()?;
                let slot = &mut slots[*key];
                slot.entry = Some(Entry::new(value.clone(), expires_at));
                slot.dirty = true;
            }
        }
    }
    Ok(trace)
}

impl Store {
    /// Runs a named script atomically.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for a wrong key or argument count, duplicate
    ///   keys, unparseable arguments, a non-positive limit or a zero TTL.
    /// - `Error::TransactionAborted` if a step fails; no write is applied.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tallykv_core::{Outcome, Script, Store, StoreConfig};
    ///
    /// let store = Store::with_config(StoreConfig::default().with_reaper(false));
    /// let script: Script = "incr_by".parse().unwrap();
    /// assert_eq!(store.run(script, &["hits"], &["5"]).unwrap(), Outcome::Integer(5));
    /// assert_eq!(store.run(script, &["hits"], &["-2"]).unwrap(), Outcome::Integer(3));
    /// ```
    pub fn run(&self, script: Script, keys: &[&str], args: &[&str]) -> Result<Outcome> {
        let plan = Plan::parse(script, keys.len(), args)?;
        self.execute(&plan, keys)
    }

    /// Like [`Store::run`], looking the script up by name.
    pub fn run_named(&self, name: &str, keys: &[&str], args: &[&str]) -> Result<Outcome> {
        self.run(name.parse()?, keys, args)
    }

    pub(crate) fn execute(&self, plan: &Plan, keys: &[&str]) -> Result<Outcome> {
        plan.check_keys(keys)?;
        let result = match keys {
            [key] => run_single(&self.inner, plan, key),
            _ => run_multi(&self.inner, plan, keys),
        };
        match &result {
            Ok(outcome) => {
                tracing::trace!("SCRIPT {} {} -> {:?}", plan.script, log_key(keys[0]), outcome);
            }
            Err(e) => {
                tracing::warn!("SCRIPT {} {} failed: {}", plan.script, log_key(keys[0]), e);
            }
        }
        result
    }
}

/// Single key: the shard write lock is held from load to commit.
fn run_single(inner: &StoreInner, plan: &Plan, key: &str) -> Result<Outcome> {
    let _gate = inner.shared();
    let now = inner.now();

    match inner.data.entry(key.to_owned()) {
        MapEntry::Occupied(mut occupied) => {
            let mut slots = [Slot::load(Some(occupied.get()), now)];
            let trace = execute(&plan.steps, &mut slots, now)?;
            let [slot] = slots;
            if !trace.rejected && slot.dirty {
                let old_size = occupied.get().footprint(key);
                match slot.entry {
                    Some(entry) => {
                        inner.account(old_size, entry.footprint(key));
                        occupied.insert(entry);
                    }
                    None => {
                        inner.account(old_size, 0);
                        occupied.remove();
                    }
                }
            }
            Ok(plan.outcome(trace))
        }
        MapEntry::Vacant(vacant) => {
            let mut slots = [Slot::load(None, now)];
            let trace = execute(&plan.steps, &mut slots, now)?;
            let [slot] = slots;
            if !trace.rejected && slot.dirty {
                if let Some(entry) = slot.entry {
                    inner.account(0, entry.footprint(key));
                    vacant.insert(entry);
                }
            }
            Ok(plan.outcome(trace))
        }
    }
}

/// Several keys: exclusive gate, so no other operation runs meanwhile.
fn run_multi(inner: &StoreInner, plan: &Plan, keys: &[&str]) -> Result<Outcome> {
    let _gate = inner.exclusive();
    let now = inner.now();

    let mut slots: Vec<Slot> = keys
        .iter()
        .map(|key| Slot::load(inner.data.get(*key).as_deref(), now))
        .collect();
    let trace = execute(&plan.steps, &mut slots, now)?;

    if !trace.rejected {
        for (key, slot) in keys.iter().zip(slots) {
            if !slot.dirty {
                continue;
            }
            let added = slot.entry.as_ref().map(|e| e.footprint(key)).unwrap_or(0);
            let old = match slot.entry {
                Some(entry) => inner.data.insert((*key).to_owned(), entry),
                None => inner.data.remove(*key).map(|(_, e)| e),
            };
            inner.account(old.map(|e| e.footprint(key)).unwrap_or(0), added);
        }
    }
    Ok(plan.outcome(trace))
}
