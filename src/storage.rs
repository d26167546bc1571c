/*!
 * In-Memory Keyspace
 *
 * The core storage layer: a single hash map from byte-string keys to one of
 * three value kinds (string with optional expiry, list, append-only
 * stream). Every operation here is a plain synchronous call — callers
 * (`shard.rs`) are responsible for holding the shared lock around it, which
 * is what makes a push-then-wake sequence atomic.
 */

use crate::command::IdSpec;
use ahash::AHashMap;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A key held the wrong value kind for the requested operation. Carries no
/// data — the handler already knows the key and command, it just needs to
/// know to emit `WRONGTYPE` instead of mutating anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

/// One stream entry: a strictly-increasing `(ms, seq)` id plus the
/// field/value pairs given to the `XADD` that created it, in insertion
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub ms: u64,
    pub seq: u64,
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaddError {
    MustBeGreaterThanZero,
    EqualOrSmaller,
}

enum Value {
    Str { data: Bytes, expires_at: Option<Instant> },
    List(VecDeque<Bytes>),
    Stream(Vec<StreamEntry>),
}

/// The keyspace. A plain map — concurrency safety comes from the caller
/// holding a lock around the whole `Server`, not from anything in here.
#[derive(Default)]
pub struct Keyspace {
    entries: AHashMap<Bytes, Value>,
}

impl Keyspace {
    /// Remove `key` if it holds an expired string. No-op otherwise.
    fn purge_if_expired(&mut self, key: &[u8]) {
        let expired = matches!(
            self.entries.get(key),
            Some(Value::Str { expires_at: Some(t), .. }) if Instant::now() >= *t
        );
        if expired {
            self.entries.remove(key);
        }
    }

    /// Read a string value, purging it first if its expiry has passed.
    ///
    /// # Arguments
    /// * `key` - key to look up
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` if a live string is stored at `key`
    /// * `Ok(None)` if `key` is absent or its string just expired
    /// * `Err(WrongType)` if `key` holds a list or stream
    pub fn get_string(&mut self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(Value::Str { data, .. }) => Ok(Some(data.clone())),
            Some(_) => Err(WrongType),
            None => Ok(None),
        }
    }

    /// Overwrite `key` with a string value, replacing any prior value of
    /// any kind.
    ///
    /// # Arguments
    /// * `key` - key to write
    /// * `value` - bytes to store
    /// * `expire_in` - `Some(d)` sets an expiry `d` from now; `None` means
    ///   the value never expires
    pub fn set_string(&mut self, key: Bytes, value: Bytes, expire_in: Option<Duration>) {
        let expires_at = expire_in.map(|d| Instant::now() + d);
        self.entries.insert(key, Value::Str { data: value, expires_at });
    }

    /// Report `key`'s value kind, purging an expired string first.
    ///
    /// # Returns
    /// * one of `"string"`, `"list"`, `"stream"`, `"none"`
    pub fn type_of(&mut self, key: &[u8]) -> &'static str {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(Value::Str { .. }) => "string",
            Some(Value::List(_)) => "list",
            Some(Value::Stream(_)) => "stream",
            None => "none",
        }
    }

    /// Append `values` to the tail of the list at `key`, creating it if
    /// absent.
    ///
    /// # Arguments
    /// * `key` - list key
    /// * `values` - elements to push, in argument order
    ///
    /// # Returns
    /// * `Ok(new_length)` on success
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn rpush(&mut self, key: &Bytes, values: Vec<Bytes>) -> Result<i64, WrongType> {
        self.purge_if_expired(key);
        match self.entries.entry(key.clone()).or_insert_with(|| Value::List(VecDeque::new())) {
            Value::List(list) => {
                list.extend(values);
                Ok(list.len() as i64)
            }
            _ => Err(WrongType),
        }
    }

    /// Prepend `values` to the head of the list at `key`, one at a time, so
    /// the final order of the first *k* prepends is the reverse of `values`.
    ///
    /// # Arguments
    /// * `key` - list key
    /// * `values` - elements to push, in argument order
    ///
    /// # Returns
    /// * `Ok(new_length)` on success
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn lpush(&mut self, key: &Bytes, values: Vec<Bytes>) -> Result<i64, WrongType> {
        self.purge_if_expired(key);
        match self.entries.entry(key.clone()).or_insert_with(|| Value::List(VecDeque::new())) {
            Value::List(list) => {
                for v in values {
                    list.push_front(v);
                }
                Ok(list.len() as i64)
            }
            _ => Err(WrongType),
        }
    }

    /// Read an inclusive, index-clamped slice of the list at `key`.
    ///
    /// # Arguments
    /// * `key` - list key
    /// * `start`, `stop` - inclusive bounds; negative counts from the end
    ///   (`-1` is the last element)
    ///
    /// # Returns
    /// * `Ok(elements)` — empty if `key` is absent or the clamped range is
    ///   empty
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn lrange(&mut self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, WrongType> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(Value::List(list)) => {
                let len = list.len() as i64;
                if len == 0 {
                    return Ok(Vec::new());
                }
                let s = normalize_index(start, len).clamp(0, len);
                let e = normalize_index(stop, len).clamp(0, len - 1);
                if s > e {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(s as usize)
                    .take((e - s + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(WrongType),
            None => Ok(Vec::new()),
        }
    }

    /// Report the length of the list at `key`, purging an expired string
    /// first so it reads as absent rather than wrong-kind.
    ///
    /// # Returns
    /// * `Ok(len)` — `0` if `key` is absent
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn llen(&mut self, key: &[u8]) -> Result<i64, WrongType> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(Value::List(list)) => Ok(list.len() as i64),
            Some(_) => Err(WrongType),
            None => Ok(0),
        }
    }

    /// Pop a single element from the head of the list, deleting the key if
    /// it becomes empty. `Ok(None)` covers both an empty and a missing list.
    ///
    /// # Returns
    /// * `Ok(Some(value))` on a successful pop
    /// * `Ok(None)` if the list is empty or `key` is absent
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn lpop_one(&mut self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            Some(Value::List(list)) => {
                let v = list.pop_front();
                if list.is_empty() {
                    self.entries.remove(key);
                }
                Ok(v)
            }
            Some(_) => Err(WrongType),
            None => Ok(None),
        }
    }

    /// Pop up to `count` elements from the head, deleting the key if it
    /// becomes empty. `count == 0` is a no-op that returns an empty vector.
    ///
    /// # Arguments
    /// * `key` - list key
    /// * `count` - maximum elements to pop
    ///
    /// # Returns
    /// * `Ok(elements)` — fewer than `count` if the list was shorter
    /// * `Err(WrongType)` if `key` holds a non-list value
    pub fn lpop_many(&mut self, key: &[u8], count: usize) -> Result<Vec<Bytes>, WrongType> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            Some(Value::List(list)) => {
                let n = count.min(list.len());
                let out: Vec<Bytes> = list.drain(..n).collect();
                if list.is_empty() {
                    self.entries.remove(key);
                }
                Ok(out)
            }
            Some(_) => Err(WrongType),
            None => Ok(Vec::new()),
        }
    }

    /// Resolve `id` against the stream's current last entry and, if valid,
    /// append it.
    ///
    /// # Arguments
    /// * `key` - stream key
    /// * `id` - the id spec as written (`*`, `<ms>-*`, or `<ms>-<seq>`)
    /// * `fields` - field/value pairs in insertion order
    /// * `now_ms` - current wall-clock time in milliseconds, for `*`/`<ms>-*`
    ///
    /// # Returns
    /// * `Ok(Ok((ms, seq)))` with the concrete id on a successful append
    /// * `Ok(Err(XaddError))` if `id` doesn't satisfy the monotonicity rules
    ///   (nothing is appended)
    /// * `Err(WrongType)` if `key` holds a non-stream value
    pub fn xadd(
        &mut self,
        key: &Bytes,
        id: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
        now_ms: u64,
    ) -> Result<Result<(u64, u64), XaddError>, WrongType> {
        let last = match self.entries.get(key.as_ref()) {
            Some(Value::Stream(entries)) => entries.last().map(|e| (e.ms, e.seq)),
            Some(_) => return Err(WrongType),
            None => None,
        };
        let resolved = resolve_xadd_id(id, last, now_ms);
        if let Ok((ms, seq)) = resolved {
            match self.entries.entry(key.clone()).or_insert_with(|| Value::Stream(Vec::new())) {
                Value::Stream(entries) => entries.push(StreamEntry { ms, seq, fields }),
                _ => unreachable!("kind already checked above"),
            }
        }
        Ok(resolved)
    }

    /// Read entries whose id falls within `[start, end]`, inclusive on both
    /// ends.
    ///
    /// # Arguments
    /// * `key` - stream key
    /// * `start`, `end` - resolved `(ms, seq)` bounds (see `RangeBound`)
    ///
    /// # Returns
    /// * `Ok(entries)` — empty if `key` is absent or nothing matches
    /// * `Err(WrongType)` if `key` holds a non-stream value
    pub fn xrange(
        &self,
        key: &[u8],
        start: (u64, u64),
        end: (u64, u64),
    ) -> Result<Vec<StreamEntry>, WrongType> {
        match self.entries.get(key) {
            Some(Value::Stream(entries)) => Ok(entries
                .iter()
                .filter(|e| (e.ms, e.seq) >= start && (e.ms, e.seq) <= end)
                .cloned()
                .collect()),
            Some(_) => Err(WrongType),
            None => Ok(Vec::new()),
        }
    }

    /// Read, for each requested stream, entries with id strictly greater
    /// than the given cursor. If any requested stream exists under a
    /// non-stream kind, the whole call fails with `WRONGTYPE` rather than
    /// returning partial results.
    ///
    /// # Arguments
    /// * `streams` - `(key, after)` pairs; `after` is the resolved
    ///   `(ms, seq)` cursor
    ///
    /// # Returns
    /// * `Ok(Some(results))` — only the streams with at least one match,
    ///   preserving request order
    /// * `Ok(None)` if every stream had zero matches
    /// * `Err(WrongType)` if any requested key holds a non-stream value
    pub fn xread(
        &self,
        streams: &[(Bytes, (u64, u64))],
    ) -> Result<Option<Vec<(Bytes, Vec<StreamEntry>)>>, WrongType> {
        let mut out = Vec::new();
        for (key, after) in streams {
            match self.entries.get(key.as_ref()) {
                Some(Value::Stream(entries)) => {
                    let matched: Vec<StreamEntry> = entries
                        .iter()
                        .filter(|e| (e.ms, e.seq) > *after)
                        .cloned()
                        .collect();
                    if !matched.is_empty() {
                        out.push((key.clone(), matched));
                    }
                }
                Some(_) => return Err(WrongType),
                None => {}
            }
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }
}

fn normalize_index(idx: i64, len: i64) -> i64 {
    if idx < 0 {
        idx + len
    } else {
        idx
    }
}

fn resolve_xadd_id(
    id: IdSpec,
    last: Option<(u64, u64)>,
    now_ms: u64,
) -> Result<(u64, u64), XaddError> {
    match id {
        IdSpec::Auto => {
            let seq = match last {
                Some((lms, lseq)) if lms == now_ms => lseq + 1,
                _ => 0,
            };
            Ok((now_ms, seq))
        }
        IdSpec::AutoSeq(ms) => match last {
            None => Ok((ms, 0)),
            Some((lms, lseq)) => {
                if lms < ms {
                    Ok((ms, 0))
                } else if lms == ms {
                    Ok((ms, lseq + 1))
                } else {
                    Err(XaddError::EqualOrSmaller)
                }
            }
        },
        IdSpec::Exact(ms, seq) => {
            if (ms, seq) == (0, 0) {
                return Err(XaddError::MustBeGreaterThanZero);
            }
            match last {
                Some(prev) if (ms, seq) <= prev => Err(XaddError::EqualOrSmaller),
                _ => Ok((ms, seq)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn string_set_get_roundtrip() {
        let mut ks = Keyspace::default();
        ks.set_string(b("k"), b("v"), None);
        assert_eq!(ks.get_string(b"k").unwrap(), Some(b("v")));
        assert_eq!(ks.type_of(b"k"), "string");
    }

    #[test]
    fn string_expiry_purges_lazily() {
        let mut ks = Keyspace::default();
        ks.set_string(b("k"), b("v"), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ks.get_string(b"k").unwrap(), None);
        assert_eq!(ks.type_of(b"k"), "none");
    }

    #[test]
    fn expired_string_is_purged_before_list_ops_see_it() {
        let mut ks = Keyspace::default();
        ks.set_string(b("k"), b("v"), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));

        // An expired StringValue is semantically absent: list reads against
        // the same key must see "missing", not "wrong type".
        assert_eq!(ks.llen(b"k").unwrap(), 0);
        assert_eq!(ks.lrange(b"k", 0, -1).unwrap(), Vec::<Bytes>::new());
        assert_eq!(ks.lpop_one(b"k").unwrap(), None);
        assert_eq!(ks.lpop_many(b"k", 2).unwrap(), Vec::<Bytes>::new());

        // Once purged, the key behaves like any other absent list key.
        assert_eq!(ks.rpush(&b("k"), vec![b("x")]).unwrap(), 1);
    }

    #[test]
    fn list_push_pop_and_wrongtype() {
        let mut ks = Keyspace::default();
        let key = b("L");
        assert_eq!(ks.rpush(&key, vec![b("a"), b("b"), b("c")]).unwrap(), 3);
        assert_eq!(ks.lpush(&key, vec![b("z")]).unwrap(), 4);
        assert_eq!(
            ks.lrange(b"L", 0, -1).unwrap(),
            vec![b("z"), b("a"), b("b"), b("c")]
        );
        assert_eq!(ks.lpop_many(b"L", 2).unwrap(), vec![b("z"), b("a")]);
        assert_eq!(ks.llen(b"L").unwrap(), 2);

        ks.set_string(b("S"), b("x"), None);
        assert_eq!(ks.rpush(&b("S"), vec![b("y")]), Err(WrongType));
    }

    #[test]
    fn lrange_clamps_out_of_bounds_indices() {
        let mut ks = Keyspace::default();
        let key = b("L");
        ks.rpush(&key, vec![b("a"), b("b"), b("c")]).unwrap();
        assert_eq!(
            ks.lrange(b"L", -100, 100).unwrap(),
            vec![b("a"), b("b"), b("c")]
        );
        assert_eq!(ks.lrange(b"L", 5, 10).unwrap(), Vec::<Bytes>::new());
    }

    #[test]
    fn empty_list_deletes_key() {
        let mut ks = Keyspace::default();
        let key = b("L");
        ks.rpush(&key, vec![b("a")]).unwrap();
        assert_eq!(ks.lpop_one(b"L").unwrap(), Some(b("a")));
        assert_eq!(ks.type_of(b"L"), "none");
    }

    #[test]
    fn xadd_resolves_star_and_rejects_non_increasing() {
        let mut ks = Keyspace::default();
        let key = b("s");
        assert_eq!(
            ks.xadd(&key, IdSpec::Exact(1, 1), vec![(b("f1"), b("v1"))], 0)
                .unwrap(),
            Ok((1, 1))
        );
        assert_eq!(
            ks.xadd(&key, IdSpec::Exact(1, 1), vec![(b("f1"), b("v1"))], 0)
                .unwrap(),
            Err(XaddError::EqualOrSmaller)
        );
        assert_eq!(
            ks.xadd(&key, IdSpec::AutoSeq(1), vec![(b("f1"), b("v1"))], 0)
                .unwrap(),
            Ok((1, 2))
        );
        assert_eq!(
            ks.xadd(&key, IdSpec::Exact(0, 0), vec![(b("f"), b("v"))], 0)
                .unwrap(),
            Err(XaddError::MustBeGreaterThanZero)
        );
    }

    #[test]
    fn xadd_failure_does_not_create_key() {
        let mut ks = Keyspace::default();
        let key = b("s");
        assert_eq!(
            ks.xadd(&key, IdSpec::Exact(0, 0), vec![(b("f"), b("v"))], 0)
                .unwrap(),
            Err(XaddError::MustBeGreaterThanZero)
        );
        assert_eq!(ks.type_of(b"s"), "none");
    }

    #[test]
    fn xrange_is_inclusive_both_ends() {
        let mut ks = Keyspace::default();
        let key = b("s");
        ks.xadd(&key, IdSpec::Exact(1, 0), vec![(b("f"), b("v"))], 0).unwrap();
        ks.xadd(&key, IdSpec::Exact(2, 0), vec![(b("f"), b("v"))], 0).unwrap();
        ks.xadd(&key, IdSpec::Exact(3, 0), vec![(b("f"), b("v"))], 0).unwrap();
        let got = ks.xrange(b"s", (1, 0), (2, 0)).unwrap();
        assert_eq!(got.iter().map(|e| (e.ms, e.seq)).collect::<Vec<_>>(), vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn xread_returns_only_streams_with_matches() {
        let mut ks = Keyspace::default();
        ks.xadd(&b("s1"), IdSpec::Exact(1, 0), vec![(b("f"), b("v"))], 0).unwrap();
        let streams = vec![(b("s1"), (0, 0)), (b("s2"), (0, 0))];
        let got = ks.xread(&streams).unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b("s1"));

        let all_empty = vec![(b("s2"), (0, 0)), (b("s3"), (0, 0))];
        assert_eq!(ks.xread(&all_empty).unwrap(), None);
    }
}
