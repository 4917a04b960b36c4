//! The `vec_dist` scalar function.
//!
//! [`VecDist`] computes the negated cosine similarity between two encoded
//! vectors so that an ascending `ORDER BY vec_dist(?, embedding_vector)` ranks
//! the nearest rows first. It is registered into the datastore's evaluator
//! through the [`ScalarFunctionHost`] capability and is invoked once per
//! scanned row.
//!
//! Each argument may be a binary blob (see [`crate::vector::encode`]) or a JSON
//! array string. Decoded vectors are kept in a [`DecodeCache`] that the caller
//! owns and injects, and every call is timed into [`DistanceStats`].
//!
//! SQLite reports a failing function to the statement as a plain message, so
//! each registration also hands back a [`LastFailure`] slot from which the
//! caller recovers the typed [`DistanceError`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{CodecError, DistanceError, Result};
use crate::vector::{cosine_distance, decode, parse_json_floats};

/// One argument of `vec_dist`, borrowed from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VectorArg<'a> {
    Blob(&'a [u8]),
    Text(&'a str),
    /// Any other value; decoding it fails with the carried type name.
    Unsupported(&'static str),
}

/// A datastore that can host a named, deterministic, pure two-argument
/// scalar function.
pub trait ScalarFunctionHost {
    fn register_binary_function<F>(&self, name: &str, function: F) -> Result<()>
    where
        F: Fn(VectorArg<'_>, VectorArg<'_>) -> std::result::Result<f64, DistanceError>
            + Send
            + Sync
            + 'static;
}

impl ScalarFunctionHost for Connection {
    fn register_binary_function<F>(&self, name: &str, function: F) -> Result<()>
    where
        F: Fn(VectorArg<'_>, VectorArg<'_>) -> std::result::Result<f64, DistanceError>
            + Send
            + Sync
            + 'static,
    {
        // The evaluator only reads through `function`; shared state behind it is
        // lock and atomic based and stays consistent across an unwind.
        let function = AssertUnwindSafe(function);
        self.create_scalar_function(
            name,
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                let function = &function;
                (function.0)(vector_arg(ctx, 0), vector_arg(ctx, 1)).map_err(|err| {
                    rusqlite::Error::UserFunctionError(Box::new(err))
                })
            },
        )?;
        Ok(())
    }
}

fn vector_arg<'a>(ctx: &'a Context<'_>, idx: usize) -> VectorArg<'a> {
    match ctx.get_raw(idx) {
        ValueRef::Blob(bytes) => VectorArg::Blob(bytes),
        ValueRef::Text(raw) => match std::str::from_utf8(raw) {
            Ok(text) => VectorArg::Text(text),
            Err(_) => VectorArg::Unsupported("non UTF-8 TEXT"),
        },
        ValueRef::Null => VectorArg::Unsupported("NULL"),
        ValueRef::Integer(_) => VectorArg::Unsupported("INTEGER"),
        ValueRef::Real(_) => VectorArg::Unsupported("REAL"),
    }
}

/// Decoded vectors keyed by their exact input representation.
///
/// Entries are never evicted, so the cache grows with the number of distinct
/// vectors it has seen (the corpus plus the queries issued against it).
#[derive(Debug, Default)]
pub struct DecodeCache {
    blobs: RwLock<HashMap<Vec<u8>, Arc<[f64]>>>,
    texts: RwLock<HashMap<String, Arc<[f64]>>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached vector for `arg`, decoding and storing it on a miss.
    pub fn get_or_decode(&self, arg: VectorArg<'_>) -> std::result::Result<Arc<[f64]>, CodecError> {
        match arg {
            VectorArg::Blob(bytes) => {
                if let Some(hit) = self.blobs.read().get(bytes) {
                    return Ok(Arc::clone(hit));
                }
                let decoded: Arc<[f64]> = decode(bytes)?.into();
                let mut blobs = self.blobs.write();
                Ok(Arc::clone(blobs.entry(bytes.to_vec()).or_insert(decoded)))
            }
            VectorArg::Text(text) => {
                if let Some(hit) = self.texts.read().get(text) {
                    return Ok(Arc::clone(hit));
                }
                let decoded: Arc<[f64]> = parse_json_floats(text)?.into();
                let mut texts = self.texts.write();
                Ok(Arc::clone(texts.entry(text.to_string()).or_insert(decoded)))
            }
            VectorArg::Unsupported(kind) => Err(CodecError::UnsupportedType(kind)),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len() + self.texts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.blobs.write().clear();
        self.texts.write().clear();
    }
}

/// Cumulative, monotonic timing counters for `vec_dist`.
#[derive(Debug, Default)]
pub struct DistanceStats {
    calls: AtomicU64,
    total_ns: AtomicU64,
    decode_ns: AtomicU64,
    compare_ns: AtomicU64,
}

/// Point-in-time copy of [`DistanceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub total_ns: u64,
    pub decode_ns: u64,
    pub compare_ns: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns)
    }

    pub fn average(&self) -> Option<Duration> {
        if self.calls == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.total_ns / self.calls))
    }
}

impl DistanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            decode_ns: self.decode_ns.load(Ordering::Relaxed),
            compare_ns: self.compare_ns.load(Ordering::Relaxed),
        }
    }

    /// Emit the counters as one debug event. Silent before the first call.
    pub fn log(&self) {
        let snap = self.snapshot();
        let Some(avg) = snap.average() else {
            return;
        };
        tracing::debug!(
            count = snap.calls,
            total = ?snap.total(),
            decoding = ?Duration::from_nanos(snap.decode_ns),
            comparison = ?Duration::from_nanos(snap.compare_ns),
            avg = ?avg,
            "vec_dist comparison stats"
        );
    }

    fn add(counter: &AtomicU64, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        counter.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// The distance function together with its cache and counters.
///
/// Cloning is cheap and clones share the same cache and counters, so one
/// `VecDist` can back any number of connections.
#[derive(Debug, Clone, Default)]
pub struct VecDist {
    cache: Arc<DecodeCache>,
    stats: Arc<DistanceStats>,
}

/// The most recent failure raised through one registration of `vec_dist`.
#[derive(Debug, Clone, Default)]
pub struct LastFailure(Arc<Mutex<Option<DistanceError>>>);

impl LastFailure {
    /// Take the recorded failure, leaving the slot empty.
    pub fn take(&self) -> Option<DistanceError> {
        self.0.lock().take()
    }

    fn record(&self, err: &DistanceError) {
        *self.0.lock() = Some(err.clone());
    }
}

impl VecDist {
    /// Name under which the function is registered.
    pub const NAME: &'static str = "vec_dist";

    pub fn new(cache: Arc<DecodeCache>, stats: Arc<DistanceStats>) -> Self {
        Self { cache, stats }
    }

    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<DistanceStats> {
        &self.stats
    }

    /// `-(a · b) / (||a|| * ||b||)`, or `0.0` when either norm is zero.
    ///
    /// Every call is counted, including the ones that fail.
    pub fn evaluate(
        &self,
        left: VectorArg<'_>,
        right: VectorArg<'_>,
    ) -> std::result::Result<f64, DistanceError> {
        let start = Instant::now();
        let result = self.compare(left, right);
        DistanceStats::add(&self.stats.total_ns, start.elapsed());
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn compare(
        &self,
        left: VectorArg<'_>,
        right: VectorArg<'_>,
    ) -> std::result::Result<f64, DistanceError> {
        let decode_start = Instant::now();
        let left = self.cache.get_or_decode(left)?;
        let right = self.cache.get_or_decode(right)?;
        DistanceStats::add(&self.stats.decode_ns, decode_start.elapsed());

        let compare_start = Instant::now();
        let distance = cosine_distance(&left, &right);
        DistanceStats::add(&self.stats.compare_ns, compare_start.elapsed());
        distance
    }

    /// Register this function as `vec_dist` on `host`.
    pub fn register<H: ScalarFunctionHost>(&self, host: &H) -> Result<LastFailure> {
        let function = self.clone();
        let failure = LastFailure::default();
        let slot = failure.clone();
        host.register_binary_function(Self::NAME, move |left, right| {
            function.evaluate(left, right).inspect_err(|err| slot.record(err))
        })?;
        Ok(failure)
    }
}
