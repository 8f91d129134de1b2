//! Pooled per-request context.
//!
//! Every inbound request leases one [`Context`] slot from a [`ContextPool`]
//! for exactly as long as the request runs. The slot carries:
//!
//! - the request's cancellation token (a child of the server's shutdown token),
//! - the request id and the method/path it was opened for,
//! - response headers staged by middleware (`x-request-id` among them),
//! - the OpenTelemetry context (server span and baggage),
//! - the `tracing` span every log line of the request runs inside,
//! - a typed scratch map keyed by value type.
//!
//! # Lifetime rules
//!
//! A [`Lease`] releases its slot when dropped, whatever path the request
//! took: normal return, panic, timeout or connection abort. Releasing clears
//! every field before the slot goes back on the free list, and bumps the
//! slot's generation.
//!
//! Handlers see the slot through a [`ContextRef`]. A `ContextRef` remembers
//! the generation it was handed out for; using it once its request is over
//! is a bug in the caller and panics rather than reading another request's
//! state. [`ContextRef::try_with`] is the non-panicking variant.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{KeyValue, global};
use opentelemetry_semantic_conventions::trace as semconv;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info_span};
use uuid::Uuid;

use crate::response::Response;
use crate::shutdown::CancelToken;
use crate::telemetry;

/// Header carrying the request id in and out.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_MAX_IDLE: usize = 1024;
const MAX_INBOUND_REQUEST_ID: usize = 128;

/// A context handle was used after its request finished.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request context used after release")]
pub struct Released;

// ── Context state ─────────────────────────────────────────────────────────────

/// The fields of one request's context. Only reachable through
/// [`ContextRef::try_with`] while the request is live.
#[derive(Default)]
pub struct Context {
    cancel: Option<CancelToken>,
    method: Option<Method>,
    path: String,
    request_id: String,
    response_headers: HeaderMap,
    otel: Option<opentelemetry::Context>,
    span: Option<tracing::Span>,
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn span(&self) -> Option<&tracing::Span> {
        self.span.as_ref()
    }

    pub fn otel(&self) -> Option<&opentelemetry::Context> {
        self.otel.as_ref()
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Stages a header for the response. Headers the handler sets itself
    /// take precedence.
    pub fn stage_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    pub fn staged_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn baggage(&self, key: &str) -> Option<String> {
        self.otel.as_ref()?.baggage().get(key).map(ToString::to_string)
    }

    pub fn set_baggage(&mut self, key: &str, value: &str) {
        let cx = self.otel.get_or_insert_with(opentelemetry::Context::new);
        let mut pairs: Vec<KeyValue> = cx
            .baggage()
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, (v, _))| KeyValue::new(k.clone(), v.to_string()))
            .collect();
        pairs.push(KeyValue::new(key.to_owned(), value.to_owned()));
        *cx = cx.with_baggage(pairs);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("values", &self.values.len())
            .finish_non_exhaustive()
    }
}

// ── Slots ─────────────────────────────────────────────────────────────────────

struct Slot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    live: bool,
    context: Context,
}

impl Slot {
    fn release(&self) -> Context {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.live = false;
        std::mem::take(&mut state.context)
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Free list of reusable context slots.
///
/// Acquiring never fails: an empty free list means a fresh allocation. At
/// most `max_idle` released slots are kept around.
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Arc<Slot>>>,
    max_idle: usize,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner { free: Mutex::new(Vec::new()), max_idle }),
        }
    }

    /// Leases a cleared slot, recycled when one is free.
    pub fn acquire(&self) -> Lease {
        let slot = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Slot { state: Mutex::new(SlotState::default()) }));

        let generation = {
            let mut state = slot.state.lock();
            debug_assert!(!state.live, "pooled context slot handed out twice");
            state.live = true;
            state.generation
        };

        Lease {
            handle: ContextRef { slot, generation },
            pool: Arc::clone(&self.inner),
            released: false,
        }
    }

    /// Number of released slots waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

// ── Lease ─────────────────────────────────────────────────────────────────────

/// Exclusive use of one slot for the duration of a request.
pub struct Lease {
    handle: ContextRef,
    pool: Arc<PoolInner>,
    released: bool,
}

impl Lease {
    /// A handle for the request and its middleware.
    pub fn context(&self) -> ContextRef {
        self.handle.clone()
    }

    /// Fills the slot for a new request: request id, cancellation, server
    /// span (parented on any propagated trace context) and `tracing` span.
    pub(crate) fn begin(&self, parts: &http::request::Parts, shutdown: &CancelToken) {
        let request_id = inbound_request_id(&parts.headers)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = parts.uri.path().to_owned();

        let parent = telemetry::extract(&parts.headers);
        let tracer = global::tracer("keel");
        let server_span = tracer
            .span_builder(format!("{} {}", parts.method, path))
            .with_kind(SpanKind::Server)
            .with_attributes(vec![
                KeyValue::new(semconv::HTTP_REQUEST_METHOD, parts.method.to_string()),
                KeyValue::new(semconv::URL_PATH, path.clone()),
            ])
            .start_with_context(&tracer, &parent);
        let otel = parent.with_span(server_span);
        let trace_id = otel.span().span_context().trace_id();

        let span = info_span!(
            "request",
            method = %parts.method,
            path = %path,
            request_id = %request_id,
            trace_id = %trace_id,
        );

        let staged = HeaderValue::try_from(request_id.as_str()).ok();
        self.handle.with(|cx| {
            cx.cancel = Some(shutdown.child());
            cx.method = Some(parts.method.clone());
            cx.path = path;
            cx.request_id = request_id;
            cx.otel = Some(otel);
            cx.span = Some(span);
            if let Some(value) = staged {
                cx.stage_header(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
        });
    }

    /// Applies staged headers to the outgoing response and ends the server
    /// span with its status.
    pub(crate) fn finish(&self, res: &mut Response) {
        let status = res.status_code();
        self.handle.with(|cx| {
            for (name, value) in cx.response_headers.drain().filter_map(|(n, v)| Some((n?, v))) {
                if !res.headers.contains_key(&name) {
                    res.headers.insert(name, value);
                }
            }
            if let Some(otel) = &cx.otel {
                let span = otel.span();
                span.set_attribute(KeyValue::new(
                    semconv::HTTP_RESPONSE_STATUS_CODE,
                    i64::from(status.as_u16()),
                ));
                if status.is_server_error() {
                    span.set_status(Status::error(status_reason(status)));
                }
                span.end();
            }
        });
    }

    /// Returns the slot to the pool. Dropping the lease does the same.
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let old = self.handle.slot.release();
        if let Some(cancel) = &old.cancel {
            cancel.cancel();
        }

        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_idle {
            free.push(Arc::clone(&self.handle.slot));
        }
        drop(free);
        // User values may run arbitrary Drop code; do it with no lock held.
        drop(old);
    }

    #[cfg(test)]
    fn slot_addr(&self) -> usize {
        Arc::as_ptr(&self.handle.slot) as usize
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

fn inbound_request_id(headers: &HeaderMap) -> Option<String> {
    let id = headers.get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    (!id.is_empty() && id.len() <= MAX_INBOUND_REQUEST_ID).then(|| id.to_owned())
}

fn status_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("server error").to_owned()
}

// ── ContextRef ────────────────────────────────────────────────────────────────

/// Handle to the context of one live request.
///
/// Cheap to clone. Valid only until the request's response is produced.
#[derive(Clone)]
pub struct ContextRef {
    slot: Arc<Slot>,
    generation: u64,
}

impl ContextRef {
    /// Runs `f` against the context, or reports that the request is over.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut Context) -> R) -> Result<R, Released> {
        let mut state = self.slot.state.lock();
        if !state.live || state.generation != self.generation {
            return Err(Released);
        }
        Ok(f(&mut state.context))
    }

    /// Like [`try_with`](Self::try_with), but use after release panics.
    pub fn with<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        match self.try_with(f) {
            Ok(r) => r,
            Err(Released) => {
                error!("request context used after its request finished");
                panic!("request context used after release");
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.try_with(|_| ()).is_ok()
    }

    pub fn request_id(&self) -> String {
        self.with(|cx| cx.request_id.clone())
    }

    /// Cancelled when the request ends or the server starts shutting down.
    pub fn cancellation(&self) -> CancelToken {
        self.with(|cx| cx.cancel.clone()).unwrap_or_default()
    }

    pub fn span(&self) -> tracing::Span {
        self.with(|cx| cx.span.clone()).unwrap_or_else(tracing::Span::none)
    }

    /// The OpenTelemetry context to parent outbound calls on.
    pub fn otel_context(&self) -> opentelemetry::Context {
        self.with(|cx| cx.otel.clone()).unwrap_or_default()
    }

    pub fn baggage(&self, key: &str) -> Option<String> {
        self.with(|cx| cx.baggage(key))
    }

    pub fn set_baggage(&self, key: &str, value: &str) {
        self.with(|cx| cx.set_baggage(key, value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.with(|cx| cx.get::<T>().cloned())
    }

    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.with(|cx| cx.insert(value))
    }

    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.with(|cx| cx.remove::<T>())
    }

    /// Stages a response header. Invalid names or values are ignored.
    pub fn set_response_header(&self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.with(|cx| cx.stage_header(name, value));
        }
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}
