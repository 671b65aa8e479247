//! Error records and the per-request error aggregator.

use crate::record::format_timestamp;
use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::any::TypeId;
use std::fmt::Write as _;
use std::sync::{Mutex, RwLock};

/// Upper bound on cause-chain hops, in case a chain loops.
pub const MAX_CAUSE_DEPTH: usize = 64;

/// One failure observed while handling a guarded call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// UTC capture time, millisecond precision.
    pub when: String,
    /// Type name of the reported error.
    pub error_type: String,
    /// Display rendering of the reported error.
    pub message: String,
    /// Type name of the innermost cause.
    pub root_error_type: String,
    /// Display rendering of the innermost cause.
    pub root_error_message: String,
    /// Backtrace when one was captured, otherwise the rendered cause chain.
    pub stack_trace: String,
}

impl ErrorRecord {
    /// Build a record from a concrete error type.
    ///
    /// When backtraces are enabled through `RUST_BACKTRACE`, the trace is
    /// taken here, so report an error where it is handled rather than
    /// somewhere further up.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + 'static,
    {
        Self::build(concrete_type_name(error), error, true)
    }

    /// Build a record from a type-erased error.
    pub fn from_dyn(error: &(dyn StdError + 'static)) -> Self {
        Self::build(type_name_of(error), error, true)
    }

    /// Build a record for an error returned out of the guarded call.
    ///
    /// The stack at this point belongs to the observation layer, not to the
    /// code that failed, so the trace is always the rendered cause chain.
    pub(crate) fn from_returned<E>(error: &E) -> Self
    where
        E: StdError + 'static,
    {
        Self::build(concrete_type_name(error), error, false)
    }

    fn build(error_type: String, error: &(dyn StdError + 'static), backtrace: bool) -> Self {
        let (root, depth) = root_cause(error);
        let root_error_type = if depth == 0 {
            error_type.clone()
        } else {
            type_name_of(root)
        };

        let stack_trace = match backtrace.then(Backtrace::capture) {
            Some(trace) if trace.status() == BacktraceStatus::Captured => trace.to_string(),
            _ => cause_chain(&error_type, error),
        };

        Self {
            when: format_timestamp(chrono::Utc::now()),
            message: error.to_string(),
            root_error_message: root.to_string(),
            stack_trace,
            error_type,
            root_error_type,
        }
    }
}

/// Follow `source()` links to the innermost cause.
///
/// Returns the cause and how many hops it took. The walk stops after
/// [`MAX_CAUSE_DEPTH`] hops.
pub fn root_cause<'a>(error: &'a (dyn StdError + 'static)) -> (&'a (dyn StdError + 'static), usize) {
    let mut current = error;
    let mut depth = 0;
    while depth < MAX_CAUSE_DEPTH {
        match current.source() {
            Some(next) => {
                current = next;
                depth += 1;
            }
            None => break,
        }
    }
    (current, depth)
}

type Matcher = fn(&(dyn StdError + 'static)) -> bool;

struct Registered {
    id: TypeId,
    matches: Matcher,
    name: String,
}

static REGISTERED: RwLock<Vec<Registered>> = RwLock::new(Vec::new());

fn matches<E: StdError + 'static>(error: &(dyn StdError + 'static)) -> bool {
    error.is::<E>()
}

/// Make errors of type `E` recognizable by name when they only appear as a
/// cause or behind `dyn Error`.
///
/// A cause is only known through `&dyn Error`, so its type name cannot be
/// read directly. Common std, `http` and `serde_json` errors are recognized
/// without registration. Other types fall back to the leading identifier
/// of their `Debug` output, which for enums is the variant name.
///
/// ```ignore
/// apitoolkit_core::errors::register_error_type::<sqlx::Error>();
/// ```
pub fn register_error_type<E: StdError + 'static>() {
    let id = TypeId::of::<E>();
    let mut registered = REGISTERED.write().unwrap_or_else(|e| e.into_inner());
    if registered.iter().any(|r| r.id == id) {
        return;
    }
    registered.push(Registered {
        id,
        matches: matches::<E>,
        name: short_type_name(std::any::type_name::<E>()),
    });
}

fn registered_name(error: &(dyn StdError + 'static)) -> Option<String> {
    REGISTERED
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .find(|r| (r.matches)(error))
        .map(|r| r.name.clone())
}

fn builtin_name(error: &(dyn StdError + 'static)) -> Option<&'static str> {
    macro_rules! known {
        ($($ty:ty => $name:literal,)*) => {
            $(
                if error.is::<$ty>() {
                    return Some($name);
                }
            )*
        };
    }

    known! {
        std::io::Error => "io::Error",
        std::fmt::Error => "fmt::Error",
        std::num::ParseIntError => "ParseIntError",
        std::num::ParseFloatError => "ParseFloatError",
        std::num::TryFromIntError => "TryFromIntError",
        std::str::ParseBoolError => "ParseBoolError",
        std::char::ParseCharError => "ParseCharError",
        std::str::Utf8Error => "Utf8Error",
        std::string::FromUtf8Error => "FromUtf8Error",
        std::env::VarError => "VarError",
        std::net::AddrParseError => "AddrParseError",
        std::time::SystemTimeError => "SystemTimeError",
        serde_json::Error => "serde_json::Error",
        http::Error => "http::Error",
        http::uri::InvalidUri => "InvalidUri",
        http::header::InvalidHeaderValue => "InvalidHeaderValue",
        http::header::InvalidHeaderName => "InvalidHeaderName",
        http::method::InvalidMethod => "InvalidMethod",
        http::status::InvalidStatusCode => "InvalidStatusCode",
    }
    None
}

/// Name of an error known only through `dyn Error`.
fn type_name_of(error: &(dyn StdError + 'static)) -> String {
    if let Some(name) = builtin_name(error) {
        return name.to_string();
    }
    registered_name(error).unwrap_or_else(|| debug_name(error))
}

/// Name of an error whose static type is known.
fn concrete_type_name<E: StdError + 'static>(error: &E) -> String {
    let type_name = std::any::type_name::<E>();
    if type_name.contains("dyn ") {
        return type_name_of(error);
    }
    match builtin_name(error) {
        Some(name) => name.to_string(),
        None => short_type_name(type_name),
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Leading identifier of the `Debug` rendering, e.g. `Timeout` for
/// `Timeout { after: 3s }`.
fn debug_name(error: &dyn StdError) -> String {
    let rendered = format!("{error:?}");
    let ident: String = rendered
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    let name = short_type_name(&ident);
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

fn cause_chain(error_type: &str, error: &(dyn StdError + 'static)) -> String {
    let mut out = format!("{error_type}: {error}");
    let mut current = error.source();
    let mut depth = 0;
    while let Some(cause) = current {
        if depth == MAX_CAUSE_DEPTH {
            out.push_str("\n  ...");
            break;
        }
        let _ = write!(out, "\ncaused by: {cause}");
        current = cause.source();
        depth += 1;
    }
    out
}

/// Request-scoped list of error records.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&self, record: ErrorRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Copy of the records collected so far.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Remove and return every record.
    pub fn take(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of records collected.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no record has been collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
