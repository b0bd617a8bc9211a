//! Patch contract and patch runner
//!
//! A patch edits either the structural module (raw mode) or the resolved
//! graph (resolved mode). Patches run one after another in a fixed order and
//! each one observes the edits of those before it. A patch that returns an
//! error or panics is rolled back: the edited form is restored to the state
//! it had before that patch ran and the next patch continues from there.
//!
//! Patch libraries are plain dynamic libraries exporting the symbols
//! generated by [`export_patch!`](crate::export_patch).

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::graph::{Graph, GraphError};
use crate::module::{Module, ModuleError};

/// Name of the constructor symbol a patch library exports
pub const PATCH_CONSTRUCTOR_SYMBOL: &str = "hlpatch_create_patch";

/// Name of the ABI version symbol a patch library exports
pub const PATCH_ABI_SYMBOL: &str = "hlpatch_abi_version";

/// Bumped whenever [`Patch`] or the types it receives change shape
pub const PATCH_ABI_VERSION: u32 = 1;

/// Signature of the exported constructor
///
/// The returned pointer owns a boxed trait object and must be released with
/// `Box::from_raw` by the host.
#[allow(improper_ctypes_definitions)]
pub type PatchConstructor = unsafe extern "C" fn() -> *mut Box<dyn Patch>;

/// Signature of the exported ABI version function
pub type PatchAbiVersion = unsafe extern "C" fn() -> u32;

/// Patch errors
#[derive(Debug, Error)]
pub enum PatchError {
    /// The patch reported its own failure
    #[error("{0}")]
    Failed(String),

    /// The patch panicked
    #[error("patch panicked: {0}")]
    Panicked(String),

    /// Graph lookup or edit failed inside the patch
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Structural edit failed inside the patch
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// The patch library could not be loaded
    #[error("cannot load patch library {path}: {reason}")]
    Load {
        /// Library path
        path: String,
        /// Loader message
        reason: String,
    },
}

impl PatchError {
    /// Shorthand for [`PatchError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Display metadata a patch carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchInfo {
    /// Display name
    pub name: String,
    /// Author
    pub author: String,
    /// Free-form version string
    pub version: String,
}

impl PatchInfo {
    /// Create patch metadata
    pub fn new(
        name: impl Into<String>,
        author: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} by {}", self.name, self.version, self.author)
    }
}

/// Which form patches edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchMode {
    /// Edit the structural module directly; the graph is read-only
    Raw,
    /// Edit the resolved graph; the structural module is read-only
    #[default]
    Resolved,
}

impl fmt::Display for PatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

type Sink<'a> = Box<dyn Fn(&str) + Send + Sync + 'a>;

/// Informational and error sinks handed to a patch
pub struct PatchLogger<'a> {
    info: Sink<'a>,
    error: Sink<'a>,
    errors: AtomicUsize,
}

impl<'a> PatchLogger<'a> {
    /// Create a logger from two sinks
    pub fn new(
        info: impl Fn(&str) + Send + Sync + 'a,
        error: impl Fn(&str) + Send + Sync + 'a,
    ) -> Self {
        Self {
            info: Box::new(info),
            error: Box::new(error),
            errors: AtomicUsize::new(0),
        }
    }

    /// Logger forwarding both sinks to `tracing`, tagged with `source`
    pub fn tracing(source: &'a str) -> Self {
        Self::new(
            move |message| info!(patch = source, "{}", message),
            move |message| error!(patch = source, "{}", message),
        )
    }

    /// Report progress
    pub fn info(&self, message: &str) {
        (self.info)(message);
    }

    /// Report a problem; the patch keeps running
    pub fn error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        (self.error)(message);
    }

    /// Number of messages sent to the error sink so far
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for PatchLogger<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchLogger")
            .field("errors", &self.error_count())
            .finish_non_exhaustive()
    }
}

/// A bytecode patch
///
/// Implement whichever of the two entry points the patch supports. The
/// defaults report through the error sink that the mode is unsupported and
/// leave everything untouched.
pub trait Patch: Send + Sync {
    /// Display metadata
    fn info(&self) -> PatchInfo;

    /// Edit the structural module
    fn patch_raw(
        &self,
        module: &mut Module,
        graph: &Graph,
        log: &PatchLogger<'_>,
    ) -> Result<(), PatchError> {
        let _ = (module, graph);
        log.error("This patch cannot be applied to raw bytecode");
        Ok(())
    }

    /// Edit the resolved graph
    fn patch_resolved(
        &self,
        module: &Module,
        graph: &mut Graph,
        log: &PatchLogger<'_>,
    ) -> Result<(), PatchError> {
        let _ = (module, graph);
        log.error("This patch cannot be applied to resolved bytecode");
        Ok(())
    }
}

/// What happened to one patch
#[derive(Debug)]
pub enum PatchOutcome {
    /// Ran to completion without reporting errors
    Applied,
    /// Ran to completion but sent messages to the error sink
    Reported {
        /// Number of error messages
        errors: usize,
    },
    /// Failed; its edits were discarded
    RolledBack(PatchError),
}

impl PatchOutcome {
    /// Whether the patch's edits were kept
    pub fn is_kept(&self) -> bool {
        !matches!(self, Self::RolledBack(_))
    }
}

/// Per-patch outcomes, in application order
#[derive(Debug, Default)]
pub struct PatchReport {
    /// `(source, outcome)` pairs
    pub outcomes: Vec<(String, PatchOutcome)>,
}

impl PatchReport {
    /// Number of patches rolled back
    pub fn rolled_back(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_kept())
            .count()
    }
}

/// Run one patch against the form selected by `mode`
///
/// The edited form is snapshotted first and restored if the patch fails.
pub fn apply_patch(
    source: &str,
    patch: &dyn Patch,
    mode: PatchMode,
    module: &mut Module,
    graph: &mut Graph,
) -> PatchOutcome {
    let log = PatchLogger::tracing(source);
    log.info(&patch.info().to_string());

    let result = match mode {
        PatchMode::Raw => {
            let snapshot = module.clone();
            let result = guarded(|| patch.patch_raw(module, graph, &log));
            if result.is_err() {
                *module = snapshot;
            }
            result
        }
        PatchMode::Resolved => {
            let snapshot = graph.clone();
            let result = guarded(|| patch.patch_resolved(module, graph, &log));
            if result.is_err() {
                *graph = snapshot;
            }
            result
        }
    };

    match result {
        Ok(()) if log.error_count() == 0 => PatchOutcome::Applied,
        Ok(()) => PatchOutcome::Reported {
            errors: log.error_count(),
        },
        Err(e) => {
            log.error(&e.to_string());
            warn!(patch = source, "patch has not been applied");
            PatchOutcome::RolledBack(e)
        }
    }
}

/// Run `patches` in order
pub fn apply_patches<'p, I>(
    patches: I,
    mode: PatchMode,
    module: &mut Module,
    graph: &mut Graph,
) -> PatchReport
where
    I: IntoIterator<Item = (&'p str, &'p dyn Patch)>,
{
    let _span = info_span!("apply_patches", %mode).entered();
    let start = Instant::now();

    let mut report = PatchReport::default();
    for (source, patch) in patches {
        let outcome = apply_patch(source, patch, mode, module, graph);
        report.outcomes.push((source.to_string(), outcome));
    }

    info!(
        patches = report.outcomes.len(),
        rolled_back = report.rolled_back(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "applied patches"
    );
    report
}

fn guarded(f: impl FnOnce() -> Result<(), PatchError>) -> Result<(), PatchError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(PatchError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Export a [`Patch`] implementation from a `cdylib`
///
/// ```ignore
/// #[derive(Default)]
/// struct InfiniteJumps;
///
/// impl Patch for InfiniteJumps { /* ... */ }
///
/// hlpatch_bytecode::export_patch!(InfiniteJumps);
/// ```
///
/// A second form takes an explicit constructor expression:
/// `export_patch!(MyPatch, MyPatch::new(3))`.
#[macro_export]
macro_rules! export_patch {
    ($ty:ty) => {
        $crate::export_patch!($ty, <$ty as ::std::default::Default>::default());
    };
    ($ty:ty, $ctor:expr) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn hlpatch_create_patch(
        ) -> *mut ::std::boxed::Box<dyn $crate::patch::Patch> {
            let patch: $ty = $ctor;
            let patch: ::std::boxed::Box<dyn $crate::patch::Patch> = ::std::boxed::Box::new(patch);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(patch))
        }

        #[doc(hidden)]
        #[no_mangle]
        pub extern "C" fn hlpatch_abi_version() -> u32 {
            $crate::patch::PATCH_ABI_VERSION
        }
    };
}
