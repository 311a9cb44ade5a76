//! Engine error types.
//!
//! User bodies fail with [`anyhow::Error`]; the engine wraps each failure in
//! an [`Error`] that is cheap to clone, carries the offending call stack and
//! keeps its identity across dependents, so one failed cell surfaces once no
//! matter how many paths observe it. Raising [`NonReproducible`] marks a
//! failure as not safe to cache across runs; the wrapper is stripped at the
//! engine boundary and only the flag remains.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::stack::StackFrame;

/// Wrapper a body raises around an error that may not recur for the same
/// input (a flaky external service, an interrupted read).
///
/// The engine unwraps it and caches the inner error for the current run only;
/// every later run recomputes the cell.
#[derive(Debug)]
pub struct NonReproducible(pub anyhow::Error);

impl fmt::Display for NonReproducible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NonReproducible {}

/// The chain of calls that closed a dependency cycle.
#[derive(Debug, Clone)]
pub struct CycleError {
    frames: Vec<StackFrame>,
}

impl CycleError {
    pub(crate) fn new(frames: Vec<StackFrame>) -> Self {
        CycleError { frames }
    }

    /// Frames on the cycle, starting from the call that closed it.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected: ")?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

enum ErrorKind {
    App {
        error: anyhow::Error,
        reproducible: bool,
    },
    Cycle(CycleError),
}

struct ErrorRepr {
    kind: ErrorKind,
    /// Call stack at the raise point, innermost first. Filled in once by the
    /// cell that caught the failure; propagation never rewrites it.
    stack: RefCell<Vec<StackFrame>>,
}

/// A single cached failure: what went wrong and where.
///
/// Clones share one allocation; aggregation deduplicates by that identity.
#[derive(Clone)]
pub struct Error {
    repr: Rc<ErrorRepr>,
}

impl Error {
    fn new(kind: ErrorKind, stack: Vec<StackFrame>) -> Self {
        Error {
            repr: Rc::new(ErrorRepr {
                kind,
                stack: RefCell::new(stack),
            }),
        }
    }

    /// An error from a plain message.
    pub fn msg(msg: impl fmt::Display) -> Self {
        anyhow::Error::msg(msg.to_string()).into()
    }

    pub(crate) fn cycle(cycle: CycleError, stack: Vec<StackFrame>) -> Self {
        Error::new(ErrorKind::Cycle(cycle), stack)
    }

    /// Whether this failure is guaranteed to recur for identical inputs and
    /// may therefore be cached across runs.
    pub fn is_reproducible(&self) -> bool {
        match &self.repr.kind {
            ErrorKind::App { reproducible, .. } => *reproducible,
            ErrorKind::Cycle(_) => true,
        }
    }

    /// The cycle this error reports, if it is a cycle error.
    pub fn as_cycle(&self) -> Option<&CycleError> {
        match &self.repr.kind {
            ErrorKind::Cycle(cycle) => Some(cycle),
            ErrorKind::App { .. } => None,
        }
    }

    /// Downcast the underlying application error.
    pub fn downcast_ref<E: fmt::Display + fmt::Debug + Send + Sync + 'static>(
        &self,
    ) -> Option<&E> {
        match &self.repr.kind {
            ErrorKind::App { error, .. } => error.downcast_ref::<E>(),
            ErrorKind::Cycle(_) => None,
        }
    }

    /// The call stack at the raise point, innermost first.
    pub fn stack(&self) -> Vec<StackFrame> {
        self.repr.stack.borrow().clone()
    }

    pub(crate) fn set_stack_if_empty(&self, frames: &[StackFrame]) {
        let mut stack = self.repr.stack.borrow_mut();
        if stack.is_empty() {
            *stack = frames.to_vec();
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.repr, &other.repr)
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        // Strip the user-facing wrapper; only the flag is stored.
        match error.downcast::<NonReproducible>() {
            Ok(NonReproducible(inner)) => Error::new(
                ErrorKind::App {
                    error: inner,
                    reproducible: false,
                },
                Vec::new(),
            ),
            Err(error) => Error::new(
                ErrorKind::App {
                    error,
                    reproducible: true,
                },
                Vec::new(),
            ),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr.kind {
            ErrorKind::App { error, .. } => write!(f, "{error}"),
            ErrorKind::Cycle(cycle) => write!(f, "{cycle}"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")?;
        let stack = self.repr.stack.borrow();
        if let Some(frame) = stack.first() {
            write!(f, " (raised in {frame})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.repr.kind {
            ErrorKind::App { error, .. } => Some(error.as_ref()),
            ErrorKind::Cycle(_) => None,
        }
    }
}

/// All errors observed by one computation, deduplicated by identity.
///
/// Concurrent children of a [`fork_and_join`](crate::fork_and_join) can fail
/// independently; the join carries every distinct failure forward.
#[derive(Clone)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub(crate) fn none() -> Self {
        Errors(Vec::new())
    }

    /// A single error from a plain message.
    pub fn msg(msg: impl fmt::Display) -> Self {
        Error::msg(msg).into()
    }

    /// A single non-reproducible error; see [`NonReproducible`].
    pub fn non_reproducible(error: impl Into<anyhow::Error>) -> Self {
        Error::from(anyhow::Error::new(NonReproducible(error.into()))).into()
    }

    /// Number of distinct errors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no error has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the errors in the order they were observed.
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// The errors, in observation order.
    pub fn into_vec(self) -> Vec<Error> {
        self.0
    }

    pub(crate) fn merge(&mut self, other: Errors) {
        for error in other.0 {
            if !self.0.iter().any(|e| e.ptr_eq(&error)) {
                self.0.push(error);
            }
        }
    }

    pub(crate) fn all_reproducible(&self) -> bool {
        self.0.iter().all(Error::is_reproducible)
    }

    pub(crate) fn set_stack_if_empty(&self, frames: &[StackFrame]) {
        for error in &self.0 {
            error.set_stack_if_empty(frames);
        }
    }
}

impl std::ops::Index<usize> for Errors {
    type Output = Error;

    fn index(&self, index: usize) -> &Error {
        &self.0[index]
    }
}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Errors(vec![error])
    }
}

impl From<anyhow::Error> for Errors {
    fn from(error: anyhow::Error) -> Self {
        Error::from(error).into()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl std::error::Error for Errors {}
