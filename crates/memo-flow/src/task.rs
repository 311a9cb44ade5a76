//! Cooperative single-threaded task runtime.
//!
//! Tasks are plain futures driven by a wake-flag executor: everything runs on
//! the calling thread, suspension points are `bind`s on unfinished work,
//! [`yield_now`] and cell barriers, and resumption happens by re-polling the
//! root whenever anything signalled progress. There is no preemption and no
//! cancellation; a failed branch of [`fork_and_join`] still waits for its
//! sibling and the errors are aggregated.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Error, Errors};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// A unit of cooperative work producing `T` or a set of [`Error`]s.
///
/// `Task` is a boxed future; compose it with `.await` inside bodies, or with
/// the [`map`](Task::map)/[`and_then`](Task::and_then) combinators outside an
/// async context. Drive a tree of tasks with
/// [`Engine::run`](crate::Engine::run).
pub struct Task<T>(BoxFuture<Result<T, Errors>>);

impl<T: 'static> Task<T> {
    /// Wrap a future as a task.
    pub fn new(fut: impl Future<Output = Result<T, Errors>> + 'static) -> Self {
        Task(Box::pin(fut))
    }

    /// A task that immediately succeeds with `value`.
    pub fn ready(value: T) -> Self {
        Task::new(std::future::ready(Ok(value)))
    }

    /// A task that immediately fails with `errors`.
    pub fn fail(errors: Errors) -> Self {
        Task::new(std::future::ready(Err(errors)))
    }

    /// Lift an external cooperative computation into a task.
    ///
    /// The fiber is assumed reproducible: it must not observe side effects
    /// the engine cannot account for, since its result may be cached.
    pub fn from_fiber(fut: impl Future<Output = T> + 'static) -> Self {
        Task::new(async move { Ok(fut.await) })
    }

    /// Apply `f` to the success value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Task<U> {
        Task::new(async move { self.await.map(f) })
    }

    /// Chain a dependent task onto the success value.
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Task<U> + 'static) -> Task<U> {
        Task::new(async move { f(self.await?).await })
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, Errors>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

enum Branch<T> {
    Running(BoxFuture<Result<T, Errors>>),
    Done(Result<T, Errors>),
}

impl<T> Branch<T> {
    fn poll(&mut self, cx: &mut Context<'_>) -> bool {
        if let Branch::Running(fut) = self {
            match fut.as_mut().poll(cx) {
                Poll::Ready(r) => *self = Branch::Done(r),
                Poll::Pending => return false,
            }
        }
        true
    }

    fn take(self) -> Result<T, Errors> {
        match self {
            Branch::Done(r) => r,
            Branch::Running(_) => unreachable!("branch polled to completion"),
        }
    }
}

struct Join<A, B> {
    a: Option<Branch<A>>,
    b: Option<Branch<B>>,
}

impl<A, B> Future for Join<A, B> {
    type Output = Result<(A, B), Errors>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `Join`'s fields are never themselves pinned in place; the only
        // pinned data they hold is already boxed inside `Branch::Running`.
        let this = unsafe { self.get_unchecked_mut() };
        let a_done = this.a.as_mut().map(|a| a.poll(cx)).unwrap_or(true);
        let b_done = this.b.as_mut().map(|b| b.poll(cx)).unwrap_or(true);
        if !(a_done && b_done) {
            return Poll::Pending;
        }
        let a = this.a.take().map(Branch::take);
        let b = this.b.take().map(Branch::take);
        match (a, b) {
            (Some(Ok(a)), Some(Ok(b))) => Poll::Ready(Ok((a, b))),
            (a, b) => {
                let mut errors = Errors::none();
                if let Some(Err(e)) = a {
                    errors.merge(e);
                }
                if let Some(Err(e)) = b {
                    errors.merge(e);
                }
                Poll::Ready(Err(errors))
            }
        }
    }
}

/// Run `a` and `b` concurrently; finish when both have settled.
///
/// Both children always run to completion, even if one fails early. Failures
/// from both sides are aggregated into one [`Errors`], with errors observed
/// through several paths deduplicated by identity.
pub fn fork_and_join<A: 'static, B: 'static>(a: Task<A>, b: Task<B>) -> Task<(A, B)> {
    Task::new(Join {
        a: Some(Branch::Running(a.0)),
        b: Some(Branch::Running(b.0)),
    })
}

/// [`fork_and_join`] for effects only.
pub fn fork_and_join_unit(a: Task<()>, b: Task<()>) -> Task<()> {
    fork_and_join(a, b).map(|_| ())
}

/// Run `task` and collect every error it raised, preserving their stacks.
pub async fn collect_errors<T: 'static>(task: Task<T>) -> Result<T, Vec<Error>> {
    task.await.map_err(Errors::into_vec)
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Surrender to the scheduler; other ready tasks may run before this one
/// resumes.
pub fn yield_now() -> impl Future<Output = ()> {
    YieldNow { yielded: false }
}

/// One-shot barrier cells block on while another task works on them.
///
/// All waiters observe the single completion; the value itself is read back
/// from the cell state by whoever was waiting.
pub(crate) struct Notify {
    done: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
}

impl Notify {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Notify {
            done: Cell::new(false),
            wakers: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn notify(&self) {
        self.done.set(true);
        for waker in self.wakers.take() {
            waker.wake();
        }
    }

    pub(crate) fn wait(self: &Rc<Self>) -> Wait {
        Wait(self.clone())
    }
}

pub(crate) struct Wait(Rc<Notify>);

impl Future for Wait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.done.get() {
            Poll::Ready(())
        } else {
            self.0.wakers.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct WakeFlag(AtomicBool);

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Drive a future to completion on the current thread.
///
/// Every suspension in the engine registers a wakeup before suspending, so a
/// pending root with no wakeup flagged means no task can ever make progress
/// again. That only happens on a deadlock the cycle detector cannot express,
/// and is reported by panicking rather than hanging.
pub(crate) fn block_on<T>(fut: impl Future<Output = T>) -> T {
    let flag = Arc::new(WakeFlag(AtomicBool::new(false)));
    let waker = Waker::from(flag.clone());
    let mut cx = Context::from_waker(&waker);
    let mut fut = std::pin::pin!(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => {
                if !flag.0.swap(false, Ordering::SeqCst) {
                    panic!("task runtime stalled: a task suspended with no pending wakeup");
                }
            }
        }
    }
}
