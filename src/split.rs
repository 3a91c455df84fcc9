// A "fork" combinator: splits a future yielding a pair `(A, B)` into two
// independently-pollable futures, `Left` yielding `A` and `Right` yielding `B`.
// Whichever side is polled first drives the shared inner future; the other side is
// woken once it completes. This is what lets `local::Request::send` hand the
// application a future for the `Response` while separately handing the freshly
// resolved `Pipeline` to `queued::Pipeline::drive`, without polling the underlying
// `try_join` twice or requiring either `A` or `B` to be `Clone`.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum State<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
{
    Polling(Pin<Box<F>>),
    Done(Result<(), E>),
    Taken,
}

struct Shared<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
{
    state: State<F, A, B, E>,
    left_slot: Option<A>,
    right_slot: Option<B>,
    left_waker: Option<Waker>,
    right_waker: Option<Waker>,
}

fn drive<F, A, B, E>(shared: &Rc<RefCell<Shared<F, A, B, E>>>, cx: &mut Context<'_>)
where
    F: Future<Output = Result<(A, B), E>>,
    E: Clone,
{
    let mut inner = shared.borrow_mut();
    if let State::Polling(ref mut fut) = inner.state {
        match fut.as_mut().poll(cx) {
            Poll::Pending => return,
            Poll::Ready(Ok((a, b))) => {
                inner.left_slot = Some(a);
                inner.right_slot = Some(b);
                inner.state = State::Done(Ok(()));
            }
            Poll::Ready(Err(e)) => {
                inner.state = State::Done(Err(e));
            }
        }
        if let Some(w) = inner.left_waker.take() {
            w.wake();
        }
        if let Some(w) = inner.right_waker.take() {
            w.wake();
        }
    }
}

pub struct Left<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
{
    shared: Rc<RefCell<Shared<F, A, B, E>>>,
}

pub struct Right<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
{
    shared: Rc<RefCell<Shared<F, A, B, E>>>,
}

impl<F, A, B, E> Future for Left<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
    E: Clone,
{
    type Output = Result<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        drive(&self.shared, cx);
        let mut inner = self.shared.borrow_mut();
        match inner.state {
            State::Polling(_) => {
                inner.left_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Done(Ok(())) => match inner.left_slot.take() {
                Some(a) => Poll::Ready(Ok(a)),
                None => panic!("Left polled after it already completed"),
            },
            State::Done(Err(ref e)) => Poll::Ready(Err(e.clone())),
            State::Taken => panic!("Left polled after it already completed"),
        }
    }
}

impl<F, A, B, E> Future for Right<F, A, B, E>
where
    F: Future<Output = Result<(A, B), E>>,
    E: Clone,
{
    type Output = Result<B, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        drive(&self.shared, cx);
        let mut inner = self.shared.borrow_mut();
        match inner.state {
            State::Polling(_) => {
                inner.right_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Done(Ok(())) => match inner.right_slot.take() {
                Some(b) => Poll::Ready(Ok(b)),
                None => panic!("Right polled after it already completed"),
            },
            State::Done(Err(ref e)) => Poll::Ready(Err(e.clone())),
            State::Taken => panic!("Right polled after it already completed"),
        }
    }
}

pub fn split<F, A, B, E>(f: F) -> (Left<F, A, B, E>, Right<F, A, B, E>)
where
    F: Future<Output = Result<(A, B), E>>,
    E: Clone,
{
    let shared = Rc::new(RefCell::new(Shared {
        state: State::Polling(Box::pin(f)),
        left_slot: None,
        right_slot: None,
        left_waker: None,
        right_waker: None,
    }));
    (
        Left {
            shared: shared.clone(),
        },
        Right { shared },
    )
}
