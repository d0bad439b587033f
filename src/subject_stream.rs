use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_core::stream::Stream;

use crate::{Event, Subject, Subscription};

/// A `Stream` of the values published to a [`Subject`], created via
/// [`Subject::stream`].
///
/// Values published after creation are buffered (unbounded) until polled.
/// The stream ends when the subject terminates. Dropping the stream removes
/// its observer.
///
/// The type is enabled via the *futures-channel* feature (default).
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct SubjectStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> Subject<T>
    where T: Clone + Send + 'static
{
    /// Return a `Stream` of values subsequently published to this subject.
    pub fn stream(&self) -> SubjectStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe_events(move |ev| match ev {
            Event::Next(v) => {
                tx.unbounded_send(v.clone()).ok();
            }
            Event::Completed | Event::Failed(_) => tx.close_channel(),
        });
        SubjectStream { rx, _subscription: subscription }
    }
}

impl<T> Stream for SubjectStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<Self::Item>>
    {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}
