use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::oneshot;

use crate::{AsyncCommand, Canceled, Failure, GateClosed};

/// A future type created by [`AsyncCommand::execute_rx`].
///
/// Resolves to the values of a single execution, or its failure, once they
/// have been published and the in-flight count released.
///
/// The type is enabled via the *futures-channel* feature (default).
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited or polled"]
pub struct Dispatched<T>(oneshot::Receiver<Result<Vec<T>, Failure>>);

impl<T> Future for Dispatched<T> {
    type Output = Result<Vec<T>, Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Self::Output>
    {
        match Future::poll(Pin::new(&mut self.0), cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Failure::from(Canceled)))
        }
    }
}

impl<P, T> AsyncCommand<P, T>
    where P: Send + 'static,
          T: Send + 'static
{
    /// Execute the registered function with param, returning a future for
    /// awaiting its outcome.
    ///
    /// As with [`execute`](AsyncCommand::execute), values are also published
    /// to the output stream and failures to the error stream. Fails with
    /// `GateClosed` if the command can not currently execute.
    ///
    /// The method is enabled via the *futures-channel* feature (default).
    pub fn execute_rx(&self, param: P) -> Result<Dispatched<T>, GateClosed> {
        let (tx, rx) = oneshot::channel();
        self.submit(param, Some(Box::new(move |outcome: Result<Vec<T>, Failure>| {
            tx.send(outcome).ok();
        })))?;
        Ok(Dispatched(rx))
    }
}

#[cfg(test)]
mod tests {
    use futures_executor as futr_exec;

    use crate::{AsyncCommandBuilder, BoxError, Schedulers, VirtualScheduler};

    use super::*;

    #[test]
    fn resolves_with_values() {
        piccolog::test_logger();
        let cmd = AsyncCommandBuilder::new(Schedulers::threaded())
            .register_sequence(|n: u32| -> Result<_, BoxError> { Ok(0..n) });
        let rx = cmd.execute_rx(3).unwrap();
        assert_eq!(vec![0, 1, 2], futr_exec::block_on(rx).unwrap());
        assert_eq!(0, cmd.in_flight());
    }

    #[test]
    fn resolves_with_failure() {
        piccolog::test_logger();
        let cmd = AsyncCommandBuilder::new(Schedulers::immediate())
            .register(|_: ()| -> Result<u8, BoxError> { Err("failed".into()) });
        let rx = cmd.execute_rx(()).unwrap();
        let err = futr_exec::block_on(rx).unwrap_err();
        assert_eq!("failed", err.to_string());
    }

    #[test]
    fn rejected_when_gate_closed() {
        piccolog::test_logger();
        let worker = std::sync::Arc::new(VirtualScheduler::new());
        let cmd = AsyncCommandBuilder::new(
            Schedulers::new(worker.clone(), worker.clone()))
            .max_concurrent(1)
            .register(|x: u8| -> Result<u8, BoxError> { Ok(x) });
        let first = cmd.execute_rx(1).unwrap();
        assert_eq!(GateClosed, cmd.execute_rx(2).unwrap_err());
        worker.run();
        assert_eq!(vec![1], futr_exec::block_on(first).unwrap());
        assert!(cmd.can_execute());
    }
}
