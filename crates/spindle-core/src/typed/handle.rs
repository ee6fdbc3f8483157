//! TaskHandle - 呼び出し側が await する completion handle
//!
//! worker 側が `oneshot::Sender` を、呼び出し側が `TaskHandle<R>` を持つ。
//! handle を drop すると sender が closed になり、worker はそれを
//! キャンセルとして扱う。

use std::any::{Any, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::domain::{TaskError, TaskId};

/// What travels through the completion channel.
pub(crate) type Delivery = Result<Box<dyn Any + Send>, TaskError>;

pub(crate) type CompletionSender = oneshot::Sender<Delivery>;

/// Awaitable result of one submitted task.
#[must_use = "dropping a TaskHandle cancels the task"]
pub struct TaskHandle<R> {
    id: TaskId,
    rx: oneshot::Receiver<Delivery>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: 'static> TaskHandle<R> {
    pub(crate) fn channel(id: TaskId) -> (CompletionSender, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                id,
                rx,
                _marker: PhantomData,
            },
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Give up on the result. Same as dropping the handle.
    pub fn cancel(self) {}
}

impl<R: 'static> Future for TaskHandle<R> {
    type Output = Result<R, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(Ok(value)) => value.downcast::<R>().map(|v| *v).map_err(|_| {
                TaskError::Execution(format!(
                    "result type mismatch, expected {}",
                    type_name::<R>()
                ))
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TaskError::Cancelled(
                "task was dropped without a result".to_string(),
            )),
        })
    }
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn handle<R: 'static>() -> (CompletionSender, TaskHandle<R>) {
        TaskHandle::channel(TaskId::from_ulid(Ulid::new()))
    }

    #[tokio::test]
    async fn resolves_with_typed_value() {
        let (tx, h) = handle::<String>();
        tx.send(Ok(Box::new("done".to_string()))).unwrap();
        assert_eq!(h.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn forwards_task_error() {
        let (tx, h) = handle::<u32>();
        tx.send(Err(TaskError::Validation("no such function".into())))
            .unwrap();
        assert_eq!(
            h.await,
            Err(TaskError::Validation("no such function".into()))
        );
    }

    #[tokio::test]
    async fn dropped_sender_is_cancellation() {
        let (tx, h) = handle::<u32>();
        drop(tx);
        assert!(h.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn type_mismatch_is_execution_error() {
        let (tx, h) = handle::<u32>();
        tx.send(Ok(Box::new("not a number"))).unwrap();
        assert!(matches!(h.await, Err(TaskError::Execution(_))));
    }

    #[tokio::test]
    async fn cancel_closes_the_sender() {
        let (tx, h) = handle::<u32>();
        h.cancel();
        assert!(tx.is_closed());
    }
}
