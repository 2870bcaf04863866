//! Asynchronous request kernel: requests, containers, waiters, workers.

pub mod container;
pub mod operation_waiter;
#[allow(clippy::module_inception)]
pub mod request;
pub mod waiter;
pub mod worker;

pub use container::{ContainerKind, RequestContainer};
pub use operation_waiter::{OperationWaiter, TimeoutHandler};
pub use request::{Handler, Request, ResultCode, Status};
pub use waiter::RequestWaiter;
pub use worker::RequestWorker;
