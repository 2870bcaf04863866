//! # VSM runtime core
//!
//! Asynchronous request/I-O runtime for vehicle-specific modules: the
//! process that sits between remotely connected vehicles (serial links,
//! TCP, UDP, proxied links) and a control server.
//!
//! ## Building blocks
//!
//! - [`request`]: the request kernel. A [`request::Request`] is a unit of
//!   asynchronous work with a processing phase, an optional completion
//!   phase on a separate container, cancellation and abort.
//!   [`request::RequestContainer`]s are FIFO queues served by dedicated
//!   [`request::RequestWorker`] threads; workers never steal from each
//!   other, and handlers are required to be non-blocking.
//! - [`timer`]: a timer wheel on one dedicated thread, backing operation
//!   timeouts and periodic handlers.
//! - [`io`]: the stream layer. One poll(2) dispatcher thread serves files,
//!   serial ports and sockets behind a single asynchronous
//!   read/write/close contract ([`io::IoStream`]).
//! - [`detector`]: config-driven transport probing with user-supplied
//!   protocol detectors.
//! - [`filter`]: line-oriented regex matching over a stream, used for
//!   serial protocol probing.
//! - [`runtime`]: the explicit composition root constructing all
//!   processors in dependency order.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vsm::request::RequestContainer;
//!
//! let runtime = vsm::Runtime::new().unwrap();
//! let ctx = RequestContainer::completion_context("example");
//! ctx.enable().unwrap();
//!
//! // Periodic work on the timer wheel, delivered on `ctx`.
//! let timer = runtime
//!   .timer_processor()
//!   .create_timer(
//!     std::time::Duration::from_millis(100),
//!     Box::new(|| true),
//!     Arc::clone(&ctx),
//!   )
//!   .unwrap();
//!
//! timer.cancel();
//! runtime.shutdown();
//! ```

#[macro_use]
mod macros;

pub mod arbiter;
pub mod buf;
pub mod detector;
pub mod error;
pub mod filter;
pub mod http;
pub mod io;
pub mod request;
pub mod runtime;
pub mod sync;
pub mod timer;

pub use buf::IoBuffer;
pub use error::{Error, IoResult, Result};
pub use request::{OperationWaiter, Request, RequestContainer, RequestWorker};
pub use runtime::Runtime;
pub use timer::TimerProcessor;
