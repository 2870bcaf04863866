//! Demultiplexer routing decoded frames to registered handlers.
//!
//! Handlers register under a (message id, system id, component id) key
//! where system and component may be wildcards. Dispatch walks four
//! specificity levels — exact, (system, any), (any, component),
//! (any, any) — and stops at the first level with registered handlers:
//! every handler of that level runs, less specific ones are not consulted.
//! A handler may be bound to a request processor; its invocation is then
//! wrapped in a request submitted there, which is how frame callbacks
//! move from the decoder's I/O thread onto a driver's worker thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use vsm::buf::IoBuffer;
use vsm::error::Result;
use vsm::request::container::RequestContainer;
use vsm::request::request::{Request, ResultCode};
use vsm::sync::Mutex;

/// Wildcard for system or component ids.
pub const ID_ANY: i32 = -1;

/// Invoked with (payload, system id, component id) of a matching frame.
pub type DemuxHandler =
  Arc<dyn Fn(IoBuffer, u8, u8) + Send + Sync + 'static>;

/// Fallback when no handler matched. Returning `true` means "I registered
/// something, try the table again".
pub type DefaultHandler =
  Box<dyn FnMut(u32, u8, u8) -> bool + Send + 'static>;

/// Registration key, used for unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DemuxKey(u64);

struct HandlerEntry {
  key: DemuxKey,
  handler: DemuxHandler,
  /// Processor to rebind the invocation to, if any.
  processor: Option<Arc<RequestContainer>>,
}

type TableKey = (u32, i32, i32);

pub struct MavlinkDemuxer {
  handlers: Mutex<HashMap<TableKey, Vec<HandlerEntry>>>,
  default_handler: Mutex<Option<DefaultHandler>>,
  key_generator: AtomicU64,
}

impl MavlinkDemuxer {
  pub fn new() -> MavlinkDemuxer {
    MavlinkDemuxer {
      handlers: Mutex::new(HashMap::new()),
      default_handler: Mutex::new(None),
      key_generator: AtomicU64::new(1),
    }
  }

  /// Registers `handler` for `message_id`, optionally narrowed to one
  /// system/component, optionally rebound onto `processor`.
  pub fn register_handler(
    &self,
    message_id: u32,
    system_id: Option<u8>,
    component_id: Option<u8>,
    handler: DemuxHandler,
    processor: Option<Arc<RequestContainer>>,
  ) -> DemuxKey {
    let key = DemuxKey(self.key_generator.fetch_add(1, Ordering::AcqRel));
    let table_key = (
      message_id,
      system_id.map(i32::from).unwrap_or(ID_ANY),
      component_id.map(i32::from).unwrap_or(ID_ANY),
    );
    self
      .handlers
      .lock()
      .entry(table_key)
      .or_default()
      .push(HandlerEntry { key, handler, processor });
    key
  }

  pub fn unregister_handler(&self, key: DemuxKey) {
    let mut handlers = self.handlers.lock();
    for entries in handlers.values_mut() {
      if let Some(index) = entries.iter().position(|e| e.key == key) {
        entries.remove(index);
        break;
      }
    }
    handlers.retain(|_, entries| !entries.is_empty());
  }

  pub fn register_default_handler(&self, handler: DefaultHandler) {
    *self.default_handler.lock() = Some(handler);
  }

  /// Drops every handler.
  pub fn disable(&self) {
    *self.default_handler.lock() = None;
    self.handlers.lock().clear();
  }

  /// Routes one decoded frame. Returns whether any handler took it.
  ///
  /// When the table has no match, the default handler runs and may opt to
  /// register a specific handler and have the table tried once more.
  pub fn demux(
    &self,
    buffer: IoBuffer,
    message_id: u32,
    system_id: u8,
    component_id: u8,
  ) -> bool {
    if self.demux_try(&buffer, message_id, system_id, component_id) {
      return true;
    }
    let retry = {
      let mut default_handler = self.default_handler.lock();
      match default_handler.as_mut() {
        Some(handler) => handler(message_id, system_id, component_id),
        None => false,
      }
    };
    if retry {
      return self.demux_try(&buffer, message_id, system_id, component_id);
    }
    false
  }

  /// Four specificity levels, most specific first; the first non-empty
  /// level wins.
  fn demux_try(
    &self,
    buffer: &IoBuffer,
    message_id: u32,
    system_id: u8,
    component_id: u8,
  ) -> bool {
    let levels = [
      (message_id, i32::from(system_id), i32::from(component_id)),
      (message_id, i32::from(system_id), ID_ANY),
      (message_id, ID_ANY, i32::from(component_id)),
      (message_id, ID_ANY, ID_ANY),
    ];
    for level in levels {
      if self.demux_level(&level, buffer, system_id, component_id) {
        return true;
      }
    }
    false
  }

  fn demux_level(
    &self,
    table_key: &TableKey,
    buffer: &IoBuffer,
    system_id: u8,
    component_id: u8,
  ) -> bool {
    // Snapshot the matching callbacks so handlers can touch the table.
    let entries: Vec<(DemuxHandler, Option<Arc<RequestContainer>>)> = {
      let handlers = self.handlers.lock();
      match handlers.get(table_key) {
        Some(entries) => entries
          .iter()
          .map(|e| (Arc::clone(&e.handler), e.processor.clone()))
          .collect(),
        None => return false,
      }
    };
    if entries.is_empty() {
      return false;
    }
    for (handler, processor) in entries {
      match processor {
        Some(processor) => {
          if let Err(err) = Self::invoke_on(
            &processor,
            handler,
            buffer.clone(),
            system_id,
            component_id,
          ) {
            tracing::error!(%err, "demux handler dispatch failed");
          }
        }
        None => handler(buffer.clone(), system_id, component_id),
      }
    }
    true
  }

  /// Wraps the invocation in a request so it runs on `processor`.
  fn invoke_on(
    processor: &Arc<RequestContainer>,
    handler: DemuxHandler,
    buffer: IoBuffer,
    system_id: u8,
    component_id: u8,
  ) -> Result<()> {
    let request = Request::new();
    let request2 = Arc::clone(&request);
    request.set_processing_handler(Box::new(move || {
      handler(buffer, system_id, component_id);
      let _ = request2.complete(ResultCode::Ok);
    }))?;
    processor.submit(request)
  }
}

impl Default for MavlinkDemuxer {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;
  use vsm::request::worker::RequestWorker;

  fn counting_handler(counter: &Arc<AtomicUsize>) -> DemuxHandler {
    let counter = Arc::clone(counter);
    Arc::new(move |_, _, _| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn test_most_specific_level_wins() {
    let demuxer = MavlinkDemuxer::new();
    let exact = Arc::new(AtomicUsize::new(0));
    let sys_any = Arc::new(AtomicUsize::new(0));
    let any_any = Arc::new(AtomicUsize::new(0));
    demuxer.register_handler(0, Some(1), Some(1), counting_handler(&exact), None);
    demuxer.register_handler(0, Some(1), None, counting_handler(&sys_any), None);
    demuxer.register_handler(0, None, None, counting_handler(&any_any), None);

    assert!(demuxer.demux(IoBuffer::new(), 0, 1, 1));
    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(sys_any.load(Ordering::SeqCst), 0);
    assert_eq!(any_any.load(Ordering::SeqCst), 0);

    // Different component: exact level is empty, (sys, any) wins.
    assert!(demuxer.demux(IoBuffer::new(), 0, 1, 7));
    assert_eq!(sys_any.load(Ordering::SeqCst), 1);
    assert_eq!(any_any.load(Ordering::SeqCst), 0);

    // Different system entirely: falls through to the wildcard.
    assert!(demuxer.demux(IoBuffer::new(), 0, 9, 9));
    assert_eq!(any_any.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_all_handlers_of_winning_level_run() {
    let demuxer = MavlinkDemuxer::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    demuxer.register_handler(42, Some(3), Some(4), counting_handler(&first), None);
    demuxer.register_handler(42, Some(3), Some(4), counting_handler(&second), None);
    assert!(demuxer.demux(IoBuffer::new(), 42, 3, 4));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_unregister() {
    let demuxer = MavlinkDemuxer::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let key =
      demuxer.register_handler(1, None, None, counting_handler(&hits), None);
    assert!(demuxer.demux(IoBuffer::new(), 1, 1, 1));
    demuxer.unregister_handler(key);
    assert!(!demuxer.demux(IoBuffer::new(), 1, 1, 1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_default_handler_may_register_and_retry() {
    let demuxer = Arc::new(MavlinkDemuxer::new());
    let hits = Arc::new(AtomicUsize::new(0));
    {
      let demuxer2 = Arc::clone(&demuxer);
      let hits = Arc::clone(&hits);
      demuxer.register_default_handler(Box::new(
        move |message_id, system_id, component_id| {
          demuxer2.register_handler(
            message_id,
            Some(system_id),
            Some(component_id),
            counting_handler(&hits),
            None,
          );
          true
        },
      ));
    }
    assert!(demuxer.demux(IoBuffer::new(), 33, 1, 1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    // Now the registered handler matches directly.
    assert!(demuxer.demux(IoBuffer::new(), 33, 1, 1));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_unmatched_without_default_returns_false() {
    let demuxer = MavlinkDemuxer::new();
    assert!(!demuxer.demux(IoBuffer::new(), 77, 1, 1));
  }

  #[test]
  fn test_handler_rebinds_to_processor() {
    let demuxer = MavlinkDemuxer::new();
    let (worker, container) = RequestWorker::single("demux target");
    worker.enable().unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let handler: DemuxHandler = Arc::new(move |payload, sys, comp| {
      tx.send((payload.to_vec(), sys, comp, std::thread::current().name().map(String::from)))
        .unwrap();
    });
    demuxer.register_handler(0, None, None, handler, Some(container));

    assert!(demuxer.demux(IoBuffer::from_static(b"pay"), 0, 5, 6));
    let (payload, sys, comp, thread_name) =
      rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(payload, b"pay");
    assert_eq!((sys, comp), (5, 6));
    assert_eq!(thread_name.as_deref(), Some("demux target"));
    worker.disable();
  }
}
