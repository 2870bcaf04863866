//! Line-oriented regex matcher over a text stream.
//!
//! Used for serial protocol probing: AT-style devices answer with banner
//! and status lines, and a driver wants "fire my callback when a line
//! matching this pattern shows up, with a few lines of context". The
//! filter consumes the stream byte by byte, assembles bounded lines, keeps
//! a short history for before-context, and collects after-context lines
//! once an entry matched. Entries may carry a timeout backed by the timer
//! wheel; stream closure delivers `Closed` to every outstanding entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, IoResult, Result};
use crate::io::dispatcher::Offset;
use crate::io::stream::IoStream;
use crate::request::container::RequestContainer;
use crate::sync::Mutex;
use crate::timer::{Timer, TimerProcessor};

/// Longest assembled line; longer input is force-terminated.
pub const MAX_LINE_LENGTH: usize = 512;
/// Complete lines retained for before-context capture.
pub const LINE_HISTORY_LEN: usize = 10;

/// Entry callback: outcome plus captured context lines (before-context,
/// matched line, after-context, in order). Returning `true` re-arms the
/// entry, `false` removes it.
pub type MatchHandler =
  Box<dyn FnMut(IoResult, &[String]) -> bool + Send + 'static>;

/// Pre-filter invoked for every complete line before matching. Returning
/// `true` consumes the line: no entry sees it.
pub type LineHandler = Box<dyn FnMut(&str) -> bool + Send + 'static>;

pub type EntryKey = u64;

struct Entry {
  regex: Regex,
  handler: MatchHandler,
  ctx_before: usize,
  ctx_after: usize,
  timeout: Option<Duration>,
  timer: Option<Arc<Timer>>,
  captured: Vec<String>,
  /// After-context lines still to collect; zero when not matched yet.
  after_remaining: usize,
}

struct FilterState {
  line: String,
  history: VecDeque<String>,
  entries: HashMap<EntryKey, Entry>,
  next_key: EntryKey,
  cr_pending: bool,
  /// Entry currently collecting after-context, if any.
  collecting: Option<EntryKey>,
  line_handler: Option<LineHandler>,
  started: bool,
  closed: bool,
}

pub struct TextStreamFilter {
  inner: Arc<FilterInner>,
}

struct FilterInner {
  stream: Arc<dyn IoStream>,
  ctx: Arc<RequestContainer>,
  timer_processor: Arc<TimerProcessor>,
  state: Mutex<FilterState>,
}

impl TextStreamFilter {
  pub fn new(
    stream: Arc<dyn IoStream>,
    ctx: Arc<RequestContainer>,
    timer_processor: Arc<TimerProcessor>,
  ) -> TextStreamFilter {
    let inner = Arc::new(FilterInner {
      stream,
      ctx,
      timer_processor,
      state: Mutex::new(FilterState {
        line: String::new(),
        history: VecDeque::new(),
        entries: HashMap::new(),
        next_key: 1,
        cr_pending: false,
        collecting: None,
        line_handler: None,
        started: false,
        closed: false,
      }),
    });
    TextStreamFilter { inner }
  }

  pub fn set_line_handler(&self, handler: LineHandler) {
    self.inner.state.lock().line_handler = Some(handler);
  }

  /// Registers a pattern with before/after context and an optional
  /// timeout. The returned key removes the entry again.
  pub fn add_entry(
    &self,
    regex: Regex,
    handler: MatchHandler,
    ctx_before: usize,
    ctx_after: usize,
    timeout: Option<Duration>,
  ) -> Result<EntryKey> {
    let mut state = self.inner.state.lock();
    if state.closed {
      return Err(Error::ClosedStream);
    }
    let key = state.next_key;
    state.next_key += 1;
    let mut entry = Entry {
      regex,
      handler,
      ctx_before,
      ctx_after,
      timeout,
      timer: None,
      captured: Vec::new(),
      after_remaining: 0,
    };
    drop(state);
    if let Some(duration) = entry.timeout {
      entry.timer = Some(self.inner.start_timeout(key, duration)?);
    }
    self.inner.state.lock().entries.insert(key, entry);
    Ok(key)
  }

  pub fn remove_entry(&self, key: EntryKey) {
    let entry = {
      let mut state = self.inner.state.lock();
      if state.collecting == Some(key) {
        state.collecting = None;
      }
      state.entries.remove(&key)
    };
    if let Some(entry) = entry {
      if let Some(timer) = entry.timer {
        timer.cancel();
      }
    }
  }

  /// Starts consuming the stream.
  pub fn enable(&self) -> Result<()> {
    {
      let mut state = self.inner.state.lock();
      if state.started {
        return Err(Error::InvalidOp("filter already enabled"));
      }
      state.started = true;
    }
    self.inner.schedule_read();
    Ok(())
  }

  /// Stops the filter, delivering `Closed` to outstanding entries.
  pub fn disable(&self) {
    self.inner.on_closed();
  }
}

impl FilterInner {
  fn schedule_read(self: &Arc<Self>) {
    if self.state.lock().closed {
      return;
    }
    let inner = Arc::clone(self);
    let result = self.stream.read(
      1,
      1,
      Offset::None,
      Box::new(move |result, data| match result {
        IoResult::Ok => {
          for byte in data.as_slice() {
            inner.feed_byte(*byte);
          }
          inner.schedule_read();
        }
        _ => inner.on_closed(),
      }),
      &self.ctx,
    );
    if result.is_err() {
      self.on_closed();
    }
  }

  fn feed_byte(self: &Arc<Self>, byte: u8) {
    let completed: Option<String> = {
      let mut state = self.state.lock();
      if state.cr_pending {
        // A lone CR terminates its line once the next byte shows up;
        // CRLF counts as a single terminator.
        state.cr_pending = false;
        let line = std::mem::take(&mut state.line);
        match byte {
          b'\n' => Some(line),
          b'\r' => {
            state.cr_pending = true;
            Some(line)
          }
          _ => {
            state.line.push(byte as char);
            Some(line)
          }
        }
      } else {
        match byte {
          b'\r' => {
            state.cr_pending = true;
            None
          }
          b'\n' => Some(std::mem::take(&mut state.line)),
          _ => {
            state.line.push(byte as char);
            if state.line.len() >= MAX_LINE_LENGTH {
              Some(std::mem::take(&mut state.line))
            } else {
              None
            }
          }
        }
      }
    };
    if let Some(line) = completed {
      self.process_line(line);
    }
  }

  fn process_line(self: &Arc<Self>, line: String) {
    // Pre-filter first: a consumed line is invisible to the entries.
    let consumed = {
      let mut state = self.state.lock();
      match state.line_handler.as_mut() {
        Some(handler) => handler(&line),
        None => false,
      }
    };
    if !consumed {
      let fire: Option<EntryKey> = {
        let mut state = self.state.lock();
        if let Some(key) = state.collecting {
          match state.entries.get_mut(&key) {
            Some(entry) => {
              entry.captured.push(line.clone());
              entry.after_remaining -= 1;
              if entry.after_remaining == 0 {
                state.collecting = None;
                Some(key)
              } else {
                None
              }
            }
            None => {
              state.collecting = None;
              None
            }
          }
        } else {
          let mut matched = None;
          let mut keys: Vec<_> = state.entries.keys().copied().collect();
          keys.sort_unstable();
          for key in keys {
            let history: Vec<String> =
              state.history.iter().cloned().collect();
            let entry = state.entries.get_mut(&key).unwrap();
            if !entry.regex.is_match(&line) {
              continue;
            }
            let before = entry.ctx_before.min(history.len());
            entry.captured =
              history[history.len() - before..].to_vec();
            entry.captured.push(line.clone());
            if entry.ctx_after > 0 {
              entry.after_remaining = entry.ctx_after;
              state.collecting = Some(key);
            } else {
              matched = Some(key);
            }
            break;
          }
          matched
        }
      };
      if let Some(key) = fire {
        self.fire_entry(key, IoResult::Ok);
      }
    }
    let mut state = self.state.lock();
    state.history.push_back(line);
    while state.history.len() > LINE_HISTORY_LEN {
      state.history.pop_front();
    }
  }

  /// Runs the entry handler outside the state lock; re-arms or removes
  /// according to its return value.
  fn fire_entry(self: &Arc<Self>, key: EntryKey, result: IoResult) {
    let entry = {
      let mut state = self.state.lock();
      if state.collecting == Some(key) {
        state.collecting = None;
      }
      state.entries.remove(&key)
    };
    let Some(mut entry) = entry else { return };
    if let Some(timer) = entry.timer.take() {
      timer.cancel();
    }
    let captured = std::mem::take(&mut entry.captured);
    let rearm = (entry.handler)(result, &captured);
    if !rearm || result == IoResult::Closed {
      return;
    }
    entry.after_remaining = 0;
    if let Some(duration) = entry.timeout {
      match self.start_timeout(key, duration) {
        Ok(timer) => entry.timer = Some(timer),
        Err(err) => {
          tracing::error!(%err, "filter entry timeout re-arm failed");
        }
      }
    }
    self.state.lock().entries.insert(key, entry);
  }

  fn start_timeout(
    self: &Arc<Self>,
    key: EntryKey,
    duration: Duration,
  ) -> Result<Arc<Timer>> {
    let weak = Arc::downgrade(self);
    self.timer_processor.create_timer(
      duration,
      Box::new(move || {
        if let Some(inner) = weak.upgrade() {
          inner.fire_entry(key, IoResult::TimedOut);
        }
        false
      }),
      Arc::clone(&self.ctx),
    )
  }

  fn on_closed(self: &Arc<Self>) {
    let entries = {
      let mut state = self.state.lock();
      if state.closed {
        return;
      }
      state.closed = true;
      state.collecting = None;
      std::mem::take(&mut state.entries)
    };
    for (_, mut entry) in entries {
      if let Some(timer) = entry.timer.take() {
        timer.cancel();
      }
      let captured = std::mem::take(&mut entry.captured);
      let _ = (entry.handler)(IoResult::Closed, &captured);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Byte-level behavior is tested by pushing bytes straight through the
  // state machine; the stream plumbing is covered by integration tests.
  fn bare_inner() -> Arc<FilterInner> {
    struct NullStream;
    impl IoStream for NullStream {
      fn name(&self) -> String {
        "null".into()
      }
      fn kind(&self) -> crate::io::stream::StreamKind {
        crate::io::stream::StreamKind::File
      }
      fn read(
        &self,
        _max: usize,
        _min: usize,
        _offset: Offset,
        _handler: crate::io::stream::ReadHandler,
        _ctx: &Arc<RequestContainer>,
      ) -> Result<crate::request::operation_waiter::OperationWaiter> {
        Err(Error::ClosedStream)
      }
      fn write(
        &self,
        _buffer: crate::buf::IoBuffer,
        _offset: Offset,
        _handler: crate::io::stream::WriteHandler,
        _ctx: &Arc<RequestContainer>,
      ) -> Result<crate::request::operation_waiter::OperationWaiter> {
        Err(Error::ClosedStream)
      }
      fn close(&self) {}
      fn is_closed(&self) -> bool {
        false
      }
    }
    let ctx = RequestContainer::completion_context("filter test");
    ctx.enable().unwrap();
    let timer_processor = TimerProcessor::new();
    timer_processor.enable().unwrap();
    let filter = TextStreamFilter::new(
      Arc::new(NullStream),
      ctx,
      timer_processor,
    );
    Arc::clone(&filter.inner)
  }

  fn feed(inner: &Arc<FilterInner>, data: &[u8]) {
    for byte in data {
      inner.feed_byte(*byte);
    }
  }

  fn collect_matches(
    filter: &Arc<FilterInner>,
    pattern: &str,
    before: usize,
    after: usize,
  ) -> Arc<Mutex<Vec<(IoResult, Vec<String>)>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let wrapper = TextStreamFilter { inner: Arc::clone(filter) };
    wrapper
      .add_entry(
        Regex::new(pattern).unwrap(),
        Box::new(move |result, lines| {
          sink.lock().push((result, lines.to_vec()));
          true
        }),
        before,
        after,
        None,
      )
      .unwrap();
    collected
  }

  #[test]
  fn test_line_terminators_are_equivalent() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "^ready$", 0, 0);
    feed(&inner, b"ready\n");
    feed(&inner, b"ready\r\n");
    feed(&inner, b"ready\rx\n");
    assert_eq!(hits.lock().len(), 3);
  }

  #[test]
  fn test_lone_cr_completes_on_next_byte() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "^ok$", 0, 0);
    feed(&inner, b"ok\r");
    assert_eq!(hits.lock().len(), 0);
    feed(&inner, b"z");
    assert_eq!(hits.lock().len(), 1);
  }

  #[test]
  fn test_before_and_after_context() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "^MATCH$", 2, 2);
    feed(&inner, b"one\ntwo\nthree\nMATCH\nafter1\nafter2\nrest\n");
    let hits = hits.lock();
    assert_eq!(hits.len(), 1);
    let (result, lines) = &hits[0];
    assert_eq!(*result, IoResult::Ok);
    assert_eq!(
      lines,
      &["two", "three", "MATCH", "after1", "after2"]
    );
  }

  #[test]
  fn test_history_is_bounded() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "^needle$", LINE_HISTORY_LEN + 5, 0);
    for i in 0..25 {
      feed(&inner, format!("filler{i}\n").as_bytes());
    }
    feed(&inner, b"needle\n");
    let hits = hits.lock();
    assert_eq!(hits.len(), 1);
    // Only LINE_HISTORY_LEN lines of before-context exist.
    assert_eq!(hits[0].1.len(), LINE_HISTORY_LEN + 1);
  }

  #[test]
  fn test_long_line_is_force_terminated() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "^a+$", 0, 0);
    feed(&inner, vec![b'a'; MAX_LINE_LENGTH].as_slice());
    assert_eq!(hits.lock().len(), 1);
  }

  #[test]
  fn test_line_handler_consumes_lines() {
    let inner = bare_inner();
    let wrapper = TextStreamFilter { inner: Arc::clone(&inner) };
    wrapper.set_line_handler(Box::new(|line| line.starts_with('#')));
    let hits = collect_matches(&inner, "value", 0, 0);
    feed(&inner, b"# value in comment\nvalue here\n");
    assert_eq!(hits.lock().len(), 1);
  }

  #[test]
  fn test_non_rearming_entry_fires_once() {
    let inner = bare_inner();
    let count = Arc::new(Mutex::new(0usize));
    let count2 = Arc::clone(&count);
    let wrapper = TextStreamFilter { inner: Arc::clone(&inner) };
    wrapper
      .add_entry(
        Regex::new("^hit$").unwrap(),
        Box::new(move |_, _| {
          *count2.lock() += 1;
          false
        }),
        0,
        0,
        None,
      )
      .unwrap();
    feed(&inner, b"hit\nhit\n");
    assert_eq!(*count.lock(), 1);
  }

  #[test]
  fn test_close_delivers_closed() {
    let inner = bare_inner();
    let hits = collect_matches(&inner, "never", 0, 0);
    inner.on_closed();
    let hits = hits.lock();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, IoResult::Closed);
  }
}
