use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use vsm::buf::IoBuffer;
use vsm::error::IoResult;
use vsm::io::addr::SocketAddress;
use vsm::io::dispatcher::Offset;
use vsm::io::socket::{SocketProcessor, SocketStream, TcpListenerStream};
use vsm::io::stream::IoStream;
use vsm::request::container::RequestContainer;
use vsm::request::worker::RequestWorker;
use vsm::timer::TimerProcessor;

struct Fixture {
  sockets: Arc<SocketProcessor>,
  worker: Arc<RequestWorker>,
  ctx: Arc<RequestContainer>,
}

impl Fixture {
  fn new() -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let sockets = SocketProcessor::new().unwrap();
    sockets.enable().unwrap();
    let (worker, ctx) = RequestWorker::single("socket test ctx");
    worker.enable().unwrap();
    Fixture { sockets, worker, ctx }
  }

  fn listen(&self) -> Arc<TcpListenerStream> {
    let (tx, rx) = mpsc::channel();
    self
      .sockets
      .listen(
        SocketAddress::new("127.0.0.1", "0"),
        Box::new(move |result, listener| {
          tx.send((result, listener)).unwrap();
        }),
        &self.ctx,
      )
      .unwrap();
    let (result, listener) =
      rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, IoResult::Ok);
    listener.unwrap()
  }

  fn connect(&self, port: u16) -> Arc<SocketStream> {
    let (tx, rx) = mpsc::channel();
    self
      .sockets
      .connect(
        SocketAddress::new("127.0.0.1", port.to_string()),
        Box::new(move |result, stream| {
          tx.send((result, stream)).unwrap();
        }),
        &self.ctx,
      )
      .unwrap();
    let (result, stream) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, IoResult::Ok);
    stream.unwrap()
  }

  fn teardown(self) {
    self.worker.disable();
    self.sockets.disable();
  }
}

#[test]
fn test_tcp_connect_accept_exchange() {
  let fixture = Fixture::new();
  let listener = fixture.listen();
  let port = listener.local_addr().port();

  let (accept_tx, accept_rx) = mpsc::channel();
  listener
    .accept(
      Box::new(move |result, stream| {
        accept_tx.send((result, stream)).unwrap();
      }),
      &fixture.ctx,
    )
    .unwrap();

  let client = fixture.connect(port);
  let (result, server_side) =
    accept_rx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(result, IoResult::Ok);
  let server_side = server_side.unwrap();

  // Client to server.
  let (wtx, wrx) = mpsc::channel();
  client
    .write(
      IoBuffer::from_static(b"from client"),
      Offset::None,
      Box::new(move |result| wtx.send(result).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  assert_eq!(
    wrx.recv_timeout(Duration::from_secs(2)).unwrap(),
    IoResult::Ok
  );

  let (rtx, rrx) = mpsc::channel();
  server_side
    .read(
      64,
      11,
      Offset::None,
      Box::new(move |result, data| rtx.send((result, data)).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  let (result, data) = rrx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(result, IoResult::Ok);
  assert_eq!(data.as_slice(), b"from client");

  // Server to client.
  let (wtx, wrx) = mpsc::channel();
  server_side
    .write(
      IoBuffer::from_static(b"from server"),
      Offset::None,
      Box::new(move |result| wtx.send(result).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  assert_eq!(
    wrx.recv_timeout(Duration::from_secs(2)).unwrap(),
    IoResult::Ok
  );

  let (rtx, rrx) = mpsc::channel();
  client
    .read(
      64,
      11,
      Offset::None,
      Box::new(move |result, data| rtx.send((result, data)).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  let (result, data) = rrx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(result, IoResult::Ok);
  assert_eq!(data.as_slice(), b"from server");

  client.close();
  server_side.close();
  listener.close();
  fixture.teardown();
}

#[test]
fn test_peer_close_ends_read_without_min() {
  let fixture = Fixture::new();
  let listener = fixture.listen();
  let port = listener.local_addr().port();

  let (accept_tx, accept_rx) = mpsc::channel();
  listener
    .accept(
      Box::new(move |result, stream| {
        accept_tx.send((result, stream)).unwrap();
      }),
      &fixture.ctx,
    )
    .unwrap();
  let client = fixture.connect(port);
  let (_, server_side) =
    accept_rx.recv_timeout(Duration::from_secs(2)).unwrap();
  let server_side = server_side.unwrap();

  let (rtx, rrx) = mpsc::channel();
  server_side
    .read(
      64,
      64,
      Offset::None,
      Box::new(move |result, data| rtx.send((result, data)).unwrap()),
      &fixture.ctx,
    )
    .unwrap();

  // Only 5 of the requested 64 bytes, then EOF.
  let (wtx, wrx) = mpsc::channel();
  client
    .write(
      IoBuffer::from_static(b"short"),
      Offset::None,
      Box::new(move |result| wtx.send(result).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  wrx.recv_timeout(Duration::from_secs(2)).unwrap();
  client.close();

  let (result, data) = rrx.recv_timeout(Duration::from_secs(3)).unwrap();
  assert_eq!(result, IoResult::EndOfFile);
  assert_eq!(data.as_slice(), b"short");

  server_side.close();
  listener.close();
  fixture.teardown();
}

#[test]
fn test_write_timeout_cancels_stalled_write() {
  let fixture = Fixture::new();
  let timer = TimerProcessor::new();
  timer.enable().unwrap();

  let listener = fixture.listen();
  let port = listener.local_addr().port();

  let (accept_tx, accept_rx) = mpsc::channel();
  listener
    .accept(
      Box::new(move |result, stream| {
        accept_tx.send((result, stream)).unwrap();
      }),
      &fixture.ctx,
    )
    .unwrap();
  let client = fixture.connect(port);
  let (_, server_side) =
    accept_rx.recv_timeout(Duration::from_secs(2)).unwrap();
  let server_side = server_side.unwrap();

  // Nobody reads the server side; a large write must jam in the kernel
  // buffers and stay in flight until the timeout cancels it.
  let payload = IoBuffer::from_vec(vec![0x5a; 32 * 1024 * 1024]);
  let (wtx, wrx) = mpsc::channel();
  let waiter = client
    .write(
      payload,
      Offset::None,
      Box::new(move |result| wtx.send(result).unwrap()),
      &fixture.ctx,
    )
    .unwrap();
  waiter
    .timeout(
      &timer,
      Duration::from_millis(300),
      None,
      true,
      Arc::clone(&fixture.ctx),
    )
    .unwrap();

  let result = wrx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(result, IoResult::Canceled);
  assert!(waiter.wait(false, Some(Duration::from_secs(2))));
  assert!(waiter.is_done());

  client.close();
  server_side.close();
  listener.close();
  timer.disable();
  fixture.teardown();
}
