//! Stream I/O layer: platform dispatcher plus file, serial and socket
//! streams sharing one asynchronous contract.

pub mod addr;
pub mod dispatcher;
pub mod file;
pub mod serial;
pub mod socket;
pub mod stream;

use std::io;
use std::os::fd::RawFd;

pub use addr::SocketAddress;
pub use dispatcher::{Offset, PollDispatcher};
pub use file::{FileProcessor, FileStream, OpenMode};
pub use serial::{SerialMode, SerialProcessor};
pub use socket::{
  SocketProcessor, SocketStream, TcpListenerStream, UdpListenerStream,
  UdpStream, UdpSubStream,
};
pub use stream::{IoStream, ReadHandler, StreamKind, WriteHandler};

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
  syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
  Ok(())
}
