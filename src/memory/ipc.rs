//! Passing shared regions between processes.
//!
//! Regions travel as file descriptors in `SCM_RIGHTS` ancillary messages over
//! Unix domain sockets. The receiver maps the fd with
//! [`ShmRegion::open`](super::ShmRegion::open), which validates the region
//! header before exposing the value.

use crate::error::{Error, Result};
use crate::id::UniqueId;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Maximum number of file descriptors that can be sent in a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

/// Send file descriptors over a Unix socket.
///
/// At least one byte of payload always accompanies the fds; an empty `data`
/// is sent as a single zero byte.
///
/// # Example
///
/// ```rust,ignore
/// use std::os::unix::net::UnixStream;
/// use shoal::memory::ipc::send_fds;
///
/// let (sender, receiver) = UnixStream::pair()?;
/// send_fds(&sender, &[region.fd()], b"hello")?;
/// ```
pub fn send_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd], data: &[u8]) -> Result<()> {
    if fds.is_empty() {
        return Err(Error::InvalidSegment("no file descriptors to send".into()));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(Error::InvalidSegment(format!(
            "too many fds: {} > {}",
            fds.len(),
            MAX_FDS_PER_MESSAGE
        )));
    }

    // SCM_RIGHTS needs at least one byte of data
    let data = if data.is_empty() { &[0u8] } else { data };

    let borrowed_fds: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);

    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed_fds)) {
        return Err(Error::InvalidSegment(
            "failed to add fds to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;

    Ok(())
}

/// Receive file descriptors from a Unix socket.
///
/// Returns the number of payload bytes written to `data_buf` and the
/// received fds.
pub fn recv_fds(socket: &UnixStream, data_buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    if data_buf.is_empty() {
        return Err(Error::InvalidSegment("data buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(data_buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    Ok((result.bytes, fds))
}

/// Send one region's fd tagged with its id.
pub fn send_region_handle<Fd: AsFd>(socket: &UnixStream, fd: Fd, id: UniqueId) -> Result<()> {
    send_fds(socket, &[fd], &id.as_raw().to_le_bytes())
}

/// Receive one region fd and the id it was sent with.
pub fn recv_region_handle(socket: &UnixStream) -> Result<(OwnedFd, UniqueId)> {
    let mut id_buf = [0u8; std::mem::size_of::<u64>()];
    let (bytes_read, fds) = recv_fds(socket, &mut id_buf)?;

    if bytes_read != id_buf.len() {
        return Err(Error::InvalidSegment(format!(
            "expected {} bytes for region id, got {}",
            id_buf.len(),
            bytes_read
        )));
    }

    let received = fds.len();
    match <[OwnedFd; 1]>::try_from(fds) {
        Ok([fd]) => Ok((fd, UniqueId::from_raw(u64::from_le_bytes(id_buf)))),
        Err(_) => Err(Error::InvalidSegment(format!(
            "expected 1 fd, got {}",
            received
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ShmRegion, SharedMemorySegment};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_send_recv_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();

        let segment = SharedMemorySegment::new("test-ipc", 4096).unwrap();
        unsafe {
            *segment.as_ptr() = 42;
            *segment.as_ptr().add(1000) = 123;
        }

        send_fds(&sender, &[segment.as_fd()], b"hello").unwrap();

        let mut buf = [0u8; 16];
        let (len, fds) = recv_fds(&receiver, &mut buf).unwrap();

        assert_eq!(len, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fds.len(), 1);

        let received_fd = fds.into_iter().next().unwrap();
        let received = unsafe { SharedMemorySegment::from_fd(received_fd, None) }.unwrap();
        unsafe {
            assert_eq!(*received.as_ptr(), 42);
            assert_eq!(*received.as_ptr().add(1000), 123);
        }
    }

    #[test]
    fn test_send_recv_region_handle() {
        let (sender, receiver) = UnixStream::pair().unwrap();

        let region =
            ShmRegion::create("test-ipc-region", UniqueId::from_raw(9), AtomicU32::new(5)).unwrap();
        send_region_handle(&sender, region.fd(), region.id()).unwrap();

        let (fd, id) = recv_region_handle(&receiver).unwrap();
        assert_eq!(id, region.id());

        let view = unsafe { ShmRegion::<AtomicU32>::open(fd) }.unwrap();
        view.fetch_add(1, Ordering::AcqRel);
        assert_eq!(region.load(Ordering::Acquire), 6);
    }

    #[test]
    fn test_send_empty_fds_fails() {
        let (sender, _receiver) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        let result = send_fds(&sender, empty, b"data");
        assert!(result.is_err());
    }

    #[test]
    fn test_recv_region_handle_rejects_multiple_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let a = SharedMemorySegment::new("test-a", 4096).unwrap();
        let b = SharedMemorySegment::new("test-b", 4096).unwrap();

        send_fds(&sender, &[a.as_fd(), b.as_fd()], &7u64.to_le_bytes()).unwrap();
        let err = recv_region_handle(&receiver).unwrap_err();
        assert!(matches!(err, Error::InvalidSegment(_)));
        assert!(err.to_string().ends_with("expected 1 fd, got 2"));
    }

    #[test]
    fn test_recv_region_handle_reports_missing_fd() {
        use std::io::Write;

        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(&7u64.to_le_bytes()).unwrap();

        let err = recv_region_handle(&receiver).unwrap_err();
        assert!(matches!(err, Error::InvalidSegment(_)));
        assert!(err.to_string().ends_with("expected 1 fd, got 0"));
    }
}
