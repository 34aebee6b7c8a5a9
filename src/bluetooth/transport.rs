//! Byte-stream transport over a socket handed in by the profile registrar.
//!
//! The transport owns one duplex RFCOMM socket adopted from the file
//! descriptor BlueZ passes through `NewConnection`. It runs exactly one
//! receive loop and drains a FIFO send queue; it knows nothing about the
//! protocol carried on top.

use std::{
   os::fd::{FromRawFd, IntoRawFd, OwnedFd},
   os::unix::net::UnixStream as StdUnixStream,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   net::{
      UnixStream,
      unix::{OwnedReadHalf, OwnedWriteHalf},
   },
   select,
   sync::{Notify, mpsc},
   task::JoinSet,
};

use crate::error::{PodLinkError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// Read buffer size; comfortably larger than any protocol frame.
const READ_BUF: usize = 1024;
/// Inbound channel depth.
const RECV_QUEUE: usize = 128;

/// Receiver half of a transport.
///
/// Yields inbound frames until the peer disconnects or an I/O error makes
/// the connection terminal.
#[derive(Debug)]
pub struct TransportReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl TransportReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(PodLinkError::ConnectionClosed)?
   }
}

/// Owning handle of a transport: queued FIFO sends and idempotent close.
#[derive(Debug)]
pub struct Transport {
   tx: mpsc::UnboundedSender<Packet>,
   closed: Arc<AtomicBool>,
   shutdown: Arc<Notify>,
   jset: parking_lot::Mutex<JoinSet<()>>,
}

impl Transport {
   /// Adopts a connected stream socket descriptor and starts the receive
   /// and send tasks. The descriptor arrives from BlueZ already connected,
   /// so this never dials out.
   pub fn open(fd: OwnedFd) -> Result<(Self, TransportReceiver)> {
      // An RFCOMM socket is a plain SOCK_STREAM fd; epoll registration
      // does not care about the address family.
      let std_stream = unsafe { StdUnixStream::from_raw_fd(fd.into_raw_fd()) };
      std_stream.set_nonblocking(true)?;
      let stream = UnixStream::from_std(std_stream)?;
      let (read_half, write_half) = stream.into_split();

      let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
      let (in_tx, in_rx) = mpsc::channel(RECV_QUEUE);

      let closed = Arc::new(AtomicBool::new(false));
      let shutdown = Arc::new(Notify::new());

      let mut jset = JoinSet::new();
      jset.spawn(recv_task(
         read_half,
         in_tx,
         closed.clone(),
         shutdown.clone(),
      ));
      jset.spawn(send_task(
         write_half,
         cmd_rx,
         closed.clone(),
         shutdown.clone(),
      ));

      Ok((
         Self {
            tx: cmd_tx,
            closed,
            shutdown,
            jset: parking_lot::Mutex::new(jset),
         },
         TransportReceiver { rx: in_rx },
      ))
   }

   pub fn is_open(&self) -> bool {
      !self.closed.load(Ordering::Relaxed)
   }

   /// Enqueues an outbound frame and returns immediately. Frames are
   /// delivered strictly in submission order; a failed write drops
   /// everything still queued and closes the transport.
   pub fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_open() {
         return Err(PodLinkError::ConnectionClosed);
      }
      self
         .tx
         .send(Packet::from_slice(data))
         .map_err(|_| PodLinkError::ConnectionClosed)
   }

   /// Closes the transport: cancels the pending read, drops queued writes
   /// and releases the socket. Safe to call any number of times, from any
   /// context, including error paths.
   pub fn close(&self) {
      if self.closed.swap(true, Ordering::SeqCst) {
         return;
      }
      self.shutdown.notify_waiters();
      self.jset.lock().abort_all();
   }
}

impl Drop for Transport {
   fn drop(&mut self) {
      self.close();
   }
}

async fn recv_task(
   mut read_half: OwnedReadHalf,
   tx: mpsc::Sender<Result<Packet>>,
   closed: Arc<AtomicBool>,
   shutdown: Arc<Notify>,
) {
   let mut buf = [0u8; READ_BUF];
   loop {
      let n = select! {
         res = read_half.read(&mut buf) => res,
         _ = shutdown.notified() => return,
      };
      match n {
         Ok(0) => {
            warn!("Peer closed the stream");
            closed.store(true, Ordering::SeqCst);
            shutdown.notify_waiters();
            let _ = tx.send(Err(PodLinkError::ConnectionLost)).await;
            return;
         },
         Ok(n) => {
            let recvd = &buf[..n];
            debug!("← {}", hex::encode(recvd));
            if tx.send(Ok(Packet::from_slice(recvd))).await.is_err() {
               return;
            }
         },
         Err(e) => {
            closed.store(true, Ordering::SeqCst);
            shutdown.notify_waiters();
            let _ = tx.send(Err(PodLinkError::Io(e))).await;
            return;
         },
      }
   }
}

async fn send_task(
   mut write_half: OwnedWriteHalf,
   mut rx: mpsc::UnboundedReceiver<Packet>,
   closed: Arc<AtomicBool>,
   shutdown: Arc<Notify>,
) {
   while let Some(data) = rx.recv().await {
      debug!("→ {}", hex::encode(&data));
      if let Err(e) = write_half.write_all(&data).await {
         warn!("Write failed, dropping queued frames: {e}");
         closed.store(true, Ordering::SeqCst);
         shutdown.notify_waiters();
         rx.close();
         while rx.try_recv().is_ok() {}
         return;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn pair() -> (OwnedFd, UnixStream) {
      let (ours, theirs) = StdUnixStream::pair().expect("socketpair");
      theirs.set_nonblocking(true).unwrap();
      (ours.into(), UnixStream::from_std(theirs).unwrap())
   }

   #[tokio::test]
   async fn sends_are_delivered_in_submission_order() {
      let (fd, mut peer) = pair();
      let (transport, _rx) = Transport::open(fd).unwrap();

      transport.send(&[0x01, 0x02]).unwrap();
      transport.send(&[0x03]).unwrap();
      transport.send(&[0x04, 0x05, 0x06]).unwrap();

      let mut got = [0u8; 6];
      peer.read_exact(&mut got).await.unwrap();
      assert_eq!(got, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
   }

   #[tokio::test]
   async fn receives_peer_frames() {
      let (fd, mut peer) = pair();
      let (_transport, mut rx) = Transport::open(fd).unwrap();

      peer.write_all(&[0xAA, 0xBB, 0xCC]).await.unwrap();
      let pkt = rx.recv().await.unwrap();
      assert_eq!(&pkt[..], &[0xAA, 0xBB, 0xCC]);
   }

   #[tokio::test]
   async fn zero_length_read_closes_the_transport() {
      let (fd, peer) = pair();
      let (transport, mut rx) = Transport::open(fd).unwrap();

      drop(peer);
      assert!(matches!(
         rx.recv().await,
         Err(PodLinkError::ConnectionLost)
      ));

      // Terminal for the connection: the flag flips once the reader sees
      // the hangup, after which sends are rejected.
      while transport.is_open() {
         tokio::task::yield_now().await;
      }
      assert!(transport.send(&[0x00]).is_err());
   }

   #[tokio::test]
   async fn close_is_idempotent() {
      let (fd, _peer) = pair();
      let (transport, _rx) = Transport::open(fd).unwrap();

      transport.close();
      transport.close();
      transport.close();

      assert!(!transport.is_open());
      assert!(matches!(
         transport.send(&[0x01]),
         Err(PodLinkError::ConnectionClosed)
      ));
   }
}
