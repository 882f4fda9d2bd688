//! L2CAP link between the two earbuds.
//!
//! The master dials the slave on a fixed PSM; the slave listens. Each side
//! gets a cheap cloneable sender that never blocks the caller, and a
//! receiver that yields raw frames until the link drops.

use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr},
};
use log::{debug, info, warn};
use rand::Rng;
use smallvec::SmallVec;
use tokio::{sync::mpsc, task::JoinSet, time};

use crate::error::{Result, TwsError};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM carrying sync frames between the earbuds.
const PSM_TWS_SYNC: u16 = 0x1005;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound frames buffered before new ones are dropped.
const SEND_QUEUE: usize = 64;
const RECV_QUEUE: usize = 128;
/// Maximum link retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Receiver half of the link.
#[derive(Debug)]
pub struct LinkReceiver {
   rx: mpsc::Receiver<Packet>,
}

impl LinkReceiver {
   /// Next frame, or `None` once the link is gone.
   pub async fn recv(&mut self) -> Option<Packet> {
      self.rx.recv().await
   }
}

/// Sender half of the link.
///
/// Sending is fire-and-forget: a full queue or a dead link drops the frame,
/// the next periodic sync carries the state again.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Packet>,
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub fn send(&self, frame: Packet) -> Result<()> {
      self.tx.try_send(frame).map_err(|e| match e {
         mpsc::error::TrySendError::Full(_) => {
            warn!("Link send queue full, dropping frame");
            TwsError::LinkDown
         },
         mpsc::error::TrySendError::Closed(_) => TwsError::LinkDown,
      })
   }
}

/// Dials the slave earbud.
pub async fn connect(jset: &mut JoinSet<()>, peer: Address) -> Result<(LinkReceiver, LinkSender)> {
   debug!("Creating L2CAP socket for {peer}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(peer, AddressType::BrEdr, PSM_TWS_SYNC);
   debug!("Connecting to {peer}:{PSM_TWS_SYNC}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| TwsError::RequestTimeout)??;

   info!("Link to {peer} established");
   Ok(spawn_io(jset, peer, seq_packet))
}

/// Waits for the master earbud to dial in. Connections from anything but
/// `peer` are refused.
pub async fn accept(jset: &mut JoinSet<()>, peer: Address) -> Result<(LinkReceiver, LinkSender)> {
   let local = SocketAddr::new(Address::any(), AddressType::BrEdr, PSM_TWS_SYNC);
   let listener = SeqPacketListener::bind(local).await?;
   debug!("Listening for {peer} on PSM {PSM_TWS_SYNC}");

   loop {
      let (seq_packet, remote) = listener.accept().await?;
      if remote.addr != peer {
         warn!("Refusing link from unexpected {}", remote.addr);
         continue;
      }
      info!("Link from {peer} accepted");
      return Ok(spawn_io(jset, peer, seq_packet));
   }
}

fn spawn_io(jset: &mut JoinSet<()>, peer: Address, seq_packet: SeqPacket) -> (LinkReceiver, LinkSender) {
   let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
   let (in_tx, in_rx) = mpsc::channel(RECV_QUEUE);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_thread(peer, in_tx, seq_packet.clone()));
   jset.spawn(send_thread(peer, out_rx, seq_packet));

   (LinkReceiver { rx: in_rx }, LinkSender { tx: out_tx })
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Packet>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; L2CAP_MTU];
   while let Ok(n) = sp.recv(&mut stack).await {
      if n == 0 {
         warn!("Link to {adr} lost");
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if tx.send(Packet::from_slice(recvd)).await.is_err() {
         return;
      }
   }
   warn!("Link to {adr} closed");
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Packet>, sp: Arc<SeqPacket>) {
   while let Some(frame) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&frame));
      if let Err(e) = sp.send(&frame).await {
         warn!("Failed to send to {adr}: {e}");
         return;
      }
   }
   debug!("Link sender for {adr} shut down");
}

/// Backoff before the next link attempt.
pub fn retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_millis(500);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..250);
   delay + Duration::from_millis(jitter)
}

/// In-memory link pair with the same drop-on-full semantics.
#[cfg(test)]
pub fn pair() -> ((LinkReceiver, LinkSender), (LinkReceiver, LinkSender)) {
   let (a_tx, a_rx) = mpsc::channel(SEND_QUEUE);
   let (b_tx, b_rx) = mpsc::channel(SEND_QUEUE);
   (
      (LinkReceiver { rx: b_rx }, LinkSender { tx: a_tx }),
      (LinkReceiver { rx: a_rx }, LinkSender { tx: b_tx }),
   )
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_pair_delivers_both_ways() {
      let ((mut a_rx, a_tx), (mut b_rx, b_tx)) = pair();
      a_tx.send(Packet::from_slice(&[1, 2, 3])).unwrap();
      b_tx.send(Packet::from_slice(&[4])).unwrap();

      assert_eq!(b_rx.recv().await.unwrap().as_slice(), &[1, 2, 3]);
      assert_eq!(a_rx.recv().await.unwrap().as_slice(), &[4]);
   }

   #[tokio::test]
   async fn test_send_after_peer_dropped_fails() {
      let ((_a_rx, a_tx), (b_rx, _b_tx)) = pair();
      drop(b_rx);
      assert!(!a_tx.is_connected());
      assert!(matches!(
         a_tx.send(Packet::from_slice(&[0])),
         Err(TwsError::LinkDown)
      ));
   }

   #[test]
   fn test_retry_delay_is_capped() {
      for n in 0..20 {
         let delay = retry_delay(n);
         assert!(delay >= Duration::from_millis(500));
         assert!(delay < MAX_RETRY_DELAY + Duration::from_millis(250));
      }
   }
}
