use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::radio::{ConnectionHandle, PacketConnection, StreamConnection};


struct NoopConnectionHandle;
#[async_trait]
impl ConnectionHandle for NoopConnectionHandle {
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Two connected in-memory stream connections. `capacity` bounds the bytes in flight per
///  direction, so small values force partial reads and writes.
pub fn stream_pair(capacity: usize) -> (StreamConnection, StreamConnection) {
    let (a, b) = tokio::io::duplex(capacity);
    (stream_connection(a), stream_connection(b))
}

fn stream_connection(stream: tokio::io::DuplexStream) -> StreamConnection {
    let (reader, writer) = tokio::io::split(stream);
    StreamConnection {
        reader: Box::new(reader),
        writer: Box::new(writer),
        handle: Box::new(NoopConnectionHandle),
    }
}


/// in-memory packet connection, preserving message boundaries
pub struct FakePacketConnection {
    mtu: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

pub fn packet_pair(mtu: usize) -> (FakePacketConnection, FakePacketConnection) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();

    let a = FakePacketConnection { mtu, tx: Mutex::new(Some(tx_a)), rx: tokio::sync::Mutex::new(rx_a) };
    let b = FakePacketConnection { mtu, tx: Mutex::new(Some(tx_b)), rx: tokio::sync::Mutex::new(rx_b) };
    (a, b)
}

#[async_trait]
impl PacketConnection for FakePacketConnection {
    fn receive_mtu(&self) -> usize {
        self.mtu
    }

    fn transmit_mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        if buf.len() > self.mtu {
            bail!("message of {} bytes exceeds MTU {}", buf.len(), self.mtu);
        }
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(buf.to_vec())
                .map_err(|_| anyhow!("peer closed the connection")),
            None => Err(anyhow!("connection is closed")),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let msg = self.rx.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("peer closed the connection"))?;
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        Ok(n)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}


/// A packet connection that plays back a fixed sequence of receive results, then blocks forever.
///  `Err(())` stands for a failed receive. Sends succeed unless failures were scripted for them.
pub struct ScriptedPacketConnection {
    mtu: usize,
    script: Mutex<VecDeque<Result<Vec<u8>, ()>>>,
    send_failures: AtomicUsize,
    receive_attempts: Arc<AtomicUsize>,
}
impl ScriptedPacketConnection {
    pub fn new(mtu: usize, script: Vec<Result<Vec<u8>, ()>>) -> ScriptedPacketConnection {
        ScriptedPacketConnection {
            mtu,
            script: Mutex::new(script.into()),
            send_failures: Default::default(),
            receive_attempts: Default::default(),
        }
    }

    /// the next `n` sends fail
    pub fn with_send_failures(self, n: usize) -> ScriptedPacketConnection {
        self.send_failures.store(n, Ordering::Release);
        self
    }

    /// counts calls to `receive`, including the final blocking one
    pub fn receive_attempts(&self) -> Arc<AtomicUsize> {
        self.receive_attempts.clone()
    }
}

#[async_trait]
impl PacketConnection for ScriptedPacketConnection {
    fn receive_mtu(&self) -> usize {
        self.mtu
    }

    fn transmit_mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, _buf: &[u8]) -> anyhow::Result<()> {
        let remaining = self.send_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.send_failures.store(remaining - 1, Ordering::Release);
            bail!("scripted send failure");
        }
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let next = self.script.lock().unwrap().pop_front();
        self.receive_attempts.fetch_add(1, Ordering::AcqRel);
        match next {
            Some(Ok(msg)) => {
                let n = msg.len().min(buf.len());
                buf[..n].copy_from_slice(&msg[..n]);
                Ok(n)
            }
            Some(Err(())) => Err(anyhow!("scripted receive failure")),
            None => std::future::pending().await,
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
