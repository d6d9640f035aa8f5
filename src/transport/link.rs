use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::radio::{BoxedReader, BoxedWriter, Connection, ConnectionHandle, PacketConnection};
use crate::status::TransportMode;
use crate::transport::shared_buffer::SharedBuffer;


/// A [TransportLink] is one open connection plus the fixed pair of buffers it transfers. Each
///  transfer moves exactly one buffer's worth of data; there is no framing on top of that.
///
/// Sending and receiving use independent halves of the connection, so the application's tick
///  (sending) and the background receive loop do not contend with each other.
pub struct TransportLink {
    mode: TransportMode,
    send_buffer: SharedBuffer,
    recv_buffer: SharedBuffer,
    write_timeout: Duration,
    channel: Channel,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

enum Channel {
    Stream {
        reader: Mutex<Option<BoxedReader>>,
        writer: Mutex<Option<BoxedWriter>>,
        handle: Box<dyn ConnectionHandle>,
    },
    Packet(Box<dyn PacketConnection>),
}

impl TransportLink {
    /// Set up a link over `connection`. If the connection does not fit the transport mode or the
    ///  buffers, it is closed and an error is returned.
    pub async fn new(connection: Connection, mode: TransportMode, send_buffer: SharedBuffer, recv_buffer: SharedBuffer, write_timeout: Duration) -> anyhow::Result<TransportLink> {
        if let Err(e) = check_connection(&connection, mode, &send_buffer, &recv_buffer) {
            if let Err(close_err) = connection.close().await {
                debug!("error closing rejected connection: {}", close_err);
            }
            return Err(e);
        }

        let channel = match connection {
            Connection::Stream(stream) => Channel::Stream {
                reader: Mutex::new(Some(stream.reader)),
                writer: Mutex::new(Some(stream.writer)),
                handle: stream.handle,
            },
            Connection::Packet(packet) => Channel::Packet(packet),
        };

        let (shutdown, _) = watch::channel(false);

        Ok(TransportLink {
            mode,
            send_buffer,
            recv_buffer,
            write_timeout,
            channel,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write the send buffer's current contents as one block, flushing in stream mode. This
    ///  blocks for at most the configured write timeout.
    ///
    /// A stream write that times out after part of the buffer went out leaves the peer unable to
    ///  find the next buffer's start, so the link is closed in that case.
    pub async fn send(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("link is closed");
        }

        let data = self.send_buffer.to_vec();
        let num_written = AtomicUsize::new(0);
        match timeout(self.write_timeout, self.write(&data, &num_written)).await {
            Ok(result) => result,
            Err(_) => {
                let num_written = num_written.load(Ordering::Acquire);
                if num_written > 0 && num_written < data.len() {
                    self.close().await;
                    bail!("write timed out after {} of {} bytes, closed the link", num_written, data.len());
                }
                Err(anyhow!("write did not complete within {:?}", self.write_timeout))
            }
        }
    }

    async fn write(&self, data: &[u8], num_written: &AtomicUsize) -> anyhow::Result<()> {
        match &self.channel {
            Channel::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                let writer = writer.as_mut()
                    .ok_or_else(|| anyhow!("output stream was released"))?;

                let mut offset = 0;
                while offset < data.len() {
                    let n = writer.write(&data[offset..]).await?;
                    if n == 0 {
                        bail!("output stream is closed");
                    }
                    offset += n;
                    num_written.store(offset, Ordering::Release);
                }
                writer.flush().await?;
                Ok(())
            }
            Channel::Packet(packet) => {
                packet.send(data).await
            }
        }
    }

    /// Receive one buffer's worth of data into the receive buffer, waiting until it is available.
    ///  Closing the link unblocks a pending receive with an error.
    ///
    /// In stream mode, this reads until the full buffer length arrived. In packet mode, a
    ///  single message is received, and if it is shorter than the buffer, only the message's
    ///  length is overwritten. The rest of the buffer keeps its previous (stale) contents.
    pub async fn receive(&self) -> anyhow::Result<usize> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            bail!("link is closed");
        }

        let mut scratch = vec![0u8; self.recv_buffer.len()];
        let num_read = select! {
            result = self.read(&mut scratch) => result?,
            _ = shutdown.changed() => {
                bail!("link was closed while receiving");
            }
        };

        trace!("received {} bytes", num_read);
        self.recv_buffer.write(&scratch[..num_read]);
        Ok(num_read)
    }

    async fn read(&self, scratch: &mut [u8]) -> anyhow::Result<usize> {
        match &self.channel {
            Channel::Stream { reader, .. } => {
                let mut reader = reader.lock().await;
                let reader = reader.as_mut()
                    .ok_or_else(|| anyhow!("input stream was released"))?;
                reader.read_exact(scratch).await?;
                Ok(scratch.len())
            }
            Channel::Packet(packet) => {
                let num_read = packet.receive(scratch).await?;
                Ok(num_read.min(scratch.len()))
            }
        }
    }

    /// Release the stream halves (if any), then the connection. Failures are logged and
    ///  otherwise ignored, and calling this more than once has no further effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        match &self.channel {
            Channel::Stream { reader, writer, handle } => {
                drop(writer.lock().await.take());
                drop(reader.lock().await.take());
                if let Err(e) = handle.close().await {
                    debug!("error closing stream connection: {}", e);
                }
            }
            Channel::Packet(packet) => {
                if let Err(e) = packet.close().await {
                    debug!("error closing packet connection: {}", e);
                }
            }
        }
    }
}

fn check_connection(connection: &Connection, mode: TransportMode, send_buffer: &SharedBuffer, recv_buffer: &SharedBuffer) -> anyhow::Result<()> {
    if send_buffer.is_empty() || recv_buffer.is_empty() {
        bail!("link buffers must not be empty");
    }

    match (mode, connection) {
        (TransportMode::Stream, Connection::Stream(_)) => Ok(()),
        (TransportMode::Packet, Connection::Packet(packet)) => {
            if send_buffer.len() > packet.transmit_mtu() {
                bail!("send buffer of {} bytes exceeds the transmit MTU of {}", send_buffer.len(), packet.transmit_mtu());
            }
            if recv_buffer.len() > packet.receive_mtu() {
                bail!("receive buffer of {} bytes exceeds the receive MTU of {}", recv_buffer.len(), packet.receive_mtu());
            }
            Ok(())
        }
        (mode, connection) => bail!("{:?} does not match transport mode {:?}", connection, mode),
    }
}
