use async_trait::async_trait;
use futures::SinkExt;
use std::{io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::Mutex,
    time,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{LineCodec, TransportBackend};
use crate::{config::TransportConfig, error::Result, tracing::prelude::*};

/// Backend over a real serial device.
///
/// Generic over the byte stream so tests can substitute an in-memory
/// duplex pipe for the device. Reads and writes are each bounded by their
/// configured timeout so neither loop stalls on a dead line.
pub struct PhysicalBackend<S = SerialStream> {
    name: String,
    writer: Mutex<FramedWrite<WriteHalf<S>, LineCodec>>,
    reader: Mutex<FramedRead<ReadHalf<S>, LineCodec>>,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl PhysicalBackend<SerialStream> {
    /// Open the serial device named in `config`.
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout())
            .open_native_async()?;

        let settle = config.settle_delay();
        if !settle.is_zero() {
            debug!(port = %config.port, ?settle, "Waiting for device to settle");
            time::sleep(settle).await;
        }

        Ok(Self::from_stream(
            config.port.clone(),
            stream,
            config.write_timeout(),
            config.read_timeout(),
        ))
    }
}

impl<S> PhysicalBackend<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an already-open stream.
    pub fn from_stream(
        name: String,
        stream: S,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name,
            writer: Mutex::new(FramedWrite::new(writer, LineCodec::default())),
            reader: Mutex::new(FramedRead::new(reader, LineCodec::default())),
            write_timeout,
            read_timeout,
        }
    }

    fn timed_out(&self, what: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} {} timeout", self.name, what),
        )
    }
}

#[async_trait]
impl<S> TransportBackend for PhysicalBackend<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = time::timeout(self.write_timeout, self.writer.lock())
            .await
            .map_err(|_| self.timed_out("write"))?;

        let sent = time::timeout(self.write_timeout, writer.send(bytes)).await;
        match sent {
            Ok(result) => result,
            Err(_) => {
                // Whatever didn't reach the device is dropped with the
                // message rather than sent ahead of the next one.
                writer.write_buffer_mut().clear();
                Err(self.timed_out("write"))
            }
        }
    }

    async fn read_line(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        match time::timeout(self.read_timeout, reader.next()).await {
            // Nothing arrived in time; FramedRead keeps any partial line.
            Err(_) => Ok(Vec::new()),
            Ok(Some(line)) => line,
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed", self.name),
            )),
        }
    }

    async fn flush(&self) -> io::Result<()> {
        let mut writer = time::timeout(self.write_timeout, self.writer.lock())
            .await
            .map_err(|_| self.timed_out("flush"))?;

        let flushed = time::timeout(self.write_timeout, SinkExt::<&[u8]>::flush(&mut *writer)).await;
        match flushed {
            Ok(result) => result,
            Err(_) => {
                writer.write_buffer_mut().clear();
                Err(self.timed_out("flush"))
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        trace!(port = %self.name, "Closing serial port");
        time::timeout(self.write_timeout, async {
            let mut writer = self.writer.lock().await;
            SinkExt::<&[u8]>::close(&mut *writer).await
        })
        .await
        .map_err(|_| self.timed_out("close"))?
    }
}
