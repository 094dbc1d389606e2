use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, WriteHalf},
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::{error::LinkError, logging::category};

const INBOUND_CAPACITY: usize = 64;
const READ_CHUNK: usize = 1024;
const LINE_BUF_MAX: usize = 16 * 1024;

/// Raw bytes read since the previous notification.
pub type Chunk = Arc<[u8]>;

pub type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

/// One serial transport. Opening does not retry; callers compose retries.
#[async_trait]
pub trait SerialLink: Send {
    async fn open(&mut self, port: &str, baud: u32) -> Result<(), LinkError>;

    /// Fire-and-forget write; fails when the link is not open.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Releases the port. A no-op on a closed or never-opened link.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Subscribes to inbound data notifications. Dropping the receiver
    /// revokes the subscription.
    fn subscribe(&self) -> broadcast::Receiver<Chunk>;
}

pub fn shared(link: impl SerialLink + 'static) -> SharedLink {
    let boxed: Box<dyn SerialLink> = Box::new(link);
    Arc::new(Mutex::new(boxed))
}

/// Appends CRLF unless the command already ends with a line terminator.
pub fn frame_command(command: &str) -> Vec<u8> {
    let mut framed = command.as_bytes().to_vec();
    if !command.ends_with('\n') {
        framed.extend_from_slice(b"\r\n");
    }
    framed
}

/// Stops the motor before releasing its port.
///
/// Closing first would leave the motor powered, so the stop command is sent
/// and given `grace` to take effect before the port goes away. Faults are
/// logged and the port is closed regardless.
pub async fn stop_motor_and_close(link: &mut dyn SerialLink, stop_command: &str, grace: Duration) {
    if link.is_open() {
        match link.send(&frame_command(stop_command)).await {
            Ok(()) => {
                tokio::time::sleep(grace).await;
                info!(target: category::SERIAL, "motor stopped ({stop_command})");
            }
            Err(err) => warn!(target: category::SERIAL, "failed to stop motor: {err}"),
        }
    }
    link.close().await;
}

pub struct SerialPortLink {
    label: &'static str,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
    inbound: broadcast::Sender<Chunk>,
}

impl SerialPortLink {
    pub fn new(label: &'static str) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            label,
            writer: None,
            reader: None,
            inbound,
        }
    }

    fn release(&mut self) -> bool {
        let had_port = self.writer.is_some() || self.reader.is_some();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        had_port
    }
}

#[async_trait]
impl SerialLink for SerialPortLink {
    async fn open(&mut self, port: &str, baud: u32) -> Result<(), LinkError> {
        self.release();

        let stream = tokio_serial::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|source| LinkError::Open {
                port: port.to_string(),
                baud,
                source,
            })?;
        let (mut read_half, write_half) = tokio::io::split(stream);

        let inbound = self.inbound.clone();
        let label = self.label;
        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        debug!(target: category::SERIAL, "{label}: rx {n} bytes");
                        // Nobody listening is fine; the data is simply dropped.
                        let _ = inbound.send(Arc::from(&chunk[..n]));
                    }
                    Err(err) => {
                        warn!(target: category::SERIAL, "{label}: read failed: {err}");
                        break;
                    }
                }
            }
        });

        self.writer = Some(write_half);
        self.reader = Some(reader);
        info!(target: category::SERIAL, "{}: opened {port} @ {baud}", self.label);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        let writer = self.writer.as_mut().ok_or(LinkError::NotOpen)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        debug!(
            target: category::SERIAL,
            "{}: tx {:?}",
            self.label,
            String::from_utf8_lossy(bytes).trim_end()
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.shutdown().await;
        }
        if self.release() {
            info!(target: category::SERIAL, "{}: closed", self.label);
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some() && self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }

    fn subscribe(&self) -> broadcast::Receiver<Chunk> {
        self.inbound.subscribe()
    }
}

impl Drop for SerialPortLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// The two serial links of one fixture. Their lifecycles are independent:
/// closing or losing one never touches the other.
pub struct SerialSession {
    pub motor: SharedLink,
    pub sensor: SharedLink,
}

impl SerialSession {
    pub fn new(motor: impl SerialLink + 'static, sensor: impl SerialLink + 'static) -> Self {
        Self {
            motor: shared(motor),
            sensor: shared(sensor),
        }
    }

    pub fn hardware() -> Self {
        Self::new(SerialPortLink::new("motor"), SerialPortLink::new("sensor"))
    }
}

/// Splits an inbound byte stream into trimmed, non-empty text lines.
/// CR and LF both terminate a line.
#[derive(Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend(bytes.iter().map(|b| if *b == b'\r' { b'\n' } else { *b }));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            let parsed = String::from_utf8_lossy(&line).trim().to_string();
            if !parsed.is_empty() {
                lines.push(parsed);
            }
        }
        if self.buf.len() > LINE_BUF_MAX {
            let excess = self.buf.len() - LINE_BUF_MAX;
            self.buf.drain(..excess);
        }
        lines
    }

    /// Text received after the last line terminator.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buf).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_command_appends_crlf_once() {
        assert_eq!(frame_command("fan pwm 50"), b"fan pwm 50\r\n".to_vec());
        assert_eq!(frame_command("fan pwm 0\r\n"), b"fan pwm 0\r\n".to_vec());
    }

    #[test]
    fn line_assembler_handles_split_chunks_and_crlf() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"{\"DevInfo\":{\"prod").is_empty());
        assert_eq!(lines.pending(), "{\"DevInfo\":{\"prod");
        let out = lines.push(b"uct\":\"W1\"}}\r\n\r\nOK\n");
        assert_eq!(out, vec!["{\"DevInfo\":{\"product\":\"W1\"}}", "OK"]);
        assert_eq!(lines.pending(), "");
    }

    #[tokio::test]
    async fn closed_link_rejects_send_and_tolerates_close() {
        let mut link = SerialPortLink::new("motor");
        assert!(!link.is_open());
        assert!(matches!(link.send(b"x").await, Err(LinkError::NotOpen)));
        link.close().await;
        link.close().await;
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn open_missing_port_reports_port_name() {
        let mut link = SerialPortLink::new("sensor");
        let err = link
            .open("/dev/does-not-exist-imu-fixture", 115_200)
            .await
            .expect_err("missing device must fail");
        assert!(err.to_string().contains("/dev/does-not-exist-imu-fixture"));
        assert!(!link.is_open());
    }
}
