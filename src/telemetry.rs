//! TCP poll/response telemetry session and its lenient sample parser.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use regex::Regex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};

use crate::{
    error::{ParseError, PollError, TelemetryError},
    logging::category,
    types::{Axis3, TelemetrySample},
};

pub const TELEMETRY_REQUEST: &str = "{\"IMU\":{}}";
pub const DEFAULT_READ_BUFFER: usize = 1024;

static IMU_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""IMU"\s*:"#).expect("static regex"));

pub type SharedTelemetry = Arc<Mutex<Box<dyn TelemetryTransport>>>;

pub fn shared(transport: impl TelemetryTransport + 'static) -> SharedTelemetry {
    let boxed: Box<dyn TelemetryTransport> = Box::new(transport);
    Arc::new(Mutex::new(boxed))
}

#[async_trait]
pub trait TelemetryTransport: Send {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TelemetryError>;

    async fn poll_once(&mut self) -> Result<TelemetrySample, PollError>;

    async fn close(&mut self);
}

fn field_regex(name: &str) -> Regex {
    Regex::new(&format!(
        r#""{}"\s*:\s*"?([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)"#,
        regex::escape(name)
    ))
    .expect("field regex")
}

struct FieldPatterns {
    roll: Regex,
    pitch: Regex,
    yaw: Regex,
    gyro: [Regex; 3],
    accel: [Regex; 3],
    mag: [Regex; 3],
}

static FIELDS: LazyLock<FieldPatterns> = LazyLock::new(|| FieldPatterns {
    roll: field_regex("roll"),
    pitch: field_regex("pitch"),
    yaw: field_regex("yaw"),
    gyro: [
        field_regex("gyro_x"),
        field_regex("gyro_y"),
        field_regex("gyro_z"),
    ],
    accel: [
        field_regex("accel_x"),
        field_regex("accel_y"),
        field_regex("accel_z"),
    ],
    mag: [
        field_regex("mag_x"),
        field_regex("mag_y"),
        field_regex("mag_z"),
    ],
});

fn find_number(
    section: &str,
    regex: &Regex,
    field: &'static str,
) -> Result<Option<f64>, ParseError> {
    let Some(captures) = regex.captures(section) else {
        return Ok(None);
    };
    let raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| ParseError::BadNumber {
            field,
            raw: raw.to_string(),
        })
}

fn required(section: &str, regex: &Regex, field: &'static str) -> Result<f64, ParseError> {
    find_number(section, regex, field)?.ok_or(ParseError::MissingField(field))
}

fn optional_axis(
    section: &str,
    regexes: &[Regex; 3],
    names: [&'static str; 3],
) -> Result<Axis3, ParseError> {
    Ok(Axis3 {
        x: find_number(section, &regexes[0], names[0])?.unwrap_or(0.0),
        y: find_number(section, &regexes[1], names[1])?.unwrap_or(0.0),
        z: find_number(section, &regexes[2], names[2])?.unwrap_or(0.0),
    })
}

/// Extracts one sample from a loosely structured reply.
///
/// Each field is searched independently inside the `"IMU":` section. Roll,
/// pitch and yaw are required; rate, acceleration and magnetic fields default
/// to zero when absent.
pub fn parse_sample(response: &str) -> Result<TelemetrySample, ParseError> {
    if response.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let start = IMU_SECTION
        .find(response)
        .ok_or(ParseError::MissingSection)?
        .start();
    let section = &response[start..];
    let fields = &*FIELDS;

    let roll = required(section, &fields.roll, "roll")?;
    let pitch = required(section, &fields.pitch, "pitch")?;
    let yaw = required(section, &fields.yaw, "yaw")?;

    let mut sample = TelemetrySample::orientation(Local::now(), roll, pitch, yaw);
    sample.gyro = optional_axis(section, &fields.gyro, ["gyro_x", "gyro_y", "gyro_z"])?;
    sample.accel = optional_axis(section, &fields.accel, ["accel_x", "accel_y", "accel_z"])?;
    sample.mag = optional_axis(section, &fields.mag, ["mag_x", "mag_y", "mag_z"])?;
    Ok(sample)
}

#[derive(Clone, Copy, Debug)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(3),
        }
    }
}

pub struct TcpTelemetrySession {
    stream: Option<TcpStream>,
    timeouts: SessionTimeouts,
    read_buffer: usize,
}

impl TcpTelemetrySession {
    pub fn new(timeouts: SessionTimeouts, read_buffer: usize) -> Self {
        Self {
            stream: None,
            timeouts,
            read_buffer: read_buffer.max(64),
        }
    }

    /// Discards whatever the peer already queued after an oversize reply so
    /// the next poll starts on a fresh response.
    fn drain_pending(stream: &TcpStream) {
        let mut scratch = [0u8; 512];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

impl Default for TcpTelemetrySession {
    fn default() -> Self {
        Self::new(SessionTimeouts::default(), DEFAULT_READ_BUFFER)
    }
}

#[async_trait]
impl TelemetryTransport for TcpTelemetrySession {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TelemetryError> {
        self.stream = None;
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(self.timeouts.connect, TcpStream::connect(&addr))
            .await
            .map_err(|_| TelemetryError::ConnectTimeout {
                addr: addr.clone(),
                timeout: self.timeouts.connect,
            })??;
        let _ = stream.set_nodelay(true);
        info!(target: category::TCP, "telemetry connected: {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<TelemetrySample, PollError> {
        let stream = self.stream.as_mut().ok_or(TelemetryError::NotConnected)?;
        stream
            .write_all(TELEMETRY_REQUEST.as_bytes())
            .await
            .map_err(TelemetryError::from)?;

        let mut buffer = vec![0u8; self.read_buffer];
        let read = tokio::time::timeout(self.timeouts.read, stream.read(&mut buffer))
            .await
            .map_err(|_| PollError::Timeout(self.timeouts.read))?
            .map_err(TelemetryError::from)?;
        if read == 0 {
            return Err(PollError::Closed);
        }
        if read >= buffer.len() {
            Self::drain_pending(stream);
            return Err(ParseError::Oversize(buffer.len()).into());
        }

        let response = String::from_utf8_lossy(&buffer[..read]);
        debug!(target: category::TCP, "telemetry rx: {}", response.trim());
        parse_sample(&response).map_err(|err| {
            warn!(target: category::IMU, "dropping sample: {err}");
            PollError::Parse(err)
        })
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!(target: category::TCP, "telemetry session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn parses_orientation_and_defaults_missing_rate() {
        let raw = r#"{"IMU":{"roll":1.5,"pitch":-2.0,"yaw":0.25,"gyro_x":10}}"#;
        let sample = parse_sample(raw).expect("valid");
        assert_eq!(sample.roll, 1.5);
        assert_eq!(sample.pitch, -2.0);
        assert_eq!(sample.yaw, 0.25);
        assert_eq!(sample.gyro.x, 10.0);
        assert_eq!(sample.gyro.y, 0.0);
    }

    #[test]
    fn missing_yaw_is_not_a_sample() {
        assert_eq!(
            parse_sample(r#"{"IMU":{"roll":1.5,"pitch":-2.0,"gyro_x":10}}"#),
            Err(ParseError::MissingField("yaw"))
        );
    }

    #[test]
    fn tolerates_loose_text_around_fields() {
        let raw = "garbage \"IMU\" : { \"yaw\" : 3e1, junk \"roll\":-.5 ,\"pitch\": +4 \"mag_z\":7.25";
        let sample = parse_sample(raw).expect("lenient parse");
        assert_eq!(sample.roll, -0.5);
        assert_eq!(sample.pitch, 4.0);
        assert_eq!(sample.yaw, 30.0);
        assert_eq!(sample.mag.z, 7.25);
    }

    #[test]
    fn requires_imu_section() {
        assert_eq!(
            parse_sample(r#"{"roll":1,"pitch":2,"yaw":3}"#),
            Err(ParseError::MissingSection)
        );
        assert_eq!(parse_sample("  "), Err(ParseError::Empty));
    }

    #[tokio::test]
    async fn polls_a_local_server_and_flags_oversize_replies() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut request = [0u8; 64];
            let n = socket.read(&mut request).await?;
            assert_eq!(&request[..n], TELEMETRY_REQUEST.as_bytes());
            socket
                .write_all(br#"{"IMU":{"roll":1,"pitch":2,"yaw":3,"gyro_y":-4}}"#)
                .await?;
            let _ = socket.read(&mut request).await?;
            socket.write_all(&vec![b'x'; 256]).await?;
            let _ = socket.read(&mut request).await?;
            anyhow::Ok(())
        });

        let mut session = TcpTelemetrySession::new(SessionTimeouts::default(), 128);
        session.connect("127.0.0.1", port).await?;
        let sample = session.poll_once().await?;
        assert_eq!(sample.gyro.y, -4.0);

        let oversize = session.poll_once().await.expect_err("oversize reply");
        assert!(!oversize.is_transport());

        session.close().await;
        assert!(matches!(
            session.poll_once().await,
            Err(PollError::Transport(TelemetryError::NotConnected))
        ));
        server.await??;
        Ok(())
    }
}
