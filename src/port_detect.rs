use std::{
    io::{self, Read, Write},
    sync::LazyLock,
    time::Duration,
};

use glob::glob;
use log::{info, warn};
use regex::Regex;
use serialport::SerialPort;

use crate::logging::category;

const PATTERNS: &[&str] = &[
    "/dev/cu.usbserial*",
    "/dev/cu.usbmodem*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/cu.wchusbserial*",
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
];

const PROBE_COMMAND: &[u8] = b"AT\r\n";
pub const PROBE_WAIT: Duration = Duration::from_millis(100);
const PROBE_REPLY_MAX: usize = 4 * 1024;

static MOTOR_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MOTOR|WHEEL|(?i:RPM|SPEED|TORQUE)").expect("motor reply regex")
});
static SENSOR_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"IMU|ACCEL|(?i:GYRO|MAG|QUATERNION)").expect("sensor reply regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortRole {
    Motor,
    Sensor,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectedPorts {
    pub motor: Option<String>,
    pub sensor: Option<String>,
}

/// Serial ports the OS reports, merged with USB-serial device nodes.
pub fn list_candidates() -> Vec<String> {
    let mut out = Vec::new();
    match serialport::available_ports() {
        Ok(ports) => out.extend(ports.into_iter().map(|p| p.port_name)),
        Err(err) => warn!(target: category::SERIAL, "port enumeration failed: {err}"),
    }
    for pattern in PATTERNS {
        let Ok(entries) = glob(pattern) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.display().to_string();
            if !out.iter().any(|existing| existing == &path) {
                out.push(path);
            }
        }
    }
    out
}

/// Motor identification wins when a reply matches both.
pub fn classify_reply(reply: &str) -> Option<PortRole> {
    if MOTOR_REPLY.is_match(reply) {
        Some(PortRole::Motor)
    } else if SENSOR_REPLY.is_match(reply) {
        Some(PortRole::Sensor)
    } else {
        None
    }
}

/// Writes the probe command and collects whatever arrives after `wait`.
pub fn probe(port: &mut dyn SerialPort, wait: Duration) -> io::Result<String> {
    port.write_all(PROBE_COMMAND)?;
    port.flush()?;
    std::thread::sleep(wait);

    let mut reply = Vec::new();
    let mut chunk = [0u8; 256];
    while reply.len() < PROBE_REPLY_MAX {
        match port.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                break
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

fn probe_candidate(port_name: &str, baud: u32) -> Option<PortRole> {
    let mut port = match serialport::new(port_name, baud)
        .timeout(Duration::from_millis(50))
        .open()
    {
        Ok(port) => port,
        Err(err) => {
            info!(target: category::SERIAL, "skip {port_name}: {err}");
            return None;
        }
    };
    match probe(port.as_mut(), PROBE_WAIT) {
        Ok(reply) => {
            let role = classify_reply(&reply);
            info!(target: category::SERIAL, "{port_name}: {reply:?} -> {role:?}");
            role
        }
        Err(err) => {
            warn!(target: category::SERIAL, "probe {port_name} failed: {err}");
            None
        }
    }
}

/// Probes every candidate once; the first port claiming each role keeps it.
pub fn detect_roles(baud: u32) -> DetectedPorts {
    let mut detected = DetectedPorts::default();
    for candidate in list_candidates() {
        if detected.motor.is_some() && detected.sensor.is_some() {
            break;
        }
        match probe_candidate(&candidate, baud) {
            Some(PortRole::Motor) if detected.motor.is_none() => {
                detected.motor = Some(candidate)
            }
            Some(PortRole::Sensor) if detected.sensor.is_none() => {
                detected.sensor = Some(candidate)
            }
            _ => {}
        }
    }
    detected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_motor_and_sensor_banners() {
        assert_eq!(classify_reply("W1 MOTOR ctrl v1.3"), Some(PortRole::Motor));
        assert_eq!(classify_reply("speed=0 rpm=0"), Some(PortRole::Motor));
        assert_eq!(classify_reply("IMU ready"), Some(PortRole::Sensor));
        assert_eq!(classify_reply("gyro ok, mag ok"), Some(PortRole::Sensor));
        assert_eq!(classify_reply("imu ready"), None);
        assert_eq!(classify_reply("OK"), None);
    }

    #[cfg(unix)]
    #[test]
    fn probe_reads_reply_from_fake_uart() -> anyhow::Result<()> {
        use std::thread;

        use serialport::TTYPort;

        let (mut master, mut slave) =
            TTYPort::pair().map_err(|err| anyhow::anyhow!("TTYPort::pair failed: {err}"))?;

        let responder = thread::spawn(move || {
            let mut rx = Vec::<u8>::new();
            let mut chunk = [0u8; 64];
            for _ in 0..50 {
                match master.read(&mut chunk) {
                    Ok(n) => rx.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
                if rx.windows(2).any(|w| w == b"AT") {
                    let _ = master.write_all(b"IMU-9DOF GYRO\r\n");
                    let _ = master.flush();
                    return true;
                }
            }
            false
        });

        let reply = probe(&mut slave, Duration::from_millis(200))?;
        assert!(responder.join().unwrap_or(false));
        assert_eq!(classify_reply(&reply), Some(PortRole::Sensor));
        Ok(())
    }
}
