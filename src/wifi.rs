//! Host WiFi association to the device's access point.
//!
//! The primary mechanism is NetworkManager's `nmcli`. Some nmcli builds reject
//! open networks with a `key-mgmt` property error; for that fault class the
//! associator falls back to writing a keyfile profile, loading it, and
//! bringing it up explicitly.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::process::Command;

use crate::{error::WifiError, logging::category};

pub const NM_CONNECTIONS_DIR: &str = "/etc/NetworkManager/system-connections";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, WifiError>;
}

pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, WifiError> {
        info!(target: category::WIFI, "exec: {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(|source| WifiError::Spawn {
                program: program.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub secure: bool,
    pub signal: u8,
}

/// Platform association capability: enumerate, then connect.
#[async_trait]
pub trait WifiBackend: Send + Sync {
    async fn scan(&self) -> Result<Vec<AccessPoint>, WifiError>;

    async fn connect(&self, ap: &AccessPoint, password: Option<&str>) -> Result<bool, WifiError>;
}

/// Alternate OS-level association used when the backend rejects parameters.
#[async_trait]
pub trait AssociationFallback: Send + Sync {
    async fn associate(&self, ssid: &str, password: Option<&str>) -> Result<bool, WifiError>;
}

/// What the orchestrator needs: one primary-then-fallback attempt.
#[async_trait]
pub trait Associate: Send + Sync {
    async fn associate(&self, ssid: &str, password: Option<&str>) -> bool;
}

fn args(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

/// Splits one `nmcli -t` row on unescaped `:` and unescapes `\:` / `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

pub fn parse_scan(stdout: &str) -> Vec<AccessPoint> {
    let mut out: Vec<AccessPoint> = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields = split_terse(line);
        let Some(ssid) = fields.first().map(|s| s.trim().to_string()) else {
            continue;
        };
        if ssid.is_empty() {
            continue;
        }
        let security = fields.get(1).map(|s| s.trim()).unwrap_or_default();
        let signal = fields
            .get(2)
            .and_then(|s| s.trim().parse::<u8>().ok())
            .unwrap_or(0);
        let ap = AccessPoint {
            ssid,
            secure: !(security.is_empty() || security == "--"),
            signal,
        };
        // The same SSID shows up once per BSSID; keep the strongest.
        match out.iter_mut().find(|existing| existing.ssid == ap.ssid) {
            Some(existing) if existing.signal < ap.signal => *existing = ap,
            Some(_) => {}
            None => out.push(ap),
        }
    }
    out
}

fn classify_failure(command: &str, output: &CommandOutput) -> WifiError {
    let text = output.text();
    let lower = text.to_ascii_lowercase();
    if lower.contains("key-mgmt: property is missing") || lower.contains("property is invalid") {
        return WifiError::Incompatible(text.trim().to_string());
    }
    if lower.contains("insufficient privileges") || lower.contains("not authorized") {
        return WifiError::Permission(text.trim().to_string());
    }
    WifiError::Command {
        command: command.to_string(),
        output: text.trim().to_string(),
    }
}

pub struct NmcliBackend<R> {
    runner: R,
}

impl<R: CommandRunner> NmcliBackend<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: CommandRunner> WifiBackend for NmcliBackend<R> {
    async fn scan(&self) -> Result<Vec<AccessPoint>, WifiError> {
        let output = self
            .runner
            .run(
                "nmcli",
                &args(&[
                    "-t",
                    "-f",
                    "SSID,SECURITY,SIGNAL",
                    "device",
                    "wifi",
                    "list",
                    "--rescan",
                    "yes",
                ]),
            )
            .await?;
        if !output.success {
            return Err(classify_failure("nmcli device wifi list", &output));
        }
        Ok(parse_scan(&output.stdout))
    }

    async fn connect(&self, ap: &AccessPoint, password: Option<&str>) -> Result<bool, WifiError> {
        let mut command = args(&["device", "wifi", "connect", &ap.ssid]);
        if ap.secure {
            if let Some(password) = password {
                command.extend(args(&["password", password]));
            }
        }
        let output = self.runner.run("nmcli", &command).await?;
        if output.success {
            return Ok(true);
        }
        Err(classify_failure("nmcli device wifi connect", &output))
    }
}

fn keyfile_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

/// Minimal NetworkManager keyfile for an open or WPA-PSK network.
pub fn keyfile_profile(ssid: &str, password: Option<&str>) -> String {
    let ssid = keyfile_escape(ssid);
    let mut profile = format!(
        "[connection]\nid={ssid}\ntype=wifi\nautoconnect=false\n\n[wifi]\nmode=infrastructure\nssid={ssid}\n\n"
    );
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        profile.push_str(&format!(
            "[wifi-security]\nkey-mgmt=wpa-psk\npsk={}\n\n",
            keyfile_escape(password)
        ));
    }
    profile.push_str("[ipv4]\nmethod=auto\n\n[ipv6]\nmethod=auto\n");
    profile
}

pub fn profile_file_name(ssid: &str) -> String {
    let stem = ssid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("imu-fixture-{stem}.nmconnection")
}

/// Writes `contents` next to its final path and renames it into place so
/// NetworkManager never sees a half-written profile.
fn write_profile(dir: &Path, name: &str, contents: &str) -> Result<PathBuf, WifiError> {
    let mut file = tempfile::Builder::new()
        .prefix(".imu-fixture")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    let path = dir.join(name);
    file.persist(&path).map_err(|err| WifiError::Profile(err.error))?;
    Ok(path)
}

pub struct KeyfileFallback<R> {
    runner: R,
    profile_dir: PathBuf,
    settle: Duration,
}

impl<R: CommandRunner> KeyfileFallback<R> {
    pub fn new(runner: R, profile_dir: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            runner,
            profile_dir: profile_dir.into(),
            settle,
        }
    }

    fn is_associated(status: &str, ssid: &str) -> bool {
        status.lines().any(|line| {
            let fields = split_terse(line);
            let wifi = fields.get(1).is_some_and(|t| t == "wifi");
            let connected = fields.get(2).is_some_and(|s| s == "connected");
            let on_ssid = fields.get(3).is_some_and(|c| c == ssid);
            wifi && (on_ssid || connected)
        })
    }
}

#[async_trait]
impl<R: CommandRunner> AssociationFallback for KeyfileFallback<R> {
    async fn associate(&self, ssid: &str, password: Option<&str>) -> Result<bool, WifiError> {
        info!(target: category::WIFI, "fallback association via keyfile profile: {ssid}");

        let stale = self
            .runner
            .run("nmcli", &args(&["connection", "delete", "id", ssid]))
            .await?;
        if !stale.success {
            info!(target: category::WIFI, "no stale profile removed: {}", stale.text().trim());
        }

        let path = write_profile(
            &self.profile_dir,
            &profile_file_name(ssid),
            &keyfile_profile(ssid, password),
        )?;
        info!(target: category::WIFI, "wrote profile {}", path.display());

        let load_args = vec![
            "connection".to_string(),
            "load".to_string(),
            path.display().to_string(),
        ];
        let loaded = self.runner.run("nmcli", &load_args).await?;
        if !loaded.success {
            return Err(classify_failure("nmcli connection load", &loaded));
        }

        let up = self
            .runner
            .run("nmcli", &args(&["connection", "up", "id", ssid]))
            .await?;
        let activated = up.success || up.text().contains("successfully activated");
        if !activated {
            error!(target: category::WIFI, "profile activation failed: {}", up.text().trim());
            return Ok(false);
        }

        tokio::time::sleep(self.settle).await;
        let status = self
            .runner
            .run(
                "nmcli",
                &args(&["-t", "-f", "DEVICE,TYPE,STATE,CONNECTION", "device", "status"]),
            )
            .await?;
        let associated = Self::is_associated(&status.stdout, ssid);
        info!(target: category::WIFI, "fallback association verified: {associated}");
        Ok(associated)
    }
}

pub struct WifiAssociator<B, F> {
    backend: B,
    fallback: F,
}

impl<B: WifiBackend, F: AssociationFallback> WifiAssociator<B, F> {
    pub fn new(backend: B, fallback: F) -> Self {
        Self { backend, fallback }
    }

    async fn run_fallback(&self, ssid: &str, password: Option<&str>) -> bool {
        match self.fallback.associate(ssid, password).await {
            Ok(associated) => associated,
            Err(err) => {
                error!(target: category::WIFI, "fallback association failed: {err}");
                false
            }
        }
    }
}

pub fn system_associator(
    profile_dir: impl Into<PathBuf>,
    settle: Duration,
) -> WifiAssociator<NmcliBackend<SystemCommandRunner>, KeyfileFallback<SystemCommandRunner>> {
    WifiAssociator::new(
        NmcliBackend::new(SystemCommandRunner),
        KeyfileFallback::new(SystemCommandRunner, profile_dir, settle),
    )
}

#[async_trait]
impl<B: WifiBackend, F: AssociationFallback> Associate for WifiAssociator<B, F> {
    async fn associate(&self, ssid: &str, password: Option<&str>) -> bool {
        info!(target: category::WIFI, "associating with {ssid}");
        let password = password.filter(|p| !p.is_empty());

        let access_points = match self.backend.scan().await {
            Ok(aps) => aps,
            Err(WifiError::Incompatible(detail)) => {
                warn!(target: category::WIFI, "scan rejected ({detail}), using fallback");
                return self.run_fallback(ssid, password).await;
            }
            Err(err) => {
                error!(target: category::WIFI, "scan failed: {err}");
                return false;
            }
        };
        if access_points.is_empty() {
            error!(target: category::WIFI, "no access points visible");
            return false;
        }
        let Some(target) = access_points.iter().find(|ap| ap.ssid == ssid) else {
            let visible = access_points
                .iter()
                .map(|ap| ap.ssid.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            error!(target: category::WIFI, "network {ssid} not found; visible: {visible}");
            return false;
        };
        info!(
            target: category::WIFI,
            "found {} signal={} secure={}", target.ssid, target.signal, target.secure
        );
        if target.secure && password.is_none() {
            error!(
                target: category::WIFI,
                "network {ssid} requires a password but none is configured"
            );
            return false;
        }

        match self.backend.connect(target, password).await {
            Ok(true) => {
                info!(target: category::WIFI, "associated with {ssid}");
                true
            }
            Ok(false) => {
                error!(target: category::WIFI, "association with {ssid} failed");
                false
            }
            Err(WifiError::Incompatible(detail)) => {
                warn!(
                    target: category::WIFI,
                    "backend rejected parameters ({detail}), using fallback"
                );
                let password = if target.secure { password } else { None };
                self.run_fallback(ssid, password).await
            }
            Err(WifiError::Permission(detail)) => {
                error!(
                    target: category::WIFI,
                    "insufficient privileges, run as administrator: {detail}"
                );
                false
            }
            Err(err) => {
                error!(target: category::WIFI, "association with {ssid} failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    /// Replies by matching the joined argument list against scripted prefixes.
    struct ScriptedRunner {
        script: Vec<(&'static str, CommandOutput)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<(&'static str, CommandOutput)>) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait]
    impl<'a> CommandRunner for &'a ScriptedRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput, WifiError> {
            let joined = args.join(" ");
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(joined.clone());
            }
            Ok(self
                .script
                .iter()
                .find(|(prefix, _)| joined.starts_with(prefix))
                .map(|(_, out)| out.clone())
                .unwrap_or_else(|| fail("unscripted")))
        }
    }

    struct NoFallback;

    #[async_trait]
    impl AssociationFallback for NoFallback {
        async fn associate(&self, _ssid: &str, _password: Option<&str>) -> Result<bool, WifiError> {
            Ok(false)
        }
    }

    #[test]
    fn terse_rows_unescape_colons() {
        assert_eq!(split_terse(r"Lab\:AP:WPA2:71"), vec!["Lab:AP", "WPA2", "71"]);
        let aps = parse_scan("W1_AP::40\nW1_AP::80\nOffice:WPA2 WPA3:55\n:--:10\n");
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[0].signal, 80);
        assert!(!aps[0].secure);
        assert!(aps[1].secure);
    }

    #[test]
    fn keyfile_includes_psk_only_for_secured_networks() {
        let open = keyfile_profile("W1_AP", None);
        assert!(open.contains("ssid=W1_AP"));
        assert!(!open.contains("[wifi-security]"));
        let secured = keyfile_profile("Office", Some("hunter22"));
        assert!(secured.contains("key-mgmt=wpa-psk\npsk=hunter22"));
        assert_eq!(profile_file_name("W1 AP/2"), "imu-fixture-W1_AP_2.nmconnection");
    }

    #[tokio::test]
    async fn fails_fast_when_ssid_not_visible_or_password_missing() {
        let runner = ScriptedRunner::new(vec![("-t -f SSID", ok("Other::50\nSecure:WPA2:60\n"))]);
        let associator = WifiAssociator::new(NmcliBackend::new(&runner), NoFallback);
        assert!(!associator.associate("W1_AP", None).await);
        assert!(!associator.associate("Secure", Some("")).await);
        assert!(!runner.calls().iter().any(|c| c.starts_with("device wifi connect")));
    }

    #[tokio::test]
    async fn open_network_connects_without_password_argument() {
        let runner = ScriptedRunner::new(vec![
            ("-t -f SSID", ok("W1_AP::50\n")),
            ("device wifi connect", ok("Device 'wlan0' successfully activated")),
        ]);
        let associator = WifiAssociator::new(NmcliBackend::new(&runner), NoFallback);
        assert!(associator.associate("W1_AP", Some("ignored")).await);
        assert!(runner.calls().contains(&"device wifi connect W1_AP".to_string()));
    }

    #[tokio::test]
    async fn key_mgmt_fault_falls_back_to_keyfile_profile() -> Result<()> {
        let dir = tempdir()?;
        let runner = ScriptedRunner::new(vec![
            ("-t -f SSID", ok("W1_AP::50\n")),
            (
                "device wifi connect",
                fail("Error: 802-11-wireless-security.key-mgmt: property is missing."),
            ),
            ("connection delete", fail("Error: unknown connection 'W1_AP'.")),
            ("connection load", ok("")),
            ("connection up", ok("Connection successfully activated")),
            (
                "-t -f DEVICE",
                ok("wlan0:wifi:connected:W1_AP\nlo:loopback:connected (externally):lo\n"),
            ),
        ]);
        let fallback = KeyfileFallback::new(&runner, dir.path(), Duration::ZERO);
        let associator = WifiAssociator::new(NmcliBackend::new(&runner), fallback);

        assert!(associator.associate("W1_AP", None).await);
        let profile = std::fs::read_to_string(dir.path().join(profile_file_name("W1_AP")))?;
        assert!(profile.contains("id=W1_AP"));
        assert!(runner.calls().iter().any(|c| c.starts_with("connection up id W1_AP")));
        Ok(())
    }

    #[tokio::test]
    async fn fallback_reports_unverified_association() -> Result<()> {
        let dir = tempdir()?;
        let runner = ScriptedRunner::new(vec![
            ("connection delete", ok("")),
            ("connection load", ok("")),
            ("connection up", ok("")),
            ("-t -f DEVICE", ok("wlan0:wifi:disconnected:\n")),
        ]);
        let fallback = KeyfileFallback::new(&runner, dir.path(), Duration::ZERO);
        assert!(!fallback.associate("W1_AP", None).await?);
        Ok(())
    }
}
