//! Bring-up and validation sequence for one device under test.
//!
//! `Idle -> Connecting -> AwaitingDeviceInfo -> Associating -> Polling ->
//! Evaluating`, then `CleaningUp` before the verdict state is published. A
//! step failure or stop request goes `CleaningUp -> Idle` instead.

use std::{
    convert::Infallible,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use tokio::sync::{watch, Notify};

use crate::{
    config::RunConfig,
    correlator::request_device_info,
    logging::category,
    serial_link::{frame_command, stop_motor_and_close, SerialSession},
    telemetry::SharedTelemetry,
    types::{DeviceDescriptor, RunOutcome, RunResult, RunState, Step, TelemetrySample},
    wifi::Associate,
};

/// Cloneable stop request shared between the run and whoever may cancel it.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves once `stop` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Presentation hooks. All calls are observational.
pub trait RunObserver: Send + Sync {
    fn progress(&self, _message: &str) {}

    fn state_changed(&self, _state: RunState) {}

    fn sample(&self, _sample: &TelemetrySample) {}

    fn finished(&self, _outcome: &RunOutcome) {}
}

pub struct NullObserver;

impl RunObserver for NullObserver {}

enum Halt {
    Failed { step: Step, reason: String },
    Stopped,
}

impl Halt {
    fn failed(step: Step, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let reason = if detail.is_empty() {
            step.describe().to_string()
        } else {
            format!("{}: {detail}", step.describe())
        };
        Halt::Failed { step, reason }
    }
}

/// Runs `step` unless the stop handle fires first.
async fn guarded<T>(
    stop: &StopHandle,
    step: impl Future<Output = Result<T, Halt>>,
) -> Result<T, Halt> {
    tokio::select! {
        biased;
        _ = stop.wait() => Err(Halt::Stopped),
        result = step => result,
    }
}

pub struct TestOrchestrator {
    config: RunConfig,
    serial: SerialSession,
    telemetry: SharedTelemetry,
    wifi: Arc<dyn Associate>,
    observer: Arc<dyn RunObserver>,
    state: watch::Sender<RunState>,
    stop: StopHandle,
    released: AtomicBool,
    samples: Vec<TelemetrySample>,
    descriptor: Option<DeviceDescriptor>,
}

impl TestOrchestrator {
    pub fn new(
        config: RunConfig,
        serial: SerialSession,
        telemetry: SharedTelemetry,
        wifi: Arc<dyn Associate>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            serial,
            telemetry,
            wifi,
            observer: Arc::new(NullObserver),
            state,
            stop: StopHandle::default(),
            released: AtomicBool::new(false),
            samples: Vec::new(),
            descriptor: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn samples(&self) -> &[TelemetrySample] {
        &self.samples
    }

    /// Descriptor of the run in progress, once the handshake has succeeded.
    /// Cleared when the run ends.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    fn transition(&self, next: RunState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(target: category::SYSTEM, "ignoring invalid transition {current:?} -> {next:?}");
            return;
        }
        self.state.send_replace(next);
        info!(target: category::SYSTEM, "state {current:?} -> {next:?}");
        self.observer.state_changed(next);
    }

    fn progress(&self, message: &str) {
        debug!(target: category::SYSTEM, "{message}");
        self.observer.progress(message);
    }

    /// Executes one full run. Exclusive borrow keeps runs serialized.
    ///
    /// A stop requested before the call is honoured by this run; the stop
    /// handle is re-armed once the run has finished.
    pub async fn run(&mut self) -> RunResult {
        self.samples.clear();
        self.descriptor = None;
        self.released.store(false, Ordering::SeqCst);

        let outcome = match self.sequence().await {
            Ok(()) => {
                self.transition(RunState::Evaluating);
                self.progress("[5/5] evaluating telemetry");
                let verdict = self.config.evaluator.analyze(&self.samples);
                self.transition(RunState::CleaningUp);
                self.cleanup().await;
                if verdict.is_pass() {
                    self.transition(RunState::Passed);
                    RunOutcome::Passed(verdict)
                } else {
                    self.transition(RunState::Failed);
                    RunOutcome::Failed {
                        step: Step::Evaluation,
                        reason: verdict.reason.clone(),
                        verdict: Some(verdict),
                    }
                }
            }
            Err(halt) => {
                self.transition(RunState::CleaningUp);
                self.cleanup().await;
                self.transition(RunState::Idle);
                match halt {
                    Halt::Failed { step, reason } => {
                        warn!(target: category::SYSTEM, "run failed at {step:?}: {reason}");
                        RunOutcome::Failed {
                            step,
                            reason,
                            verdict: None,
                        }
                    }
                    Halt::Stopped => {
                        info!(target: category::SYSTEM, "run stopped");
                        RunOutcome::Stopped
                    }
                }
            }
        };

        info!(
            target: category::SYSTEM,
            "run finished: {} ({})", outcome.label(), outcome.reason()
        );
        self.observer.finished(&outcome);
        self.stop.reset();
        RunResult {
            outcome,
            descriptor: self.descriptor.take(),
        }
    }

    async fn sequence(&mut self) -> Result<(), Halt> {
        let stop = self.stop.clone();

        self.transition(RunState::Connecting);
        self.progress("[1/5] connecting motor");
        guarded(&stop, self.start_motor()).await?;

        self.transition(RunState::AwaitingDeviceInfo);
        self.progress("[2/5] requesting device info");
        let descriptor = guarded(&stop, self.fetch_device_info()).await?;
        let ssid = descriptor.ap_name.clone();
        self.descriptor = Some(descriptor);

        self.transition(RunState::Associating);
        self.progress(&format!("[3/5] associating with {ssid}"));
        guarded(&stop, self.associate(&ssid)).await?;

        self.transition(RunState::Polling);
        self.progress("[4/5] collecting telemetry");
        guarded(&stop, self.connect_telemetry()).await?;
        self.collect().await
    }

    async fn start_motor(&self) -> Result<(), Halt> {
        let cfg = &self.config;
        let motor = self.serial.motor.clone();
        let observer = self.observer.clone();
        let sink = move |message: &str| observer.progress(message);

        let connected = cfg
            .motor_retry
            .execute(
                "motor serial",
                (),
                |_| {
                    let motor = motor.clone();
                    let port = cfg.motor_port.clone();
                    let baud = cfg.motor_baud;
                    async move {
                        let mut link = motor.lock().await;
                        link.open(&port, baud).await.map(|()| true)
                    }
                },
                Some(&sink),
            )
            .await;
        if !connected {
            return Err(Halt::failed(
                Step::MotorControl,
                format!("could not open {}", cfg.motor_port),
            ));
        }

        let mut link = motor.lock().await;
        link.send(&frame_command(&cfg.start_command))
            .await
            .map_err(|err| Halt::failed(Step::MotorControl, format!("start command: {err}")))?;
        info!(target: category::SERIAL, "motor started ({})", cfg.start_command);
        drop(link);

        tokio::time::sleep(cfg.motor_settle).await;
        Ok(())
    }

    async fn fetch_device_info(&self) -> Result<DeviceDescriptor, Halt> {
        let cfg = &self.config;
        let sensor = self.serial.sensor.clone();
        let observer = self.observer.clone();
        let sink = move |message: &str| observer.progress(message);

        // Each attempt re-opens the link if needed and repeats the handshake;
        // a garbled or incomplete descriptor only costs one attempt.
        let report = cfg
            .sensor_retry
            .attempt(
                "sensor device info",
                |attempt| {
                    let sensor = sensor.clone();
                    let port = cfg.sensor_port.clone();
                    let baud = cfg.sensor_baud;
                    let timeout = cfg.device_info_timeout;
                    async move {
                        let mut link = sensor.lock().await;
                        if !link.is_open() {
                            if let Err(err) = link.open(&port, baud).await {
                                return Err(anyhow::Error::from(err));
                            }
                        }
                        let reply = request_device_info(&mut **link, timeout).await;
                        if !matches!(reply, Ok(Some(_))) {
                            debug!(
                                target: category::SERIAL,
                                "device info attempt {attempt} unusable, reopening"
                            );
                            link.close().await;
                        }
                        reply.map_err(anyhow::Error::from)
                    }
                },
                Some(&sink),
            )
            .await;

        report.value.ok_or_else(|| {
            let detail = report
                .attempts
                .last()
                .and_then(|a| a.error.clone())
                .unwrap_or_else(|| "no valid descriptor".to_string());
            Halt::failed(Step::DeviceInfo, detail)
        })
    }

    async fn associate(&self, ssid: &str) -> Result<(), Halt> {
        let cfg = &self.config;
        let observer = self.observer.clone();
        let sink = move |message: &str| observer.progress(message);

        let associated = cfg
            .wifi_retry
            .execute(
                "wifi",
                (),
                |_| {
                    let wifi = self.wifi.clone();
                    let ssid = ssid.to_string();
                    let password = cfg.wifi_password.clone();
                    async move {
                        let joined = wifi.associate(&ssid, password.as_deref()).await;
                        Ok::<bool, Infallible>(joined)
                    }
                },
                Some(&sink),
            )
            .await;
        if associated {
            Ok(())
        } else {
            Err(Halt::failed(Step::WifiAssociation, format!("could not join {ssid}")))
        }
    }

    async fn connect_telemetry(&self) -> Result<(), Halt> {
        let cfg = &self.config;
        let telemetry = self.telemetry.clone();
        let observer = self.observer.clone();
        let sink = move |message: &str| observer.progress(message);

        let connected = cfg
            .tcp_retry
            .execute(
                "tcp telemetry",
                (),
                |_| {
                    let telemetry = telemetry.clone();
                    let host = cfg.tcp_host.clone();
                    let port = cfg.tcp_port;
                    async move { telemetry.lock().await.connect(&host, port).await.map(|()| true) }
                },
                Some(&sink),
            )
            .await;
        if connected {
            Ok(())
        } else {
            Err(Halt::failed(
                Step::TelemetryConnect,
                format!("{}:{} unreachable", cfg.tcp_host, cfg.tcp_port),
            ))
        }
    }

    /// Fixed number of polls; the stop signal is honoured between polls and
    /// interrupts an in-flight poll. A transport fault ends collection early.
    async fn collect(&mut self) -> Result<(), Halt> {
        let stop = self.stop.clone();
        let telemetry = self.telemetry.clone();
        let poll_count = self.config.poll_count;
        let interval = self.config.poll_interval;

        for poll in 1..=poll_count {
            if stop.is_stopped() {
                return Err(Halt::Stopped);
            }
            let polled = tokio::select! {
                biased;
                _ = stop.wait() => return Err(Halt::Stopped),
                polled = async { telemetry.lock().await.poll_once().await } => polled,
            };
            match polled {
                Ok(sample) => {
                    debug!(
                        target: category::IMU,
                        "poll {poll}/{poll_count}: roll={:.2} pitch={:.2} yaw={:.2}",
                        sample.roll, sample.pitch, sample.yaw
                    );
                    self.observer.sample(&sample);
                    self.samples.push(sample);
                }
                Err(err) if err.is_transport() => {
                    warn!(
                        target: category::TCP,
                        "poll {poll}/{poll_count} failed, ending collection: {err}"
                    );
                    break;
                }
                Err(err) => {
                    debug!(target: category::IMU, "poll {poll}/{poll_count} dropped: {err}")
                }
            }
            if poll < poll_count {
                tokio::select! {
                    biased;
                    _ = stop.wait() => return Err(Halt::Stopped),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        self.progress(&format!("collected {} samples", self.samples.len()));
        Ok(())
    }

    /// Stops the motor and releases every transport.
    ///
    /// Returns `true` for the call that did the release; any later or
    /// concurrent call returns `false` without touching the transports.
    /// Faults along the way are logged and never propagated.
    pub async fn cleanup(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(target: category::SYSTEM, "cleanup already done");
            return false;
        }
        info!(target: category::SYSTEM, "cleanup: stopping motor and closing transports");

        {
            let mut motor = self.serial.motor.lock().await;
            let (command, grace) = (&self.config.stop_command, self.config.stop_grace);
            stop_motor_and_close(&mut **motor, command, grace).await;
        }
        self.serial.sensor.lock().await.close().await;
        self.telemetry.lock().await.close().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stop_handle_wakes_waiters_and_is_sticky() {
        let stop = StopHandle::default();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        tokio::task::yield_now().await;
        stop.stop();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());

        // A waiter created after the stop resolves immediately.
        assert!(tokio::time::timeout(Duration::from_millis(10), stop.wait())
            .await
            .is_ok());
        stop.reset();
        assert!(!stop.is_stopped());
    }

    #[test]
    fn failure_reason_names_the_step() {
        let halt = Halt::failed(Step::MotorControl, "could not open /dev/ttyUSB0");
        let Halt::Failed { reason, .. } = halt else {
            panic!("expected failure");
        };
        assert_eq!(reason, "motor control failed: could not open /dev/ttyUSB0");
    }
}
