//! The stream supervisor control loop
//!
//! [`StreamSupervisor`] owns the active [`StreamSession`] and drives it
//! through [`SupervisorState`]. Every tick it decides between leaving the
//! pipeline alone, replacing only the capture process, or tearing down and
//! rebuilding both processes for a new mode.

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, SupervisorConfig};
use crate::events::{StatusSink, SupervisorEvent, Trigger};
use crate::solar::{SolarSchedule, classify};
use crate::utils::sos::SignalOfStop;

use super::builder::PipelineBuilder;
use super::channel::DataChannel;
use super::error::SupervisorError;
use super::health::PipelineHealth;
use super::process::{ProcessHandle, ProcessLauncher, ProcessSpec, Termination};
use super::session::StreamSession;
use super::state::SupervisorState;
use super::types::Mode;

pub struct StreamSupervisor {
    settings: SupervisorConfig,
    builder: PipelineBuilder,
    schedule: SolarSchedule,
    launcher: Box<dyn ProcessLauncher>,
    sink: Box<dyn StatusSink>,
    sos: SignalOfStop,
    health: Arc<PipelineHealth>,
    state: SupervisorState,
    session: Option<StreamSession>,
    /// Consecutive failed build attempts
    failed_builds: u32,
    generation: u64,
    started_at: Instant,
    last_health_report: Instant,
}

impl StreamSupervisor {
    pub fn new(
        config: &Config,
        schedule: SolarSchedule,
        launcher: Box<dyn ProcessLauncher>,
        sink: Box<dyn StatusSink>,
        sos: SignalOfStop,
    ) -> Self {
        let now = Instant::now();
        Self {
            settings: config.supervisor.clone(),
            builder: PipelineBuilder::new(config),
            schedule,
            launcher,
            sink,
            sos,
            health: Arc::new(PipelineHealth::new()),
            state: SupervisorState::Idle,
            session: None,
            failed_builds: 0,
            generation: 0,
            started_at: now,
            last_health_report: now,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Drive the state machine until a stop is requested.
    ///
    /// Consumes the supervisor; both processes are stopped before this returns.
    pub async fn run(mut self) {
        info!(
            "Supervisor starting with {} sun times, tick {:?}",
            self.schedule.source_name(),
            self.settings.tick_interval()
        );

        while !self.state.is_terminal() {
            if self.state.is_running() {
                self.sos.sleep(self.settings.tick_interval()).await;
            }
            self.step(Local::now().naive_local()).await;
        }
    }

    /// Run one step of the state machine as if the local time were `now`.
    pub async fn step(&mut self, now: NaiveDateTime) -> SupervisorState {
        let next = if self.sos.cancelled() {
            SupervisorState::ShuttingDown
        } else {
            match self.state {
                SupervisorState::Idle => SupervisorState::BuildingPipeline,
                SupervisorState::BuildingPipeline => self.build_pipeline(now).await,
                SupervisorState::Running => self.supervise(now).await,
                SupervisorState::RestartingCapture => self.restart_capture().await,
                SupervisorState::RebuildingForModeChange => self.tear_down_for_rebuild().await,
                SupervisorState::ShuttingDown => SupervisorState::ShuttingDown,
            }
        };

        self.transition(next).await;
        self.state
    }

    async fn transition(&mut self, next: SupervisorState) {
        if next == self.state {
            return;
        }

        let next = if self.state.can_transition_to(&next) {
            next
        } else {
            error!("Illegal transition {} -> {}, shutting down", self.state, next);
            SupervisorState::ShuttingDown
        };

        self.sink.emit(SupervisorEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;

        if next.is_terminal() {
            self.shut_down().await;
        }
    }

    async fn build_pipeline(&mut self, now: NaiveDateTime) -> SupervisorState {
        self.refresh_schedule(now.date()).await;

        let window = *self.schedule.current_window();
        let mode = classify(now.time(), &window);
        self.sink.emit(SupervisorEvent::ModeClassified {
            mode,
            at: now.time(),
            window,
        });

        match self.launch_session(mode).await {
            Ok(session) => {
                self.failed_builds = 0;
                self.sink.emit(SupervisorEvent::PipelineRunning {
                    mode,
                    capture_pid: session.capture.pid(),
                    publish_pid: session.publish.pid(),
                    generation: session.channel.generation(),
                });
                self.session = Some(session);
                SupervisorState::Running
            }
            Err(SupervisorError::StopRequested) => SupervisorState::ShuttingDown,
            Err(e) => {
                self.failed_builds = self.failed_builds.saturating_add(1);
                self.health.record_failed_build();

                let retry_in = self.settings.retry_backoff(self.failed_builds);
                self.sink.emit(SupervisorEvent::BuildFailed {
                    attempt: self.failed_builds,
                    mode,
                    error: e.to_string(),
                    retry_in,
                });

                if self.sos.sleep(retry_in).await {
                    SupervisorState::BuildingPipeline
                } else {
                    SupervisorState::ShuttingDown
                }
            }
        }
    }

    /// Launch capture, then publish, joined by a fresh data channel.
    ///
    /// Anything launched is stopped again before an error is returned.
    async fn launch_session(&mut self, mode: Mode) -> Result<StreamSession, SupervisorError> {
        let (capture_params, publish_params) = self.builder.build(mode);

        let mut capture = self.launch(&self.builder.capture_spec(&capture_params))?;

        let generation = self.next_generation();
        let mut channel =
            match DataChannel::create(generation, &mut capture, Arc::clone(&self.health)) {
                Ok(channel) => channel,
                Err(e) => {
                    self.stop_process(&mut capture).await;
                    return Err(e.into());
                }
            };

        if let Err(e) = self.await_ready(&mut capture, self.settings.warmup(mode)).await {
            self.stop_process(&mut capture).await;
            return Err(e);
        }

        let mut publish = match self.launch(&self.builder.publish_spec(&publish_params)) {
            Ok(publish) => publish,
            Err(e) => {
                self.stop_process(&mut capture).await;
                return Err(e);
            }
        };

        let connected = DataChannel::sink_for(&mut publish)
            .and_then(|sink| channel.connect(Arc::clone(&sink)).map(|_| sink));
        let sink = match connected {
            Ok(sink) => sink,
            Err(e) => {
                self.stop_process(&mut capture).await;
                self.stop_process(&mut publish).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.await_ready(&mut publish, self.settings.publish_check()).await {
            channel.close();
            self.stop_process(&mut capture).await;
            self.stop_process(&mut publish).await;
            return Err(e);
        }

        let now = Instant::now();
        Ok(StreamSession {
            capture,
            publish,
            channel,
            sink,
            mode,
            capture_params,
            publish_params,
            started_at: now,
            last_capture_restart: now,
        })
    }

    /// One tick of a running pipeline, checked in priority order.
    async fn supervise(&mut self, now: NaiveDateTime) -> SupervisorState {
        self.refresh_schedule(now.date()).await;
        let mode = classify(now.time(), self.schedule.current_window());

        let Some(session) = self.session.as_mut() else {
            warn!("Running without a session, rebuilding");
            return SupervisorState::RebuildingForModeChange;
        };

        let session_mode = session.mode;
        let segment = session.segment_age();

        // Mode change, publish death, capture death, stall, segment age. Publish
        // death goes before capture death since its rebuild replaces the
        // capture as well.
        let triggered = if mode != session_mode {
            Some((
                Trigger::ModeChanged {
                    from: session_mode,
                    to: mode,
                },
                SupervisorState::RebuildingForModeChange,
            ))
        } else if let Some(status) = session.publish.exit_status() {
            self.sink.emit(SupervisorEvent::ProcessExited {
                role: session.publish.role(),
                pid: session.publish.pid(),
                status,
                uptime: session.publish.uptime(),
            });
            Some((
                Trigger::PublishExited(status),
                SupervisorState::RebuildingForModeChange,
            ))
        } else if let Some(status) = session.capture.exit_status() {
            self.sink.emit(SupervisorEvent::ProcessExited {
                role: session.capture.role(),
                pid: session.capture.pid(),
                status,
                uptime: session.capture.uptime(),
            });
            self.health.record_capture_crash();
            Some((
                Trigger::CaptureExited(status),
                SupervisorState::RestartingCapture,
            ))
        } else if self
            .settings
            .stall_timeout()
            .is_some_and(|limit| self.health.is_stalled(limit))
        {
            Some((
                Trigger::CaptureStalled(self.health.data_silence()),
                SupervisorState::RestartingCapture,
            ))
        } else if segment >= self.settings.max_segment() {
            Some((
                Trigger::SegmentExpired(segment),
                SupervisorState::RestartingCapture,
            ))
        } else {
            None
        };

        match triggered {
            Some((trigger, next)) => {
                self.sink.emit(SupervisorEvent::Triggered {
                    trigger,
                    mode: session_mode,
                    segment,
                });
                next
            }
            None => {
                self.report_health();
                SupervisorState::Running
            }
        }
    }

    /// Swap the capture process under a live publish process.
    async fn restart_capture(&mut self) -> SupervisorState {
        let Some(mut session) = self.session.take() else {
            return SupervisorState::RebuildingForModeChange;
        };

        session.channel.close();
        self.stop_process(&mut session.capture).await;

        let result = self.replace_capture(&mut session).await;
        let next = match result {
            Ok(()) => {
                self.health.record_capture_restart();
                self.sink.emit(SupervisorEvent::CaptureRestarted {
                    mode: session.mode,
                    pid: session.capture.pid(),
                    generation: session.channel.generation(),
                });
                SupervisorState::Running
            }
            Err(SupervisorError::StopRequested) => SupervisorState::ShuttingDown,
            Err(e) => {
                self.sink.emit(SupervisorEvent::Triggered {
                    trigger: Trigger::CaptureRestartFailed(e.to_string()),
                    mode: session.mode,
                    segment: session.segment_age(),
                });
                SupervisorState::RebuildingForModeChange
            }
        };

        self.session = Some(session);
        next
    }

    async fn replace_capture(&mut self, session: &mut StreamSession) -> Result<(), SupervisorError> {
        let mut capture = self.launch(&self.builder.capture_spec(&session.capture_params))?;

        let generation = self.next_generation();
        let mut channel =
            match DataChannel::create(generation, &mut capture, Arc::clone(&self.health)) {
                Ok(channel) => channel,
                Err(e) => {
                    self.stop_process(&mut capture).await;
                    return Err(e.into());
                }
            };

        if let Err(e) = channel.connect(Arc::clone(&session.sink)) {
            self.stop_process(&mut capture).await;
            return Err(e.into());
        }

        let warmup = self.settings.warmup(session.mode);
        if let Err(e) = self.await_ready(&mut capture, warmup).await {
            channel.close();
            self.stop_process(&mut capture).await;
            return Err(e);
        }

        session.capture = capture;
        session.channel = channel;
        session.last_capture_restart = Instant::now();
        Ok(())
    }

    async fn tear_down_for_rebuild(&mut self) -> SupervisorState {
        if let Some(session) = self.session.take() {
            self.tear_down(session).await;
            self.health.record_rebuild();
        }
        SupervisorState::BuildingPipeline
    }

    /// Stop capture before publish so the publisher drains what it got.
    async fn tear_down(&self, mut session: StreamSession) {
        session.channel.close();
        self.stop_process(&mut session.capture).await;
        self.stop_process(&mut session.publish).await;
        debug!(
            "Session in {} mode torn down after {:.0}s",
            session.mode,
            session.uptime().as_secs_f64()
        );
    }

    async fn shut_down(&mut self) {
        if let Some(session) = self.session.take() {
            self.tear_down(session).await;
        }
        self.sink.emit(SupervisorEvent::Health(self.health.summary()));
        self.sink.emit(SupervisorEvent::Stopped {
            uptime: self.started_at.elapsed(),
        });
    }

    async fn refresh_schedule(&mut self, date: NaiveDate) {
        match self.schedule.ensure_current(date).await {
            Some(Ok(window)) => self.sink.emit(SupervisorEvent::ScheduleRefreshed {
                window,
                source: self.schedule.source_name(),
            }),
            Some(Err(error)) => self.sink.emit(SupervisorEvent::ScheduleStale {
                error,
                window: *self.schedule.current_window(),
            }),
            None => {}
        }
    }

    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, SupervisorError> {
        let handle = self.launcher.launch(spec)?;
        self.sink.emit(SupervisorEvent::ProcessLaunched {
            role: spec.role,
            handle: handle.id(),
            pid: handle.pid(),
            command: spec.to_string(),
        });
        Ok(handle)
    }

    /// Wait out the warm-up of `handle`, giving up early on a stop request.
    async fn await_ready(
        &self,
        handle: &mut ProcessHandle,
        warmup: Duration,
    ) -> Result<(), SupervisorError> {
        let (role, pid) = (handle.role(), handle.pid());
        let timeout = self.settings.ready_timeout();

        let ready = tokio::select! {
            ready = handle.await_ready(warmup, timeout) => Some(ready),
            _ = self.sos.wait_cancellation() => None,
        };

        match ready {
            Some(ready) => {
                let after = ready?;
                self.sink.emit(SupervisorEvent::ProcessReady { role, pid, after });
                Ok(())
            }
            None => Err(SupervisorError::StopRequested),
        }
    }

    async fn stop_process(&self, handle: &mut ProcessHandle) {
        let (role, pid) = (handle.role(), handle.pid());
        let grace = self.settings.termination_grace();

        match handle.terminate(grace).await {
            Ok(outcome) => {
                if outcome == Termination::Forced {
                    warn!(
                        "{}",
                        SupervisorError::GracefulTerminationTimeout { role, pid, grace }
                    );
                }
                self.sink
                    .emit(SupervisorEvent::ProcessTerminated { role, pid, outcome });
            }
            Err(e) => error!("Failed to stop {} process {}: {}", role, pid, e),
        }
    }

    fn report_health(&mut self) {
        if self.last_health_report.elapsed() >= self.settings.health_log_interval() {
            self.last_health_report = Instant::now();
            self.sink
                .emit(SupervisorEvent::Health(self.health.summary()));
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingSink;
    use crate::pipeline::process::ProcessError;
    use crate::pipeline::types::ProcessRole;
    use crate::solar::schedule::tests::FixedSource;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    const IDLE_CAPTURE: &str = "sleep 30";
    const IDLE_PUBLISH: &str = "cat > /dev/null";

    /// Runs a shell script in place of each real program, remembering the
    /// specs it was asked to launch.
    struct ScriptLauncher {
        capture_scripts: Mutex<VecDeque<&'static str>>,
        publish_scripts: Mutex<VecDeque<&'static str>>,
        launched: Arc<Mutex<Vec<ProcessSpec>>>,
    }

    impl ScriptLauncher {
        fn new() -> Self {
            Self {
                capture_scripts: Mutex::new(VecDeque::new()),
                publish_scripts: Mutex::new(VecDeque::new()),
                launched: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn captures(self, scripts: &[&'static str]) -> Self {
            self.capture_scripts.lock().unwrap().extend(scripts);
            self
        }

        fn publishers(self, scripts: &[&'static str]) -> Self {
            self.publish_scripts.lock().unwrap().extend(scripts);
            self
        }
    }

    impl ProcessLauncher for ScriptLauncher {
        fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
            self.launched.lock().unwrap().push(spec.clone());
            let script = match spec.role {
                ProcessRole::Capture => self
                    .capture_scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(IDLE_CAPTURE),
                ProcessRole::Publish => self
                    .publish_scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(IDLE_PUBLISH),
            };
            ProcessHandle::spawn(
                &ProcessSpec::new(spec.role, "sh", spec.channel_end).args(["-c", script]),
            )
        }
    }

    struct Harness {
        supervisor: StreamSupervisor,
        sink: RecordingSink,
        launched: Arc<Mutex<Vec<ProcessSpec>>>,
        sos: SignalOfStop,
    }

    impl Harness {
        fn new(config: &Config, source: FixedSource, launcher: ScriptLauncher) -> Self {
            let sink = RecordingSink::default();
            let sos = SignalOfStop::new();
            let launched = Arc::clone(&launcher.launched);
            let schedule = SolarSchedule::new(Box::new(source), &config.location, date());
            let supervisor = StreamSupervisor::new(
                config,
                schedule,
                Box::new(launcher),
                Box::new(sink.clone()),
                sos.clone(),
            );
            Self {
                supervisor,
                sink,
                launched,
                sos,
            }
        }

        async fn run_until_running(&mut self, now: NaiveDateTime) {
            for _ in 0..10 {
                if self.supervisor.step(now).await == SupervisorState::Running {
                    return;
                }
            }
            panic!("pipeline never reached Running");
        }

        fn handles(&self) -> (u32, u32) {
            let session = self.supervisor.session().expect("no session");
            (session.capture.pid(), session.publish.pid())
        }

        fn launched(&self, role: ProcessRole) -> Vec<ProcessSpec> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|spec| spec.role == role)
                .cloned()
                .collect()
        }

        fn triggers(&self) -> Vec<Trigger> {
            self.sink
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    SupervisorEvent::Triggered { trigger, .. } => Some(trigger),
                    _ => None,
                })
                .collect()
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.location.sunrise_buffer_min = 0;
        config.location.sunset_buffer_min = 0;
        config.supervisor = SupervisorConfig {
            tick_interval_ms: 10,
            max_segment_secs: 3_600,
            day_warmup_ms: 100,
            night_warmup_ms: 150,
            ready_timeout_ms: 2_000,
            publish_check_ms: 100,
            termination_grace_ms: 1_000,
            retry_backoff_ms: 10,
            max_retry_backoff_ms: 40,
            stall_timeout_secs: 0,
            health_log_secs: 3_600,
        };
        config
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 21).unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        date().and_hms_opt(hour, minute, 0).unwrap()
    }

    fn sun() -> FixedSource {
        FixedSource::new((6, 0), (20, 0))
    }

    #[tokio::test]
    async fn test_builds_day_pipeline() {
        let mut h = Harness::new(&test_config(), sun(), ScriptLauncher::new());

        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
        h.run_until_running(at(12, 0)).await;

        let session = h.supervisor.session().unwrap();
        assert_eq!(session.mode, Mode::Day);
        assert!(session.capture_params.shutter_micros.is_none());
        assert!(!session.publish_params.video_transcode);
        assert_eq!(
            h.sink.transitions(),
            vec![
                (SupervisorState::Idle, SupervisorState::BuildingPipeline),
                (SupervisorState::BuildingPipeline, SupervisorState::Running),
            ]
        );
        assert_eq!(h.launched(ProcessRole::Capture).len(), 1);
        assert_eq!(h.launched(ProcessRole::Publish).len(), 1);
    }

    #[tokio::test]
    async fn test_capture_crash_restarts_capture_only() {
        let launcher = ScriptLauncher::new().captures(&["sleep 0.4"]);
        let mut h = Harness::new(&test_config(), sun(), launcher);
        h.run_until_running(at(12, 0)).await;

        let (capture_before, publish_before) = h.handles();
        let params_before = h.supervisor.session().unwrap().capture_params.clone();
        let generation_before = h.supervisor.session().unwrap().channel.generation();

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RestartingCapture
        );
        assert_eq!(h.supervisor.step(at(12, 1)).await, SupervisorState::Running);

        let (capture_after, publish_after) = h.handles();
        assert_ne!(capture_before, capture_after);
        assert_eq!(publish_before, publish_after);

        let session = h.supervisor.session().unwrap();
        assert_eq!(session.capture_params, params_before);
        assert_eq!(session.channel.generation(), generation_before + 1);

        assert!(matches!(h.triggers().as_slice(), [Trigger::CaptureExited(_)]));
        assert_eq!(h.supervisor.health().capture_crashes(), 1);
        assert_eq!(h.supervisor.health().capture_restarts(), 1);
        assert_eq!(h.supervisor.health().pipeline_rebuilds(), 0);
        assert_eq!(h.launched(ProcessRole::Publish).len(), 1);
    }

    #[tokio::test]
    async fn test_segment_expiry_cycles_capture() {
        let mut config = test_config();
        config.supervisor.max_segment_secs = 1;
        let source = sun();
        let calls = Arc::clone(&source.calls);
        let mut h = Harness::new(&config, source, ScriptLauncher::new());
        h.run_until_running(at(12, 0)).await;

        let (capture_before, publish_before) = h.handles();
        assert_eq!(h.supervisor.step(at(12, 0)).await, SupervisorState::Running);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RestartingCapture
        );
        assert_eq!(h.supervisor.step(at(12, 1)).await, SupervisorState::Running);

        let (capture_after, publish_after) = h.handles();
        assert_ne!(capture_before, capture_after);
        assert_eq!(publish_before, publish_after);
        assert!(matches!(h.triggers().as_slice(), [Trigger::SegmentExpired(_)]));
        assert_eq!(h.supervisor.health().capture_crashes(), 0);
        assert_eq!(h.supervisor.health().capture_restarts(), 1);

        // Many ticks on one date, one sun time lookup
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sunrise_rebuilds_both_processes() {
        let mut h = Harness::new(&test_config(), sun(), ScriptLauncher::new());
        h.run_until_running(at(5, 0)).await;

        assert_eq!(h.supervisor.session().unwrap().mode, Mode::Night);
        assert!(h.launched(ProcessRole::Capture)[0].has_arg("--shutter"));
        let (capture_before, publish_before) = h.handles();
        h.sink.clear();

        assert_eq!(
            h.supervisor.step(at(7, 0)).await,
            SupervisorState::RebuildingForModeChange
        );
        assert_eq!(
            h.supervisor.step(at(7, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert_eq!(h.supervisor.step(at(7, 0)).await, SupervisorState::Running);

        let (capture_after, publish_after) = h.handles();
        assert_ne!(capture_before, capture_after);
        assert_ne!(publish_before, publish_after);

        let session = h.supervisor.session().unwrap();
        assert_eq!(session.mode, Mode::Day);
        assert_eq!(session.capture_params.shutter_micros, None);

        let captures = h.launched(ProcessRole::Capture);
        assert!(!captures[captures.len() - 1].has_arg("--shutter"));
        let publishers = h.launched(ProcessRole::Publish);
        assert_eq!(
            publishers[publishers.len() - 1].arg_value("-c:v"),
            Some("copy")
        );

        assert_eq!(
            h.triggers(),
            vec![Trigger::ModeChanged {
                from: Mode::Night,
                to: Mode::Day
            }]
        );
        let terminated = h
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, SupervisorEvent::ProcessTerminated { .. }))
            .count();
        assert_eq!(terminated, 2);
        assert_eq!(h.supervisor.health().pipeline_rebuilds(), 1);
    }

    #[tokio::test]
    async fn test_mode_change_wins_over_segment_expiry() {
        let mut config = test_config();
        config.supervisor.max_segment_secs = 1;
        let mut h = Harness::new(&config, sun(), ScriptLauncher::new());
        h.run_until_running(at(19, 58)).await;
        assert_eq!(h.supervisor.session().unwrap().mode, Mode::Day);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(
            h.supervisor.step(at(20, 0)).await,
            SupervisorState::RebuildingForModeChange
        );
        assert!(matches!(
            h.triggers().as_slice(),
            [Trigger::ModeChanged {
                from: Mode::Day,
                to: Mode::Night
            }]
        ));
    }

    #[tokio::test]
    async fn test_publish_death_forces_rebuild() {
        let launcher = ScriptLauncher::new().publishers(&["sleep 0.4"]);
        let mut h = Harness::new(&test_config(), sun(), launcher);
        h.run_until_running(at(12, 0)).await;

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RebuildingForModeChange
        );
        assert!(matches!(
            h.triggers().as_slice(),
            [Trigger::PublishExited(_)]
        ));
        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::BuildingPipeline
        );
        assert!(h.supervisor.session().is_none());

        assert_eq!(h.supervisor.step(at(12, 1)).await, SupervisorState::Running);
        assert_eq!(h.launched(ProcessRole::Publish).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_builds_retry_until_running() {
        let launcher = ScriptLauncher::new().captures(&["exit 1", "exit 1"]);
        let mut h = Harness::new(&test_config(), sun(), launcher);

        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert_eq!(h.supervisor.step(at(12, 0)).await, SupervisorState::Running);

        let attempts: Vec<(u32, Duration)> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SupervisorEvent::BuildFailed {
                    attempt, retry_in, ..
                } => Some((attempt, retry_in)),
                _ => None,
            })
            .collect();
        assert_eq!(
            attempts,
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20))
            ]
        );
        assert_eq!(h.supervisor.health().failed_builds(), 2);
        assert_eq!(h.supervisor.failed_builds, 0);
        // The dead capture was never followed by a publish launch
        assert_eq!(h.launched(ProcessRole::Publish).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_build_backoff() {
        let mut config = test_config();
        config.supervisor.retry_backoff_ms = 30_000;
        config.supervisor.max_retry_backoff_ms = 30_000;
        let launcher = ScriptLauncher::new().captures(&["exit 1"]);
        let mut h = Harness::new(&config, sun(), launcher);

        h.supervisor.step(at(12, 0)).await;

        let sos = h.sos.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            sos.cancel();
        });

        let started = Instant::now();
        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::ShuttingDown
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(
            h.sink
                .events()
                .iter()
                .any(|e| matches!(e, SupervisorEvent::Stopped { .. }))
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_both_processes() {
        let mut h = Harness::new(&test_config(), sun(), ScriptLauncher::new());
        h.run_until_running(at(12, 0)).await;
        h.sink.clear();

        h.sos.cancel();
        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::ShuttingDown
        );
        assert!(h.supervisor.session().is_none());

        let stopped: Vec<(ProcessRole, Termination)> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SupervisorEvent::ProcessTerminated { role, outcome, .. } => Some((role, outcome)),
                _ => None,
            })
            .collect();
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped[0].0, ProcessRole::Capture);
        assert_eq!(stopped[1].0, ProcessRole::Publish);
        assert!(stopped.iter().all(|(_, outcome)| *outcome != Termination::Forced));

        // Terminal: further steps change nothing
        assert_eq!(
            h.supervisor.step(at(12, 2)).await,
            SupervisorState::ShuttingDown
        );
        assert_eq!(
            h.sink.transitions(),
            vec![(SupervisorState::Running, SupervisorState::ShuttingDown)]
        );
    }

    #[tokio::test]
    async fn test_stalled_capture_is_restarted() {
        let mut config = test_config();
        config.supervisor.stall_timeout_secs = 1;
        let mut h = Harness::new(&config, sun(), ScriptLauncher::new());
        h.run_until_running(at(12, 0)).await;
        let (_, publish_before) = h.handles();

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RestartingCapture
        );
        assert!(matches!(
            h.triggers().as_slice(),
            [Trigger::CaptureStalled(_)]
        ));
        assert_eq!(h.supervisor.step(at(12, 1)).await, SupervisorState::Running);
        assert_eq!(h.handles().1, publish_before);
    }

    #[tokio::test]
    async fn test_publish_dying_during_build_tears_down_and_retries() {
        let launcher = ScriptLauncher::new().publishers(&["exit 1"]);
        let mut h = Harness::new(&test_config(), sun(), launcher);

        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert_eq!(
            h.supervisor.step(at(12, 0)).await,
            SupervisorState::BuildingPipeline
        );
        assert!(h.supervisor.session().is_none());

        let events = h.sink.events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SupervisorEvent::BuildFailed { attempt: 1, .. }))
        );
        let stopped: Vec<(ProcessRole, Termination)> = events
            .into_iter()
            .filter_map(|e| match e {
                SupervisorEvent::ProcessTerminated { role, outcome, .. } => Some((role, outcome)),
                _ => None,
            })
            .collect();
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped[0].0, ProcessRole::Capture);
        assert!(matches!(stopped[0].1, Termination::Graceful(_)));
        assert_eq!(stopped[1].0, ProcessRole::Publish);
        assert!(matches!(stopped[1].1, Termination::AlreadyExited(_)));

        assert_eq!(h.supervisor.step(at(12, 0)).await, SupervisorState::Running);
        assert_eq!(h.launched(ProcessRole::Capture).len(), 2);
        assert_eq!(h.launched(ProcessRole::Publish).len(), 2);
        assert_eq!(h.supervisor.health().failed_builds(), 1);
    }

    #[tokio::test]
    async fn test_replacement_capture_failure_rebuilds() {
        let launcher = ScriptLauncher::new().captures(&["sleep 0.4", "exit 2"]);
        let mut h = Harness::new(&test_config(), sun(), launcher);
        h.run_until_running(at(12, 0)).await;
        let (_, publish_before) = h.handles();

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RestartingCapture
        );
        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::RebuildingForModeChange
        );
        assert!(matches!(
            h.triggers().as_slice(),
            [Trigger::CaptureExited(_), Trigger::CaptureRestartFailed(_)]
        ));
        assert_eq!(h.supervisor.health().capture_restarts(), 0);

        assert_eq!(
            h.supervisor.step(at(12, 1)).await,
            SupervisorState::BuildingPipeline
        );
        assert!(h.supervisor.session().is_none());
        assert_eq!(h.supervisor.health().pipeline_rebuilds(), 1);

        assert_eq!(h.supervisor.step(at(12, 1)).await, SupervisorState::Running);
        assert_ne!(h.handles().1, publish_before);
        assert_eq!(h.launched(ProcessRole::Capture).len(), 3);
        assert_eq!(h.launched(ProcessRole::Publish).len(), 2);
        assert!(h.sink.transitions().contains(&(
            SupervisorState::RestartingCapture,
            SupervisorState::RebuildingForModeChange
        )));
    }

    #[tokio::test]
    async fn test_stop_interrupts_readiness_wait() {
        let mut config = test_config();
        config.supervisor.night_warmup_ms = 10_000;
        config.supervisor.ready_timeout_ms = 20_000;
        let mut h = Harness::new(&config, sun(), ScriptLauncher::new());

        h.supervisor.step(at(5, 0)).await;

        let sos = h.sos.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            sos.cancel();
        });

        let started = Instant::now();
        assert_eq!(
            h.supervisor.step(at(5, 0)).await,
            SupervisorState::ShuttingDown
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(h.supervisor.session().is_none());
        assert!(h.launched(ProcessRole::Publish).is_empty());

        let events = h.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            SupervisorEvent::ProcessTerminated {
                role: ProcessRole::Capture,
                ..
            }
        )));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SupervisorEvent::BuildFailed { .. }))
        );
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SupervisorEvent::Stopped { .. }))
        );
    }

    #[tokio::test]
    async fn test_stale_schedule_keeps_streaming() {
        let source = sun();
        source.failing.store(true, Ordering::SeqCst);
        let mut h = Harness::new(&test_config(), source, ScriptLauncher::new());

        h.run_until_running(at(12, 0)).await;

        assert!(
            h.sink
                .events()
                .iter()
                .any(|e| matches!(e, SupervisorEvent::ScheduleStale { .. }))
        );
        // Fallback window still classifies noon as day
        assert_eq!(h.supervisor.session().unwrap().mode, Mode::Day);
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let h = Harness::new(&test_config(), sun(), ScriptLauncher::new());
        let sos = h.sos.clone();
        let sink = h.sink.clone();

        let task = tokio::spawn(h.supervisor.run());
        tokio::time::sleep(Duration::from_millis(600)).await;
        sos.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();

        let transitions = sink.transitions();
        assert_eq!(
            transitions.last().map(|(_, to)| *to),
            Some(SupervisorState::ShuttingDown)
        );
        assert!(transitions.contains(&(SupervisorState::BuildingPipeline, SupervisorState::Running)));
    }
}
