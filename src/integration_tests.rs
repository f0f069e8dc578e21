//! Integration tests for the session, dispatcher and publisher together
//!
//! A scripted transport records every command it sees so the tests can
//! check cadence, ordering and the single-command-on-the-wire rule.

#[cfg(test)]
mod tests {
    use crate::config::{Config, LoopCount};
    use crate::connection::Connector;
    use crate::dataframe::tests::{sample_7d, sample_80};
    use crate::dataframe::DataFrame;
    use crate::dispatcher::{CommandDispatcher, UiAction};
    use crate::error::{ConnectError, TransactionError};
    use crate::mems::{Command, CommandResult, EcuId, EcuResponse, EcuTransport};
    use crate::publisher::{ConnectionStatus, OutboundMessage, Publisher};
    use crate::session::{Session, SessionHandle, SessionOutcome, SessionRequest, SessionState};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    // ========================================================================
    // SCRIPTED TRANSPORT
    // ========================================================================

    #[derive(Default)]
    struct Trace {
        sent: Vec<(Instant, Command)>,
        in_flight: usize,
        max_in_flight: usize,
    }

    #[derive(Default)]
    struct Script {
        /// Every transaction times out while set
        failing: bool,
        rejected: HashSet<Command>,
        latency: Duration,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        trace: Arc<Mutex<Trace>>,
        script: Arc<Mutex<Script>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<(Instant, Command)> {
            self.trace.lock().unwrap().sent.clone()
        }

        fn sent_after(&self, start: Instant) -> Vec<(Instant, Command)> {
            self.sent().into_iter().filter(|(at, _)| *at >= start).collect()
        }

        fn count(&self, command: Command) -> usize {
            self.sent().iter().filter(|(_, c)| *c == command).count()
        }

        fn max_in_flight(&self) -> usize {
            self.trace.lock().unwrap().max_in_flight
        }

        fn set_failing(&self, failing: bool) {
            self.script.lock().unwrap().failing = failing;
        }

        fn reject(&self, command: Command) {
            self.script.lock().unwrap().rejected.insert(command);
        }

        fn set_latency(&self, latency: Duration) {
            self.script.lock().unwrap().latency = latency;
        }
    }

    struct ScriptedTransport {
        recorder: Recorder,
    }

    impl EcuTransport for ScriptedTransport {
        fn initialise(&mut self) -> Result<EcuId, ConnectError> {
            Ok(EcuId([0x99, 0x00, 0x02, 0x03]))
        }

        fn transact(&mut self, command: Command) -> Result<EcuResponse, TransactionError> {
            {
                let mut trace = self.recorder.trace.lock().unwrap();
                trace.sent.push((Instant::now(), command));
                trace.in_flight += 1;
                trace.max_in_flight = trace.max_in_flight.max(trace.in_flight);
            }

            let (latency, failing, rejected) = {
                let script = self.recorder.script.lock().unwrap();
                (script.latency, script.failing, script.rejected.contains(&command))
            };
            std::thread::sleep(latency);
            self.recorder.trace.lock().unwrap().in_flight -= 1;

            if failing {
                return Err(TransactionError::Timeout {
                    opcode: command.opcode(),
                });
            }
            if rejected {
                return Err(TransactionError::CommandRejected {
                    opcode: command.opcode(),
                    reply: vec![0x00, 0x00],
                });
            }
            if command.is_data_poll() {
                return Ok(EcuResponse::Frame(
                    DataFrame::decode(&sample_80(), &sample_7d()).unwrap(),
                ));
            }
            Ok(EcuResponse::Ack(CommandResult::ok(command, 0x00)))
        }
    }

    struct ScriptedConnector {
        recorder: Recorder,
    }

    impl Connector for ScriptedConnector {
        fn open(&self, _config: &Config) -> Result<Box<dyn EcuTransport>, ConnectError> {
            Ok(Box::new(ScriptedTransport {
                recorder: self.recorder.clone(),
            }))
        }
    }

    // ========================================================================
    // HARNESS
    // ========================================================================

    struct Harness {
        handle: SessionHandle,
        dispatcher: CommandDispatcher,
        ui_rx: mpsc::Receiver<OutboundMessage>,
        session: JoinHandle<SessionOutcome>,
        recorder: Recorder,
    }

    impl Harness {
        fn start(config: Config) -> Self {
            Self::start_with_ui_depth(config, 256)
        }

        fn start_with_ui_depth(config: Config, depth: usize) -> Self {
            let recorder = Recorder::default();
            let (ui_tx, ui_rx) = mpsc::channel(depth);
            let publisher = Publisher::new(ui_tx, None);
            let connector = Arc::new(ScriptedConnector {
                recorder: recorder.clone(),
            });
            let (session, handle) = Session::new(config, connector, publisher.clone());
            let dispatcher = CommandDispatcher::new(handle.clone(), publisher);

            Self {
                handle,
                dispatcher,
                ui_rx,
                session: tokio::spawn(session.run()),
                recorder,
            }
        }

        fn send(&self, action: &str) {
            self.dispatcher.apply(&UiAction::new(action));
        }

        fn state(&self) -> SessionState {
            self.handle.control.state()
        }

        async fn next(&mut self) -> OutboundMessage {
            timeout(Duration::from_secs(3), self.ui_rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("publisher dropped")
        }

        async fn next_status(&mut self) -> ConnectionStatus {
            loop {
                if let OutboundMessage::ConnectionStatus(status) = self.next().await {
                    return status;
                }
            }
        }

        async fn next_frame(&mut self) -> DataFrame {
            loop {
                if let OutboundMessage::Data(frame) = self.next().await {
                    return frame;
                }
            }
        }

        async fn next_result(&mut self) -> CommandResult {
            loop {
                if let OutboundMessage::EcuResponse(result) = self.next().await {
                    return result;
                }
            }
        }

        async fn outcome(self) -> SessionOutcome {
            timeout(Duration::from_secs(3), self.session)
                .await
                .expect("session did not finish")
                .unwrap()
        }
    }

    fn fast_config() -> Config {
        Config {
            port: "scripted".to_string(),
            data_interval_ms: 50,
            heartbeat_interval_ms: 200,
            response_timeout_ms: 500,
            handshake_timeout_ms: 1000,
            connect_on_start: true,
            ..Config::default()
        }
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    #[tokio::test]
    async fn test_three_frames_then_disconnect() {
        let config = Config {
            data_interval_ms: 500,
            loop_count: LoopCount::new(3),
            ..fast_config()
        };
        let mut h = Harness::start(config);

        let status = h.next_status().await;
        assert!(status.connected && status.initialised);

        for _ in 0..3 {
            h.next_frame().await;
        }
        let status = h.next_status().await;
        assert!(!status.connected);

        let polls: Vec<Instant> = h
            .recorder
            .sent()
            .into_iter()
            .filter(|(_, c)| *c == Command::ReadDataFrame)
            .map(|(at, _)| at)
            .collect();
        assert_eq!(polls.len(), 3);
        for pair in polls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }

        assert_eq!(h.state(), SessionState::Disconnected);
        assert_eq!(h.outcome().await, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_pause_sends_only_heartbeats() {
        let mut h = Harness::start(fast_config());
        h.next_status().await;
        h.next_frame().await;

        h.send("pause");
        let paused_at = Instant::now();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.state(), SessionState::Paused);

        // Allow a poll that was already on its way when the flag flipped
        let during = h.recorder.sent_after(paused_at + Duration::from_millis(100));
        assert!(during.len() >= 3, "expected heartbeats, got {:?}", during);
        assert!(during.iter().all(|(_, c)| *c == Command::Heartbeat));
        for pair in during.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(200));
        }

        h.send("resume");
        let resumed_at = Instant::now();
        h.next_frame().await;
        assert!(resumed_at.elapsed() < Duration::from_millis(500));
        assert_eq!(h.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_loop_count_ignores_pause() {
        let config = Config {
            loop_count: LoopCount::new(5),
            ..fast_config()
        };
        let mut h = Harness::start(config);
        h.next_status().await;
        h.next_frame().await;
        h.next_frame().await;

        h.send("pause");
        sleep(Duration::from_millis(500)).await;
        h.send("resume");

        let mut frames = 2;
        loop {
            match h.next().await {
                OutboundMessage::Data(_) => frames += 1,
                OutboundMessage::ConnectionStatus(status) => {
                    assert!(!status.connected);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(frames, 5);
        assert_eq!(h.recorder.count(Command::ReadDataFrame), 5);
        assert!(h.recorder.count(Command::Heartbeat) >= 1);
        assert_eq!(h.outcome().await, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_command_served_before_next_poll() {
        let config = Config {
            data_interval_ms: 300,
            ..fast_config()
        };
        let mut h = Harness::start(config);
        h.next_status().await;
        h.next_frame().await;

        h.send("reset-ecu");
        match h.next().await {
            OutboundMessage::EcuResponse(result) => {
                assert_eq!(result.command, Command::ResetEcu);
                assert!(result.success);
            }
            other => panic!("expected the reset result first, got {:?}", other),
        }

        let sent: Vec<Command> = h.recorder.sent().into_iter().map(|(_, c)| c).collect();
        assert_eq!(sent, vec![Command::ReadDataFrame, Command::ResetEcu]);
    }

    // ========================================================================
    // FAILURES
    // ========================================================================

    #[tokio::test]
    async fn test_failure_reports_lost_once() {
        let mut h = Harness::start(fast_config());
        h.next_status().await;
        h.next_frame().await;

        h.recorder.set_failing(true);
        let status = h.next_status().await;
        assert!(!status.connected);
        assert!(status.error.is_some());
        assert_eq!(h.state(), SessionState::Disconnected);

        let sent = h.recorder.sent().len();
        assert!(timeout(Duration::from_millis(500), h.ui_rx.recv()).await.is_err());
        assert_eq!(h.recorder.sent().len(), sent, "traffic after the link was lost");

        // Only an explicit connect brings it back
        h.recorder.set_failing(false);
        h.send("connect");
        assert!(h.next_status().await.connected);
        h.next_frame().await;
        assert_eq!(h.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_timed_out_exchange() {
        let config = Config {
            response_timeout_ms: 200,
            ..fast_config()
        };
        let mut h = Harness::start(config);
        h.next_status().await;
        h.next_frame().await;

        // The poll outlives its timeout and keeps the port busy
        h.recorder.set_latency(Duration::from_millis(800));
        let status = h.next_status().await;
        assert!(!status.connected);
        assert!(status.error.is_some());

        h.recorder.set_latency(Duration::ZERO);
        h.send("connect");
        assert!(h.next_status().await.connected);
        h.next_frame().await;

        assert_eq!(h.recorder.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_slow_replies_expire_liveness() {
        let config = Config {
            response_timeout_ms: 1000,
            liveness_timeout_ms: 200,
            ..fast_config()
        };
        let mut h = Harness::start(config);
        h.next_status().await;
        h.next_frame().await;

        // Every reply still arrives, just later than the liveness window
        h.recorder.set_latency(Duration::from_millis(300));
        let status = h.next_status().await;
        assert!(!status.connected);
        assert!(status.error.unwrap().contains("liveness"));
        assert_eq!(h.state(), SessionState::Disconnected);
        assert_eq!(h.recorder.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_rejected_command_keeps_cycle_running() {
        let mut h = Harness::start(fast_config());
        h.next_status().await;
        h.recorder.reject(Command::ClearFaults);

        h.send("clear-faults");
        let result = h.next_result().await;
        assert_eq!(result.command, Command::ClearFaults);
        assert!(!result.success);
        assert!(result.error.is_some());

        h.next_frame().await;
        assert_eq!(h.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_command_while_disconnected() {
        let config = Config {
            connect_on_start: false,
            ..fast_config()
        };
        let mut h = Harness::start(config);

        h.send("increase-idle-speed");
        let result = h.next_result().await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("not connected"));
        assert!(h.recorder.sent().is_empty());
        assert_eq!(h.state(), SessionState::Disconnected);
    }

    // ========================================================================
    // CONCURRENCY
    // ========================================================================

    #[tokio::test]
    async fn test_one_command_on_the_wire() {
        let config = Config {
            data_interval_ms: 10,
            ..fast_config()
        };
        let mut h = Harness::start(config);
        h.recorder.set_latency(Duration::from_millis(15));
        h.next_status().await;

        let actions = [
            "increase-idle-speed",
            "decrease-idle-speed",
            "increase-idle-hot",
            "decrease-idle-hot",
            "increase-fuel-trim",
            "decrease-fuel-trim",
            "increase-ignition-advance",
            "decrease-ignition-advance",
        ];
        for action in actions {
            h.send(action);
        }

        let mut results = 0;
        while results < actions.len() {
            if let OutboundMessage::EcuResponse(result) = h.next().await {
                assert!(result.success);
                results += 1;
            }
        }

        assert_eq!(h.recorder.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_slow_ui_does_not_stall_polling() {
        let config = Config {
            data_interval_ms: 20,
            loop_count: LoopCount::new(5),
            ..fast_config()
        };
        // Nobody reads the UI queue
        let h = Harness::start_with_ui_depth(config, 1);
        let recorder = h.recorder.clone();

        assert_eq!(h.outcome().await, SessionOutcome::Completed);
        assert_eq!(recorder.count(Command::ReadDataFrame), 5);
    }

    // ========================================================================
    // CONTROLS
    // ========================================================================

    #[tokio::test]
    async fn test_shutdown_request() {
        let mut h = Harness::start(fast_config());
        h.next_status().await;

        h.handle.requests.send(SessionRequest::Shutdown).await.unwrap();
        let status = h.next_status().await;
        assert!(!status.connected);
        assert_eq!(h.outcome().await, SessionOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_connect_to_another_port() {
        let mut h = Harness::start(fast_config());
        assert!(h.next_status().await.connected);

        h.dispatcher.apply(&UiAction::with_data(
            "connect",
            serde_json::json!({ "port": "/dev/ttyUSB1" }),
        ));
        assert!(h.next_status().await.connected);

        h.send("read-config");
        loop {
            if let OutboundMessage::Config(config) = h.next().await {
                assert_eq!(config.port, "/dev/ttyUSB1");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_action_changes_nothing() {
        let mut h = Harness::start(fast_config());
        h.next_status().await;
        h.next_frame().await;

        h.send("launch-missiles");
        h.next_frame().await;
        assert_eq!(h.state(), SessionState::Connected);
        assert!(h
            .recorder
            .sent()
            .iter()
            .all(|(_, c)| *c == Command::ReadDataFrame));
    }
}
