//! Command transmission and response correlation.
//!
//! Multiplexes commands over a device handle, matches responses to pending
//! commands by sequence id, and drains the interleaved stream of device log
//! lines. Transport failures surface as error values; nothing here panics
//! or blocks without a deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::{READ_DRAIN_TIMEOUT_MS, RESPONSE_POLL_INTERVAL, RESPONSE_TIMEOUT};
use crate::error::{HarnessError, Result};
use crate::frame::{classify_report, Command, CommandKind, ReadEvent, Response};
use crate::monitor::{Direction, RealTimeMonitor};
use crate::poll::poll_until;
use crate::registry::DeviceRegistry;

/// Device log lines retained per device for debugging.
const LOG_BUFFER_CAP: usize = 500;

/// A sent command whose response has not yet been matched.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Kind of the outstanding command.
    pub kind: CommandKind,
    /// Monotonic send instant, for latency accounting.
    pub sent_at: Instant,
    /// Correlation id minted by the monitor, if one is attached.
    pub correlation_id: Option<String>,
}

struct ClientState {
    sequence: u8,
    pending: HashMap<String, HashMap<u8, PendingCommand>>,
    log_buffer: HashMap<String, VecDeque<String>>,
}

/// Handles command transmission and response processing for device
/// communication.
pub struct CommandClient {
    registry: Arc<DeviceRegistry>,
    monitor: Option<Arc<RealTimeMonitor>>,
    response_timeout: Duration,
    state: Mutex<ClientState>,
}

impl CommandClient {
    /// Create a client with the default response timeout.
    pub fn new(registry: Arc<DeviceRegistry>, monitor: Option<Arc<RealTimeMonitor>>) -> Self {
        Self::with_timeout(registry, monitor, RESPONSE_TIMEOUT)
    }

    /// Create a client with an explicit response timeout.
    pub fn with_timeout(
        registry: Arc<DeviceRegistry>,
        monitor: Option<Arc<RealTimeMonitor>>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            monitor,
            response_timeout,
            state: Mutex::new(ClientState {
                sequence: 0,
                pending: HashMap::new(),
                log_buffer: HashMap::new(),
            }),
        }
    }

    /// Send a command to a device.
    ///
    /// Assigns a sequence id unique among the device's pending commands,
    /// records the command as pending, and writes the 64-byte report. On a
    /// short write or bus error the pending entry is rolled back.
    ///
    /// Returns the assigned sequence id.
    pub fn send(&self, serial: &str, command: &Command) -> Result<u8> {
        let handle = self
            .registry
            .handle(serial)
            .ok_or_else(|| HarnessError::NotConnected {
                serial: serial.to_string(),
            })?;

        let sequence = {
            let mut state = self.state.lock().expect("client lock poisoned");
            let sequence = next_free_sequence(&mut state, serial);
            state.pending.entry(serial.to_string()).or_default().insert(
                sequence,
                PendingCommand {
                    kind: command.kind,
                    sent_at: Instant::now(),
                    correlation_id: None,
                },
            );
            sequence
        };

        let mut wire_command = command.clone();
        wire_command.sequence = sequence;
        let report = wire_command.encode();

        // The write happens outside the client lock.
        let write_result = handle.write_report(&report).and_then(|written| {
            if written == report.len() {
                Ok(())
            } else {
                Err(HarnessError::ShortWrite {
                    written,
                    expected: report.len(),
                })
            }
        });

        if let Err(e) = write_result {
            let mut state = self.state.lock().expect("client lock poisoned");
            if let Some(pending) = state.pending.get_mut(serial) {
                pending.remove(&sequence);
            }
            error!(serial, "Error sending command: {e}");
            return Err(e);
        }

        debug!(serial, sequence, "Sent command {}", command.kind.name());

        if let Some(monitor) = &self.monitor {
            let correlation_id = monitor.log_command_sent(serial, &wire_command);
            let mut state = self.state.lock().expect("client lock poisoned");
            if let Some(entry) = state
                .pending
                .get_mut(serial)
                .and_then(|pending| pending.get_mut(&sequence))
            {
                entry.correlation_id = Some(correlation_id);
            }
        }

        Ok(sequence)
    }

    /// Drain the device's input stream and return newly decoded responses.
    ///
    /// Non-blocking: reads until the handle reports no data. Log lines are
    /// buffered and forwarded to the monitor; responses are matched against
    /// pending commands and evict their entry. A response with no pending
    /// command is discarded (at most one response per sequence id is ever
    /// consumed). I/O errors end the drain and yield what was decoded so
    /// far.
    pub fn read(&self, serial: &str) -> Vec<Response> {
        let Some(handle) = self.registry.handle(serial) else {
            return Vec::new();
        };

        let mut responses = Vec::new();
        loop {
            let report = match handle.read_report(READ_DRAIN_TIMEOUT_MS) {
                Ok(Some(report)) => report,
                Ok(None) => break,
                Err(e) => {
                    error!(serial, "Error reading responses: {e}");
                    break;
                }
            };

            match classify_report(&report) {
                ReadEvent::Response(response) => {
                    let matched = {
                        let mut state = self.state.lock().expect("client lock poisoned");
                        state
                            .pending
                            .get_mut(serial)
                            .and_then(|pending| pending.remove(&response.sequence))
                    };
                    match matched {
                        Some(entry) => {
                            if let Some(monitor) = &self.monitor {
                                monitor.log_response_received(
                                    serial,
                                    &response,
                                    entry.correlation_id.as_deref(),
                                );
                            }
                            responses.push(response);
                        }
                        None => {
                            debug!(
                                serial,
                                sequence = response.sequence,
                                "Discarding response with no pending command"
                            );
                        }
                    }
                }
                ReadEvent::LogLine(line) => {
                    {
                        let mut state = self.state.lock().expect("client lock poisoned");
                        let buffer = state.log_buffer.entry(serial.to_string()).or_default();
                        if buffer.len() == LOG_BUFFER_CAP {
                            buffer.pop_front();
                        }
                        buffer.push_back(line.clone());
                    }
                    if let Some(monitor) = &self.monitor {
                        monitor.log_device_communication(
                            serial,
                            &line,
                            Direction::Received,
                            Some(&report),
                        );
                    }
                }
                ReadEvent::Empty => {}
            }
        }

        responses
    }

    /// Wait for the response to a specific command.
    ///
    /// Polls the read pump at a short interval until a response with the
    /// matching sequence id arrives or the deadline expires.
    pub fn wait_for_response(
        &self,
        serial: &str,
        sequence: u8,
        timeout: Option<Duration>,
    ) -> Option<Response> {
        let timeout = timeout.unwrap_or(self.response_timeout);
        let deadline = Instant::now() + timeout;
        let mut matched = None;

        poll_until(RESPONSE_POLL_INTERVAL, deadline, || {
            for response in self.read(serial) {
                if response.sequence == sequence {
                    matched = Some(response);
                    return true;
                }
                // Responses to other commands were already consumed above.
            }
            false
        });

        if matched.is_none() {
            warn!(serial, sequence, "Timeout waiting for response");
            let mut state = self.state.lock().expect("client lock poisoned");
            if let Some(pending) = state.pending.get_mut(serial) {
                pending.remove(&sequence);
            }
        }
        matched
    }

    /// Send a command and wait for its response.
    ///
    /// Returns `None` on send failure or response timeout; the failure is
    /// logged, never propagated.
    pub fn send_and_wait(
        &self,
        serial: &str,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Option<Response> {
        match self.send(serial, command) {
            Ok(sequence) => self.wait_for_response(serial, sequence, timeout),
            Err(e) => {
                error!(serial, "send_and_wait failed: {e}");
                None
            }
        }
    }

    /// Commands awaiting responses for one device.
    pub fn pending_commands(&self, serial: &str) -> Vec<(u8, CommandKind)> {
        let state = self.state.lock().expect("client lock poisoned");
        state
            .pending
            .get(serial)
            .map(|pending| pending.iter().map(|(seq, cmd)| (*seq, cmd.kind)).collect())
            .unwrap_or_default()
    }

    /// Drop all pending command tracking (cleanup between runs).
    pub fn clear_pending(&self) {
        let mut state = self.state.lock().expect("client lock poisoned");
        state.pending.clear();
    }

    /// Most recent buffered device log lines.
    pub fn buffered_logs(&self, serial: &str, max: usize) -> Vec<String> {
        let state = self.state.lock().expect("client lock poisoned");
        state
            .log_buffer
            .get(serial)
            .map(|buffer| buffer.iter().rev().take(max).rev().cloned().collect())
            .unwrap_or_default()
    }
}

/// Pick the next sequence id, skipping ids still pending for this device.
fn next_free_sequence(state: &mut ClientState, serial: &str) -> u8 {
    let in_use = state.pending.get(serial);
    let mut candidate = state.sequence;
    for _ in 0..=u8::MAX {
        candidate = candidate.wrapping_add(1);
        let taken = in_use.map(|p| p.contains_key(&candidate)).unwrap_or(false);
        if !taken {
            break;
        }
    }
    state.sequence = candidate;
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ResponseStatus, TestKind};
    use crate::test_helpers::mock_bus::{MockBus, Reply, ScriptedDevice};

    fn connected_client(device: ScriptedDevice) -> (Arc<DeviceRegistry>, CommandClient) {
        let bus = Arc::new(MockBus::new());
        bus.add_device(device);
        let registry = Arc::new(DeviceRegistry::with_timing(
            bus,
            Duration::from_secs(1),
            Duration::from_millis(5),
        ));
        registry.discover();
        assert!(registry.connect("DEV001"));
        let client =
            CommandClient::with_timeout(registry.clone(), None, Duration::from_millis(300));
        (registry, client)
    }

    #[test]
    fn test_send_assigns_sequence_and_tracks_pending() {
        let device = ScriptedDevice::connected("DEV001");
        device.script(CommandKind::SystemStateQuery, Reply::Ignore);
        let (_registry, client) = connected_client(device);

        let seq = client
            .send("DEV001", &Command::system_state_query("system_health"))
            .expect("send should succeed");
        assert_eq!(seq, 1);
        let pending = client.pending_commands("DEV001");
        assert_eq!(pending, vec![(1, CommandKind::SystemStateQuery)]);
    }

    #[test]
    fn test_send_to_unconnected_device_fails() {
        let (registry, client) = connected_client(ScriptedDevice::connected("DEV001"));
        registry.disconnect("DEV001");
        assert!(matches!(
            client.send("DEV001", &Command::configuration_query()),
            Err(HarnessError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_short_write_rolls_back_pending() {
        let device = ScriptedDevice::connected("DEV001");
        device.fail_writes_short();
        let (_registry, client) = connected_client(device);

        let result = client.send("DEV001", &Command::configuration_query());
        assert!(matches!(result, Err(HarnessError::ShortWrite { .. })));
        assert!(client.pending_commands("DEV001").is_empty());
    }

    #[test]
    fn test_send_and_wait_round_trip() {
        let device = ScriptedDevice::connected("DEV001");
        device.script(
            CommandKind::ExecuteTest,
            Reply::status(ResponseStatus::Success),
        );
        let (_registry, client) = connected_client(device);

        let response = client
            .send_and_wait(
                "DEV001",
                &Command::execute_test(TestKind::UsbCommunicationTest, serde_json::json!({})),
                None,
            )
            .expect("response expected");
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(client.pending_commands("DEV001").is_empty());
    }

    #[test]
    fn test_wait_for_response_times_out_and_clears_pending() {
        let device = ScriptedDevice::connected("DEV001");
        device.script(CommandKind::ExecuteTest, Reply::Ignore);
        let (_registry, client) = connected_client(device);

        let response = client.send_and_wait(
            "DEV001",
            &Command::execute_test(TestKind::LedFunctionality, serde_json::json!({})),
            Some(Duration::from_millis(50)),
        );
        assert!(response.is_none());
        assert!(client.pending_commands("DEV001").is_empty());
    }

    #[test]
    fn test_unmatched_response_is_discarded() {
        let device = ScriptedDevice::connected("DEV001");
        // Device emits a response for a sequence id that was never sent.
        device.inject_line(r#"TEST_RESPONSE:{"command_id":200,"status":0}"#);
        let (_registry, client) = connected_client(device);

        assert!(client.read("DEV001").is_empty());
    }

    #[test]
    fn test_log_lines_are_buffered_not_returned() {
        let device = ScriptedDevice::connected("DEV001");
        device.inject_line("LOG: pEMF task started");
        device.inject_line("LOG: battery monitor online");
        let (_registry, client) = connected_client(device);

        assert!(client.read("DEV001").is_empty());
        let logs = client.buffered_logs("DEV001", 10);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1], "LOG: battery monitor online");
    }

    #[test]
    fn test_sequence_skips_pending_ids() {
        let device = ScriptedDevice::connected("DEV001");
        device.script(CommandKind::SystemStateQuery, Reply::Ignore);
        let (_registry, client) = connected_client(device);

        let first = client
            .send("DEV001", &Command::system_state_query("a"))
            .unwrap();
        let second = client
            .send("DEV001", &Command::system_state_query("b"))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(client.pending_commands("DEV001").len(), 2);
    }
}
