//! Line-oriented host for a BLE session.
//!
//! Maps typed commands onto [`SessionHandle`] calls and renders
//! [`SessionEvent`]s as status lines.

use crate::domain::models::{PeripheralHandle, SessionEvent, SessionState};
use crate::infrastructure::bluetooth::SessionHandle;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const HELP: &str = "commands: connect | read | write <text> | refresh | cancel | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    fn new(severity: MessageSeverity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            MessageSeverity::Info => "  ",
            MessageSeverity::Success => "ok",
            MessageSeverity::Warning => "!!",
            MessageSeverity::Error => "xx",
        };
        write!(f, "[{}] {}", tag, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Read,
    Write(String),
    Refresh,
    Cancel,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: write <text>")]
    MissingText,
}

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "connect" | "start" => Ok(Self::Connect),
            "read" => Ok(Self::Read),
            "write" if rest.is_empty() => Err(CommandError::MissingText),
            "write" => Ok(Self::Write(rest.to_string())),
            "refresh" => Ok(Self::Refresh),
            "cancel" => Ok(Self::Cancel),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(word.to_string())),
        }
    }
}

/// What the host loop should do after a line of input.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Reply(StatusMessage),
    Quit,
}

pub struct ConsoleHost {
    session: SessionHandle,
    status: SessionState,
    peripheral: Option<PeripheralHandle>,
    last_read: Option<String>,
    last_notification: Option<String>,
}

impl ConsoleHost {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            status: SessionState::Idle,
            peripheral: None,
            last_read: None,
            last_notification: None,
        }
    }

    pub fn on_connect_requested(&self) {
        self.session.start();
    }

    pub fn on_read_requested(&self) {
        self.session.read();
    }

    pub fn on_write_requested(&self, text: &str) {
        self.session.write(text.as_bytes().to_vec());
    }

    pub fn on_refresh_requested(&self) {
        self.session.refresh();
    }

    pub fn on_cancel_requested(&self) {
        self.session.cancel();
    }

    /// Connection status label.
    pub fn status_text(&self) -> String {
        self.status.to_string()
    }

    pub fn last_read(&self) -> Option<&str> {
        self.last_read.as_deref()
    }

    pub fn last_notification(&self) -> Option<&str> {
        self.last_notification.as_deref()
    }

    pub fn handle_line(&self, line: &str) -> LineOutcome {
        if line.trim().is_empty() {
            return LineOutcome::Continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                return LineOutcome::Reply(StatusMessage::new(
                    MessageSeverity::Warning,
                    format!("{} ({})", e, HELP),
                ))
            }
        };

        debug!("Console command: {:?}", command);
        match command {
            ConsoleCommand::Connect => self.on_connect_requested(),
            ConsoleCommand::Read => self.on_read_requested(),
            ConsoleCommand::Write(text) => self.on_write_requested(&text),
            ConsoleCommand::Refresh => self.on_refresh_requested(),
            ConsoleCommand::Cancel => self.on_cancel_requested(),
            ConsoleCommand::Help => {
                return LineOutcome::Reply(StatusMessage::new(MessageSeverity::Info, HELP))
            }
            ConsoleCommand::Quit => return LineOutcome::Quit,
        }
        LineOutcome::Continue
    }

    /// Fold a session event into the view and render it.
    pub fn handle_event(&mut self, event: SessionEvent) -> StatusMessage {
        match event {
            SessionEvent::StateChanged(state) => {
                let severity = match state {
                    SessionState::Ready => MessageSeverity::Success,
                    SessionState::Reconnecting => MessageSeverity::Warning,
                    SessionState::Failed(_) => MessageSeverity::Error,
                    _ => MessageSeverity::Info,
                };
                self.status = state;
                let message = match (&self.status, &self.peripheral) {
                    (SessionState::Ready, Some(peripheral)) => {
                        format!("Status: {} ({})", self.status, peripheral.name)
                    }
                    _ => format!("Status: {}", self.status),
                };
                StatusMessage::new(severity, message)
            }
            SessionEvent::PeripheralSelected(peripheral) => {
                let message = format!(
                    "Found {} ({}, rssi {})",
                    peripheral.name, peripheral.id, peripheral.rssi
                );
                self.peripheral = Some(peripheral);
                StatusMessage::new(MessageSeverity::Info, message)
            }
            SessionEvent::ValueRead(value) => {
                let text = value.as_text();
                let message = format!("Value: {}", text);
                self.last_read = Some(text);
                StatusMessage::new(MessageSeverity::Success, message)
            }
            SessionEvent::Notification(value) => {
                let text = value.as_text();
                let message = format!("Notification: {}", text);
                self.last_notification = Some(text);
                StatusMessage::new(MessageSeverity::Info, message)
            }
            SessionEvent::WriteCompleted => {
                StatusMessage::new(MessageSeverity::Success, "Write acknowledged")
            }
            SessionEvent::OperationFailed { operation, error } => StatusMessage::new(
                MessageSeverity::Error,
                format!("{:?} failed: {}", operation, error),
            ),
        }
    }

    /// Serve `input` until `quit` or end of input, then shut the session down.
    pub async fn run<R, W>(
        mut self,
        input: R,
        mut output: W,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        write_line(&mut output, &StatusMessage::new(MessageSeverity::Info, HELP)).await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Console input closed");
                        break;
                    };
                    match self.handle_line(&line) {
                        LineOutcome::Continue => {}
                        LineOutcome::Reply(message) => write_line(&mut output, &message).await?,
                        LineOutcome::Quit => break,
                    }
                }
                Some(event) = events.recv() => {
                    let message = self.handle_event(event);
                    write_line(&mut output, &message).await?;
                }
            }
        }

        self.session.shutdown().await;
        Ok(())
    }
}

async fn write_line<W>(output: &mut W, message: &StatusMessage) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(format!("{}\n", message).as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{BleError, OperationError};
    use crate::domain::models::{AdapterState, CharacteristicValue, Operation, PeripheralId};
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::infrastructure::bluetooth::{
        SessionConfig, SimulatedBackend, SimulatedPeripheral,
    };
    use std::sync::Arc;

    fn host() -> (ConsoleHost, Arc<SimulatedBackend>, mpsc::UnboundedReceiver<SessionEvent>) {
        let backend = Arc::new(SimulatedBackend::new(AdapterState::PoweredOn));
        let (session, events) = SessionHandle::spawn(backend.clone(), SessionConfig::default());
        (ConsoleHost::new(session), backend, events)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("connect".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Connect));
        assert_eq!("  READ ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Read));
        assert_eq!(
            "write hello world".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Write("hello world".to_string()))
        );
        assert_eq!(
            "write   ".parse::<ConsoleCommand>(),
            Err(CommandError::MissingText)
        );
        assert_eq!(
            "dance".parse::<ConsoleCommand>(),
            Err(CommandError::Unknown("dance".to_string()))
        );
        assert_eq!("quit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Quit));
    }

    #[tokio::test]
    async fn test_events_update_view() {
        let (mut host, _backend, _events) = host();
        assert_eq!(host.status_text(), "Not connected");

        let message = host.handle_event(SessionEvent::StateChanged(SessionState::Scanning));
        assert_eq!(message.message, "Status: Scanning...");
        assert_eq!(host.status_text(), "Scanning...");

        let message =
            host.handle_event(SessionEvent::ValueRead(CharacteristicValue::read(b"42".to_vec())));
        assert_eq!(message.severity, MessageSeverity::Success);
        assert_eq!(host.last_read(), Some("42"));

        host.handle_event(SessionEvent::Notification(
            CharacteristicValue::notification(b"tick".to_vec(), 1),
        ));
        assert_eq!(host.last_notification(), Some("tick"));

        let message = host.handle_event(SessionEvent::OperationFailed {
            operation: Operation::Read,
            error: BleError::Operation(OperationError::ReadTimeout),
        });
        assert_eq!(message.to_string(), "[xx] Read failed: read timed out");
    }

    #[tokio::test]
    async fn test_ready_status_names_selected_peripheral() {
        let (mut host, _backend, _events) = host();
        let message = host.handle_event(SessionEvent::StateChanged(SessionState::Ready));
        assert_eq!(message.message, format!("Status: {}", SessionState::Ready));

        host.handle_event(SessionEvent::PeripheralSelected(PeripheralHandle {
            id: PeripheralId(uuid::Uuid::nil()),
            name: "Ble-Demo".to_string(),
            services: vec![SERVICE_UUID],
            rssi: -40,
        }));
        let message = host.handle_event(SessionEvent::StateChanged(SessionState::Ready));
        assert_eq!(message.severity, MessageSeverity::Success);
        assert_eq!(
            message.message,
            format!("Status: {} (Ble-Demo)", SessionState::Ready)
        );
    }

    #[tokio::test]
    async fn test_write_before_connect_reports_disconnected() {
        let (mut host, _backend, mut events) = host();
        assert_eq!(host.handle_line("write hi"), LineOutcome::Continue);

        let event = events.recv().await.unwrap();
        let message = host.handle_event(event);
        assert_eq!(message.severity, MessageSeverity::Error);
        assert_eq!(message.message, "Write failed: peripheral disconnected");
    }

    #[tokio::test]
    async fn test_run_reports_bad_input_and_quits() {
        let (host, backend, events) = host();
        let id = backend.add_peripheral(
            SimulatedPeripheral::with_gatt("Ble-Demo", SERVICE_UUID, CHARACTERISTIC_UUID)
                .auto_advertise(true),
        );

        let mut output = Vec::new();
        host.run(&b"bogus\nquit\n"[..], &mut output, events)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with(&format!("[  ] {}", HELP)));
        assert!(text.contains("unknown command 'bogus'"));
        assert!(!backend.is_connected(&id));
    }
}
