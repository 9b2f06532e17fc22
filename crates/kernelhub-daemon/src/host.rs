//! Line-oriented host console.
//!
//! Each stdin line of the `kernelhub` binary is either code for the session
//! kernel or, when it starts with `:`, a host command.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::facts;
use crate::guard::KernelSession;
use crate::router::RoutedEvent;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Execute(String),
    Interrupt,
    Restart,
    Kill,
    Status,
    List,
    Facts,
    Help,
    Unknown(String),
}

impl HostCommand {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Some(command) = trimmed.strip_prefix(':') else {
            return Some(Self::Execute(line.trim_end().to_string()));
        };
        Some(match command.trim() {
            "interrupt" => Self::Interrupt,
            "restart" => Self::Restart,
            "kill" => Self::Kill,
            "status" => Self::Status,
            "list" => Self::List,
            "facts" => Self::Facts,
            "help" => Self::Help,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// One JSON line written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostOutput {
    Event(RoutedEvent),
    Result { command: String, result: Value },
    Error { command: String, message: String },
}

const HELP: &str = ":interrupt :restart :kill :status :list :facts :help";

/// Run `command` against `session`.
pub async fn run_command(
    session: &KernelSession,
    command: HostCommand,
    facts_timeout: Duration,
) -> HostOutput {
    let name = command_name(&command);
    let outcome: Result<Value, String> = match command {
        HostCommand::Execute(code) => session.execute(&code).await.map_err(|e| e.to_string()),
        HostCommand::Interrupt => session
            .interrupt()
            .await
            .map(|()| Value::Null)
            .map_err(|e| e.to_string()),
        HostCommand::Restart => session
            .restart()
            .await
            .map(|id| json!({ "instance_id": id }))
            .map_err(|e| e.to_string()),
        HostCommand::Kill => session
            .kill()
            .await
            .map(|()| Value::Null)
            .map_err(|e| e.to_string()),
        HostCommand::Status => session.get_status().await.map_err(|e| e.to_string()),
        HostCommand::List => serde_json::to_value(session.registry().list().await)
            .map_err(|e| e.to_string()),
        HostCommand::Facts => match facts::system_facts(facts_timeout).await {
            Ok(facts) => serde_json::to_value(facts).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        HostCommand::Help => Ok(Value::String(HELP.to_string())),
        HostCommand::Unknown(other) => Err(format!("unknown command :{other} (try :help)")),
    };

    match outcome {
        Ok(result) => HostOutput::Result {
            command: name.to_string(),
            result,
        },
        Err(message) => HostOutput::Error {
            command: name.to_string(),
            message,
        },
    }
}

/// Read console lines from `input` until it ends, running each command as
/// its own task so `:interrupt` and friends are handled while an execution
/// is still running. Returns once the input is closed and every command has
/// reported to `out`.
pub async fn run_console<R>(
    session: Arc<KernelSession>,
    input: R,
    out: mpsc::Sender<HostOutput>,
    facts_timeout: Duration,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(command) = HostCommand::parse(&line) else {
                        continue;
                    };
                    let session = Arc::clone(&session);
                    let out = out.clone();
                    running.spawn(async move {
                        let output = run_command(&session, command, facts_timeout).await;
                        let _ = out.send(output).await;
                    });
                }
                Ok(None) => {
                    info!("Console input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read console input");
                    break;
                }
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Console command task failed");
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Console command task failed");
        }
    }
}

const fn command_name(command: &HostCommand) -> &'static str {
    match command {
        HostCommand::Execute(_) => "execute",
        HostCommand::Interrupt => "interrupt",
        HostCommand::Restart => "restart",
        HostCommand::Kill => "kill",
        HostCommand::Status => "status",
        HostCommand::List => "list",
        HostCommand::Facts => "facts",
        HostCommand::Help => "help",
        HostCommand::Unknown(_) => "unknown",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::kernel::loopback::LoopbackLauncher;
    use crate::registry::KernelRegistry;
    use kernelhub_core::KernelOptions;
    use kernelhub_core::protocol::{Channel, Method};

    fn session() -> KernelSession {
        let registry = KernelRegistry::new(
            Arc::new(LoopbackLauncher::default()),
            Duration::from_secs(5),
        );
        KernelSession::new(Arc::new(registry), KernelOptions::new("python3"))
    }

    #[test]
    fn parse_lines() {
        assert_eq!(HostCommand::parse("   "), None);
        assert_eq!(
            HostCommand::parse("print(1)\n"),
            Some(HostCommand::Execute("print(1)".to_string()))
        );
        assert_eq!(
            HostCommand::parse("    x = 1"),
            Some(HostCommand::Execute("    x = 1".to_string()))
        );
        assert_eq!(HostCommand::parse(":restart"), Some(HostCommand::Restart));
        assert_eq!(HostCommand::parse(" : status "), Some(HostCommand::Status));
        assert_eq!(
            HostCommand::parse(":bogus"),
            Some(HostCommand::Unknown("bogus".to_string()))
        );
    }

    #[test]
    fn output_is_tagged() {
        let event = HostOutput::Event(RoutedEvent {
            instance_id: "k".to_string(),
            channel: Channel::Iopub,
            payload: json!({ "msg_type": "stream" }),
        });
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["channel"], "iopub");
        assert_eq!(value["instance_id"], "k");
    }

    #[tokio::test]
    async fn execute_and_list() {
        let session = session();
        let out = run_command(
            &session,
            HostCommand::Execute("1".into()),
            Duration::from_secs(5),
        )
        .await;
        let HostOutput::Result { command, result } = out else {
            panic!("expected result, got {out:?}");
        };
        assert_eq!(command, "execute");
        assert_eq!(result["status"], "ok");

        let out = run_command(&session, HostCommand::List, Duration::from_secs(5)).await;
        let HostOutput::Result { result, .. } = out else {
            panic!("expected result");
        };
        assert_eq!(result.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_line() {
        let out = run_command(
            &session(),
            HostCommand::Unknown("x".into()),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(out, HostOutput::Error { ref message, .. } if message.contains(":help")));
    }

    fn shared_session(launcher: LoopbackLauncher) -> Arc<KernelSession> {
        let registry = KernelRegistry::new(Arc::new(launcher), Duration::from_secs(5));
        Arc::new(KernelSession::new(Arc::new(registry), KernelOptions::new("python3")))
    }

    #[tokio::test]
    async fn interrupt_is_handled_while_execute_runs() {
        let session = shared_session(LoopbackLauncher::default().stall(Method::Execute));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let console = tokio::spawn(run_console(
            session,
            &b"while True: pass\n:interrupt\n:status\n"[..],
            out_tx,
            Duration::from_secs(5),
        ));

        let mut commands = Vec::new();
        for _ in 0..2 {
            let out = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let HostOutput::Result { command, .. } = out else {
                panic!("expected result, got {out:?}");
            };
            commands.push(command);
        }
        commands.sort();
        assert_eq!(commands, vec!["interrupt", "status"]);

        // The execution never finishes, so the console is still waiting on it.
        assert!(!console.is_finished());
        console.abort();
    }

    #[tokio::test]
    async fn console_waits_for_commands_at_end_of_input() {
        let session = shared_session(LoopbackLauncher::default());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        run_console(session, &b"1 + 1\n\n"[..], out_tx, Duration::from_secs(5)).await;

        let out = out_rx.recv().await.unwrap();
        assert!(matches!(out, HostOutput::Result { ref command, .. } if command == "execute"));
        assert!(out_rx.recv().await.is_none());
    }
}
