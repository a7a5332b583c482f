//! OpenVPN management interface messages
//!
//! The OpenVPN process connects back to us (`--management-client`) and
//! pushes real-time notifications. Two of them matter here:
//!
//! | Line | Example | Meaning |
//! |------|---------|---------|
//! | `>STATE:` | `>STATE:1522855903,CONNECTED,SUCCESS,10.8.0.2,1.2.3.4` | Process state change |
//! | `>BYTECOUNT:` | `>BYTECOUNT:3200,4600` | Bytes received, bytes sent |
//!
//! Everything else (`>HOLD:`, `>INFO:`, `SUCCESS:` replies) is ignored.

use super::TunnelState;
use crate::stats::SessionStats;
use thiserror::Error;

const STATE_PREFIX: &str = ">STATE:";
const BYTECOUNT_PREFIX: &str = ">BYTECOUNT:";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ManagementError {
    #[error("Unknown process state: {0}")]
    UnknownState(String),
    #[error("Malformed notification: {0}")]
    Malformed(String),
}

/// OpenVPN process states as named on the management interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Connecting,
    Wait,
    Auth,
    GetConfig,
    AssignIp,
    AddRoutes,
    Connected,
    Reconnecting,
    Exiting,
    Resolve,
    TcpConnect,
    AuthPending,
}

impl std::str::FromStr for ProcessState {
    type Err = ManagementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTING" => Ok(ProcessState::Connecting),
            "WAIT" => Ok(ProcessState::Wait),
            "AUTH" => Ok(ProcessState::Auth),
            "GET_CONFIG" => Ok(ProcessState::GetConfig),
            "ASSIGN_IP" => Ok(ProcessState::AssignIp),
            "ADD_ROUTES" => Ok(ProcessState::AddRoutes),
            "CONNECTED" => Ok(ProcessState::Connected),
            "RECONNECTING" => Ok(ProcessState::Reconnecting),
            "EXITING" => Ok(ProcessState::Exiting),
            "RESOLVE" => Ok(ProcessState::Resolve),
            "TCP_CONNECT" => Ok(ProcessState::TcpConnect),
            "AUTH_PENDING" => Ok(ProcessState::AuthPending),
            _ => Err(ManagementError::UnknownState(s.to_string())),
        }
    }
}

impl ProcessState {
    /// Lifecycle event to report for this state, if any
    pub fn tunnel_state(self) -> Option<TunnelState> {
        match self {
            ProcessState::Connecting => Some(TunnelState::Connecting),
            ProcessState::Connected => Some(TunnelState::Connected),
            ProcessState::Reconnecting => Some(TunnelState::Reconnecting),
            ProcessState::Exiting => Some(TunnelState::Exiting),
            _ => None,
        }
    }
}

/// A management notification we act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    State(ProcessState),
    ByteCount(SessionStats),
}

/// Parses one management line; `Ok(None)` for lines we do not handle
pub fn parse_line(line: &str) -> Result<Option<Notification>, ManagementError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix(STATE_PREFIX) {
        // timestamp,STATE,detail,local ip,remote ip,...
        let name = rest
            .split(',')
            .nth(1)
            .ok_or_else(|| ManagementError::Malformed(line.to_string()))?;
        return Ok(Some(Notification::State(name.parse()?)));
    }

    if let Some(rest) = line.strip_prefix(BYTECOUNT_PREFIX) {
        let (received, sent) = rest
            .split_once(',')
            .ok_or_else(|| ManagementError::Malformed(line.to_string()))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| ManagementError::Malformed(line.to_string()))
        };
        return Ok(Some(Notification::ByteCount(SessionStats {
            bytes_received: parse(received)?,
            bytes_sent: parse(sent)?,
        })));
    }

    Ok(None)
}

/// Commands sent once the process has connected to the management socket
pub fn startup_commands(bytecount_interval_secs: u64) -> Vec<String> {
    let mut commands = vec!["state on".to_string()];
    if bytecount_interval_secs > 0 {
        commands.push(format!("bytecount {}", bytecount_interval_secs));
    }
    commands.push("hold release".to_string());
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_lines() {
        assert_eq!(
            parse_line(">STATE:1522855903,CONNECTED,SUCCESS,10.8.0.2,1.2.3.4").unwrap(),
            Some(Notification::State(ProcessState::Connected))
        );
        assert_eq!(
            parse_line(">STATE:1522855903,RECONNECTING,ping-restart,,\r\n").unwrap(),
            Some(Notification::State(ProcessState::Reconnecting))
        );
        assert_eq!(
            parse_line(">STATE:1522855903,EXITING,SIGTERM,,").unwrap(),
            Some(Notification::State(ProcessState::Exiting))
        );
    }

    #[test]
    fn test_parse_bytecount() {
        assert_eq!(
            parse_line(">BYTECOUNT:3200,4600").unwrap(),
            Some(Notification::ByteCount(SessionStats {
                bytes_received: 3200,
                bytes_sent: 4600,
            }))
        );
    }

    #[test]
    fn test_ignored_lines() {
        assert_eq!(parse_line(">HOLD:Waiting for hold release:0").unwrap(), None);
        assert_eq!(parse_line("SUCCESS: real-time state notification set to ON").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line(">STATE:1522855903"),
            Err(ManagementError::Malformed(_))
        ));
        assert!(matches!(
            parse_line(">BYTECOUNT:12"),
            Err(ManagementError::Malformed(_))
        ));
        assert!(matches!(
            parse_line(">BYTECOUNT:a,b"),
            Err(ManagementError::Malformed(_))
        ));
        assert!(matches!(
            parse_line(">STATE:1,SLEEPING,,"),
            Err(ManagementError::UnknownState(s)) if s == "SLEEPING"
        ));
    }

    #[test]
    fn test_only_lifecycle_states_are_reported() {
        assert_eq!(ProcessState::Connecting.tunnel_state(), Some(TunnelState::Connecting));
        assert_eq!(ProcessState::Connected.tunnel_state(), Some(TunnelState::Connected));
        assert_eq!(ProcessState::Reconnecting.tunnel_state(), Some(TunnelState::Reconnecting));
        assert_eq!(ProcessState::Exiting.tunnel_state(), Some(TunnelState::Exiting));
        assert_eq!(ProcessState::Wait.tunnel_state(), None);
        assert_eq!(ProcessState::AddRoutes.tunnel_state(), None);
    }

    #[test]
    fn test_startup_commands() {
        assert_eq!(
            startup_commands(60),
            vec!["state on", "bytecount 60", "hold release"]
        );
        assert_eq!(startup_commands(0), vec!["state on", "hold release"]);
    }
}
