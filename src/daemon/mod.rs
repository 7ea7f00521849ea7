use std::{collections::HashMap, io::BufRead};

use forkserver::{error::prelude::*, SpecializationRequest};

/// Service side of the daemon
mod service_side;
/// Pool worker side of the daemon
mod worker_side;

pub use service_side::Daemon;

/// What a spawned process runs once specialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnCommand {
    pub request: SpecializationRequest,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Message from the client to the daemon, one JSON document per line.
pub enum ClientMessage {
    /// Spawn a process, through a warm worker when one is available.
    Spawn(SpawnCommand),
    /// Start the supervisor. Its death ends the daemon.
    Supervise(SpawnCommand),
    /// Fork warm workers until this many are pooled.
    FillPool(u32),
    /// Terminate every warm worker.
    EmptyPool,
    Status,
    Stop,
}

impl ClientMessage {
    /// `None` once the client closed its end.
    pub fn wait_for(input: &mut impl BufRead) -> Result<Option<Self>> {
        let mut buf = String::new();
        let n = input
            .read_line(&mut buf)
            .context("Couldn't read message from client")?;
        if n == 0 {
            return Ok(None);
        }
        serde_json::from_str(&buf)
            .map(Some)
            .context("Couldn't deserialize message from client")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Message from the daemon to the client.
pub enum ServerMessage {
    /// pid, whether a warm worker was used
    Spawned(i32, bool),
    SupervisorStarted(i32),
    /// Workers now pooled
    PoolFilled(u32),
    /// Workers terminated
    PoolEmptied(usize),
    Status {
        pooled: u32,
        security_enforced: bool,
    },
    Error(String),
    Stopped,
}

impl ServerMessage {
    pub fn send(&self) -> Result {
        let msg = serde_json::to_string(self).context("Couldn't serialize message")?;
        println!("{}", msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn client_messages_parse_line_by_line() {
        let input = concat!(
            r#"{"FillPool":3}"#,
            "\n",
            r#"{"Spawn":{"request":{"uid":10057,"gid":10057,"nice_name":"com.example"},"program":"/bin/true"}}"#,
            "\n",
            "\"Stop\"\n",
        );
        let mut input = Cursor::new(input);
        assert!(matches!(
            ClientMessage::wait_for(&mut input).unwrap(),
            Some(ClientMessage::FillPool(3))
        ));
        match ClientMessage::wait_for(&mut input).unwrap() {
            Some(ClientMessage::Spawn(cmd)) => {
                assert_eq!(cmd.request.uid, 10057);
                assert_eq!(cmd.request.process_name(), "com.example");
                assert!(cmd.args.is_empty());
            }
            other => panic!("Unexpected message: {other:?}"),
        }
        assert!(matches!(
            ClientMessage::wait_for(&mut input).unwrap(),
            Some(ClientMessage::Stop)
        ));
        assert!(ClientMessage::wait_for(&mut input).unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        let mut input = Cursor::new("{\"Spawn\":\n");
        assert!(ClientMessage::wait_for(&mut input).is_err());
    }
}
