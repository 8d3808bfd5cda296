//! The contract with the external chat-service client.
//!
//! The wire protocol (REST bootstrap, websocket framing, keepalive pings)
//! lives behind these types. The core consumes exactly three things: a
//! bootstrap [`Snapshot`], a pull-style stream of [`Event`]s, and the
//! [`History`]/[`Outbox`] capabilities bundled in a [`Link`].

use std::fs;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// A single message, as it appears both in history responses and in live
/// message events. History messages carry no channel id; live events do.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "ts", default)]
    pub timestamp: String,
}

/// One page of room history.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}

/// Parameters of a history request.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    pub oldest: Option<String>,
    pub latest: Option<String>,
    pub count: u32,
    pub inclusive: bool,
}

/// The per-room history endpoint.
pub trait History: Send + Sync {
    fn fetch(&self, room_id: &str, params: &HistoryParams) -> Result<HistoryPage, Error>;
}

/// The shared outbound send channel.
///
/// `send` allocates the outgoing message id, hands it to `register`, and
/// transmits, all under the outbox's own lock: id allocation and ack
/// registration form one atomic step even under concurrent writers.
pub trait Outbox: Send + Sync {
    fn send(
        &self,
        room_id: &str,
        text: &str,
        register: &mut dyn FnMut(u64),
    ) -> Result<u64, Error>;
}

/// The capabilities a connected workspace holds. Absent in offline mode.
#[derive(Clone)]
pub struct Link {
    pub history: Arc<dyn History>,
    pub outbox: Arc<dyn Outbox>,
}

/// Everything a successful `start` hands back.
pub struct Connected {
    pub snapshot: Snapshot,
    pub events: mpsc::Receiver<Event>,
    pub link: Link,
}

/// A chat-service client able to open a live connection.
pub trait ChatClient {
    fn start(&self, token: &str) -> Result<Connected, Error>;
}

/// Inbound events delivered over the long-lived connection.
#[derive(Debug)]
pub enum Event {
    Hello,
    LatencyReport(Duration),
    PresenceChange { user: String, presence: String },
    ManualPresenceChange { presence: String },
    Message(Message),
    Ack { reply_to: u64, timestamp: String },
    ChannelOpen(String),
    ChannelClose(String),
    GroupOpen(String),
    GroupClose(String),
    ImOpen(String),
    ImClose(String),
    Error(String),
}

/// The bootstrap inventory of the workspace.
///
/// Channels report membership as `is_member`; groups and IMs report
/// `is_open`. Both map onto the uniform "open" notion of a room.
#[derive(Debug, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "self")]
    pub me: SelfInfo,
    pub team: TeamInfo,
    #[serde(default)]
    pub users: Vec<UserInfo>,
    #[serde(default)]
    pub channels: Vec<ChannelInfo>,
    #[serde(default)]
    pub groups: Vec<GroupInfo>,
    #[serde(default)]
    pub ims: Vec<ImInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SelfInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TeamInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub presence: String,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub last_read: String,
    #[serde(default)]
    pub latest: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub last_read: String,
    #[serde(default)]
    pub latest: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct ImInfo {
    pub id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub last_read: String,
    #[serde(default)]
    pub latest: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Snapshot {
    /// Load a bootstrap snapshot from a JSON file (offline mode).
    pub fn load(path: &Path) -> Result<Snapshot, Error> {
        let buf = fs::read(path)
            .map_err(|err| Error::Malformed(format!("{}: {}", path.display(), err)))?;
        serde_json::from_slice(&buf).map_err(|err| Error::Malformed(err.to_string()))
    }
}

/// The timestamp of the latest message, if the snapshot carried one.
pub fn latest_ts(latest: &Option<Message>) -> &str {
    latest.as_ref().map(|m| m.timestamp.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SNAPSHOT: &str = r#"{
        "self": {"id": "U01", "name": "alice"},
        "team": {"id": "T01", "name": "acme"},
        "users": [
            {"id": "U01", "name": "alice", "presence": "active"},
            {"id": "U02", "name": "bot", "is_bot": true}
        ],
        "channels": [
            {"id": "C001", "name": "general", "is_member": true,
             "last_read": "1425012345.000001",
             "latest": {"ts": "1425012345.000005"},
             "unread_count": 3}
        ],
        "groups": [],
        "ims": [{"id": "D01", "user": "U02", "is_open": true}]
    }"#;

    #[test]
    fn parses_bootstrap_snapshot() {
        let snapshot: Snapshot = serde_json::from_str(SNAPSHOT).unwrap();
        assert_eq!(snapshot.me.id, "U01");
        assert_eq!(snapshot.team.name, "acme");
        assert_eq!(snapshot.users.len(), 2);
        assert!(snapshot.users[1].is_bot);

        let general = &snapshot.channels[0];
        assert!(general.is_member);
        assert_eq!(general.unread_count, 3);
        assert_eq!(latest_ts(&general.latest), "1425012345.000005");

        assert_eq!(snapshot.ims[0].user, "U02");
        assert!(snapshot.ims[0].is_open);
    }

    #[test]
    fn load_rejects_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = Snapshot::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Malformed(..)));
    }

    #[test]
    fn load_reads_snapshot_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SNAPSHOT.as_bytes()).unwrap();
        let snapshot = Snapshot::load(file.path()).unwrap();
        assert_eq!(snapshot.channels[0].id, "C001");
    }
}
