//! Entity snapshots: users, the team, and rooms.
//!
//! Entities are created once from the bootstrap snapshot and live for the
//! process lifetime; events mutate their state in place. Ids never change.

use std::sync::{Arc, Mutex};

use crate::client::{TeamInfo, UserInfo};
use crate::session::Session;

pub struct User {
    pub id: String,
    state: Mutex<UserState>,
}

struct UserState {
    name: String,
    presence: String,
    is_bot: bool,
}

impl User {
    pub fn new(info: &UserInfo) -> Arc<User> {
        Arc::new(User {
            id: info.id.clone(),
            state: Mutex::new(UserState {
                name: info.name.clone(),
                presence: info.presence.clone(),
                is_bot: info.is_bot,
            }),
        })
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn presence(&self) -> String {
        self.state.lock().unwrap().presence.clone()
    }

    pub fn is_bot(&self) -> bool {
        self.state.lock().unwrap().is_bot
    }

    pub fn set_presence(&self, presence: &str) {
        self.state.lock().unwrap().presence = presence.to_owned();
    }
}

pub struct Team {
    pub id: String,
    state: Mutex<String>,
}

impl Team {
    pub fn new(info: &TeamInfo) -> Arc<Team> {
        Arc::new(Team {
            id: info.id.clone(),
            state: Mutex::new(info.name.clone()),
        })
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().clone()
    }
}

/// Channels, private groups, and IMs are uniform rooms; the kind only
/// decides which open/close events apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Channel,
    Group,
    Im,
}

pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    state: Mutex<RoomState>,
    pub session: Arc<Session>,
}

struct RoomState {
    name: String,
    open: bool,
}

impl Room {
    pub fn new(
        id: &str,
        kind: RoomKind,
        name: &str,
        open: bool,
        session: Arc<Session>,
    ) -> Arc<Room> {
        Arc::new(Room {
            id: id.to_owned(),
            kind,
            state: Mutex::new(RoomState {
                name: name.to_owned(),
                open,
            }),
            session,
        })
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn set_open(&self, open: bool) {
        self.state.lock().unwrap().open = open;
    }
}
