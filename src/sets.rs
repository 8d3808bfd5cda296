//! Entity sets: the event handlers owning users and rooms.
//!
//! Each set wraps an id→entity map plus the [`DirSet`] publishing it.
//! Lock order is always set, then entity, then session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::Event;
use crate::conn::EventSink;
use crate::dirset::DirSet;
use crate::error::Error;
use crate::model::{Room, RoomKind, User};
use crate::session::NameResolver;
use crate::tree::{AttrSource, Node, Tree, WriteSink};

pub struct UserSet {
    tree: Arc<Tree>,
    ds: DirSet,
    objs: Mutex<HashMap<String, Arc<User>>>,
    self_id: String,
}

impl UserSet {
    pub fn build(
        tree: &Arc<Tree>,
        root: &Arc<Node>,
        infos: &[crate::client::UserInfo],
        self_id: &str,
    ) -> Result<Arc<UserSet>, Error> {
        let ds = DirSet::new(tree, root, "users");
        let mut objs = HashMap::new();
        for info in infos {
            let user = User::new(info);
            match ds.add(&info.id, &info.name, |parent| user_dir(tree, parent, &user)) {
                Ok(()) => {
                    objs.insert(info.id.clone(), user);
                }
                Err(err) => tracing::warn!(id = %info.id, %err, "skipping user"),
            }
        }
        ds.activate()?;
        Ok(Arc::new(UserSet {
            tree: Arc::clone(tree),
            ds,
            objs: Mutex::new(objs),
            self_id: self_id.to_owned(),
        }))
    }

    pub fn get(&self, id: &str) -> Option<Arc<User>> {
        self.objs.lock().unwrap().get(id).cloned()
    }

    pub fn dir_for(&self, id: &str) -> Option<Arc<Node>> {
        self.ds.lookup_id(id)
    }

    fn apply_presence(&self, user_id: &str, presence: &str) {
        let user = match self.get(user_id) {
            Some(user) => user,
            None => {
                tracing::warn!(user = %user_id, "presence change for unknown user");
                return;
            }
        };
        user.set_presence(presence);

        // Re-publish the rendered attribute so readers see the new value.
        if let Some(dir) = self.ds.lookup_id(user_id) {
            if let Some(node) = self.tree.lookup(&dir, "presence") {
                if let Some(attr) = node.as_attr() {
                    attr.update();
                }
            }
        }
    }
}

impl NameResolver for UserSet {
    fn resolve(&self, user_id: &str) -> Option<String> {
        self.get(user_id).map(|user| user.name())
    }
}

impl EventSink for UserSet {
    fn handle(&self, event: &Event) -> bool {
        match event {
            Event::PresenceChange { user, presence } => {
                self.apply_presence(user, presence);
                true
            }
            // Some servers report the self user only through the manual
            // variant; both mean the same thing here.
            Event::ManualPresenceChange { presence } => {
                let self_id = self.self_id.clone();
                self.apply_presence(&self_id, presence);
                true
            }
            _ => false,
        }
    }
}

fn user_dir(tree: &Arc<Tree>, parent: &Arc<Node>, user: &Arc<User>) -> Result<Arc<Node>, Error> {
    let dir = tree.new_dir(parent, &user.id);
    let attrs = [
        ("id", AttrSource::UserId(Arc::clone(user))),
        ("name", AttrSource::UserName(Arc::clone(user))),
        ("presence", AttrSource::UserPresence(Arc::clone(user))),
        ("is-bot", AttrSource::UserIsBot(Arc::clone(user))),
    ];
    for (name, source) in attrs {
        let node = tree.new_attr(&dir, name, source);
        tree.activate(&node)?;
    }
    Ok(dir)
}

pub struct RoomSet {
    kind: RoomKind,
    tree: Arc<Tree>,
    ds: DirSet,
    objs: Mutex<HashMap<String, Arc<Room>>>,
}

impl RoomSet {
    /// Track every room of the class; publish directories only for open
    /// ones.
    pub fn build(
        tree: &Arc<Tree>,
        root: &Arc<Node>,
        name: &str,
        kind: RoomKind,
        rooms: Vec<Arc<Room>>,
    ) -> Result<Arc<RoomSet>, Error> {
        let ds = DirSet::new(tree, root, name);
        let mut objs = HashMap::new();
        for room in rooms {
            if room.is_open() {
                if let Err(err) =
                    ds.add(&room.id, &room.name(), |parent| room_dir(tree, parent, &room))
                {
                    tracing::warn!(id = %room.id, %err, "skipping room");
                }
            }
            objs.insert(room.id.clone(), room);
        }
        ds.activate()?;
        Ok(Arc::new(RoomSet {
            kind,
            tree: Arc::clone(tree),
            ds,
            objs: Mutex::new(objs),
        }))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.objs.lock().unwrap().get(id).cloned()
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.objs.lock().unwrap().values().cloned().collect()
    }

    pub fn dir_for(&self, id: &str) -> Option<Arc<Node>> {
        self.ds.lookup_id(id)
    }

    fn handle_open(&self, id: &str) {
        let room = match self.get(id) {
            Some(room) => room,
            None => {
                tracing::warn!(id, "open event for unknown room");
                return;
            }
        };
        room.set_open(true);
        if self.ds.lookup_id(id).is_none() {
            if let Err(err) =
                self.ds
                    .add(&room.id, &room.name(), |parent| room_dir(&self.tree, parent, &room))
            {
                tracing::warn!(id, %err, "republishing room failed");
            }
        }
        // First-ever open of a room we never backfilled.
        room.session.spawn_initial_fetch();
    }

    fn handle_close(&self, id: &str) {
        match self.get(id) {
            Some(room) => room.set_open(false),
            None => tracing::warn!(id, "close event for unknown room"),
        }
        if let Err(err) = self.ds.remove(id) {
            tracing::debug!(id, %err, "room was not published");
        }
    }
}

impl EventSink for RoomSet {
    fn handle(&self, event: &Event) -> bool {
        match (self.kind, event) {
            (_, Event::Message(msg)) => match self.get(&msg.channel) {
                Some(room) => {
                    room.session.live_message(msg);
                    true
                }
                None => false,
            },
            // The ack does not say which room the send belonged to; the
            // room that registered the id claims it.
            (_, Event::Ack { reply_to, timestamp }) => self
                .rooms()
                .into_iter()
                .any(|room| room.session.on_ack(*reply_to, timestamp)),

            (RoomKind::Channel, Event::ChannelOpen(id)) => {
                self.handle_open(id);
                true
            }
            (RoomKind::Channel, Event::ChannelClose(id)) => {
                self.handle_close(id);
                true
            }
            (RoomKind::Group, Event::GroupOpen(id)) => {
                self.handle_open(id);
                true
            }
            (RoomKind::Group, Event::GroupClose(id)) => {
                self.handle_close(id);
                true
            }
            (RoomKind::Im, Event::ImOpen(id)) => {
                self.handle_open(id);
                true
            }
            (RoomKind::Im, Event::ImClose(id)) => {
                self.handle_close(id);
                true
            }
            _ => false,
        }
    }
}

fn room_dir(tree: &Arc<Tree>, parent: &Arc<Node>, room: &Arc<Room>) -> Result<Arc<Node>, Error> {
    let dir = tree.new_dir(parent, &room.id);

    let session = tree.new_session_file(&dir, "session", Arc::clone(&room.session));
    tree.activate(&session)?;

    let writers = [
        ("write", WriteSink::Message(Arc::clone(room))),
        ("write.pre", WriteSink::Fenced(Arc::clone(room))),
        ("ctl", WriteSink::Control),
    ];
    for (name, sink) in writers {
        let node = tree.new_writer(&dir, name, sink);
        tree.activate(&node)?;
    }
    Ok(dir)
}
