//! The connection: root assembly and the event router.
//!
//! A [`Conn`] owns the inode tree plus the entity sets built from the
//! bootstrap snapshot, and routes inbound events to an ordered list of
//! sinks. The first sink that handles an event terminates dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;

use crate::client::{latest_ts, ChatClient, Connected, Event, ImInfo, Link, Snapshot};
use crate::error::Error;
use crate::model::{Room, RoomKind, Team};
use crate::session::{NameResolver, Session, Stats};
use crate::sets::{RoomSet, UserSet};
use crate::tree::{AttrSource, Tree};

/// An event handler in the router's sink list.
pub trait EventSink: Send + Sync {
    /// Returns true when the event was consumed.
    fn handle(&self, event: &Event) -> bool;
}

pub struct Conn {
    tree: Arc<Tree>,
    pub users: Arc<UserSet>,
    pub channels: Arc<RoomSet>,
    pub groups: Arc<RoomSet>,
    pub ims: Arc<RoomSet>,
    team: Arc<Team>,
    link: Option<Link>,
    stats: Arc<Stats>,
}

impl Conn {
    /// Build the whole tree from a bootstrap snapshot. With a [`Link`] the
    /// open rooms start their history backfills immediately; without one
    /// (offline mode) sessions stay uninitialized.
    pub fn new(snapshot: Snapshot, link: Option<Link>) -> Result<Arc<Conn>, Error> {
        let tree = Tree::new();
        let root = tree.root();
        let stats = Arc::new(Stats::default());

        let users = UserSet::build(&tree, &root, &snapshot.users, &snapshot.me.id)?;
        let resolver: Arc<dyn NameResolver> = users.clone();

        let session = |id: &str, last_read: &str, latest: &str, unread: u32| {
            Session::new(
                id,
                last_read,
                latest,
                unread,
                Arc::clone(&resolver),
                link.clone(),
                Arc::clone(&stats),
            )
        };

        let channels = snapshot
            .channels
            .iter()
            .map(|c| {
                let session = session(&c.id, &c.last_read, latest_ts(&c.latest), c.unread_count);
                Room::new(&c.id, RoomKind::Channel, &c.name, c.is_member, session)
            })
            .collect();
        let channels = RoomSet::build(&tree, &root, "channels", RoomKind::Channel, channels)?;

        let groups = snapshot
            .groups
            .iter()
            .map(|g| {
                let session = session(&g.id, &g.last_read, latest_ts(&g.latest), g.unread_count);
                Room::new(&g.id, RoomKind::Group, &g.name, g.is_open, session)
            })
            .collect();
        let groups = RoomSet::build(&tree, &root, "groups", RoomKind::Group, groups)?;

        let im_name = |im: &ImInfo| {
            resolver
                .resolve(&im.user)
                .unwrap_or_else(|| im.user.clone())
        };
        let ims = snapshot
            .ims
            .iter()
            .map(|im| {
                let session = session(&im.id, &im.last_read, latest_ts(&im.latest), im.unread_count);
                Room::new(&im.id, RoomKind::Im, &im_name(im), im.is_open, session)
            })
            .collect();
        let ims = RoomSet::build(&tree, &root, "ims", RoomKind::Im, ims)?;

        // self/: the team's metadata and a shortcut to our own user dir.
        let team = Team::new(&snapshot.team);
        let self_dir = tree.new_dir(&root, "self");
        let team_dir = tree.new_dir(&self_dir, "team");
        for (name, source) in [
            ("id", AttrSource::TeamId(Arc::clone(&team))),
            ("name", AttrSource::TeamName(Arc::clone(&team))),
        ] {
            let node = tree.new_attr(&team_dir, name, source);
            tree.activate(&node)?;
        }
        tree.activate(&team_dir)?;
        match users.dir_for(&snapshot.me.id) {
            Some(target) => {
                let node = tree.new_symlink(&self_dir, "user", &target)?;
                tree.activate(&node)?;
            }
            None => tracing::warn!(id = %snapshot.me.id, "self user missing from bootstrap"),
        }
        tree.activate(&self_dir)?;

        let conn = Arc::new(Conn {
            tree,
            users,
            channels,
            groups,
            ims,
            team,
            link,
            stats,
        });

        for set in [&conn.channels, &conn.groups, &conn.ims] {
            for room in set.rooms() {
                if room.is_open() {
                    room.session.spawn_initial_fetch();
                }
            }
        }

        Ok(conn)
    }

    /// Inspect a workspace from a saved snapshot, with no connection.
    pub fn offline(path: &Path) -> Result<Arc<Conn>, Error> {
        Conn::new(Snapshot::load(path)?, None)
    }

    /// Connect through a client and start routing its events.
    pub fn start(client: &dyn ChatClient, token: &str) -> Result<Arc<Conn>, Error> {
        let Connected {
            snapshot,
            events,
            link,
        } = client.start(token)?;
        let conn = Conn::new(snapshot, Some(link))?;
        conn.serve(events);
        Ok(conn)
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn is_online(&self) -> bool {
        self.link.is_some()
    }

    /// Spawn the router: one thread pulls events, and each event is handed
    /// to its own worker so a slow handler (a history fetch after an ack)
    /// does not delay presence updates.
    pub fn serve(self: &Arc<Self>, events: mpsc::Receiver<Event>) -> thread::JoinHandle<()> {
        let conn = Arc::clone(self);
        thread::Builder::new()
            .name("event-router".into())
            .spawn(move || {
                for event in events.iter() {
                    let conn = Arc::clone(&conn);
                    let spawned = thread::Builder::new().name("event-worker".into()).spawn(
                        move || match panic::catch_unwind(AssertUnwindSafe(|| {
                            conn.dispatch(&event)
                        })) {
                            Ok(true) => {}
                            Ok(false) => tracing::warn!(?event, "unhandled event"),
                            Err(_) => tracing::error!(?event, "event handler panicked"),
                        },
                    );
                    if let Err(err) = spawned {
                        tracing::error!(%err, "spawning event worker failed");
                    }
                }
                tracing::info!("event stream closed");
            })
            .expect("spawn event router")
    }

    /// Run one event through the sink list.
    pub fn dispatch(&self, event: &Event) -> bool {
        let sinks: [&dyn EventSink; 5] = [
            self,
            self.users.as_ref(),
            self.channels.as_ref(),
            self.groups.as_ref(),
            self.ims.as_ref(),
        ];
        sinks.iter().any(|sink| sink.handle(event))
    }

    /// Release every blocked session reader. Called once the kernel
    /// connection is gone.
    pub fn shutdown(&self) {
        for set in [&self.channels, &self.groups, &self.ims] {
            for room in set.rooms() {
                room.session.interrupt();
            }
        }
    }
}

impl EventSink for Conn {
    fn handle(&self, event: &Event) -> bool {
        match event {
            // TODO: track hello/latency for reconnect detection.
            Event::Hello => {
                tracing::debug!("hello");
                true
            }
            Event::LatencyReport(rtt) => {
                tracing::debug!(?rtt, "latency report");
                true
            }
            Event::Error(message) => {
                tracing::warn!(%message, "service error");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        serde_json::from_str(
            r#"{
                "self": {"id": "U01", "name": "alice"},
                "team": {"id": "T01", "name": "acme"},
                "users": [{"id": "U01", "name": "alice", "presence": "active"}],
                "channels": [{"id": "C001", "name": "general", "is_member": true}],
                "groups": [{"id": "G001", "name": "ops", "is_open": true}],
                "ims": [{"id": "D001", "user": "U01", "is_open": true}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn assembles_the_documented_layout() {
        let conn = Conn::new(snapshot(), None).unwrap();
        let tree = conn.tree();
        let root = tree.root();

        for name in ["users", "channels", "groups", "ims", "self"] {
            assert!(tree.lookup(&root, name).is_some(), "{name}");
        }

        let self_dir = tree.lookup(&root, "self").unwrap();
        let team_dir = tree.lookup(&self_dir, "team").unwrap();
        let id = tree.lookup(&team_dir, "id").unwrap();
        assert_eq!(&id.as_attr().unwrap().content().unwrap()[..], b"T01\n");

        let link = tree.lookup(&self_dir, "user").unwrap();
        let target = link.as_symlink().unwrap().target.clone();
        assert_eq!(target, "../users/by-id/U01");
        assert!(tree.walk(&self_dir, &target).is_some());

        // IM rooms are named after the peer user.
        let ims = tree.lookup(&root, "ims").unwrap();
        let by_name = tree.lookup(&ims, "by-name").unwrap();
        assert!(tree.lookup(&by_name, "alice").is_some());
    }

    #[test]
    fn connection_level_events_are_consumed_first() {
        let conn = Conn::new(snapshot(), None).unwrap();
        assert!(conn.dispatch(&Event::Hello));
        assert!(conn.dispatch(&Event::LatencyReport(std::time::Duration::from_millis(3))));
        assert!(conn.dispatch(&Event::Error("kaboom".into())));
    }

    #[test]
    fn presence_and_room_events_reach_their_sets() {
        let conn = Conn::new(snapshot(), None).unwrap();
        assert!(conn.dispatch(&Event::PresenceChange {
            user: "U01".into(),
            presence: "away".into(),
        }));
        assert_eq!(conn.users.get("U01").unwrap().presence(), "away");

        assert!(conn.dispatch(&Event::GroupClose("G001".into())));
        assert!(conn.groups.dir_for("G001").is_none());
    }

    #[test]
    fn unroutable_events_are_reported_unhandled() {
        let conn = Conn::new(snapshot(), None).unwrap();
        // an ack nobody registered
        assert!(!conn.dispatch(&Event::Ack {
            reply_to: 42,
            timestamp: "1425012345.000001".into(),
        }));
    }

    #[test]
    fn shutdown_interrupts_offline_sessions() {
        let conn = Conn::new(snapshot(), None).unwrap();
        let session = conn.channels.get("C001").unwrap().session.clone();
        let reader = std::thread::spawn(move || session.curr_len());
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.shutdown();
        assert!(matches!(reader.join().unwrap(), Err(Error::Interrupted)));
    }
}
