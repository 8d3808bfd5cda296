//! The typed inode graph served to the kernel.
//!
//! The graph is assembled bottom-up at startup and is immutable in shape
//! afterwards, except for room open/close which adds or removes one entity
//! subtree. Nodes are created detached and published into their parent by
//! [`Tree::activate`]; consumers never observe a half-built subtree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Error;
use crate::model::{Room, Team, User};
use crate::session::Session;

pub type Ino = u64;

/// The root directory's inode number. The allocator starts here.
pub const ROOT_INO: Ino = 1;

pub struct Node {
    pub ino: Ino,
    pub parent: Option<Ino>,
    pub name: String,
    /// Full `st_mode`, type bits included; they always agree with `kind`.
    pub mode: u32,
    pub kind: NodeKind,
}

pub enum NodeKind {
    Dir(Dir),
    Symlink(Symlink),
    Attr(Attr),
    SessionFile(SessionFile),
}

impl Node {
    pub fn as_dir(&self) -> Option<&Dir> {
        match &self.kind {
            NodeKind::Dir(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn as_symlink(&self) -> Option<&Symlink> {
        match &self.kind {
            NodeKind::Symlink(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_attr(&self) -> Option<&Attr> {
        match &self.kind {
            NodeKind::Attr(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn as_session(&self) -> Option<&SessionFile> {
        match &self.kind {
            NodeKind::SessionFile(file) => Some(file),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Dir {
    state: Mutex<DirState>,
}

#[derive(Default)]
struct DirState {
    /// Insertion order; readdir walks this.
    order: Vec<Ino>,
    index: HashMap<String, Ino>,
}

impl Dir {
    fn insert(&self, name: &str, ino: Ino) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        if st.index.contains_key(name) {
            return Err(Error::Duplicate(name.to_owned()));
        }
        st.index.insert(name.to_owned(), ino);
        st.order.push(ino);
        Ok(())
    }

    fn remove(&self, name: &str) -> Option<Ino> {
        let mut st = self.state.lock().unwrap();
        let ino = st.index.remove(name)?;
        st.order.retain(|&child| child != ino);
        Some(ino)
    }

    pub fn get(&self, name: &str) -> Option<Ino> {
        self.state.lock().unwrap().index.get(name).copied()
    }

    pub fn child_inos(&self) -> Vec<Ino> {
        self.state.lock().unwrap().order.clone()
    }
}

pub struct Symlink {
    /// Relative target path, computed once at creation.
    pub target: String,
}

/// What a read-only attribute file renders its content from.
pub enum AttrSource {
    UserId(Arc<User>),
    UserName(Arc<User>),
    UserPresence(Arc<User>),
    UserIsBot(Arc<User>),
    TeamId(Arc<Team>),
    TeamName(Arc<Team>),
}

impl AttrSource {
    fn render(&self) -> Vec<u8> {
        let mut value = match self {
            AttrSource::UserId(user) => user.id.clone(),
            AttrSource::UserName(user) => user.name(),
            AttrSource::UserPresence(user) => user.presence(),
            AttrSource::UserIsBot(user) => {
                if user.is_bot() { "true" } else { "false" }.to_owned()
            }
            AttrSource::TeamId(team) => team.id.clone(),
            AttrSource::TeamName(team) => team.name(),
        }
        .into_bytes();
        value.push(b'\n');
        value
    }
}

/// Where the payload of a write-only attribute file goes.
pub enum WriteSink {
    /// The room's `write` file: post as a message.
    Message(Arc<Room>),
    /// The room's `write.pre` file: post fenced as preformatted text.
    Fenced(Arc<Room>),
    /// The room's `ctl` file: log and discard.
    Control,
}

impl WriteSink {
    pub fn dispatch(&self, payload: &[u8]) -> Result<(), Error> {
        match self {
            WriteSink::Message(room) => room.session.write(payload),
            WriteSink::Fenced(room) => room.session.write_fenced(payload),
            WriteSink::Control => {
                tracing::info!(payload = %String::from_utf8_lossy(payload).trim(), "ctl");
                Ok(())
            }
        }
    }
}

/// A small file of formatted bytes. Read-only variants publish a rendered
/// buffer that is swapped whole on update, so readers observe the old or
/// the new content, never a torn mix. Write-only variants carry a sink
/// instead.
pub struct Attr {
    content: Option<Mutex<Arc<[u8]>>>,
    source: Option<AttrSource>,
    sink: Option<WriteSink>,
}

impl Attr {
    fn read_only(source: AttrSource) -> Attr {
        let rendered: Arc<[u8]> = source.render().into();
        Attr {
            content: Some(Mutex::new(rendered)),
            source: Some(source),
            sink: None,
        }
    }

    fn write_only(sink: WriteSink) -> Attr {
        Attr {
            content: None,
            source: None,
            sink: Some(sink),
        }
    }

    /// The current published buffer; `None` for write-only files.
    pub fn content(&self) -> Option<Arc<[u8]>> {
        self.content
            .as_ref()
            .map(|content| Arc::clone(&content.lock().unwrap()))
    }

    pub fn sink(&self) -> Option<&WriteSink> {
        self.sink.as_ref()
    }

    /// Re-render from the source and publish the new buffer.
    pub fn update(&self) {
        if let (Some(content), Some(source)) = (&self.content, &self.source) {
            *content.lock().unwrap() = source.render().into();
        }
    }
}

pub struct SessionFile {
    pub session: Arc<Session>,
}

/// The inode table plus the one process-wide inode-number allocator.
pub struct Tree {
    nodes: RwLock<HashMap<Ino, Arc<Node>>>,
    next_ino: AtomicU64,
    root: Arc<Node>,
}

impl Tree {
    pub fn new() -> Arc<Tree> {
        let root = Arc::new(Node {
            ino: ROOT_INO,
            parent: None,
            name: String::new(),
            mode: libc::S_IFDIR | 0o555,
            kind: NodeKind::Dir(Dir::default()),
        });
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Arc::clone(&root));
        Arc::new(Tree {
            nodes: RwLock::new(nodes),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            root,
        })
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    pub fn get(&self, ino: Ino) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(&ino).cloned()
    }

    fn alloc_ino(&self) -> Ino {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    fn register(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.nodes
            .write()
            .unwrap()
            .insert(node.ino, Arc::clone(&node));
        node
    }

    pub fn new_dir(&self, parent: &Arc<Node>, name: &str) -> Arc<Node> {
        self.register(Node {
            ino: self.alloc_ino(),
            parent: Some(parent.ino),
            name: name.to_owned(),
            mode: libc::S_IFDIR | 0o555,
            kind: NodeKind::Dir(Dir::default()),
        })
    }

    pub fn new_symlink(
        &self,
        parent: &Arc<Node>,
        name: &str,
        target: &Arc<Node>,
    ) -> Result<Arc<Node>, Error> {
        let path = self.relative_path(parent.ino, target.ino)?;
        Ok(self.register(Node {
            ino: self.alloc_ino(),
            parent: Some(parent.ino),
            name: name.to_owned(),
            mode: libc::S_IFLNK | 0o777,
            kind: NodeKind::Symlink(Symlink { target: path }),
        }))
    }

    pub fn new_attr(&self, parent: &Arc<Node>, name: &str, source: AttrSource) -> Arc<Node> {
        self.register(Node {
            ino: self.alloc_ino(),
            parent: Some(parent.ino),
            name: name.to_owned(),
            mode: libc::S_IFREG | 0o444,
            kind: NodeKind::Attr(Attr::read_only(source)),
        })
    }

    pub fn new_writer(&self, parent: &Arc<Node>, name: &str, sink: WriteSink) -> Arc<Node> {
        self.register(Node {
            ino: self.alloc_ino(),
            parent: Some(parent.ino),
            name: name.to_owned(),
            mode: libc::S_IFREG | 0o222,
            kind: NodeKind::Attr(Attr::write_only(sink)),
        })
    }

    pub fn new_session_file(
        &self,
        parent: &Arc<Node>,
        name: &str,
        session: Arc<Session>,
    ) -> Arc<Node> {
        self.register(Node {
            ino: self.alloc_ino(),
            parent: Some(parent.ino),
            name: name.to_owned(),
            mode: libc::S_IFREG | 0o444,
            kind: NodeKind::SessionFile(SessionFile { session }),
        })
    }

    /// Publish a detached node into its parent's name index and child list.
    pub fn activate(&self, node: &Arc<Node>) -> Result<(), Error> {
        let parent = match node.parent {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let parent = self
            .get(parent)
            .ok_or_else(|| Error::NotFound(node.name.clone()))?;
        let dir = parent.as_dir().ok_or(Error::NotSupported)?;
        dir.insert(&node.name, node.ino)
    }

    pub fn lookup(&self, dir: &Arc<Node>, name: &str) -> Option<Arc<Node>> {
        let ino = dir.as_dir()?.get(name)?;
        self.get(ino)
    }

    /// Children of a directory, in insertion order.
    pub fn children(&self, dir: &Arc<Node>) -> Vec<Arc<Node>> {
        let inos = match dir.as_dir() {
            Some(dir) => dir.child_inos(),
            None => return Vec::new(),
        };
        inos.into_iter().filter_map(|ino| self.get(ino)).collect()
    }

    /// Hard-link count: 2 + number of subdirectories for a directory, 1
    /// otherwise.
    pub fn nlink(&self, node: &Node) -> u32 {
        match &node.kind {
            NodeKind::Dir(dir) => {
                let subdirs = dir
                    .child_inos()
                    .into_iter()
                    .filter_map(|ino| self.get(ino))
                    .filter(|child| child.as_dir().is_some())
                    .count();
                2 + subdirs as u32
            }
            _ => 1,
        }
    }

    /// The shortest relative path from the directory `from` to `target`,
    /// routed through their lowest common ancestor.
    pub fn relative_path(&self, from: Ino, target: Ino) -> Result<String, Error> {
        if from == target {
            return Ok(".".to_owned());
        }

        // Chain from the target up to the root, with each hop's position.
        let mut chain = Vec::new();
        let mut positions = HashMap::new();
        let mut cursor = target;
        loop {
            let node = self
                .get(cursor)
                .ok_or(Error::NoCommonAncestor(from, target))?;
            positions.insert(cursor, chain.len());
            chain.push(node.name.clone());
            match node.parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        // Walk up from `from` until we hit an ancestor of the target.
        let mut ups = 0;
        let mut cursor = from;
        loop {
            if let Some(&index) = positions.get(&cursor) {
                let mut parts: Vec<&str> = Vec::with_capacity(ups + index);
                parts.resize(ups, "..");
                parts.extend(chain[..index].iter().rev().map(String::as_str));
                if parts.is_empty() {
                    return Ok(".".to_owned());
                }
                return Ok(parts.join("/"));
            }
            let node = self
                .get(cursor)
                .ok_or(Error::NoCommonAncestor(from, target))?;
            match node.parent {
                Some(parent) => {
                    ups += 1;
                    cursor = parent;
                }
                None => return Err(Error::NoCommonAncestor(from, target)),
            }
        }
    }

    /// Resolve a relative path from the directory `from`, the inverse of
    /// [`Tree::relative_path`].
    pub fn walk(&self, from: &Arc<Node>, path: &str) -> Option<Arc<Node>> {
        let mut cursor = Arc::clone(from);
        for part in path.split('/') {
            cursor = match part {
                "" | "." => cursor,
                ".." => self.get(cursor.parent?)?,
                name => self.lookup(&cursor, name)?,
            };
        }
        Some(cursor)
    }

    /// Detach a node from its parent and drop it and everything below it
    /// from the table. The inode numbers are not reused.
    pub fn remove_subtree(&self, node: &Arc<Node>) {
        if let Some(parent) = node.parent.and_then(|ino| self.get(ino)) {
            if let Some(dir) = parent.as_dir() {
                dir.remove(&node.name);
            }
        }
        self.unregister(node);
    }

    fn unregister(&self, node: &Arc<Node>) {
        self.nodes.write().unwrap().remove(&node.ino);
        if let Some(dir) = node.as_dir() {
            for ino in dir.child_inos() {
                if let Some(child) = self.get(ino) {
                    self.unregister(&child);
                }
            }
        }
    }
}
