//! The filesystem binding: kernel requests dispatched onto the inode tree.
//!
//! One instance serves all requests; the caller runs the request loop and
//! hands each [`Request`] to [`ChatFs::handle_request`] on its own worker
//! thread, so a read blocking on an uninitialized session stalls nobody
//! else.

use std::ffi::OsStr;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polyfuse::op;
use polyfuse::reply::{AttrOut, EntryOut, FileAttr, OpenOut, ReaddirOut, WriteOut};
use polyfuse::{Operation, Request};
use slab::Slab;

use crate::conn::Conn;
use crate::error::Error;
use crate::tree::{Ino, Node, NodeKind};

/// Validity of session-file attributes: short, so the kernel re-stats while
/// a transcript is being tailed and observes the growing size.
const SESSION_ATTR_TTL: Duration = Duration::from_millis(200);

/// Validity of everything else. Entries can disappear on a room close, so
/// this stays modest.
const ATTR_TTL: Duration = Duration::from_secs(1);

struct DirEntry {
    name: String,
    ino: Ino,
    typ: u32,
    off: u64,
}

struct DirHandle {
    entries: Vec<DirEntry>,
}

pub struct ChatFs {
    conn: Arc<Conn>,
    dir_handles: Mutex<Slab<Arc<DirHandle>>>,
    uid: u32,
    gid: u32,
}

impl ChatFs {
    pub fn new(conn: Arc<Conn>) -> ChatFs {
        ChatFs {
            conn,
            dir_handles: Mutex::default(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    pub fn handle_request(&self, req: &Request) -> anyhow::Result<()> {
        let span = tracing::debug_span!("handle_request", unique = req.unique());
        let _enter = span.enter();

        let op = req.operation()?;
        tracing::debug!(?op);

        match op {
            Operation::Lookup(op) => self.do_lookup(req, op)?,
            Operation::Forget(..) => {
                // Entities outlive kernel references; nothing to reclaim.
            }
            Operation::Getattr(op) => self.do_getattr(req, op)?,
            Operation::Readlink(op) => self.do_readlink(req, op)?,

            Operation::Opendir(op) => self.do_opendir(req, op)?,
            Operation::Readdir(op) => self.do_readdir(req, op)?,
            Operation::Releasedir(op) => self.do_releasedir(req, op)?,

            Operation::Open(op) => self.do_open(req, op)?,
            Operation::Read(op) => self.do_read(req, op)?,
            Operation::Write(op, data) => self.do_write(req, op, data)?,
            Operation::Flush(..) => req.reply(())?,
            Operation::Release(..) => req.reply(())?,

            _ => req.reply_error(libc::ENOSYS)?,
        }

        Ok(())
    }

    fn node(&self, ino: Ino) -> Option<Arc<Node>> {
        self.conn.tree().get(ino)
    }

    /// The reported size. Blocks for session files until their history
    /// backfill has landed.
    fn node_size(&self, node: &Node) -> Result<u64, Error> {
        match &node.kind {
            NodeKind::Dir(..) => Ok(0),
            NodeKind::Symlink(link) => Ok(link.target.len() as u64),
            NodeKind::Attr(attr) => {
                Ok(attr.content().map(|buf| buf.len() as u64).unwrap_or(0))
            }
            NodeKind::SessionFile(file) => file.session.curr_len(),
        }
    }

    fn attr_ttl(node: &Node) -> Duration {
        match node.kind {
            NodeKind::SessionFile(..) => SESSION_ATTR_TTL,
            _ => ATTR_TTL,
        }
    }

    fn fill_attr(&self, node: &Node, size: u64, attr: &mut FileAttr) {
        attr.ino(node.ino);
        attr.mode(node.mode);
        attr.size(size);
        attr.nlink(self.conn.tree().nlink(node));
        attr.uid(self.uid);
        attr.gid(self.gid);
    }

    fn do_lookup(&self, req: &Request, op: op::Lookup<'_>) -> io::Result<()> {
        let parent = match self.node(op.parent()) {
            Some(parent) => parent,
            None => return req.reply_error(libc::ENOENT),
        };
        let name = match op.name().to_str() {
            Some(name) => name,
            None => return req.reply_error(libc::ENOENT),
        };
        let node = match self.conn.tree().lookup(&parent, name) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };
        let size = match self.node_size(&node) {
            Ok(size) => size,
            Err(err) => return req.reply_error(err.errno()),
        };

        let mut out = EntryOut::default();
        out.ino(node.ino);
        self.fill_attr(&node, size, out.attr());
        out.ttl_entry(ATTR_TTL);
        out.ttl_attr(Self::attr_ttl(&node));
        req.reply(out)
    }

    fn do_getattr(&self, req: &Request, op: op::Getattr<'_>) -> io::Result<()> {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };
        let size = match self.node_size(&node) {
            Ok(size) => size,
            Err(err) => return req.reply_error(err.errno()),
        };

        let mut out = AttrOut::default();
        self.fill_attr(&node, size, out.attr());
        out.ttl(Self::attr_ttl(&node));
        req.reply(out)
    }

    fn do_readlink(&self, req: &Request, op: op::Readlink<'_>) -> io::Result<()> {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };
        match node.as_symlink() {
            Some(link) => req.reply(link.target.as_bytes()),
            None => req.reply_error(libc::EINVAL),
        }
    }

    fn do_opendir(&self, req: &Request, op: op::Opendir<'_>) -> io::Result<()> {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };
        if node.as_dir().is_none() {
            return req.reply_error(libc::ENOTDIR);
        }

        let mut entries = Vec::new();
        let mut offset = 1u64;
        entries.push(DirEntry {
            name: ".".to_owned(),
            ino: node.ino,
            typ: libc::DT_DIR as u32,
            off: offset,
        });
        offset += 1;
        entries.push(DirEntry {
            name: "..".to_owned(),
            ino: node.parent.unwrap_or(node.ino),
            typ: libc::DT_DIR as u32,
            off: offset,
        });
        offset += 1;
        for child in self.conn.tree().children(&node) {
            entries.push(DirEntry {
                name: child.name.clone(),
                ino: child.ino,
                typ: dirent_type(&child),
                off: offset,
            });
            offset += 1;
        }

        let key = self
            .dir_handles
            .lock()
            .unwrap()
            .insert(Arc::new(DirHandle { entries }));

        let mut out = OpenOut::default();
        out.fh(key as u64);
        req.reply(out)
    }

    fn do_readdir(&self, req: &Request, op: op::Readdir<'_>) -> io::Result<()> {
        if op.mode() == op::ReaddirMode::Plus {
            return req.reply_error(libc::ENOSYS);
        }

        let handle = match self.dir_handles.lock().unwrap().get(op.fh() as usize) {
            Some(handle) => Arc::clone(handle),
            None => return req.reply_error(libc::EINVAL),
        };

        let mut out = ReaddirOut::new(op.size() as usize);
        for entry in handle.entries.iter().skip(op.offset() as usize) {
            if out.entry(OsStr::new(&entry.name), entry.ino, entry.typ, entry.off) {
                break;
            }
        }
        req.reply(out)
    }

    fn do_releasedir(&self, req: &Request, op: op::Releasedir<'_>) -> io::Result<()> {
        let _ = self.dir_handles.lock().unwrap().try_remove(op.fh() as usize);
        req.reply(())
    }

    fn do_open(&self, req: &Request, op: op::Open<'_>) -> io::Result<()> {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };

        let mut out = OpenOut::default();
        match node.kind {
            NodeKind::Dir(..) => return req.reply_error(libc::EISDIR),
            // Transcripts grow behind the kernel's back; force reads
            // through.
            NodeKind::SessionFile(..) => out.direct_io(true),
            _ => {}
        }
        req.reply(out)
    }

    fn do_read(&self, req: &Request, op: op::Read<'_>) -> io::Result<()> {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };

        match &node.kind {
            NodeKind::Dir(..) => req.reply_error(libc::EISDIR),
            NodeKind::Symlink(..) => req.reply_error(libc::EINVAL),

            NodeKind::Attr(attr) => {
                let content = match attr.content() {
                    Some(content) => content,
                    // write-only
                    None => return req.reply_error(libc::ENOSYS),
                };
                let offset = op.offset() as usize;
                if offset >= content.len() {
                    return req.reply(&[] as &[u8]);
                }
                let data = &content[offset..];
                let data = &data[..data.len().min(op.size() as usize)];
                req.reply(data)
            }

            NodeKind::SessionFile(file) => {
                match file.session.bytes(op.offset(), op.size() as usize) {
                    Ok(data) => req.reply(&data[..]),
                    Err(err) => {
                        tracing::warn!(room = %file.session.room_id(), %err, "session read failed");
                        req.reply_error(err.errno())
                    }
                }
            }
        }
    }

    fn do_write<T>(&self, req: &Request, op: op::Write<'_>, mut data: T) -> io::Result<()>
    where
        T: BufRead + Unpin,
    {
        let node = match self.node(op.ino()) {
            Some(node) => node,
            None => return req.reply_error(libc::ENOENT),
        };
        let sink = match node.as_attr().and_then(|attr| attr.sink()) {
            Some(sink) => sink,
            None => return req.reply_error(libc::EPERM),
        };

        // The offset is ignored: every write is one outbound payload.
        let mut payload = vec![0u8; op.size() as usize];
        data.read_exact(&mut payload)?;

        if let Err(err) = sink.dispatch(&payload) {
            tracing::warn!(%err, "write failed");
            return req.reply_error(err.errno());
        }

        let mut out = WriteOut::default();
        out.size(op.size());
        req.reply(out)
    }
}

fn dirent_type(node: &Node) -> u32 {
    match node.kind {
        NodeKind::Dir(..) => libc::DT_DIR as u32,
        NodeKind::Symlink(..) => libc::DT_LNK as u32,
        NodeKind::Attr(..) | NodeKind::SessionFile(..) => libc::DT_REG as u32,
    }
}
