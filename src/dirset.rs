//! The `by-id` / `by-name` twin-directory idiom.
//!
//! Every entity class gets a directory containing `by-id` (one directory
//! per visible entity) and `by-name` (one symlink per visible entity,
//! pointing at its `by-id` directory). Activation order is a contract: an
//! entity directory is always reachable before the symlink naming it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::tree::{Node, Tree};

struct Entry {
    dir: Arc<Node>,
    link: Arc<Node>,
    name: String,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    names: HashMap<String, String>,
    active: bool,
}

pub struct DirSet {
    tree: Arc<Tree>,
    dir: Arc<Node>,
    by_id: Arc<Node>,
    by_name: Arc<Node>,
    state: Mutex<State>,
}

impl DirSet {
    pub fn new(tree: &Arc<Tree>, parent: &Arc<Node>, name: &str) -> DirSet {
        let dir = tree.new_dir(parent, name);
        let by_name = tree.new_dir(&dir, "by-name");
        let by_id = tree.new_dir(&dir, "by-id");
        DirSet {
            tree: Arc::clone(tree),
            dir,
            by_id,
            by_name,
            state: Mutex::default(),
        }
    }

    /// The `by-id` directory entity constructors attach into.
    pub fn container(&self) -> &Arc<Node> {
        &self.by_id
    }

    /// Add one entity: `build` constructs its directory under `by-id`, and
    /// a symlink appears under `by-name`. Fails on a duplicate id or name.
    pub fn add<F>(&self, id: &str, name: &str, build: F) -> Result<(), Error>
    where
        F: FnOnce(&Arc<Node>) -> Result<Arc<Node>, Error>,
    {
        let mut st = self.state.lock().unwrap();
        if st.entries.contains_key(id) {
            return Err(Error::Duplicate(id.to_owned()));
        }
        if st.names.contains_key(name) {
            return Err(Error::Duplicate(name.to_owned()));
        }

        let dir = build(&self.by_id)?;
        let link = self.tree.new_symlink(&self.by_name, name, &dir)?;

        if st.active {
            // The set is already published: the entity directory must be
            // reachable before its symlink is.
            self.tree.activate(&dir)?;
            self.tree.activate(&link)?;
        }

        st.entries.insert(
            id.to_owned(),
            Entry {
                dir,
                link,
                name: name.to_owned(),
            },
        );
        st.names.insert(name.to_owned(), id.to_owned());
        Ok(())
    }

    /// Remove an entity's directory and symlink (a room closing). Inode
    /// numbers of the removed subtree are not reused.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        let entry = st
            .entries
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        st.names.remove(&entry.name);
        // Symlink first so no reader sees a dangling by-name entry.
        self.tree.remove_subtree(&entry.link);
        self.tree.remove_subtree(&entry.dir);
        Ok(())
    }

    pub fn lookup_id(&self, id: &str) -> Option<Arc<Node>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.dir))
    }

    /// Publish the whole set: entity directories, `by-id`, symlinks,
    /// `by-name`, then the set directory itself.
    pub fn activate(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        for entry in st.entries.values() {
            self.tree.activate(&entry.dir)?;
        }
        self.tree.activate(&self.by_id)?;
        for entry in st.entries.values() {
            self.tree.activate(&entry.link)?;
        }
        self.tree.activate(&self.by_name)?;
        self.tree.activate(&self.dir)?;
        st.active = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_dir(tree: &Arc<Tree>) -> impl Fn(&Arc<Node>) -> Result<Arc<Node>, Error> + '_ {
        move |parent| Ok(tree.new_dir(parent, "entity"))
    }

    fn entity_dir<'t>(
        tree: &'t Arc<Tree>,
        id: &'t str,
    ) -> impl FnOnce(&Arc<Node>) -> Result<Arc<Node>, Error> + 't {
        move |parent| Ok(tree.new_dir(parent, id))
    }

    #[test]
    fn nothing_is_visible_before_activation() {
        let tree = Tree::new();
        let root = tree.root();
        let set = DirSet::new(&tree, &root, "channels");
        set.add("C001", "general", entity_dir(&tree, "C001")).unwrap();

        assert!(tree.lookup(&root, "channels").is_none());
        set.activate().unwrap();

        let dir = tree.lookup(&root, "channels").unwrap();
        let by_id = tree.lookup(&dir, "by-id").unwrap();
        let by_name = tree.lookup(&dir, "by-name").unwrap();
        assert!(tree.lookup(&by_id, "C001").is_some());
        assert!(tree.lookup(&by_name, "general").is_some());
    }

    #[test]
    fn by_name_symlinks_resolve_to_the_entity_directory() {
        let tree = Tree::new();
        let root = tree.root();
        let set = DirSet::new(&tree, &root, "channels");
        set.add("C001", "general", entity_dir(&tree, "C001")).unwrap();
        set.activate().unwrap();

        let dir = tree.lookup(&root, "channels").unwrap();
        let by_name = tree.lookup(&dir, "by-name").unwrap();
        let link = tree.lookup(&by_name, "general").unwrap();
        let target = link.as_symlink().unwrap().target.clone();
        assert_eq!(target, "../by-id/C001");

        let resolved = tree.walk(&by_name, &target).unwrap();
        assert_eq!(resolved.ino, set.lookup_id("C001").unwrap().ino);
    }

    #[test]
    fn duplicate_ids_and_names_are_errors() {
        let tree = Tree::new();
        let root = tree.root();
        let set = DirSet::new(&tree, &root, "users");
        set.add("U01", "alice", plain_dir(&tree)).unwrap();

        assert!(matches!(
            set.add("U01", "other", plain_dir(&tree)),
            Err(Error::Duplicate(..))
        ));
        assert!(matches!(
            set.add("U02", "alice", plain_dir(&tree)),
            Err(Error::Duplicate(..))
        ));
    }

    #[test]
    fn remove_then_add_produces_fresh_inodes() {
        let tree = Tree::new();
        let root = tree.root();
        let set = DirSet::new(&tree, &root, "channels");
        set.add("C001", "general", entity_dir(&tree, "C001")).unwrap();
        set.activate().unwrap();

        let old_ino = set.lookup_id("C001").unwrap().ino;
        set.remove("C001").unwrap();

        let dir = tree.lookup(&root, "channels").unwrap();
        let by_id = tree.lookup(&dir, "by-id").unwrap();
        let by_name = tree.lookup(&dir, "by-name").unwrap();
        assert!(tree.lookup(&by_id, "C001").is_none());
        assert!(tree.lookup(&by_name, "general").is_none());
        assert!(matches!(set.remove("C001"), Err(Error::NotFound(..))));

        set.add("C001", "general", entity_dir(&tree, "C001")).unwrap();
        let new = set.lookup_id("C001").unwrap();
        assert!(new.ino > old_ino);
        // the set is active, so the re-added room is published immediately
        assert!(tree.lookup(&by_id, "C001").is_some());
        assert!(tree.lookup(&by_name, "general").is_some());
    }

    #[test]
    fn by_id_and_by_name_list_the_same_entities() {
        let tree = Tree::new();
        let root = tree.root();
        let set = DirSet::new(&tree, &root, "channels");
        for (id, name) in [("C001", "general"), ("C002", "random")] {
            set.add(id, name, entity_dir(&tree, id)).unwrap();
        }
        set.activate().unwrap();

        let dir = tree.lookup(&root, "channels").unwrap();
        let by_id = tree.lookup(&dir, "by-id").unwrap();
        let by_name = tree.lookup(&dir, "by-name").unwrap();

        let mut ids: Vec<_> = tree
            .children(&by_id)
            .iter()
            .map(|node| node.ino)
            .collect();
        let mut resolved: Vec<_> = tree
            .children(&by_name)
            .iter()
            .map(|link| {
                let target = link.as_symlink().unwrap().target.clone();
                tree.walk(&by_name, &target).unwrap().ino
            })
            .collect();
        ids.sort_unstable();
        resolved.sort_unstable();
        assert_eq!(ids, resolved);
    }
}
