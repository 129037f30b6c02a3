//! Directory inode state: the undo journal for tentative namespace changes.

use std::path::Path;
use std::path::PathBuf;

use log::debug;

/// What kind of namespace change a journal entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Link,
    Unlink,
    Rename,
}

/// One tentative namespace change, held until the directory is
/// synchronized. `second_name` is the destination of a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirChange {
    pub kind: ChangeKind,
    pub name: PathBuf,
    pub second_name: Option<PathBuf>,
}

/// Journal of namespace changes applied under one directory but not yet
/// declared durable. The journal is FIFO; `synchronize` commits (clears) it.
pub struct DirNode {
    path: PathBuf,
    undo_journal: Vec<DirChange>,
}

impl DirNode {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DirNode {
            path: path.into(),
            undo_journal: Vec::new(),
        }
    }

    /// The recorded (un-remapped) path of this directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note a rename within this directory that could still be lost with
    /// the directory's metadata.
    pub fn record_rename(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) {
        self.undo_journal.push(DirChange {
            kind: ChangeKind::Rename,
            name: from.into(),
            second_name: Some(to.into()),
        });
    }

    pub fn record_link(&mut self, name: impl Into<PathBuf>) {
        self.undo_journal.push(DirChange {
            kind: ChangeKind::Link,
            name: name.into(),
            second_name: None,
        });
    }

    pub fn record_unlink(&mut self, name: impl Into<PathBuf>) {
        self.undo_journal.push(DirChange {
            kind: ChangeKind::Unlink,
            name: name.into(),
            second_name: None,
        });
    }

    /// The directory was fsynced: every journaled change is now committed.
    pub fn synchronize(&mut self) {
        self.undo_journal.clear();
    }

    /// Simulated power loss. The uncommitted entries are dropped.
    // TODO: replay a prefix of the journal in reverse against the target
    // tree, so unsynchronized renames are actually undone.
    pub fn forget_unpersisted(&mut self) {
        if !self.undo_journal.is_empty() {
            debug!(
                "{:?}: dropping {} uncommitted namespace change(s) on power loss",
                self.path,
                self.undo_journal.len()
            );
        }
        self.undo_journal.clear();
    }

    /// Number of changes that would be at risk in a crash right now.
    pub fn pending_changes(&self) -> usize {
        self.undo_journal.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synchronize_commits_the_journal() {
        let mut dir = DirNode::new("/d");
        dir.record_rename("/d/a", "/d/b");
        dir.record_unlink("/d/c");
        assert_eq!(dir.pending_changes(), 2);

        dir.synchronize();
        assert_eq!(dir.pending_changes(), 0);
    }

    #[test]
    fn power_loss_drops_pending_changes() {
        let mut dir = DirNode::new("/d");
        dir.record_link("/d/new");
        dir.forget_unpersisted();
        assert_eq!(dir.pending_changes(), 0);
    }
}
