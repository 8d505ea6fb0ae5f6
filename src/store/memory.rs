use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    DirEntry, FileStore, FsMutation, MutationObserver, NodeKind, StoreEntry, StoreError,
    Subscription, WriteOptions,
};

const ROOT: &str = "/";

#[derive(Debug, Clone)]
struct Node {
    data: Option<Vec<u8>>,
    ctime: DateTime<Utc>,
    mtime: DateTime<Utc>,
}

impl Node {
    fn directory() -> Self {
        let now = Utc::now();
        Self {
            data: None,
            ctime: now,
            mtime: now,
        }
    }

    fn file(content: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            data: Some(content),
            ctime: now,
            mtime: now,
        }
    }

    fn kind(&self) -> NodeKind {
        if self.data.is_some() {
            NodeKind::File
        } else {
            NodeKind::Directory
        }
    }
}

type Observers = Mutex<Vec<(u64, Arc<dyn MutationObserver>)>>;

/// In-memory `FileStore`. Paths map to nodes in a flat ordered map so that
/// a subtree is a contiguous key range.
pub struct MemoryFileStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    observers: Arc<Observers>,
    next_observer: Mutex<u64>,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize to `/a/b` form, rejecting dot segments.
fn normalize(path: &str) -> Result<String, StoreError> {
    let mut out = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn parent_of(path: &str) -> Option<&str> {
    crate::path::parent(path)
}

/// Keys of `dir` and everything below it.
fn subtree(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
    nodes
        .range(dir.to_string()..)
        .take_while(|(k, _)| k.starts_with(dir))
        .filter(|(k, _)| crate::path::is_within(k, dir))
        .map(|(k, _)| k.clone())
        .collect()
}

impl MemoryFileStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Node::directory());
        Self {
            nodes: Mutex::new(nodes),
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer: Mutex::new(0),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        normalize(path)
            .map(|p| self.nodes.lock().contains_key(&p))
            .unwrap_or(false)
    }

    /// Paths and kinds of every entry, root excluded.
    pub fn list_all(&self) -> Vec<(String, NodeKind)> {
        self.nodes
            .lock()
            .iter()
            .filter(|(path, _)| path.as_str() != ROOT)
            .map(|(path, node)| (path.clone(), node.kind()))
            .collect()
    }

    fn notify(&self, events: Vec<FsMutation>) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for event in &events {
            for observer in &observers {
                observer.on_mutation(event);
            }
        }
    }

    /// Create every missing ancestor directory of `path`.
    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<(), StoreError> {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(dir) = current {
            match nodes.get(dir) {
                Some(node) if node.kind() == NodeKind::Directory => break,
                Some(_) => return Err(StoreError::NotADirectory(dir.to_string())),
                None => missing.push(dir.to_string()),
            }
            current = parent_of(dir);
        }
        for dir in missing.into_iter().rev() {
            nodes.insert(dir, Node::directory());
        }
        Ok(())
    }

    /// Remove `path` and its subtree, returning delete events for removed files.
    fn remove_tree(nodes: &mut BTreeMap<String, Node>, path: &str) -> Vec<FsMutation> {
        let mut events = Vec::new();
        for key in subtree(nodes, path) {
            if let Some(node) = nodes.remove(&key) {
                if node.kind() == NodeKind::File {
                    events.push(FsMutation::Delete { path: key });
                }
            }
        }
        events
    }
}

impl FileStore for MemoryFileStore {
    fn write_file(
        &self,
        path: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<(), StoreError> {
        let path = normalize(path)?;
        if path == ROOT {
            return Err(StoreError::IsADirectory(path));
        }
        {
            let mut nodes = self.nodes.lock();
            match nodes.get(&path).map(Node::kind) {
                Some(NodeKind::Directory) => return Err(StoreError::IsADirectory(path)),
                Some(_) if !options.overwrite => return Err(StoreError::FileExists(path)),
                Some(_) => {
                    if let Some(node) = nodes.get_mut(&path) {
                        node.data = Some(content.to_vec());
                        node.mtime = Utc::now();
                    }
                }
                None if !options.create => return Err(StoreError::FileNotFound(path)),
                None => {
                    Self::ensure_parents(&mut nodes, &path)?;
                    nodes.insert(path.clone(), Node::file(content.to_vec()));
                }
            }
        }
        self.notify(vec![FsMutation::Write {
            path,
            content: content.to_vec(),
        }]);
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let path = normalize(path)?;
        let nodes = self.nodes.lock();
        match nodes.get(&path) {
            Some(Node {
                data: Some(data), ..
            }) => Ok(data.clone()),
            Some(_) => Err(StoreError::IsADirectory(path)),
            None => Err(StoreError::FileNotFound(path)),
        }
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        let path = normalize(path)?;
        if path == ROOT {
            return Err(StoreError::InvalidPath(path));
        }
        let events = {
            let mut nodes = self.nodes.lock();
            let node = nodes
                .get(&path)
                .ok_or_else(|| StoreError::FileNotFound(path.clone()))?;
            if node.kind() == NodeKind::Directory
                && !recursive
                && subtree(&nodes, &path).len() > 1
            {
                return Err(StoreError::DirectoryNotEmpty(path));
            }
            Self::remove_tree(&mut nodes, &path)
        };
        self.notify(events);
        Ok(())
    }

    fn create_directory(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize(path)?;
        let mut nodes = self.nodes.lock();
        match nodes.get(&path).map(Node::kind) {
            Some(NodeKind::Directory) => Ok(()),
            Some(NodeKind::File) => Err(StoreError::FileExists(path)),
            None => {
                Self::ensure_parents(&mut nodes, &path)?;
                nodes.insert(path, Node::directory());
                Ok(())
            }
        }
    }

    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let path = normalize(path)?;
        let nodes = self.nodes.lock();
        match nodes.get(&path) {
            Some(node) if node.kind() == NodeKind::Directory => {}
            Some(_) => return Err(StoreError::NotADirectory(path)),
            None => return Err(StoreError::FileNotFound(path)),
        }
        Ok(nodes
            .iter()
            .filter(|(key, _)| parent_of(key) == Some(path.as_str()))
            .filter_map(|(key, node)| {
                key.rsplit('/').next().map(|name| DirEntry {
                    name: name.to_string(),
                    kind: node.kind(),
                })
            })
            .collect())
    }

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), StoreError> {
        let old = normalize(old)?;
        let new = normalize(new)?;
        if old == ROOT || new == ROOT || crate::path::is_within(&new, &old) {
            return Err(StoreError::InvalidPath(format!("{} -> {}", old, new)));
        }
        let events = {
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(&old) {
                return Err(StoreError::FileNotFound(old));
            }
            let mut events = Vec::new();
            if nodes.contains_key(&new) {
                if !overwrite {
                    return Err(StoreError::FileExists(new));
                }
                events.extend(Self::remove_tree(&mut nodes, &new));
            }
            Self::ensure_parents(&mut nodes, &new)?;

            for key in subtree(&nodes, &old) {
                let Some(node) = nodes.remove(&key) else {
                    continue;
                };
                let moved = format!("{}{}", new, &key[old.len()..]);
                if let Some(content) = &node.data {
                    events.push(FsMutation::Rename {
                        old: key,
                        new: moved.clone(),
                        content: content.clone(),
                    });
                }
                nodes.insert(moved, node);
            }
            events
        };
        self.notify(events);
        Ok(())
    }

    fn snapshot(&self) -> Vec<StoreEntry> {
        self.nodes
            .lock()
            .iter()
            .map(|(path, node)| StoreEntry {
                path: path.clone(),
                kind: node.kind(),
                ctime: node.ctime,
                mtime: node.mtime,
                data: node.data.clone(),
            })
            .collect()
    }

    fn hydrate(&self, entries: Vec<StoreEntry>) {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Node::directory());
        for entry in entries {
            let Ok(path) = normalize(&entry.path) else {
                tracing::warn!("skipping cached entry with invalid path {}", entry.path);
                continue;
            };
            let data = match entry.kind {
                NodeKind::File => Some(entry.data.unwrap_or_default()),
                NodeKind::Directory => None,
            };
            if Self::ensure_parents(&mut nodes, &path).is_err() {
                tracing::warn!("skipping cached entry {} below a file", path);
                continue;
            }
            nodes.insert(
                path,
                Node {
                    data,
                    ctime: entry.ctime,
                    mtime: entry.mtime,
                },
            );
        }
        *self.nodes.lock() = nodes;
    }

    fn subscribe(&self, observer: Arc<dyn MutationObserver>) -> Subscription {
        let id = {
            let mut next = self.next_observer.lock();
            *next += 1;
            *next
        };
        self.observers.lock().push((id, observer));

        let observers: Weak<Observers> = Arc::downgrade(&self.observers);
        Subscription::new(move || {
            if let Some(observers) = observers.upgrade() {
                observers.lock().retain(|(other, _)| *other != id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FsMutation>>);

    impl MutationObserver for Recorder {
        fn on_mutation(&self, event: &FsMutation) {
            self.0.lock().push(event.clone());
        }
    }

    fn recorded(store: &MemoryFileStore) -> (Arc<Recorder>, Subscription) {
        let recorder = Arc::new(Recorder::default());
        let subscription = store.subscribe(recorder.clone());
        (recorder, subscription)
    }

    #[test]
    fn write_creates_parents() {
        let store = MemoryFileStore::new();
        store
            .write_file("/books/b/01.md", b"one", WriteOptions::upsert())
            .unwrap();

        assert_eq!(store.read_file("/books/b/01.md").unwrap(), b"one");
        let entries = store.read_directory("/books").unwrap();
        assert_eq!(
            entries,
            vec![DirEntry {
                name: "b".to_string(),
                kind: NodeKind::Directory
            }]
        );
    }

    #[test]
    fn write_respects_options() {
        let store = MemoryFileStore::new();
        let create_only = WriteOptions {
            create: true,
            overwrite: false,
        };
        let overwrite_only = WriteOptions {
            create: false,
            overwrite: true,
        };

        assert_eq!(
            store.write_file("/a.md", b"x", overwrite_only),
            Err(StoreError::FileNotFound("/a.md".to_string()))
        );
        store.write_file("/a.md", b"x", create_only).unwrap();
        assert_eq!(
            store.write_file("/a.md", b"y", create_only),
            Err(StoreError::FileExists("/a.md".to_string()))
        );
        store.write_file("/a.md", b"y", overwrite_only).unwrap();
        assert_eq!(store.read_file("a.md").unwrap(), b"y");
    }

    #[test]
    fn delete_requires_recursive_for_non_empty_dirs() {
        let store = MemoryFileStore::new();
        store
            .write_file("/articles/a.md", b"a", WriteOptions::upsert())
            .unwrap();
        store
            .write_file("/articles/b.md", b"b", WriteOptions::upsert())
            .unwrap();
        let (recorder, _sub) = recorded(&store);

        assert!(matches!(
            store.delete("/articles", false),
            Err(StoreError::DirectoryNotEmpty(_))
        ));
        store.delete("/articles", true).unwrap();

        assert!(!store.exists("/articles"));
        assert_eq!(
            *recorder.0.lock(),
            vec![
                FsMutation::Delete {
                    path: "/articles/a.md".to_string()
                },
                FsMutation::Delete {
                    path: "/articles/b.md".to_string()
                },
            ]
        );
    }

    #[test]
    fn directory_rename_emits_per_file_events() {
        let store = MemoryFileStore::new();
        store
            .write_file("/books/old/01.md", b"one", WriteOptions::upsert())
            .unwrap();
        store
            .write_file("/books/old-notes.md", b"notes", WriteOptions::upsert())
            .unwrap();
        let (recorder, _sub) = recorded(&store);

        store.rename("/books/old", "/books/new", false).unwrap();

        assert_eq!(store.read_file("/books/new/01.md").unwrap(), b"one");
        assert_eq!(store.read_file("/books/old-notes.md").unwrap(), b"notes");
        assert_eq!(
            *recorder.0.lock(),
            vec![FsMutation::Rename {
                old: "/books/old/01.md".to_string(),
                new: "/books/new/01.md".to_string(),
                content: b"one".to_vec(),
            }]
        );
    }

    #[test]
    fn dropped_subscription_stops_events() {
        let store = MemoryFileStore::new();
        let (recorder, sub) = recorded(&store);
        store.write_file("/a", b"1", WriteOptions::upsert()).unwrap();
        drop(sub);
        store.write_file("/b", b"2", WriteOptions::upsert()).unwrap();

        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn hydrate_replaces_tree_silently() {
        let source = MemoryFileStore::new();
        source
            .write_file("/images/a.png", b"png", WriteOptions::upsert())
            .unwrap();
        source.create_directory("/books").unwrap();

        let store = MemoryFileStore::new();
        store
            .write_file("/stale.md", b"old", WriteOptions::upsert())
            .unwrap();
        let (recorder, _sub) = recorded(&store);
        store.hydrate(source.snapshot());

        assert!(!store.exists("/stale.md"));
        assert!(store.exists("/books"));
        assert_eq!(store.read_file("/images/a.png").unwrap(), b"png");
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn rejects_dot_segments() {
        let store = MemoryFileStore::new();
        assert!(matches!(
            store.write_file("/a/../b", b"", WriteOptions::upsert()),
            Err(StoreError::InvalidPath(_))
        ));
    }
}
