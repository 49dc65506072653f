use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::watcher::{ChangeEvent, ChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Absent,
    Present {
        len: u64,
        modified: Option<SystemTime>,
    },
}

fn observe(root: &Path, wire: &str) -> Observed {
    match std::fs::symlink_metadata(root.join(wire)) {
        Ok(meta) => Observed::Present {
            len: meta.len(),
            modified: meta.modified().ok(),
        },
        Err(_) => Observed::Absent,
    }
}

fn touched(change: &ChangeEvent) -> impl Iterator<Item = &str> {
    let old = match change.kind {
        ChangeKind::Renamed => change.old_path.as_deref(),
        _ => None,
    };
    old.into_iter().chain(std::iter::once(change.path.as_str()))
}

/// Remembers what applying a server push left on disk, so that the watcher
/// events it causes are not sent straight back.
///
/// An event is an echo when every path it touches still looks exactly as
/// the push left it. Once a path is seen in any other state, it is
/// forgotten and later events about it are forwarded again.
#[derive(Debug, Default)]
pub struct EchoFilter {
    expected: Mutex<HashMap<String, Observed>>,
}

impl EchoFilter {
    fn expected(&self) -> MutexGuard<'_, HashMap<String, Observed>> {
        self.expected.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the state `change` left below `root`, right after applying it.
    pub fn record(&self, root: &Path, change: &ChangeEvent) {
        let mut expected = self.expected();
        for wire in touched(change) {
            expected.insert(wire.to_string(), observe(root, wire));
        }
    }

    pub fn is_echo(&self, root: &Path, change: &ChangeEvent) -> bool {
        let mut expected = self.expected();
        let mut echo = true;
        for wire in touched(change) {
            match expected.get(wire).copied() {
                Some(state) if state == observe(root, wire) => {}
                Some(_) => {
                    expected.remove(wire);
                    echo = false;
                }
                None => echo = false,
            }
        }
        echo
    }
}
