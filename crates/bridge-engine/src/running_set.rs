use std::collections::HashSet;

use tokio::sync::Mutex;

/// Process-wide set of mapping names currently being synced (§4.1, §9's
/// "cyclic references" note — owned by neither the runner nor the
/// dispatcher, injected into both at construction).
#[derive(Default)]
pub struct RunningSet {
    names: Mutex<HashSet<String>>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `name` was not already present (and is now marked
    /// running), `false` if a runner already owns it.
    pub async fn try_start(&self, name: &str) -> bool {
        self.names.lock().await.insert(name.to_string())
    }

    pub async fn finish(&self, name: &str) {
        self.names.lock().await.remove(name);
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.names.lock().await.contains(name)
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.names.lock().await.iter().cloned().collect()
    }
}
