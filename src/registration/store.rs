use crate::types::Subscription;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use super::RegistrationError;

const FILE_NAME: &str = "subscriptions.json";

/// Subscriptions persisted as one JSON array in `<data_dir>/subscriptions.json`.
pub struct SubscriptionStore {
    subscriptions: HashMap<String, Subscription>,
    data_dir: PathBuf,
}

impl SubscriptionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            subscriptions: HashMap::new(),
            data_dir: data_dir.into(),
        }
    }

    /// Open and load in one step. A missing file is an empty store.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, RegistrationError> {
        let mut store = Self::new(data_dir);
        store.load()?;
        Ok(store)
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(FILE_NAME)
    }

    pub fn load(&mut self) -> Result<(), RegistrationError> {
        let path = self.path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| RegistrationError::io(&path, e))?;
        let items: Vec<Subscription> = serde_json::from_str(&content)
            .map_err(|e| RegistrationError::Corrupt(format!("{}: {e}", path.display())))?;
        self.subscriptions = items.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(())
    }

    /// Write through a temp file so a crash never leaves a torn file behind.
    pub fn save(&self) -> Result<(), RegistrationError> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| RegistrationError::io(&self.data_dir, e))?;
        let content = serde_json::to_string_pretty(&self.list())
            .map_err(|e| RegistrationError::Corrupt(e.to_string()))?;

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| RegistrationError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| RegistrationError::io(&path, e))
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<&Subscription> {
        let mut items: Vec<&Subscription> = self.subscriptions.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn insert(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.id.clone(), subscription);
    }

    pub fn remove(&mut self, id: &str) -> Option<Subscription> {
        self.subscriptions.remove(id)
    }

    /// Secrets the verifier should accept, one per active subscription.
    pub fn active_secrets(&self) -> Vec<Vec<u8>> {
        self.list()
            .into_iter()
            .filter(|s| s.is_active() && !s.secret.is_empty())
            .map(|s| s.secret.as_bytes().to_vec())
            .collect()
    }

    /// Modules with at least one active subscription.
    pub fn active_modules(&self) -> BTreeSet<String> {
        self.subscriptions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.module.to_ascii_lowercase())
            .collect()
    }
}
